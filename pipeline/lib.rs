#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod batch;
pub mod config;
#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod types;
pub mod shared {
    pub use super::shared_files as files;
}

#[path = "../features/mod.rs"]
pub mod features;

#[path = "../model/mod.rs"]
pub mod model;

#[path = "../merge/mod.rs"]
pub mod merge;
