pub mod assemble;
pub mod encode;
pub mod parse;
pub use assemble::{
    AssemblyError, FEATURE_COUNT, FEATURE_NAMES, FeatureMatrix, FeatureVector, TrainingRow,
    assemble, assemble_all,
};
pub use encode::FeatureEncodingProfile;
pub use parse::DefaultPolicy;
