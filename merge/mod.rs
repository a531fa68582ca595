pub mod coverage;
pub mod resolve;
pub use coverage::{CoverageError, CoverageReport, guarantee_coverage};
pub use resolve::{ResolutionPolicy, resolve};
