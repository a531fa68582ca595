pub mod evaluate;
pub mod infer;
pub mod regressor;
pub mod train;
pub use infer::{InferenceError, ScoredRow, score_matrix};
pub use regressor::{LinearModel, ModelError, PointEstimator, QuantileEstimator, Regressor};
pub use train::{TrainingError, TrainingOutcome, train_models};
