//! Adapters for the collaborators that live outside this process: the
//! prediction HTTP service and the retraining job.

mod prediction;
mod retrain;

pub use prediction::{HttpPredictionClient, StaticPredictionClient, DEFAULT_PREDICTION_TIMEOUT_MS};
pub use retrain::{ProcessRetrainInvoker, RetrainCommand, RetrainStats};
