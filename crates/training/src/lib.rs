pub mod checkpoint;
pub mod config;
pub mod data;
pub mod ema;
pub mod engine;
pub mod histogram;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod mixup;
pub mod model;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use config::{TrainingConfig, TrainingError};
pub use data::{BlockingDataLoader, DataBatch, DataLoader, TensorDataLoader};
pub use engine::{
    evaluate, evaluate_and_render, train_one_epoch, EpochStats, EvaluationReport, NonFinitePolicy,
    TrainStepConfig,
};
pub use histogram::{render_histogram, TopKHistogram};
pub use loss::{Criterion, CrossEntropyLoss, DistillationLoss};
pub use metrics::{MetricLogger, ProcessGroup, SingleProcess, SmoothedValue};
pub use model::{ImageClassifier, MlpClassifier};
pub use optimizer::{OptimizerConfig, OptimizerState, TrainerOptimizer, TrainerOptimizerOptions};
pub use scheduler::{LRScheduler, SchedulerConfig};
pub use trainer::Trainer;
