//! Training infrastructure: arguments, schedule, metrics, callbacks,
//! checkpoints and the training loop.

pub mod args;
pub mod callbacks;
pub mod checkpoint;
pub mod metrics;
pub mod runner;
pub mod schedule;

pub use args::{TRAINING_ARGS_FILE, TrainingArguments};
pub use callbacks::{CallbackAction, ConsoleProgress, NonFiniteLossGuard, TrainingCallback};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use metrics::{LogEntry, TRAINER_STATE_FILE, TrainerState};
pub use runner::Trainer;
pub use schedule::LinearSchedule;
