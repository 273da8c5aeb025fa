//! Training metrics and the persisted trainer state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

/// One entry of the log history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_norm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_runtime: Option<f64>,
}

/// Progress of a training run, written as `trainer_state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: f64,
    pub max_steps: usize,
    pub num_train_epochs: usize,
    pub train_batch_size: usize,
    pub logging_steps: usize,
    pub eval_steps: usize,
    pub save_steps: usize,
    /// Lowest evaluation loss seen at a checkpoint.
    pub best_metric: Option<f64>,
    pub best_model_checkpoint: Option<PathBuf>,
    pub log_history: Vec<LogEntry>,
}

impl TrainerState {
    pub fn push(&mut self, entry: LogEntry) {
        self.log_history.push(entry);
    }

    /// Evaluation loss recorded at `step`, if an evaluation ran there.
    pub fn eval_loss_at(&self, step: usize) -> Option<f64> {
        self.log_history
            .iter()
            .rev()
            .find(|e| e.step == step && e.eval_loss.is_some())
            .and_then(|e| e.eval_loss)
    }

    /// Record `checkpoint` as best if `metric` improves on the best so far.
    pub fn update_best(&mut self, metric: f64, checkpoint: PathBuf) -> bool {
        let improved = self.best_metric.is_none_or(|best| metric < best);
        if improved {
            self.best_metric = Some(metric);
            self.best_model_checkpoint = Some(checkpoint);
        }
        improved
    }

    pub fn eval_history(&self) -> Vec<f64> {
        self.log_history.iter().filter_map(|e| e.eval_loss).collect()
    }
}

/// Running mean of training loss between log lines.
#[derive(Debug, Clone, Default)]
pub struct LossTracker {
    window_sum: f64,
    window_steps: usize,
    total_sum: f64,
    total_steps: usize,
}

impl LossTracker {
    pub fn record(&mut self, loss: f64) {
        self.window_sum += loss;
        self.window_steps += 1;
        self.total_sum += loss;
        self.total_steps += 1;
    }

    /// Mean since the previous call, resetting the window.
    pub fn take_window(&mut self) -> Option<f64> {
        if self.window_steps == 0 {
            return None;
        }
        let mean = self.window_sum / self.window_steps as f64;
        self.window_sum = 0.0;
        self.window_steps = 0;
        Some(mean)
    }

    pub fn overall(&self) -> Option<f64> {
        (self.total_steps > 0).then(|| self.total_sum / self.total_steps as f64)
    }
}
