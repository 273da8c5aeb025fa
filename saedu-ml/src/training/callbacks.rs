//! Training callbacks: console progress and a non-finite loss guard.

use crate::training::metrics::{LogEntry, TrainerState};

/// Action a callback can request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop(String),
}

/// Hooks invoked by the trainer.
pub trait TrainingCallback: Send {
    /// Called for every log entry (training, evaluation and the final summary).
    fn on_log(&mut self, state: &TrainerState, entry: &LogEntry) -> CallbackAction;

    /// Called after a checkpoint directory is written.
    fn on_save(&mut self, _state: &TrainerState, _checkpoint: &std::path::Path) {}
}

/// Prints log entries to stdout as they arrive.
#[derive(Debug, Default)]
pub struct ConsoleProgress;

impl TrainingCallback for ConsoleProgress {
    fn on_log(&mut self, state: &TrainerState, entry: &LogEntry) -> CallbackAction {
        let progress = format!("[{}/{}]", entry.step, state.max_steps);
        if let Some(loss) = entry.loss {
            println!(
                "{progress} epoch {:.2} | loss {loss:.4} | lr {:.2e} | grad_norm {:.4}",
                entry.epoch,
                entry.learning_rate.unwrap_or(0.0),
                entry.grad_norm.unwrap_or(0.0),
            );
        }
        if let Some(eval_loss) = entry.eval_loss {
            println!("{progress} epoch {:.2} | eval_loss {eval_loss:.4}", entry.epoch);
        }
        if let Some(train_loss) = entry.train_loss {
            println!(
                "Training finished: {} steps, train_loss {train_loss:.4}, {:.1}s",
                entry.step,
                entry.train_runtime.unwrap_or(0.0),
            );
        }
        CallbackAction::Continue
    }

    fn on_save(&mut self, _state: &TrainerState, checkpoint: &std::path::Path) {
        println!("Saved checkpoint {}", checkpoint.display());
    }
}

/// Stops training once the training loss is no longer finite.
///
/// Evaluation losses are ignored. The trainer persists the adapter and state
/// before it returns the error.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonFiniteLossGuard;

impl NonFiniteLossGuard {
    pub fn check(&self, loss: f64) -> CallbackAction {
        if loss.is_finite() {
            CallbackAction::Continue
        } else {
            CallbackAction::Stop(format!("training loss became {loss}"))
        }
    }
}

impl TrainingCallback for NonFiniteLossGuard {
    fn on_log(&mut self, _state: &TrainerState, entry: &LogEntry) -> CallbackAction {
        entry
            .loss
            .map_or(CallbackAction::Continue, |loss| self.check(loss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(loss: Option<f64>, eval_loss: Option<f64>) -> LogEntry {
        LogEntry {
            step: 10,
            loss,
            eval_loss,
            ..LogEntry::default()
        }
    }

    #[test]
    fn test_guard_stops_on_nan_and_inf() {
        let guard = NonFiniteLossGuard;
        assert!(matches!(guard.check(f64::NAN), CallbackAction::Stop(_)));
        assert!(matches!(guard.check(f64::INFINITY), CallbackAction::Stop(_)));
    }

    #[test]
    fn test_guard_lets_large_finite_losses_through() {
        let mut guard = NonFiniteLossGuard::default();
        let state = TrainerState::default();
        for _ in 0..9 {
            assert_eq!(guard.on_log(&state, &log(Some(1.0), None)), CallbackAction::Continue);
        }
        assert_eq!(
            guard.on_log(&state, &log(Some(1_000_000.0), None)),
            CallbackAction::Continue
        );
    }

    #[test]
    fn test_guard_ignores_eval_loss() {
        let mut guard = NonFiniteLossGuard::default();
        assert_eq!(
            guard.on_log(&TrainerState::default(), &log(None, Some(f64::NAN))),
            CallbackAction::Continue
        );
    }

    #[test]
    fn test_entries_without_loss_pass() {
        let mut guard = NonFiniteLossGuard::default();
        let entry = LogEntry {
            step: 1,
            train_runtime: Some(3.0),
            ..LogEntry::default()
        };
        assert_eq!(
            guard.on_log(&TrainerState::default(), &entry),
            CallbackAction::Continue
        );
    }
}
