//! Supervised training loop for LoRA adapters.
//!
//! Micro-batches are accumulated into one optimizer step, gradients are
//! clipped by global norm, and AdamW follows a linear warmup/decay schedule.
//! Evaluation, logging and checkpointing run on optimizer-step boundaries.

use crate::data::{Batcher, Split, TokenizedExample};
use crate::error::MlError;
use crate::llm::adapter::{PeftAdapterConfig, restore_adapter, save_adapter};
use crate::model::decoder::{CausalLm, causal_lm_loss};
use crate::training::args::TrainingArguments;
use crate::training::callbacks::{CallbackAction, TrainingCallback};
use crate::training::checkpoint::CheckpointManager;
use crate::training::metrics::{LogEntry, LossTracker, TRAINER_STATE_FILE, TrainerState};
use crate::training::schedule::LinearSchedule;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use saedu_core::persistence::atomic_write_json;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Drives training of the adapters registered in a [`VarMap`].
pub struct Trainer<'a> {
    model: &'a CausalLm,
    varmap: &'a VarMap,
    args: TrainingArguments,
    adapter_config: PeftAdapterConfig,
    pad_id: u32,
    checkpoints: CheckpointManager,
    callbacks: Vec<Box<dyn TrainingCallback>>,
}

impl<'a> Trainer<'a> {
    pub fn new(
        model: &'a CausalLm,
        varmap: &'a VarMap,
        args: TrainingArguments,
        adapter_config: PeftAdapterConfig,
        pad_id: u32,
    ) -> Self {
        let checkpoints = CheckpointManager::new(args.output_dir.clone(), args.save_total_limit);
        Self {
            model,
            varmap,
            args,
            adapter_config,
            pad_id,
            checkpoints,
            callbacks: Vec::new(),
        }
    }

    pub fn with_callback(mut self, callback: Box<dyn TrainingCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    fn emit(&mut self, state: &mut TrainerState, entry: LogEntry) -> Result<(), MlError> {
        info!(
            step = entry.step,
            epoch = entry.epoch,
            loss = entry.loss,
            eval_loss = entry.eval_loss,
            learning_rate = entry.learning_rate,
            "training progress"
        );
        state.push(entry.clone());
        let mut stop = None;
        for callback in &mut self.callbacks {
            if let CallbackAction::Stop(reason) = callback.on_log(state, &entry) {
                stop = Some(reason);
                break;
            }
        }
        match stop {
            Some(reason) => {
                self.persist_on_stop(state)?;
                Err(MlError::training(format!(
                    "stopped at step {}: {reason}; adapter and {TRAINER_STATE_FILE} written to {}",
                    entry.step,
                    self.args.output_dir.display()
                )))
            }
            None => Ok(()),
        }
    }

    /// Write the adapter and trainer state to the output root. The best
    /// checkpoint is restored first when one exists.
    fn persist_on_stop(&self, state: &TrainerState) -> Result<(), MlError> {
        if let Some(best) = &state.best_model_checkpoint {
            let weights = best.join(crate::llm::adapter::ADAPTER_WEIGHTS_FILE);
            restore_adapter(self.varmap, &weights, self.model.device())?;
            warn!(checkpoint = %best.display(), "restored best checkpoint before stopping");
        }
        save_adapter(&self.args.output_dir, self.varmap, &self.adapter_config)?;
        atomic_write_json(&self.args.output_dir.join(TRAINER_STATE_FILE), state)?;
        Ok(())
    }

    /// Mean loss over all non-ignored validation tokens.
    pub fn evaluate(&self, examples: &[TokenizedExample]) -> Result<Option<f64>, MlError> {
        if examples.is_empty() {
            return Ok(None);
        }
        let batcher = Batcher::new(
            examples,
            self.args.per_device_eval_batch_size,
            Split::Validation,
            self.args.seed,
        );
        let (mut nll, mut tokens) = (0f64, 0f64);
        for indices in batcher.epoch_indices(0) {
            let batch = batcher.collate(&indices, self.pad_id, self.model.device())?;
            let logits = self
                .model
                .forward(&batch.input_ids, &batch.attention_mask, false)?;
            let (loss, count) = causal_lm_loss(&logits, &batch.targets, &batch.loss_mask)?;
            nll += f64::from(loss.to_scalar::<f32>()?) * f64::from(count);
            tokens += f64::from(count);
        }
        Ok(Some(if tokens > 0.0 { nll / tokens } else { 0.0 }))
    }

    fn save_checkpoint(&mut self, state: &mut TrainerState, epoch: f64) -> Result<(), MlError> {
        let step = state.global_step;
        let dir = self.checkpoints.checkpoint_dir(step);
        let eval_loss = state.eval_loss_at(step);
        if let Some(metric) = eval_loss {
            state.update_best(metric, dir.clone());
        }

        let keep = state.best_model_checkpoint.clone();
        let varmap = self.varmap;
        let adapter_config = &self.adapter_config;
        let snapshot = state.clone();
        self.checkpoints
            .save(step, epoch, eval_loss, keep.as_deref(), |dir| {
                let weights = save_adapter(dir, varmap, adapter_config)?;
                atomic_write_json(&dir.join(TRAINER_STATE_FILE), &snapshot)?;
                Ok(weights)
            })?;
        for callback in &mut self.callbacks {
            callback.on_save(state, &dir);
        }
        Ok(())
    }

    /// Run the full training loop and return the final state.
    pub fn train(
        &mut self,
        train: &[TokenizedExample],
        validation: &[TokenizedExample],
    ) -> Result<TrainerState, MlError> {
        if train.is_empty() {
            return Err(MlError::dataset("training split is empty"));
        }
        std::fs::create_dir_all(&self.args.output_dir)?;

        let vars: Vec<Var> = self.varmap.all_vars();
        if vars.is_empty() {
            return Err(MlError::training("model has no trainable adapter parameters"));
        }
        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: self.args.learning_rate,
                beta1: self.args.adam_beta1,
                beta2: self.args.adam_beta2,
                eps: self.args.adam_epsilon,
                weight_decay: self.args.weight_decay,
            },
        )?;

        let accum = self.args.gradient_accumulation_steps.max(1);
        let steps_per_epoch = self.args.steps_per_epoch(train.len());
        let max_steps = self.args.max_steps(train.len());
        let schedule = LinearSchedule::new(self.args.learning_rate, self.args.warmup_steps, max_steps);
        let batcher = Batcher::new(
            train,
            self.args.per_device_train_batch_size,
            Split::Train,
            self.args.seed,
        );

        let mut state = TrainerState {
            max_steps,
            num_train_epochs: self.args.num_train_epochs,
            train_batch_size: self.args.per_device_train_batch_size,
            logging_steps: self.args.logging_steps,
            eval_steps: self.args.eval_steps,
            save_steps: self.args.save_steps,
            ..TrainerState::default()
        };
        let mut tracker = LossTracker::default();
        let started = Instant::now();

        info!(
            train = train.len(),
            validation = validation.len(),
            epochs = self.args.num_train_epochs,
            max_steps,
            "starting training"
        );

        for epoch in 0..self.args.num_train_epochs {
            let batches = batcher.epoch_indices(epoch);
            let num_batches = batches.len();
            let mut accumulated: Vec<Option<Tensor>> = vec![None; vars.len()];
            let mut window_loss = 0f64;

            for (i, indices) in batches.iter().enumerate() {
                let window_start = (i / accum) * accum;
                let window_len = accum.min(num_batches - window_start);

                let batch = batcher.collate(indices, self.pad_id, self.model.device())?;
                let logits = self
                    .model
                    .forward(&batch.input_ids, &batch.attention_mask, true)?;
                let (loss, _) = causal_lm_loss(&logits, &batch.targets, &batch.loss_mask)?;
                window_loss += f64::from(loss.to_scalar::<f32>()?) / window_len as f64;

                let grads = loss.affine(1.0 / window_len as f64, 0.0)?.backward()?;
                for (slot, var) in accumulated.iter_mut().zip(&vars) {
                    if let Some(grad) = grads.get(var.as_tensor()) {
                        *slot = Some(match slot.take() {
                            Some(sum) => (sum + grad)?,
                            None => grad.clone(),
                        });
                    }
                }

                let boundary = (i + 1) % accum == 0 || i + 1 == num_batches;
                if !boundary {
                    continue;
                }

                let mut grads = grads;
                let grad_norm = clip_and_collect(
                    &mut grads,
                    &vars,
                    &mut accumulated,
                    self.args.max_grad_norm,
                )?;
                let lr = schedule.lr_at(state.global_step);
                optimizer.set_learning_rate(lr);
                optimizer.step(&grads)?;

                state.global_step += 1;
                tracker.record(window_loss);
                window_loss = 0.0;
                let step = state.global_step;
                let epoch_progress = epoch as f64
                    + ((i / accum) + 1) as f64 / steps_per_epoch.max(1) as f64;
                state.epoch = epoch_progress;
                debug!(step, lr, grad_norm, "optimizer step");

                if step % self.args.logging_steps.max(1) == 0 {
                    let entry = LogEntry {
                        step,
                        epoch: epoch_progress,
                        loss: tracker.take_window(),
                        learning_rate: Some(lr),
                        grad_norm: Some(grad_norm),
                        ..LogEntry::default()
                    };
                    self.emit(&mut state, entry)?;
                }
                if step % self.args.eval_steps.max(1) == 0 {
                    if let Some(eval_loss) = self.evaluate(validation)? {
                        let entry = LogEntry {
                            step,
                            epoch: epoch_progress,
                            eval_loss: Some(eval_loss),
                            ..LogEntry::default()
                        };
                        self.emit(&mut state, entry)?;
                    }
                }
                if step % self.args.save_steps.max(1) == 0 {
                    self.save_checkpoint(&mut state, epoch_progress)?;
                }
            }
        }

        if self.args.load_best_model_at_end {
            if let Some(best) = state.best_model_checkpoint.clone() {
                let weights = best.join(crate::llm::adapter::ADAPTER_WEIGHTS_FILE);
                restore_adapter(self.varmap, &weights, self.model.device())?;
                info!(checkpoint = %best.display(), metric = state.best_metric, "loaded best checkpoint");
            }
        }

        let summary = LogEntry {
            step: state.global_step,
            epoch: state.epoch,
            train_loss: tracker.overall(),
            train_runtime: Some(started.elapsed().as_secs_f64()),
            ..LogEntry::default()
        };
        self.emit(&mut state, summary)?;
        atomic_write_json(&self.args.output_dir.join(TRAINER_STATE_FILE), &state)?;
        Ok(state)
    }
}

/// Move accumulated gradients into `grads`, scaling them so their global L2
/// norm does not exceed `max_norm`. Returns the norm before clipping.
fn clip_and_collect(
    grads: &mut candle_core::backprop::GradStore,
    vars: &[Var],
    accumulated: &mut [Option<Tensor>],
    max_norm: f64,
) -> Result<f64, MlError> {
    let mut sq_sum = 0f64;
    for grad in accumulated.iter().flatten() {
        sq_sum += f64::from(grad.sqr()?.sum_all()?.to_scalar::<f32>()?);
    }
    let norm = sq_sum.sqrt();
    let factor = if max_norm > 0.0 && norm > max_norm {
        max_norm / (norm + 1e-6)
    } else {
        1.0
    };

    for (slot, var) in accumulated.iter_mut().zip(vars) {
        if let Some(grad) = slot.take() {
            let grad = if factor < 1.0 {
                grad.affine(factor, 0.0)?
            } else {
                grad
            };
            grads.insert(var.as_tensor(), grad);
        }
    }
    Ok(norm)
}
