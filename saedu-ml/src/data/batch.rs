//! Batching and causal-LM collation.
//!
//! Labels follow the standard language-modelling collator: every position
//! whose token is the pad id is ignored by the loss. Because the pad token is
//! the EOS token, genuine EOS tokens are ignored as well.

use super::split::Split;
use super::tokenize::TokenizedExample;
use crate::error::MlError;
use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// A collated batch ready for the model.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(batch, seq)` u32 token ids.
    pub input_ids: Tensor,
    /// `(batch, seq)` f32, 1 for real tokens and 0 for padding.
    pub attention_mask: Tensor,
    /// `(batch, seq - 1)` u32 next-token targets.
    pub targets: Tensor,
    /// `(batch, seq - 1)` f32, 1 where the target contributes to the loss.
    pub loss_mask: Tensor,
    /// Number of examples in the batch.
    pub size: usize,
}

/// Collate examples of equal length into one batch.
pub fn collate(
    examples: &[&TokenizedExample],
    pad_id: u32,
    device: &Device,
) -> Result<Batch, MlError> {
    let size = examples.len();
    let seq = examples
        .first()
        .map(|e| e.len())
        .ok_or_else(|| MlError::dataset("cannot collate an empty batch"))?;
    if seq < 2 {
        return Err(MlError::dataset(
            "sequences need at least two tokens for next-token prediction",
        ));
    }

    let mut ids = Vec::with_capacity(size * seq);
    let mut mask = Vec::with_capacity(size * seq);
    let mut targets = Vec::with_capacity(size * (seq - 1));
    let mut loss_mask = Vec::with_capacity(size * (seq - 1));

    for example in examples {
        if example.len() != seq {
            return Err(MlError::dataset(format!(
                "ragged batch: expected {seq} tokens, got {}",
                example.len()
            )));
        }
        ids.extend_from_slice(&example.input_ids);
        mask.extend(example.attention_mask.iter().map(|&m| m as f32));
        for &target in &example.input_ids[1..] {
            targets.push(target);
            loss_mask.push(if target == pad_id { 0f32 } else { 1f32 });
        }
    }

    Ok(Batch {
        input_ids: Tensor::from_vec(ids, (size, seq), device)?,
        attention_mask: Tensor::from_vec(mask, (size, seq), device)?,
        targets: Tensor::from_vec(targets, (size, seq - 1), device)?,
        loss_mask: Tensor::from_vec(loss_mask, (size, seq - 1), device)?,
        size,
    })
}

/// Iterates a partition in batches, reshuffling the training split each epoch.
#[derive(Debug)]
pub struct Batcher<'a> {
    examples: &'a [TokenizedExample],
    batch_size: usize,
    split: Split,
    seed: u64,
}

impl<'a> Batcher<'a> {
    pub fn new(examples: &'a [TokenizedExample], batch_size: usize, split: Split, seed: u64) -> Self {
        Self {
            examples,
            batch_size: batch_size.max(1),
            split,
            seed,
        }
    }

    /// Example indices for each batch of `epoch`.
    ///
    /// Training batches are shuffled with `seed + epoch`; validation keeps
    /// dataset order.
    pub fn epoch_indices(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        if self.split == Split::Train {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }

    /// Collate one batch of indices.
    pub fn collate(&self, indices: &[usize], pad_id: u32, device: &Device) -> Result<Batch, MlError> {
        let refs: Vec<&TokenizedExample> = indices.iter().map(|&i| &self.examples[i]).collect();
        collate(&refs, pad_id, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(ids: &[u32], pad: u32) -> TokenizedExample {
        TokenizedExample {
            input_ids: ids.to_vec(),
            attention_mask: ids.iter().map(|&id| u32::from(id != pad)).collect(),
        }
    }

    #[test]
    fn test_collate_masks_pad_targets() {
        let a = example(&[5, 6, 7, 1], 1);
        let batch = collate(&[&a], 1, &Device::Cpu).unwrap();

        assert_eq!(batch.size, 1);
        assert_eq!(batch.input_ids.dims(), &[1, 4]);
        assert_eq!(batch.targets.to_vec2::<u32>().unwrap(), vec![vec![6, 7, 1]]);
        assert_eq!(
            batch.loss_mask.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 1.0, 0.0]]
        );
        assert_eq!(
            batch.attention_mask.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 1.0, 1.0, 0.0]]
        );
    }

    #[test]
    fn test_collate_rejects_ragged() {
        let a = example(&[5, 6, 7], 1);
        let b = example(&[5, 6], 1);
        assert!(collate(&[&a, &b], 1, &Device::Cpu).is_err());
    }

    #[test]
    fn test_batcher_covers_every_example_once() {
        let examples: Vec<_> = (0..10).map(|i| example(&[i, i + 1], 99)).collect();
        let batcher = Batcher::new(&examples, 4, Split::Train, 42);
        assert_eq!(batcher.epoch_indices(0).len(), 3);

        let mut seen: Vec<usize> = batcher.epoch_indices(0).into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_training_order_changes_between_epochs() {
        let examples: Vec<_> = (0..32).map(|i| example(&[i, i + 1], 99)).collect();
        let batcher = Batcher::new(&examples, 32, Split::Train, 7);
        assert_ne!(batcher.epoch_indices(0), batcher.epoch_indices(1));
    }

    #[test]
    fn test_validation_order_is_stable() {
        let examples: Vec<_> = (0..5).map(|i| example(&[i, i + 1], 99)).collect();
        let batcher = Batcher::new(&examples, 2, Split::Validation, 7);
        assert_eq!(
            batcher.epoch_indices(3),
            vec![vec![0, 1], vec![2, 3], vec![4]]
        );
    }
}
