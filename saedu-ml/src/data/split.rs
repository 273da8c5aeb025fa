//! Seeded train/validation split.

use crate::error::MlError;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Dataset partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
}

/// Disjoint train and validation partitions.
#[derive(Debug, Clone)]
pub struct DatasetSplit<T> {
    pub train: Vec<T>,
    pub validation: Vec<T>,
}

/// Number of validation examples for `n` inputs.
///
/// Rounds up like the usual `test_size` fraction, but always leaves at least
/// one training example, so a single-record dataset yields an empty
/// validation set instead of an empty training set.
pub fn validation_count(n: usize, fraction: f64) -> usize {
    if n <= 1 || fraction <= 0.0 {
        return 0;
    }
    let wanted = (n as f64 * fraction).ceil() as usize;
    wanted.min(n - 1)
}

/// Shuffle `items` with `seed` and split off `fraction` of them for validation.
pub fn train_validation_split<T>(
    mut items: Vec<T>,
    fraction: f64,
    seed: u64,
) -> Result<DatasetSplit<T>, MlError> {
    if items.is_empty() {
        return Err(MlError::dataset("dataset contains no records"));
    }
    if !(0.0..1.0).contains(&fraction) {
        return Err(MlError::invalid_input(format!(
            "validation fraction must be in [0, 1), got {fraction}"
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    items.shuffle(&mut rng);

    let n_val = validation_count(items.len(), fraction);
    let validation = items.split_off(items.len() - n_val);

    tracing::debug!(
        train = items.len(),
        validation = validation.len(),
        seed,
        "dataset split"
    );

    Ok(DatasetSplit {
        train: items,
        validation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_count_rounding() {
        assert_eq!(validation_count(0, 0.1), 0);
        assert_eq!(validation_count(1, 0.1), 0);
        assert_eq!(validation_count(2, 0.1), 1);
        assert_eq!(validation_count(10, 0.1), 1);
        assert_eq!(validation_count(11, 0.1), 2);
        assert_eq!(validation_count(100, 0.1), 10);
        assert_eq!(validation_count(100, 0.0), 0);
    }

    #[test]
    fn test_split_is_seeded() {
        let a = train_validation_split((0..50).collect(), 0.1, 42).unwrap();
        let b = train_validation_split((0..50).collect(), 0.1, 42).unwrap();
        assert_eq!(a.train, b.train);
        assert_eq!(a.validation, b.validation);
    }

    #[test]
    fn test_single_record_keeps_training_example() {
        let split = train_validation_split(vec!["only"], 0.1, 0).unwrap();
        assert_eq!(split.train, vec!["only"]);
        assert!(split.validation.is_empty());
    }

    #[test]
    fn test_empty_dataset_is_error() {
        let err = train_validation_split(Vec::<u8>::new(), 0.1, 0).unwrap_err();
        assert!(matches!(err, MlError::Dataset(_)));
    }
}
