//! Property-based tests for the dataset pipeline.

use proptest::prelude::*;
use saedu_ml::data::record::{INSTRUCTION_MARKER, RESPONSE_MARKER};
use saedu_ml::data::split::validation_count;
use saedu_ml::data::{InstructionRecord, RecordPolicy, format_instruction, train_validation_split};
use std::collections::BTreeSet;

// --- Prompt formatting ---

proptest! {
    #[test]
    fn formatted_text_starts_with_instruction_marker(
        instruction in "[^#]{0,40}",
        response in "[^#]{0,40}",
    ) {
        let text = format_instruction(&instruction, &response);
        prop_assert!(text.starts_with(INSTRUCTION_MARKER));
        prop_assert_eq!(text.matches(RESPONSE_MARKER).count(), 1);
        prop_assert!(text.ends_with(&response));
    }

    #[test]
    fn missing_fields_never_fail_in_lenient_mode(
        instruction in proptest::option::of("[a-z ]{0,20}"),
        response in proptest::option::of("[a-z ]{0,20}"),
    ) {
        let mut object = serde_json::Map::new();
        if let Some(i) = &instruction {
            object.insert("instruction".into(), i.clone().into());
        }
        if let Some(r) = &response {
            object.insert("response".into(), r.clone().into());
        }
        let record = InstructionRecord::from_json(&object.into(), 1, RecordPolicy::Lenient).unwrap();
        prop_assert_eq!(record.instruction, instruction.unwrap_or_default());
        prop_assert_eq!(record.response, response.unwrap_or_default());
    }
}

// --- Train/validation split ---

proptest! {
    #[test]
    fn split_is_a_disjoint_cover(n in 1usize..400, seed in any::<u64>()) {
        let split = train_validation_split((0..n).collect::<Vec<_>>(), 0.1, seed).unwrap();
        let train: BTreeSet<_> = split.train.iter().copied().collect();
        let validation: BTreeSet<_> = split.validation.iter().copied().collect();

        prop_assert!(train.is_disjoint(&validation));
        prop_assert_eq!(train.len() + validation.len(), n);
        prop_assert!(!train.is_empty());
    }

    #[test]
    fn split_sizes_are_nine_to_one(n in 2usize..2000) {
        let validation = validation_count(n, 0.1);
        let exact = n as f64 / 10.0;
        prop_assert!((validation as f64 - exact).abs() <= 1.0);
        prop_assert!(validation < n);
    }

    #[test]
    fn split_is_reproducible(n in 1usize..100, seed in any::<u64>()) {
        let a = train_validation_split((0..n).collect::<Vec<_>>(), 0.1, seed).unwrap();
        let b = train_validation_split((0..n).collect::<Vec<_>>(), 0.1, seed).unwrap();
        prop_assert_eq!(a.train, b.train);
        prop_assert_eq!(a.validation, b.validation);
    }
}
