use std::collections::BTreeMap;

use crate::DetectionResult;

/// Mapping from detected symbol class to its occurrence count in one run.
///
/// A BTreeMap keeps the serialized form deterministic, which matters because
/// the tally is transmitted verbatim as the quote request payload.
pub type ClassTally = BTreeMap<String, u64>;

/// Count how many times each symbol class appears across every output of a
/// detection run.
///
/// Pure and idempotent: missing substructure reads as empty, predictions
/// without a class label are skipped, and labels are matched by exact
/// case-sensitive equality.
pub fn count_symbol_classes(result: &DetectionResult) -> ClassTally {
    let mut counts = ClassTally::new();

    for output in &result.outputs {
        let predictions = output
            .predictions
            .as_ref()
            .map(|set| set.predictions.as_slice())
            .unwrap_or(&[]);

        for prediction in predictions {
            match prediction.class.as_deref() {
                Some(class) if !class.is_empty() => {
                    *counts.entry(class.to_string()).or_insert(0) += 1;
                }
                _ => {}
            }
        }
    }

    counts
}
