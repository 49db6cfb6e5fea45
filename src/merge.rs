//! Combining results from several runs over the same documents.
//!
//! A typical use is running a classifier and an extractor over one corpus and
//! folding both answers into a single record per document.

use std::collections::HashMap;

use crate::api::DocumentResult;

/// Merges result sets by `external_id`.
///
/// Results sharing an identifier collapse into one: their classifications and
/// extractions are concatenated in the order the inputs are visited, and the
/// scalar fields (`text`, `is_error`, `error_detail`) of the first one seen
/// are kept. Results without an identifier are never merged with anything.
///
/// Callers should not rely on the output order; sort by `external_id` if a
/// stable order is needed.
pub fn merge_results<S, I>(result_sets: S) -> Vec<DocumentResult>
where
    S: IntoIterator<Item = I>,
    I: IntoIterator<Item = DocumentResult>,
{
    let mut merged: Vec<DocumentResult> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();

    for result in result_sets.into_iter().flatten() {
        let Some(id) = result.external_id.as_deref() else {
            merged.push(result);
            continue;
        };

        match by_id.get(id) {
            Some(&index) => absorb(&mut merged[index], result),
            None => {
                by_id.insert(id.to_string(), merged.len());
                merged.push(result);
            }
        }
    }

    merged
}

fn absorb(into: &mut DocumentResult, other: DocumentResult) {
    into.classifications.extend(other.classifications);
    into.extractions.extend(other.extractions);
}
