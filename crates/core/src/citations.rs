use crate::models::{Citation, RetrievalResult};
use std::collections::HashMap;

/// Map the evidence surfaced to the model during the loop back to
/// `(filename, page, score)` tuples. Deduplicated by filename and page with
/// the best score kept; hits at or below the floor are never cited.
pub fn resolve_citations(batches: &[Vec<RetrievalResult>], floor: f32) -> Vec<Citation> {
    let mut best: HashMap<(String, u32), f32> = HashMap::new();

    for hit in batches.iter().flatten() {
        if hit.score <= floor {
            continue;
        }
        let key = (hit.passage.filename.clone(), hit.passage.page);
        let entry = best.entry(key).or_insert(hit.score);
        if hit.score > *entry {
            *entry = hit.score;
        }
    }

    let mut citations: Vec<Citation> = best
        .into_iter()
        .map(|((filename, page), score)| Citation {
            filename,
            page,
            score,
        })
        .collect();

    citations.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.filename.cmp(&right.filename))
            .then_with(|| left.page.cmp(&right.page))
    });

    citations
}
