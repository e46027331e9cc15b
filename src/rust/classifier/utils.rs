use std::cmp::Ordering;

/// Tolerance used when deciding whether a model output is already a
/// probability distribution.
pub(crate) const DISTRIBUTION_TOLERANCE: f32 = 1e-3;

pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|x| x / sum).collect()
}

pub(crate) fn is_distribution(values: &[f32]) -> bool {
    let sum: f32 = values.iter().sum();
    values.iter().all(|&p| (0.0..=1.0).contains(&p)) && (sum - 1.0).abs() <= DISTRIBUTION_TOLERANCE
}

/// Indices of the `k` largest values, descending. Equal values keep their
/// original index order.
pub(crate) fn rank_top_k(values: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    // sort_by is stable, so ties stay in index order
    order.sort_by(|&a, &b| values[b].partial_cmp(&values[a]).unwrap_or(Ordering::Equal));
    order.truncate(k);
    order
}

pub(crate) fn round4(value: f32) -> f64 {
    (f64::from(value) * 10_000.0).round() / 10_000.0
}
