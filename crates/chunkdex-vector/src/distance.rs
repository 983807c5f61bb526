//! Distance functions. Smaller is closer for every metric.

use chunkdex_core::types::Metric;

pub fn distance(metric: Metric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        Metric::Cosine => cosine_distance(a, b),
        Metric::Euclidean => euclidean_distance(a, b),
    }
}

/// `1 - cosine_similarity`, clamped to `[0, 2]`.
///
/// A zero-magnitude operand has similarity 0, so its distance is 1.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut mag_a = 0.0f64;
    let mut mag_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }

    if mag_a == 0.0 || mag_b == 0.0 {
        return 1.0;
    }

    let similarity = dot / (mag_a.sqrt() * mag_b.sqrt());
    (1.0 - similarity).clamp(0.0, 2.0) as f32
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = *x as f64 - *y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt() as f32
}
