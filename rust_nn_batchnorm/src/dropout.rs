//! Inverted dropout: masked units are zeroed, survivors scaled by
//! 1/(1-rate) so activations keep their expected value.

use rand::Rng;

use crate::layer::Batch;

/// Sample a dropout mask for a `rows x cols` batch.
/// Returns `None` when the rate is zero or below (dropout disabled).
pub fn dropout_mask(rows: usize, cols: usize, rate: f32) -> Option<Batch> {
    if rate <= 0.0 {
        return None;
    }
    let keep = 1.0 - rate;
    let mut rng = rand::thread_rng();
    let mask = (0..rows)
        .map(|_| {
            (0..cols)
                .map(|_| {
                    if rng.gen_range(0.0f32..1.0) < rate {
                        0.0
                    } else {
                        1.0 / keep
                    }
                })
                .collect()
        })
        .collect();
    Some(mask)
}

/// Element-wise product with a previously sampled mask. Used both to apply
/// the mask on the way forward and to undo it on the way back.
pub fn apply_mask(x: &[Vec<f32>], mask: &[Vec<f32>]) -> Batch {
    x.iter()
        .zip(mask)
        .map(|(row, mrow)| row.iter().zip(mrow).map(|(v, m)| v * m).collect())
        .collect()
}
