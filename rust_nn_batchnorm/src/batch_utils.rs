//! Shared column-wise helpers for row-major f32 batches.

/// Verify every row of `x` has exactly `width` entries; returns the batch size.
pub fn check_width(
    x: &[Vec<f32>],
    width: usize,
    what: &str,
) -> Result<usize, Box<dyn std::error::Error>> {
    for row in x {
        if row.len() != width {
            return Err(format!(
                "shape mismatch: {} row has width {}, expected {}",
                what,
                row.len(),
                width
            )
            .into());
        }
    }
    Ok(x.len())
}

/// Column means. x: [n][width], returns [width]. Requires a non-empty batch.
pub fn column_mean(x: &[Vec<f32>], width: usize) -> Vec<f32> {
    let mut mean = vec![0.0; width];
    for row in x {
        for (m, v) in mean.iter_mut().zip(row) {
            *m += v;
        }
    }
    let n = x.len() as f32;
    for m in &mut mean {
        *m /= n;
    }
    mean
}

/// Column population variance around `mean`.
pub fn column_var(x: &[Vec<f32>], mean: &[f32]) -> Vec<f32> {
    let mut var = vec![0.0; mean.len()];
    for row in x {
        for (j, v) in row.iter().enumerate() {
            let d = v - mean[j];
            var[j] += d * d;
        }
    }
    let n = x.len() as f32;
    for v in &mut var {
        *v /= n;
    }
    var
}

/// Column sums. x: [n][width], returns [width].
pub fn column_sum(x: &[Vec<f32>], width: usize) -> Vec<f32> {
    let mut sum = vec![0.0; width];
    for row in x {
        for (s, v) in sum.iter_mut().zip(row) {
            *s += v;
        }
    }
    sum
}
