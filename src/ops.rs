//! Core tensor operations. All matrices are row-major `f32` slices.

use rayon::prelude::*;

/// Layer norm epsilon, added to the variance before the square root.
pub const NORM_EPS: f32 = 1e-5;

/// Normalize `src` to zero mean and unit variance.
#[inline]
pub fn layer_norm(dest: &mut [f32], src: &[f32]) {
    let n = src.len() as f32;
    let mean = src.iter().sum::<f32>() / n;
    let var = src.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let inv = 1.0 / (var + NORM_EPS).sqrt();
    for (d, s) in dest.iter_mut().zip(src.iter()) {
        *d = (s - mean) * inv;
    }
}

/// Row-wise layer norm over an `rows x dim` matrix.
pub fn layer_norm_rows(dest: &mut [f32], src: &[f32], dim: usize) {
    dest.par_chunks_mut(dim)
        .zip(src.par_chunks(dim))
        .for_each(|(d, s)| layer_norm(d, s));
}

/// Dot product.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Matrix multiplication: xout = x @ w, where x is `rows x in_dim` and w is
/// `in_dim x out_dim`. Rows are computed in parallel.
pub fn matmul(xout: &mut [f32], x: &[f32], w: &[f32], in_dim: usize, out_dim: usize) {
    debug_assert_eq!(w.len(), in_dim * out_dim);
    xout.par_chunks_mut(out_dim)
        .zip(x.par_chunks(in_dim))
        .for_each(|(out, row)| {
            out.fill(0.0);
            for (xi, w_row) in row.iter().zip(w.chunks_exact(out_dim)) {
                for (o, wj) in out.iter_mut().zip(w_row.iter()) {
                    *o += xi * wj;
                }
            }
        });
}

/// Scores of `x` against every row of `rows`: xout[i] = x . rows[i].
pub fn matvec_rows(xout: &mut [f32], x: &[f32], rows: &[f32]) {
    let dim = x.len();
    xout.par_iter_mut()
        .zip(rows.par_chunks(dim))
        .for_each(|(o, row)| *o = dot(x, row));
}

/// Element-wise accumulation: a += b.
#[inline]
pub fn accum(a: &mut [f32], b: &[f32]) {
    for (ai, bi) in a.iter_mut().zip(b.iter()) {
        *ai += *bi;
    }
}

/// Softmax in-place, stable against large inputs.
#[inline]
pub fn softmax(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let max_val = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for xi in x.iter_mut() {
        *xi = (*xi - max_val).exp();
        sum += *xi;
    }
    for xi in x.iter_mut() {
        *xi /= sum;
    }
}

/// GELU, tanh approximation.
#[inline]
pub fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
}

/// GELU in-place.
#[inline]
pub fn gelu_inplace(x: &mut [f32]) {
    x.par_iter_mut().for_each(|v| *v = gelu(*v));
}

/// Add the sinusoidal encoding for position `pos` to one hidden row.
#[inline]
pub fn add_sinusoidal(x: &mut [f32], pos: usize) {
    let dim = x.len() as f32;
    let mut i = 0;
    while i + 1 < x.len() {
        let freq = 1.0 / 10000.0f32.powf(i as f32 / dim);
        let (s, c) = (pos as f32 * freq).sin_cos();
        x[i] += s;
        x[i + 1] += c;
        i += 2;
    }
}

/// Returns the index of the maximum element.
#[inline]
pub fn argmax(x: &[f32]) -> usize {
    let mut max_idx = 0;
    let mut max_val = f32::NEG_INFINITY;
    for (i, &v) in x.iter().enumerate() {
        if v > max_val {
            max_val = v;
            max_idx = i;
        }
    }
    max_idx
}
