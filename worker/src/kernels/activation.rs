/// Fused post-activation math shared by the linear and MoE paths.

#[inline]
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Tanh-form GELU.
#[inline]
pub fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
}

/// SwiGLU over one row: `out[j] = silu(x[j]) * x[j + mid]` for the first
/// half of `x`. `out` has half the width of `x`.
pub fn swiglu_row(x: &[f32], out: &mut [f32]) {
    let mid = x.len() / 2;
    debug_assert_eq!(out.len(), mid);
    for j in 0..mid {
        out[j] = silu(x[j]) * x[j + mid];
    }
}
