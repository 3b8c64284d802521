/// Grid shape of a low-bit quantization config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantKind {
    /// `(q - zero) * scale`, for activations and INT8 weights.
    Asymmetric,
    /// `min + q * scale`, for the INT4 weight families.
    NoZero,
}

/// Descriptor of a quantization grid: (min, max, bits, kind) with the
/// derived scale and zero point.
#[derive(Debug, Clone, Copy)]
pub struct LowBitConfig {
    pub min: f32,
    pub max: f32,
    pub bits: u8,
    pub kind: QuantKind,
    pub scale: f32,
    pub zero: u8,
}

impl LowBitConfig {
    pub fn new(min: f32, max: f32, bits: u8, kind: QuantKind) -> Self {
        let levels = ((1u32 << bits) - 1) as f32;
        match kind {
            QuantKind::Asymmetric => {
                // Widen to include zero so the grid is exact at 0.
                let min = min.min(0.0);
                let max = max.max(0.0);
                let scale = if max > min { (max - min) / levels } else { 1.0 };
                let zero = (-min / scale).round().clamp(0.0, levels) as u8;
                Self {
                    min,
                    max,
                    bits,
                    kind,
                    scale,
                    zero,
                }
            }
            QuantKind::NoZero => {
                let scale = if max > min { (max - min) / levels } else { 1.0 };
                Self {
                    min,
                    max,
                    bits,
                    kind,
                    scale,
                    zero: 0,
                }
            }
        }
    }

    /// Rebuild a no-zero config from its stored (min, scale) pair, as the
    /// registration payload carries it.
    pub fn from_min_scale(min: f32, scale: f32, bits: u8) -> Self {
        let levels = ((1u32 << bits) - 1) as f32;
        Self {
            min,
            max: min + scale * levels,
            bits,
            kind: QuantKind::NoZero,
            scale,
            zero: 0,
        }
    }

    pub fn quantize(&self, x: f32) -> u8 {
        let levels = ((1u32 << self.bits) - 1) as f32;
        let q = match self.kind {
            QuantKind::Asymmetric => self.zero as f32 + x / self.scale,
            QuantKind::NoZero => (x - self.min) / self.scale,
        };
        q.round().clamp(0.0, levels) as u8
    }

    pub fn dequantize(&self, q: u8) -> f32 {
        match self.kind {
            QuantKind::Asymmetric => (q as f32 - self.zero as f32) * self.scale,
            QuantKind::NoZero => self.min + q as f32 * self.scale,
        }
    }
}

/// Result of one online activation-quantization sweep: the u8 payload plus
/// the per-(row, group) metadata the kernels consume.
pub struct QuantizedActivation {
    pub data: Vec<u8>,
    pub configs: Vec<LowBitConfig>,
    pub sums: Vec<f32>,
    pub scales: Vec<f32>,
    pub zeros: Vec<f32>,
}

/// Quantize an `[n, m]` f32 activation to 8-bit unsigned, one config per
/// `(row, group)`. `group_cnt` is the group width along m; the trailing
/// group may be short when `m % group_cnt != 0`.
pub fn quantize_activation(
    input: &[f32],
    n: usize,
    m: usize,
    group: usize,
    group_cnt: usize,
) -> QuantizedActivation {
    debug_assert_eq!(input.len(), n * m);
    let mut data = vec![0u8; n * m];
    let mut configs = Vec::with_capacity(n * group);
    let mut sums = Vec::with_capacity(n * group);
    let mut scales = Vec::with_capacity(n * group);
    let mut zeros = Vec::with_capacity(n * group);

    for i in 0..n {
        let row = &input[i * m..(i + 1) * m];
        for g in 0..group {
            let st = g * group_cnt;
            let end = ((g + 1) * group_cnt).min(m);
            let chunk = &row[st..end];
            let mut lo = f32::MAX;
            let mut hi = f32::MIN;
            for &x in chunk {
                lo = lo.min(x);
                hi = hi.max(x);
            }
            if chunk.is_empty() {
                lo = 0.0;
                hi = 0.0;
            }
            let config = LowBitConfig::new(lo, hi, 8, QuantKind::Asymmetric);
            let mut sum = 0u32;
            for (j, &x) in chunk.iter().enumerate() {
                let q = config.quantize(x);
                data[i * m + st + j] = q;
                sum += q as u32;
            }
            sums.push(sum as f32);
            scales.push(config.scale);
            zeros.push(config.zero as f32);
            configs.push(config);
        }
    }

    QuantizedActivation {
        data,
        configs,
        sums,
        scales,
        zeros,
    }
}

/// Per-(row, group) sums of an already-quantized activation, as the worker
/// recomputes them from the frame payload.
pub fn quantized_sums(data: &[u8], n: usize, m: usize, group: usize, group_cnt: usize) -> Vec<f32> {
    let mut sums = Vec::with_capacity(n * group);
    for i in 0..n {
        for g in 0..group {
            let st = g * group_cnt;
            let end = ((g + 1) * group_cnt).min(m);
            let sum: u32 = data[i * m + st..i * m + end].iter().map(|&x| x as u32).sum();
            sums.push(sum as f32);
        }
    }
    sums
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_on_grid() {
        let config = LowBitConfig::new(-2.0, 6.0, 8, QuantKind::Asymmetric);
        for q in [0u8, 1, 63, 127, 255] {
            let x = config.dequantize(q);
            assert_eq!(config.quantize(x), q);
        }
    }

    #[test]
    fn test_max_error_bounded_by_scale() {
        let config = LowBitConfig::new(-1.0, 1.0, 8, QuantKind::Asymmetric);
        let mut x = -1.0f32;
        while x <= 1.0 {
            let err = (config.dequantize(config.quantize(x)) - x).abs();
            assert!(err <= config.scale, "err {} > scale {}", err, config.scale);
            x += 0.013;
        }
    }

    #[test]
    fn test_nozero_grid() {
        let config = LowBitConfig::new(-3.0, 4.5, 4, QuantKind::NoZero);
        assert_eq!(config.quantize(config.min), 0);
        assert_eq!(config.quantize(config.max), 15);
        for q in 0..=15u8 {
            assert_eq!(config.quantize(config.dequantize(q)), q);
        }
    }

    #[test]
    fn test_from_min_scale_matches_new() {
        let a = LowBitConfig::new(-1.5, -1.5 + 15.0 * 0.2, 4, QuantKind::NoZero);
        let b = LowBitConfig::from_min_scale(-1.5, 0.2, 4);
        assert!((a.scale - b.scale).abs() < 1e-6);
        assert!((a.min - b.min).abs() < 1e-6);
    }

    #[test]
    fn test_zero_is_exact() {
        let config = LowBitConfig::new(0.5, 3.0, 8, QuantKind::Asymmetric);
        let q = config.quantize(0.0);
        assert_eq!(config.dequantize(q), 0.0);
    }

    #[test]
    fn test_activation_sweep_sums() {
        let input = vec![1.0, -2.0, 3.0, 0.5, 4.0, -1.0, 2.0, 0.0];
        let qa = quantize_activation(&input, 2, 4, 2, 2);
        assert_eq!(qa.configs.len(), 4);
        assert_eq!(qa.data.len(), 8);
        let recomputed = quantized_sums(&qa.data, 2, 4, 2, 2);
        assert_eq!(qa.sums, recomputed);
        // Dequantized values stay within one scale of the input.
        for (i, &x) in input.iter().enumerate() {
            let g = (i % 4) / 2;
            let c = &qa.configs[(i / 4) * 2 + g];
            assert!((c.dequantize(qa.data[i]) - x).abs() <= c.scale);
        }
    }

    #[test]
    fn test_short_trailing_group() {
        let input = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let qa = quantize_activation(&input, 1, 5, 3, 2);
        assert_eq!(qa.configs.len(), 3);
        assert_eq!(
            qa.sums.iter().sum::<f32>(),
            qa.data.iter().map(|&x| x as f32).sum::<f32>()
        );
    }
}
