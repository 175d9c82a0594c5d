//! Host softmax kernels
//!
//! Both kernels walk the same addressing scheme: for every `(b, g)` pair the
//! distribution starts at `b * batch_stride + g * group_stride` and its `n`
//! elements sit `stride` apart.

/// Addressing parameters for one kernel invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StrideParams {
    /// Elements per distribution.
    pub n: usize,
    pub batch: usize,
    pub batch_stride: usize,
    pub groups: usize,
    pub group_stride: usize,
    /// Distance between consecutive elements of one distribution.
    pub stride: usize,
}

impl StrideParams {
    /// Number of elements from the first to one past the last index touched.
    pub fn span(&self) -> usize {
        if self.n == 0 || self.batch == 0 || self.groups == 0 {
            return 0;
        }
        (self.batch - 1) * self.batch_stride
            + (self.groups - 1) * self.group_stride
            + (self.n - 1) * self.stride
            + 1
    }

    /// Number of independent distributions covered by one call.
    pub fn distributions(&self) -> usize {
        self.batch * self.groups
    }

    fn base(&self, b: usize, g: usize) -> usize {
        b * self.batch_stride + g * self.group_stride
    }
}

fn softmax_one(input: &[f32], base: usize, p: &StrideParams, temperature: f32, output: &mut [f32]) {
    let mut max = f32::NEG_INFINITY;
    for i in 0..p.n {
        max = max.max(input[base + i * p.stride]);
    }

    let mut sum = 0.0f32;
    for i in 0..p.n {
        let idx = base + i * p.stride;
        let e = ((input[idx] - max) / temperature).exp();
        sum += e;
        output[idx] = e;
    }

    for i in 0..p.n {
        output[base + i * p.stride] /= sum;
    }
}

/// Temperature-scaled softmax over every `(batch, group)` distribution.
///
/// `input` and `output` must both cover `p.span()` elements; a call only
/// writes the indices it addresses.
pub fn softmax_strided(input: &[f32], output: &mut [f32], p: &StrideParams, temperature: f32) {
    for b in 0..p.batch {
        for g in 0..p.groups {
            softmax_one(input, p.base(b, g), p, temperature, output);
        }
    }
}

/// Softmax Jacobian-vector product, added into `dst`.
///
/// For probabilities `p` and incoming gradient `g` of one distribution this
/// adds `p_k * (g_k - sum_i p_i * g_i) / temperature` at every element.
/// Existing values in `dst` are kept.
pub fn softmax_strided_backward(
    output: &[f32],
    delta: &[f32],
    p: &StrideParams,
    temperature: f32,
    dst: &mut [f32],
) {
    for b in 0..p.batch {
        for g in 0..p.groups {
            let base = p.base(b, g);

            let mut dot = 0.0f32;
            for i in 0..p.n {
                let idx = base + i * p.stride;
                dot += output[idx] * delta[idx];
            }

            for i in 0..p.n {
                let idx = base + i * p.stride;
                dst[idx] += output[idx] * (delta[idx] - dot) / temperature;
            }
        }
    }
}
