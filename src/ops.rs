//! Softmax ops on candle tensors
//!
//! [`GroupedSoftmax`] runs the host kernels for CPU tensors and falls back to
//! composed tensor ops on other devices. Both directions are wired into
//! candle's autograd.

use std::sync::Arc;

use anyhow::bail;
use candle_core::{CpuStorage, CustomOp1, DType, Layout, Result, Shape, Tensor, shape::Dim};
use candle_nn::Module;
use half::{bf16, f16};

use crate::partition::{Partition, Plan};
use crate::tree::SoftmaxTree;

/// Temperature-scaled softmax along `dim`, anchored on the max for stability.
pub fn scaled_softmax<D: Dim>(xs: &Tensor, dim: D, temperature: f32) -> Result<Tensor> {
    let dim = dim.to_index(xs.shape(), "scaled_softmax")?;
    let max = xs.max_keepdim(dim)?;
    let diff = xs.broadcast_sub(&max)?.affine(1.0 / temperature as f64, 0.0)?;
    let num = diff.exp()?;
    let den = num.sum_keepdim(dim)?;
    num.broadcast_div(&den)
}

/// Gradient w.r.t. the scores of [`scaled_softmax`], given its output.
pub fn scaled_softmax_backward<D: Dim>(
    probs: &Tensor,
    grad: &Tensor,
    dim: D,
    temperature: f32,
) -> Result<Tensor> {
    let dim = dim.to_index(probs.shape(), "scaled_softmax_backward")?;
    let dot = (probs * grad)?.sum_keepdim(dim)?;
    let centered = grad.broadcast_sub(&dot)?;
    probs.mul(&centered)?.affine(1.0 / temperature as f64, 0.0)
}

pub(crate) fn validate_temperature(temperature: f32) -> anyhow::Result<()> {
    if !(temperature.is_finite() && temperature > 0.0) {
        bail!("temperature must be positive and finite (got {})", temperature);
    }
    Ok(())
}

/// Softmax over a partitioned score buffer of `inputs` values per row.
#[derive(Clone, Debug)]
pub struct GroupedSoftmax {
    inputs: usize,
    partition: Partition,
    temperature: f32,
}

impl GroupedSoftmax {
    pub fn new(inputs: usize, partition: Partition, temperature: f32) -> anyhow::Result<Self> {
        partition.validate(inputs)?;
        validate_temperature(temperature)?;
        Ok(Self {
            inputs,
            partition,
            temperature,
        })
    }

    pub fn flat(inputs: usize, groups: usize) -> anyhow::Result<Self> {
        Self::new(inputs, Partition::Flat { groups }, 1.0)
    }

    pub fn spatial(channels: usize, w: usize, h: usize) -> anyhow::Result<Self> {
        Self::new(
            channels * w * h,
            Partition::Spatial {
                channels,
                spatial: w * h,
            },
            1.0,
        )
    }

    pub fn tree(tree: Arc<SoftmaxTree>) -> anyhow::Result<Self> {
        Self::new(tree.total(), Partition::Tree(tree), 1.0)
    }

    pub fn with_temperature(self, temperature: f32) -> anyhow::Result<Self> {
        Self::new(self.inputs, self.partition, temperature)
    }

    pub fn inputs(&self) -> usize {
        self.inputs
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    fn rows(&self, elem_count: usize) -> Result<usize> {
        if elem_count == 0 || elem_count % self.inputs != 0 {
            candle_core::bail!(
                "grouped softmax expects a multiple of {} elements, got {}",
                self.inputs,
                elem_count
            );
        }
        Ok(elem_count / self.inputs)
    }

    fn plan(&self, batch: usize) -> Result<Plan> {
        Plan::new(&self.partition, batch, self.inputs)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))
    }

    /// Tensor-op formulation, usable on any device.
    pub fn forward_tensor(&self, xs: &Tensor) -> Result<Tensor> {
        let batch = self.rows(xs.elem_count())?;
        let rows = xs.reshape((batch, self.inputs))?;
        self.partition
            .forward_tensor(&rows, self.temperature)?
            .reshape(xs.dims())
    }

    /// Gradient w.r.t. the scores, given probabilities and output gradient.
    pub fn backward_tensor(&self, probs: &Tensor, grad: &Tensor) -> Result<Tensor> {
        if probs.shape() != grad.shape() {
            candle_core::bail!(
                "grouped softmax backward shape mismatch: {:?} vs {:?}",
                probs.shape(),
                grad.shape()
            );
        }
        let batch = self.rows(probs.elem_count())?;
        let shape = (batch, self.inputs);
        self.partition
            .backward_tensor(&probs.reshape(shape)?, &grad.reshape(shape)?, self.temperature)?
            .reshape(probs.dims())
    }

    fn forward_host(&self, input: &[f32]) -> Result<Vec<f32>> {
        let plan = self.plan(self.rows(input.len())?)?;
        let mut output = vec![0.0f32; input.len()];
        plan.forward(input, &mut output, self.temperature);
        Ok(output)
    }
}

impl CustomOp1 for GroupedSoftmax {
    fn name(&self) -> &'static str {
        "grouped-softmax"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let (start, end) = match layout.contiguous_offsets() {
            None => candle_core::bail!("grouped softmax input has to be contiguous"),
            Some(offsets) => offsets,
        };
        let storage = match storage {
            CpuStorage::F32(src) => CpuStorage::F32(self.forward_host(&src[start..end])?),
            CpuStorage::F16(src) => {
                let input: Vec<f32> = src[start..end].iter().map(|v| v.to_f32()).collect();
                let output = self.forward_host(&input)?;
                CpuStorage::F16(output.into_iter().map(f16::from_f32).collect())
            }
            CpuStorage::BF16(src) => {
                let input: Vec<f32> = src[start..end].iter().map(|v| v.to_f32()).collect();
                let output = self.forward_host(&input)?;
                CpuStorage::BF16(output.into_iter().map(bf16::from_f32).collect())
            }
            _ => candle_core::bail!("unsupported dtype for grouped softmax"),
        };
        Ok((storage, layout.shape().clone()))
    }

    fn bwd(&self, _arg: &Tensor, res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        Ok(Some(self.backward_tensor(res, grad_res)?))
    }
}

impl Module for GroupedSoftmax {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match xs.dtype() {
            DType::F32 | DType::F16 | DType::BF16 if xs.device().is_cpu() => {
                xs.contiguous()?.apply_op1(self.clone())
            }
            _ => self.forward_tensor(xs),
        }
    }
}

#[cfg(test)]
mod test {
    use candle_core::{Device, Var};

    use super::*;

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < tol, "{x} vs {y}");
        }
    }

    #[test]
    fn test_scaled_softmax_known_values() -> anyhow::Result<()> {
        let xs = Tensor::new(&[[1f32, 2., 3.]], &Device::Cpu)?;

        let probs = scaled_softmax(&xs, 1, 1.0)?.flatten_all()?.to_vec1::<f32>()?;

        assert_close(&probs, &[0.0900, 0.2447, 0.6652], 1e-3);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_temperature() {
        assert!(GroupedSoftmax::new(4, Partition::Flat { groups: 2 }, 0.0).is_err());
        assert!(GroupedSoftmax::new(4, Partition::Flat { groups: 2 }, -1.0).is_err());
        assert!(GroupedSoftmax::new(4, Partition::Flat { groups: 2 }, f32::NAN).is_err());
    }

    #[test]
    fn test_module_sums_to_one_per_group() -> anyhow::Result<()> {
        let op = GroupedSoftmax::flat(12, 3)?.with_temperature(2.5)?;
        let xs = Tensor::randn(0f32, 3f32, (4, 12), &Device::Cpu)?;

        let sums = op.forward(&xs)?.reshape((4, 3, 4))?.sum(2)?.flatten_all()?.to_vec1::<f32>()?;

        assert_close(&sums, &[1.0; 12], 1e-5);
        Ok(())
    }

    #[test]
    fn test_shift_invariance() -> anyhow::Result<()> {
        let op = GroupedSoftmax::flat(6, 2)?;
        let xs = Tensor::randn(0f32, 1f32, (2, 6), &Device::Cpu)?;

        let base = op.forward(&xs)?.flatten_all()?.to_vec1::<f32>()?;
        let shifted = op.forward(&xs.affine(1.0, 42.0)?)?.flatten_all()?.to_vec1::<f32>()?;

        assert_close(&base, &shifted, 1e-5);
        Ok(())
    }

    #[test]
    fn test_custom_op_matches_tensor_ops() -> anyhow::Result<()> {
        let op = GroupedSoftmax::spatial(3, 2, 2)?.with_temperature(0.8)?;
        let xs = Tensor::randn(0f32, 1f32, (2, 3, 2, 2), &Device::Cpu)?;

        let host = op.forward(&xs)?;
        let composed = op.forward_tensor(&xs)?;

        assert_eq!(host.dims(), xs.dims());
        assert_close(
            &host.flatten_all()?.to_vec1::<f32>()?,
            &composed.flatten_all()?.to_vec1::<f32>()?,
            1e-6,
        );
        Ok(())
    }

    #[test]
    fn test_autograd_matches_explicit_backward() -> anyhow::Result<()> {
        let tree = Arc::new(SoftmaxTree::new(vec![2, 3, 3])?);
        let op = GroupedSoftmax::tree(tree)?.with_temperature(1.5)?;
        let x = Var::from_tensor(&Tensor::randn(0f32, 1f32, (3, 8), &Device::Cpu)?)?;
        let g = Tensor::randn(0f32, 1f32, (3, 8), &Device::Cpu)?;

        let probs = op.forward(x.as_tensor())?;
        let grads = (&probs * &g)?.sum_all()?.backward()?;
        let autograd = grads
            .get(x.as_tensor())
            .ok_or_else(|| anyhow::anyhow!("no gradient for input"))?;

        let explicit = op.backward_tensor(&probs, &g)?;

        assert_close(
            &autograd.flatten_all()?.to_vec1::<f32>()?,
            &explicit.flatten_all()?.to_vec1::<f32>()?,
            1e-6,
        );
        Ok(())
    }

    #[test]
    fn test_half_precision_input() -> anyhow::Result<()> {
        let op = GroupedSoftmax::flat(4, 1)?;
        let xs = Tensor::new(&[[1f32, 2., 3., 4.]], &Device::Cpu)?;

        let full = op.forward(&xs)?.flatten_all()?.to_vec1::<f32>()?;
        let half = op
            .forward(&xs.to_dtype(DType::F16)?)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        assert_close(&full, &half, 1e-3);
        Ok(())
    }

    #[test]
    fn test_wrong_element_count_is_an_error() -> anyhow::Result<()> {
        let op = GroupedSoftmax::flat(6, 2)?;
        let xs = Tensor::zeros((2, 5), DType::F32, &Device::Cpu)?;

        assert!(op.forward(&xs).is_err());
        assert!(op.forward_tensor(&xs).is_err());
        Ok(())
    }
}
