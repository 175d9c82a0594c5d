//! Partitioning of a score buffer into independent softmax distributions
//!
//! A [`Partition`] is fixed when the layer is built. It is turned into a
//! [`Plan`] (a list of host kernel calls) once, and into reshapes/narrows
//! when the scores live in a device tensor.

use std::sync::Arc;

use anyhow::bail;
use candle_core::{Result, Tensor};
use log::debug;

use crate::kernels::{StrideParams, softmax_strided, softmax_strided_backward};
use crate::ops::{scaled_softmax, scaled_softmax_backward};
use crate::tree::SoftmaxTree;

#[derive(Clone, Debug)]
pub enum Partition {
    /// `groups` equal contiguous slices of the inputs.
    Flat { groups: usize },
    /// One distribution per spatial position, across `channels`.
    Spatial { channels: usize, spatial: usize },
    /// Consecutive groups sized by the tree.
    Tree(Arc<SoftmaxTree>),
}

impl Partition {
    pub fn kind(&self) -> &'static str {
        match self {
            Partition::Flat { .. } => "flat",
            Partition::Spatial { .. } => "spatial",
            Partition::Tree(_) => "tree",
        }
    }

    pub fn validate(&self, inputs: usize) -> anyhow::Result<()> {
        if inputs == 0 {
            bail!("softmax layer needs at least one input");
        }
        match self {
            Partition::Flat { groups } => {
                if *groups == 0 {
                    bail!("groups must be positive");
                }
                if inputs % groups != 0 {
                    bail!(
                        "groups must divide inputs evenly ({} % {} = {})",
                        inputs,
                        groups,
                        inputs % groups
                    );
                }
            }
            Partition::Spatial { channels, spatial } => {
                if *channels == 0 || *spatial == 0 {
                    bail!("spatial softmax needs positive channels and spatial size");
                }
                if channels * spatial != inputs {
                    bail!(
                        "channels * spatial must equal inputs ({} * {} != {})",
                        channels,
                        spatial,
                        inputs
                    );
                }
            }
            Partition::Tree(tree) => {
                if tree.total() != inputs {
                    bail!(
                        "softmax tree group sizes sum to {} but the layer has {} inputs",
                        tree.total(),
                        inputs
                    );
                }
            }
        }
        Ok(())
    }

    /// Host kernel calls covering `batch` rows of `inputs` scores.
    ///
    /// Assumes the partition was validated against `inputs`.
    pub fn kernel_calls(&self, batch: usize, inputs: usize) -> Vec<KernelCall> {
        match self {
            Partition::Flat { groups } => {
                let n = inputs / groups;
                vec![KernelCall {
                    offset: 0,
                    params: StrideParams {
                        n,
                        batch,
                        batch_stride: inputs,
                        groups: *groups,
                        group_stride: n,
                        stride: 1,
                    },
                }]
            }
            Partition::Spatial { channels, spatial } => vec![KernelCall {
                offset: 0,
                params: StrideParams {
                    n: *channels,
                    batch,
                    batch_stride: inputs,
                    groups: *spatial,
                    group_stride: 1,
                    stride: *spatial,
                },
            }],
            Partition::Tree(tree) => tree
                .group_offsets()
                .map(|(offset, size)| KernelCall {
                    offset,
                    params: StrideParams {
                        n: size,
                        batch,
                        batch_stride: inputs,
                        groups: 1,
                        group_stride: 0,
                        stride: 1,
                    },
                })
                .collect(),
        }
    }

    /// Softmax of a `(batch, inputs)` tensor using tensor ops only.
    pub fn forward_tensor(&self, xs: &Tensor, temperature: f32) -> Result<Tensor> {
        let (batch, inputs) = xs.dims2()?;
        match self {
            Partition::Flat { groups } => scaled_softmax(
                &xs.reshape((batch, *groups, inputs / groups))?,
                2,
                temperature,
            )?
            .reshape((batch, inputs)),
            Partition::Spatial { channels, spatial } => scaled_softmax(
                &xs.reshape((batch, *channels, *spatial))?,
                1,
                temperature,
            )?
            .reshape((batch, inputs)),
            Partition::Tree(tree) => {
                let parts = tree
                    .group_offsets()
                    .map(|(offset, size)| {
                        scaled_softmax(&xs.narrow(1, offset, size)?, 1, temperature)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Tensor::cat(&parts, 1)
            }
        }
    }

    /// Input gradient for `(batch, inputs)` probabilities and output gradient.
    pub fn backward_tensor(&self, probs: &Tensor, grad: &Tensor, temperature: f32) -> Result<Tensor> {
        let (batch, inputs) = probs.dims2()?;
        match self {
            Partition::Flat { groups } => {
                let shape = (batch, *groups, inputs / groups);
                scaled_softmax_backward(&probs.reshape(shape)?, &grad.reshape(shape)?, 2, temperature)?
                    .reshape((batch, inputs))
            }
            Partition::Spatial { channels, spatial } => {
                let shape = (batch, *channels, *spatial);
                scaled_softmax_backward(&probs.reshape(shape)?, &grad.reshape(shape)?, 1, temperature)?
                    .reshape((batch, inputs))
            }
            Partition::Tree(tree) => {
                let parts = tree
                    .group_offsets()
                    .map(|(offset, size)| {
                        scaled_softmax_backward(
                            &probs.narrow(1, offset, size)?,
                            &grad.narrow(1, offset, size)?,
                            1,
                            temperature,
                        )
                    })
                    .collect::<Result<Vec<_>>>()?;
                Tensor::cat(&parts, 1)
            }
        }
    }
}

/// One host kernel invocation, starting `offset` elements into the buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelCall {
    pub offset: usize,
    pub params: StrideParams,
}

/// Kernel calls for a fixed `(batch, inputs)` shape, checked against the
/// buffer length once.
#[derive(Clone, Debug)]
pub struct Plan {
    batch: usize,
    inputs: usize,
    calls: Vec<KernelCall>,
}

impl Plan {
    pub fn new(partition: &Partition, batch: usize, inputs: usize) -> anyhow::Result<Self> {
        partition.validate(inputs)?;
        if batch == 0 {
            bail!("batch must be positive");
        }

        let len = batch * inputs;
        let calls = partition.kernel_calls(batch, inputs);
        for call in &calls {
            if call.offset + call.params.span() > len {
                bail!(
                    "{} softmax call at offset {} spans {} elements, buffer holds {}",
                    partition.kind(),
                    call.offset,
                    call.params.span(),
                    len
                );
            }
        }
        debug!("{} softmax plan: {} kernel calls", partition.kind(), calls.len());

        Ok(Self { batch, inputs, calls })
    }

    /// Elements a buffer must hold for this plan.
    pub fn buffer_len(&self) -> usize {
        self.batch * self.inputs
    }

    pub fn calls(&self) -> &[KernelCall] {
        &self.calls
    }

    pub fn forward(&self, input: &[f32], output: &mut [f32], temperature: f32) {
        for call in &self.calls {
            softmax_strided(
                &input[call.offset..],
                &mut output[call.offset..],
                &call.params,
                temperature,
            );
        }
    }

    pub fn backward(&self, output: &[f32], delta: &[f32], temperature: f32, dst: &mut [f32]) {
        for call in &self.calls {
            softmax_strided_backward(
                &output[call.offset..],
                &delta[call.offset..],
                &call.params,
                temperature,
                &mut dst[call.offset..],
            );
        }
    }
}

#[cfg(test)]
mod test {
    use candle_core::Device;

    use super::*;

    fn group_sums(values: &[f32], ranges: &[(usize, usize)]) -> Vec<f32> {
        ranges
            .iter()
            .map(|&(off, size)| values[off..off + size].iter().sum())
            .collect()
    }

    #[test]
    fn test_flat_rejects_uneven_groups() {
        let err = Partition::Flat { groups: 3 }.validate(10).unwrap_err();
        assert!(err.to_string().contains("10 % 3 = 1"));
        assert!(Partition::Flat { groups: 0 }.validate(10).is_err());
    }

    #[test]
    fn test_spatial_rejects_mismatched_dims() {
        assert!(Partition::Spatial { channels: 3, spatial: 4 }.validate(12).is_ok());
        assert!(Partition::Spatial { channels: 3, spatial: 5 }.validate(12).is_err());
    }

    #[test]
    fn test_tree_rejects_wrong_total() -> anyhow::Result<()> {
        let tree = Arc::new(SoftmaxTree::new(vec![2, 3])?);
        assert!(Partition::Tree(tree.clone()).validate(5).is_ok());
        assert!(Partition::Tree(tree).validate(6).is_err());
        Ok(())
    }

    #[test]
    fn test_plans_stay_in_bounds() -> anyhow::Result<()> {
        let tree = Arc::new(SoftmaxTree::new(vec![4, 2, 2])?);
        for partition in [
            Partition::Flat { groups: 4 },
            Partition::Spatial { channels: 2, spatial: 4 },
            Partition::Tree(tree),
        ] {
            let plan = Plan::new(&partition, 3, 8)?;
            for call in plan.calls() {
                assert!(call.offset + call.params.span() <= plan.buffer_len());
            }
        }
        Ok(())
    }

    #[test]
    fn test_flat_groups_normalise_independently() -> anyhow::Result<()> {
        let plan = Plan::new(&Partition::Flat { groups: 2 }, 2, 6)?;
        let input: Vec<f32> = (0..12).map(|i| (i as f32 * 0.7).sin() * 3.0).collect();
        let mut output = vec![0.0; 12];

        plan.forward(&input, &mut output, 1.0);

        for sum in group_sums(&output, &[(0, 3), (3, 3), (6, 3), (9, 3)]) {
            assert!((sum - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_spatial_normalises_across_channels() -> anyhow::Result<()> {
        let (batch, channels, spatial) = (2, 3, 4);
        let inputs = channels * spatial;
        let plan = Plan::new(&Partition::Spatial { channels, spatial }, batch, inputs)?;
        let input: Vec<f32> = (0..batch * inputs).map(|i| (i as f32 * 1.3).cos()).collect();
        let mut output = vec![0.0; batch * inputs];

        plan.forward(&input, &mut output, 0.5);

        for b in 0..batch {
            for s in 0..spatial {
                let sum: f32 = (0..channels)
                    .map(|c| output[b * inputs + c * spatial + s])
                    .sum();
                assert!((sum - 1.0).abs() < 1e-5);
            }
        }
        Ok(())
    }

    #[test]
    fn test_spatial_single_position_is_flat_single_group() -> anyhow::Result<()> {
        let input = [0.5f32, -1.0, 2.0, 0.0, 3.0, 1.0];
        let mut spatial_out = [0.0f32; 6];
        let mut flat_out = [0.0f32; 6];

        Plan::new(&Partition::Spatial { channels: 3, spatial: 1 }, 2, 3)?
            .forward(&input, &mut spatial_out, 2.0);
        Plan::new(&Partition::Flat { groups: 1 }, 2, 3)?.forward(&input, &mut flat_out, 2.0);

        assert_eq!(spatial_out, flat_out);
        Ok(())
    }

    #[test]
    fn test_spatial_single_channel_is_certain() -> anyhow::Result<()> {
        let input = [0.5f32, -1.0, 2.0, 9.0];
        let mut output = [0.0f32; 4];

        Plan::new(&Partition::Spatial { channels: 1, spatial: 4 }, 1, 4)?
            .forward(&input, &mut output, 1.0);

        assert_eq!(output, [1.0; 4]);
        Ok(())
    }

    #[test]
    fn test_tree_matches_flat_calls_at_offsets() -> anyhow::Result<()> {
        let tree = Arc::new(SoftmaxTree::new(vec![2, 3])?);
        let input = [0.3f32, 1.2, -0.4, 2.2, 0.9];
        let mut tree_out = [0.0f32; 5];

        Plan::new(&Partition::Tree(tree), 1, 5)?.forward(&input, &mut tree_out, 1.0);

        let mut expected = [0.0f32; 5];
        let first = Plan::new(&Partition::Flat { groups: 1 }, 1, 2)?;
        let second = Plan::new(&Partition::Flat { groups: 1 }, 1, 3)?;
        first.forward(&input[..2], &mut expected[..2], 1.0);
        second.forward(&input[2..], &mut expected[2..], 1.0);

        assert_eq!(tree_out, expected);
        for sum in group_sums(&tree_out, &[(0, 2), (2, 3)]) {
            assert!((sum - 1.0).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_tensor_path_matches_host_plan() -> anyhow::Result<()> {
        let tree = Arc::new(SoftmaxTree::new(vec![3, 1, 4])?);
        let (batch, inputs) = (3, 8);
        let xs = Tensor::randn(0f32, 2f32, (batch, inputs), &Device::Cpu)?;
        let g = Tensor::randn(0f32, 1f32, (batch, inputs), &Device::Cpu)?;
        let input = xs.flatten_all()?.to_vec1::<f32>()?;
        let grad = g.flatten_all()?.to_vec1::<f32>()?;

        for partition in [
            Partition::Flat { groups: 2 },
            Partition::Spatial { channels: 4, spatial: 2 },
            Partition::Tree(tree),
        ] {
            let plan = Plan::new(&partition, batch, inputs)?;
            let mut host = vec![0.0; batch * inputs];
            plan.forward(&input, &mut host, 0.7);
            let mut host_grad = vec![0.0; batch * inputs];
            plan.backward(&host, &grad, 0.7, &mut host_grad);

            let probs = partition.forward_tensor(&xs, 0.7)?;
            let device = probs.flatten_all()?.to_vec1::<f32>()?;
            let device_grad = partition
                .backward_tensor(&probs, &g, 0.7)?
                .flatten_all()?
                .to_vec1::<f32>()?;

            for (a, b) in host.iter().zip(&device) {
                assert!((a - b).abs() < 1e-5, "{} forward: {a} vs {b}", partition.kind());
            }
            for (a, b) in host_grad.iter().zip(&device_grad) {
                assert!((a - b).abs() < 1e-5, "{} backward: {a} vs {b}", partition.kind());
            }
        }
        Ok(())
    }
}
