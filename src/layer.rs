//! Softmax layer: persistent output/delta buffers plus forward and backward
//! entry points for the host and device paths.

use std::sync::Arc;

use candle_core::{Device, Result, Tensor};
use candle_nn::Module;
use log::{debug, info};

use crate::buffer::MirroredBuffer;
use crate::num_helpers::{check_finite, check_nan_and_inf};
use crate::ops::GroupedSoftmax;
use crate::partition::{Partition, Plan};
use crate::tree::SoftmaxTree;

#[derive(Clone, Debug)]
pub struct SoftmaxConfig {
    pub batch: usize,
    pub inputs: usize,
    pub partition: Partition,
    pub temperature: f32,
}

impl SoftmaxConfig {
    pub fn flat(batch: usize, inputs: usize, groups: usize) -> Self {
        Self {
            batch,
            inputs,
            partition: Partition::Flat { groups },
            temperature: 1.0,
        }
    }

    pub fn spatial(batch: usize, channels: usize, w: usize, h: usize) -> Self {
        Self {
            batch,
            inputs: channels * w * h,
            partition: Partition::Spatial {
                channels,
                spatial: w * h,
            },
            temperature: 1.0,
        }
    }

    pub fn tree(batch: usize, tree: Arc<SoftmaxTree>) -> Self {
        Self {
            batch,
            inputs: tree.total(),
            partition: Partition::Tree(tree),
            temperature: 1.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Where the layer may run. `Device` also allocates device mirrors.
#[derive(Clone, Debug)]
pub enum ExecTarget {
    Host,
    Device(Device),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerState {
    Constructed,
    ForwardComputed,
    BackwardComputed,
}

pub struct SoftmaxLayer {
    op: GroupedSoftmax,
    batch: usize,
    plan: Plan,
    output: MirroredBuffer,
    delta: MirroredBuffer,
    state: LayerState,
}

impl SoftmaxLayer {
    pub fn new(cfg: &SoftmaxConfig, target: ExecTarget) -> anyhow::Result<Self> {
        let op = GroupedSoftmax::new(cfg.inputs, cfg.partition.clone(), cfg.temperature)?;
        let plan = Plan::new(&cfg.partition, cfg.batch, cfg.inputs)?;

        info!(
            "softmax                                        {:>4} ({}, t={})",
            cfg.inputs,
            cfg.partition.kind(),
            cfg.temperature
        );

        let (output, delta) = match &target {
            ExecTarget::Host => (
                MirroredBuffer::host_only("output", cfg.batch, cfg.inputs),
                MirroredBuffer::host_only("delta", cfg.batch, cfg.inputs),
            ),
            ExecTarget::Device(device) => (
                MirroredBuffer::mirrored("output", cfg.batch, cfg.inputs, device)?,
                MirroredBuffer::mirrored("delta", cfg.batch, cfg.inputs, device)?,
            ),
        };

        Ok(Self {
            op,
            batch: cfg.batch,
            plan,
            output,
            delta,
            state: LayerState::Constructed,
        })
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn inputs(&self) -> usize {
        self.op.inputs()
    }

    pub fn outputs(&self) -> usize {
        self.op.inputs()
    }

    pub fn temperature(&self) -> f32 {
        self.op.temperature()
    }

    pub fn partition(&self) -> &Partition {
        self.op.partition()
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    pub fn output(&self) -> &[f32] {
        self.output.host()
    }

    pub fn output_buffer(&self) -> &MirroredBuffer {
        &self.output
    }

    pub fn delta(&self) -> &[f32] {
        self.delta.host()
    }

    /// Host gradient w.r.t. this layer's output, filled by the next layer.
    pub fn delta_mut(&mut self) -> &mut [f32] {
        self.delta.host_mut()
    }

    pub fn delta_buffer(&self) -> &MirroredBuffer {
        &self.delta
    }

    fn check_len(&self, what: &str, len: usize) -> Result<()> {
        if len != self.plan.buffer_len() {
            candle_core::bail!(
                "softmax {} holds {} values, layer expects {} ({} x {})",
                what,
                len,
                self.plan.buffer_len(),
                self.batch,
                self.inputs()
            );
        }
        Ok(())
    }

    fn check_forwarded(&self) -> Result<()> {
        if self.state == LayerState::Constructed {
            candle_core::bail!("softmax backward called before any forward");
        }
        Ok(())
    }

    /// Host forward: overwrites `output` with the probabilities of `input`.
    pub fn forward(&mut self, input: &[f32]) -> Result<()> {
        self.check_len("input", input.len())?;

        let temperature = self.temperature();
        self.plan.forward(input, self.output.host_mut(), temperature);
        check_finite(self.output.host(), "softmax output")?;

        self.state = LayerState::ForwardComputed;
        debug!("softmax forward on host, batch {}", self.batch);
        Ok(())
    }

    /// Host backward: adds the input gradient into `upstream`.
    pub fn backward(&mut self, upstream: &mut [f32]) -> Result<()> {
        self.check_forwarded()?;
        self.check_len("upstream delta", upstream.len())?;

        self.plan.backward(
            self.output.host(),
            self.delta.host(),
            self.temperature(),
            upstream,
        );
        check_finite(upstream, "softmax upstream delta")?;

        self.state = LayerState::BackwardComputed;
        debug!("softmax backward on host, batch {}", self.batch);
        Ok(())
    }

    /// Device forward: replaces the device copy of `output`.
    pub fn forward_device(&mut self, input: &Tensor) -> Result<()> {
        let device = self.output.device()?.device();
        if !input.device().same_device(device) {
            candle_core::bail!(
                "softmax input is on {:?}, layer runs on {:?}",
                input.device(),
                device
            );
        }
        self.check_len("input", input.elem_count())?;

        let probs = self
            .op
            .forward(&input.reshape((self.batch, self.inputs()))?)?;
        check_nan_and_inf(&probs, "softmax output")?;
        self.output.set_device(probs)?;

        self.state = LayerState::ForwardComputed;
        debug!("softmax forward on {:?}, batch {}", input.device(), self.batch);
        Ok(())
    }

    /// Device backward: `upstream` becomes `upstream + input gradient`.
    pub fn backward_device(&mut self, upstream: &mut Tensor) -> Result<()> {
        self.check_forwarded()?;
        self.check_len("upstream delta", upstream.elem_count())?;

        let grad = self
            .op
            .backward_tensor(self.output.device()?, self.delta.device()?)?
            .reshape(upstream.dims())?
            .to_dtype(upstream.dtype())?;
        *upstream = upstream.add(&grad)?;
        check_nan_and_inf(upstream, "softmax upstream delta")?;

        self.state = LayerState::BackwardComputed;
        debug!("softmax backward on {:?}, batch {}", upstream.device(), self.batch);
        Ok(())
    }

    /// Replace the device copy of `delta`, as written by the next layer.
    pub fn set_delta_device(&mut self, delta: Tensor) -> Result<()> {
        self.delta.set_device(delta)
    }

    /// Copy the device `output` into host memory.
    pub fn pull_output(&mut self) -> Result<()> {
        self.output.pull()
    }

    pub fn pull_delta(&mut self) -> Result<()> {
        self.delta.pull()
    }

    /// Copy the host `delta` onto the device.
    pub fn push_delta(&mut self) -> Result<()> {
        self.delta.push()
    }
}
