//! Host buffer with an optional device mirror
//!
//! The two copies are never synchronised implicitly. Writers mark which side
//! they touched and callers move data across with [`MirroredBuffer::pull`]
//! and [`MirroredBuffer::push`].

use candle_core::{DType, Device, Result, Tensor};
use log::{debug, warn};

/// Which copy holds the most recent write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Coherence {
    Synced,
    HostAhead,
    DeviceAhead,
}

#[derive(Debug)]
pub struct MirroredBuffer {
    name: &'static str,
    rows: usize,
    cols: usize,
    host: Vec<f32>,
    device: Option<Tensor>,
    coherence: Coherence,
}

impl MirroredBuffer {
    /// Zeroed host buffer without a device copy.
    pub fn host_only(name: &'static str, rows: usize, cols: usize) -> Self {
        Self {
            name,
            rows,
            cols,
            host: vec![0.0; rows * cols],
            device: None,
            coherence: Coherence::Synced,
        }
    }

    /// Zeroed host buffer plus a zeroed `(rows, cols)` copy on `device`.
    pub fn mirrored(name: &'static str, rows: usize, cols: usize, device: &Device) -> Result<Self> {
        let mut buf = Self::host_only(name, rows, cols);
        buf.device = Some(Tensor::zeros((rows, cols), DType::F32, device)?);
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn is_mirrored(&self) -> bool {
        self.device.is_some()
    }

    pub fn coherence(&self) -> Coherence {
        self.coherence
    }

    pub fn host(&self) -> &[f32] {
        &self.host
    }

    /// Mutable host view; the device copy becomes stale.
    pub fn host_mut(&mut self) -> &mut [f32] {
        if self.device.is_some() {
            self.coherence = Coherence::HostAhead;
        }
        &mut self.host
    }

    pub fn device(&self) -> Result<&Tensor> {
        match &self.device {
            Some(t) => Ok(t),
            None => candle_core::bail!("{} buffer has no device copy", self.name),
        }
    }

    /// Replace the device copy; the host copy becomes stale.
    pub fn set_device(&mut self, t: Tensor) -> Result<()> {
        let current = self.device()?;
        if t.elem_count() != self.rows * self.cols {
            candle_core::bail!(
                "{} buffer holds {} elements, got tensor of shape {:?}",
                self.name,
                self.rows * self.cols,
                t.shape()
            );
        }
        if !t.device().same_device(current.device()) {
            candle_core::bail!(
                "{} buffer lives on {:?}, got tensor on {:?}",
                self.name,
                current.device(),
                t.device()
            );
        }
        let t = t.to_dtype(DType::F32)?.reshape((self.rows, self.cols))?;
        self.device = Some(t);
        self.coherence = Coherence::DeviceAhead;
        Ok(())
    }

    /// Copy the device contents into host memory.
    pub fn pull(&mut self) -> Result<()> {
        if self.coherence == Coherence::HostAhead {
            warn!("{} pull overwrites newer host contents", self.name);
        }
        let values = self.device()?.flatten_all()?.to_vec1::<f32>()?;
        self.host.copy_from_slice(&values);
        self.coherence = Coherence::Synced;
        debug!("{} pulled {} values to host", self.name, values.len());
        Ok(())
    }

    /// Copy host memory onto the device.
    pub fn push(&mut self) -> Result<()> {
        if self.coherence == Coherence::DeviceAhead {
            warn!("{} push overwrites newer device contents", self.name);
        }
        let device = self.device()?.device().clone();
        self.device = Some(Tensor::from_slice(&self.host, (self.rows, self.cols), &device)?);
        self.coherence = Coherence::Synced;
        debug!("{} pushed {} values to {:?}", self.name, self.host.len(), device);
        Ok(())
    }
}
