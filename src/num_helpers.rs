//! Numerical stability helpers
//!
//! Compiled to no-ops unless the `check_num_stability` feature is on.

use candle_core::{Result, Tensor};

#[cfg(feature = "check_num_stability")]
use candle_core::{DType, bail};
#[cfg(feature = "check_num_stability")]
use log::{debug, trace};

#[cfg(feature = "check_num_stability")]
pub fn check_finite(values: &[f32], comment: &str) -> Result<()> {
    let nan_check = values.iter().filter(|v| v.is_nan()).count();
    let inf_check = values.iter().filter(|v| v.is_infinite()).count();

    if nan_check > 0 || inf_check > 0 {
        debug!("{:?}: {} non-finite values", comment, nan_check + inf_check);
        bail!(
            "{:?}: NaNs and/or infs detected - inf: {}, nan: {}",
            comment,
            inf_check,
            nan_check
        );
    } else {
        debug!("{:?}: OK", comment);
    }

    Ok(())
}

#[cfg(feature = "check_num_stability")]
pub fn check_nan_and_inf(t: &Tensor, comment: &str) -> Result<()> {
    trace!("Tensor {:?}:\n{}", comment, t);
    let values = t.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    check_finite(&values, comment)
}

#[cfg(not(feature = "check_num_stability"))]
pub fn check_finite(_values: &[f32], _comment: &str) -> Result<()> {
    Ok(())
}

#[cfg(not(feature = "check_num_stability"))]
pub fn check_nan_and_inf(_t: &Tensor, _comment: &str) -> Result<()> {
    Ok(())
}

#[cfg(test)]
pub mod test {
    use candle_core::Device;

    use super::*;

    #[test]
    pub fn test_finite_values_pass() -> Result<()> {
        let t = Tensor::new(&[-1f32, 0.0, 1.0, 1e30], &Device::Cpu)?;

        check_nan_and_inf(&t, "finite")?;
        check_finite(&[-1.0, 0.5], "finite slice")?;

        Ok(())
    }

    #[cfg(feature = "check_num_stability")]
    #[test]
    pub fn test_check_nan_and_inf_detects_inf() -> Result<()> {
        let t = Tensor::full(f32::INFINITY, (1,), &Device::Cpu)?;

        assert!(check_nan_and_inf(&t, "inf").is_err());

        Ok(())
    }

    #[cfg(feature = "check_num_stability")]
    #[test]
    pub fn test_check_nan_and_inf_detects_neg_inf() -> Result<()> {
        let t = Tensor::full(f32::NEG_INFINITY, (1,), &Device::Cpu)?;

        assert!(check_nan_and_inf(&t, "neg inf").is_err());

        Ok(())
    }

    #[cfg(feature = "check_num_stability")]
    #[test]
    pub fn test_check_finite_detects_nan() {
        assert!(check_finite(&[0.25, f32::NAN], "nan").is_err());
    }
}
