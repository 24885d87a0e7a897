//! Extension point run once over a finished capture

use crate::buffers::CaptureUnit;
use crate::error::QuantizeError;

/// Sees the full unit sequence, including any slots a cancelled capture left empty
pub trait QuantizationHook {
    fn quantize(&mut self, units: &[CaptureUnit]) -> Result<(), QuantizeError>;
}

/// Leaves the capture as-is
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl QuantizationHook for Identity {
    fn quantize(&mut self, _units: &[CaptureUnit]) -> Result<(), QuantizeError> {
        Ok(())
    }
}
