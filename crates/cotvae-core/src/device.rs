use candle_core::{DType, Device};
use tracing::info;
use tracing::warn;

use crate::error::CoreResult;

/// Selects the best available compute device.
///
/// When the `cuda` feature is enabled and `prefer_gpu` is true, attempts to
/// acquire CUDA device `cuda_device_id`. Falls back to CPU on any error.
pub fn select_device(prefer_gpu: bool, #[allow(unused_variables)] cuda_device_id: usize) -> CoreResult<Device> {
    #[cfg(feature = "cuda")]
    if prefer_gpu {
        match Device::new_cuda(cuda_device_id) {
            Ok(dev) => {
                info!(cuda_device_id, "Using CUDA device");
                return Ok(dev);
            }
            Err(e) => {
                warn!(error = %e, "CUDA unavailable, falling back to CPU");
            }
        }
    }

    #[cfg(feature = "metal")]
    if prefer_gpu {
        match Device::new_metal(0) {
            Ok(dev) => {
                info!("Using Metal device");
                return Ok(dev);
            }
            Err(e) => {
                warn!(error = %e, "Metal unavailable, falling back to CPU");
            }
        }
    }

    info!("Using CPU device");
    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    if prefer_gpu {
        warn!(
            "--gpu flag has no effect: binary was not compiled with GPU support. \
             Rebuild with `cargo install --path crates/cotvae-cli --features cuda`."
        );
    }
    Ok(Device::Cpu)
}

/// Short label for log lines.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

/// Immutable placement for every tensor a run creates.
///
/// Built once at start-up and handed to each component at construction, so
/// nothing consults process-wide device or dtype state.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub device: Device,
    pub dtype: DType,
}

impl RunContext {
    /// Full-precision context on `device`.
    ///
    /// Training always runs in F32: the KL term divides by `sigma²` and the
    /// cross-entropy is taken over the full vocabulary, both of which lose
    /// too much precision in BF16.
    pub fn new(device: Device) -> Self {
        Self { device, dtype: DType::F32 }
    }

    pub fn cpu() -> Self {
        Self::new(Device::Cpu)
    }
}
