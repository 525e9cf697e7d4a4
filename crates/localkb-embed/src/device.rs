use candle_core::Device;

/// Metal when compiled with the `metal` feature and available, CPU otherwise.
pub fn select_device() -> Device {
    #[cfg(feature = "metal")]
    {
        if let Ok(dev) = Device::new_metal(0) {
            tracing::info!(target: "embed", "device: Metal (MPS)");
            return dev;
        }
    }
    tracing::info!(target: "embed", "device: CPU");
    Device::Cpu
}
