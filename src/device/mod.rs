mod capabilities;

pub use capabilities::{current_process_memory_mib, DeviceCapabilities, DeviceFlops};
