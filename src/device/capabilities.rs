use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Peak theoretical throughput of the device, in TFLOPS per precision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceFlops {
    pub fp32: f64,
    pub fp16: f64,
    pub int8: f64,
}

impl DeviceFlops {
    pub const ZERO: DeviceFlops = DeviceFlops {
        fp32: 0.0,
        fp16: 0.0,
        int8: 0.0,
    };
}

/// Device hardware capabilities, probed once at node startup.
///
/// Carried in the topology so the cluster can see what every node brings.
/// `unknown()` is the sentinel used before the probe runs (a node reporting
/// it is not considered healthy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Device model (host name or OS identification)
    pub model: String,

    /// Processor identification
    pub chip: String,

    /// Total memory in MiB
    pub memory_mib: u32,

    /// Estimated throughput
    pub flops: DeviceFlops,
}

impl DeviceCapabilities {
    /// Sentinel for a device that has not been probed.
    pub fn unknown() -> Self {
        Self {
            model: "UNKNOWN".to_string(),
            chip: "UNKNOWN".to_string(),
            memory_mib: 0,
            flops: DeviceFlops::ZERO,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.model == "UNKNOWN" && self.chip == "UNKNOWN"
    }

    /// Probe the host hardware.
    ///
    /// Memory and processor identification come straight from the system;
    /// throughput is a coarse frequency-times-width estimate good enough
    /// for relative ranking, not benchmarking.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let model = System::host_name()
            .or_else(System::name)
            .unwrap_or_else(|| std::env::consts::OS.to_string());

        let (chip, frequency_mhz) = sys
            .cpus()
            .first()
            .map(|cpu| (cpu.brand().trim().to_string(), cpu.frequency()))
            .unwrap_or_else(|| (std::env::consts::ARCH.to_string(), 0));

        let memory_mib = (sys.total_memory() / (1024 * 1024)) as u32;

        let cores = sys.cpus().len() as f64;
        // cores x GHz x assumed 16 FMA lanes, in TFLOPS
        let fp32 = cores * (frequency_mhz as f64 / 1000.0) * 16.0 / 1000.0;
        let flops = DeviceFlops {
            fp32,
            fp16: fp32 * 2.0,
            int8: fp32 * 4.0,
        };

        Self {
            model,
            chip,
            memory_mib,
            flops,
        }
    }
}

/// Resident memory of this process in MiB, for peak-memory metering.
pub fn current_process_memory_mib() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return 0;
    }
    sys.process(pid)
        .map(|p| p.memory() / (1024 * 1024))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_sentinel() {
        let caps = DeviceCapabilities::unknown();
        assert!(caps.is_unknown());
        assert_eq!(caps.memory_mib, 0);
        assert_eq!(caps.flops, DeviceFlops::ZERO);
    }

    #[test]
    fn test_detection() {
        let caps = DeviceCapabilities::detect();
        assert!(!caps.is_unknown());
        assert!(caps.memory_mib > 0, "memory should be detected");
        assert!(!caps.model.is_empty());
    }

    #[test]
    fn test_flops_precision_scaling() {
        let caps = DeviceCapabilities::detect();
        assert!(caps.flops.fp16 >= caps.flops.fp32);
        assert!(caps.flops.int8 >= caps.flops.fp16);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let caps = DeviceCapabilities::detect();
        let json = serde_json::to_string(&caps).unwrap();
        let decoded: DeviceCapabilities = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, caps);
    }
}
