//! XID event classification
//!
//! Some XID codes are raised by misbehaving applications rather than by a
//! degrading GPU. Those are listed here and never mark a device unhealthy.
//! See <http://docs.nvidia.com/deploy/xid-errors/index.html#topic_4>.

/// XID codes that indicate an application-level fault; the GPU stays healthy
pub const BENIGN_APPLICATION_XIDS: [u64; 3] = [
    31, // GPU memory page fault
    43, // GPU stopped processing
    45, // Preemptive cleanup, due to previous errors
];

/// XID reported when a GPU drops off the bus
pub const GPU_FALLEN_OFF_BUS: u64 = 79;

/// Check whether an XID code is a benign application-level fault
pub fn is_benign_application_fault(code: u64) -> bool {
    BENIGN_APPLICATION_XIDS.contains(&code)
}

/// Human-readable description for an XID code
pub fn describe(code: u64) -> &'static str {
    match code {
        13 => "Graphics Engine Exception",
        31 => "GPU memory page fault",
        32 => "Invalid or corrupted push buffer stream",
        38 => "Driver firmware error",
        43 => "GPU stopped processing",
        45 => "Preemptive cleanup, due to previous errors",
        48 => "Double Bit ECC Error",
        61 => "Internal micro-controller breakpoint/warning",
        62 => "Internal micro-controller halt",
        63 => "ECC page retirement or row remapping recording event",
        64 => "ECC page retirement or row remapper recording failure",
        68 => "NVDEC0 Exception",
        69 => "Graphics Engine class error",
        74 => "NVLINK Error",
        GPU_FALLEN_OFF_BUS => "GPU has fallen off the bus",
        92 => "High single-bit ECC error rate",
        94 => "Contained ECC error",
        95 => "Uncontained ECC error",
        _ => "Unknown XID error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_application_faults() {
        assert!(is_benign_application_fault(31));
        assert!(is_benign_application_fault(43));
        assert!(is_benign_application_fault(45));
    }

    #[test]
    fn test_hardware_faults_are_not_benign() {
        for code in [0, 1, 13, 48, 79, 95, u64::MAX] {
            assert!(!is_benign_application_fault(code), "xid {}", code);
        }
    }

    #[test]
    fn test_xid_descriptions() {
        assert!(describe(31).contains("page fault"));
        assert!(describe(48).contains("ECC"));
        assert!(describe(79).contains("fallen off"));
        assert!(describe(9999).contains("Unknown"));
    }
}
