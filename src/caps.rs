//! Process-wide CPU capability registry.
//!
//! Detection runs once, on first query, through the OS/vendor-exposed
//! feature enumeration; results are cached for the process lifetime. The
//! embedding runtime consumes this at startup to pick code paths; nothing
//! here ever probes by executing candidate instructions.

use bitflags::bitflags;
use once_cell::sync::Lazy;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct CpuCapabilities: u32 {
        const SSE2   = 1 << 0;
        const SSE4_1 = 1 << 1;
        const SSE4_2 = 1 << 2;
        const POPCNT = 1 << 3;
        const AVX    = 1 << 4;
        const AVX2   = 1 << 5;
        const BMI1   = 1 << 6;
        const BMI2   = 1 << 7;
        const LZCNT  = 1 << 8;
    }
}

static CAPABILITIES: Lazy<CpuCapabilities> = Lazy::new(detect);

/// The full cached capability set.
pub fn capabilities() -> CpuCapabilities {
    *CAPABILITIES
}

/// Whether every capability in `wanted` is present.
pub fn has_capability(wanted: CpuCapabilities) -> bool {
    CAPABILITIES.contains(wanted)
}

#[cfg(target_arch = "x86_64")]
fn detect() -> CpuCapabilities {
    use raw_cpuid::CpuId;

    let cpuid = CpuId::new();
    let mut caps = CpuCapabilities::empty();
    if let Some(info) = cpuid.get_feature_info() {
        if info.has_sse2() {
            caps |= CpuCapabilities::SSE2;
        }
        if info.has_sse41() {
            caps |= CpuCapabilities::SSE4_1;
        }
        if info.has_sse42() {
            caps |= CpuCapabilities::SSE4_2;
        }
        if info.has_popcnt() {
            caps |= CpuCapabilities::POPCNT;
        }
        if info.has_avx() {
            caps |= CpuCapabilities::AVX;
        }
    }
    if let Some(info) = cpuid.get_extended_feature_info() {
        if info.has_avx2() {
            caps |= CpuCapabilities::AVX2;
        }
        if info.has_bmi1() {
            caps |= CpuCapabilities::BMI1;
        }
        if info.has_bmi2() {
            caps |= CpuCapabilities::BMI2;
        }
    }
    if let Some(info) = cpuid.get_extended_processor_and_feature_identifiers() {
        if info.has_lzcnt() {
            caps |= CpuCapabilities::LZCNT;
        }
    }
    caps
}

#[cfg(not(target_arch = "x86_64"))]
fn detect() -> CpuCapabilities {
    CpuCapabilities::empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_is_stable() {
        // first and later queries agree: detection ran exactly once
        let first = capabilities();
        assert_eq!(first, capabilities());
        for cap in first.iter() {
            assert!(has_capability(cap));
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_x86_64_baseline() {
        // SSE2 is architectural on x86_64
        assert!(has_capability(CpuCapabilities::SSE2));
    }
}
