//! Hardware detection and the closed set of acceleration tiers.
//!
//! Detection probes device nodes and vendor tools rather than linking GPU
//! libraries, so the crate builds the same on every host. NVML is used for
//! VRAM when the `nvml` feature is enabled.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use sysinfo::System;
use tracing::{debug, info};

/// Acceleration tier a variant targets and a host may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareTier {
    /// NVIDIA GPU through the CUDA execution provider
    Cuda,
    /// Qualcomm NPU through the QNN execution provider
    Npu,
    /// Any other GPU (DirectML / WebGPU class providers)
    #[serde(alias = "gpu")]
    WebGpu,
    Cpu,
}

impl HardwareTier {
    pub const ALL: [HardwareTier; 4] = [
        HardwareTier::Cuda,
        HardwareTier::Npu,
        HardwareTier::WebGpu,
        HardwareTier::Cpu,
    ];

    /// Preference rank, lower is preferred.
    pub fn rank(self) -> u8 {
        match self {
            HardwareTier::Cuda => 0,
            HardwareTier::Npu => 1,
            HardwareTier::WebGpu => 2,
            HardwareTier::Cpu => 3,
        }
    }
}

impl fmt::Display for HardwareTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareTier::Cuda => write!(f, "CUDA"),
            HardwareTier::Npu => write!(f, "NPU"),
            HardwareTier::WebGpu => write!(f, "WebGPU"),
            HardwareTier::Cpu => write!(f, "CPU"),
        }
    }
}

impl FromStr for HardwareTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "cuda-gpu" | "nvidia" => Ok(HardwareTier::Cuda),
            "npu" | "qnn" | "qualcomm-npu" => Ok(HardwareTier::Npu),
            "webgpu" | "gpu" | "generic-gpu" | "dml" => Ok(HardwareTier::WebGpu),
            "cpu" => Ok(HardwareTier::Cpu),
            other => Err(format!(
                "unknown hardware '{}', expected one of cpu, cuda, npu, webgpu",
                other
            )),
        }
    }
}

/// Detected execution capability of this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    /// Best available tier
    pub tier: HardwareTier,
    /// Every tier usable on this host, best first; always ends with CPU
    pub available: Vec<HardwareTier>,
    /// VRAM of the first accelerator in bytes (0 when unknown)
    pub vram_bytes: u64,
    pub total_ram_bytes: u64,
    pub cpu_cores: usize,
}

impl HardwareProfile {
    /// Probe the host. Blocking; call once per manager.
    pub fn detect() -> Self {
        let mut available = Vec::new();

        let cuda_vram = detect_cuda();
        if cuda_vram.is_some() {
            available.push(HardwareTier::Cuda);
        }

        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let cpu_brand = sys
            .cpus()
            .first()
            .map(|c| c.brand().to_string())
            .unwrap_or_default();
        if detect_npu(&cpu_brand) {
            available.push(HardwareTier::Npu);
        }

        if detect_gpu() {
            available.push(HardwareTier::WebGpu);
        }

        available.push(HardwareTier::Cpu);

        let profile = Self {
            tier: available[0],
            available,
            vram_bytes: cuda_vram.unwrap_or(0),
            total_ram_bytes: sys.total_memory(),
            cpu_cores: num_cpus::get(),
        };
        info!(
            "Detected hardware: {} (available: {:?}, {} MB VRAM, {} cores)",
            profile.tier,
            profile.available,
            profile.vram_bytes / 1024 / 1024,
            profile.cpu_cores
        );
        profile
    }

    /// Profile pinned to one tier, used for explicit overrides.
    pub fn for_tier(tier: HardwareTier) -> Self {
        let mut available = vec![tier];
        if tier != HardwareTier::Cpu {
            available.push(HardwareTier::Cpu);
        }
        Self {
            tier,
            available,
            vram_bytes: 0,
            total_ram_bytes: 0,
            cpu_cores: num_cpus::get(),
        }
    }

    pub fn supports(&self, tier: HardwareTier) -> bool {
        tier == HardwareTier::Cpu || self.available.contains(&tier)
    }
}

fn detect_cuda() -> Option<u64> {
    #[cfg(feature = "nvml")]
    {
        if let Some(vram) = nvml_vram() {
            return Some(vram);
        }
    }

    if !Path::new("/dev/nvidia0").exists() {
        return None;
    }

    let output = std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output();
    let output = match output {
        Ok(o) if o.status.success() => o,
        _ => {
            debug!("nvidia device present but nvidia-smi unavailable");
            return Some(0);
        }
    };

    // nvidia-smi reports MiB
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mib = stdout
        .lines()
        .next()
        .and_then(|l| l.trim().parse::<u64>().ok())
        .unwrap_or(0);
    Some(mib * 1024 * 1024)
}

#[cfg(feature = "nvml")]
fn nvml_vram() -> Option<u64> {
    use nvml_wrapper::Nvml;

    let nvml = Nvml::init().ok()?;
    if nvml.device_count().ok()? == 0 {
        return None;
    }
    let device = nvml.device_by_index(0).ok()?;
    device.memory_info().ok().map(|m| m.total)
}

fn detect_npu(cpu_brand: &str) -> bool {
    let fastrpc = std::fs::read_dir("/dev")
        .map(|entries| {
            entries.flatten().any(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with("fastrpc-") || name == "adsprpc-smd"
            })
        })
        .unwrap_or(false);

    fastrpc || cpu_brand.to_ascii_lowercase().contains("snapdragon")
}

fn detect_gpu() -> bool {
    Path::new("/dev/dri/renderD128").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_rank_follows_acceleration_order() {
        let mut tiers = HardwareTier::ALL.to_vec();
        tiers.reverse();
        tiers.sort_by_key(|t| t.rank());
        assert_eq!(tiers, HardwareTier::ALL.to_vec());
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!("CUDA".parse::<HardwareTier>().unwrap(), HardwareTier::Cuda);
        assert_eq!("qnn".parse::<HardwareTier>().unwrap(), HardwareTier::Npu);
        assert_eq!("gpu".parse::<HardwareTier>().unwrap(), HardwareTier::WebGpu);
        assert!("tpu".parse::<HardwareTier>().is_err());
    }

    #[test]
    fn test_tier_serde_uses_lowercase_tags() {
        assert_eq!(serde_json::to_string(&HardwareTier::WebGpu).unwrap(), "\"webgpu\"");
        let parsed: HardwareTier = serde_json::from_str("\"gpu\"").unwrap();
        assert_eq!(parsed, HardwareTier::WebGpu);
    }

    #[test]
    fn test_override_profile_supports_cpu_fallback() {
        let profile = HardwareProfile::for_tier(HardwareTier::Cuda);
        assert!(profile.supports(HardwareTier::Cuda));
        assert!(profile.supports(HardwareTier::Cpu));
        assert!(!profile.supports(HardwareTier::Npu));
        assert_eq!(profile.tier, HardwareTier::Cuda);
    }

    #[test]
    fn test_detect_always_includes_cpu() {
        let profile = HardwareProfile::detect();
        assert_eq!(profile.available.last(), Some(&HardwareTier::Cpu));
        assert_eq!(profile.tier, profile.available[0]);
        assert!(profile.cpu_cores > 0);
    }
}
