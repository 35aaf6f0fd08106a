//! GPU detection providers
//!
//! Each vendor is a `GpuProvider`; the monitor holds them in a list and
//! iterates. Detection errors downgrade that vendor silently - the sample
//! continues with whatever the other providers returned.
//!
//! The default NVIDIA variant shells out to `nvidia-smi`; with the `gpu`
//! feature the native NVML bindings replace it at build time under the same
//! contract.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::node::types::{GpuInfo, GpuVendor};

/// Timeout for any external probe command
const PROBE_TIMEOUT: Duration = Duration::from_secs(8);

/// Errors from a single provider probe
#[derive(Error, Debug)]
pub enum GpuError {
    #[error("Probe command failed: {0}")]
    ProbeFailed(String),

    #[error("Unexpected probe output: {0}")]
    ParseError(String),

    #[error("Probe timed out")]
    Timeout,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A pluggable GPU detection backend
#[async_trait]
pub trait GpuProvider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &'static str;

    /// Vendor this provider detects
    fn vendor(&self) -> GpuVendor;

    /// Cheap check that the probe tooling exists on this machine
    async fn is_available(&self) -> bool;

    /// Enumerate devices with current utilization
    async fn detect(&self) -> Result<Vec<GpuInfo>, GpuError>;

    /// Refresh metrics on previously detected devices
    ///
    /// The default re-runs detection; SDK-backed providers may do better.
    async fn update(&self) -> Result<Vec<GpuInfo>, GpuError> {
        self.detect().await
    }
}

/// Run a probe command with the shared timeout, returning stdout
async fn probe_output(cmd: &str, args: &[&str]) -> Result<String, GpuError> {
    let child = Command::new(cmd)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output();

    let output = tokio::time::timeout(PROBE_TIMEOUT, child)
        .await
        .map_err(|_| GpuError::Timeout)??;

    if !output.status.success() {
        return Err(GpuError::ProbeFailed(format!(
            "{} exited with {}",
            cmd, output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check whether a command exists on PATH
async fn command_exists(cmd: &str) -> bool {
    Command::new("which")
        .arg(cmd)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

// ============================================================================
// NVIDIA via nvidia-smi CSV
// ============================================================================

/// NVIDIA provider shelling out to `nvidia-smi`
pub struct NvidiaSmiProvider;

const NVIDIA_QUERY: &str =
    "index,name,memory.total,memory.used,temperature.gpu,utilization.gpu,power.draw,driver_version";

#[async_trait]
impl GpuProvider for NvidiaSmiProvider {
    fn name(&self) -> &'static str {
        "nvidia-smi"
    }

    fn vendor(&self) -> GpuVendor {
        GpuVendor::Nvidia
    }

    async fn is_available(&self) -> bool {
        command_exists("nvidia-smi").await
    }

    async fn detect(&self) -> Result<Vec<GpuInfo>, GpuError> {
        let query = format!("--query-gpu={}", NVIDIA_QUERY);
        let out = probe_output(
            "nvidia-smi",
            &[query.as_str(), "--format=csv,noheader,nounits"],
        )
        .await?;
        parse_nvidia_csv(&out)
    }
}

/// Parse `nvidia-smi --format=csv,noheader,nounits` output
///
/// Memory figures are reported in MiB; `[N/A]` fields become None.
pub fn parse_nvidia_csv(csv: &str) -> Result<Vec<GpuInfo>, GpuError> {
    let mut gpus = Vec::new();

    for line in csv.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
        if fields.len() < 8 {
            return Err(GpuError::ParseError(format!(
                "expected 8 fields, got {}: {}",
                fields.len(),
                line
            )));
        }

        let index: u32 = fields[0]
            .parse()
            .map_err(|_| GpuError::ParseError(format!("bad index: {}", fields[0])))?;
        let total_mib: u64 = fields[2].parse().unwrap_or(0);
        let used_mib: u64 = fields[3].parse().unwrap_or(0);

        gpus.push(GpuInfo {
            index,
            vendor: GpuVendor::Nvidia,
            name: fields[1].to_string(),
            total_memory_bytes: total_mib * 1024 * 1024,
            used_memory_bytes: used_mib * 1024 * 1024,
            temperature_c: fields[4].parse().ok(),
            utilization_percent: fields[5].parse().ok(),
            power_watts: fields[6].parse().ok(),
            driver_version: non_na(fields[7]),
        });
    }

    Ok(gpus)
}

fn non_na(field: &str) -> Option<String> {
    let f = field.trim();
    if f.is_empty() || f == "[N/A]" || f == "N/A" {
        None
    } else {
        Some(f.to_string())
    }
}

// ============================================================================
// NVIDIA via NVML (native SDK, replaces the CLI variant at build time)
// ============================================================================

/// NVIDIA provider backed by NVML bindings
#[cfg(feature = "gpu")]
pub struct NvmlProvider;

#[cfg(feature = "gpu")]
#[async_trait]
impl GpuProvider for NvmlProvider {
    fn name(&self) -> &'static str {
        "nvml"
    }

    fn vendor(&self) -> GpuVendor {
        GpuVendor::Nvidia
    }

    async fn is_available(&self) -> bool {
        nvml_wrapper::Nvml::init().is_ok()
    }

    async fn detect(&self) -> Result<Vec<GpuInfo>, GpuError> {
        let nvml =
            nvml_wrapper::Nvml::init().map_err(|e| GpuError::ProbeFailed(e.to_string()))?;
        let count = nvml
            .device_count()
            .map_err(|e| GpuError::ProbeFailed(e.to_string()))?;
        let driver = nvml.sys_driver_version().ok();

        let mut gpus = Vec::new();
        for index in 0..count {
            let device = match nvml.device_by_index(index) {
                Ok(d) => d,
                Err(e) => {
                    debug!("NVML device {} unavailable: {}", index, e);
                    continue;
                }
            };

            let memory = device.memory_info().ok();
            gpus.push(GpuInfo {
                index,
                vendor: GpuVendor::Nvidia,
                name: device.name().unwrap_or_else(|_| "NVIDIA GPU".to_string()),
                total_memory_bytes: memory.as_ref().map(|m| m.total).unwrap_or(0),
                used_memory_bytes: memory.as_ref().map(|m| m.used).unwrap_or(0),
                temperature_c: device
                    .temperature(nvml_wrapper::enum_wrappers::device::TemperatureSensor::Gpu)
                    .ok()
                    .map(|t| t as f64),
                utilization_percent: device.utilization_rates().ok().map(|u| u.gpu as f64),
                power_watts: device.power_usage().ok().map(|mw| mw as f64 / 1000.0),
                driver_version: driver.clone(),
            });
        }

        Ok(gpus)
    }
}

// ============================================================================
// AMD via ROCm CLI
// ============================================================================

/// AMD provider shelling out to `rocm-smi`
pub struct RocmProvider;

#[async_trait]
impl GpuProvider for RocmProvider {
    fn name(&self) -> &'static str {
        "rocm-smi"
    }

    fn vendor(&self) -> GpuVendor {
        GpuVendor::Amd
    }

    async fn is_available(&self) -> bool {
        command_exists("rocm-smi").await
    }

    async fn detect(&self) -> Result<Vec<GpuInfo>, GpuError> {
        let out = probe_output(
            "rocm-smi",
            &[
                "--showproductname",
                "--showmeminfo",
                "vram",
                "--showtemp",
                "--showuse",
                "--json",
            ],
        )
        .await?;
        let driver = detect_rocm_version().await;
        parse_rocm_json(&out, driver.as_deref())
    }
}

/// Parse `rocm-smi --json` output
///
/// Cards appear as top-level keys `card0`, `card1`, ... with free-form
/// metric names that have shifted across ROCm releases; parsing is
/// tolerant of absent fields.
pub fn parse_rocm_json(json: &str, driver: Option<&str>) -> Result<Vec<GpuInfo>, GpuError> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| GpuError::ParseError(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| GpuError::ParseError("expected a JSON object".to_string()))?;

    let mut gpus = Vec::new();
    for (key, card) in obj {
        let Some(index) = key.strip_prefix("card").and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let card = card.as_object().cloned().unwrap_or_default();

        let field = |names: &[&str]| -> Option<String> {
            names.iter().find_map(|n| {
                card.get(*n)
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            })
        };

        let name = field(&["Card series", "Card Series", "Card model", "Device Name"])
            .unwrap_or_else(|| "AMD GPU".to_string());
        let total = field(&["VRAM Total Memory (B)", "vram Total Memory (B)"])
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let used = field(&["VRAM Total Used Memory (B)", "vram Total Used Memory (B)"])
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let temp = field(&[
            "Temperature (Sensor edge) (C)",
            "Temperature (Sensor junction) (C)",
        ])
        .and_then(|s| s.parse::<f64>().ok());
        let util = field(&["GPU use (%)"]).and_then(|s| s.parse::<f64>().ok());

        gpus.push(GpuInfo {
            index,
            vendor: GpuVendor::Amd,
            name,
            total_memory_bytes: total,
            used_memory_bytes: used,
            temperature_c: temp,
            utilization_percent: util,
            power_watts: None,
            driver_version: driver.map(|d| d.to_string()),
        });
    }

    gpus.sort_by_key(|g| g.index);
    Ok(gpus)
}

/// Detect the installed ROCm version
///
/// Fallback priority: `/opt/rocm/.info/version`, then the hipcc install
/// path, then `rocm-smi --showversion`, then `rocm-smi --version`.
pub async fn detect_rocm_version() -> Option<String> {
    if let Ok(v) = std::fs::read_to_string("/opt/rocm/.info/version") {
        let v = v.trim();
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }

    if let Ok(out) = Command::new("which").arg("hipcc").output().await {
        if out.status.success() {
            let path = String::from_utf8_lossy(&out.stdout);
            if let Some(v) = rocm_version_from_path(path.trim()) {
                return Some(v);
            }
        }
    }

    for flag in ["--showversion", "--version"] {
        if let Ok(out) = probe_output("rocm-smi", &[flag]).await {
            if let Some(v) = rocm_version_from_output(&out) {
                return Some(v);
            }
        }
    }

    None
}

/// Extract a version from a versioned install path like `/opt/rocm-5.7.1/bin/hipcc`
pub fn rocm_version_from_path(path: &str) -> Option<String> {
    let re = regex::Regex::new(r"rocm-(\d+\.\d+(?:\.\d+)?)").ok()?;
    re.captures(path).map(|c| c[1].to_string())
}

/// Extract a version from `rocm-smi` version output
pub fn rocm_version_from_output(out: &str) -> Option<String> {
    let re = regex::Regex::new(r"(?i)version\s*:?\s*(\d+\.\d+(?:\.\d+)?)").ok()?;
    re.captures(out).map(|c| c[1].to_string())
}

// ============================================================================
// Intel via kernel probe + lspci
// ============================================================================

/// Intel provider probing the DRM subsystem, confirmed via `lspci`
pub struct IntelProvider;

#[async_trait]
impl GpuProvider for IntelProvider {
    fn name(&self) -> &'static str {
        "intel-drm"
    }

    fn vendor(&self) -> GpuVendor {
        GpuVendor::Intel
    }

    async fn is_available(&self) -> bool {
        !intel_drm_cards().is_empty()
    }

    async fn detect(&self) -> Result<Vec<GpuInfo>, GpuError> {
        let cards = intel_drm_cards();
        if cards.is_empty() {
            return Ok(Vec::new());
        }

        // lspci carries the marketing name; absence is not an error.
        let lspci_name = match probe_output("lspci", &[]).await {
            Ok(out) => parse_intel_lspci(&out),
            Err(e) => {
                debug!("lspci probe failed: {}", e);
                None
            }
        };

        Ok(cards
            .into_iter()
            .enumerate()
            .map(|(i, _card)| GpuInfo {
                index: i as u32,
                vendor: GpuVendor::Intel,
                name: lspci_name
                    .clone()
                    .unwrap_or_else(|| "Intel GPU".to_string()),
                total_memory_bytes: 0,
                used_memory_bytes: 0,
                temperature_c: None,
                utilization_percent: None,
                power_watts: None,
                driver_version: None,
            })
            .collect())
    }
}

/// DRM card directories whose PCI vendor is Intel (0x8086)
fn intel_drm_cards() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/sys/class/drm") else {
        return Vec::new();
    };

    let mut cards: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("card") && !n.contains('-'))
        .filter(|n| {
            let vendor = std::path::Path::new("/sys/class/drm")
                .join(n)
                .join("device/vendor");
            std::fs::read_to_string(vendor)
                .map(|v| v.trim() == "0x8086")
                .unwrap_or(false)
        })
        .collect();
    cards.sort();
    cards
}

/// Pull an Intel graphics device name out of `lspci` output
pub fn parse_intel_lspci(out: &str) -> Option<String> {
    out.lines()
        .find(|l| {
            (l.contains("VGA compatible controller") || l.contains("Display controller"))
                && l.contains("Intel")
        })
        .and_then(|l| l.splitn(3, ": ").nth(1).or_else(|| l.split(": ").last()))
        .map(|s| s.trim().to_string())
}

/// The default provider set for this build
pub fn default_providers() -> Vec<Box<dyn GpuProvider>> {
    #[cfg(feature = "gpu")]
    let nvidia: Box<dyn GpuProvider> = Box::new(NvmlProvider);
    #[cfg(not(feature = "gpu"))]
    let nvidia: Box<dyn GpuProvider> = Box::new(NvidiaSmiProvider);

    vec![nvidia, Box::new(RocmProvider), Box::new(IntelProvider)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvidia_csv() {
        let csv = "0, NVIDIA GeForce RTX 4090, 24564, 1024, 45, 12, 68.42, 550.54.14\n\
                   1, NVIDIA GeForce RTX 4090, 24564, 24000, 78, 99, 412.00, 550.54.14\n";
        let gpus = parse_nvidia_csv(csv).unwrap();

        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].index, 0);
        assert_eq!(gpus[0].name, "NVIDIA GeForce RTX 4090");
        assert_eq!(gpus[0].total_memory_bytes, 24564 * 1024 * 1024);
        assert_eq!(gpus[0].used_memory_bytes, 1024 * 1024 * 1024);
        assert_eq!(gpus[0].temperature_c, Some(45.0));
        assert_eq!(gpus[0].utilization_percent, Some(12.0));
        assert_eq!(gpus[0].driver_version.as_deref(), Some("550.54.14"));
        assert_eq!(gpus[1].utilization_percent, Some(99.0));
    }

    #[test]
    fn test_parse_nvidia_csv_na_fields() {
        let csv = "0, Tesla K80, 11441, 0, [N/A], [N/A], [N/A], 470.82.01\n";
        let gpus = parse_nvidia_csv(csv).unwrap();

        assert_eq!(gpus.len(), 1);
        assert!(gpus[0].temperature_c.is_none());
        assert!(gpus[0].utilization_percent.is_none());
        assert!(gpus[0].power_watts.is_none());
    }

    #[test]
    fn test_parse_nvidia_csv_empty() {
        assert!(parse_nvidia_csv("").unwrap().is_empty());
        assert!(parse_nvidia_csv("\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_nvidia_csv_truncated_line() {
        assert!(parse_nvidia_csv("0, broken").is_err());
    }

    #[test]
    fn test_parse_rocm_json() {
        let json = r#"{
            "card0": {
                "Card series": "Radeon RX 7900 XTX",
                "VRAM Total Memory (B)": "25753026560",
                "VRAM Total Used Memory (B)": "1073741824",
                "Temperature (Sensor edge) (C)": "52.0",
                "GPU use (%)": "7"
            }
        }"#;
        let gpus = parse_rocm_json(json, Some("6.0.2")).unwrap();

        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].vendor, GpuVendor::Amd);
        assert_eq!(gpus[0].name, "Radeon RX 7900 XTX");
        assert_eq!(gpus[0].total_memory_bytes, 25753026560);
        assert_eq!(gpus[0].temperature_c, Some(52.0));
        assert_eq!(gpus[0].utilization_percent, Some(7.0));
        assert_eq!(gpus[0].driver_version.as_deref(), Some("6.0.2"));
    }

    #[test]
    fn test_parse_rocm_json_orders_cards() {
        let json = r#"{
            "card1": {"Card series": "B"},
            "card0": {"Card series": "A"}
        }"#;
        let gpus = parse_rocm_json(json, None).unwrap();
        assert_eq!(gpus[0].name, "A");
        assert_eq!(gpus[1].name, "B");
    }

    #[test]
    fn test_rocm_version_from_path() {
        assert_eq!(
            rocm_version_from_path("/opt/rocm-5.7.1/bin/hipcc"),
            Some("5.7.1".to_string())
        );
        assert_eq!(
            rocm_version_from_path("/opt/rocm-6.0/bin/hipcc"),
            Some("6.0".to_string())
        );
        assert_eq!(rocm_version_from_path("/usr/bin/hipcc"), None);
    }

    #[test]
    fn test_rocm_version_from_output() {
        assert_eq!(
            rocm_version_from_output("ROCM-SMI version: 2.1.0"),
            Some("2.1.0".to_string())
        );
        assert_eq!(
            rocm_version_from_output("ROCm version 6.1"),
            Some("6.1".to_string())
        );
        assert_eq!(rocm_version_from_output("no digits here"), None);
    }

    #[test]
    fn test_parse_intel_lspci() {
        let out = "00:01.0 PCI bridge: Intel Corporation Device 7a04\n\
                   00:02.0 VGA compatible controller: Intel Corporation Raptor Lake-S UHD Graphics (rev 04)\n";
        let name = parse_intel_lspci(out).unwrap();
        assert!(name.contains("Intel Corporation Raptor Lake-S UHD Graphics"));
    }

    #[test]
    fn test_parse_intel_lspci_no_match() {
        let out = "01:00.0 VGA compatible controller: NVIDIA Corporation AD102\n";
        assert!(parse_intel_lspci(out).is_none());
    }

    #[test]
    fn test_default_providers_cover_vendors() {
        let providers = default_providers();
        let vendors: Vec<GpuVendor> = providers.iter().map(|p| p.vendor()).collect();
        assert!(vendors.contains(&GpuVendor::Nvidia));
        assert!(vendors.contains(&GpuVendor::Amd));
        assert!(vendors.contains(&GpuVendor::Intel));
    }
}
