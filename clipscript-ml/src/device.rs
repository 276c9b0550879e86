//! Accelerator environment check.
//!
//! Reports whether a CUDA device is usable, how many there are, and the first
//! device's name. Probes are tried in order; a probe that fails is logged and
//! skipped, and when none succeeds the accelerator is reported unavailable.

use crate::error::MlError;
use crate::runtime::PythonRuntime;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const CHECK_WORKER: &str = include_str!("../python/check_env.py");

/// Python packages the fine-tuning and generation workers import.
pub const REQUIRED_PACKAGES: &[&str] = &[
    "torch",
    "transformers",
    "peft",
    "trl",
    "bitsandbytes",
    "datasets",
];

/// What a single probe found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub available: bool,
    pub count: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub torch_version: Option<String>,
    #[serde(default)]
    pub cuda_built: Option<bool>,
}

/// A source of accelerator information.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    fn name(&self) -> &str;
    async fn probe(&self) -> Result<DeviceInfo, MlError>;
}

/// Asks `torch.cuda` through the Python runtime.
pub struct TorchProbe {
    runtime: PythonRuntime,
}

impl TorchProbe {
    pub fn new(runtime: PythonRuntime) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl DeviceProbe for TorchProbe {
    fn name(&self) -> &str {
        "torch"
    }

    async fn probe(&self) -> Result<DeviceInfo, MlError> {
        let value = self
            .runtime
            .run_worker(
                CHECK_WORKER,
                &serde_json::json!({}),
                Some(Duration::from_secs(120)),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Asks the NVIDIA driver directly. Knows nothing about torch.
pub struct NvidiaSmiProbe;

#[async_trait]
impl DeviceProbe for NvidiaSmiProbe {
    fn name(&self) -> &str {
        "nvidia-smi"
    }

    async fn probe(&self) -> Result<DeviceInfo, MlError> {
        let output = Command::new("nvidia-smi")
            .args(["--query-gpu=name", "--format=csv,noheader"])
            .output()
            .await
            .map_err(|e| MlError::device(format!("failed to run nvidia-smi: {e}")))?;
        if !output.status.success() {
            return Err(MlError::device(format!(
                "nvidia-smi exited with {}",
                output.status
            )));
        }

        let names = parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout));
        Ok(DeviceInfo {
            available: !names.is_empty(),
            count: names.len() as u32,
            name: names.into_iter().next(),
            torch_version: None,
            cuda_built: None,
        })
    }
}

/// One GPU name per non-empty line.
pub fn parse_nvidia_smi(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Run probes in order. The first success wins, with the probe's name.
pub async fn probe_devices(probes: &[&dyn DeviceProbe]) -> (DeviceInfo, Option<String>) {
    for probe in probes {
        match probe.probe().await {
            Ok(info) => {
                debug!(probe = probe.name(), available = info.available, "Device probe succeeded");
                return (info, Some(probe.name().to_string()));
            }
            Err(e) => warn!(probe = probe.name(), error = %e, "Device probe failed"),
        }
    }
    (DeviceInfo::default(), None)
}

/// Full environment report printed by `clipscript check`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentReport {
    pub python_version: Option<String>,
    pub torch_version: Option<String>,
    pub cuda_built: Option<bool>,
    pub accelerator_available: bool,
    pub device_count: u32,
    pub device_name: Option<String>,
    pub packages: BTreeMap<String, bool>,
    /// Probe that produced the device facts; `None` when all failed.
    pub source: Option<String>,
}

impl EnvironmentReport {
    pub fn from_probe(info: DeviceInfo, source: Option<String>) -> Self {
        Self {
            python_version: None,
            torch_version: info.torch_version,
            cuda_built: info.cuda_built,
            accelerator_available: info.available,
            device_count: info.count,
            device_name: info.name.filter(|_| info.available),
            packages: BTreeMap::new(),
            source,
        }
    }

    pub fn missing_packages(&self) -> Vec<&str> {
        self.packages
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

impl fmt::Display for EnvironmentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Python: {}",
            self.python_version.as_deref().unwrap_or("not found")
        )?;
        writeln!(
            f,
            "PyTorch version: {}",
            self.torch_version.as_deref().unwrap_or("unknown")
        )?;
        writeln!(f, "CUDA available: {}", self.accelerator_available)?;
        writeln!(f, "Device count: {}", self.device_count)?;

        if self.accelerator_available {
            if let Some(name) = &self.device_name {
                writeln!(f, "Current device name: {name}")?;
            }
            if let Some(built) = self.cuda_built {
                writeln!(f, "CUDA built into torch: {built}")?;
            }
        } else {
            writeln!(f, "---")?;
            writeln!(f, "CRITICAL: CUDA is NOT available, work will run on the CPU.")?;
            writeln!(
                f,
                "Install the PyTorch build that matches your CUDA driver."
            )?;
        }

        if !self.packages.is_empty() {
            writeln!(f, "---")?;
            for (name, ok) in &self.packages {
                writeln!(f, "{name}: {}", if *ok { "ok" } else { "missing" })?;
            }
        }
        Ok(())
    }
}

/// Probe torch, then `nvidia-smi`, and check the required packages.
pub async fn check_environment(runtime: &PythonRuntime) -> EnvironmentReport {
    let torch = TorchProbe::new(runtime.clone());
    let smi = NvidiaSmiProbe;
    let probes: [&dyn DeviceProbe; 2] = [&torch, &smi];
    let (info, source) = probe_devices(&probes).await;

    let mut report = EnvironmentReport::from_probe(info, source);
    report.python_version = runtime.version().await;
    if report.python_version.is_some() {
        report.packages = runtime.check_packages(REQUIRED_PACKAGES).await;
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProbe {
        name: &'static str,
        result: Option<DeviceInfo>,
        calls: AtomicUsize,
    }

    impl FakeProbe {
        fn ok(name: &'static str, info: DeviceInfo) -> Self {
            Self {
                name,
                result: Some(info),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(name: &'static str) -> Self {
            Self {
                name,
                result: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DeviceProbe for FakeProbe {
        fn name(&self) -> &str {
            self.name
        }

        async fn probe(&self) -> Result<DeviceInfo, MlError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
                .clone()
                .ok_or_else(|| MlError::device("driver query failed"))
        }
    }

    fn gpu() -> DeviceInfo {
        DeviceInfo {
            available: true,
            count: 1,
            name: Some("NVIDIA GeForce RTX 4090".into()),
            torch_version: Some("2.4.1+cu121".into()),
            cuda_built: Some(true),
        }
    }

    #[test]
    fn test_parse_nvidia_smi() {
        let names = parse_nvidia_smi("NVIDIA A100-SXM4-80GB\nNVIDIA A100-SXM4-80GB\n\n");
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], "NVIDIA A100-SXM4-80GB");
        assert!(parse_nvidia_smi("  \n").is_empty());
    }

    #[test]
    fn test_worker_reply_shape() {
        let info: DeviceInfo = serde_json::from_value(serde_json::json!({
            "torch_version": "2.4.1",
            "cuda_built": false,
            "available": false,
            "count": 0,
            "name": null
        }))
        .unwrap();
        assert!(!info.available);
        assert_eq!(info.count, 0);
        assert_eq!(info.cuda_built, Some(false));
    }

    #[tokio::test]
    async fn test_first_successful_probe_wins() {
        let first = FakeProbe::ok("torch", gpu());
        let second = FakeProbe::ok("nvidia-smi", DeviceInfo::default());
        let probes: [&dyn DeviceProbe; 2] = [&first, &second];
        let (info, source) = probe_devices(&probes).await;
        assert!(info.available);
        assert_eq!(source.as_deref(), Some("torch"));
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_probe_falls_through() {
        let first = FakeProbe::failing("torch");
        let second = FakeProbe::ok(
            "nvidia-smi",
            DeviceInfo {
                available: true,
                count: 2,
                name: Some("Tesla T4".into()),
                ..Default::default()
            },
        );
        let probes: [&dyn DeviceProbe; 2] = [&first, &second];
        let (info, source) = probe_devices(&probes).await;
        assert_eq!(info.count, 2);
        assert_eq!(source.as_deref(), Some("nvidia-smi"));
    }

    #[tokio::test]
    async fn test_all_probes_failing_is_unavailable() {
        let a = FakeProbe::failing("torch");
        let b = FakeProbe::failing("nvidia-smi");
        let probes: [&dyn DeviceProbe; 2] = [&a, &b];
        let (info, source) = probe_devices(&probes).await;
        let report = EnvironmentReport::from_probe(info, source);
        assert!(!report.accelerator_available);
        assert_eq!(report.device_count, 0);
        assert!(report.device_name.is_none());
        assert!(report.source.is_none());
    }

    #[test]
    fn test_display_available() {
        let report = EnvironmentReport::from_probe(gpu(), Some("torch".into()));
        let text = report.to_string();
        assert!(text.contains("CUDA available: true"));
        assert!(text.contains("Device count: 1"));
        assert!(text.contains("Current device name: NVIDIA GeForce RTX 4090"));
        assert!(!text.contains("CRITICAL"));
    }

    #[test]
    fn test_display_unavailable_prints_hint() {
        let mut report = EnvironmentReport::from_probe(DeviceInfo::default(), None);
        report.packages.insert("torch".into(), true);
        report.packages.insert("trl".into(), false);
        let text = report.to_string();
        assert!(text.contains("CUDA available: false"));
        assert!(text.contains("CRITICAL: CUDA is NOT available"));
        assert!(text.contains("matches your CUDA driver"));
        assert!(text.contains("trl: missing"));
        assert_eq!(report.missing_packages(), vec!["trl"]);
    }
}
