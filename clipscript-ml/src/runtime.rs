//! Python runtime manager for the ML workers.
//!
//! Training, generation and the torch device probe run as short Python worker
//! scripts on top of `transformers`/`peft`/`trl`. A worker receives a JSON
//! document on stdin and prints a single JSON line on stdout; everything else
//! it writes (framework logs, progress bars) goes to stderr, which is passed
//! straight through to the operator's terminal.

use crate::error::MlError;
use clipscript_core::config::PythonConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Information about the detected Python installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonInfo {
    pub path: PathBuf,
    pub version: String,
    pub venv_path: Option<PathBuf>,
}

/// Managed Python subprocess runner.
#[derive(Debug, Clone)]
pub struct PythonRuntime {
    python_path: PathBuf,
    venv_path: Option<PathBuf>,
    workspace: PathBuf,
}

impl PythonRuntime {
    /// Create a runtime using `python3` from `PATH`.
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            python_path: PathBuf::from("python3"),
            venv_path: None,
            workspace,
        }
    }

    /// Create from the `[python]` config section, falling back to a
    /// virtualenv found in the workspace.
    pub fn from_config(config: &PythonConfig, workspace: PathBuf) -> Self {
        let venv_path = config
            .venv_path
            .clone()
            .or_else(|| detect_venv(&workspace));
        Self {
            python_path: config
                .python_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("python3")),
            venv_path,
            workspace,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Resolve a configured path against the workspace.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.workspace.join(path)
    }

    /// Detect an available Python installation on `PATH`.
    pub async fn detect() -> Result<PythonInfo, MlError> {
        for cmd in &["python3", "python"] {
            if let Some(version) = python_version(Path::new(cmd)).await {
                return Ok(PythonInfo {
                    path: PathBuf::from(cmd),
                    version,
                    venv_path: std::env::var("VIRTUAL_ENV").ok().map(PathBuf::from),
                });
            }
        }

        Err(MlError::python(
            "Python not found. Install Python 3.9+ with torch, transformers, peft and trl.",
        ))
    }

    /// Version string of the configured interpreter, if it runs.
    pub async fn version(&self) -> Option<String> {
        python_version(&self.python_cmd()).await
    }

    /// Get the effective Python command (accounting for venv).
    fn python_cmd(&self) -> PathBuf {
        if let Some(venv) = &self.venv_path {
            let bin_dir = if cfg!(windows) { "Scripts" } else { "bin" };
            venv.join(bin_dir).join("python")
        } else {
            self.python_path.clone()
        }
    }

    /// Run a worker script with JSON input/output.
    ///
    /// `timeout` of `None` lets the worker run to completion.
    pub async fn run_worker(
        &self,
        script: &str,
        input: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, MlError> {
        let input_json = serde_json::to_vec(input)?;

        debug!(
            python = %self.python_cmd().display(),
            script_len = script.len(),
            "Running Python worker"
        );

        let mut child = Command::new(self.python_cmd())
            .args(["-c", script])
            .current_dir(&self.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MlError::python(format!("Failed to spawn Python: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| MlError::python("Worker stdin unavailable"))?;
        // A worker that exits before reading its input reports through its exit status.
        if let Err(e) = stdin.write_all(&input_json).await {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e.into());
            }
        }
        drop(stdin);

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    MlError::Timeout(format!(
                        "Python worker timed out after {}s",
                        limit.as_secs()
                    ))
                })??,
            None => child.wait_with_output().await?,
        };

        if !output.status.success() {
            return Err(MlError::python(format!(
                "Python worker failed ({}), see output above",
                output.status
            )));
        }

        parse_worker_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// Check which packages are importable.
    pub async fn check_packages(&self, packages: &[&str]) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();

        for pkg in packages {
            let script = format!("import importlib; importlib.import_module('{pkg}')");
            let available = Command::new(self.python_cmd())
                .args(["-c", &script])
                .current_dir(&self.workspace)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .is_ok_and(|s| s.success());

            results.insert(pkg.to_string(), available);
        }

        results
    }
}

async fn python_version(cmd: &Path) -> Option<String> {
    let output = Command::new(cmd).arg("--version").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    // Python 2 printed its version on stderr.
    if version.is_empty() {
        Some(String::from_utf8_lossy(&output.stderr).trim().to_string())
    } else {
        Some(version)
    }
}

/// Take the last non-empty stdout line as the worker's JSON result.
pub fn parse_worker_output(stdout: &str) -> Result<serde_json::Value, MlError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| MlError::python("Worker produced no output"))?;
    serde_json::from_str(line).map_err(|e| MlError::python(format!("Invalid JSON output: {e}")))
}

/// Detect a virtual environment from `VIRTUAL_ENV` or the workspace.
fn detect_venv(workspace: &Path) -> Option<PathBuf> {
    if let Ok(venv) = std::env::var("VIRTUAL_ENV") {
        let path = PathBuf::from(venv);
        if path.exists() {
            return Some(path);
        }
    }

    [".venv", "venv"]
        .iter()
        .map(|name| workspace.join(name))
        .find(|path| path.join("pyvenv.cfg").exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_worker_output_takes_last_line() {
        let stdout = "Loading checkpoint shards: 100%\n{\"ok\": true}\n\n";
        let value = parse_worker_output(stdout).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn test_parse_worker_output_empty() {
        assert!(parse_worker_output("  \n").is_err());
        assert!(parse_worker_output("not json").is_err());
    }

    #[test]
    fn test_venv_detected_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let venv = dir.path().join(".venv");
        std::fs::create_dir_all(&venv).unwrap();
        std::fs::write(venv.join("pyvenv.cfg"), "home = /usr/bin\n").unwrap();

        let runtime = PythonRuntime::from_config(&PythonConfig::default(), dir.path().into());
        if std::env::var("VIRTUAL_ENV").is_err() {
            assert!(runtime.python_cmd().starts_with(&venv));
        }
    }

    #[test]
    fn test_explicit_python_path_used() {
        let config = PythonConfig {
            python_path: Some(PathBuf::from("/opt/py/bin/python3.11")),
            venv_path: None,
        };
        let dir = tempfile::tempdir().unwrap();
        let runtime = PythonRuntime::from_config(&config, dir.path().into());
        if std::env::var("VIRTUAL_ENV").is_err() {
            assert_eq!(runtime.python_cmd(), PathBuf::from("/opt/py/bin/python3.11"));
        }
    }

    #[tokio::test]
    async fn test_run_worker_echo() {
        // Python may or may not be available in CI.
        let Ok(info) = PythonRuntime::detect().await else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let runtime = PythonRuntime {
            python_path: info.path,
            venv_path: None,
            workspace: dir.path().into(),
        };
        let script = "import json, sys\npayload = json.load(sys.stdin)\nprint('noise')\nprint(json.dumps({'echo': payload['x']}))";
        let value = runtime
            .run_worker(script, &serde_json::json!({"x": 7}), Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(value["echo"], 7);
    }

    #[tokio::test]
    async fn test_run_worker_failure_is_error() {
        let Ok(info) = PythonRuntime::detect().await else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let runtime = PythonRuntime {
            python_path: info.path,
            venv_path: None,
            workspace: dir.path().into(),
        };
        let err = runtime
            .run_worker("import sys; sys.exit(3)", &serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::Python(_)));
    }
}
