//! llama.cpp binary inventory
//!
//! Probes the configured candidate paths (plus `llama-server` on PATH) for
//! usable inference binaries. The inventory is refreshed every minute or on
//! explicit invalidation, not on every monitor tick.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::node::types::{LlamaBackend, LlamaBinary};

/// Timeout for a `--version` probe
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Classify the acceleration backend of a binary from its path and version
/// output
///
/// llama.cpp builds advertise their backend either in the binary name
/// (`llama-server-cuda`) or in the `--version` banner (`build: ... CUDA`).
pub fn classify_backend(path: &str, version_output: &str) -> LlamaBackend {
    let haystack = format!("{} {}", path, version_output).to_lowercase();

    if haystack.contains("cuda") {
        LlamaBackend::Cuda
    } else if haystack.contains("rocm") || haystack.contains("hip") {
        LlamaBackend::Rocm
    } else if haystack.contains("vulkan") {
        LlamaBackend::Vulkan
    } else if haystack.contains("metal") {
        LlamaBackend::Metal
    } else {
        LlamaBackend::Cpu
    }
}

/// Extract a version string from `--version` output
///
/// llama.cpp prints lines like `version: 4067 (54ef9cfc)`.
pub fn parse_version(output: &str) -> String {
    for line in output.lines() {
        if let Some(rest) = line.trim().strip_prefix("version:") {
            return rest.trim().to_string();
        }
    }
    output.lines().next().unwrap_or("").trim().to_string()
}

/// Check that a path names a regular, executable file
pub fn is_executable_file(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Probe one candidate path
///
/// A missing or non-executable file yields an unavailable record so that
/// configured-but-absent binaries remain visible in the inventory.
pub async fn probe_binary(path: &str, gpu_memory_bytes: u64) -> LlamaBinary {
    let p = Path::new(path);
    if !is_executable_file(p) {
        return LlamaBinary {
            path: path.to_string(),
            version: String::new(),
            backend: classify_backend(path, ""),
            max_vram_bytes: 0,
            supports_gpu: false,
            available: false,
        };
    }

    let version_output = run_version_probe(path).await.unwrap_or_default();
    let backend = classify_backend(path, &version_output);
    let supports_gpu = backend != LlamaBackend::Cpu;

    LlamaBinary {
        path: path.to_string(),
        version: parse_version(&version_output),
        backend,
        max_vram_bytes: if supports_gpu { gpu_memory_bytes } else { 0 },
        supports_gpu,
        available: true,
    }
}

async fn run_version_probe(path: &str) -> Option<String> {
    let output = Command::new(path)
        .arg("--version")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    match tokio::time::timeout(VERSION_PROBE_TIMEOUT, output).await {
        Ok(Ok(out)) => {
            // llama.cpp historically printed the banner on stderr
            let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&out.stderr));
            Some(text)
        }
        Ok(Err(e)) => {
            debug!("version probe for {} failed: {}", path, e);
            None
        }
        Err(_) => {
            debug!("version probe for {} timed out", path);
            None
        }
    }
}

/// Probe all candidate paths plus `llama-server` on PATH
pub async fn detect_binaries(candidates: &[String], gpu_memory_bytes: u64) -> Vec<LlamaBinary> {
    let mut paths: Vec<String> = candidates.to_vec();

    if let Ok(out) = Command::new("which").arg("llama-server").output().await {
        if out.status.success() {
            let found = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if !found.is_empty() && !paths.contains(&found) {
                paths.push(found);
            }
        }
    }

    let mut binaries = Vec::with_capacity(paths.len());
    for path in &paths {
        binaries.push(probe_binary(path, gpu_memory_bytes).await);
    }
    binaries
}
