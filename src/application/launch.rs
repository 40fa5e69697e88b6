//! Session launch descriptor: turns a variant into a concrete subprocess plan.

use crate::config::AppConfig;
use crate::domain::variant::VariantDescriptor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Everything needed to spawn one tool-server subprocess.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    /// Program actually executed. The launcher script is run through `bash`
    /// so it does not need the executable bit.
    pub program: String,
    /// `[script, dataset_key?]`
    pub args: Vec<String>,
    /// Environment overrides for the child; always pins the interpreter.
    pub env: Vec<(String, String)>,
    /// Bounds the handshake and each individual tool call.
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("tool-server launcher not found: {path}")]
    TargetMissing { path: PathBuf },
}

/// Resolve the subprocess plan for a variant.
///
/// Fails before any spawn side effect when the launcher script does not
/// exist on disk.
pub fn resolve(variant: &VariantDescriptor, config: &AppConfig) -> Result<LaunchPlan, LaunchError> {
    resolve_with(variant, config, Path::exists)
}

fn resolve_with(
    variant: &VariantDescriptor,
    config: &AppConfig,
    exists: impl Fn(&Path) -> bool,
) -> Result<LaunchPlan, LaunchError> {
    let script = &config.launcher;
    if !exists(script) {
        return Err(LaunchError::TargetMissing {
            path: script.clone(),
        });
    }

    let mut args = vec![script.to_string_lossy().into_owned()];
    if let Some(key) = &variant.launch_key {
        args.push(key.clone());
    }

    Ok(LaunchPlan {
        program: "bash".to_string(),
        args,
        env: vec![("PYTHON".to_string(), interpreter_identity(config))],
        timeout: config.session_timeout,
    })
}

/// The interpreter the child must use. Explicit config wins, then the
/// parent's own environment (`PYTHON`, then the active virtualenv), then the
/// conventional `python3`. Always exported so parent and child cannot drift.
fn interpreter_identity(config: &AppConfig) -> String {
    if let Some(python) = &config.python {
        return python.clone();
    }
    if let Ok(python) = std::env::var("PYTHON") {
        if !python.trim().is_empty() {
            return python;
        }
    }
    if let Ok(venv) = std::env::var("VIRTUAL_ENV") {
        if !venv.trim().is_empty() {
            return format!("{}/bin/python", venv.trim_end_matches('/'));
        }
    }
    "python3".to_string()
}
