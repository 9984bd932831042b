//! What the agent does with a fully received artifact.
//!
//! [`DiskArtifactHandler`] stores every artifact under
//! `<workplace>/scriptfiles/`. When it has a [`ScriptLauncher`] it also runs
//! scripts and binaries, with output captured to `<workplace>/logs/`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex::Regex;

use crate::error::AgentError;
use crate::protocol::ScriptKind;
use crate::reassembly::{ArtifactKind, CompletedArtifact};

pub const SCRIPT_DIR: &str = "scriptfiles";
pub const LOG_DIR: &str = "logs";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Replace everything but word characters, `.` and `-` with `_`.
pub fn sanitize_name(raw: &str) -> String {
    static UNSAFE: OnceLock<Option<Regex>> = OnceLock::new();
    let cleaned = match UNSAFE.get_or_init(|| Regex::new(r"[^\w.-]").ok()) {
        Some(re) => re.replace_all(raw.trim(), "_").into_owned(),
        None => raw
            .trim()
            .chars()
            .map(|c| if c.is_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '_' })
            .collect(),
    };
    if cleaned.trim_matches('.').is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub path: PathBuf,
    /// Process id when the artifact was launched.
    pub pid: Option<u32>,
}

pub trait ArtifactHandler: Send + Sync {
    fn handle(&self, artifact: &CompletedArtifact) -> Result<StoredArtifact, AgentError>;
}

/// A command line ready to run, with its output destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub log_path: PathBuf,
}

pub trait ScriptLauncher: Send + Sync {
    fn launch(&self, plan: &LaunchPlan) -> Result<Option<u32>, AgentError>;
}

/// Build the command line for an artifact. `text` artifacts are never run.
pub fn launch_plan(
    kind: ArtifactKind,
    path: &Path,
    payload: &[u8],
    log_path: PathBuf,
) -> Option<LaunchPlan> {
    let file = path.display().to_string();
    let (program, args): (&str, Vec<String>) = match kind {
        ArtifactKind::Binary => (file.as_str(), Vec::new()),
        ArtifactKind::Script(ScriptKind::Text) => return None,
        ArtifactKind::Script(ScriptKind::PowerShell) => (
            "powershell",
            vec![
                "-NoProfile".into(),
                "-ExecutionPolicy".into(),
                "Bypass".into(),
                "-File".into(),
                file.clone(),
            ],
        ),
        ArtifactKind::Script(ScriptKind::PowerShellBase64) => (
            "powershell",
            vec![
                "-NoProfile".into(),
                "-ExecutionPolicy".into(),
                "Bypass".into(),
                "-EncodedCommand".into(),
                encode_powershell_command(payload),
            ],
        ),
        ArtifactKind::Script(ScriptKind::Bat) => ("cmd", vec!["/C".into(), file.clone()]),
        ArtifactKind::Script(ScriptKind::Python) => {
            let python = if cfg!(windows) { "python" } else { "python3" };
            (python, vec![file.clone()])
        }
        ArtifactKind::Script(ScriptKind::LinuxShell) => ("sh", vec![file.clone()]),
    };
    Some(LaunchPlan {
        program: program.to_string(),
        args,
        log_path,
    })
}

/// `-EncodedCommand` takes base64 over UTF-16LE.
pub fn encode_powershell_command(script: &[u8]) -> String {
    let text = String::from_utf8_lossy(script);
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
    let utf16: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
    STANDARD.encode(utf16)
}

/// Spawns the command as a child process and does not wait for it.
pub struct ProcessLauncher;

impl ScriptLauncher for ProcessLauncher {
    fn launch(&self, plan: &LaunchPlan) -> Result<Option<u32>, AgentError> {
        let io_error = |source| AgentError::Io {
            path: plan.log_path.clone(),
            source,
        };
        let stdout = File::create(&plan.log_path).map_err(io_error)?;
        let stderr = stdout.try_clone().map_err(io_error)?;
        let child = tokio::process::Command::new(&plan.program)
            .args(&plan.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| AgentError::Io {
                path: PathBuf::from(&plan.program),
                source,
            })?;
        Ok(child.id())
    }
}

pub struct DiskArtifactHandler {
    workplace: PathBuf,
    launcher: Option<Arc<dyn ScriptLauncher>>,
}

impl DiskArtifactHandler {
    /// Store artifacts without running them.
    pub fn new(workplace: impl Into<PathBuf>) -> Self {
        Self {
            workplace: workplace.into(),
            launcher: None,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ScriptLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn script_dir(&self) -> PathBuf {
        self.workplace.join(SCRIPT_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.workplace.join(LOG_DIR)
    }

    fn store(&self, name: &str, kind: ArtifactKind, payload: &[u8]) -> Result<PathBuf, AgentError> {
        let dir = self.script_dir();
        fs::create_dir_all(&dir).map_err(|source| AgentError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(name);
        let needs_bom = matches!(
            kind,
            ArtifactKind::Script(ScriptKind::PowerShell | ScriptKind::Bat)
        ) && !payload.starts_with(UTF8_BOM);
        let body = if needs_bom {
            [UTF8_BOM, payload].concat()
        } else {
            payload.to_vec()
        };
        fs::write(&path, body).map_err(|source| AgentError::Io {
            path: path.clone(),
            source,
        })?;

        #[cfg(unix)]
        if kind == ArtifactKind::Binary {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).map_err(|source| {
                AgentError::Io {
                    path: path.clone(),
                    source,
                }
            })?;
        }
        Ok(path)
    }
}

impl ArtifactHandler for DiskArtifactHandler {
    fn handle(&self, artifact: &CompletedArtifact) -> Result<StoredArtifact, AgentError> {
        let name = sanitize_name(&artifact.name);
        let path = self.store(&name, artifact.kind, &artifact.payload)?;
        tracing::info!(
            target = "fleet_control::agent",
            artifact = %name,
            bytes = artifact.payload.len(),
            path = %path.display(),
            "artifact stored"
        );

        let Some(launcher) = &self.launcher else {
            return Ok(StoredArtifact { path, pid: None });
        };
        let log_dir = self.log_dir();
        let Some(plan) = launch_plan(
            artifact.kind,
            &path,
            &artifact.payload,
            log_dir.join(format!("{name}.log")),
        ) else {
            return Ok(StoredArtifact { path, pid: None });
        };
        fs::create_dir_all(&log_dir).map_err(|source| AgentError::Io {
            path: log_dir.clone(),
            source,
        })?;
        let pid = launcher.launch(&plan)?;
        tracing::info!(
            target = "fleet_control::agent",
            artifact = %name,
            program = %plan.program,
            pid = ?pid,
            "artifact launched"
        );
        Ok(StoredArtifact { path, pid })
    }
}
