//! Capture by running an external screenshot command.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use crate::config::CaptureConfig;
use crate::error::{Error, Result};
use crate::types::RawCapture;

use super::CaptureSource;

const PATH_PLACEHOLDER: &str = "{path}";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs a screenshot command that writes an image to `{path}`, then reads it back.
///
/// A command still running after the timeout is killed and the capture fails.
pub struct CommandCaptureSource {
    program: String,
    args: Vec<String>,
    scratch_dir: PathBuf,
    timeout: Duration,
}

impl CommandCaptureSource {
    pub fn new(command: Vec<String>, scratch_dir: PathBuf) -> Result<Self> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("capture.command must name a program".to_string()))?;
        let args: Vec<String> = parts.collect();
        if !args.iter().any(|a| a.contains(PATH_PLACEHOLDER)) {
            return Err(Error::Config(format!(
                "capture.command must contain a {} argument",
                PATH_PLACEHOLDER
            )));
        }

        std::fs::create_dir_all(&scratch_dir)?;

        Ok(Self {
            program,
            args,
            scratch_dir,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build from config, falling back to the platform's usual screenshot tool.
    pub fn from_config(config: &CaptureConfig, scratch_dir: PathBuf) -> Result<Self> {
        let command = config.command.clone().unwrap_or_else(default_command);
        Ok(Self::new(command, scratch_dir)?.with_timeout(config.timeout()))
    }
}

/// Wait for `child` until `deadline`. `None` means it is still running.
fn wait_until(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn default_command() -> Vec<String> {
    let parts: &[&str] = if cfg!(target_os = "macos") {
        &["screencapture", "-x", "-t", "png", PATH_PLACEHOLDER]
    } else {
        &["grim", PATH_PLACEHOLDER]
    };
    parts.iter().map(|s| s.to_string()).collect()
}

impl CaptureSource for CommandCaptureSource {
    fn capture(&self) -> Result<RawCapture> {
        let path = self.scratch_dir.join(format!("capture-{}.png", Uuid::new_v4()));
        let path_str = path.to_string_lossy().to_string();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(PATH_PLACEHOLDER, &path_str))
            .collect();

        let captured_at = Utc::now();
        let deadline = Instant::now() + self.timeout;
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Capture(format!("failed to run {}: {}", self.program, e)))?;

        let status = match wait_until(&mut child, deadline) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = std::fs::remove_file(&path);
                return Err(Error::Capture(format!(
                    "{} timed out after {:?} and was killed",
                    self.program, self.timeout
                )));
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = std::fs::remove_file(&path);
                return Err(Error::Capture(format!("failed to wait for {}: {}", self.program, e)));
            }
        };

        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            let _ = std::fs::remove_file(&path);
            return Err(Error::Capture(format!(
                "{} exited with {}: {}",
                self.program,
                status,
                stderr.trim()
            )));
        }

        let bytes = std::fs::read(&path)
            .map_err(|e| Error::Capture(format!("screenshot not written to {}: {}", path_str, e)));
        // The scratch file is never needed again, whatever the read outcome.
        let _ = std::fs::remove_file(&path);
        let bytes = bytes?;

        if bytes.is_empty() {
            return Err(Error::Capture("screenshot file was empty".to_string()));
        }

        Ok(RawCapture { captured_at, bytes })
    }
}
