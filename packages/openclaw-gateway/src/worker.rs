//! CLI worker process launch: environment whitelist, mode-dependent
//! arguments, payload delivery over stdin.
//!
//! Workers inherit nothing from the parent environment except an explicit
//! allow-list. Stripping the rest keeps a worker from detecting the
//! gateway as a live parent session and aborting; the neutralizing
//! variables disable telemetry, auto-updates and interactive terminal
//! behavior.

use std::collections::HashMap;
use std::process::Stdio;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::config::{TokenKind, WorkerSpec};
use crate::error::GatewayError;
use crate::openai::ModelFamily;
use crate::registry::WorkerMode;

/// Variables copied through from the parent environment, and nothing else.
pub const ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "LANG",
    "LC_ALL",
    "TZ",
    "TMPDIR",
    "XDG_CONFIG_HOME",
    "XDG_CACHE_HOME",
    "XDG_DATA_HOME",
];

/// Variables forced onto every worker.
const NEUTRAL_ENV: &[(&str, &str)] = &[
    ("TERM", "dumb"),
    ("NO_COLOR", "1"),
    ("FORCE_COLOR", "0"),
    ("CI", "1"),
    ("DISABLE_TELEMETRY", "1"),
    ("DISABLE_ERROR_REPORTING", "1"),
    ("DISABLE_AUTOUPDATER", "1"),
];

pub struct WorkerLauncher {
    specs: HashMap<String, WorkerSpec>,
    names: Vec<String>,
}

impl WorkerLauncher {
    pub fn new(specs: Vec<WorkerSpec>) -> Self {
        let names = specs.iter().map(|s| s.name.clone()).collect();
        let specs = specs.into_iter().map(|s| (s.name.clone(), s)).collect();
        Self { specs, names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn spec(&self, name: &str) -> Option<&WorkerSpec> {
        self.specs.get(name)
    }

    /// Spawn a worker child with piped stdio. The caller writes the payload
    /// and owns the child's lifecycle from here on.
    pub fn spawn(
        &self,
        worker: &str,
        model: ModelFamily,
        mode: WorkerMode,
    ) -> Result<Child, GatewayError> {
        let spec = self
            .specs
            .get(worker)
            .ok_or_else(|| GatewayError::Config(format!("unknown worker: {worker}")))?;

        let mut cmd = Command::new(&spec.bin);
        cmd.arg("-p").arg("--model").arg(model.as_str());
        match mode {
            WorkerMode::Stream => {
                cmd.args(["--output-format", "stream-json", "--verbose"]);
            }
            WorkerMode::Sync => {
                cmd.args(["--output-format", "json"]);
            }
        }

        cmd.env_clear();
        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in NEUTRAL_ENV {
            cmd.env(key, value);
        }
        if let Some(token) = &spec.token {
            match spec.token_kind {
                TokenKind::Flat => cmd.env("CLAUDE_CODE_OAUTH_TOKEN", token),
                TokenKind::Metered => cmd.env("ANTHROPIC_API_KEY", token),
            };
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(GatewayError::Spawn)?;
        debug!(
            worker,
            model = model.as_str(),
            pid = child.id().unwrap_or(0),
            "worker process spawned"
        );
        Ok(child)
    }
}

/// Write the request payload and close stdin so the worker starts.
pub async fn write_payload(child: &mut Child, payload: &str) -> std::io::Result<()> {
    let mut stdin = child.stdin.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stdin not captured")
    })?;
    stdin.write_all(payload.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.shutdown().await?;
    Ok(())
}

/// Full payload written to a worker's input stream.
pub fn build_payload(system: Option<&str>, prompt: &str) -> String {
    match system.filter(|s| !s.is_empty()) {
        Some(system) => {
            format!("[System Instructions]\n{system}\n\n[User Request]\n{prompt}")
        }
        None => prompt.to_string(),
    }
}

/// TERM a worker by pid. Failure is non-fatal (the child may already be
/// gone).
pub fn terminate(pid: u32) {
    if pid == 0 {
        return;
    }
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(bin: &str) -> WorkerSpec {
        WorkerSpec {
            name: "w1".to_string(),
            bin: bin.to_string(),
            token: Some("secret".to_string()),
            token_kind: TokenKind::Metered,
        }
    }

    #[test]
    fn payload_includes_system_section_when_present() {
        let payload = build_payload(Some("be terse"), "hello");
        assert_eq!(
            payload,
            "[System Instructions]\nbe terse\n\n[User Request]\nhello"
        );
        assert_eq!(build_payload(None, "hello"), "hello");
        assert_eq!(build_payload(Some(""), "hello"), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_worker_sees_only_whitelisted_env() {
        std::env::set_var("OPENCLAW_TEST_SECRET", "leak-me");
        // A stub worker that drains stdin and dumps its environment.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("worker.sh");
        std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\nenv\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let launcher = WorkerLauncher::new(vec![spec(script.to_str().unwrap())]);
        let mut child = launcher
            .spawn("w1", ModelFamily::Sonnet, WorkerMode::Stream)
            .unwrap();
        write_payload(&mut child, "ping").await.unwrap();
        let output = child.wait_with_output().await.unwrap();
        let env_dump = String::from_utf8_lossy(&output.stdout);

        assert!(env_dump.contains("ANTHROPIC_API_KEY=secret"));
        assert!(env_dump.contains("TERM=dumb"));
        assert!(env_dump.contains("NO_COLOR=1"));
        assert!(env_dump.contains("PATH="));
        assert!(!env_dump.contains("OPENCLAW_TEST_SECRET"));
    }

    #[test]
    fn unknown_worker_is_a_config_error() {
        let launcher = WorkerLauncher::new(vec![]);
        assert!(matches!(
            launcher.spawn("nope", ModelFamily::Opus, WorkerMode::Sync),
            Err(GatewayError::Config(_))
        ));
    }
}
