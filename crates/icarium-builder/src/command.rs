//! External tool invocation.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Bytes of stderr kept in a failure message.
const STDERR_TAIL: usize = 4096;

/// One invocation of an external tool (git, docker).
///
/// `Debug` lists environment keys only, since values may carry credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl std::fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("current_dir", &self.current_dir)
            .field("env", &self.env.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {}: {stderr}", describe_status(.status))]
    Failed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
}

/// Runs external tools to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command`, failing on a non-zero exit.
    async fn run(&self, command: &ToolCommand) -> Result<(), CommandError>;
}

/// Runs tools as child processes.
///
/// Children are killed if the returned future is dropped, so a timed-out
/// build does not leave a process writing into a deleted workspace.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &ToolCommand) -> Result<(), CommandError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        debug!(program = %command.program, "Running external command");

        let output = cmd.output().await.map_err(|source| CommandError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CommandError::Failed {
                program: command.program.clone(),
                status: output.status.code(),
                stderr: tail(stderr.trim(), STDERR_TAIL).to_string(),
            });
        }

        Ok(())
    }
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "signal".to_string(),
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let cmd = ToolCommand::new("git")
            .arg("checkout")
            .args(["--detach", "abc123"])
            .current_dir("/tmp/ws")
            .env("GIT_TERMINAL_PROMPT", "0");

        assert_eq!(cmd.program, "git");
        assert_eq!(cmd.args, vec!["checkout", "--detach", "abc123"]);
        assert_eq!(cmd.current_dir, Some(PathBuf::from("/tmp/ws")));
        assert_eq!(cmd.env.len(), 1);
    }

    #[test]
    fn test_debug_hides_env_values() {
        let cmd = ToolCommand::new("git").env("ICARIUM_GIT_TOKEN", "ghp_secret");
        let debug = format!("{:?}", cmd);
        assert!(debug.contains("ICARIUM_GIT_TOKEN"));
        assert!(!debug.contains("ghp_secret"));
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello", 3), "llo");
        assert_eq!(tail("aé", 1), "");
    }

    #[test]
    fn test_failed_display() {
        let err = CommandError::Failed {
            program: "docker".to_string(),
            status: Some(1),
            stderr: "no such image".to_string(),
        };
        assert_eq!(err.to_string(), "docker exited with status 1: no such image");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_success() {
        let cmd = ToolCommand::new("sh").args(["-c", "exit 0"]);
        assert!(ProcessRunner.run(&cmd).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_failure() {
        let cmd = ToolCommand::new("sh").args(["-c", "echo boom >&2; exit 3"]);
        match ProcessRunner.run(&cmd).await {
            Err(CommandError::Failed { status, stderr, .. }) => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_process_runner_missing_program() {
        let cmd = ToolCommand::new("icarium-definitely-not-a-program");
        assert!(matches!(
            ProcessRunner.run(&cmd).await,
            Err(CommandError::Spawn { .. })
        ));
    }
}
