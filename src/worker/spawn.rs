//! Worker subprocess spawning.
//!
//! A worker is any executable that speaks the line protocol in
//! [`super::protocol`] on stdin/stdout. By default that is this binary's
//! hidden `worker` subcommand.

use super::proc::Proc;
use crate::error::{InterpError, Result};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Environment variable telling a worker its slot in the pool.
pub const WORKER_ID_ENV: &str = "BALLOT_INTERP_WORKER_ID";

/// How to start one worker process: the interpretation entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Executable implementing the worker protocol.
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Extra environment for the child, on top of the parent's.
    pub env: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// This binary in worker mode, hosting the named built-in entry point.
    pub fn current_exe(entry: &str) -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| InterpError::Worker(format!("Failed to get current executable: {}", e)))?;
        Ok(Self::new(exe).arg("worker").arg("--entry").arg(entry))
    }

    pub fn describe(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

/// Spawn one worker subprocess for pool slot `worker_id`.
pub fn spawn_worker(command: &WorkerCommand, worker_id: usize) -> Result<Proc> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);
    cmd.envs(command.env.iter().map(|(k, v)| (k, v)));
    cmd.env(WORKER_ID_ENV, worker_id.to_string());

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    // Worker logs and panic messages go to the parent's stderr.
    cmd.stderr(Stdio::inherit());

    let child = cmd.spawn().map_err(|e| {
        InterpError::Worker(format!(
            "Failed to spawn worker {} ({}): {}",
            worker_id,
            command.program.display(),
            e
        ))
    })?;

    Proc::from_child(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::protocol::WorkResponse;
    use std::time::Duration;

    #[test]
    fn test_describe() {
        let cmd = WorkerCommand::new("/usr/bin/interp").arg("worker").arg("--fast");
        assert_eq!(cmd.describe(), "/usr/bin/interp worker --fast");
    }

    #[test]
    fn test_current_exe_uses_worker_subcommand() {
        let cmd = WorkerCommand::current_exe("replay").unwrap();
        assert_eq!(cmd.args, vec!["worker", "--entry", "replay"]);
    }

    #[test]
    fn test_spawn_passes_worker_id() {
        let cmd = WorkerCommand::new("sh")
            .arg("-c")
            .arg(format!(
                r#"if [ "${}" = "5" ]; then echo '{{"type":"ready"}}'; fi"#,
                WORKER_ID_ENV
            ));
        let mut proc = spawn_worker(&cmd, 5).unwrap();
        assert_eq!(proc.recv().unwrap(), Some(WorkResponse::Ready));
        proc.stop(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_spawn_missing_program() {
        let cmd = WorkerCommand::new("/nonexistent/ballot-worker");
        let err = spawn_worker(&cmd, 0).err().unwrap();
        assert!(err.to_string().contains("Failed to spawn worker 0"));
    }
}
