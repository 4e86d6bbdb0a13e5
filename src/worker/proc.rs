//! Process handle for worker subprocesses.
//!
//! Wraps a child process with its request/response pipes.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{WorkRequest, WorkResponse};
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{InterpError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::unix::io::OwnedFd;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to a worker subprocess with IPC channels.
pub struct Proc {
    pid: Pid,
    writer: LineWriter,
    reader: LineReader,
    /// Exit status once the process has been reaped.
    status: Option<WaitStatus>,
}

impl Proc {
    pub fn new(pid: Pid, stdin: PipeFd, stdout: PipeFd) -> Self {
        Self {
            pid,
            writer: LineWriter::new(stdin),
            reader: LineReader::new(stdout),
            status: None,
        }
    }

    /// Take ownership of a spawned child's stdin and stdout.
    pub fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| InterpError::Worker("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InterpError::Worker("Child stdout not captured".into()))?;

        // Reaping goes through waitpid from here on; the Child is not waited on.
        Ok(Self::new(
            pid,
            PipeFd::new(OwnedFd::from(stdin)),
            PipeFd::new(OwnedFd::from(stdout)),
        ))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn send(&mut self, request: &WorkRequest) -> Result<()> {
        let line = request.to_line()?;
        self.writer
            .write_line(&line)
            .map_err(|e| InterpError::Worker(format!("Failed to send to worker: {}", e)))
    }

    /// Receive the next response. `None` once the worker closed its stdout.
    pub fn recv(&mut self) -> Result<Option<WorkResponse>> {
        match self.reader.read_line() {
            Ok(Some(line)) => {
                let response = WorkResponse::from_line(line)
                    .map_err(|e| InterpError::Worker(format!("Invalid worker response: {}", e)))?;
                Ok(Some(response))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(InterpError::Worker(format!(
                "Failed to receive from worker: {}",
                e
            ))),
        }
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Non-blocking reap. `None` while the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.status = Some(status);
                Ok(Some(status))
            }
            Err(e) => Err(InterpError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Poll for exit until `timeout` elapses.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<WaitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn terminate(&self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| InterpError::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    /// SIGKILL and reap.
    pub fn kill(&mut self) -> Result<WaitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| InterpError::Worker(format!("Failed to send SIGKILL: {}", e)))?;
        let status = waitpid(self.pid, None)
            .map_err(|e| InterpError::Worker(format!("waitpid failed: {}", e)))?;
        self.status = Some(status);
        Ok(status)
    }

    /// Work out why a worker stopped answering.
    ///
    /// Called after its stdout hit EOF. Gives the process `grace` to finish
    /// exiting; one that keeps running without an output pipe is killed.
    pub fn diagnose_exit(&mut self, grace: Duration) -> TerminationReason {
        match self.wait_timeout(grace) {
            Ok(Some(status)) => analyze_wait_status(status),
            Ok(None) => {
                let _ = self.kill();
                TerminationReason::ClosedOutput
            }
            Err(_) => TerminationReason::Unknown,
        }
    }

    /// Graceful stop: send `exit`, wait, then SIGTERM, then SIGKILL.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }

        let _ = self.send(&WorkRequest::Exit);
        if self.wait_timeout(timeout)?.is_some() {
            return Ok(());
        }

        let _ = self.terminate();
        if self.wait_timeout(Duration::from_millis(100))?.is_some() {
            return Ok(());
        }

        self.kill().map(|_| ())
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.status.is_none() {
            let _ = self.terminate();
            if let Ok(Some(_)) = self.wait_timeout(POLL_INTERVAL) {
                return;
            }
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn_sh(script: &str) -> Proc {
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn sh");
        Proc::from_child(child).expect("Failed to create Proc")
    }

    #[test]
    fn test_ready_then_stop() {
        let mut proc = spawn_sh(r#"echo '{"type":"ready"}'; exec cat > /dev/null"#);
        assert_eq!(proc.recv().unwrap(), Some(WorkResponse::Ready));
        assert!(proc.is_running());

        proc.stop(Duration::from_secs(1)).expect("Failed to stop");
        assert!(!proc.is_running());
    }

    #[test]
    fn test_eof_after_exit_code() {
        let mut proc = spawn_sh("exit 4");
        assert_eq!(proc.recv().unwrap(), None);
        assert_eq!(
            proc.diagnose_exit(Duration::from_secs(2)),
            TerminationReason::Exited(4)
        );
    }

    #[test]
    fn test_closed_output_is_killed() {
        let mut proc = spawn_sh("exec 1>&-; exec sleep 30");
        assert_eq!(proc.recv().unwrap(), None);
        assert_eq!(
            proc.diagnose_exit(Duration::from_millis(200)),
            TerminationReason::ClosedOutput
        );
        assert!(!proc.is_running());
    }

    #[test]
    fn test_invalid_response_is_error() {
        let mut proc = spawn_sh("echo 'not json'; cat > /dev/null");
        assert!(proc.recv().is_err());
    }

    #[test]
    fn test_terminate() {
        let mut proc = spawn_sh("sleep 60");
        proc.terminate().expect("Failed to terminate");
        let status = proc.wait_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(status, Some(WaitStatus::Signaled(_, Signal::SIGTERM, _))));
    }
}
