//! Crash analysis for worker subprocesses.
//!
//! Turns a wait status into a reason that callers can report alongside the
//! failed job.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::fmt;

/// Reason why a worker process stopped serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal other than the ones classified below.
    Signaled(Signal),
    /// SIGKILL, usually from the OOM killer or a forced shutdown.
    Killed,
    /// SIGSEGV (stack overflow on Linux) or SIGBUS (on macOS).
    StackOverflow,
    /// SIGABRT, typically a Rust panic in a `panic = "abort"` build.
    Aborted,
    /// Stdout closed while the process kept running; the pool killed it.
    ClosedOutput,
    /// The worker could not be (re)started.
    Unavailable(String),
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::Killed => "killed by SIGKILL (out of memory or forced shutdown)".to_string(),
            Self::StackOverflow => "crashed with a memory fault (likely stack overflow)".to_string(),
            Self::Aborted => "aborted (SIGABRT)".to_string(),
            Self::ClosedOutput => "closed its output pipe".to_string(),
            Self::Unavailable(why) => format!("unavailable: {}", why),
            Self::Unknown => "died for an unknown reason".to_string(),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Classify a `WaitStatus` from a dead worker.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => match signal {
            Signal::SIGKILL => TerminationReason::Killed,
            Signal::SIGSEGV | Signal::SIGBUS => TerminationReason::StackOverflow,
            Signal::SIGABRT => TerminationReason::Aborted,
            _ => TerminationReason::Signaled(signal),
        },
        WaitStatus::StillAlive => TerminationReason::ClosedOutput,
        _ => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_analyze_exit() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 3);
        assert_eq!(analyze_wait_status(status), TerminationReason::Exited(3));
    }

    #[test]
    fn test_analyze_signals() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            TerminationReason::Killed
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGSEGV, true)),
            TerminationReason::StackOverflow
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGABRT, true)),
            TerminationReason::Aborted
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            TerminationReason::Signaled(Signal::SIGTERM)
        );
    }

    #[test]
    fn test_still_alive_means_closed_output() {
        assert_eq!(
            analyze_wait_status(WaitStatus::StillAlive),
            TerminationReason::ClosedOutput
        );
    }

    #[test]
    fn test_descriptions() {
        assert!(TerminationReason::Killed.to_string().contains("SIGKILL"));
        assert_eq!(
            TerminationReason::Unavailable("no such file".into()).to_string(),
            "unavailable: no such file"
        );
    }
}
