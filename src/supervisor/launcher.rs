//! Process launching and signal delivery
//!
//! The supervisor only reaches the OS through [`Launcher`], so a platform
//! without POSIX process groups can supply its own implementation.

use std::fmt;
use std::future::Future;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, Pid};
use tokio::process::{Child, Command};

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitInfo {
    /// Process exited normally with code
    Exited(i32),
    /// Process killed by signal
    Signaled(i32),
    /// Unknown status
    Unknown,
}

impl ExitInfo {
    /// True for a zero exit code or death by SIGTERM, the signal `stop` sends
    pub fn is_clean_stop(&self) -> bool {
        match self {
            ExitInfo::Exited(code) => *code == 0,
            ExitInfo::Signaled(sig) => *sig == Signal::SIGTERM as i32,
            ExitInfo::Unknown => false,
        }
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            ExitInfo::Exited(code)
        } else if let Some(sig) = status.signal() {
            ExitInfo::Signaled(sig)
        } else {
            ExitInfo::Unknown
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitInfo::Exited(code) => write!(f, "exit code {}", code),
            ExitInfo::Signaled(sig) => match Signal::try_from(*sig) {
                Ok(signal) => write!(f, "killed by {}", signal.as_str()),
                Err(_) => write!(f, "killed by signal {}", sig),
            },
            ExitInfo::Unknown => write!(f, "unknown exit status"),
        }
    }
}

/// OS capability used by the supervisor: launch, terminate, wait
pub trait Launcher: Send + Sync + 'static {
    /// Live process handle, owned by the supervisor's watcher task
    type Handle: Send + 'static;

    /// Launch `command` as a new process
    fn launch(&self, command: &Path) -> io::Result<Self::Handle>;

    /// PID of the launched process, if still known
    fn pid(&self, handle: &Self::Handle) -> Option<u32>;

    /// Ask the process (and everything it spawned) to terminate
    fn terminate(&self, handle: &Self::Handle) -> Result<(), Errno>;

    /// Wait for the process to exit
    fn wait<'a>(
        &'a self,
        handle: &'a mut Self::Handle,
    ) -> impl Future<Output = io::Result<ExitInfo>> + Send + 'a;
}

/// Launches each process as the leader of a fresh process group and
/// terminates it by signalling the whole group.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGroupLauncher;

impl Launcher for ProcessGroupLauncher {
    type Handle = Child;

    fn launch(&self, command: &Path) -> io::Result<Child> {
        let mut cmd = Command::new(command);

        // pgid == pid, so group signals never reach tsmd itself
        cmd.process_group(0);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        cmd.spawn()
    }

    fn pid(&self, child: &Child) -> Option<u32> {
        child.id()
    }

    fn terminate(&self, child: &Child) -> Result<(), Errno> {
        // id() is None once the child has been reaped
        let pid = child.id().ok_or(Errno::ESRCH)?;
        let pid = Pid::from_raw(pid as i32);

        match getpgid(Some(pid)).and_then(|pgid| killpg(pgid, Signal::SIGTERM)) {
            Ok(()) => {
                log::debug!("Sent SIGTERM to process group of PID {}", pid);
                Ok(())
            }
            Err(e) => {
                log::warn!(
                    "Failed to signal process group of PID {}: {}, signalling the process directly",
                    pid,
                    e
                );
                kill(pid, Signal::SIGTERM)
            }
        }
    }

    fn wait<'a>(
        &'a self,
        child: &'a mut Child,
    ) -> impl Future<Output = io::Result<ExitInfo>> + Send + 'a {
        async move { child.wait().await.map(ExitInfo::from) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_info_from_status() {
        assert_eq!(ExitInfo::from(ExitStatus::from_raw(0)), ExitInfo::Exited(0));
        assert_eq!(ExitInfo::from(ExitStatus::from_raw(3 << 8)), ExitInfo::Exited(3));
        assert_eq!(ExitInfo::from(ExitStatus::from_raw(15)), ExitInfo::Signaled(15));
    }

    #[test]
    fn test_clean_stop() {
        assert!(ExitInfo::Exited(0).is_clean_stop());
        assert!(ExitInfo::Signaled(Signal::SIGTERM as i32).is_clean_stop());
        assert!(!ExitInfo::Exited(1).is_clean_stop());
        assert!(!ExitInfo::Signaled(Signal::SIGKILL as i32).is_clean_stop());
        assert!(!ExitInfo::Unknown.is_clean_stop());
    }

    #[test]
    fn test_exit_info_display() {
        assert_eq!(ExitInfo::Exited(2).to_string(), "exit code 2");
        assert_eq!(
            ExitInfo::Signaled(Signal::SIGKILL as i32).to_string(),
            "killed by SIGKILL"
        );
    }

    #[tokio::test]
    async fn test_launch_missing_executable() {
        let launcher = ProcessGroupLauncher;
        let err = launcher
            .launch(Path::new("/nonexistent/tsm-game-server"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let launcher = ProcessGroupLauncher;
        let mut child = launcher.launch(Path::new("/bin/false")).unwrap();
        let info = launcher.wait(&mut child).await.unwrap();
        assert_eq!(info, ExitInfo::Exited(1));
    }
}
