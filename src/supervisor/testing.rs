//! In-memory launcher for tests

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use tokio::sync::watch;

use super::{ExitInfo, Launcher};

type ExitSender = Arc<watch::Sender<Option<ExitInfo>>>;

/// Stand-in for an OS process; exits when its channel gets a value
pub(crate) struct FakeProcess {
    pid: u32,
    exit: ExitSender,
}

#[derive(Default)]
pub(crate) struct FakeLauncher {
    pub launches: AtomicUsize,
    pub terminations: AtomicUsize,
    fail_launch: bool,
    last: Mutex<Option<ExitSender>>,
}

impl FakeLauncher {
    /// Launcher whose every launch fails with NotFound
    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::default()
        }
    }

    /// Make the most recent process exit on its own
    pub fn crash_last(&self, info: ExitInfo) {
        if let Some(exit) = self.last.lock().unwrap().as_ref() {
            exit.send_replace(Some(info));
        }
    }
}

impl Launcher for FakeLauncher {
    type Handle = FakeProcess;

    fn launch(&self, _command: &Path) -> io::Result<FakeProcess> {
        if self.fail_launch {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        let (tx, _rx) = watch::channel(None);
        let exit = Arc::new(tx);
        *self.last.lock().unwrap() = Some(Arc::clone(&exit));
        Ok(FakeProcess {
            pid: 1000 + n as u32,
            exit,
        })
    }

    fn pid(&self, handle: &FakeProcess) -> Option<u32> {
        Some(handle.pid)
    }

    fn terminate(&self, handle: &FakeProcess) -> Result<(), Errno> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        handle.exit.send_if_modified(|exit| {
            if exit.is_some() {
                return false;
            }
            *exit = Some(ExitInfo::Signaled(Signal::SIGTERM as i32));
            true
        });
        Ok(())
    }

    fn wait<'a>(
        &'a self,
        handle: &'a mut FakeProcess,
    ) -> impl Future<Output = io::Result<ExitInfo>> + Send + 'a {
        async move {
            let mut rx = handle.exit.subscribe();
            let info = *rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| io::Error::other("exit channel closed"))?;
            Ok(info.unwrap_or(ExitInfo::Unknown))
        }
    }
}
