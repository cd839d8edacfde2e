//! Nightly automatic backups
//!
//! The scheduler sleeps until the next local midnight, runs a backup through
//! [`Operations`] (so it queues behind any manual operation holding the
//! lock), and then re-arms for the following midnight. The next firing is
//! always recomputed from the wall clock, never `+24h`, so DST changes and
//! slow backups can't skip or double a day.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, LocalResult, TimeZone};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::operations::{OperationError, Operations};
use crate::supervisor::Launcher;

/// Comment attached to every scheduled backup
pub const AUTOMATIC_COMMENT: &str = "Automatic";

/// Longest stretch of wall-clock time a DST transition can remove
const MAX_DST_GAP_MINUTES: i64 = 180;

/// What to do when a scheduled backup fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log and terminate the whole process with status 1
    #[default]
    Exit,
    /// Log and try again next midnight
    Continue,
}

/// First instant of the calendar day after `now`, in `now`'s time zone.
///
/// When midnight itself falls into a DST gap the first valid minute after
/// it is used instead.
pub fn next_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Tz> {
    let tz = now.timezone();
    let fallback = || now.clone() + chrono::Duration::days(1);

    let Some(midnight) = now
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
    else {
        return fallback();
    };

    match tz.from_local_datetime(&midnight) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => (1..=MAX_DST_GAP_MINUTES)
            .map(|m| midnight + chrono::Duration::minutes(m))
            .find_map(|t| tz.from_local_datetime(&t).earliest())
            .unwrap_or_else(fallback),
    }
}

/// When to fire next, given the target of the previous firing (if any).
///
/// Timers can wake a little early; counting from the previous target keeps
/// an early wake-up from scheduling the same midnight twice.
pub fn next_fire<Tz: TimeZone>(now: &DateTime<Tz>, previous: Option<&DateTime<Tz>>) -> DateTime<Tz> {
    match previous {
        Some(prev) if prev > now => next_midnight(prev),
        _ => next_midnight(now),
    }
}

/// Sleep duration from `now` until `target`, zero if it has passed
pub fn duration_until<Tz: TimeZone>(now: &DateTime<Tz>, target: &DateTime<Tz>) -> Duration {
    let millis = target.timestamp_millis() - now.timestamp_millis();
    Duration::from_millis(millis.max(0) as u64)
}

/// Runs once when a failure is fatal under [`FailurePolicy::Exit`]
type FatalHook = Box<dyn FnOnce() + Send>;

/// Decide whether the loop keeps going after a failed backup
pub fn on_backup_failure(policy: FailurePolicy, err: &OperationError) -> ControlFlow<()> {
    match policy {
        FailurePolicy::Exit => {
            log::error!("Automatic backup failed, shutting down: {}", err);
            ControlFlow::Break(())
        }
        FailurePolicy::Continue => {
            log::error!("Automatic backup failed, retrying next midnight: {}", err);
            ControlFlow::Continue(())
        }
    }
}

fn exit_process() {
    log::logger().flush();
    std::process::exit(1);
}

/// Handle to the background backup loop
pub struct AutoBackupScheduler {
    stop_tx: oneshot::Sender<()>,
    next_rx: watch::Receiver<Option<DateTime<Local>>>,
    task: JoinHandle<()>,
}

impl AutoBackupScheduler {
    /// Arm the timer for the next local midnight and start the loop.
    ///
    /// Under [`FailurePolicy::Exit`] a failed backup ends the process with status 1.
    pub fn init<L: Launcher>(ops: Arc<Operations<L>>, policy: FailurePolicy) -> Self {
        Self::with_fatal_hook(ops, policy, exit_process)
    }

    /// Like [`init`](Self::init), running `on_fatal` instead of exiting the process
    pub fn with_fatal_hook<L: Launcher>(
        ops: Arc<Operations<L>>,
        policy: FailurePolicy,
        on_fatal: impl FnOnce() + Send + 'static,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (next_tx, next_rx) = watch::channel(None);
        let task = tokio::spawn(run(ops, policy, Box::new(on_fatal), stop_rx, next_tx));
        log::info!("Automatic backup scheduler started ({:?} on failure)", policy);
        Self {
            stop_tx,
            next_rx,
            task,
        }
    }

    /// Follows the time the loop is currently armed for
    pub fn next_backups(&self) -> watch::Receiver<Option<DateTime<Local>>> {
        self.next_rx.clone()
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// A backup that is already running finishes first.
    pub async fn stop(self) {
        log::debug!("Stopping automatic backup scheduler");
        let _ = self.stop_tx.send(());
        if let Err(e) = self.task.await {
            log::error!("Automatic backup scheduler task failed: {}", e);
        }
        log::info!("Automatic backup scheduler stopped");
    }
}

async fn run<L: Launcher>(
    ops: Arc<Operations<L>>,
    policy: FailurePolicy,
    on_fatal: FatalHook,
    mut stop_rx: oneshot::Receiver<()>,
    next_tx: watch::Sender<Option<DateTime<Local>>>,
) {
    let mut previous: Option<DateTime<Local>> = None;

    loop {
        let now = Local::now();
        let target = next_fire(&now, previous.as_ref());
        let delay = duration_until(&now, &target);
        log::info!(
            "Next automatic backup at {} (in {:?})",
            target.format("%Y-%m-%d %H:%M:%S"),
            delay
        );
        next_tx.send_replace(Some(target));

        tokio::select! {
            biased;
            _ = &mut stop_rx => {
                log::debug!("Scheduler received stop request");
                return;
            }
            _ = sleep(delay) => {}
        }

        log::info!("Running automatic backup");
        match ops.backup(AUTOMATIC_COMMENT).await {
            Ok(id) => log::info!("Automatic backup {} complete", id),
            Err(e) => {
                if on_backup_failure(policy, &e).is_break() {
                    next_tx.send_replace(None);
                    on_fatal();
                    return;
                }
            }
        }

        previous = Some(target);
    }
}
