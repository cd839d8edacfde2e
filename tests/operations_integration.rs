//! Integration tests for composite operations with a real game process

use std::fs;
use std::future::Future;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use tokio::process::Child;
use tsm::backup::{BackupError, BackupStore, Backups, SaveTarget, SledStore, StoreError, ZipCodec};
use tsm::operations::UpdateError;
use tsm::supervisor::{ExitInfo, Launcher, ProcessGroupLauncher};
use tsm::{BackupRecord, OperationError, Operations, ProcessSupervisor};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_test_dir() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = PathBuf::from(format!("/tmp/tsm-ops-test-{}-{}", std::process::id(), id));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Launch,
    Terminate,
    Exited,
    Record,
}

type Events = Arc<Mutex<Vec<Event>>>;

/// Real launcher that logs every lifecycle step
struct RecordingLauncher {
    inner: ProcessGroupLauncher,
    events: Events,
}

impl Launcher for RecordingLauncher {
    type Handle = Child;

    fn launch(&self, command: &Path) -> io::Result<Child> {
        let child = self.inner.launch(command)?;
        self.events.lock().unwrap().push(Event::Launch);
        Ok(child)
    }

    fn pid(&self, child: &Child) -> Option<u32> {
        self.inner.pid(child)
    }

    fn terminate(&self, child: &Child) -> Result<(), Errno> {
        self.events.lock().unwrap().push(Event::Terminate);
        self.inner.terminate(child)
    }

    fn wait<'a>(
        &'a self,
        child: &'a mut Child,
    ) -> impl Future<Output = io::Result<ExitInfo>> + Send + 'a {
        async move {
            let exit = self.inner.wait(child).await;
            self.events.lock().unwrap().push(Event::Exited);
            exit
        }
    }
}

/// Store that logs when records are created
struct RecordingStore {
    inner: SledStore,
    events: Events,
}

impl BackupStore for RecordingStore {
    fn create_record(&self, path: &Path, name: &str, comment: &str) -> Result<u64, StoreError> {
        self.events.lock().unwrap().push(Event::Record);
        self.inner.create_record(path, name, comment)
    }

    fn list_records(&self) -> Result<Vec<BackupRecord>, StoreError> {
        self.inner.list_records()
    }

    fn find_record_path(&self, id: u64) -> Result<Option<PathBuf>, StoreError> {
        self.inner.find_record_path(id)
    }
}

struct Harness {
    dir: PathBuf,
    save: PathBuf,
    events: Events,
    ops: Arc<Operations<RecordingLauncher>>,
}

fn harness(update_command: &str) -> Harness {
    let dir = unique_test_dir();
    let script = dir.join("server.sh");
    fs::write(&script, "#!/bin/sh\nexec sleep 60\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let save = dir.join("world");
    fs::create_dir_all(&save).unwrap();
    fs::write(save.join("level.dat"), b"day one").unwrap();

    let events: Events = Arc::default();
    let store = RecordingStore {
        inner: SledStore::temporary().unwrap(),
        events: Arc::clone(&events),
    };
    let backups = Backups::new(
        dir.join("backups"),
        SaveTarget::detect(&save).unwrap(),
        Arc::new(store),
        Arc::new(ZipCodec),
    )
    .unwrap();
    let launcher = RecordingLauncher {
        inner: ProcessGroupLauncher,
        events: Arc::clone(&events),
    };
    let supervisor =
        ProcessSupervisor::with_launcher(&script, launcher).with_stop_grace(Duration::from_millis(100));
    let ops = Operations::new(Arc::new(supervisor), Arc::new(backups)).with_update_command(update_command);

    Harness {
        dir,
        save,
        events,
        ops: Arc::new(ops),
    }
}

/// Every record was created with no process alive, and launches never overlap
fn assert_well_ordered(events: &[Event]) {
    let mut alive = 0;
    for (i, event) in events.iter().enumerate() {
        match event {
            Event::Launch => {
                assert_eq!(alive, 0, "launch while running at {}: {:?}", i, events);
                alive += 1;
            }
            Event::Exited => alive -= 1,
            Event::Terminate => assert_eq!(alive, 1, "terminate while stopped at {}: {:?}", i, events),
            Event::Record => assert_eq!(alive, 0, "record while running at {}: {:?}", i, events),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_operations_never_interleave() {
    let h = harness("");
    h.ops.supervisor().start().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..3 {
        let ops = Arc::clone(&h.ops);
        tasks.push(tokio::spawn(async move { ops.backup(&format!("backup {}", i)).await.map(|_| ()) }));
    }
    for _ in 0..2 {
        let ops = Arc::clone(&h.ops);
        tasks.push(tokio::spawn(async move { ops.restart().await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(h.ops.supervisor().running());
    assert_eq!(h.ops.list_backups().await.unwrap().len(), 3);

    let events = h.events.lock().unwrap().clone();
    assert_well_ordered(&events);
    assert_eq!(events.iter().filter(|e| **e == Event::Record).count(), 3);
    // Initial start plus one per operation
    assert_eq!(events.iter().filter(|e| **e == Event::Launch).count(), 6);

    h.ops.supervisor().stop().await.unwrap();
}

#[tokio::test]
async fn test_backup_then_restore() {
    let h = harness("");
    h.ops.supervisor().start().await.unwrap();

    let id = h.ops.backup("before raid").await.unwrap();
    fs::write(h.save.join("level.dat"), b"day two").unwrap();
    fs::write(h.save.join("loot.dat"), b"gold").unwrap();

    h.ops.restore(id).await.unwrap();
    assert_eq!(fs::read(h.save.join("level.dat")).unwrap(), b"day one");
    assert!(!h.save.join("loot.dat").exists());
    assert!(h.ops.supervisor().running());

    let records = h.ops.list_backups().await.unwrap();
    assert_eq!(records[0].comment, "before raid");
    assert_eq!(h.ops.backup_path(id).await.unwrap(), records[0].path);

    assert_well_ordered(&h.events.lock().unwrap());
    h.ops.supervisor().stop().await.unwrap();
}

#[tokio::test]
async fn test_restore_unknown_id_leaves_server_alone() {
    let h = harness("");
    h.ops.supervisor().start().await.unwrap();
    let before = h.events.lock().unwrap().len();

    let err = h.ops.restore(9999).await.unwrap_err();
    assert!(matches!(err, OperationError::Backup(BackupError::NotFound(9999))));
    assert_eq!(h.events.lock().unwrap().len(), before);
    assert!(h.ops.supervisor().running());

    h.ops.supervisor().stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_step_leaves_server_stopped() {
    let h = harness("");
    h.ops.supervisor().start().await.unwrap();
    fs::remove_dir_all(&h.save).unwrap();

    let err = h.ops.backup("nothing to save").await.unwrap_err();
    assert!(matches!(err, OperationError::Backup(BackupError::SaveMissing { .. })));
    assert!(!h.ops.supervisor().running());
    assert!(h.ops.list_backups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_update_runs_while_stopped() {
    let dir = unique_test_dir();
    let marker = dir.join("updated");
    let h = harness(&format!("/bin/sh -c 'echo done > {}'", marker.display()));
    h.ops.supervisor().start().await.unwrap();

    h.ops.update().await.unwrap();
    assert_eq!(fs::read_to_string(&marker).unwrap().trim(), "done");
    assert!(h.ops.supervisor().running());

    h.ops.supervisor().stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_update_still_restarts() {
    let h = harness("/bin/false");
    h.ops.supervisor().start().await.unwrap();

    let err = h.ops.update().await.unwrap_err();
    assert!(matches!(
        err,
        OperationError::Update(UpdateError::Failed(ExitInfo::Exited(1)))
    ));
    assert!(h.ops.supervisor().running());

    h.ops.supervisor().stop().await.unwrap();
}

#[tokio::test]
async fn test_update_not_configured() {
    let h = harness("   ");
    h.ops.supervisor().start().await.unwrap();

    let err = h.ops.update().await.unwrap_err();
    assert!(matches!(err, OperationError::Update(UpdateError::NotConfigured)));
    // Rejected before the server was touched
    assert_eq!(*h.events.lock().unwrap(), [Event::Launch]);

    h.ops.supervisor().stop().await.unwrap();
    let _ = fs::remove_dir_all(&h.dir);
}
