//! Test fixtures: nodes sharing an event stream and checkpoint directory,
//! an event stream with injectable append failures and a checkpoint
//! manager with injectable delays.

use crate::checkpoint::{CheckpointManager, CheckpointRegistry, LocalCheckpointManager};
use crate::service::{MetadataService, ServiceComponents};
use async_trait::async_trait;
use cachemeta_common::config::ServiceConfig;
use cachemeta_common::{
    CheckpointId, CheckpointState, Error, EventSequencePoint, LogId, Result,
};
use cachemeta_events::{EventSink, EventStream, FileEventStream};
use cachemeta_store::{ClusterStateStore, MetadataStore};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub(crate) fn shared_dir() -> TempDir {
    tempfile::tempdir().unwrap()
}

/// File event stream that counts appends and can be told to fail them
pub(crate) struct RecordingEventStream {
    inner: FileEventStream,
    fail_writes: AtomicBool,
    write_delay: Mutex<Duration>,
    writes: AtomicU64,
    before_checkpoint_calls: AtomicU64,
    last_written: Mutex<Option<LogId>>,
}

impl RecordingEventStream {
    fn open(dir: &Path) -> Self {
        Self {
            inner: FileEventStream::open(dir, 64 * 1024 * 1024).unwrap(),
            fail_writes: AtomicBool::new(false),
            write_delay: Mutex::new(Duration::ZERO),
            writes: AtomicU64::new(0),
            before_checkpoint_calls: AtomicU64::new(0),
            last_written: Mutex::new(None),
        }
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Appends sleep this long before reaching the log
    pub(crate) fn delay_writes(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    pub(crate) fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn before_checkpoint_calls(&self) -> u64 {
        self.before_checkpoint_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_written(&self) -> Option<LogId> {
        *self.last_written.lock()
    }
}

#[async_trait]
impl EventStream for RecordingEventStream {
    async fn write_event(&self, kind: u8, payload: &[u8]) -> Result<LogId> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::event_stream("injected append failure"));
        }
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let position = self.inner.write_event(kind, payload).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        *self.last_written.lock() = Some(position);
        Ok(position)
    }

    async fn read_events_from(&self, position: LogId, sink: &dyn EventSink) -> Result<LogId> {
        self.inner.read_events_from(position, sink).await
    }

    async fn before_checkpoint(&self) -> Result<EventSequencePoint> {
        self.before_checkpoint_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.before_checkpoint().await
    }

    async fn after_checkpoint(&self, point: EventSequencePoint) -> Result<()> {
        self.inner.after_checkpoint(point).await
    }

    fn set_logging(&self, enabled: bool) {
        self.inner.set_logging(enabled);
    }

    fn is_logging(&self) -> bool {
        self.inner.is_logging()
    }

    async fn seal_or_rotate(&self, resume: LogId) -> Result<()> {
        self.inner.seal_or_rotate(resume).await
    }
}

/// Checkpoint manager that records when each gated step starts and ends
pub(crate) struct FakeCheckpoints {
    delay: Duration,
    latest: Option<CheckpointState>,
    fail_restores: AtomicBool,
    log: Mutex<Vec<&'static str>>,
}

impl FakeCheckpoints {
    /// A manager with one registered checkpoint at the log origin
    pub(crate) fn registered(delay: Duration) -> Self {
        Self {
            delay,
            latest: Some(CheckpointState {
                checkpoint_id: CheckpointId::new("ckpt-test"),
                sequence_point: EventSequencePoint::new(LogId::ORIGIN),
                created_at_ms: 0,
            }),
            fail_restores: AtomicBool::new(false),
            log: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn fail_restores(&self, fail: bool) {
        self.fail_restores.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn events(&self) -> Vec<&'static str> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl CheckpointRegistry for FakeCheckpoints {
    async fn get_latest_checkpoint_state(&self) -> Result<Option<CheckpointState>> {
        Ok(self.latest.clone())
    }
}

#[async_trait]
impl CheckpointManager for FakeCheckpoints {
    async fn create_checkpoint(
        &self,
        sequence_point: EventSequencePoint,
    ) -> Result<CheckpointState> {
        self.log.lock().push("create-start");
        tokio::time::sleep(self.delay).await;
        self.log.lock().push("create-end");
        Ok(CheckpointState {
            checkpoint_id: CheckpointId::generate(sequence_point),
            sequence_point,
            created_at_ms: 0,
        })
    }

    async fn restore_checkpoint(&self, _state: &CheckpointState) -> Result<()> {
        if self.fail_restores.load(Ordering::SeqCst) {
            return Err(Error::checkpoint("injected restore failure"));
        }
        self.log.lock().push("restore-start");
        tokio::time::sleep(self.delay).await;
        self.log.lock().push("restore-end");
        Ok(())
    }

    async fn wait_idle(&self) {
        self.log.lock().push("wait-idle");
    }
}

/// One node: private store and cluster file, shared events and checkpoints
pub(crate) struct TestNode {
    pub(crate) service: Arc<MetadataService>,
    pub(crate) store: Arc<MetadataStore>,
    pub(crate) events: Arc<RecordingEventStream>,
}

impl TestNode {
    pub(crate) fn new(shared: &Path, name: &str, config: ServiceConfig) -> Self {
        let store = Self::open_store(shared, name);
        let cluster = Arc::new(ClusterStateStore::new(
            shared.join(name).join("cluster_state.bin"),
        ));
        let manager = Arc::new(
            LocalCheckpointManager::new(
                shared.join("checkpoints"),
                3,
                Arc::clone(&store),
                cluster.checkpoint_path(),
            )
            .unwrap(),
        );
        Self::assemble(shared, config, store, cluster, manager)
    }

    pub(crate) fn with_checkpoints<C>(
        shared: &Path,
        name: &str,
        config: ServiceConfig,
        checkpoints: Arc<C>,
    ) -> Self
    where
        C: CheckpointManager + CheckpointRegistry + 'static,
    {
        let store = Self::open_store(shared, name);
        let cluster = Arc::new(ClusterStateStore::new(
            shared.join(name).join("cluster_state.bin"),
        ));
        Self::assemble(shared, config, store, cluster, checkpoints)
    }

    fn open_store(shared: &Path, name: &str) -> Arc<MetadataStore> {
        let dir = shared.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        Arc::new(MetadataStore::open(dir.join("metadata.redb")).unwrap())
    }

    fn assemble<C>(
        shared: &Path,
        config: ServiceConfig,
        store: Arc<MetadataStore>,
        cluster: Arc<ClusterStateStore>,
        checkpoints: Arc<C>,
    ) -> Self
    where
        C: CheckpointManager + CheckpointRegistry + 'static,
    {
        let events = Arc::new(RecordingEventStream::open(&shared.join("events")));
        let event_stream: Arc<dyn EventStream> = events.clone();
        let manager: Arc<dyn CheckpointManager> = checkpoints.clone();
        let registry: Arc<dyn CheckpointRegistry> = checkpoints;
        let service = MetadataService::new(
            config,
            ServiceComponents {
                store: Arc::clone(&store),
                cluster,
                events: event_stream,
                checkpoints: manager,
                registry,
            },
        );
        Self {
            service: Arc::new(service),
            store,
            events,
        }
    }
}
