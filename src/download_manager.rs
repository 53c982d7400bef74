// vidswarm - download_manager.rs

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashSet;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::control_client::ControlClient;
use crate::file_manager::FileManager;
use crate::metadata::{chunk_len, chunk_offset, num_chunks, PeerIdentity, SearchResult};
use crate::protocol::ProtocolError;

pub const MIN_WORKERS: usize = 2;
pub const MAX_WORKERS: usize = 8;
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

const RETRY_BASE: Duration = Duration::from_millis(150);
const RETRY_STEP_MS: u64 = 200;
const RETRY_CAP_MS: u64 = 2000;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("No sources available for {0}")]
    NoSources(String),
    #[error("Could not prepare output file {path:?}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("A transfer of {content_hash} into {path:?} is already running")]
    AlreadyRunning { content_hash: String, path: PathBuf },
    #[error("{size_bytes} bytes cannot be split into {num_chunks} chunks")]
    ChunkCount { size_bytes: u64, num_chunks: u32 },
}

/// Why a single attempt at a chunk failed. Every variant is retried.
#[derive(Error, Debug)]
enum AttemptError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Write failed: {0}")]
    Write(#[from] std::io::Error),
}

/// Pool size for a job: one worker per source, within [`MIN_WORKERS`, `MAX_WORKERS`].
pub fn worker_count(sources: usize) -> usize {
    sources.clamp(MIN_WORKERS, MAX_WORKERS)
}

/// Source for attempt `attempt` (0-based) at chunk `chunk_index`. Consecutive attempts rotate
/// through every source.
pub fn source_index(chunk_index: u32, attempt: u32, sources: usize) -> usize {
    (chunk_index as usize + attempt as usize) % sources
}

/// Pause before the next try once `attempts` tries have been made.
pub fn retry_delay(attempts: u32) -> Duration {
    RETRY_BASE + Duration::from_millis(RETRY_CAP_MS.min(RETRY_STEP_MS * attempts as u64))
}

/// Everything needed to fetch one file. Sources are a snapshot taken when the job starts.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub content_hash: String,
    pub display_name: String,
    pub size_bytes: u64,
    pub num_chunks: u32,
    pub sources: Vec<PeerIdentity>,
    pub output_path: PathBuf,
    pub play_threshold_chunks: usize,
    pub chunk_timeout: Duration,
}

impl TransferRequest {
    pub fn from_search(result: &SearchResult, output_path: impl Into<PathBuf>, config: &NodeConfig) -> Self {
        Self {
            content_hash: result.content_hash.clone(),
            display_name: result.display_name.clone(),
            size_bytes: result.size_bytes,
            num_chunks: result.num_chunks,
            sources: result.sources.clone(),
            output_path: output_path.into(),
            play_threshold_chunks: config.play_threshold_chunks,
            chunk_timeout: config.chunk_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Requesting,
    Received,
    Retrying,
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkStatus::Requesting => write!(f, "Requesting"),
            ChunkStatus::Received => write!(f, "OK"),
            ChunkStatus::Retrying => write!(f, "Retry"),
        }
    }
}

/// Snapshot of a job's chunk counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStatus {
    pub downloaded: u32,
    /// Chunks received from index 0 with no gap.
    pub contiguous: u32,
    pub total: u32,
}

/// An empty job reports both fractions as 1.0: nothing is left to fetch.
impl BufferStatus {
    /// Share of the file playable from the start.
    pub fn buffer_fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.contiguous as f64 / self.total as f64
    }

    pub fn progress_fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.downloaded as f64 / self.total as f64
    }
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    Started {
        content_hash: String,
        num_chunks: u32,
        size_bytes: u64,
    },
    Chunk {
        peer: PeerIdentity,
        chunk_index: u32,
        status: ChunkStatus,
        progress: f64,
        error: Option<String>,
    },
    /// Emitted after every new chunk and by the heartbeat monitor.
    Buffer(BufferStatus),
    /// Fired once, when the contiguous prefix first reaches the play threshold. The threshold is
    /// capped at the file's chunk count, so a file shorter than the threshold fires this together
    /// with `Completed`. An empty file never fires it.
    ReadyToPlay { path: PathBuf },
    Completed { path: PathBuf },
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    InProgress,
    Complete,
    Stopped,
}

/// What a newly received chunk changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkUpdate {
    pub status: BufferStatus,
    pub ready_to_play: bool,
    pub completed: bool,
}

/// Per-job received flags and the counters derived from them.
#[derive(Debug)]
pub struct ChunkTracker {
    threshold: u32,
    state: Mutex<TrackerState>,
}

#[derive(Debug)]
struct TrackerState {
    received: Vec<bool>,
    downloaded: u32,
    contiguous: u32,
    ready_fired: bool,
}

impl ChunkTracker {
    /// The threshold is at least one chunk and never more than the file has.
    pub fn new(total: u32, play_threshold: usize) -> Self {
        let threshold = (play_threshold.max(1) as u64).min(total as u64) as u32;
        Self {
            threshold,
            state: Mutex::new(TrackerState {
                received: vec![false; total as usize],
                downloaded: 0,
                contiguous: 0,
                ready_fired: false,
            }),
        }
    }

    /// Sets the flag for `index`. Only the first call for an index returns an update; later
    /// calls, and indices out of range, return `None`.
    pub fn mark_received(&self, index: u32) -> Option<ChunkUpdate> {
        let mut state = self.lock();
        let slot = state.received.get_mut(index as usize)?;
        if *slot {
            return None;
        }
        *slot = true;
        state.downloaded += 1;

        let total = state.received.len() as u32;
        while state.contiguous < total && state.received[state.contiguous as usize] {
            state.contiguous += 1;
        }

        let ready_to_play = !state.ready_fired && state.contiguous >= self.threshold;
        if ready_to_play {
            state.ready_fired = true;
        }

        Some(ChunkUpdate {
            status: BufferStatus {
                downloaded: state.downloaded,
                contiguous: state.contiguous,
                total,
            },
            ready_to_play,
            completed: state.downloaded == total,
        })
    }

    pub fn is_received(&self, index: u32) -> bool {
        self.lock().received.get(index as usize).copied().unwrap_or(false)
    }

    pub fn status(&self) -> BufferStatus {
        let state = self.lock();
        BufferStatus {
            downloaded: state.downloaded,
            contiguous: state.contiguous,
            total: state.received.len() as u32,
        }
    }

    pub fn is_complete(&self) -> bool {
        let state = self.lock();
        state.downloaded as usize == state.received.len()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

type JobKey = (String, PathBuf);

struct TransferShared {
    request: TransferRequest,
    client: ControlClient,
    tracker: ChunkTracker,
    attempts: Vec<AtomicU32>,
    queue: Mutex<VecDeque<u32>>,
    file: tokio::sync::Mutex<FileManager>,
    finished: AtomicBool,
    events: mpsc::UnboundedSender<TransferEvent>,
    active: Arc<DashSet<JobKey>>,
}

impl TransferShared {
    fn key(&self) -> JobKey {
        (self.request.content_hash.clone(), self.request.output_path.clone())
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Marks the job as over and releases its slot. True only for the call that did it.
    fn finish(&self) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.active.remove(&self.key());
        true
    }

    fn emit(&self, event: TransferEvent) {
        self.events.send(event).ok();
    }

    fn next_chunk(&self) -> Option<u32> {
        if self.is_finished() {
            return None;
        }
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).pop_front()
    }

    fn emit_chunk(&self, peer: &PeerIdentity, chunk_index: u32, status: ChunkStatus, error: Option<String>) {
        self.emit(TransferEvent::Chunk {
            peer: peer.clone(),
            chunk_index,
            status,
            progress: self.tracker.status().progress_fraction(),
            error,
        });
    }

    /// Retries `index` against the next source in rotation until it lands or the job ends.
    async fn fetch_until_received(&self, index: u32) {
        let sources = &self.request.sources;
        loop {
            if self.is_finished() || self.tracker.is_received(index) {
                return;
            }
            let attempt = self.attempts[index as usize].fetch_add(1, Ordering::SeqCst);
            let peer = &sources[source_index(index, attempt, sources.len())];
            self.emit_chunk(peer, index, ChunkStatus::Requesting, None);

            match self.try_chunk(peer, index).await {
                Ok(()) => return,
                Err(e) => {
                    if self.is_finished() {
                        return;
                    }
                    warn!(peer = %peer.id, chunk = index, attempt, error = %e, "Chunk fetch failed, retrying");
                    self.emit_chunk(peer, index, ChunkStatus::Retrying, Some(e.to_string()));
                    tokio::time::sleep(retry_delay(attempt + 1)).await;
                }
            }
        }
    }

    async fn try_chunk(&self, peer: &PeerIdentity, index: u32) -> Result<(), AttemptError> {
        let request = &self.request;
        let payload = self
            .client
            .fetch_chunk(peer, &request.content_hash, index, request.chunk_timeout)
            .await?;

        let expected = chunk_len(index, request.size_bytes);
        if payload.data.len() as u64 != expected {
            return Err(ProtocolError::UnexpectedLength {
                index,
                expected,
                got: payload.data.len() as u64,
            }
            .into());
        }
        if self.is_finished() {
            return Ok(());
        }

        self.file
            .lock()
            .await
            .write_chunk(chunk_offset(index), &payload.data)
            .await?;

        if let Some(update) = self.tracker.mark_received(index) {
            self.on_new_chunk(peer, index, update);
        }
        Ok(())
    }

    fn on_new_chunk(&self, peer: &PeerIdentity, index: u32, update: ChunkUpdate) {
        debug!(
            peer = %peer.id,
            chunk = index,
            downloaded = update.status.downloaded,
            contiguous = update.status.contiguous,
            "Chunk received"
        );
        self.emit(TransferEvent::Chunk {
            peer: peer.clone(),
            chunk_index: index,
            status: ChunkStatus::Received,
            progress: update.status.progress_fraction(),
            error: None,
        });
        self.emit(TransferEvent::Buffer(update.status));

        let path = self.request.output_path.clone();
        if update.ready_to_play {
            info!(file = %self.request.display_name, contiguous = update.status.contiguous, "Buffer threshold met");
            self.emit(TransferEvent::ReadyToPlay { path: path.clone() });
        }
        if update.completed {
            info!(file = %self.request.display_name, path = ?path, "Download complete");
            self.emit(TransferEvent::Completed { path });
            self.finish();
        }
    }
}

async fn run_worker(shared: Arc<TransferShared>) {
    while let Some(index) = shared.next_chunk() {
        shared.fetch_until_received(index).await;
    }
}

async fn monitor_loop(shared: Arc<TransferShared>) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + MONITOR_INTERVAL, MONITOR_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if shared.is_finished() {
            break;
        }
        shared.emit(TransferEvent::Buffer(shared.tracker.status()));
    }
}

/// Starts transfer jobs and makes sure only one runs per (content hash, destination) pair.
#[derive(Debug, Clone, Default)]
pub struct DownloadManager {
    client: ControlClient,
    active: Arc<DashSet<JobKey>>,
}

impl DownloadManager {
    pub fn new(client: ControlClient) -> Self {
        Self {
            client,
            active: Arc::new(DashSet::new()),
        }
    }

    pub fn active_transfers(&self) -> usize {
        self.active.len()
    }

    /// Preallocates the output file and queues every chunk onto a fresh worker pool.
    pub async fn start(&self, request: TransferRequest) -> Result<TransferHandle, TransferError> {
        if request.sources.is_empty() {
            info!(file = %request.display_name, "No sources available");
            return Err(TransferError::NoSources(request.display_name));
        }
        let derived = num_chunks(request.size_bytes);
        if request.num_chunks != derived || chunk_offset(derived) < request.size_bytes {
            return Err(TransferError::ChunkCount {
                size_bytes: request.size_bytes,
                num_chunks: request.num_chunks,
            });
        }

        let key = (request.content_hash.clone(), request.output_path.clone());
        if !self.active.insert(key.clone()) {
            return Err(TransferError::AlreadyRunning {
                content_hash: key.0,
                path: key.1,
            });
        }

        let file = match FileManager::new(&request.output_path, request.size_bytes).await {
            Ok(file) => file,
            Err(source) => {
                self.active.remove(&key);
                return Err(TransferError::Output {
                    path: request.output_path,
                    source,
                });
            }
        };

        let total = request.num_chunks;
        let workers = worker_count(request.sources.len());
        let (events, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(TransferShared {
            tracker: ChunkTracker::new(total, request.play_threshold_chunks),
            attempts: (0..total).map(|_| AtomicU32::new(0)).collect(),
            queue: Mutex::new((0..total).collect()),
            file: tokio::sync::Mutex::new(file),
            finished: AtomicBool::new(false),
            client: self.client.clone(),
            events,
            active: Arc::clone(&self.active),
            request,
        });

        info!(
            file = %shared.request.display_name,
            chunks = total,
            size = shared.request.size_bytes,
            sources = shared.request.sources.len(),
            workers,
            "Transfer started"
        );
        shared.emit(TransferEvent::Started {
            content_hash: shared.request.content_hash.clone(),
            num_chunks: total,
            size_bytes: shared.request.size_bytes,
        });

        let mut tasks = Vec::with_capacity(workers + 1);
        if total == 0 {
            shared.emit(TransferEvent::Buffer(shared.tracker.status()));
            shared.emit(TransferEvent::Completed {
                path: shared.request.output_path.clone(),
            });
            shared.finish();
        } else {
            for _ in 0..workers {
                tasks.push(tokio::spawn(run_worker(Arc::clone(&shared))));
            }
            tasks.push(tokio::spawn(monitor_loop(Arc::clone(&shared))));
        }

        Ok(TransferHandle {
            shared,
            events: Some(receiver),
            tasks,
        })
    }
}

/// A running job. Dropping the handle stops the job.
pub struct TransferHandle {
    shared: Arc<TransferShared>,
    events: Option<mpsc::UnboundedReceiver<TransferEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TransferHandle {
    /// The job's events in emission order. Available once; later calls return `None`.
    pub fn events(&mut self) -> Option<UnboundedReceiverStream<TransferEvent>> {
        self.events.take().map(UnboundedReceiverStream::new)
    }

    pub fn status(&self) -> BufferStatus {
        self.shared.tracker.status()
    }

    pub fn state(&self) -> TransferState {
        if self.shared.tracker.is_complete() {
            TransferState::Complete
        } else if self.shared.is_finished() {
            TransferState::Stopped
        } else {
            TransferState::InProgress
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.shared.request.output_path
    }

    /// Total tries made so far for `index`, successful or not.
    pub fn attempts(&self, index: u32) -> u32 {
        self.shared
            .attempts
            .get(index as usize)
            .map(|a| a.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Abandons outstanding work. Results of requests still in flight are discarded.
    pub fn stop(&self) {
        if self.shared.finish() {
            info!(file = %self.shared.request.display_name, "Transfer stopped");
            self.shared.emit(TransferEvent::Stopped);
        }
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Waits for the workers to exit, which happens once the job completes or is stopped.
    pub async fn wait(&mut self) {
        for task in self.tasks.drain(..) {
            task.await.ok();
        }
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
