//! Test doubles and helpers shared by unit and integration tests.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::buffer::{BufferPool, PoolHandle, SharedBufferPool};
use crate::channel::{ChannelError, RequestEvent, RequestListener};
use crate::config::PoolConfig;
use crate::pipeline::{BlockId, OutboundQueue, PieceBlock, PieceMessage, ReadExecutor, ReadJob, RejectHandler};

/// Byte stored at absolute offset `index` of every generated test file.
pub fn pattern_byte(index: u64) -> u8 {
    (index % 251) as u8
}

/// Pattern bytes for the half-open range `start..end`.
pub fn pattern_bytes(start: u64, end: u64) -> Vec<u8> {
    (start..end).map(pattern_byte).collect()
}

/// Writes a `len`-byte pattern file into `dir`.
///
/// # Panics
///
/// Panics if the file cannot be written.
pub fn write_test_file(dir: &Path, name: &str, len: u64) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, pattern_bytes(0, len)).expect("write test file");
    path
}

/// Creates a temporary directory holding one `len`-byte pattern file.
///
/// # Panics
///
/// Panics if the directory or file cannot be created.
pub fn temp_pattern_file(name: &str, len: u64) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = write_test_file(dir.path(), name, len);
    (dir, path)
}

struct CountingPool {
    inner: SharedBufferPool,
    allocated: AtomicUsize,
    returned: AtomicUsize,
}

impl BufferPool for CountingPool {
    fn allocate(&self, len: usize) -> Vec<u8> {
        self.allocated.fetch_add(1, Ordering::SeqCst);
        self.inner.allocate(len)
    }

    fn recycle(&self, buffer: Vec<u8>) {
        self.returned.fetch_add(1, Ordering::SeqCst);
        self.inner.recycle(buffer);
    }
}

/// Pool that counts checkouts and returns, for leak assertions.
#[derive(Clone)]
pub struct CountingBufferPool {
    pool: Arc<CountingPool>,
}

impl CountingBufferPool {
    pub fn new() -> Self {
        Self {
            pool: Arc::new(CountingPool {
                inner: SharedBufferPool::new(&PoolConfig::default()),
                allocated: AtomicUsize::new(0),
                returned: AtomicUsize::new(0),
            }),
        }
    }

    pub fn handle(&self) -> PoolHandle {
        self.pool.clone()
    }

    pub fn allocated(&self) -> usize {
        self.pool.allocated.load(Ordering::SeqCst)
    }

    pub fn returned(&self) -> usize {
        self.pool.returned.load(Ordering::SeqCst)
    }

    /// Buffers checked out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.allocated() - self.returned()
    }
}

impl Default for CountingBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Recorded {
    ranges: Vec<(u64, usize)>,
    bytes: Vec<u8>,
    blocked: Vec<u64>,
    failures: Vec<Arc<ChannelError>>,
}

/// Listener that copies out every event and drops the buffers immediately.
#[derive(Clone, Default)]
pub struct EventRecorder {
    recorded: Arc<Mutex<Recorded>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener(&self) -> Arc<dyn RequestListener> {
        let recorded = Arc::clone(&self.recorded);
        Arc::new(move |event: RequestEvent| {
            let mut recorded = recorded.lock();
            match event {
                RequestEvent::Success {
                    buffer,
                    offset,
                    length,
                } => {
                    recorded.ranges.push((offset, length));
                    recorded.bytes.extend_from_slice(&buffer);
                }
                RequestEvent::Blocked { offset } => recorded.blocked.push(offset),
                RequestEvent::Failed { error } => recorded.failures.push(error),
            }
        })
    }

    /// `(offset, length)` of every success event, in delivery order.
    pub fn success_ranges(&self) -> Vec<(u64, usize)> {
        self.recorded.lock().ranges.clone()
    }

    pub fn failures(&self) -> Vec<Arc<ChannelError>> {
        self.recorded.lock().failures.clone()
    }

    pub fn blocked_offsets(&self) -> Vec<u64> {
        self.recorded.lock().blocked.clone()
    }

    pub fn total_bytes(&self) -> usize {
        self.recorded.lock().bytes.len()
    }

    /// Concatenated payload of every success event.
    pub fn bytes(&self) -> Vec<u8> {
        self.recorded.lock().bytes.clone()
    }
}

/// Executor that queues jobs until the test runs them.
#[derive(Default)]
pub struct ManualExecutor {
    jobs: Mutex<VecDeque<ReadJob>>,
    max_queued: AtomicUsize,
}

impl ManualExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the oldest queued job. Returns `false` if none was queued.
    pub fn run_next(&self) -> bool {
        let job = self.jobs.lock().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Runs jobs, including ones queued by earlier jobs, until none remain.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    pub fn queued_jobs(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Highest number of jobs ever queued at once.
    pub fn max_queued_jobs(&self) -> usize {
        self.max_queued.load(Ordering::SeqCst)
    }
}

impl ReadExecutor for ManualExecutor {
    fn submit(&self, job: ReadJob) {
        let mut jobs = self.jobs.lock();
        jobs.push_back(job);
        self.max_queued.fetch_max(jobs.len(), Ordering::SeqCst);
    }
}

#[derive(Default)]
struct OutboundState {
    messages: BTreeMap<BlockId, PieceMessage>,
    transmitting: HashSet<BlockId>,
    payloads: Vec<Vec<u8>>,
    enqueued: usize,
    sent: usize,
}

/// Outbound queue that holds messages until the test transmits them.
#[derive(Default)]
pub struct RecordingOutbound {
    state: Mutex<OutboundState>,
}

impl RecordingOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of messages held and not yet transmitted, oldest first.
    pub fn message_ids(&self) -> Vec<BlockId> {
        self.state.lock().messages.keys().copied().collect()
    }

    /// Marks a message as on the wire so it can no longer be withdrawn.
    pub fn start_transmitting(&self, id: BlockId) {
        self.state.lock().transmitting.insert(id);
    }

    /// Completes transmission, dropping the message and its buffers.
    pub fn transmit(&self, id: BlockId) -> bool {
        let mut state = self.state.lock();
        state.transmitting.remove(&id);
        let sent = state.messages.remove(&id).is_some();
        if sent {
            state.sent += 1;
        }
        sent
    }

    pub fn enqueued_count(&self) -> usize {
        self.state.lock().enqueued
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent
    }

    /// Payload of every enqueued message, in enqueue order.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.state.lock().payloads.clone()
    }
}

impl OutboundQueue for RecordingOutbound {
    fn enqueue(&self, message: PieceMessage) {
        let mut state = self.state.lock();
        let payload = message.chunks.iter().flat_map(|chunk| chunk.iter().copied()).collect();
        state.payloads.push(payload);
        state.enqueued += 1;
        state.messages.insert(message.id, message);
    }

    fn withdraw(&self, id: BlockId) -> bool {
        let mut state = self.state.lock();
        if state.transmitting.contains(&id) {
            return false;
        }
        state.messages.remove(&id).is_some()
    }
}

/// Collects rejected blocks in order.
#[derive(Default)]
pub struct RejectRecorder {
    blocks: Mutex<Vec<PieceBlock>>,
}

impl RejectRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> Vec<PieceBlock> {
        self.blocks.lock().clone()
    }
}

impl RejectHandler for RejectRecorder {
    fn rejected(&self, block: PieceBlock) {
        self.blocks.lock().push(block);
    }
}
