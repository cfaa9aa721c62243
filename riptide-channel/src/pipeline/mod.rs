//! Bounded read-ahead of outbound piece data.
//!
//! Peers request `(piece, offset, length)` blocks faster than the disk can
//! serve them. The pipeline keeps every accepted block in exactly one of
//! three collections:
//!
//! - `pending` - accepted, not yet submitted as a disk read
//! - `loading` - read submitted to the executor, awaiting completion
//! - `queued`  - read finished, handed to the outbound queue, not yet sent
//!
//! New reads are only submitted while `loading + queued` is below the
//! read-ahead limit. Withdrawn blocks that end up not being sent produce
//! exactly one rejection.

pub mod executor;
pub mod message;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

pub use executor::{InlineReadExecutor, ReadExecutor, ReadJob, TokioReadExecutor};
pub use message::{BlockId, PieceBlock, PieceIndex, PieceLayout, PieceMessage};

use crate::buffer::PooledBuffer;
use crate::channel::{Channel, ChannelError, Request, RequestEvent};
use crate::config::ReadAheadConfig;

/// Message layer that transmits completed pieces.
pub trait OutboundQueue: Send + Sync {
    /// Queues a message for transmission. The layer reports transmission
    /// back through [`ReadAheadPipeline::message_sent`].
    fn enqueue(&self, message: PieceMessage);

    /// Withdraws a queued message that has not started transmitting.
    /// Returns `false` if the message is already on the wire or unknown.
    fn withdraw(&self, id: BlockId) -> bool;
}

/// Receives blocks the pipeline will not send.
pub trait RejectHandler: Send + Sync {
    fn rejected(&self, block: PieceBlock);
}

impl<F> RejectHandler for F
where
    F: Fn(PieceBlock) + Send + Sync,
{
    fn rejected(&self, block: PieceBlock) {
        self(block)
    }
}

/// Snapshot of pipeline occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub pending: usize,
    pub loading: usize,
    pub queued: usize,
    pub read_ahead_limit: usize,
}

struct LoadingEntry {
    block: PieceBlock,
    request: Request,
    discarded: bool,
}

struct QueuedEntry {
    block: PieceBlock,
    /// Counted as queued but not yet accepted by the outbound queue.
    handing_off: bool,
    /// Removed during the hand-off; withdrawn once the hand-off completes.
    withdraw_requested: bool,
}

struct PipelineState {
    pending: VecDeque<(BlockId, PieceBlock)>,
    loading: HashMap<BlockId, LoadingEntry>,
    queued: HashMap<BlockId, QueuedEntry>,
    read_ahead_limit: usize,
    destroyed: bool,
    /// A thread is inside the promote loop; nested calls leave the work
    /// to it.
    promoting: bool,
}

impl PipelineState {
    fn has_capacity(&self) -> bool {
        self.loading.len() + self.queued.len() < self.read_ahead_limit
    }
}

/// Blocks pulled out of the pipeline by a removal, to be acted on once the
/// state lock is released.
#[derive(Default)]
struct Withdrawal {
    rejected: Vec<PieceBlock>,
    to_cancel: Vec<Request>,
    to_withdraw: Vec<(BlockId, PieceBlock)>,
}

struct PipelineInner {
    channel: Arc<dyn Channel>,
    layout: PieceLayout,
    executor: Arc<dyn ReadExecutor>,
    outbound: Arc<dyn OutboundQueue>,
    rejects: Arc<dyn RejectHandler>,
    state: Mutex<PipelineState>,
    next_id: AtomicU64,
}

/// Read-ahead pipeline serving one peer's block requests from one channel.
#[derive(Clone)]
pub struct ReadAheadPipeline {
    inner: Arc<PipelineInner>,
}

impl ReadAheadPipeline {
    pub fn new(
        channel: Arc<dyn Channel>,
        layout: PieceLayout,
        executor: Arc<dyn ReadExecutor>,
        outbound: Arc<dyn OutboundQueue>,
        rejects: Arc<dyn RejectHandler>,
        config: &ReadAheadConfig,
    ) -> Self {
        let state = PipelineState {
            pending: VecDeque::new(),
            loading: HashMap::new(),
            queued: HashMap::new(),
            read_ahead_limit: config.read_ahead_limit.max(1),
            destroyed: false,
            promoting: false,
        };
        Self {
            inner: Arc::new(PipelineInner {
                channel,
                layout,
                executor,
                outbound,
                rejects,
                state: Mutex::new(state),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Accepts a block request and starts reads up to the read-ahead limit.
    ///
    /// Blocks outside the file, or added after [`ReadAheadPipeline::destroy`],
    /// are rejected immediately.
    pub fn add(&self, piece: u32, offset: u32, length: u32) -> Option<BlockId> {
        let block = PieceBlock::new(piece, offset, length);
        if !self.inner.layout.contains(&block) {
            warn!("Rejecting out-of-range block {}", block);
            self.inner.rejects.rejected(block);
            return None;
        }

        let id = BlockId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                drop(state);
                self.inner.rejects.rejected(block);
                return None;
            }
            state.pending.push_back((id, block));
        }
        trace!("Accepted block {} as {:?}", block, id);

        self.inner.promote();
        Some(id)
    }

    /// Withdraws one outstanding block. Returns `false` if no matching
    /// block was outstanding.
    ///
    /// A pending block is dropped, a loading block is cancelled and its data
    /// discarded, and a queued block is withdrawn from the outbound queue
    /// unless it is already being transmitted, in which case it is left to
    /// complete.
    pub fn remove(&self, piece: u32, offset: u32, length: u32) -> bool {
        let block = PieceBlock::new(piece, offset, length);
        let mut withdrawal = Withdrawal::default();
        let found = {
            let mut state = self.inner.state.lock();
            if let Some(index) = state.pending.iter().position(|(_, b)| *b == block) {
                state.pending.remove(index);
                withdrawal.rejected.push(block);
                true
            } else if let Some(entry) = state
                .loading
                .values_mut()
                .find(|entry| !entry.discarded && entry.block == block)
            {
                entry.discarded = true;
                withdrawal.to_cancel.push(entry.request.clone());
                withdrawal.rejected.push(block);
                true
            } else if let Some((id, entry)) = state
                .queued
                .iter_mut()
                .find(|(_, entry)| !entry.withdraw_requested && entry.block == block)
            {
                if entry.handing_off {
                    entry.withdraw_requested = true;
                } else {
                    withdrawal.to_withdraw.push((*id, block));
                }
                true
            } else {
                false
            }
        };

        self.inner.complete_withdrawal(withdrawal);
        found
    }

    /// Withdraws every outstanding block, rejecting each one that will not
    /// be sent.
    pub fn remove_all(&self) {
        let withdrawal = {
            let mut state = self.inner.state.lock();
            Self::drain(&mut state)
        };
        self.inner.complete_withdrawal(withdrawal);
    }

    /// Removes everything and refuses further blocks.
    pub fn destroy(&self) {
        let withdrawal = {
            let mut state = self.inner.state.lock();
            state.destroyed = true;
            Self::drain(&mut state)
        };
        debug!(
            "Destroying read-ahead pipeline, rejecting {} blocks",
            withdrawal.rejected.len() + withdrawal.to_withdraw.len()
        );
        self.inner.complete_withdrawal(withdrawal);
    }

    /// Reports that the outbound layer finished transmitting a message.
    pub fn message_sent(&self, id: BlockId) {
        let removed = self.inner.state.lock().queued.remove(&id);
        if let Some(entry) = removed {
            trace!("Block {} sent", entry.block);
            self.inner.promote();
        }
    }

    /// Adjusts the read-ahead depth; takes effect immediately.
    pub fn set_read_ahead_limit(&self, limit: usize) {
        self.inner.state.lock().read_ahead_limit = limit.max(1);
        self.inner.promote();
    }

    pub fn stats(&self) -> PipelineStats {
        let state = self.inner.state.lock();
        PipelineStats {
            pending: state.pending.len(),
            loading: state.loading.values().filter(|entry| !entry.discarded).count(),
            queued: state.queued.len(),
            read_ahead_limit: state.read_ahead_limit,
        }
    }

    fn drain(state: &mut PipelineState) -> Withdrawal {
        let mut withdrawal = Withdrawal::default();
        withdrawal
            .rejected
            .extend(state.pending.drain(..).map(|(_, block)| block));
        for entry in state.loading.values_mut().filter(|entry| !entry.discarded) {
            entry.discarded = true;
            withdrawal.to_cancel.push(entry.request.clone());
            withdrawal.rejected.push(entry.block);
        }
        for (id, entry) in state.queued.iter_mut() {
            if entry.handing_off {
                entry.withdraw_requested = true;
            } else {
                withdrawal.to_withdraw.push((*id, entry.block));
            }
        }
        withdrawal
    }
}

impl PipelineInner {
    /// Moves pending blocks to loading while capacity remains and submits
    /// their reads outside the state lock.
    ///
    /// Runs as a loop owned by one caller at a time. A read that completes
    /// inside `submit` calls back in here, returns at once, and its freed
    /// slot is picked up by the next turn of the owning loop.
    fn promote(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.promoting {
                return;
            }
            state.promoting = true;
        }

        loop {
            let submissions = {
                let mut state = self.state.lock();
                let submissions = self.take_submissions(&mut state);
                if submissions.is_empty() {
                    state.promoting = false;
                    return;
                }
                submissions
            };

            for (id, request) in submissions {
                let inner = Arc::clone(self);
                self.executor
                    .submit(Box::new(move || inner.execute_read(id, request)));
            }
        }
    }

    fn take_submissions(&self, state: &mut PipelineState) -> Vec<(BlockId, Request)> {
        let mut submissions = Vec::new();
        if state.destroyed {
            return submissions;
        }
        while state.has_capacity() {
            let Some((id, block)) = state.pending.pop_front() else {
                break;
            };
            let request = self.channel.create_request();
            request.set_offset(self.layout.byte_offset(&block));
            request.set_length(u64::from(block.length));
            request.set_max_chunk_size(block.length);
            state.loading.insert(
                id,
                LoadingEntry {
                    block,
                    request: request.clone(),
                    discarded: false,
                },
            );
            submissions.push((id, request));
        }
        submissions
    }

    fn execute_read(self: &Arc<Self>, id: BlockId, request: Request) {
        let collected: Arc<Mutex<ReadCollector>> = Arc::default();
        let sink = Arc::clone(&collected);
        request.add_listener(Arc::new(move |event: RequestEvent| {
            let mut collector = sink.lock();
            match event {
                RequestEvent::Success { buffer, .. } => collector.chunks.push(buffer),
                RequestEvent::Blocked { .. } => {}
                RequestEvent::Failed { error } => collector.failure = Some(error),
            }
        }));

        request.run();

        let collector = std::mem::take(&mut *collected.lock());
        self.read_finished(id, collector);
    }

    fn read_finished(self: &Arc<Self>, id: BlockId, collector: ReadCollector) {
        let ReadCollector { chunks, failure } = collector;
        let mut message = None;
        let mut rejected = None;
        {
            let mut state = self.state.lock();
            let Some(entry) = state.loading.remove(&id) else {
                return;
            };

            if entry.discarded {
                trace!("Discarding read for withdrawn block {}", entry.block);
            } else if let Some(error) = failure {
                warn!("Read for block {} failed: {}", entry.block, error);
                rejected = Some(entry.block);
            } else {
                let delivered: usize = chunks.iter().map(|chunk| chunk.len()).sum();
                if delivered == entry.block.length as usize {
                    state.queued.insert(
                        id,
                        QueuedEntry {
                            block: entry.block,
                            handing_off: true,
                            withdraw_requested: false,
                        },
                    );
                    message = Some(PieceMessage {
                        id,
                        block: entry.block,
                        chunks,
                    });
                } else {
                    warn!(
                        "Short read for block {}: {} of {} bytes",
                        entry.block, delivered, entry.block.length
                    );
                    rejected = Some(entry.block);
                }
            }
        }

        if let Some(message) = message {
            self.outbound.enqueue(message);
            self.handed_off(id);
        }
        if let Some(block) = rejected {
            self.rejects.rejected(block);
        }
        self.promote();
    }

    /// Marks a message as accepted by the outbound queue. A removal that
    /// arrived while it was being enqueued is carried out now.
    fn handed_off(self: &Arc<Self>, id: BlockId) {
        let withdrawn = {
            let mut state = self.state.lock();
            state.queued.get_mut(&id).and_then(|entry| {
                entry.handing_off = false;
                entry.withdraw_requested.then_some(entry.block)
            })
        };
        if let Some(block) = withdrawn {
            trace!("Withdrawing block {} removed during hand-off", block);
            self.complete_withdrawal(Withdrawal {
                to_withdraw: vec![(id, block)],
                ..Withdrawal::default()
            });
        }
    }

    fn complete_withdrawal(self: &Arc<Self>, withdrawal: Withdrawal) {
        let Withdrawal {
            mut rejected,
            to_cancel,
            to_withdraw,
        } = withdrawal;

        for request in to_cancel {
            request.cancel();
        }

        for (id, block) in to_withdraw {
            if self.outbound.withdraw(id) && self.state.lock().queued.remove(&id).is_some() {
                rejected.push(block);
            }
        }

        for block in rejected {
            debug!("Rejecting block {}", block);
            self.rejects.rejected(block);
        }
        self.promote();
    }
}

#[derive(Default)]
struct ReadCollector {
    chunks: Vec<PooledBuffer>,
    failure: Option<Arc<ChannelError>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::LocalFileBackend;
    use crate::channel::ChannelBackend;
    use crate::config::ChannelConfig;
    use crate::test_fixtures::{
        CountingBufferPool, ManualExecutor, RecordingOutbound, RejectRecorder, write_test_file,
    };

    struct Fixture {
        pool: CountingBufferPool,
        executor: Arc<ManualExecutor>,
        outbound: Arc<RecordingOutbound>,
        rejects: Arc<RejectRecorder>,
        pipeline: ReadAheadPipeline,
        _dir: tempfile::TempDir,
    }

    fn fixture(limit: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_file(dir.path(), "pieces.bin", 64 * 1024);
        let pool = CountingBufferPool::new();
        let backend =
            LocalFileBackend::new(&path, pool.handle(), &ChannelConfig::for_testing());
        let channel = backend.create_channel().unwrap();

        let executor = Arc::new(ManualExecutor::new());
        let outbound = Arc::new(RecordingOutbound::new());
        let rejects = Arc::new(RejectRecorder::new());
        let pipeline = ReadAheadPipeline::new(
            channel,
            PieceLayout::new(16384, 64 * 1024),
            executor.clone(),
            outbound.clone(),
            rejects.clone(),
            &ReadAheadConfig {
                read_ahead_limit: limit,
            },
        );

        Fixture {
            pool,
            executor,
            outbound,
            rejects,
            pipeline,
            _dir: dir,
        }
    }

    #[test]
    fn test_loading_never_exceeds_limit() {
        let f = fixture(2);
        for piece in 0..5 {
            f.pipeline.add(piece % 4, 0, 1024);
        }

        let stats = f.pipeline.stats();
        assert_eq!(stats.loading, 2);
        assert_eq!(stats.pending, 3);
        assert_eq!(f.executor.queued_jobs(), 2);

        while f.executor.run_next() {
            assert!(f.pipeline.stats().loading + f.pipeline.stats().queued <= 2);
            for id in f.outbound.message_ids() {
                f.outbound.transmit(id);
                f.pipeline.message_sent(id);
            }
        }

        assert!(f.executor.max_queued_jobs() <= 2);
        assert_eq!(f.outbound.sent_count(), 5);
        assert!(f.rejects.blocks().is_empty());
        assert_eq!(f.pool.outstanding(), 0);
    }

    #[test]
    fn test_remove_all_before_io_rejects_everything() {
        let f = fixture(2);
        for piece in 0..4 {
            f.pipeline.add(piece, 0, 512);
        }

        f.pipeline.remove_all();
        f.executor.run_all();

        assert_eq!(f.outbound.enqueued_count(), 0);
        assert_eq!(f.rejects.blocks().len(), 4);
        let stats = f.pipeline.stats();
        assert_eq!((stats.pending, stats.loading, stats.queued), (0, 0, 0));
        assert_eq!(f.pool.outstanding(), 0);
    }

    #[test]
    fn test_remove_pending_and_loading_blocks() {
        let f = fixture(1);
        f.pipeline.add(0, 0, 256);
        f.pipeline.add(1, 0, 256);

        // Second block is still pending.
        assert!(f.pipeline.remove(1, 0, 256));
        // First block is loading.
        assert!(f.pipeline.remove(0, 0, 256));
        assert!(!f.pipeline.remove(0, 0, 256));

        f.executor.run_all();

        assert_eq!(f.outbound.enqueued_count(), 0);
        assert_eq!(
            f.rejects.blocks(),
            vec![PieceBlock::new(1, 0, 256), PieceBlock::new(0, 0, 256)]
        );
        assert_eq!(f.pool.outstanding(), 0);
    }

    #[test]
    fn test_queued_block_withdrawn_or_left_in_flight() {
        let f = fixture(4);
        f.pipeline.add(0, 0, 128);
        f.pipeline.add(1, 0, 128);
        f.executor.run_all();
        assert_eq!(f.pipeline.stats().queued, 2);

        let ids = f.outbound.message_ids();
        // The first message is already on the wire and cannot be withdrawn.
        f.outbound.start_transmitting(ids[0]);

        assert!(f.pipeline.remove(0, 0, 128));
        assert!(f.pipeline.remove(1, 0, 128));

        assert_eq!(f.rejects.blocks(), vec![PieceBlock::new(1, 0, 128)]);
        assert_eq!(f.pipeline.stats().queued, 1);

        f.outbound.transmit(ids[0]);
        f.pipeline.message_sent(ids[0]);
        assert_eq!(f.pipeline.stats().queued, 0);
        assert_eq!(f.rejects.blocks().len(), 1);
        assert_eq!(f.pool.outstanding(), 0);
    }

    #[test]
    fn test_sent_message_carries_file_bytes() {
        let f = fixture(2);
        f.pipeline.add(1, 10, 100);
        f.executor.run_all();

        let payloads = f.outbound.payloads();
        assert_eq!(payloads.len(), 1);
        let expected: Vec<u8> = (16384 + 10..16384 + 110u64).map(|i| (i % 251) as u8).collect();
        assert_eq!(payloads[0], expected);
    }

    #[test]
    fn test_raising_limit_promotes_pending() {
        let f = fixture(1);
        for piece in 0..3 {
            f.pipeline.add(piece, 0, 64);
        }
        assert_eq!(f.pipeline.stats().loading, 1);

        f.pipeline.set_read_ahead_limit(3);
        let stats = f.pipeline.stats();
        assert_eq!(stats.loading, 3);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.read_ahead_limit, 3);

        f.pipeline.destroy();
        f.executor.run_all();
        assert_eq!(f.rejects.blocks().len(), 3);
        assert!(f.pipeline.add(0, 0, 64).is_none());
        assert_eq!(f.rejects.blocks().len(), 4);
    }

    #[test]
    fn test_out_of_range_block_rejected() {
        let f = fixture(2);
        assert!(f.pipeline.add(10, 0, 64).is_none());
        assert_eq!(f.rejects.blocks(), vec![PieceBlock::new(10, 0, 64)]);
    }

    /// Outbound that runs a hook just before a message reaches the queue.
    struct InterceptingOutbound {
        inner: RecordingOutbound,
        on_enqueue: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl OutboundQueue for InterceptingOutbound {
        fn enqueue(&self, message: PieceMessage) {
            let hook = self.on_enqueue.lock().take();
            if let Some(hook) = hook {
                hook();
            }
            self.inner.enqueue(message);
        }

        fn withdraw(&self, id: BlockId) -> bool {
            self.inner.withdraw(id)
        }
    }

    #[test]
    fn test_remove_during_hand_off_withdraws_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_file(dir.path(), "handoff.bin", 8192);
        let pool = CountingBufferPool::new();
        let backend =
            LocalFileBackend::new(&path, pool.handle(), &ChannelConfig::for_testing());
        let outbound = Arc::new(InterceptingOutbound {
            inner: RecordingOutbound::new(),
            on_enqueue: Mutex::new(None),
        });
        let rejects = Arc::new(RejectRecorder::new());
        let pipeline = ReadAheadPipeline::new(
            backend.create_channel().unwrap(),
            PieceLayout::new(4096, 8192),
            Arc::new(InlineReadExecutor),
            outbound.clone(),
            rejects.clone(),
            &ReadAheadConfig::default(),
        );

        let removed = Arc::new(Mutex::new(None));
        let remover = pipeline.clone();
        let result = Arc::clone(&removed);
        *outbound.on_enqueue.lock() = Some(Box::new(move || {
            *result.lock() = Some(remover.remove(0, 0, 512));
        }));

        pipeline.add(0, 0, 512);

        assert_eq!(*removed.lock(), Some(true));
        assert!(outbound.inner.message_ids().is_empty());
        assert_eq!(rejects.blocks(), vec![PieceBlock::new(0, 0, 512)]);
        assert_eq!(pipeline.stats().queued, 0);
        assert!(!pipeline.remove(0, 0, 512));

        // Later blocks are handed off normally.
        pipeline.add(1, 0, 512);
        assert_eq!(outbound.inner.message_ids().len(), 1);
        assert_eq!(rejects.blocks().len(), 1);
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_failing_inline_reads_drain_iteratively() {
        const BLOCKS: u32 = 20_000;
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_file(dir.path(), "failing.bin", 8192);
        let pool = CountingBufferPool::new();
        let backend =
            LocalFileBackend::new(&path, pool.handle(), &ChannelConfig::for_testing());
        let channel = backend.create_channel().unwrap();
        let outbound = Arc::new(RecordingOutbound::new());
        let rejects = Arc::new(RejectRecorder::new());
        let pipeline = ReadAheadPipeline::new(
            Arc::clone(&channel),
            PieceLayout::new(4096, 8192),
            Arc::new(InlineReadExecutor),
            outbound.clone(),
            rejects.clone(),
            &ReadAheadConfig {
                read_ahead_limit: 1,
            },
        );

        // The first block occupies the only slot; the rest wait behind it.
        let first = pipeline.add(0, 0, 16).unwrap();
        for _ in 1..BLOCKS {
            pipeline.add(1, 0, 16).unwrap();
        }
        assert_eq!(pipeline.stats().pending, BLOCKS as usize - 1);

        // Every later read fails at once and frees the slot for the next.
        channel.destroy();
        assert!(outbound.transmit(first));
        pipeline.message_sent(first);

        assert_eq!(rejects.blocks().len(), BLOCKS as usize - 1);
        let stats = pipeline.stats();
        assert_eq!((stats.pending, stats.loading, stats.queued), (0, 0, 0));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_inline_executor_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_file(dir.path(), "inline.bin", 8192);
        let pool = CountingBufferPool::new();
        let backend =
            LocalFileBackend::new(&path, pool.handle(), &ChannelConfig::for_testing());
        let outbound = Arc::new(RecordingOutbound::new());
        let rejects = Arc::new(RejectRecorder::new());
        let pipeline = ReadAheadPipeline::new(
            backend.create_channel().unwrap(),
            PieceLayout::new(4096, 8192),
            Arc::new(InlineReadExecutor),
            outbound.clone(),
            rejects.clone(),
            &ReadAheadConfig::default(),
        );

        pipeline.add(0, 0, 4096);
        pipeline.add(1, 0, 4096);

        assert_eq!(outbound.enqueued_count(), 2);
        assert_eq!(pipeline.stats().queued, 2);
        for id in outbound.message_ids() {
            outbound.transmit(id);
            pipeline.message_sent(id);
        }
        assert_eq!(pipeline.stats().queued, 0);
        assert_eq!(pool.outstanding(), 0);
    }
}
