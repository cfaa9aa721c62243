//! Read requests: configuration, execution and event emission.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::event::{ListenerId, ListenerSet, RequestEvent, RequestListener};
use super::state::ChannelState;
use super::{ChannelError, ChannelResult};
use crate::buffer::PooledBuffer;

/// Length sentinel meaning "read to the end, total unknown".
pub const TO_END: u64 = u64::MAX;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Kind of access a request performs. Only reads are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestType {
    #[default]
    Read,
    Write,
}

/// Snapshot of a request's configuration.
#[derive(Debug, Clone)]
pub struct RequestSettings {
    pub offset: u64,
    pub length: u64,
    pub max_chunk: u32,
    pub user_agent: Option<String>,
}

impl RequestSettings {
    /// Whether the request reads until end of stream.
    pub fn is_unbounded(&self) -> bool {
        self.length == TO_END
    }

    /// Exclusive end offset for bounded requests.
    pub fn end(&self) -> Option<u64> {
        if self.is_unbounded() {
            None
        } else {
            Some(self.offset.saturating_add(self.length))
        }
    }

    /// Size of the next chunk starting at `position`, or zero when a bounded
    /// request is satisfied.
    pub fn next_chunk_len(&self, position: u64) -> usize {
        let max_chunk = u64::from(self.max_chunk.max(1));
        let wanted = match self.end() {
            Some(end) => end.saturating_sub(position).min(max_chunk),
            None => max_chunk,
        };
        wanted as usize
    }

    /// Error for a bounded request that ran out of data at `position`.
    pub fn premature_eof(&self, position: u64) -> ChannelError {
        ChannelError::PrematureEof {
            expected: self.length,
            actual: position.saturating_sub(self.offset),
        }
    }
}

/// Backend strategy that performs the I/O of a request.
pub trait RequestReader: Send + Sync {
    /// Delivers the requested range through `request`, returning once the
    /// range is satisfied, the stream ends, or an error occurs.
    ///
    /// # Errors
    ///
    /// Any [`ChannelError`]; it becomes the request's terminal failed event.
    fn read(&self, request: &RequestCore) -> ChannelResult<()>;

    /// Wakes requests blocked inside [`RequestReader::read`] so they can
    /// observe cancellation.
    fn interrupt(&self) {}

    /// Bytes readable from `position` without blocking, if known.
    fn available_bytes(&self, _position: u64) -> Option<u64> {
        None
    }
}

/// Shared state of a request, visible to the backend while it runs.
pub struct RequestCore {
    id: u64,
    channel: Arc<ChannelState>,
    settings: Mutex<RequestSettings>,
    position: AtomicU64,
    cancelled: AtomicBool,
    terminated: AtomicBool,
    listeners: ListenerSet,
}

impl RequestCore {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Configuration snapshot.
    pub fn settings(&self) -> RequestSettings {
        self.settings.lock().clone()
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Chunk-boundary check: fails once the channel is gone or the request
    /// was cancelled.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Shared` - The channel was failed with an error
    /// - `ChannelError::Destroyed` - The channel was destroyed
    /// - `ChannelError::Cancelled` - The request was cancelled
    pub fn check_live(&self) -> ChannelResult<()> {
        self.channel.check_live()?;
        if self.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }
        Ok(())
    }

    /// Hands a filled buffer to the listeners and advances the position.
    ///
    /// The buffer is dropped back to its pool instead if the request is no
    /// longer live.
    ///
    /// # Errors
    ///
    /// Same as [`RequestCore::check_live`].
    pub fn emit_success(&self, buffer: PooledBuffer, offset: u64) -> ChannelResult<()> {
        self.check_live()?;

        let length = buffer.len();
        let next = offset + length as u64;
        trace!(request = self.id, offset, length, "Delivering chunk");

        self.listeners.dispatch(RequestEvent::Success {
            buffer,
            offset,
            length,
        });
        self.position.store(next, Ordering::Release);
        self.channel.set_position(next);
        Ok(())
    }

    /// Reports that no data is available at `offset` yet.
    pub fn emit_blocked(&self, offset: u64) {
        self.listeners.dispatch(RequestEvent::Blocked { offset });
    }

    /// Emits the terminal failed event, at most once per request.
    pub(crate) fn fail(&self, error: ChannelError) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let error = match error {
            ChannelError::Shared(inner) => inner,
            other => Arc::new(other),
        };
        debug!(request = self.id, "Request failed: {}", error);
        self.listeners.dispatch(RequestEvent::Failed { error });
    }
}

/// A configurable unit of read work against one channel.
///
/// Handles are cheap to clone; a clone can cancel the request from another
/// thread while [`Request::run`] executes.
#[derive(Clone)]
pub struct Request {
    core: Arc<RequestCore>,
    reader: Arc<dyn RequestReader>,
}

impl Request {
    pub(crate) fn new(
        channel: Arc<ChannelState>,
        reader: Arc<dyn RequestReader>,
        default_max_chunk: u32,
    ) -> Self {
        let core = RequestCore {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            channel,
            settings: Mutex::new(RequestSettings {
                offset: 0,
                length: TO_END,
                max_chunk: default_max_chunk.max(1),
                user_agent: None,
            }),
            position: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            listeners: ListenerSet::default(),
        };
        Self {
            core: Arc::new(core),
            reader,
        }
    }

    pub fn set_offset(&self, offset: u64) {
        self.core.settings.lock().offset = offset;
        self.core.position.store(offset, Ordering::Release);
    }

    /// Sets the number of bytes to read; [`TO_END`] reads until end of stream.
    pub fn set_length(&self, length: u64) {
        self.core.settings.lock().length = length;
    }

    /// Caps the size of each delivered chunk. Zero is treated as one byte.
    pub fn set_max_chunk_size(&self, max_chunk: u32) {
        self.core.settings.lock().max_chunk = max_chunk.max(1);
    }

    /// Marks the request as feeding a media player, which enables
    /// content-aware reordering on backends that support it.
    pub fn set_user_agent(&self, user_agent: impl Into<String>) {
        self.core.settings.lock().user_agent = Some(user_agent.into());
    }

    /// # Errors
    ///
    /// - `ChannelError::UnsupportedOperation` - Anything other than a read
    pub fn set_type(&self, request_type: RequestType) -> ChannelResult<()> {
        match request_type {
            RequestType::Read => Ok(()),
            RequestType::Write => Err(ChannelError::UnsupportedOperation { operation: "write" }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn RequestListener>) -> ListenerId {
        self.core.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.core.listeners.remove(id)
    }

    /// Executes the request on the calling thread.
    ///
    /// Events are delivered synchronously as data becomes available. Errors
    /// never escape; they arrive as a single terminal failed event.
    pub fn run(&self) {
        let core = &self.core;
        let settings = core.settings();
        core.position.store(settings.offset, Ordering::Release);
        debug!(
            request = core.id,
            offset = settings.offset,
            length = settings.length,
            max_chunk = settings.max_chunk,
            "Running request"
        );

        core.channel.register(core);
        let result = core.check_live().and_then(|()| self.reader.read(core));
        core.channel.unregister(core);

        if let Err(error) = result {
            core.fail(error);
        }
    }

    /// Requests cancellation. Observed at the next chunk boundary, after
    /// which exactly one `Cancelled` failure is delivered.
    pub fn cancel(&self) {
        self.core.mark_cancelled();
        self.reader.interrupt();
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }

    /// Next byte offset to be delivered.
    pub fn position(&self) -> u64 {
        self.core.position()
    }

    pub fn settings(&self) -> RequestSettings {
        self.core.settings()
    }

    /// Bytes still to deliver, or `None` for requests reading to the end.
    pub fn remaining(&self) -> Option<u64> {
        self.core
            .settings()
            .end()
            .map(|end| end.saturating_sub(self.position()))
    }

    /// Bytes the backend can deliver right now without blocking.
    pub fn available_bytes(&self) -> Option<u64> {
        let available = self.reader.available_bytes(self.position())?;
        Some(match self.remaining() {
            Some(remaining) => available.min(remaining),
            None => available,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PooledBuffer;
    use crate::test_fixtures::{CountingBufferPool, EventRecorder};

    /// Reader that serves `total` bytes of a repeating pattern.
    struct PatternReader {
        pool: crate::buffer::PoolHandle,
        total: u64,
    }

    impl RequestReader for PatternReader {
        fn read(&self, request: &RequestCore) -> ChannelResult<()> {
            let settings = request.settings();
            let mut position = settings.offset;
            loop {
                request.check_live()?;
                let wanted = settings.next_chunk_len(position);
                let available = self.total.saturating_sub(position) as usize;
                let len = wanted.min(available);
                if wanted == 0 {
                    return Ok(());
                }
                if len == 0 {
                    return if settings.is_unbounded() {
                        Ok(())
                    } else {
                        Err(settings.premature_eof(position))
                    };
                }
                let bytes: Vec<u8> = (position..position + len as u64)
                    .map(|i| (i % 251) as u8)
                    .collect();
                request.emit_success(PooledBuffer::copy_from(&self.pool, &bytes), position)?;
                position += len as u64;
            }
        }
    }

    fn pattern_request(pool: &CountingBufferPool, total: u64) -> (Request, Arc<ChannelState>) {
        let channel = ChannelState::new();
        let reader = Arc::new(PatternReader {
            pool: pool.handle(),
            total,
        });
        (Request::new(Arc::clone(&channel), reader, 64), channel)
    }

    #[test]
    fn test_chunks_are_contiguous() {
        let pool = CountingBufferPool::new();
        let (request, channel) = pattern_request(&pool, 1000);
        let recorder = EventRecorder::new();
        request.add_listener(recorder.listener());

        request.set_offset(10);
        request.set_length(300);
        request.run();

        let offsets = recorder.success_ranges();
        assert_eq!(offsets.first(), Some(&(10, 64)));
        assert_eq!(offsets.iter().map(|(_, len)| len).sum::<usize>(), 300);
        for pair in offsets.windows(2) {
            assert_eq!(pair[0].0 + pair[0].1 as u64, pair[1].0);
        }
        assert!(recorder.failures().is_empty());
        assert_eq!(request.position(), 310);
        assert_eq!(channel.position(), 310);
        assert_eq!(request.remaining(), Some(0));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_unbounded_request_ends_quietly() {
        let pool = CountingBufferPool::new();
        let (request, _channel) = pattern_request(&pool, 100);
        let recorder = EventRecorder::new();
        request.add_listener(recorder.listener());

        request.run();

        assert_eq!(recorder.total_bytes(), 100);
        assert!(recorder.failures().is_empty());
        assert_eq!(request.remaining(), None);
    }

    #[test]
    fn test_bounded_request_past_end_fails() {
        let pool = CountingBufferPool::new();
        let (request, _channel) = pattern_request(&pool, 100);
        let recorder = EventRecorder::new();
        request.add_listener(recorder.listener());

        request.set_offset(50);
        request.set_length(100);
        request.run();

        let failures = recorder.failures();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            *failures[0],
            ChannelError::PrematureEof {
                expected: 100,
                actual: 50
            }
        ));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_cancel_before_run_fails_once() {
        let pool = CountingBufferPool::new();
        let (request, _channel) = pattern_request(&pool, 100);
        let recorder = EventRecorder::new();
        request.add_listener(recorder.listener());

        request.cancel();
        request.cancel();
        request.run();

        assert_eq!(recorder.success_ranges().len(), 0);
        let failures = recorder.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].is_cancellation());
    }

    #[test]
    fn test_cancel_from_listener_stops_delivery() {
        let pool = CountingBufferPool::new();
        let (request, _channel) = pattern_request(&pool, 10_000);
        let recorder = EventRecorder::new();
        request.add_listener(recorder.listener());

        let handle = request.clone();
        request.add_listener(Arc::new(move |event: RequestEvent| {
            if let RequestEvent::Success { offset, .. } = event
                && offset >= 128
            {
                handle.cancel();
            }
        }));
        request.run();

        assert_eq!(recorder.success_ranges().len(), 3);
        assert_eq!(recorder.failures().len(), 1);
        assert!(recorder.failures()[0].is_cancellation());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_destroyed_channel_fails_request() {
        let pool = CountingBufferPool::new();
        let (request, channel) = pattern_request(&pool, 100);
        let recorder = EventRecorder::new();
        request.add_listener(recorder.listener());

        channel.destroy();
        request.run();

        let failures = recorder.failures();
        assert_eq!(failures.len(), 1);
        assert!(matches!(*failures[0], ChannelError::Destroyed));
    }

    #[test]
    fn test_write_type_is_rejected() {
        let pool = CountingBufferPool::new();
        let (request, _channel) = pattern_request(&pool, 100);

        assert!(request.set_type(RequestType::Read).is_ok());
        assert!(matches!(
            request.set_type(RequestType::Write),
            Err(ChannelError::UnsupportedOperation { .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn test_any_range_is_delivered_contiguously(
            offset in 0u64..1200,
            length in 1u64..1200,
            max_chunk in 1u32..300,
        ) {
            let pool = CountingBufferPool::new();
            let (request, _channel) = pattern_request(&pool, 1000);
            let recorder = EventRecorder::new();
            request.add_listener(recorder.listener());
            request.set_offset(offset);
            request.set_length(length);
            request.set_max_chunk_size(max_chunk);
            request.run();

            let ranges = recorder.success_ranges();
            let mut expected = offset;
            for (chunk_offset, len) in &ranges {
                proptest::prop_assert_eq!(*chunk_offset, expected);
                proptest::prop_assert!(*len as u32 <= max_chunk);
                expected += *len as u64;
            }
            let served = (offset + length).min(1000).saturating_sub(offset);
            proptest::prop_assert_eq!(expected - offset, served);
            proptest::prop_assert_eq!(recorder.failures().len(), usize::from(offset + length > 1000));
            proptest::prop_assert_eq!(pool.outstanding(), 0);
        }
    }
}
