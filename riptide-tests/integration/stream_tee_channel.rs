//! Live tee channels consumed by the read-ahead pipeline and by late
//! readers after the copy completes.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use riptide_channel::config::ReadAheadConfig;
use riptide_channel::test_fixtures::{
    CountingBufferPool, EventRecorder, RejectRecorder, pattern_bytes,
};
use riptide_channel::{
    ChannelBackend, ChannelConfig, PieceLayout, ReadAheadPipeline, StreamTeeBackend,
    TokioReadExecutor, TO_END,
};

use crate::support::{ForwardingOutbound, feed, wait_until};

#[test]
fn test_pipeline_waits_for_live_bytes() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("broadcast.ts");
    let pool = CountingBufferPool::new();
    let (sender, source) = feed();
    let backend =
        StreamTeeBackend::new(&target, source, pool.handle(), &ChannelConfig::for_testing());
    let channel = backend.create_channel().unwrap();

    let (outbound, messages) = ForwardingOutbound::new();
    let rejects = Arc::new(RejectRecorder::new());
    let pipeline = ReadAheadPipeline::new(
        channel,
        PieceLayout::new(4096, 16 * 1024),
        Arc::new(TokioReadExecutor::new(runtime.handle().clone())),
        outbound,
        rejects.clone(),
        &ReadAheadConfig {
            read_ahead_limit: 2,
        },
    );

    let first = pipeline.add(0, 0, 4096).unwrap();
    let second = pipeline.add(1, 0, 4096).unwrap();
    pipeline.add(2, 0, 4096).unwrap();
    assert_eq!(pipeline.stats().loading, 2);
    assert_eq!(pipeline.stats().pending, 1);

    // Nothing can complete until the source produces the first piece.
    thread::sleep(Duration::from_millis(60));
    assert!(messages.try_recv().is_err());

    sender.send(pattern_bytes(0, 4096)).unwrap();
    let message = messages.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(message.id, first);
    let payload: Vec<u8> = message.chunks.iter().flat_map(|c| c.iter().copied()).collect();
    assert_eq!(payload, pattern_bytes(0, 4096));

    sender.send(pattern_bytes(4096, 12 * 1024)).unwrap();
    let message = messages.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(message.id, second);

    // Both slots are still occupied by queued messages until sent.
    assert_eq!(pipeline.stats().queued, 2);
    pipeline.message_sent(first);
    let third = messages.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(third.block.piece.as_u32(), 2);

    pipeline.destroy();
    assert_eq!(rejects.blocks().len(), 0);
    drop(sender);
    wait_until(|| backend.is_complete());
}

#[test]
fn test_late_reader_after_finalize_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("recording.bin");
    let pool = CountingBufferPool::new();
    let (sender, source) = feed();
    let backend =
        StreamTeeBackend::new(&target, source, pool.handle(), &ChannelConfig::for_testing());

    let live = backend.create_channel().unwrap();
    sender.send(pattern_bytes(0, 5000)).unwrap();
    drop(sender);
    wait_until(|| backend.is_complete());
    assert_eq!(backend.bytes_written(), 5000);

    drop(live);
    assert_eq!(backend.live_channels(), 0);

    // A second backend on the same target serves the finished file.
    let (_unused, idle_source) = feed();
    let reopened =
        StreamTeeBackend::new(&target, idle_source, pool.handle(), &ChannelConfig::for_testing());
    assert!(reopened.is_complete());
    let channel = reopened.create_channel().unwrap();
    let request = channel.create_request();
    request.set_offset(1000);
    request.set_length(TO_END);
    let recorder = EventRecorder::new();
    request.add_listener(recorder.listener());
    request.run();

    assert!(recorder.failures().is_empty());
    assert!(recorder.blocked_offsets().is_empty());
    assert_eq!(recorder.bytes(), pattern_bytes(1000, 5000));
    assert_eq!(pool.outstanding(), 0);
}
