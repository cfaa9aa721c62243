//! Read-ahead pipeline on real execution contexts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use riptide_channel::config::ReadAheadConfig;
use riptide_channel::test_fixtures::{
    CountingBufferPool, RecordingOutbound, RejectRecorder, pattern_bytes, temp_pattern_file,
};
use riptide_channel::{
    BlockId, ChannelBackend, ChannelConfig, InlineReadExecutor, LocalFileBackend, PieceLayout,
    ReadAheadPipeline, TokioReadExecutor,
};

use crate::support::ForwardingOutbound;

const PIECE: u32 = 16 * 1024;
const BLOCK: u32 = 4096;
const FILE_LEN: u64 = 8 * PIECE as u64;

#[test]
fn test_streams_every_block_of_a_file() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (_dir, path) = temp_pattern_file("torrent.bin", FILE_LEN);
    let pool = CountingBufferPool::new();
    let backend = LocalFileBackend::new(&path, pool.handle(), &ChannelConfig::for_testing());

    let (outbound, messages) = ForwardingOutbound::new();
    let rejects = Arc::new(RejectRecorder::new());
    let pipeline = ReadAheadPipeline::new(
        backend.create_channel().unwrap(),
        PieceLayout::new(PIECE, FILE_LEN),
        Arc::new(TokioReadExecutor::new(runtime.handle().clone())),
        outbound,
        rejects.clone(),
        &ReadAheadConfig {
            read_ahead_limit: 3,
        },
    );

    let mut expected = HashMap::new();
    for piece in 0..8 {
        for offset in (0..PIECE).step_by(BLOCK as usize) {
            let id = pipeline.add(piece, offset, BLOCK).unwrap();
            let start = u64::from(piece) * u64::from(PIECE) + u64::from(offset);
            expected.insert(id, start);
        }
    }

    let mut received = 0;
    while received < expected.len() {
        let message = messages.recv_timeout(Duration::from_secs(5)).unwrap();
        let stats = pipeline.stats();
        assert!(stats.loading + stats.queued <= stats.read_ahead_limit);

        let start = expected[&message.id];
        let frame = message.encode();
        assert_eq!(frame.len(), 13 + BLOCK as usize);
        assert_eq!(&frame[13..], pattern_bytes(start, start + u64::from(BLOCK)).as_slice());

        let id = message.id;
        drop(message);
        pipeline.message_sent(id);
        received += 1;
    }

    assert!(rejects.blocks().is_empty());
    let stats = pipeline.stats();
    assert_eq!((stats.pending, stats.loading, stats.queued), (0, 0, 0));
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_peer_choke_rejects_unsent_blocks_once() {
    let (_dir, path) = temp_pattern_file("choke.bin", FILE_LEN);
    let pool = CountingBufferPool::new();
    let backend = LocalFileBackend::new(&path, pool.handle(), &ChannelConfig::for_testing());
    let outbound = Arc::new(RecordingOutbound::new());
    let rejects = Arc::new(RejectRecorder::new());
    let pipeline = ReadAheadPipeline::new(
        backend.create_channel().unwrap(),
        PieceLayout::new(PIECE, FILE_LEN),
        Arc::new(InlineReadExecutor),
        outbound.clone(),
        rejects.clone(),
        &ReadAheadConfig {
            read_ahead_limit: 2,
        },
    );

    let ids: Vec<BlockId> = (0..5)
        .map(|piece| pipeline.add(piece, 0, BLOCK).unwrap())
        .collect();
    // Inline reads complete immediately: two queued, three pending.
    assert_eq!(outbound.enqueued_count(), 2);
    assert_eq!(pipeline.stats().pending, 3);

    outbound.start_transmitting(ids[0]);
    pipeline.remove_all();

    // The message on the wire is left alone; everything else is rejected.
    let mut rejected: Vec<u32> = rejects
        .blocks()
        .iter()
        .map(|block| block.piece.as_u32())
        .collect();
    rejected.sort_unstable();
    assert_eq!(rejected, vec![1, 2, 3, 4]);
    assert_eq!(outbound.message_ids(), vec![ids[0]]);

    assert!(outbound.transmit(ids[0]));
    pipeline.message_sent(ids[0]);
    assert_eq!(outbound.enqueued_count(), 2);
    assert_eq!(rejects.blocks().len(), 4);
    assert_eq!(pool.outstanding(), 0);

    // The pipeline stays usable after a remove_all.
    assert!(pipeline.add(6, 0, BLOCK).is_some());
    assert_eq!(outbound.enqueued_count(), 3);
}
