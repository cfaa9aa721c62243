//! Remote channels against a local fixture server.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use riptide_channel::test_fixtures::{CountingBufferPool, EventRecorder, pattern_bytes};
use riptide_channel::{
    ChannelBackend, ChannelConfig, RedirectCache, RemoteUrlBackend, RequestEvent, TO_END,
};

use crate::support::{SERVED_LEN, start_server};

#[test]
fn test_backends_share_redirect_cache() {
    let server = start_server();
    let pool = CountingBufferPool::new();
    let config = ChannelConfig::for_testing();
    let cache = Arc::new(RedirectCache::new());

    let first = RemoteUrlBackend::new(&server.url("/data.bin"), pool.handle(), &config)
        .unwrap()
        .with_redirect_cache(Arc::clone(&cache));
    let second = RemoteUrlBackend::new(&server.url("/data.bin"), pool.handle(), &config)
        .unwrap()
        .with_redirect_cache(Arc::clone(&cache));
    assert_eq!(first.identity(), second.identity());

    let read = |backend: &RemoteUrlBackend, offset: u64, length: u64| {
        let request = backend.create_channel().unwrap().create_request();
        request.set_offset(offset);
        request.set_length(length);
        let recorder = EventRecorder::new();
        request.add_listener(recorder.listener());
        request.run();
        recorder
    };

    let head = read(&first, 0, 5000);
    assert!(head.failures().is_empty(), "{:?}", head.failures());
    assert_eq!(head.bytes(), pattern_bytes(0, 5000));
    assert_eq!(server.mirror_hits.load(Ordering::SeqCst), 1);
    assert_eq!(
        cache.cached(first.url()).map(|url| url.path().to_string()),
        Some("/mirror/data.bin".to_string())
    );

    let tail = read(&second, 15_000, TO_END);
    assert!(tail.failures().is_empty(), "{:?}", tail.failures());
    assert_eq!(tail.bytes(), pattern_bytes(15_000, SERVED_LEN));
    assert_eq!(server.mirror_hits.load(Ordering::SeqCst), 1);
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_cancel_from_listener_stops_download() {
    let server = start_server();
    let pool = CountingBufferPool::new();
    let backend =
        RemoteUrlBackend::new(&server.url("/mirror/data.bin"), pool.handle(), &ChannelConfig::for_testing())
            .unwrap();
    let channel = backend.create_channel().unwrap();

    let request = channel.create_request();
    let recorder = EventRecorder::new();
    request.add_listener(recorder.listener());
    let handle = request.clone();
    request.add_listener(Arc::new(move |event: RequestEvent| {
        if let RequestEvent::Success { offset, .. } = event
            && offset >= 4096
        {
            handle.cancel();
        }
    }));
    request.run();

    assert_eq!(recorder.success_ranges(), vec![(0, 4096), (4096, 4096)]);
    let failures = recorder.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].is_cancellation());
    assert!(request.is_cancelled());
    assert!(!channel.is_destroyed());
    assert_eq!(pool.outstanding(), 0);

    // A cancelled exchange never counts against the cached redirect.
    assert!(backend.redirect_cache().is_empty());
}

#[test]
fn test_destroyed_remote_channel_rejects_new_requests() {
    let server = start_server();
    let backend = RemoteUrlBackend::new(
        &server.url("/mirror/data.bin"),
        CountingBufferPool::new().handle(),
        &ChannelConfig::for_testing(),
    )
    .unwrap()
    .with_length(SERVED_LEN);
    assert_eq!(backend.length(), Some(SERVED_LEN));

    let channel = backend.create_channel().unwrap();
    channel.destroy();
    channel.destroy();

    let request = channel.create_request();
    let recorder = EventRecorder::new();
    request.add_listener(recorder.listener());
    request.run();

    assert!(recorder.success_ranges().is_empty());
    assert_eq!(recorder.failures().len(), 1);
    assert!(matches!(
        *recorder.failures()[0],
        riptide_channel::ChannelError::Destroyed
    ));
}
