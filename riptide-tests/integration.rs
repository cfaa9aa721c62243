//! Integration tests for riptide-channel
//!
//! These tests drive several components together: backends stacked on
//! other backends, the pull bridge over live and remote sources, and the
//! read-ahead pipeline on real execution contexts.

#[path = "integration/support.rs"]
mod support;

#[path = "integration/local_channel.rs"]
mod local_channel;
#[path = "integration/remote_channel.rs"]
mod remote_channel;
#[path = "integration/stream_tee_channel.rs"]
mod stream_tee_channel;

#[path = "integration/delegate_bridge.rs"]
mod delegate_bridge;
#[path = "integration/read_ahead_pipeline.rs"]
mod read_ahead_pipeline;
