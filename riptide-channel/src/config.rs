//! Centralized configuration for Riptide channels.
//!
//! All tunable parameters are defined here to avoid hard-coded values
//! scattered throughout the backends and the read-ahead pipeline.

use std::time::Duration;

/// Central configuration for all channel components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    pub request: RequestConfig,
    pub remote: RemoteConfig,
    pub stream_tee: StreamTeeConfig,
    pub read_ahead: ReadAheadConfig,
    pub pool: PoolConfig,
}

/// Defaults applied to newly created requests.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Largest chunk delivered in a single success event
    pub default_max_chunk: u32,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_max_chunk: 65536, // 64 KiB
        }
    }
}

/// HTTP(S) range-request configuration for the remote backend.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// TCP/TLS connection establishment timeout
    pub connect_timeout: Duration,
    /// Timeout applied to each body read
    pub read_timeout: Duration,
    /// Maximum redirect hops followed before giving up
    pub max_redirects: usize,
    /// Consecutive failures against a cached redirect before it is dropped
    pub redirect_failure_limit: u32,
    /// Consecutive body read timeouts reported as stalls before the read fails
    pub max_body_stalls: u32,
    /// User agent sent when the request does not carry its own
    pub user_agent: &'static str,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            read_timeout: Duration::from_secs(10),
            max_redirects: 32,
            redirect_failure_limit: 3,
            max_body_stalls: 6,
            user_agent: "riptide-channel/0.1.0",
        }
    }
}

/// Live-stream tee configuration.
#[derive(Debug, Clone)]
pub struct StreamTeeConfig {
    /// Bytes pulled from the source stream per copy iteration
    pub copy_buffer_size: usize,
    /// Upper bound on a single blocking wait before conditions are re-checked
    pub wait_slice: Duration,
    /// Suffix appended to the final name for the working file
    pub temp_suffix: &'static str,
}

impl Default for StreamTeeConfig {
    fn default() -> Self {
        Self {
            copy_buffer_size: 65536, // 64 KiB
            wait_slice: Duration::from_millis(500),
            temp_suffix: "._tmp_",
        }
    }
}

/// Outbound piece read-ahead configuration.
#[derive(Debug, Clone)]
pub struct ReadAheadConfig {
    /// Target bound on loading plus queued piece requests
    pub read_ahead_limit: usize,
}

impl Default for ReadAheadConfig {
    fn default() -> Self {
        Self {
            read_ahead_limit: 4,
        }
    }
}

/// Buffer pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle buffers kept for reuse
    pub max_buffers: usize,
    /// Capacity idle buffers are trimmed to
    pub trim_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_buffers: 256,
            trim_capacity: 1024 * 1024, // 1 MiB
        }
    }
}

impl ChannelConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(max_chunk) = env_parse::<u32>("RIPTIDE_MAX_CHUNK")
            && max_chunk > 0
        {
            config.request.default_max_chunk = max_chunk;
        }

        if let Some(seconds) = env_parse::<u64>("RIPTIDE_CONNECT_TIMEOUT") {
            config.remote.connect_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("RIPTIDE_READ_TIMEOUT") {
            config.remote.read_timeout = Duration::from_secs(seconds);
        }

        if let Some(hops) = env_parse::<usize>("RIPTIDE_MAX_REDIRECTS") {
            config.remote.max_redirects = hops;
        }

        if let Some(limit) = env_parse::<usize>("RIPTIDE_READ_AHEAD") {
            config.read_ahead.read_ahead_limit = limit;
        }

        if let Some(millis) = env_parse::<u64>("RIPTIDE_TEE_WAIT_MS") {
            config.stream_tee.wait_slice = Duration::from_millis(millis);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short waits and small chunks keep blocking paths fast and make
    /// multi-chunk behavior visible with small fixtures.
    pub fn for_testing() -> Self {
        Self {
            request: RequestConfig {
                default_max_chunk: 4096,
            },
            remote: RemoteConfig {
                connect_timeout: Duration::from_secs(5),
                read_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            stream_tee: StreamTeeConfig {
                copy_buffer_size: 1024,
                wait_slice: Duration::from_millis(20),
                ..Default::default()
            },
            read_ahead: ReadAheadConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
