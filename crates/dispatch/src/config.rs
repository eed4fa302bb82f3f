//! Dispatcher configuration

use std::time::Duration;

/// Timeouts and buffer sizes of the leader's round handling
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Time allowed for every follower to acknowledge a broadcast
    pub broadcast_timeout: Duration,
    /// Time allowed for follower reports once the leader's own generation ended
    pub report_timeout: Duration,
    /// Time a request may wait for the in-flight round to close
    pub queue_timeout: Duration,
    /// Capacity of the channel between the generation thread and the stream
    pub stream_buffer: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            broadcast_timeout: Duration::from_secs(30),
            report_timeout: Duration::from_secs(60),
            queue_timeout: Duration::from_secs(120),
            stream_buffer: 32,
        }
    }
}
