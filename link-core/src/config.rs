//! Host-supplied tunables for the observability link.
//!
//! The core crate never reads a config file itself — the host owns its own
//! configuration story and hands a [`LinkConfig`] to [`crate::server::Server`]
//! at construction time. `Deserialize` is derived purely so a host that
//! already loads JSON/TOML config can decode a `LinkConfig` section without
//! writing its own glue; nothing in this crate calls it.

use serde::Deserialize;
use std::time::Duration;

/// All tunables named in the protocol's configuration table, each defaulted
/// to the value the spec prescribes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LinkConfig {
    /// Duration records remain eligible before window eviction considers
    /// them for removal.
    pub buffer_window: Duration,
    /// Hard cap on buffered record count.
    pub max_buffered_events: usize,
    /// Hard cap on the buffer's estimated encoded byte size.
    pub max_buffered_bytes: usize,
    /// Permit startup in a non-debug build. Checked by the host via
    /// `cfg!(debug_assertions)` and passed through here — the core doesn't
    /// know what "release" means for an arbitrary host.
    pub allow_release: bool,
    pub high_priority_idle_threshold: Duration,
    pub low_priority_retry_delay: Duration,
    pub max_low_priority_defer: Duration,
    pub response_body_delay: Duration,
    pub response_body_stagger: Duration,
    pub high_priority_queue_capacity: usize,
    pub low_priority_queue_capacity: usize,
    pub client_hello_timeout: Duration,
    pub client_hello_max_bytes: usize,
    /// Prefix embedded in the bound socket's name, ahead of the process id.
    pub socket_name_prefix: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            buffer_window: Duration::from_secs(5 * 60),
            max_buffered_events: 10_000,
            max_buffered_bytes: 16 * 1024 * 1024,
            allow_release: false,
            high_priority_idle_threshold: Duration::from_millis(150),
            low_priority_retry_delay: Duration::from_millis(50),
            max_low_priority_defer: Duration::from_millis(2_000),
            response_body_delay: Duration::from_millis(200),
            response_body_stagger: Duration::from_millis(25),
            high_priority_queue_capacity: 512,
            low_priority_queue_capacity: 256,
            client_hello_timeout: Duration::from_millis(1_000),
            client_hello_max_bytes: 4_096,
            socket_name_prefix: "obslink".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_protocol_table() {
        let cfg = LinkConfig::default();
        assert_eq!(cfg.max_buffered_events, 10_000);
        assert_eq!(cfg.max_buffered_bytes, 16 * 1024 * 1024);
        assert_eq!(cfg.high_priority_queue_capacity, 512);
        assert_eq!(cfg.low_priority_queue_capacity, 256);
        assert!(!cfg.allow_release);
    }

    #[test]
    fn deserializes_a_partial_override_over_the_defaults() {
        let cfg: LinkConfig = serde_json::from_str(r#"{"maxBufferedEvents": 4, "allowRelease": true}"#).unwrap();
        assert_eq!(cfg.max_buffered_events, 4);
        assert!(cfg.allow_release);
        assert_eq!(cfg.max_buffered_bytes, 16 * 1024 * 1024);
    }
}
