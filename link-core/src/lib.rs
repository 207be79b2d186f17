//! Core of the on-device observability link: the connection lifecycle,
//! feature-multiplexed protocol, bounded event buffer, and dual-priority
//! session writer described in this workspace's design notes.
//!
//! This crate has no opinion on *what* telemetry flows over it — concrete
//! features (e.g. the `network` feature in the sibling `link-feature-network`
//! crate) are registered against a [`Server`] at startup and publish their
//! own records through a [`feature::Sink`].
//!
//! Nothing in this crate initializes a `tracing` subscriber; that is the
//! embedding host's responsibility. Nothing in this crate reads
//! configuration from disk; the host constructs a [`config::LinkConfig`] and
//! hands it to [`Server::bind`].

pub mod buffer;
pub mod config;
pub mod errors;
pub mod feature;
pub mod server;
pub mod session;

pub use buffer::EventBuffer;
pub use config::LinkConfig;
pub use errors::{HandshakeError, ServerError, SessionError};
pub use feature::{ClientId, Feature, FeatureRegistry, Priority, Sink};
pub use server::{HostInfo, Server};
pub use session::{HelloInfo, SessionState};
