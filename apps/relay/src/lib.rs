//! IPTV streaming relay.
//!
//! One supervisor process spawns N worker processes sharing a listening
//! socket through `SO_REUSEPORT`; each worker runs a single-threaded
//! cooperative runtime multiplexing dozens of HTTP clients and their
//! upstream multicast / FCC / RTSP / HTTP sockets. Media bytes move from
//! the upstream datagram into a pooled buffer exactly once and are queued
//! to clients by reference.

pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod sendq;
pub mod service;
pub mod status;
pub mod stream;
pub mod supervisor;
pub mod worker;

pub use error::RelayError;
