//! Upstream drivers: each maps one service kind onto the client sink.
//!
//! A driver owns its upstream sockets and runs a single `select!` loop in
//! the connection's task: upstream readiness feeds packets in, the sink
//! pumps bytes out and watches the client for disconnect. Every exit path
//! unwinds the upstream (multicast leave, FCC terminate, RTSP teardown)
//! before the connection closes.

pub mod fcc;
pub mod multicast;
pub mod pipeline;
pub mod proxy;
pub mod rtsp;

pub use pipeline::RtpPipeline;
