//! Local stand-in for the remote processing API.
//!
//! The stub accepts an upload on `POST /img`, re-encodes it as PNG without any
//! processing and publishes it on the receive topic, so the whole hand-off can
//! run against a local broker.

pub mod stub;

pub use stub::{router, serve, StubState};
