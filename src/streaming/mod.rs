//! The streaming plane
//!
//! Everything between a tuner HTTP request and the upstream source:
//!
//!   - `supervisor`: runs the transcoder subprocess, stdout + typed events
//!   - `stderr_classifier`: the one place stderr text becomes control flow
//!   - `fanout`: one producer → N subscribers over a bounded chunk ring
//!   - `registry`: session records, consumer aliases, activity clocks
//!   - `session`: the per-session state machine and engine facade
//!   - `resilience`: the four-layer recovery ladder
//!   - `resolver`: beacon unwrapping and HLS variant selection
//!   - `segments`: HLS sub-resource resolution with retry policy
//!   - `preview`: the capped browser-preview path
//!   - `client_class`: User-Agent/header/query classification

pub mod client_class;
pub mod fanout;
pub mod preview;
pub mod registry;
pub mod resilience;
pub mod resolver;
pub mod segments;
pub mod session;
pub mod stderr_classifier;
pub mod supervisor;
