//! Request dispatch to the RealityHub REST API
//!
//! Handles:
//! - Endpoint to URL resolution
//! - Queueing through the priority executor
//! - Consecutive-error tracking and reconnect escalation

mod client;

pub use client::{DispatcherEvent, RequestDispatcher, PROBE_ENDPOINT};
