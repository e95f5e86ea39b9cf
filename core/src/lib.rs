//! Shared types and pure logic for opsdeck: the snapshot model, the stream
//! envelope and its push-stream codec, client-side reconciliation, and the
//! upstream circuit breaker.

pub mod auth;
pub mod cooldown;
pub mod envelope;
pub mod error;
pub mod failure;
pub mod model;
pub mod reconcile;
pub mod sse;
