//! # huddle-common
//!
//! Shared foundation for the Huddle crates:
//! - Error taxonomy ([`error::HuddleError`])
//! - Layered configuration ([`config`])
//! - JWT claims and validation ([`auth`])
//! - The closed signaling protocol ([`protocol::SignalMessage`])
//!
//! This crate exists so `huddle-relay` and `huddle-mesh` can share the wire
//! protocol and error types without depending on each other.

pub mod auth;
pub mod config;
pub mod error;
pub mod protocol;

pub use error::{HuddleError, HuddleResult};
