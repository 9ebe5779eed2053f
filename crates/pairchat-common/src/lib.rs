//! Common types and utilities shared by the pairchat server and its clients.
//!
//! This crate provides:
//! - JSON chat event encoding and decoding ([`event`])
//! - Message length limiting and markup escaping ([`text`])
//! - Identity types and protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod event;
pub mod text;
pub mod types;

pub use event::{ClientEvent, EventError, ServerEvent};
pub use types::{SessionIdentity, Token};
