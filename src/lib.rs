//! Chat sessions over a locally hosted LLM inference server.
//!
//! A [`registry::SessionRegistry`] maps session ids to [`session::Session`]s.
//! Each session owns a conversation and a [`lock::SessionLock`] that admits
//! one generation at a time, can be cancelled from outside, and is
//! reclaimable once stale.

pub mod archive;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod http_server;
pub mod inference;
pub mod lmstudio;
pub mod lock;
pub mod registry;
pub mod service;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{Result, SessionError};
