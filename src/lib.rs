//! Data synchronization layer of the learning hub.
//!
//! [`cache`] holds the resource-agnostic query cache (fetch de-duplication,
//! staleness, prefix invalidation, subscriptions with GC). [`api`] maps the
//! hub's quiz, chat and discussion records onto it, and [`server`] is the
//! record store those records live in.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod query;
pub mod resources;
pub mod server;
pub mod transport;

pub use error::{Error, Result};
