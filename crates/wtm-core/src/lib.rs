//! Core domain + application logic for the WhatsApp timed-message scheduler.
//!
//! This crate is transport-agnostic. The WhatsApp gateway and the durable
//! store live behind ports (traits) implemented in adapter crates.

pub mod auth;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod events;
pub mod flow;
pub mod format;
pub mod logging;
pub mod memory;
pub mod model;
pub mod normalize;
pub mod repository;
pub mod runtime_config;
pub mod service;
pub mod timeparse;
pub mod transport;
pub mod worker;

pub use errors::{Error, Result};

#[cfg(test)]
pub(crate) mod testing;
