//! Overvis Meter Bridge Library
//!
//! This library polls an Overvis smart meter / relay over its session-authenticated
//! HTTP API and turns the device's raw counters and bit fields into normalized events.

pub mod config;
pub mod decoder;
pub mod device_client;
pub mod error;
pub mod events;
pub mod overvis;
pub mod request_queue;
pub mod session;
pub mod state_store;

// Re-export commonly used types for easier access
pub use config::{Config, Timings};
pub use error::{Error, Result};
pub use events::{Command, Event};
pub use overvis::Overvis;
pub use request_queue::RequestQueue;
pub use state_store::StateStore;
