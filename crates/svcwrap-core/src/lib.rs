//! svcwrap core - platform-independent supervision building blocks
//!
//! This crate provides the configuration model, error types, process traits,
//! log rotation engine, pre-start downloads and status reporting shared by the
//! platform-specific crates.

mod config;
mod copier;
mod download;
mod error;
mod event;
mod extension;
mod process;
mod process_table;
pub mod rotation;
mod status;

pub use config::*;
pub use copier::*;
pub use download::*;
pub use error::*;
pub use event::*;
pub use extension::*;
pub use process::*;
pub use process_table::*;
pub use rotation::{LogConfig, LogHandler, RotationPolicy, StreamSide};
pub use status::*;
