#![cfg_attr(docsrs, feature(doc_cfg))]
//! # p1p2gateway_lib
//!
//! Protocol engine for the P1/P2 bus of Daikin heat pumps. It splits the bus
//! byte stream into frames, validates and classifies them, suppresses
//! unchanged data before it is forwarded and, when allowed, takes over the
//! auxiliary controller slot to write parameters.
//!
//! The engine is free of I/O. It is fed bytes and a millisecond clock and
//! answers with [`engine::Event`]s; transport and output are up to the caller.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `p1p2gateway` command-line tool.
//! - `serialport`: Enables the serial bus port using the `serialport` crate.
//! - `bin-dependencies`: Enables all features required by the `p1p2gateway` binary executable.

pub mod command;
pub mod config;
pub mod controller;
/// Contains error types for the library.
mod error;
pub mod engine;
pub mod forward;
pub mod framer;
pub mod history;
/// Frame layout, CRC and packet classification.
pub mod protocol;

pub use config::Config;
pub use engine::{Engine, Event};
pub use error::{Error, Result};

/// Serial port access to the bus.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;
