//! Common utilities for usb-bridge
//!
//! This crate provides functionality shared by the bridge library, its
//! binary and the test suites: the application error type, logging setup
//! and a scripted in-memory host for tests.

pub mod error;
pub mod logging;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::setup_logging;
