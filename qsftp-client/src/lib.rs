//! QSFTP Client Library
//!
//! This module provides the client implementation for QSFTP,
//! including CLI interface and library functions.

pub mod cli;
pub mod client;

pub use cli::run_cli;
pub use client::{ClientConfig, QsftpClient};
