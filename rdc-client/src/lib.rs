//! # rdc-client
//!
//! Headless command-line client for the `rdc-core` session engine.
//! Loads a TOML configuration, connects, renders the remote desktop
//! into a software framebuffer and logs session statistics.

pub mod config;
pub mod display;
