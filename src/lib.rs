#![forbid(unsafe_code)]

//! Session daemons for stdio JSON-RPC agents, reachable through named pipes,
//! plus the shared coordination store their callers use.

pub mod config;
pub mod controller;
pub mod daemon;
pub mod errors;
pub mod launcher;
pub mod models;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
