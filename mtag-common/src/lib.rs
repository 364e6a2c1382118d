//! # mtag common library
//!
//! Shared code for the mtag services:
//! - Error and result types
//! - Event types (`TagEvent`) and the broadcast `EventBus`
//! - SSE streaming helpers
//! - Config file and data folder resolution

pub mod config;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
