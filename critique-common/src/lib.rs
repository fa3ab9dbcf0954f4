//! # Critique Common Library
//!
//! Shared code for the critique services:
//! - Error type used by store and configuration code
//! - Event types (`CritiqueEvent`) and the `EventBus` progress channel
//! - Bootstrap TOML configuration and root folder resolution

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
