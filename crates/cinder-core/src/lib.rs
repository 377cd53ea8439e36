//! Cinder Core
//!
//! Core domain types, traits, and error handling for Cinder.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod error;
pub mod event;
pub mod ids;
pub mod matrix;
pub mod ports;
pub mod secrets;
pub mod service;
pub mod task;

pub use error::{Error, Result};
pub use ids::*;
