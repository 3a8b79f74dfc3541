//! Overlay Core - Domain models, filter predicates, and configuration
//!
//! This crate contains the domain types shared by every overlay crate:
//! geographies and their clipping layers, fragments, spatial metric rows,
//! the feature filter predicate, the error taxonomy and layered configuration.

pub mod config;
pub mod error;
pub mod filter;
pub mod models;

pub use error::{OverlayError, Result};
