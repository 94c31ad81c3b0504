//! PostRoute Common - Shared types and utilities
//!
//! This crate provides the mail data model, configuration, and error
//! taxonomy shared across all PostRoute components.

pub mod config;
pub mod error;
pub mod mail;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use mail::{state, Attributes, Mail, Payload};
pub use types::EmailAddress;
