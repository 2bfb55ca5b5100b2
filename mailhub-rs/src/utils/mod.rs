//! Utility modules
//!
//! - [`dns`]: MX lookup
//! - [`email`]: address validation

pub mod dns;
pub mod email;

pub use email::{domain_of, validate_email};
