//! Secret handling utilities.
//!
//! Re-exports the secrecy types the binary needs to hand the database
//! URL to the pool without logging it.

pub use secrecy::{ExposeSecret, SecretString};
