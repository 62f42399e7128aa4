//! Model backend implementations for the Warden gateway.
//!
//! Provides concrete implementations of the [`ModelBackend`] trait:
//! - **HTTP** (`HttpModelBackend`): JSON completion endpoint with a hard timeout
//!
//! [`ModelBackend`]: warden_types::traits::ModelBackend

pub mod http;

pub use http::{HttpModelBackend, HttpModelConfig};
