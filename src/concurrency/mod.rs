//! Cooperative cancellation primitives shared by workers and adapters.

pub mod cancel_token;

pub use cancel_token::{CancelScope, CancelToken};
