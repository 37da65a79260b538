//! Client-facing transport.

pub mod tls;

pub use tls::{start_listener, TlsConnection};
