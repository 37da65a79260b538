//! Relay engine: pumps bytes between a client and its upstream.

pub mod engine;

pub use engine::{relay, RelayMode, RelayOutcome};
