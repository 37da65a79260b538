//! Synthetic ping output built from traceroute.

pub mod converter;
pub mod stats;

pub use converter::TraceToPing;
