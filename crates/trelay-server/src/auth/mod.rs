//! Source-IP authorization for cross-connect patches.

pub mod patch;
pub mod snapshot;

pub use patch::PatchAuthorizationCache;
