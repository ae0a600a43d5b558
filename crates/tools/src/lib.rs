//! Tool policy enforcement.
//!
//! Allow/deny lists are layered global → provider → agent → group; see
//! [`policy::LayeredPolicy`] for how the layers combine.

pub mod policy;

pub use policy::{LayeredPolicy, PolicyContext, resolve_policy};
