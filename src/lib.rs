//! Integrity verification of mirrored OCI registries.
//!
//! Two strategies are offered.  [`compare::StructuralComparator`] walks both registries and diffs
//! everything it finds.  [`verify::TargetedVerifier`] reads the expected artifact set out of the
//! source's own metadata and looks up only that set in the target.

pub mod compare;
pub mod config;
pub mod digest;
pub mod error;
pub mod inventory;
pub mod layers;
pub mod layout;
mod pool;
pub mod reference;
pub mod registry;
pub mod report;
pub mod verify;

pub use error::{Error, Result};
