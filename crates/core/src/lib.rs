//! `rfx-core` — foundation building blocks for event-sourced instances.
//!
//! This crate contains **pure** primitives (no I/O, no async): identifiers,
//! structural patches over JSON documents, and the frames that carry them
//! through a log.

pub mod error;
pub mod frame;
pub mod id;
pub mod patch;

pub use error::{CoreError, CoreResult};
pub use frame::{Frame, Height};
pub use id::{DomainId, FullInstanceId, InstanceId, unique_id};
pub use patch::{Patch, PatchOp, PathSegment, apply_patches, diff};
