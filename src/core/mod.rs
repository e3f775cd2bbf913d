//! Shared-memory core
//!
//! Segment layout and the reference-counted attachment built on top of the
//! backends in [`crate::storage`].

pub mod layout;
pub mod shared_segment;

pub use layout::{SharedState, NO_LEADER};
pub use shared_segment::{DetachOutcome, Segment, SegmentError, SegmentGuard, SegmentName};
