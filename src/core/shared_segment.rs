//! Reference-counted shared segment
//!
//! A [`Segment`] is one process's attachment to a named region. Attaching
//! increments the header's `reference_count` under the segment lock, detaching
//! decrements it and removes the named resources once it reaches zero.

use crate::core::layout::{SegmentHeader, SharedState};
use crate::storage::{RawSegment, SegmentBackend, ShmemBackend};
use shared_memory::ShmemError;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Prefix shared by every backing object this crate creates.
pub const OBJECT_PREFIX: &str = "/taskmem_";
/// Suffix deriving the lock object name from the region name.
pub const LOCK_SUFFIX: &str = "_sem";

const MAX_NAME_LEN: usize = 200;
const ATTACH_ATTEMPTS: usize = 200;
const ATTACH_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("invalid segment name '{0}': use 1-200 ASCII letters, digits, '.', '-' or '_'")]
    InvalidName(String),
    #[error("shared segment '{0}' does not exist")]
    NotFound(String),
    #[error("shared segment '{0}' already exists")]
    AlreadyExists(String),
    #[error("shared memory region too small for segment header")]
    RegionTooSmall,
    #[error("shared memory error: {0}")]
    Shmem(#[from] ShmemError),
    #[error("shared lock init failed: {0}")]
    LockInit(String),
    #[error("shared lock access failed: {0}")]
    Lock(String),
    #[error("segment layout mismatch (magic {magic:#010x}, version {version})")]
    LayoutMismatch { magic: u32, version: u32 },
    #[error("shared segment '{0}' kept being torn down while attaching")]
    Contended(String),
}

/// Logical segment name and the backing object names derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentName(String);

impl SegmentName {
    pub fn new(logical: impl Into<String>) -> Result<Self, SegmentError> {
        let logical = logical.into();
        let valid = !logical.is_empty()
            && logical.len() <= MAX_NAME_LEN
            && logical
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if valid {
            Ok(Self(logical))
        } else {
            Err(SegmentError::InvalidName(logical))
        }
    }

    pub fn logical(&self) -> &str {
        &self.0
    }

    /// Name of the backing memory object.
    pub fn data_id(&self) -> String {
        format!("{OBJECT_PREFIX}{}", self.0)
    }

    /// Name of the paired lock object.
    pub fn lock_id(&self) -> String {
        format!("{}{LOCK_SUFFIX}", self.data_id())
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What happened to the named resources on detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// Other attachments remain; `remaining` is the new reference count.
    Released { remaining: i32 },
    /// This was the last attachment and the resources were removed.
    Destroyed,
}

/// One attachment to a shared segment.
pub struct Segment {
    name: SegmentName,
    created: bool,
    raw: Option<Box<dyn RawSegment>>,
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("created", &self.created)
            .field("attached", &self.raw.is_some())
            .finish()
    }
}

impl Segment {
    /// Attaches to `name` using OS shared memory.
    pub fn attach(name: &str, create_if_missing: bool) -> Result<Self, SegmentError> {
        Self::attach_with(&ShmemBackend, name, create_if_missing)
    }

    /// Attaches through an explicit backend.
    ///
    /// Opens the existing region, or creates it when allowed. A concurrent
    /// creator makes `create` report `AlreadyExists`, in which case the open
    /// is retried. Attachments to a generation that is being destroyed are
    /// dropped and retried as well.
    pub fn attach_with(
        backend: &dyn SegmentBackend,
        name: &str,
        create_if_missing: bool,
    ) -> Result<Self, SegmentError> {
        let name = SegmentName::new(name)?;

        for _ in 0..ATTACH_ATTEMPTS {
            let (raw, created) = match backend.open(&name)? {
                Some(raw) => (raw, false),
                None if !create_if_missing => {
                    return Err(SegmentError::NotFound(name.to_string()))
                }
                None => match backend.create(&name) {
                    Ok(raw) => (raw, true),
                    Err(SegmentError::AlreadyExists(_)) => continue,
                    Err(err) => return Err(err),
                },
            };

            match register(raw.as_ref()) {
                Ok(true) => {
                    tracing::debug!(segment = %name, created, "attached to shared segment");
                    return Ok(Self {
                        name,
                        created,
                        raw: Some(raw),
                    });
                }
                Ok(false) => {
                    drop(raw);
                    thread::sleep(ATTACH_RETRY_DELAY);
                }
                Err(err) => {
                    if created {
                        raw.destroy();
                    }
                    return Err(err);
                }
            }
        }

        Err(SegmentError::Contended(name.to_string()))
    }

    pub fn name(&self) -> &SegmentName {
        &self.name
    }

    /// Whether this attachment created the underlying resources.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Blocks until the cross-process lock is held.
    ///
    /// The lock is not reentrant: calling this while the same thread already
    /// holds a guard deadlocks.
    pub fn lock(&self) -> Result<SegmentGuard<'_>, SegmentError> {
        let raw = self.raw()?;
        raw.lock()?;
        Ok(SegmentGuard {
            raw,
            header: raw.header(),
        })
    }

    /// Copy of the payload, taken under lock.
    pub fn snapshot(&self) -> Result<SharedState, SegmentError> {
        Ok(*self.lock()?)
    }

    pub fn reference_count(&self) -> Result<i32, SegmentError> {
        Ok(self.lock()?.reference_count())
    }

    /// Detaches, destroying the named resources if this was the last attachment.
    pub fn detach(mut self) -> Result<DetachOutcome, SegmentError> {
        self.release()
    }

    fn raw(&self) -> Result<&dyn RawSegment, SegmentError> {
        self.raw
            .as_deref()
            .ok_or_else(|| SegmentError::NotFound(self.name.to_string()))
    }

    fn release(&mut self) -> Result<DetachOutcome, SegmentError> {
        let Some(raw) = self.raw.take() else {
            return Err(SegmentError::NotFound(self.name.to_string()));
        };

        raw.lock()?;
        let remaining = {
            // SAFETY: the lock is held.
            let header = unsafe { &mut *raw.header().as_ptr() };
            header.reference_count -= 1;
            header.reference_count
        };
        let last = remaining <= 0;
        if last {
            raw.retire();
        }
        raw.unlock()?;

        if last {
            raw.destroy();
            tracing::debug!(segment = %self.name, "last attachment gone, segment destroyed");
            Ok(DetachOutcome::Destroyed)
        } else {
            tracing::debug!(segment = %self.name, remaining, "detached from shared segment");
            Ok(DetachOutcome::Released { remaining })
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.raw.is_some() {
            if let Err(err) = self.release() {
                tracing::error!(
                    segment = %self.name,
                    "failed to detach from shared segment: {err}"
                );
            }
        }
    }
}

/// Takes the lock and increments the reference count.
///
/// Returns `Ok(false)` when the attachment raced with the final detach of the
/// previous generation and must be retried.
fn register(raw: &dyn RawSegment) -> Result<bool, SegmentError> {
    raw.lock()?;
    let outcome = if raw.is_retired() {
        Ok(false)
    } else {
        // SAFETY: the lock is held.
        let header = unsafe { &mut *raw.header().as_ptr() };
        if header.is_compatible() {
            header.reference_count += 1;
            Ok(true)
        } else {
            Err(SegmentError::LayoutMismatch {
                magic: header.magic,
                version: header.layout_version,
            })
        }
    };
    raw.unlock()?;
    outcome
}

/// Proof that the segment lock is held; dereferences to the shared payload.
///
/// The lock is released when the guard is dropped.
pub struct SegmentGuard<'a> {
    raw: &'a dyn RawSegment,
    header: NonNull<SegmentHeader>,
}

impl SegmentGuard<'_> {
    pub fn reference_count(&self) -> i32 {
        // SAFETY: the guard holds the lock.
        unsafe { self.header.as_ref().reference_count }
    }

    /// Releases the lock now, reporting failures instead of logging them.
    pub fn unlock(self) -> Result<(), SegmentError> {
        let raw = self.raw;
        std::mem::forget(self);
        raw.unlock()
    }
}

impl Deref for SegmentGuard<'_> {
    type Target = SharedState;

    fn deref(&self) -> &SharedState {
        // SAFETY: the guard holds the lock.
        unsafe { &self.header.as_ref().state }
    }
}

impl DerefMut for SegmentGuard<'_> {
    fn deref_mut(&mut self) -> &mut SharedState {
        // SAFETY: the guard holds the lock and is borrowed mutably.
        unsafe { &mut self.header.as_mut().state }
    }
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.raw.unlock() {
            tracing::error!("failed to release segment lock: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InProcessBackend;
    use pretty_assertions::assert_eq;

    #[test]
    fn names_derive_region_and_lock_objects() {
        let name = SegmentName::new("taskmem").unwrap();
        assert_eq!(name.data_id(), "/taskmem_taskmem");
        assert_eq!(name.lock_id(), "/taskmem_taskmem_sem");
    }

    #[test]
    fn rejects_names_with_separators() {
        assert!(matches!(
            SegmentName::new("a/b"),
            Err(SegmentError::InvalidName(_))
        ));
        assert!(SegmentName::new("").is_err());
    }

    #[test]
    fn first_attach_creates_and_counts_one() {
        let backend = InProcessBackend::new();
        let segment = Segment::attach_with(&backend, "first", true).unwrap();
        assert!(segment.created());
        assert_eq!(segment.reference_count().unwrap(), 1);
        assert_eq!(segment.snapshot().unwrap(), SharedState::default());
    }

    #[test]
    fn attach_without_create_fails_when_missing() {
        let backend = InProcessBackend::new();
        let err = Segment::attach_with(&backend, "missing", false).unwrap_err();
        assert!(matches!(err, SegmentError::NotFound(_)));
        assert!(backend.is_empty());
    }

    #[test]
    fn later_attachers_do_not_reinitialise_state() {
        let backend = InProcessBackend::new();
        let first = Segment::attach_with(&backend, "keep", true).unwrap();
        first.lock().unwrap().counter = 77;

        let second = Segment::attach_with(&backend, "keep", true).unwrap();
        assert!(!second.created());
        assert_eq!(second.snapshot().unwrap().counter, 77);
        assert_eq!(second.reference_count().unwrap(), 2);
    }

    #[test]
    fn detach_destroys_on_last_reference() {
        let backend = InProcessBackend::new();
        let name = SegmentName::new("life").unwrap();
        let a = Segment::attach_with(&backend, "life", true).unwrap();
        let b = Segment::attach_with(&backend, "life", true).unwrap();

        assert_eq!(b.detach().unwrap(), DetachOutcome::Released { remaining: 1 });
        assert!(backend.exists(&name));
        assert_eq!(a.detach().unwrap(), DetachOutcome::Destroyed);
        assert!(!backend.exists(&name));
    }

    #[test]
    fn drop_detaches_exactly_once() {
        let backend = InProcessBackend::new();
        let keeper = Segment::attach_with(&backend, "dropped", true).unwrap();
        {
            let _transient = Segment::attach_with(&backend, "dropped", true).unwrap();
            assert_eq!(keeper.reference_count().unwrap(), 2);
        }
        assert_eq!(keeper.reference_count().unwrap(), 1);
    }

    #[test]
    fn recreated_segment_starts_from_zero() {
        let backend = InProcessBackend::new();
        let segment = Segment::attach_with(&backend, "again", true).unwrap();
        segment.lock().unwrap().counter = 5;
        segment.detach().unwrap();

        let fresh = Segment::attach_with(&backend, "again", true).unwrap();
        assert!(fresh.created());
        assert_eq!(fresh.snapshot().unwrap().counter, 0);
    }

    #[test]
    fn incompatible_layout_is_refused() {
        let backend = InProcessBackend::new();
        let name = SegmentName::new("alien").unwrap();
        let raw = backend.create(&name).unwrap();
        unsafe { (*raw.header().as_ptr()).magic = 1 };

        let err = Segment::attach_with(&backend, "alien", true).unwrap_err();
        assert!(matches!(err, SegmentError::LayoutMismatch { magic: 1, .. }));
    }

    #[test]
    fn explicit_unlock_releases_for_next_lock() {
        let backend = InProcessBackend::new();
        let segment = Segment::attach_with(&backend, "unlock", true).unwrap();
        let mut guard = segment.lock().unwrap();
        guard.counter += 1;
        guard.unlock().unwrap();
        assert_eq!(segment.lock().unwrap().counter, 1);
    }
}
