//! Segment backends
//!
//! The coordination logic only talks to [`SegmentBackend`] / [`RawSegment`].
//! Two implementations are provided:
//! - [`ShmemBackend`]: named OS shared memory (`shared_memory`) plus a paired
//!   lock object holding a `raw_sync` auto-reset event used as a binary
//!   semaphore. The per-OS code lives inside those crates.
//! - [`InProcessBackend`]: the same contract inside one process, used by tests
//!   and by callers that want several "participants" as threads.

use crate::core::layout::{SegmentHeader, HEADER_SIZE};
use crate::core::shared_segment::{SegmentError, SegmentName};
use dashmap::{mapref::entry::Entry, DashMap};
use rand::Rng;
use parking_lot::{Condvar, Mutex};
use raw_sync::events::{Event, EventImpl, EventInit, EventState};
use raw_sync::Timeout;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Size of the data region; one page holds the header with room to spare.
pub const DATA_SEGMENT_SIZE: usize = 4096;
/// Size of the lock object region.
pub const LOCK_SEGMENT_SIZE: usize = 4096;
/// The event is placed after the lock header, cache-line aligned.
const EVENT_OFFSET: usize = 64;

/// How long an opener waits for a concurrent creator to publish the lock.
const LOCK_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Capability to open or create the named resources behind a segment.
pub trait SegmentBackend: Send + Sync {
    /// Opens an existing region and its lock. `Ok(None)` when the region does not exist.
    fn open(&self, name: &SegmentName) -> Result<Option<Box<dyn RawSegment>>, SegmentError>;

    /// Creates the region and its lock, initialising the header.
    ///
    /// Fails with [`SegmentError::AlreadyExists`] when another process won the
    /// creation race; the caller then falls back to [`open`](Self::open).
    fn create(&self, name: &SegmentName) -> Result<Box<dyn RawSegment>, SegmentError>;
}

/// A mapped region plus its cross-process binary lock.
///
/// Dropping a `RawSegment` unmaps and closes local handles only.
pub trait RawSegment: Send + Sync {
    /// Blocks until the lock is acquired. Not reentrant.
    fn lock(&self) -> Result<(), SegmentError>;
    fn unlock(&self) -> Result<(), SegmentError>;
    /// Pointer to the header at the start of the region.
    fn header(&self) -> NonNull<SegmentHeader>;
    /// Marks the lock object as belonging to a destroyed segment. Called under lock.
    fn retire(&self);
    fn is_retired(&self) -> bool;
    /// Unmaps and removes the named resources.
    fn destroy(self: Box<Self>);
}

/// Published state of a lock object, stored at offset 0 of its region.
#[repr(C)]
struct LockHeader {
    ready: AtomicU32,
    retired: AtomicU32,
    /// Must equal the data header's `generation`.
    generation: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<LockHeader>() <= EVENT_OFFSET);

/// OS shared memory backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShmemBackend;

impl ShmemBackend {
    pub fn new() -> Self {
        Self
    }

    fn open_mapping(os_id: &str, size: usize) -> Result<Option<Shmem>, SegmentError> {
        match ShmemConf::new().os_id(os_id).size(size).open() {
            Ok(shm) => Ok(Some(shm)),
            Err(ShmemError::MapOpenFailed(_))
            | Err(ShmemError::LinkDoesNotExist)
            | Err(ShmemError::NoLinkOrOsId) => Ok(None),
            Err(err) => Err(SegmentError::from(err)),
        }
    }

    fn create_lock(
        os_id: &str,
        generation: u32,
    ) -> Result<(Shmem, Box<dyn EventImpl>), SegmentError> {
        let conf = || ShmemConf::new().os_id(os_id).size(LOCK_SEGMENT_SIZE);
        let mut shm = match conf().create() {
            Ok(shm) => shm,
            Err(ShmemError::MappingIdExists) => {
                // No data region exists, so this lock object belongs to a
                // generation that was torn down midway: unlink it and start over.
                if let Some(mut stale) = Self::open_mapping(os_id, LOCK_SEGMENT_SIZE)? {
                    stale.set_owner(true);
                }
                conf().create()?
            }
            Err(err) => return Err(SegmentError::from(err)),
        };
        shm.set_owner(false);

        let base = shm.as_ptr();
        let event_ptr = unsafe { base.add(EVENT_OFFSET) };
        if EVENT_OFFSET + Event::size_of(Some(event_ptr)) > shm.len() {
            shm.set_owner(true);
            return Err(SegmentError::RegionTooSmall);
        }

        let init = unsafe { Event::new(event_ptr, true) }
            .and_then(|(event, _)| event.set(EventState::Signaled).map(|_| event));
        let event = match init {
            Ok(event) => event,
            Err(err) => {
                shm.set_owner(true);
                return Err(SegmentError::LockInit(format!(
                    "failed to create lock object {os_id}: {err}"
                )));
            }
        };

        let header = lock_header(&shm);
        header.generation.store(generation, Ordering::Relaxed);
        header.ready.store(1, Ordering::Release);
        Ok((shm, event))
    }

    fn open_lock(os_id: &str) -> Result<(Shmem, Box<dyn EventImpl>), SegmentError> {
        let deadline = Instant::now() + LOCK_PUBLISH_TIMEOUT;
        let shm = loop {
            match Self::open_mapping(os_id, LOCK_SEGMENT_SIZE)? {
                Some(shm) if lock_header(&shm).ready.load(Ordering::Acquire) == 1 => break shm,
                _ if Instant::now() >= deadline => {
                    return Err(SegmentError::LockInit(format!(
                        "lock object {os_id} was not published within {:?}",
                        LOCK_PUBLISH_TIMEOUT
                    )));
                }
                _ => thread::sleep(LOCK_POLL_INTERVAL),
            }
        };

        let (event, _) = unsafe { Event::from_existing(shm.as_ptr().add(EVENT_OFFSET)) }
            .map_err(|err| {
                SegmentError::LockInit(format!("failed to open lock object {os_id}: {err}"))
            })?;
        Ok((shm, event))
    }
}

impl SegmentBackend for ShmemBackend {
    fn open(&self, name: &SegmentName) -> Result<Option<Box<dyn RawSegment>>, SegmentError> {
        let Some(data) = Self::open_mapping(&name.data_id(), DATA_SEGMENT_SIZE)? else {
            return Ok(None);
        };
        if data.len() < HEADER_SIZE {
            return Err(SegmentError::RegionTooSmall);
        }
        let (lock, event) = Self::open_lock(&name.lock_id())?;
        Ok(Some(Box::new(ShmemSegment { event, data, lock })))
    }

    fn create(&self, name: &SegmentName) -> Result<Box<dyn RawSegment>, SegmentError> {
        let mut data = match ShmemConf::new()
            .os_id(name.data_id())
            .size(DATA_SEGMENT_SIZE)
            .create()
        {
            Ok(shm) => shm,
            Err(ShmemError::MappingIdExists) => {
                return Err(SegmentError::AlreadyExists(name.to_string()))
            }
            Err(err) => return Err(SegmentError::from(err)),
        };
        // the region must outlive its creator; the last detach unlinks it
        data.set_owner(false);

        if data.len() < HEADER_SIZE {
            data.set_owner(true);
            return Err(SegmentError::RegionTooSmall);
        }
        // Initialised before the lock is published, so no opener can see it half-written.
        let generation = new_generation();
        unsafe {
            std::ptr::write(
                data.as_ptr() as *mut SegmentHeader,
                SegmentHeader {
                    generation,
                    ..SegmentHeader::fresh()
                },
            );
        }

        match Self::create_lock(&name.lock_id(), generation) {
            Ok((lock, event)) => Ok(Box::new(ShmemSegment { event, data, lock })),
            Err(err) => {
                data.set_owner(true);
                Err(err)
            }
        }
    }
}

/// Nonce pairing a data region with the lock object created alongside it.
fn new_generation() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

fn lock_header(shm: &Shmem) -> &LockHeader {
    // SAFETY: every lock region is at least LOCK_SEGMENT_SIZE bytes, page aligned,
    // and LockHeader consists of atomics only.
    unsafe { &*(shm.as_ptr() as *const LockHeader) }
}

/// Field order matters: the event handle is dropped before the mappings.
struct ShmemSegment {
    event: Box<dyn EventImpl>,
    data: Shmem,
    lock: Shmem,
}

// SAFETY: the event is a process-shared primitive designed to be used from any
// thread, and the data region is only dereferenced while that event is held.
unsafe impl Send for ShmemSegment {}
unsafe impl Sync for ShmemSegment {}

impl RawSegment for ShmemSegment {
    fn lock(&self) -> Result<(), SegmentError> {
        self.event
            .wait(Timeout::Infinite)
            .map_err(|err| SegmentError::Lock(err.to_string()))
    }

    fn unlock(&self) -> Result<(), SegmentError> {
        self.event
            .set(EventState::Signaled)
            .map_err(|err| SegmentError::Lock(err.to_string()))
    }

    fn header(&self) -> NonNull<SegmentHeader> {
        // SAFETY: a successful mapping never yields a null base address.
        unsafe { NonNull::new_unchecked(self.data.as_ptr() as *mut SegmentHeader) }
    }

    fn retire(&self) {
        lock_header(&self.lock).retired.store(1, Ordering::Release);
    }

    /// Also true when the data region and the lock belong to different
    /// generations: the region was mapped just before its last detach and
    /// the lock opened after a successor published its own.
    fn is_retired(&self) -> bool {
        let lock = lock_header(&self.lock);
        // SAFETY: the generation is written once, before the lock is published.
        let data_generation = unsafe { (*self.header().as_ptr()).generation };
        lock.retired.load(Ordering::Acquire) == 1
            || lock.generation.load(Ordering::Relaxed) != data_generation
    }

    fn destroy(self: Box<Self>) {
        let ShmemSegment {
            event,
            mut data,
            mut lock,
        } = *self;
        drop(event);
        // Lock object first. A successor can only be created once the data
        // region is unlinked, so this never removes a successor's lock.
        lock.set_owner(true);
        drop(lock);
        data.set_owner(true);
        drop(data);
    }
}

/// In-process backend: named regions live in a shared map owned by the backend.
///
/// Clones share the same namespace, so several "participants" can be
/// simulated as threads holding their own attachments.
#[derive(Default, Clone)]
pub struct InProcessBackend {
    regions: Arc<DashMap<String, Arc<InProcessRegion>>>,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the named resources currently exist.
    pub fn exists(&self, name: &SegmentName) -> bool {
        self.regions.contains_key(&name.data_id())
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    fn handle(&self, key: String, region: Arc<InProcessRegion>) -> Box<dyn RawSegment> {
        Box::new(InProcessSegment {
            key,
            region,
            regions: Arc::clone(&self.regions),
        })
    }
}

impl fmt::Debug for InProcessBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessBackend")
            .field("regions", &self.regions.len())
            .finish()
    }
}

impl SegmentBackend for InProcessBackend {
    fn open(&self, name: &SegmentName) -> Result<Option<Box<dyn RawSegment>>, SegmentError> {
        let key = name.data_id();
        let region = self.regions.get(&key).map(|entry| Arc::clone(entry.value()));
        Ok(region.map(|region| self.handle(key, region)))
    }

    fn create(&self, name: &SegmentName) -> Result<Box<dyn RawSegment>, SegmentError> {
        let key = name.data_id();
        let region = match self.regions.entry(key.clone()) {
            Entry::Occupied(_) => return Err(SegmentError::AlreadyExists(name.to_string())),
            Entry::Vacant(slot) => {
                let region = Arc::new(InProcessRegion::new());
                slot.insert(Arc::clone(&region));
                region
            }
        };
        Ok(self.handle(key, region))
    }
}

/// Binary semaphore plus header storage.
struct InProcessRegion {
    held: Mutex<bool>,
    released: Condvar,
    retired: AtomicBool,
    header: UnsafeCell<SegmentHeader>,
}

// SAFETY: `header` is only dereferenced by the thread holding the semaphore.
unsafe impl Sync for InProcessRegion {}
unsafe impl Send for InProcessRegion {}

impl InProcessRegion {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
            retired: AtomicBool::new(false),
            header: UnsafeCell::new(SegmentHeader::fresh()),
        }
    }
}

struct InProcessSegment {
    key: String,
    region: Arc<InProcessRegion>,
    regions: Arc<DashMap<String, Arc<InProcessRegion>>>,
}

impl RawSegment for InProcessSegment {
    fn lock(&self) -> Result<(), SegmentError> {
        let mut held = self.region.held.lock();
        while *held {
            self.region.released.wait(&mut held);
        }
        *held = true;
        Ok(())
    }

    fn unlock(&self) -> Result<(), SegmentError> {
        let mut held = self.region.held.lock();
        if !*held {
            return Err(SegmentError::Lock(format!("{} is not locked", self.key)));
        }
        *held = false;
        drop(held);
        self.region.released.notify_one();
        Ok(())
    }

    fn header(&self) -> NonNull<SegmentHeader> {
        // SAFETY: UnsafeCell::get never returns null.
        unsafe { NonNull::new_unchecked(self.region.header.get()) }
    }

    fn retire(&self) {
        self.region.retired.store(true, Ordering::Release);
    }

    fn is_retired(&self) -> bool {
        self.region.retired.load(Ordering::Acquire)
    }

    fn destroy(self: Box<Self>) {
        self.regions
            .remove_if(&self.key, |_, region| Arc::ptr_eq(region, &self.region));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DetachOutcome, Segment};
    use serial_test::serial;

    fn name(raw: &str) -> SegmentName {
        SegmentName::new(raw).unwrap()
    }

    #[test]
    fn in_process_create_then_open_shares_the_header() {
        let backend = InProcessBackend::new();
        let created = backend.create(&name("shared")).unwrap();
        let opened = backend.open(&name("shared")).unwrap().expect("region exists");
        assert_eq!(created.header(), opened.header());
    }

    #[test]
    fn in_process_second_create_reports_existing() {
        let backend = InProcessBackend::new();
        let _first = backend.create(&name("dup")).unwrap();
        assert!(matches!(
            backend.create(&name("dup")),
            Err(SegmentError::AlreadyExists(_))
        ));
    }

    #[test]
    fn in_process_open_missing_is_none() {
        let backend = InProcessBackend::new();
        assert!(backend.open(&name("absent")).unwrap().is_none());
    }

    #[test]
    fn in_process_destroy_removes_only_its_own_generation() {
        let backend = InProcessBackend::new();
        let old = backend.create(&name("gen")).unwrap();
        old.destroy();
        assert!(!backend.exists(&name("gen")));

        let stale = backend.create(&name("gen")).unwrap();
        let stale_header = stale.header();
        backend.regions.remove(&name("gen").data_id());
        let fresh = backend.create(&name("gen")).unwrap();
        assert_ne!(stale_header, fresh.header());
        stale.destroy();
        assert!(backend.exists(&name("gen")));
    }

    #[test]
    fn in_process_lock_excludes_other_threads() {
        let backend = InProcessBackend::new();
        let raw: Arc<dyn RawSegment> = Arc::from(backend.create(&name("excl")).unwrap());
        raw.lock().unwrap();

        let contender = Arc::clone(&raw);
        let acquired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&acquired);
        let handle = thread::spawn(move || {
            contender.lock().unwrap();
            flag.store(true, Ordering::SeqCst);
            contender.unlock().unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        raw.unlock().unwrap();
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    #[serial]
    fn region_from_a_destroyed_generation_is_never_accepted() {
        let name = name(&format!("tm_{}_generation", std::process::id()));
        let first = Segment::attach(name.logical(), true).unwrap();
        let stale_data = ShmemBackend::open_mapping(&name.data_id(), DATA_SEGMENT_SIZE)
            .unwrap()
            .expect("first generation is mapped");
        assert_eq!(first.detach().unwrap(), DetachOutcome::Destroyed);

        let second = Segment::attach(name.logical(), true).unwrap();
        let (lock, event) = ShmemBackend::open_lock(&name.lock_id()).unwrap();
        let mixed = ShmemSegment {
            event,
            data: stale_data,
            lock,
        };
        assert!(mixed.is_retired());

        let current = ShmemBackend
            .open(&name)
            .unwrap()
            .expect("second generation exists");
        assert!(!current.is_retired());

        drop(mixed);
        drop(current);
        second.lock().unwrap().counter = 3;
        let again = Segment::attach(name.logical(), false).unwrap();
        assert_eq!(again.snapshot().unwrap().counter, 3);
    }

    #[test]
    fn in_process_unlock_without_lock_fails() {
        let backend = InProcessBackend::new();
        let raw = backend.create(&name("loose")).unwrap();
        assert!(matches!(raw.unlock(), Err(SegmentError::Lock(_))));
    }
}
