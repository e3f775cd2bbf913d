//! Binary layout of the shared segment
//!
//! Processes attaching to the same segment may be built independently, so the
//! header is a fixed `#[repr(C)]` block of fixed-width integers rather than a
//! generic payload. The offsets below are part of the on-segment contract and
//! are checked at compile time.

/// "TSKM" in little-endian byte order.
pub const SEGMENT_MAGIC: u32 = 0x4D4B_5354;
pub const LAYOUT_VERSION: u32 = 1;

/// Sentinel stored in [`SharedState::main_process_id`] when nobody leads.
pub const NO_LEADER: i64 = -1;

/// Coordination payload shared by every attached process.
///
/// Only accessed through a [`SegmentGuard`](super::shared_segment::SegmentGuard),
/// i.e. while the segment lock is held.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedState {
    pub counter: i64,
    /// COPY_2 instances currently inside their busy window.
    pub active_copies: i64,
    /// MAIN processes currently running their worker threads.
    pub total_processes: i64,
    /// Process id of the current leader, [`NO_LEADER`] when unset.
    pub main_process_id: i64,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            counter: 0,
            active_copies: 0,
            total_processes: 0,
            main_process_id: NO_LEADER,
        }
    }
}

impl SharedState {
    pub fn leader(&self) -> Option<u32> {
        u32::try_from(self.main_process_id).ok()
    }

    pub fn is_leader(&self, pid: u32) -> bool {
        self.main_process_id == i64::from(pid)
    }

    pub fn set_leader(&mut self, pid: Option<u32>) {
        self.main_process_id = pid.map(i64::from).unwrap_or(NO_LEADER);
    }
}

/// Header placed at offset 0 of the data region.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SegmentHeader {
    pub magic: u32,
    pub layout_version: u32,
    pub reference_count: i32,
    /// Random nonce shared with the paired lock object; 0 when unused.
    pub generation: u32,
    pub state: SharedState,
}

impl SegmentHeader {
    pub fn fresh() -> Self {
        Self {
            magic: SEGMENT_MAGIC,
            layout_version: LAYOUT_VERSION,
            reference_count: 0,
            generation: 0,
            state: SharedState::default(),
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.magic == SEGMENT_MAGIC && self.layout_version == LAYOUT_VERSION
    }
}

pub const HEADER_SIZE: usize = 48;
pub const REFERENCE_COUNT_OFFSET: usize = 8;
pub const STATE_OFFSET: usize = 16;

const _: () = {
    assert!(std::mem::size_of::<SegmentHeader>() == HEADER_SIZE);
    assert!(std::mem::align_of::<SegmentHeader>() == 8);
    assert!(std::mem::offset_of!(SegmentHeader, reference_count) == REFERENCE_COUNT_OFFSET);
    assert!(std::mem::offset_of!(SegmentHeader, state) == STATE_OFFSET);
    assert!(std::mem::offset_of!(SharedState, main_process_id) == 24);
};
