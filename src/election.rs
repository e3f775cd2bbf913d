//! Leader election over the shared segment
//!
//! A participant claims leadership by writing its process id into an unset
//! `main_process_id` under the segment lock, then checks whether the stored
//! id is its own. Every claim and check happens under the same lock, so at
//! most one process id can be recorded at a time. Losers retry after a short
//! fixed interval until they win or are told to stop.

use crate::core::{Segment, SegmentError, SharedState};
use crate::workers::StopSignal;
use std::time::Duration;

/// Liveness probe used to reclaim leadership from a dead process.
pub type LivenessProbe = fn(u32) -> bool;

pub struct LeaderElection<'a> {
    segment: &'a Segment,
    pid: u32,
    retry: Duration,
    liveness: Option<LivenessProbe>,
}

impl<'a> LeaderElection<'a> {
    pub fn new(segment: &'a Segment, pid: u32, retry: Duration) -> Self {
        Self {
            segment,
            pid,
            retry,
            liveness: None,
        }
    }

    /// Lets a claimant take over when the recorded leader is no longer alive.
    ///
    /// Without a probe, a leader that dies without stepping down keeps the
    /// slot forever.
    pub fn with_liveness(mut self, probe: LivenessProbe) -> Self {
        self.liveness = Some(probe);
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// One claim attempt. Returns whether the caller is now the leader.
    pub fn try_claim(&self) -> Result<bool, SegmentError> {
        let mut state = self.segment.lock()?;
        match state.leader() {
            None => state.set_leader(Some(self.pid)),
            Some(current) if current != self.pid && self.is_dead(current) => {
                tracing::warn!(
                    dead_leader = current,
                    pid = self.pid,
                    "recorded leader is gone, taking over"
                );
                state.set_leader(Some(self.pid));
            }
            Some(_) => {}
        }
        Ok(state.is_leader(self.pid))
    }

    /// Retries [`try_claim`](Self::try_claim) until it succeeds or `stop` fires.
    ///
    /// Returns `Ok(false)` when stopped before winning.
    pub fn wait_for_leadership(&self, stop: &StopSignal) -> Result<bool, SegmentError> {
        loop {
            if self.try_claim()? {
                tracing::info!(pid = self.pid, "became leader");
                return Ok(true);
            }
            if stop.wait(self.retry) {
                return Ok(false);
            }
        }
    }

    /// Whether the caller currently holds leadership.
    pub fn is_leader(&self) -> Result<bool, SegmentError> {
        Ok(self.segment.lock()?.is_leader(self.pid))
    }

    /// Resets leadership if the caller still holds it. Returns whether it did.
    pub fn step_down(&self) -> Result<bool, SegmentError> {
        let mut state = self.segment.lock()?;
        if state.is_leader(self.pid) {
            state.set_leader(None);
            drop(state);
            tracing::info!(pid = self.pid, "stepped down as leader");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn is_dead(&self, pid: u32) -> bool {
        self.liveness.map(|alive| !alive(pid)).unwrap_or(false)
    }
}

/// Leader id as stored in a snapshot, for display.
pub fn describe_leader(state: &SharedState) -> String {
    match state.leader() {
        Some(pid) => pid.to_string(),
        None => "none".to_string(),
    }
}
