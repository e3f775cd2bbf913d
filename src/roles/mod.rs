//! Process roles and the one-shot copy behaviors.
//!
//! The role is chosen by the first positional argument:
//!
//! | argument | role |
//! |----------|------|
//! | none, `0` | MAIN |
//! | `1` | COPY_1 |
//! | `2` | COPY_2 |
//! | anything else | Unknown, runs as MAIN |

use crate::core::{Segment, SegmentError};
use std::fmt;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Main,
    Copy1,
    Copy2,
    /// Unrecognised argument; dispatched like [`Role::Main`].
    Unknown(String),
}

impl Role {
    pub fn from_arg(arg: Option<&str>) -> Self {
        match arg.map(str::trim) {
            None | Some("0") => Role::Main,
            Some("1") => Role::Copy1,
            Some("2") => Role::Copy2,
            Some(other) => Role::Unknown(other.to_string()),
        }
    }

    /// Argument that selects this role in a spawned process.
    pub fn arg(&self) -> &str {
        match self {
            Role::Main => "0",
            Role::Copy1 => "1",
            Role::Copy2 => "2",
            Role::Unknown(raw) => raw.as_str(),
        }
    }

    /// Name used in `Started ...` / `Finished ...` log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Role::Main => "Main Program",
            Role::Copy1 => "Copy 1",
            Role::Copy2 => "Copy 2",
            Role::Unknown(_) => "Unknown",
        }
    }

    /// Whether this role runs the worker threads and command loop.
    pub fn runs_main(&self) -> bool {
        matches!(self, Role::Main | Role::Unknown(_))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// COPY_1: one bounded increment of the counter.
pub fn run_copy_one(segment: &Segment) -> Result<(), SegmentError> {
    let mut state = segment.lock()?;
    state.counter = state.counter.wrapping_add(10);
    Ok(())
}

/// COPY_2: doubles the counter and marks itself busy, works for `work`
/// without holding the lock, then halves the counter and clears the mark.
pub fn run_copy_two(segment: &Segment, work: Duration) -> Result<(), SegmentError> {
    {
        let mut state = segment.lock()?;
        state.counter = state.counter.wrapping_mul(2);
        state.active_copies += 1;
    }

    thread::sleep(work);

    let mut state = segment.lock()?;
    state.counter /= 2;
    state.active_copies -= 1;
    Ok(())
}
