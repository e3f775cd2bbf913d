//! Worker threads of a MAIN process
//!
//! - counter updater: `counter += 1` every tick, no leadership needed
//! - logger: after winning leadership, writes the counter to the task log
//!   every tick and steps down when stopped
//! - copy spawner: after winning leadership, launches COPY_1 and COPY_2 every
//!   tick unless copies are still busy
//!
//! Cancellation is cooperative. Each loop waits on a [`StopSignal`] between
//! ticks, so a stop request is observed within one interval, or once a
//! pending lock wait resolves.

use crate::config::Settings;
use crate::core::Segment;
use crate::election::LeaderElection;
use crate::error::TaskmemResult;
use crate::platform;
use crate::roles::Role;
use crate::supervisor::ProcessSpawner;
use crate::task_log::{tolerate, SharedLog};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Owner side of the stop signal. Stopping is idempotent.
#[derive(Debug)]
pub struct StopHandle {
    sender: Option<Sender<()>>,
}

/// Listener side; cheap to clone into every worker.
#[derive(Debug, Clone)]
pub struct StopSignal {
    receiver: Receiver<()>,
}

impl StopHandle {
    pub fn new() -> (StopHandle, StopSignal) {
        let (sender, receiver) = channel::bounded(0);
        (
            StopHandle {
                sender: Some(sender),
            },
            StopSignal { receiver },
        )
    }

    /// Wakes every waiting listener.
    pub fn stop(&mut self) {
        // disconnecting the channel is the broadcast
        self.sender.take();
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps up to `timeout`; returns `true` as soon as a stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(
            self.receiver.recv_timeout(timeout),
            Err(RecvTimeoutError::Timeout)
        )
    }
}

/// Everything a worker needs, shared between the three threads.
pub struct WorkerContext {
    pub segment: Arc<Segment>,
    pub log: SharedLog,
    pub settings: Settings,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub pid: u32,
    /// Program launched for copies; normally the running executable.
    pub program: PathBuf,
}

impl WorkerContext {
    fn election(&self) -> LeaderElection<'_> {
        let election = LeaderElection::new(&self.segment, self.pid, self.settings.leader_retry());
        if self.settings.reclaim_dead_leader {
            election.with_liveness(platform::process_alive)
        } else {
            election
        }
    }
}

/// Adds one to the counter every `counter_interval`.
pub fn run_counter(ctx: &WorkerContext, stop: &StopSignal) -> TaskmemResult<()> {
    let interval = ctx.settings.counter_interval();
    while !stop.is_stopped() {
        {
            let mut state = ctx.segment.lock()?;
            state.counter = state.counter.wrapping_add(1);
        }
        if stop.wait(interval) {
            break;
        }
    }
    Ok(())
}

/// Logs the counter while leader; steps down on the way out.
pub fn run_logger(ctx: &WorkerContext, stop: &StopSignal) -> TaskmemResult<()> {
    let election = ctx.election();
    let interval = ctx.settings.logger_interval();

    if election.wait_for_leadership(stop)? {
        while !stop.is_stopped() {
            let counter = ctx.segment.lock()?.counter;
            tolerate(
                ctx.log.log(&ctx.segment, &format!("Counter: {counter}")),
                "log counter",
            )?;
            if stop.wait(interval) {
                break;
            }
        }
    }

    election.step_down()?;
    Ok(())
}

/// Launches a pair of copies every `spawner_interval` while leader.
pub fn run_copy_spawner(ctx: &WorkerContext, stop: &StopSignal) -> TaskmemResult<()> {
    let interval = ctx.settings.spawner_interval();

    if !ctx.election().wait_for_leadership(stop)? {
        return Ok(());
    }

    while !stop.is_stopped() {
        spawn_round(ctx)?;
        ctx.spawner.reap();
        if stop.wait(interval) {
            break;
        }
    }
    Ok(())
}

/// One spawner decision. The lock stays held across the launches so two
/// leaders' rounds can never interleave.
pub fn spawn_round(ctx: &WorkerContext) -> TaskmemResult<SpawnDecision> {
    let state = ctx.segment.lock()?;

    if state.active_copies > 0 {
        let busy = state.active_copies;
        tolerate(
            ctx.log.append(
                &state,
                &format!("Failed to start copies: {busy} copies are still running."),
            ),
            "log copy contention",
        )?;
        return Ok(SpawnDecision::Busy(busy));
    }

    if !ctx.settings.spawn_copies {
        return Ok(SpawnDecision::Disabled);
    }

    let mut launched = 0;
    for role in [Role::Copy1, Role::Copy2] {
        let outcome = ctx.spawner.spawn(&ctx.program, &[role.arg().to_string()]);
        if outcome.is_success() {
            launched += 1;
        } else {
            tracing::warn!(role = role.label(), status = outcome.status, "copy launch failed");
            tolerate(
                ctx.log.append(
                    &state,
                    &format!("Failed to start {}: status {}", role.label(), outcome.status),
                ),
                "log copy launch failure",
            )?;
        }
    }
    Ok(SpawnDecision::Launched(launched))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnDecision {
    /// Copies were still running; carries `active_copies`.
    Busy(i64),
    /// Number of copies launched successfully.
    Launched(usize),
    Disabled,
}

type WorkerFn = fn(&WorkerContext, &StopSignal) -> TaskmemResult<()>;

/// The running worker threads of a MAIN process.
pub struct Workers {
    stop: StopHandle,
    handles: Vec<(&'static str, JoinHandle<TaskmemResult<()>>)>,
}

impl Workers {
    /// Starts the counter, logger and copy spawner threads.
    pub fn start(ctx: Arc<WorkerContext>) -> TaskmemResult<Self> {
        let (stop, signal) = StopHandle::new();
        let mut workers = Self {
            stop,
            handles: Vec::with_capacity(3),
        };

        let roles: [(&'static str, WorkerFn); 3] = [
            ("counter", run_counter),
            ("logger", run_logger),
            ("copy-spawner", run_copy_spawner),
        ];
        for (name, body) in roles {
            let ctx = Arc::clone(&ctx);
            let signal = signal.clone();
            let spawned = thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    let result = body(&ctx, &signal);
                    if let Err(err) = &result {
                        tracing::error!(worker = name, "worker failed: {err}");
                    }
                    result
                });
            match spawned {
                Ok(handle) => workers.handles.push((name, handle)),
                Err(err) => {
                    // join whatever already started before reporting
                    let _ = workers.shutdown();
                    return Err(crate::error::errors::process_error(
                        format!("failed to start {name} thread: {err}"),
                        name,
                        Some(err),
                    ));
                }
            }
        }

        Ok(workers)
    }

    /// Whether any worker has already exited on its own.
    pub fn any_finished(&self) -> bool {
        self.handles.iter().any(|(_, handle)| handle.is_finished())
    }

    /// Signals every worker to stop and joins them.
    ///
    /// Returns the first worker error, if any.
    pub fn shutdown(mut self) -> TaskmemResult<()> {
        self.stop.stop();
        let mut first_error = None;
        for (name, handle) in self.handles.drain(..) {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(_) => {
                    first_error.get_or_insert(crate::error::TaskmemError::Concurrency {
                        message: format!("{name} thread panicked"),
                        operation: Some(name.to_string()),
                    });
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
