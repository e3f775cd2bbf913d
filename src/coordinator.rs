//! Process lifecycle
//!
//! Every role attaches to the segment, truncates the task log when no MAIN is
//! running, logs `Started <label>`, runs its behavior, logs `Finished <label>`
//! and detaches. MAIN additionally registers itself in `total_processes`,
//! runs the worker threads and serves interactive commands until `exit`, end
//! of input, a termination signal or a failed worker.

use crate::commands::interactive::{parse_value, InteractiveCommand, ParseError};
use crate::config::Settings;
use crate::core::Segment;
use crate::election::describe_leader;
use crate::error::{errors, TaskmemResult};
use crate::platform;
use crate::roles::{self, Role};
use crate::signal;
use crate::storage::{SegmentBackend, ShmemBackend};
use crate::supervisor::{CommandSpawner, ProcessSpawner};
use crate::task_log::{tolerate, SharedLog};
use crate::workers::{WorkerContext, Workers};
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How often the command loop looks at signals and worker health while idle.
const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One run of the program in a given role.
pub struct Session<'a> {
    settings: Settings,
    role: Role,
    backend: &'a dyn SegmentBackend,
    spawner: Arc<dyn ProcessSpawner>,
    program: PathBuf,
    pid: u32,
}

impl<'a> Session<'a> {
    /// Session that launches copies of the running executable.
    pub fn new(
        settings: Settings,
        role: Role,
        backend: &'a dyn SegmentBackend,
    ) -> TaskmemResult<Self> {
        let program = std::env::current_exe().map_err(|err| {
            errors::process_error(
                "cannot locate the running executable",
                "current_exe",
                Some(err),
            )
        })?;
        let spawner: Arc<dyn ProcessSpawner> =
            Arc::new(CommandSpawner::new(settings.child_env()));
        Ok(Self {
            settings,
            role,
            backend,
            spawner,
            program,
            pid: platform::current_pid(),
        })
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Runs the role to completion.
    ///
    /// `input` delivers interactive lines (MAIN only); a disconnected channel
    /// counts as `exit`. Console messages go to `out`.
    pub fn run(self, input: Receiver<String>, out: &mut dyn Write) -> TaskmemResult<()> {
        let segment = Segment::attach_with(self.backend, &self.settings.segment_name, true)?;
        let log = SharedLog::new(self.settings.log_file.clone(), self.pid);

        tolerate(log.truncate_if_idle(&segment).map(|_| ()), "truncate task log")?;
        tolerate(
            log.log(&segment, &format!("Started {}", self.role.label())),
            "log startup",
        )?;
        tracing::info!(role = %self.role, pid = self.pid, segment = %segment.name(), "started");

        let segment = Arc::new(segment);
        let outcome: TaskmemResult<()> = match &self.role {
            Role::Copy1 => roles::run_copy_one(&segment).map_err(Into::into),
            Role::Copy2 => {
                roles::run_copy_two(&segment, self.settings.copy_work()).map_err(Into::into)
            }
            Role::Main | Role::Unknown(_) => {
                self.run_main(Arc::clone(&segment), &log, &input, out)
            }
        };

        let finished = tolerate(
            log.log(&segment, &format!("Finished {}", self.role.label())),
            "log shutdown",
        );

        match Arc::try_unwrap(segment) {
            Ok(segment) => {
                segment.detach()?;
            }
            // a worker still holds a reference; its drop detaches
            Err(shared) => drop(shared),
        }
        tracing::info!(role = %self.role, pid = self.pid, "finished");

        outcome.and(finished)
    }

    fn run_main(
        &self,
        segment: Arc<Segment>,
        log: &SharedLog,
        input: &Receiver<String>,
        out: &mut dyn Write,
    ) -> TaskmemResult<()> {
        writeln!(
            out,
            "Started {} : PID={}. Log file: {}",
            self.program.display(),
            self.pid,
            log.path().display()
        )?;
        out.flush()?;

        {
            let mut state = segment.lock()?;
            state.total_processes += 1;
        }

        let ctx = Arc::new(WorkerContext {
            segment: Arc::clone(&segment),
            log: log.clone(),
            settings: self.settings.clone(),
            spawner: Arc::clone(&self.spawner),
            pid: self.pid,
            program: self.program.clone(),
        });

        let workers = match Workers::start(Arc::clone(&ctx)) {
            Ok(workers) => workers,
            Err(err) => {
                unregister(&segment);
                return Err(err);
            }
        };

        let looped = command_loop(&segment, input, &workers, out);

        // console failures must not skip the unregister or the join
        let exiting = writeln!(out, "Exiting...");
        unregister(&segment);
        let joined = workers.shutdown();
        drop(ctx);
        let goodbye = writeln!(out, "Goodbye!").and_then(|()| out.flush());

        looped.and(joined).and(exiting.map_err(Into::into)).and(goodbye.map_err(Into::into))
    }
}

fn unregister(segment: &Segment) {
    match segment.lock() {
        Ok(mut state) => state.total_processes -= 1,
        Err(err) => tracing::error!("failed to unregister main process: {err}"),
    }
}

/// Serves commands until exit. Errors only when the console itself fails.
fn command_loop(
    segment: &Segment,
    input: &Receiver<String>,
    workers: &Workers,
    out: &mut dyn Write,
) -> TaskmemResult<()> {
    while let Some(line) = next_line(input, workers) {
        let command = match InteractiveCommand::parse(&line) {
            Ok(command) => command,
            Err(ParseError::Empty) => continue,
            Err(ParseError::UnknownCommand(word)) => {
                writeln!(out, "Unknown command: {word}")?;
                continue;
            }
            Err(ParseError::InvalidValue(raw)) => {
                writeln!(out, "Invalid counter value: {raw}")?;
                continue;
            }
        };

        match command {
            InteractiveCommand::Exit => break,
            InteractiveCommand::Modify(value) => {
                let value = match value {
                    Some(value) => value,
                    None => {
                        write!(out, "Enter new counter value: ")?;
                        out.flush()?;
                        let Some(raw) = next_line(input, workers) else {
                            break;
                        };
                        match parse_value(&raw) {
                            Ok(value) => value,
                            Err(_) => {
                                writeln!(out, "Invalid counter value: {}", raw.trim())?;
                                continue;
                            }
                        }
                    }
                };
                segment.lock()?.counter = value;
                tracing::debug!(value, "counter modified");
            }
            InteractiveCommand::Show => {
                let counter = segment.lock()?.counter;
                writeln!(out, "Current counter value: {counter}")?;
            }
            InteractiveCommand::Status => {
                let (state, references) = {
                    let guard = segment.lock()?;
                    (*guard, guard.reference_count())
                };
                writeln!(
                    out,
                    "Counter: {}, active copies: {}, total processes: {}, \
                     leader: {}, references: {}",
                    state.counter,
                    state.active_copies,
                    state.total_processes,
                    describe_leader(&state),
                    references
                )?;
            }
        }
        out.flush()?;
    }
    Ok(())
}

/// Next input line, or `None` once the session must stop.
fn next_line(input: &Receiver<String>, workers: &Workers) -> Option<String> {
    loop {
        if signal::shutdown_requested() {
            tracing::info!("termination requested");
            return None;
        }
        if workers.any_finished() {
            tracing::warn!("a worker thread stopped unexpectedly, shutting down");
            return None;
        }
        match input.recv_timeout(INPUT_POLL_INTERVAL) {
            Ok(line) => return Some(line),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// Forwards stdin lines to a channel from a background thread.
///
/// The channel disconnects at end of input or on a read error.
pub fn stdin_lines() -> Receiver<String> {
    let (sender, receiver) = channel::unbounded();
    let spawned = thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if sender.send(line).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!("failed to read standard input: {err}");
                        break;
                    }
                }
            }
        });
    if let Err(err) = spawned {
        // the sender was dropped with the closure, so the session sees end of input
        tracing::error!("failed to start stdin reader: {err}");
    }
    receiver
}

/// Runs `role` against OS shared memory with the real console.
pub fn run(settings: Settings, role: Role) -> TaskmemResult<()> {
    let backend = ShmemBackend::new();
    let session = Session::new(settings, role, &backend)?;
    let input = if session.role().runs_main() {
        stdin_lines()
    } else {
        channel::never()
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();
    session.run(input, &mut out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InProcessBackend;
    use crate::supervisor::SpawnOutcome;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    struct NoopSpawner;

    impl ProcessSpawner for NoopSpawner {
        fn spawn(&self, _program: &Path, _args: &[String]) -> SpawnOutcome {
            SpawnOutcome::launched(1)
        }
    }

    fn settings(dir: &Path, name: &str) -> Settings {
        Settings {
            segment_name: name.to_string(),
            log_file: dir.join("task_log.txt"),
            counter_interval_ms: 60_000,
            logger_interval_ms: 60_000,
            spawner_interval_ms: 60_000,
            leader_retry_ms: 1,
            copy_work_ms: 20,
            spawn_copies: false,
            reclaim_dead_leader: false,
            log_level: None,
            diag_log: None,
        }
    }

    fn session<'a>(backend: &'a InProcessBackend, settings: Settings, role: Role) -> Session<'a> {
        Session {
            settings,
            role,
            backend,
            spawner: Arc::new(NoopSpawner),
            program: PathBuf::from("taskmem"),
            pid: 4242,
        }
    }

    /// Feeds `lines` after the workers had time for their first tick.
    fn scripted(lines: &[&str]) -> Receiver<String> {
        let (sender, receiver) = channel::unbounded();
        let lines: Vec<String> = lines.iter().map(|line| line.to_string()).collect();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            for line in lines {
                let _ = sender.send(line);
            }
        });
        receiver
    }

    #[test]
    fn main_session_serves_commands_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InProcessBackend::new();
        let settings = settings(dir.path(), "main_session");
        let observer = Segment::attach_with(&backend, "main_session", true).unwrap();

        let mut out = Vec::new();
        session(&backend, settings.clone(), Role::Main)
            .run(
                scripted(&["m", "42", "show", "modify nope", "status", "bogus", "exit"]),
                &mut out,
            )
            .unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("Started taskmem : PID=4242. Log file: "));
        assert!(out.contains("Enter new counter value: "));
        assert!(out.contains("Current counter value: 42"));
        assert!(out.contains("Invalid counter value: nope"));
        assert!(out.contains("Counter: 42, active copies: 0, total processes: 1"));
        assert!(out.contains("Unknown command: bogus"));
        assert!(out.trim_end().ends_with("Exiting...\nGoodbye!"));

        let state = observer.snapshot().unwrap();
        assert_eq!(state.total_processes, 0);
        assert_eq!(state.leader(), None);
        assert_eq!(observer.reference_count().unwrap(), 1);

        let log = std::fs::read_to_string(&settings.log_file).unwrap();
        assert!(log.contains("| 4242] Started Main Program"));
        assert!(log.contains("| 4242] Finished Main Program"));
    }

    /// Accepts the startup banner, then fails every write like a closed pipe.
    #[derive(Default)]
    struct ClosingWriter {
        flushed: bool,
    }

    impl Write for ClosingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.flushed {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            } else {
                Ok(buf.len())
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushed = true;
            Ok(())
        }
    }

    #[test]
    fn broken_console_still_unregisters_and_detaches() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InProcessBackend::new();
        let settings = settings(dir.path(), "broken_console");
        let observer = Segment::attach_with(&backend, "broken_console", true).unwrap();

        let result = session(&backend, settings, Role::Main)
            .run(scripted(&["show", "exit"]), &mut ClosingWriter::default());

        assert!(result.is_err());
        let state = observer.snapshot().unwrap();
        assert_eq!(state.total_processes, 0);
        assert_eq!(state.leader(), None);
        assert_eq!(observer.reference_count().unwrap(), 1);
    }

    #[test]
    fn copy_runs_even_when_task_log_is_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InProcessBackend::new();
        let mut settings = settings(dir.path(), "copy_no_log");
        settings.log_file = dir.path().join("missing").join("task_log.txt");
        let observer = Segment::attach_with(&backend, "copy_no_log", true).unwrap();

        session(&backend, settings, Role::Copy1)
            .run(channel::never(), &mut Vec::new())
            .unwrap();

        assert_eq!(observer.snapshot().unwrap().counter, 10);
        assert_eq!(observer.reference_count().unwrap(), 1);
    }

    #[test]
    fn end_of_input_behaves_like_exit() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InProcessBackend::new();
        let settings = settings(dir.path(), "eof");

        let mut out = Vec::new();
        session(&backend, settings, Role::Main)
            .run(scripted(&["show"]), &mut out)
            .unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("Goodbye!"));
        assert!(backend.is_empty());
    }

    #[test]
    fn unknown_role_runs_main_with_unknown_label() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InProcessBackend::new();
        let settings = settings(dir.path(), "unknown_role");

        let mut out = Vec::new();
        session(&backend, settings.clone(), Role::from_arg(Some("5")))
            .run(scripted(&["e"]), &mut out)
            .unwrap();

        let log = std::fs::read_to_string(&settings.log_file).unwrap();
        assert!(log.contains("Started Unknown"));
        assert!(log.contains("Finished Unknown"));
    }

    #[test]
    fn copy_one_session_adds_ten_and_detaches() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InProcessBackend::new();
        let settings = settings(dir.path(), "copy_one_session");
        let observer = Segment::attach_with(&backend, "copy_one_session", true).unwrap();
        observer.lock().unwrap().counter = 7;

        let mut out = Vec::new();
        session(&backend, settings.clone(), Role::Copy1)
            .run(channel::never(), &mut out)
            .unwrap();

        assert!(out.is_empty());
        assert_eq!(observer.snapshot().unwrap().counter, 17);
        assert_eq!(observer.reference_count().unwrap(), 1);
        let log = std::fs::read_to_string(&settings.log_file).unwrap();
        let lines: Vec<_> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("Started Copy 1"));
        assert!(lines[1].ends_with("Finished Copy 1"));
    }

    #[test]
    fn copy_keeps_log_of_running_main() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InProcessBackend::new();
        let settings = settings(dir.path(), "keep_log");
        std::fs::write(&settings.log_file, "earlier line\n").unwrap();
        let observer = Segment::attach_with(&backend, "keep_log", true).unwrap();
        observer.lock().unwrap().total_processes = 1;

        let mut out = Vec::new();
        session(&backend, settings.clone(), Role::Copy2)
            .run(channel::never(), &mut out)
            .unwrap();

        let log = std::fs::read_to_string(&settings.log_file).unwrap();
        assert!(log.starts_with("earlier line\n"));
        assert!(log.contains("Finished Copy 2"));
        assert_eq!(observer.snapshot().unwrap().active_copies, 0);
    }

    #[test]
    fn empty_segment_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InProcessBackend::new();
        let mut settings = settings(dir.path(), "x");
        settings.segment_name = String::new();

        let err = session(&backend, settings, Role::Copy1)
            .run(channel::never(), &mut Vec::new())
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Validation);
    }
}
