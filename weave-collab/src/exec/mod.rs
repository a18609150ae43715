//! Execution coordinator.
//!
//! Runs submitted source for a room and reports one terminal event.
//!
//! ```text
//! Received ─┬─ Evaluating ───────────────────────┬─ Cleanup ─ Terminal
//!           └─ Staging ─ Compiling ─ Running ────┘
//! ```
//!
//! Requests pass admission control first: at most `max_concurrent` run at
//! once, at most `max_queued` more wait for a slot, and a single room may
//! hold at most `per_room_limit` of either. Everything past that is rejected
//! immediately. Each admitted request is bounded by a timeout; its
//! processes are killed and its directory removed however it ends.

#[cfg(target_os = "linux")]
mod isolation;
pub mod language;
pub mod sandbox;

pub use language::{default_languages, Language, LanguageRegistry, LanguageSpec, Runner, MISSING_ENTRY};
pub use sandbox::{EphemeralDir, Isolation, ProcessOutput, ResourceLimits, Sandbox, NOBODY, TRUNCATED_MARKER};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::config::ExecutionConfig;
use crate::protocol::{ExecutionRequest, ServerEvent, TerminalEvent};
use language::Placeholders;

/// Output reported when a program succeeds without printing anything.
pub const EMPTY_OUTPUT: &str = "Execution finished.";

/// Execution errors. Admission and timeout errors read as the terminal
/// message sent to the room.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Execution rejected: server is busy.")]
    Busy,
    #[error("Execution rejected: too many executions in this room.")]
    RoomBusy,
    #[error("Execution timed out after {0}s.")]
    Timeout(u64),
    #[error("Invalid entry pattern for {language}: {reason}")]
    InvalidPattern { language: String, reason: String },
    #[error("No command configured for language {0:?}")]
    EmptyCommand(String),
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Sandbox setup failed: {0}")]
    Isolation(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Steps a request goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecPhase {
    Received,
    Evaluating,
    Staging,
    Compiling,
    Running,
    Cleanup,
    Terminal,
}

/// Outcome of one request.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub event: TerminalEvent,
    /// Phases in the order they were entered.
    pub phases: Vec<ExecPhase>,
    /// Ephemeral directory used, if the request got as far as staging.
    pub work_dir: Option<PathBuf>,
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecStats {
    pub submitted: u64,
    pub completed: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub processes_spawned: u64,
    pub in_flight: usize,
}

struct Trace {
    id: Uuid,
    phases: Vec<ExecPhase>,
    work_dir: Option<PathBuf>,
}

impl Trace {
    fn new() -> Self {
        let mut trace = Self {
            id: Uuid::new_v4(),
            phases: Vec::new(),
            work_dir: None,
        };
        trace.enter(ExecPhase::Received);
        trace
    }

    fn enter(&mut self, phase: ExecPhase) {
        log::debug!("Execution {} -> {phase:?}", self.id);
        self.phases.push(phase);
    }

    fn finish(mut self, event: TerminalEvent) -> ExecutionReport {
        self.enter(ExecPhase::Terminal);
        ExecutionReport {
            event,
            phases: self.phases,
            work_dir: self.work_dir,
        }
    }
}

#[derive(Default)]
struct AdmissionState {
    total: usize,
    per_room: HashMap<String, usize>,
}

/// Holds one admission slot until dropped.
struct Ticket<'a> {
    state: &'a Mutex<AdmissionState>,
    room_id: String,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.total = state.total.saturating_sub(1);
        if let Some(count) = state.per_room.get_mut(&self.room_id) {
            *count -= 1;
            if *count == 0 {
                state.per_room.remove(&self.room_id);
            }
        }
    }
}

/// Counts a running request for as long as it lives.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Bounded executor for room execution requests.
pub struct ExecutionCoordinator {
    registry: LanguageRegistry,
    sandbox: Sandbox,
    work_dir: PathBuf,
    timeout: Duration,
    admission_limit: usize,
    per_room_limit: usize,
    permits: Semaphore,
    admission: Mutex<AdmissionState>,
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    in_flight: AtomicUsize,
}

impl ExecutionCoordinator {
    pub fn new(config: &ExecutionConfig) -> Result<Self, ExecError> {
        let registry = LanguageRegistry::new(config.languages.clone())?;
        let max_concurrent = config.max_concurrent.max(1);
        log::info!(
            "Execution pool: {max_concurrent} concurrent, {} queued, {} per room, {}s timeout, languages {:?}",
            config.max_queued,
            config.per_room_limit,
            config.timeout_secs,
            registry.names()
        );

        Ok(Self {
            registry,
            sandbox: Sandbox::new(
                config.limits,
                config.isolation.clone(),
                config.path_env.clone(),
                config.max_output_bytes,
            ),
            work_dir: config.work_dir.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            admission_limit: max_concurrent + config.max_queued,
            per_room_limit: config.per_room_limit,
            permits: Semaphore::new(max_concurrent),
            admission: Mutex::new(AdmissionState::default()),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn stats(&self) -> ExecStats {
        ExecStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            processes_spawned: self.sandbox.spawned(),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Run a request in the background and broadcast its result to the
    /// whole room.
    pub fn submit(self: &Arc<Self>, group: Arc<BroadcastGroup>, request: ExecutionRequest) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let report = coordinator.run(group.room_id(), request).await;
            let event = ServerEvent::TerminalUpdate(report.event);
            if let Err(e) = group.publish(&event, None) {
                log::error!("Room {}: failed to publish execution result: {e}", group.room_id());
            }
        })
    }

    /// Run a request to its terminal event.
    pub async fn run(&self, room_id: &str, request: ExecutionRequest) -> ExecutionReport {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        let mut trace = Trace::new();
        let file_path = request.file_path.clone();

        let ticket = match self.admit(room_id) {
            Ok(ticket) => ticket,
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("Room {room_id}: {e}");
                return trace.finish(TerminalEvent::error(file_path, e.to_string()));
            }
        };

        let Ok(_permit) = self.permits.acquire().await else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return trace.finish(TerminalEvent::error(file_path, ExecError::Busy.to_string()));
        };
        let in_flight = InFlight::enter(&self.in_flight);

        log::info!(
            "Room {room_id}: executing {} ({}, {} bytes)",
            file_path,
            request.language,
            request.source_code.len()
        );
        let event = match tokio::time::timeout(self.timeout, self.execute(&request, &mut trace)).await {
            Ok(Ok(event)) => event,
            Ok(Err(e)) => {
                log::warn!("Room {room_id}: execution of {file_path} failed: {e}");
                TerminalEvent::error(file_path, e.to_string())
            }
            Err(_) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                let e = ExecError::Timeout(self.timeout.as_secs());
                log::warn!("Room {room_id}: {e}");
                TerminalEvent::error(file_path, e.to_string())
            }
        };

        if trace.work_dir.is_some() {
            trace.enter(ExecPhase::Cleanup);
        }
        drop(in_flight);
        drop(ticket);
        self.completed.fetch_add(1, Ordering::Relaxed);
        trace.finish(event)
    }

    fn admit(&self, room_id: &str) -> Result<Ticket<'_>, ExecError> {
        let mut state = self.admission.lock().unwrap_or_else(|e| e.into_inner());
        if state.total >= self.admission_limit {
            return Err(ExecError::Busy);
        }
        let room_count = state.per_room.get(room_id).copied().unwrap_or(0);
        if self.per_room_limit > 0 && room_count >= self.per_room_limit {
            return Err(ExecError::RoomBusy);
        }
        state.total += 1;
        state.per_room.insert(room_id.to_string(), room_count + 1);
        Ok(Ticket {
            state: &self.admission,
            room_id: room_id.to_string(),
        })
    }

    async fn execute(&self, request: &ExecutionRequest, trace: &mut Trace) -> Result<TerminalEvent, ExecError> {
        let Some(language) = self.registry.lookup(&request.language) else {
            log::info!("Unsupported language {:?}", request.language);
            return Ok(TerminalEvent::output(
                &request.file_path,
                format!("Execution for \"{}\" is not supported.", request.language),
            ));
        };

        match language.runner() {
            Runner::Interpreted { command } => {
                trace.enter(ExecPhase::Evaluating);
                let dir = self.stage(trace)?;
                let file = format!("main.{}", language.extension());
                tokio::fs::write(dir.path().join(&file), &request.source_code).await?;

                let dir_str = dir.path().to_string_lossy().into_owned();
                let argv = Placeholders { file: &file, dir: &dir_str, entry: "" }.expand(command);
                let out = self.sandbox.run(&argv, dir.path()).await?;

                if !out.success() {
                    return Ok(TerminalEvent::error(&request.file_path, out.diagnostic().trim()));
                }
                let text = out.stdout.trim();
                let text = if text.is_empty() { EMPTY_OUTPUT } else { text };
                Ok(TerminalEvent::output(&request.file_path, text))
            }
            Runner::Toolchain {
                compile,
                run,
                missing_entry_message,
                ..
            } => {
                let Some(entry) = language.find_entry(&request.source_code) else {
                    return Ok(TerminalEvent::error(&request.file_path, missing_entry_message.as_str()));
                };

                trace.enter(ExecPhase::Staging);
                let dir = self.stage(trace)?;
                let file = format!("{entry}.{}", language.extension());
                tokio::fs::write(dir.path().join(&file), &request.source_code).await?;
                let dir_str = dir.path().to_string_lossy().into_owned();
                let vars = Placeholders { file: &file, dir: &dir_str, entry: &entry };

                trace.enter(ExecPhase::Compiling);
                let out = self.sandbox.run(&vars.expand(compile), dir.path()).await?;
                if !out.success() || !out.stderr.trim().is_empty() {
                    return Ok(TerminalEvent::error(&request.file_path, out.diagnostic()));
                }

                trace.enter(ExecPhase::Running);
                let out = self.sandbox.run(&vars.expand(run), dir.path()).await?;
                if !out.success() || !out.stderr.trim().is_empty() {
                    return Ok(TerminalEvent::error(&request.file_path, out.diagnostic()));
                }
                Ok(TerminalEvent::output(&request.file_path, out.stdout))
            }
        }
    }

    fn stage(&self, trace: &mut Trace) -> Result<EphemeralDir, ExecError> {
        let dir = self.sandbox.stage(&self.work_dir)?;
        trace.work_dir = Some(dir.path().to_path_buf());
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TerminalKind;

    fn coordinator(work_dir: &std::path::Path) -> ExecutionCoordinator {
        let config = ExecutionConfig {
            work_dir: work_dir.to_path_buf(),
            max_concurrent: 1,
            max_queued: 1,
            per_room_limit: 1,
            ..ExecutionConfig::default()
        };
        ExecutionCoordinator::new(&config).unwrap()
    }

    fn request(language: &str, source: &str) -> ExecutionRequest {
        ExecutionRequest {
            source_code: source.into(),
            language: language.into(),
            file_path: "Main.java".into(),
        }
    }

    #[tokio::test]
    async fn test_unsupported_language_is_output() {
        let root = tempfile::tempdir().unwrap();
        let exec = coordinator(root.path());
        let report = exec.run("r", request("brainfuck", "+")).await;

        assert_eq!(report.event.kind, TerminalKind::Output);
        assert_eq!(report.event.content, "Execution for \"brainfuck\" is not supported.");
        assert_eq!(report.phases, vec![ExecPhase::Received, ExecPhase::Terminal]);
        assert!(report.work_dir.is_none());
    }

    #[tokio::test]
    async fn test_missing_entry_spawns_nothing() {
        let root = tempfile::tempdir().unwrap();
        let exec = coordinator(root.path());
        let report = exec.run("r", request("java", "class Hidden {}")).await;

        assert_eq!(report.event, TerminalEvent::error("Main.java", MISSING_ENTRY));
        assert!(report.work_dir.is_none());
        assert_eq!(exec.stats().processes_spawned, 0);
        assert_eq!(exec.stats().completed, 1);
    }

    #[test]
    fn test_admission_limits() {
        let root = tempfile::tempdir().unwrap();
        let exec = coordinator(root.path());

        let first = exec.admit("a").unwrap();
        assert!(matches!(exec.admit("a"), Err(ExecError::RoomBusy)));
        let second = exec.admit("b").unwrap();
        assert!(matches!(exec.admit("c"), Err(ExecError::Busy)));

        drop(first);
        let third = exec.admit("a").unwrap();
        drop(second);
        drop(third);
        assert_eq!(exec.admission.lock().unwrap().total, 0);
        assert!(exec.admission.lock().unwrap().per_room.is_empty());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(ExecError::Busy.to_string(), "Execution rejected: server is busy.");
        assert_eq!(
            ExecError::RoomBusy.to_string(),
            "Execution rejected: too many executions in this room."
        );
        assert_eq!(ExecError::Timeout(10).to_string(), "Execution timed out after 10s.");
    }
}
