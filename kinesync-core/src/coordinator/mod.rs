//! Lock-free work coordination.
//!
//! Any number of workers scan the same dataset independently. Each pass
//! refreshes the index, discovers subjects, shuffles the eligible ones and
//! claims the first whose status record allows it by writing `processing`.
//! There is no mutual exclusion: two workers may claim the same subject, and
//! whichever finishes last owns the final status and outputs.

use std::any::type_name_of_val;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ReclaimPolicy, SyncConfig};
use crate::engine::Engine;
use crate::error::{Result, SyncError};
use crate::index::ObjectStoreIndex;
use crate::mirror::{DirectoryWatcher, LocalMirror, MirrorOptions, watcher_for};
use crate::pubsub::PubSubBus;
use crate::unit::{StatusRecord, Subject, Trial, UnitState, WorkUnit};

mod engine_log;
mod select;

use engine_log::LogSink;

/// Upper bound on reading leftover stdout after the engine exits or is killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A subject chosen for processing together with the status it was chosen in.
#[derive(Clone, Debug)]
pub struct Candidate {
    /// The subject to process.
    pub subject: Subject,
    /// Its status record at selection time.
    pub status: StatusRecord,
}

/// What [`WorkCoordinator::process`] recorded for one subject.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessOutcome {
    /// Subject key.
    pub subject: String,
    /// Final state written, `done` or `error`.
    pub state: UnitState,
    /// Engine exit code, if the engine ran and exited.
    pub exit_code: Option<i32>,
    /// The engine was killed for exceeding its timeout.
    pub timed_out: bool,
    /// Stdout lines captured into `log.txt`.
    pub log_lines: usize,
    /// Failure description for `error` outcomes.
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct EngineRun {
    exit_code: Option<i32>,
    success: bool,
    timed_out: bool,
    start_error: Option<String>,
}

/// One worker's view of the dataset: selects, claims and processes subjects.
pub struct WorkCoordinator {
    index: Arc<ObjectStoreIndex>,
    bus: Arc<PubSubBus>,
    engine: Arc<dyn Engine>,
    watcher: Arc<dyn DirectoryWatcher>,
    config: SyncConfig,
    worker_id: String,
    rng: Mutex<StdRng>,
}

impl fmt::Debug for WorkCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkCoordinator")
            .field("worker_id", &self.worker_id)
            .field("index", &self.index)
            .field("bus", &self.bus)
            .field("engine", &self.engine)
            .field("watcher_type", &type_name_of_val(self.watcher.as_ref()))
            .field("config", &self.config)
            .finish()
    }
}

impl WorkCoordinator {
    /// Coordinator using the watcher picked by `config.watch`. An empty
    /// worker id is replaced with a generated one.
    pub fn new(
        index: Arc<ObjectStoreIndex>,
        bus: Arc<PubSubBus>,
        engine: Arc<dyn Engine>,
        config: SyncConfig,
    ) -> Self {
        let worker_id = if config.coordinator.worker_id.is_empty() {
            format!("worker-{}", Uuid::new_v4().simple())
        } else {
            config.coordinator.worker_id.clone()
        };
        let rng = match config.coordinator.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            index,
            bus,
            engine,
            watcher: watcher_for(&config.watch),
            config,
            worker_id,
            rng: Mutex::new(rng),
        }
    }

    /// Replace the close-write watcher.
    pub fn with_watcher(mut self, watcher: Arc<dyn DirectoryWatcher>) -> Self {
        self.watcher = watcher;
        self
    }

    /// Identity stamped into status records.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Index over the shared store.
    pub fn index(&self) -> &Arc<ObjectStoreIndex> {
        &self.index
    }

    /// Bus used for status and heartbeat traffic.
    pub fn bus(&self) -> &Arc<PubSubBus> {
        &self.bus
    }

    /// Settings this coordinator was built with.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Refresh the dataset prefix and rebuild the subject list from it.
    pub async fn rebuild_index(&self) -> Result<Vec<Subject>> {
        let prefix = &self.config.index.dataset_prefix;
        let summary = self.index.refresh(prefix).await?;
        let subjects = Subject::discover(&self.index.snapshot(), prefix);
        debug!(
            prefix = %prefix,
            generation = summary.generation,
            subjects = subjects.len(),
            "index rebuilt"
        );
        Ok(subjects)
    }

    /// Pick a random eligible subject whose status allows claiming it.
    ///
    /// Subjects with corrupt status records are skipped. With
    /// [`ReclaimPolicy::AfterSecs`], `processing` records younger than the
    /// threshold are left to their current worker.
    pub async fn select_candidate(&self, subjects: Vec<Subject>) -> Result<Option<Candidate>> {
        let now = Utc::now();
        let eligible: Vec<Subject> = subjects
            .into_iter()
            .filter(|subject| subject.could_process())
            .collect();
        if eligible.is_empty() {
            return Ok(None);
        }

        let ordered = {
            let mut rng = self.rng.lock();
            select::order_candidates(eligible, self.config.coordinator.selection, now, &mut *rng)
        };

        for subject in ordered {
            let status = match subject.status(&self.index).await {
                Ok(status) => status,
                Err(err @ SyncError::CorruptStatus { .. }) => {
                    warn!(subject = %subject.path, error = %err, "skipping subject");
                    continue;
                }
                Err(err) => return Err(err),
            };

            if status.state == UnitState::Processing {
                if let ReclaimPolicy::AfterSecs(secs) = self.config.coordinator.reclaim {
                    let threshold = i64::try_from(secs)
                        .ok()
                        .and_then(chrono::Duration::try_seconds)
                        .unwrap_or(chrono::Duration::MAX);
                    let active = status.age(now).is_some_and(|age| age < threshold);
                    if active {
                        debug!(
                            subject = %subject.path,
                            worker = ?status.worker,
                            "subject is being processed elsewhere"
                        );
                        continue;
                    }
                }
                info!(subject = %subject.path, previous_worker = ?status.worker, "reclaiming subject");
            }

            return Ok(Some(Candidate { subject, status }));
        }
        Ok(None)
    }

    /// Run the engine over one subject and record the result.
    ///
    /// Once `processing` has been written every path, including engine
    /// crashes, timeouts and mirror failures, ends in `done` or `error`.
    pub async fn process(&self, candidate: Candidate) -> Result<ProcessOutcome> {
        let Candidate { subject, status } = candidate;
        let trials: Vec<Trial> = subject.eligible_trials().cloned().collect();

        info!(
            subject = %subject.path,
            trials = trials.len(),
            from = status.state.as_str(),
            "claiming subject"
        );
        subject
            .set_status(
                &self.index,
                &status.advance(UnitState::Processing, &self.worker_id),
            )
            .await?;
        for trial in &trials {
            self.mark_trial(trial, UnitState::Processing).await;
        }

        let mut log = LogSink::new(subject.log_path());
        let run = AssertUnwindSafe(self.supervise(&subject, &mut log))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(SyncError::Internal("engine supervision panicked".into())));
        if let Err(err) = log.flush(&self.index).await {
            warn!(subject = %subject.path, error = %err, "failed to write engine log");
        }

        self.finish(subject, status, trials, run, log.lines()).await
    }

    /// One heartbeat, rebuild, select and process pass.
    pub async fn run_once(&self) -> Result<Option<ProcessOutcome>> {
        self.heartbeat();
        let subjects = self.rebuild_index().await?;
        match self.select_candidate(subjects).await? {
            Some(candidate) => Ok(Some(self.process(candidate).await?)),
            None => {
                debug!("no eligible subjects");
                Ok(None)
            }
        }
    }

    /// Poll until `cancel` fires. A subject already being processed is
    /// finished before the loop observes cancellation.
    ///
    /// Only a successful pass starts the next one straight away. Idle passes,
    /// failed passes and engine failures wait out the poll interval, so a
    /// subject that always fails is not re-run back to back.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(worker = %self.worker_id, prefix = %self.config.index.dataset_prefix, "coordinator started");
        let mut heartbeat = tokio::time::interval(self.config.bus.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'passes: while !cancel.is_cancelled() {
            let back_off = match self.run_once().await {
                Ok(Some(outcome)) => {
                    debug!(subject = %outcome.subject, state = outcome.state.as_str(), "pass complete");
                    outcome.state != UnitState::Done
                }
                Ok(None) => true,
                Err(err) => {
                    warn!(error = %err, kind = ?err.kind(), "coordination pass failed");
                    true
                }
            };
            if !back_off {
                continue;
            }

            let sleep = tokio::time::sleep(self.config.coordinator.poll_interval());
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'passes,
                    _ = &mut sleep => break,
                    _ = heartbeat.tick() => self.heartbeat(),
                }
            }
        }

        info!(worker = %self.worker_id, "coordinator stopped");
        Ok(())
    }

    fn heartbeat(&self) {
        if let Err(err) = self.bus.send_heartbeat(&self.worker_id) {
            warn!(error = %err, "failed to publish heartbeat");
        }
    }

    async fn supervise(&self, subject: &Subject, log: &mut LogSink) -> Result<EngineRun> {
        // Error detail from an earlier run must not be mistaken for this one's.
        self.index.delete(&subject.errors_path()).await?;

        let options = MirrorOptions {
            scratch_dir: self.config.coordinator.scratch_dir.clone(),
            create_folders: true,
            watch: self.config.watch.clone(),
        };
        LocalMirror::scope(Arc::clone(&self.index), &subject.path, options, |mirror| {
            self.drive_engine(mirror, log)
        })
        .await
    }

    async fn drive_engine(&self, mirror: Arc<LocalMirror>, log: &mut LogSink) -> Result<EngineRun> {
        let mut watch = self.watcher.watch(mirror.local_path())?;
        let mut process = match self.engine.spawn(mirror.local_path()) {
            Ok(process) => process,
            Err(SyncError::EngineFailure { exit_code, message }) => {
                warn!(subject = %mirror.remote_root(), %message, "engine did not start");
                log.push(message.as_bytes());
                return Ok(EngineRun {
                    exit_code,
                    start_error: Some(message),
                    ..EngineRun::default()
                });
            }
            Err(err) => return Err(err),
        };

        let deadline = self.config.engine.timeout().map(|limit| Instant::now() + limit);
        let mut flush = tokio::time::interval(self.config.engine.log_flush_interval());
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush.tick().await;
        let mut timed_out = false;
        let mut unreadable = false;

        // Stdout is drained for as long as it is open; a child blocked on a
        // full pipe never exits.
        while process.stdout_open() {
            tokio::select! {
                _ = until(deadline) => {
                    timed_out = true;
                    break;
                }
                line = process.next_line() => match line {
                    Ok(Some(line)) => log.push(&line),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(subject = %mirror.remote_root(), error = %err, "engine stdout unreadable; stopping engine");
                        unreadable = true;
                        break;
                    }
                },
                Some(path) = watch.next() => self.upload_ready(&mirror, &path).await,
                _ = flush.tick() => {
                    if let Err(err) = log.flush(&self.index).await {
                        warn!(error = %err, "periodic log flush failed");
                    }
                }
            }
        }

        let exited = if timed_out || unreadable {
            None
        } else {
            match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, process.wait()).await {
                    Ok(status) => Some(status),
                    Err(_) => {
                        timed_out = true;
                        None
                    }
                },
                None => Some(process.wait().await),
            }
        };
        let status = match exited {
            Some(status) => status?,
            None => {
                if timed_out {
                    warn!(subject = %mirror.remote_root(), "engine exceeded its timeout; killing");
                }
                process.kill().await?;
                process.wait().await?
            }
        };
        if unreadable {
            process.close_stdout();
        }

        let drain = async {
            while let Ok(Some(line)) = process.next_line().await {
                log.push(&line);
            }
        };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            warn!(subject = %mirror.remote_root(), "gave up draining engine stdout");
        }

        for path in watch.drain_ready() {
            self.upload_ready(&mirror, &path).await;
        }
        drop(watch);

        info!(
            subject = %mirror.remote_root(),
            exit_code = ?status.code(),
            timed_out,
            "engine exited"
        );
        Ok(EngineRun {
            exit_code: status.code(),
            success: status.success() && !timed_out && !unreadable,
            timed_out,
            start_error: None,
        })
    }

    async fn upload_ready(&self, mirror: &LocalMirror, path: &Path) {
        match mirror.upload_file(path).await {
            Ok(true) => debug!(file = %path.display(), "uploaded finished file"),
            Ok(false) => {}
            // Close retries everything that is still out of date.
            Err(err) => warn!(file = %path.display(), error = %err, "deferring upload"),
        }
    }

    async fn finish(
        &self,
        subject: Subject,
        status: StatusRecord,
        trials: Vec<Trial>,
        run: Result<EngineRun>,
        log_lines: usize,
    ) -> Result<ProcessOutcome> {
        let mut outcome = ProcessOutcome {
            subject: subject.path.clone(),
            state: UnitState::Done,
            exit_code: None,
            timed_out: false,
            log_lines,
            error: None,
        };

        let mut record = match run {
            Ok(run) if run.success => {
                outcome.exit_code = run.exit_code;
                let mut record = status.advance(UnitState::Done, &self.worker_id);
                record.extra.remove("exit_code");
                record.extra.remove("error");
                record.extra.remove("detail");
                record
            }
            Ok(run) => {
                let message = match (&run.start_error, run.timed_out) {
                    (Some(message), _) => message.clone(),
                    (None, true) => "engine timed out".to_string(),
                    (None, false) => format!("engine exited with code {:?}", run.exit_code),
                };
                let failure = SyncError::EngineFailure {
                    exit_code: run.exit_code,
                    message,
                };
                warn!(subject = %subject.path, error = %failure, "engine failed");

                outcome.state = UnitState::Error;
                outcome.exit_code = run.exit_code;
                outcome.timed_out = run.timed_out;
                outcome.error = Some(failure.to_string());

                let mut record = status
                    .advance(UnitState::Error, &self.worker_id)
                    .with("exit_code", run.exit_code)
                    .with("error", failure.to_string());
                record.extra.remove("detail");
                record
            }
            Err(err) => {
                warn!(subject = %subject.path, error = %err, "processing failed");
                outcome.state = UnitState::Error;
                outcome.error = Some(err.to_string());
                let mut record = status
                    .advance(UnitState::Error, &self.worker_id)
                    .with("error", err.to_string());
                record.extra.remove("exit_code");
                record.extra.remove("detail");
                record
            }
        };
        if outcome.state == UnitState::Error
            && let Some(detail) = self.error_detail(&subject).await
        {
            record = record.with("detail", detail);
        }

        subject.set_status(&self.index, &record).await?;
        for trial in &trials {
            self.mark_trial(trial, outcome.state).await;
        }
        info!(subject = %subject.path, state = outcome.state.as_str(), "subject finished");
        Ok(outcome)
    }

    async fn error_detail(&self, subject: &Subject) -> Option<Value> {
        let path = subject.errors_path();
        if !self.index.exists(&path) {
            return None;
        }
        match self.index.get_json::<Value>(&path).await {
            Ok(detail) => Some(detail),
            Err(err) => {
                warn!(path = %path, error = %err, "unreadable error detail");
                None
            }
        }
    }

    async fn mark_trial(&self, trial: &Trial, state: UnitState) {
        let current = trial.status(&self.index).await.unwrap_or_else(|err| {
            warn!(trial = %trial.path, error = %err, "replacing unreadable trial status");
            StatusRecord::default()
        });
        let record = current.advance(state, &self.worker_id);
        if let Err(err) = trial.set_status(&self.index, &record).await {
            warn!(trial = %trial.path, error = %err, "failed to write trial status");
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
