//! Drives report jobs through add, poll and download.
//!
//! One coordinator owns every [`ReportJob`] and the [`Manifest`]. Platform
//! calls run as tasks in a [`JoinSet`] and hand their outcome back when they
//! are joined, so job state is only ever touched by the coordinator loop. A
//! task that panics fails its job instead of stalling the run.

use crate::error::Error;
use crate::fields::FieldCatalog;
use crate::job::{DateRange, Entity, JobStatus, ReportJob, Source};
use crate::platform::{ReportPlatform, ReportStatus};
use crate::processor::ReportProcessor;
use crate::retry::{with_retry, BackoffPolicy, CallError};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::Instant;

const MIN_WAIT: Duration = Duration::from_millis(5);
/// How long tasks still running at the overall timeout may take to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub add_limit_per_source: usize,
    pub overall_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_workers: 10,
            poll_interval: Duration::from_millis(1200),
            max_retries: 7,
            add_limit_per_source: 3,
            overall_timeout: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Add,
    Status,
    Download,
    Timeout,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Add => "add",
            Stage::Status => "status",
            Stage::Download => "download",
            Stage::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Why a job failed, flattened for the manifest.
#[derive(Debug, Clone)]
pub struct Failure {
    pub status: Option<u16>,
    pub message: String,
}

impl From<CallError> for Failure {
    fn from(err: CallError) -> Self {
        Failure {
            status: err.status(),
            message: err.to_string(),
        }
    }
}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Call(call) => call.status(),
            _ => None,
        };
        Failure {
            status,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub source: Source,
    pub entity: Entity,
    pub account_id: String,
    pub stage: Stage,
    pub error: String,
    pub http_status: Option<u16>,
}

/// Run summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Manifest {
    pub total: usize,
    pub added: usize,
    pub completed: usize,
    pub downloaded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub timed_out: bool,
    pub overall_timeout_sec: u64,
    pub errors: Vec<FailureRecord>,
    pub fail_by_stage: BTreeMap<Stage, usize>,
    pub fail_by_code: BTreeMap<String, usize>,
    pub by_status: BTreeMap<JobStatus, usize>,
}

impl Manifest {
    fn record_failure(&mut self, job: &ReportJob, stage: Stage, failure: &Failure) {
        self.errors.push(FailureRecord {
            source: job.source,
            entity: job.entity,
            account_id: job.account_id.clone(),
            stage,
            error: failure.message.clone(),
            http_status: failure.status,
        });
        *self.fail_by_stage.entry(stage).or_default() += 1;
        let code = failure
            .status
            .map_or_else(|| "none".to_string(), |s| s.to_string());
        *self.fail_by_code.entry(code).or_default() += 1;
    }

    fn finish(&mut self, jobs: &[ReportJob]) {
        self.total = jobs.len();
        self.by_status.clear();
        for job in jobs {
            *self.by_status.entry(job.status()).or_default() += 1;
        }
        self.failed = self.by_status.get(&JobStatus::Failed).copied().unwrap_or(0);
        self.skipped = self.by_status.get(&JobStatus::Skipped).copied().unwrap_or(0);
    }
}

#[derive(Debug)]
enum TaskOutcome {
    Added(Result<String, CallError>),
    Polled(Result<ReportStatus, CallError>),
    Downloaded(Result<usize, Failure>),
}

/// What a finished task reports back to the coordinator.
#[derive(Debug)]
struct TaskEvent {
    index: usize,
    attempts: u32,
    outcome: TaskOutcome,
}

/// Builds one job per account, entity and source, in that nesting order.
pub fn build_jobs(
    catalog: &FieldCatalog,
    accounts: &BTreeMap<Source, Vec<String>>,
    entities: &[Entity],
    language: &str,
) -> Result<Vec<ReportJob>, Error> {
    let mut jobs = Vec::new();
    for (source, account_ids) in accounts {
        for account_id in account_ids {
            for entity in entities {
                let spec = catalog.get(*source, *entity)?;
                jobs.push(ReportJob::new(
                    *source,
                    *entity,
                    account_id.clone(),
                    spec.report_type.clone(),
                    spec.names(),
                    language,
                ));
            }
        }
    }
    Ok(jobs)
}

pub struct JobScheduler {
    platforms: HashMap<Source, Arc<dyn ReportPlatform>>,
    processor: Arc<ReportProcessor>,
    backoff: Arc<dyn BackoffPolicy>,
    config: SchedulerConfig,
    range: DateRange,
}

impl JobScheduler {
    pub fn new(
        platforms: HashMap<Source, Arc<dyn ReportPlatform>>,
        processor: Arc<ReportProcessor>,
        backoff: Arc<dyn BackoffPolicy>,
        config: SchedulerConfig,
        range: DateRange,
    ) -> Self {
        JobScheduler {
            platforms,
            processor,
            backoff,
            config,
            range,
        }
    }

    /// Runs every job to a terminal state, or until the overall timeout.
    pub async fn run(&self, jobs: Vec<ReportJob>) -> (Vec<ReportJob>, Manifest) {
        let mut coordinator = Coordinator::new(self, jobs);
        coordinator.run().await;
        coordinator.manifest.finish(&coordinator.jobs);
        (coordinator.jobs, coordinator.manifest)
    }
}

struct Coordinator<'a> {
    scheduler: &'a JobScheduler,
    jobs: Vec<ReportJob>,
    manifest: Manifest,
    add_queue: VecDeque<usize>,
    status_queue: VecDeque<(usize, Instant)>,
    download_queue: VecDeque<usize>,
    /// Non-account jobs waiting on their account-level job.
    held: HashMap<(Source, String), Vec<usize>>,
    add_gates: HashMap<Source, Arc<Semaphore>>,
    tasks: JoinSet<TaskEvent>,
    /// Job and stage of every task in `tasks`.
    running: HashMap<task::Id, (usize, Stage)>,
}

impl<'a> Coordinator<'a> {
    fn new(scheduler: &'a JobScheduler, jobs: Vec<ReportJob>) -> Self {
        let config = &scheduler.config;

        let account_jobs: HashSet<(Source, String)> = jobs
            .iter()
            .filter(|j| j.entity == Entity::Account)
            .map(|j| (j.source, j.account_id.clone()))
            .collect();

        let mut add_queue = VecDeque::new();
        let mut held: HashMap<(Source, String), Vec<usize>> = HashMap::new();
        for (index, job) in jobs.iter().enumerate() {
            let key = (job.source, job.account_id.clone());
            if job.entity != Entity::Account && account_jobs.contains(&key) {
                held.entry(key).or_default().push(index);
            } else {
                add_queue.push_back(index);
            }
        }

        let add_gates = Source::ALL
            .iter()
            .map(|s| (*s, Arc::new(Semaphore::new(config.add_limit_per_source.max(1)))))
            .collect();

        Coordinator {
            scheduler,
            jobs,
            manifest: Manifest {
                overall_timeout_sec: config.overall_timeout.as_secs(),
                ..Manifest::default()
            },
            add_queue,
            status_queue: VecDeque::new(),
            download_queue: VecDeque::new(),
            held,
            add_gates,
            tasks: JoinSet::new(),
            running: HashMap::new(),
        }
    }

    async fn run(&mut self) {
        let config = self.scheduler.config.clone();
        let started = Instant::now();
        info!(
            "Scheduling {} jobs (max_workers={}, add_limit_per_source={}, timeout={}s)",
            self.jobs.len(),
            config.max_workers,
            config.add_limit_per_source,
            config.overall_timeout.as_secs()
        );

        loop {
            if started.elapsed() >= config.overall_timeout {
                self.time_out();
                break;
            }

            self.submit_ready();

            if self.tasks.is_empty()
                && self.add_queue.is_empty()
                && self.status_queue.is_empty()
                && self.download_queue.is_empty()
            {
                if self.held.is_empty() {
                    break;
                }
                warn!("Releasing {} held job groups with no account job pending", self.held.len());
                let held: Vec<usize> = self.held.drain().flat_map(|(_, v)| v).collect();
                self.add_queue.extend(held);
                continue;
            }

            let remaining = config.overall_timeout.saturating_sub(started.elapsed());
            let mut wait = config.poll_interval;
            if self.tasks.is_empty() {
                if let Some(due) = self.status_queue.iter().map(|(_, due)| *due).min() {
                    wait = due.saturating_duration_since(Instant::now());
                }
            }
            let wait = wait.max(MIN_WAIT).min(remaining);

            if self.tasks.is_empty() {
                tokio::time::sleep(wait).await;
                continue;
            }
            if let Ok(Some(joined)) = tokio::time::timeout(wait, self.tasks.join_next_with_id()).await {
                self.joined(joined);
            }
        }

        self.drain().await;
        info!(
            "Scheduler finished in {:.1}s: added={} completed={} downloaded={}",
            started.elapsed().as_secs_f64(),
            self.manifest.added,
            self.manifest.completed,
            self.manifest.downloaded
        );
    }

    /// Fills free worker slots: downloads first, then due polls, then adds.
    fn submit_ready(&mut self) {
        let max_workers = self.scheduler.config.max_workers.max(1);
        while self.tasks.len() < max_workers {
            if let Some(index) = self.download_queue.pop_front() {
                self.spawn_download(index);
                continue;
            }

            let now = Instant::now();
            if let Some(pos) = self.status_queue.iter().position(|(_, due)| *due <= now) {
                if let Some((index, _)) = self.status_queue.remove(pos) {
                    self.spawn_poll(index);
                }
                continue;
            }

            if let Some((index, permit)) = self.next_add() {
                self.spawn_add(index, permit);
                continue;
            }
            break;
        }
    }

    /// The first queued add whose source still has a free add slot.
    fn next_add(&mut self) -> Option<(usize, OwnedSemaphorePermit)> {
        for pos in 0..self.add_queue.len() {
            let index = self.add_queue[pos];
            let source = self.jobs[index].source;
            let Some(gate) = self.add_gates.get(&source) else {
                continue;
            };
            if let Ok(permit) = gate.clone().try_acquire_owned() {
                self.add_queue.remove(pos);
                return Some((index, permit));
            }
        }
        None
    }

    fn platform(&mut self, index: usize, stage: Stage) -> Option<Arc<dyn ReportPlatform>> {
        let source = self.jobs[index].source;
        match self.scheduler.platforms.get(&source) {
            Some(platform) => Some(platform.clone()),
            None => {
                let failure = Failure {
                    status: None,
                    message: format!("no platform configured for {}", source),
                };
                self.fail(index, stage, failure);
                None
            }
        }
    }

    fn spawn_add(&mut self, index: usize, permit: OwnedSemaphorePermit) {
        let Some(platform) = self.platform(index, Stage::Add) else {
            return;
        };
        if !self.transition(index, JobStatus::Added) {
            return;
        }

        let job = self.jobs[index].clone();
        let range = self.scheduler.range;
        let backoff = self.scheduler.backoff.clone();
        let max_retries = self.scheduler.config.max_retries;
        debug!("add {}", job.label());

        self.spawn(index, Stage::Add, async move {
            let name = format!("add {}", job.label());
            let outcome = with_retry(backoff.as_ref(), max_retries, &name, || {
                platform.add_report(&job, &range)
            })
            .await;
            drop(permit);
            TaskEvent {
                index,
                attempts: outcome.attempts,
                outcome: TaskOutcome::Added(outcome.result),
            }
        });
    }

    fn spawn_poll(&mut self, index: usize) {
        let Some(platform) = self.platform(index, Stage::Status) else {
            return;
        };

        let job = self.jobs[index].clone();
        let backoff = self.scheduler.backoff.clone();
        let max_retries = self.scheduler.config.max_retries;

        self.spawn(index, Stage::Status, async move {
            let name = format!("status {}", job.label());
            let outcome = with_retry(backoff.as_ref(), max_retries, &name, || {
                platform.report_status(&job)
            })
            .await;
            TaskEvent {
                index,
                attempts: outcome.attempts,
                outcome: TaskOutcome::Polled(outcome.result),
            }
        });
    }

    fn spawn_download(&mut self, index: usize) {
        let Some(platform) = self.platform(index, Stage::Download) else {
            return;
        };

        let job = self.jobs[index].clone();
        let processor = self.scheduler.processor.clone();
        let backoff = self.scheduler.backoff.clone();
        let max_retries = self.scheduler.config.max_retries;

        self.spawn(index, Stage::Download, async move {
            let name = format!("download {}", job.label());
            let outcome = with_retry(backoff.as_ref(), max_retries, &name, || {
                platform.download_report(&job)
            })
            .await;
            let result = match outcome.result {
                Ok(body) => processor.process(&job, &body).await.map_err(Failure::from),
                Err(err) => Err(Failure::from(err)),
            };
            TaskEvent {
                index,
                attempts: outcome.attempts,
                outcome: TaskOutcome::Downloaded(result),
            }
        });
    }

    fn spawn<F>(&mut self, index: usize, stage: Stage, work: F)
    where
        F: std::future::Future<Output = TaskEvent> + Send + 'static,
    {
        let handle = self.tasks.spawn(work);
        self.running.insert(handle.id(), (index, stage));
    }

    /// Applies a finished task. A panicked task fails its job at the stage it
    /// was running.
    fn joined(&mut self, joined: Result<(task::Id, TaskEvent), JoinError>) {
        match joined {
            Ok((id, event)) => {
                self.running.remove(&id);
                self.handle(event);
            }
            Err(err) => {
                let Some((index, stage)) = self.running.remove(&err.id()) else {
                    return;
                };
                let failure = Failure {
                    status: None,
                    message: format!("worker task aborted: {}", err),
                };
                self.fail(index, stage, failure);
            }
        }
    }

    fn handle(&mut self, event: TaskEvent) {
        let index = event.index;
        match event.outcome {
            TaskOutcome::Added(result) => {
                self.jobs[index].attempts_add += event.attempts;
                match result {
                    Ok(job_id) => {
                        info!("{}: report job {} created", self.jobs[index].label(), job_id);
                        self.jobs[index].job_id = Some(job_id);
                        if self.transition(index, JobStatus::Running) {
                            self.manifest.added += 1;
                            self.schedule_poll(index);
                        }
                    }
                    Err(err) => self.fail(index, Stage::Add, err.into()),
                }
            }
            TaskOutcome::Polled(result) => {
                self.jobs[index].attempts_status += event.attempts;
                match result {
                    Ok(ReportStatus::Completed { download_url }) => {
                        self.jobs[index].download_url = download_url;
                        if self.transition(index, JobStatus::Completed) {
                            self.manifest.completed += 1;
                            self.download_queue.push_back(index);
                        }
                    }
                    Ok(ReportStatus::InProgress) => self.schedule_poll(index),
                    Ok(ReportStatus::Failed(message)) => {
                        self.fail(index, Stage::Status, Failure { status: None, message })
                    }
                    Err(err) => self.fail(index, Stage::Status, err.into()),
                }
            }
            TaskOutcome::Downloaded(result) => {
                self.jobs[index].attempts_download += event.attempts;
                match result {
                    Ok(rows) => {
                        if self.transition(index, JobStatus::Downloaded) {
                            self.manifest.downloaded += 1;
                            info!("{}: downloaded ({} rows)", self.jobs[index].label(), rows);
                        }
                        self.release_dependents(index, rows == 0);
                    }
                    Err(failure) => self.fail(index, Stage::Download, failure),
                }
            }
        }
    }

    fn schedule_poll(&mut self, index: usize) {
        let due = Instant::now() + self.scheduler.config.poll_interval;
        self.status_queue.push_back((index, due));
    }

    /// Lets the jobs held behind an account-level job go, or skips them when
    /// the account had no data for the period.
    fn release_dependents(&mut self, index: usize, account_empty: bool) {
        let job = &self.jobs[index];
        if job.entity != Entity::Account {
            return;
        }
        let Some(waiting) = self.held.remove(&(job.source, job.account_id.clone())) else {
            return;
        };

        if account_empty {
            info!(
                "{}: account has no data, skipping {} dependent jobs",
                job.label(),
                waiting.len()
            );
            for dependent in waiting {
                if self.transition(dependent, JobStatus::Skipped) {
                    self.manifest.skipped += 1;
                }
            }
        } else {
            self.add_queue.extend(waiting);
        }
    }

    fn transition(&mut self, index: usize, next: JobStatus) -> bool {
        let job = &mut self.jobs[index];
        let current = job.status();
        if job.advance(next) {
            debug!("{}: {} -> {}", job.label(), current, next);
            true
        } else {
            warn!("{}: ignoring transition {} -> {}", job.label(), current, next);
            false
        }
    }

    fn fail(&mut self, index: usize, stage: Stage, failure: Failure) {
        let job = &mut self.jobs[index];
        if !job.fail(failure.message.clone()) {
            return;
        }
        error!("{} failed at {}: {}", job.label(), stage, failure.message);
        self.manifest.record_failure(&self.jobs[index], stage, &failure);
        self.release_dependents(index, false);
    }

    fn time_out(&mut self) {
        let secs = self.scheduler.config.overall_timeout.as_secs();
        error!("Overall timeout of {}s reached; failing unfinished jobs", secs);
        self.manifest.timed_out = true;

        self.add_queue.clear();
        self.status_queue.clear();
        self.download_queue.clear();
        self.held.clear();

        for index in 0..self.jobs.len() {
            if !self.jobs[index].status().is_terminal() {
                let failure = Failure {
                    status: None,
                    message: format!("Timeout: overall timeout of {}s exceeded", secs),
                };
                self.fail(index, Stage::Timeout, failure);
            }
        }
    }

    /// Waits for tasks still in flight after a timeout and discards their
    /// results; their jobs are already FAILED. Stragglers past
    /// `DRAIN_TIMEOUT` are aborted.
    async fn drain(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        info!("Waiting for {} in-flight tasks", self.tasks.len());
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next_with_id()).await {
                Ok(Some(joined)) => {
                    if !self.manifest.timed_out {
                        self.joined(joined);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("Aborting {} tasks still running", self.tasks.len());
                    self.tasks.shutdown().await;
                    break;
                }
            }
        }
        self.running.clear();
    }
}
