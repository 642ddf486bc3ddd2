//! Poll, process and acknowledge loop for one consumer profile.
//!
//! Each pipeline runs `concurrency` workers. A worker owns one record source
//! in the profile's group and cycles through
//! `Idle -> Polling -> Processing -> Acking -> Idle` until shutdown, ending
//! in `Stopped`.
//!
//! Handler failures are retried with the profile's backoff. Per-record
//! profiles retry the record in place. Per-batch profiles rewind the source
//! so the whole batch is delivered again after the delay. Once retries are
//! exhausted the profile's terminal action applies to the failing record and
//! the worker commits past it.

use crate::config::ShutdownPolicy;
use crate::events::EventStore;
use crate::kafka::backoff::BackoffState;
use crate::kafka::consumer::{Position, RecordSource, RecordSourceFactory};
use crate::kafka::dead_letter::{DeadLetterOutcome, DeadLetterSink};
use crate::kafka::message::{DeadLetterRecord, InboundRecord, Message, Payload};
use crate::kafka::profile::{AckMode, ConsumerProfile, TerminalAction};
use crate::kafka::serializer::JsonSerializer;
use crate::metrics::Metrics;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Polling,
    Processing,
    Acking,
    Stopped,
}

/// Counters of one worker, returned when it stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker: usize,
    pub processed: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub commits: u64,
    pub final_state: WorkerState,
}

impl WorkerReport {
    fn new(worker: usize) -> Self {
        Self {
            worker,
            processed: 0,
            retries: 0,
            dead_lettered: 0,
            dropped: 0,
            commits: 0,
            final_state: WorkerState::Idle,
        }
    }
}

pub struct ConsumptionPipeline {
    profile: Arc<ConsumerProfile>,
    topics: Vec<String>,
    sources: Arc<dyn RecordSourceFactory>,
    store: Arc<dyn EventStore>,
    dead_letters: Arc<DeadLetterSink>,
    metrics: Metrics,
    poll_timeout: Duration,
    shutdown_policy: ShutdownPolicy,
}

impl ConsumptionPipeline {
    pub fn new(
        profile: ConsumerProfile,
        topics: Vec<String>,
        sources: Arc<dyn RecordSourceFactory>,
        store: Arc<dyn EventStore>,
        dead_letters: Arc<DeadLetterSink>,
        metrics: Metrics,
    ) -> Self {
        Self {
            profile: Arc::new(profile),
            topics,
            sources,
            store,
            dead_letters,
            metrics,
            poll_timeout: Duration::from_millis(1000),
            shutdown_policy: ShutdownPolicy::default(),
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_shutdown_policy(mut self, shutdown_policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = shutdown_policy;
        self
    }

    /// Creates every worker's source, then spawns the workers. Cancelling
    /// `shutdown` stops them; a halting worker stops only its own pipeline.
    pub async fn start(self, shutdown: &CancellationToken) -> Result<PipelineHandle> {
        let mut sources = Vec::with_capacity(self.profile.concurrency);
        for worker in 0..self.profile.concurrency {
            sources.push(self.sources.create(&self.profile, &self.topics, worker).await?);
        }

        let token = shutdown.child_token();
        let workers = sources
            .into_iter()
            .enumerate()
            .map(|(id, source)| {
                let worker = Worker {
                    id,
                    profile: Arc::clone(&self.profile),
                    source,
                    store: Arc::clone(&self.store),
                    dead_letters: Arc::clone(&self.dead_letters),
                    metrics: self.metrics.clone(),
                    token: token.clone(),
                    poll_timeout: self.poll_timeout,
                    shutdown_policy: self.shutdown_policy,
                    retry: None,
                    pending: BTreeMap::new(),
                    last_commit: Instant::now(),
                    report: WorkerReport::new(id),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            profile = %self.profile.name,
            workers = self.profile.concurrency,
            topics = ?self.topics,
            ack_mode = ?self.profile.ack_mode,
            "Consumption pipeline started"
        );

        Ok(PipelineHandle {
            profile: self.profile.name.clone(),
            token,
            workers,
        })
    }
}

/// Running workers of one pipeline.
pub struct PipelineHandle {
    profile: String,
    token: CancellationToken,
    workers: Vec<JoinHandle<Result<WorkerReport>>>,
}

impl PipelineHandle {
    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Waits for every worker. Returns the first worker error, which is
    /// `PipelineHalted` when a record exhausted its retries under `halt`.
    pub async fn join(self) -> Result<Vec<WorkerReport>> {
        let mut reports = Vec::with_capacity(self.workers.len());
        let mut failure = None;
        for handle in self.workers {
            match handle.await {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    error!(profile = %self.profile, error = %e, "Worker task failed");
                    failure.get_or_insert(Error::PipelineHalted {
                        profile: self.profile.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }
}

enum Cycle {
    /// Records from this index on still need acknowledging.
    Done(usize),
    /// The source was rewound; poll again.
    Redeliver,
    /// Shutdown interrupted the cycle; nothing more is acknowledged.
    Stop,
}

type RecordId = (String, i32, i64);

struct Worker {
    id: usize,
    profile: Arc<ConsumerProfile>,
    source: Box<dyn RecordSource>,
    store: Arc<dyn EventStore>,
    dead_letters: Arc<DeadLetterSink>,
    metrics: Metrics,
    token: CancellationToken,
    poll_timeout: Duration,
    shutdown_policy: ShutdownPolicy,
    retry: Option<(RecordId, BackoffState)>,
    /// Timed mode: next offsets not yet committed.
    pending: BTreeMap<(String, i32), i64>,
    last_commit: Instant,
    report: WorkerReport,
}

impl Worker {
    async fn run(mut self) -> Result<WorkerReport> {
        debug!(profile = %self.profile.name, worker = self.id, "Worker started");
        let result = self.run_loop().await;

        if !self.pending.is_empty() {
            self.commit_pending().await;
        }
        self.transition(WorkerState::Stopped);
        info!(
            profile = %self.profile.name,
            worker = self.id,
            processed = self.report.processed,
            dead_lettered = self.report.dead_lettered,
            dropped = self.report.dropped,
            "Worker stopped"
        );
        result.map(|_| self.report)
    }

    async fn run_loop(&mut self) -> Result<()> {
        let per_cycle = self.profile.records_per_cycle();
        loop {
            if self.token.is_cancelled() {
                return Ok(());
            }

            self.transition(WorkerState::Polling);
            let polled = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(()),
                polled = self.source.poll(per_cycle, self.poll_timeout) => polled,
            };
            let records = match polled {
                Ok(records) => records,
                Err(e) => {
                    warn!(profile = %self.profile.name, worker = self.id, error = %e, "Poll failed");
                    if !pause(&self.token, self.poll_timeout).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            if records.is_empty() {
                self.transition(WorkerState::Idle);
                if self.commit_due() {
                    self.commit_pending().await;
                }
                continue;
            }

            self.transition(WorkerState::Processing);
            match self.process(&records).await? {
                Cycle::Done(start) => {
                    self.transition(WorkerState::Acking);
                    self.ack(&records[start..]).await;
                }
                Cycle::Redeliver => {}
                Cycle::Stop => return Ok(()),
            }
            self.transition(WorkerState::Idle);
        }
    }

    async fn process(&mut self, records: &[InboundRecord]) -> Result<Cycle> {
        let mut start = 0;
        let mut i = 0;

        while i < records.len() {
            if self.shutdown_policy == ShutdownPolicy::DiscardInFlight && self.token.is_cancelled() {
                debug!(
                    profile = %self.profile.name,
                    discarded = records.len() - i,
                    "Discarding in-flight records"
                );
                return Ok(Cycle::Stop);
            }

            let record = &records[i];
            let event = match JsonSerializer::deserialize(record) {
                Ok(event) => event,
                Err(e) => {
                    // Malformed payloads never succeed on retry.
                    let dead_letter = self.profile.on_exhausted == TerminalAction::DeadLetter;
                    self.terminal(record, dead_letter, e.to_string()).await;
                    self.ack(&records[start..=i]).await;
                    i += 1;
                    start = i;
                    continue;
                }
            };

            let failure = match self.store.save(&event).await {
                Ok(()) => {
                    self.succeeded(record);
                    i += 1;
                    continue;
                }
                Err(e) => e,
            };

            let (delay, attempt) = self.next_delay(record);
            match delay {
                Some(delay) => {
                    self.report.retries += 1;
                    self.metrics
                        .handler_retries
                        .with_label_values(&[&self.profile.name])
                        .inc();
                    warn!(
                        profile = %self.profile.name,
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Handler failed, retrying"
                    );

                    if self.profile.ack_mode == AckMode::PerBatch {
                        let rewind = Position::first(&records[start..]);
                        if let Err(e) = self.source.seek(&rewind).await {
                            warn!(profile = %self.profile.name, error = %e, "Rewind failed");
                        }
                        if !pause(&self.token, delay).await {
                            return Ok(Cycle::Stop);
                        }
                        return Ok(Cycle::Redeliver);
                    }
                    if !pause(&self.token, delay).await {
                        return Ok(Cycle::Stop);
                    }
                }
                None => {
                    let reason = failure.to_string();
                    if self.profile.on_exhausted == TerminalAction::Halt {
                        self.ack(&records[start..i]).await;
                        self.token.cancel();
                        error!(
                            profile = %self.profile.name,
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            attempts = attempt,
                            error = %reason,
                            "Retries exhausted, halting pipeline"
                        );
                        return Err(Error::PipelineHalted {
                            profile: self.profile.name.clone(),
                            reason,
                        });
                    }
                    let dead_letter = self.profile.on_exhausted == TerminalAction::DeadLetter;
                    self.terminal(record, dead_letter, reason).await;
                    self.ack(&records[start..=i]).await;
                    i += 1;
                    start = i;
                }
            }
        }

        Ok(Cycle::Done(start))
    }

    fn succeeded(&mut self, record: &InboundRecord) {
        if matches!(&self.retry, Some((id, _)) if is_record(id, record)) {
            self.retry = None;
        }
        self.report.processed += 1;
        self.metrics
            .consumed_records
            .with_label_values(&[&self.profile.name, "processed"])
            .inc();
        trace!(
            profile = %self.profile.name,
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "Record processed"
        );
    }

    /// Delay before the next attempt at `record` and the failure count so far.
    fn next_delay(&mut self, record: &InboundRecord) -> (Option<Duration>, u32) {
        let fresh = !matches!(&self.retry, Some((id, _)) if is_record(id, record));
        if fresh {
            let id = (record.topic.clone(), record.partition, record.offset);
            self.retry = Some((id, self.profile.backoff.start()));
        }
        let (delay, failures) = match self.retry.as_mut() {
            Some((_, state)) => (state.next_delay(), state.failures()),
            None => (None, 0),
        };
        if delay.is_none() {
            self.retry = None;
        }
        (delay, failures)
    }

    async fn terminal(&mut self, record: &InboundRecord, dead_letter: bool, reason: String) {
        if !dead_letter {
            self.report.dropped += 1;
            self.metrics
                .consumed_records
                .with_label_values(&[&self.profile.name, "dropped"])
                .inc();
            warn!(
                profile = %self.profile.name,
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                reason = %reason,
                "Dropping record"
            );
            return;
        }

        let original = Message::new(
            record.key.clone(),
            Payload::Bytes(record.payload.clone()),
            record.topic.clone(),
            self.profile.name.clone(),
        );
        self.report.dead_lettered += 1;
        self.metrics
            .consumed_records
            .with_label_values(&[&self.profile.name, "dead_lettered"])
            .inc();
        if let DeadLetterOutcome::Failed(e) = self
            .dead_letters
            .write(DeadLetterRecord::new(original, reason), &self.profile.name)
            .await
        {
            debug!(profile = %self.profile.name, offset = record.offset, error = %e, "Record lost");
        }
    }

    async fn ack(&mut self, records: &[InboundRecord]) {
        if records.is_empty() {
            return;
        }
        let positions = Position::after(records);
        match self.profile.ack_mode {
            AckMode::PerRecord | AckMode::PerBatch => self.commit(&positions).await,
            AckMode::Timed(_) => {
                for p in positions {
                    let next = self.pending.entry((p.topic, p.partition)).or_insert(p.offset);
                    *next = (*next).max(p.offset);
                }
                if self.commit_due() {
                    self.commit_pending().await;
                }
            }
        }
    }

    fn commit_due(&self) -> bool {
        match self.profile.ack_mode {
            AckMode::Timed(interval) => {
                !self.pending.is_empty()
                    && self.last_commit.elapsed() >= Duration::from_millis(interval)
            }
            _ => false,
        }
    }

    async fn commit_pending(&mut self) {
        let positions: Vec<Position> = std::mem::take(&mut self.pending)
            .into_iter()
            .map(|((topic, partition), offset)| Position {
                topic,
                partition,
                offset,
            })
            .collect();
        self.commit(&positions).await;
    }

    async fn commit(&mut self, positions: &[Position]) {
        match self.source.commit(positions).await {
            Ok(()) => {
                self.report.commits += 1;
                self.last_commit = Instant::now();
                debug!(profile = %self.profile.name, worker = self.id, positions = ?positions, "Offsets committed");
            }
            Err(e) => {
                // Uncommitted records are delivered again.
                warn!(profile = %self.profile.name, worker = self.id, error = %e, "Offset commit failed");
            }
        }
    }

    /// Sleeps unless shutdown comes first. Returns false on shutdown.
    fn transition(&mut self, next: WorkerState) {
        trace!(profile = %self.profile.name, worker = self.id, from = ?self.report.final_state, to = ?next, "Worker state");
        self.report.final_state = next;
    }
}

/// Sleeps for `delay`. Returns false when the token fired first.
async fn pause(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn is_record(id: &RecordId, record: &InboundRecord) -> bool {
    id.0 == record.topic && id.1 == record.partition && id.2 == record.offset
}
