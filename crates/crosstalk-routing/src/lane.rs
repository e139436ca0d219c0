//! Per-session-key lane scheduling.
//!
//! Each session key owns one lane: a single-writer execution domain with at
//! most one agent invocation in flight. Arrivals during a run are buffered,
//! steered into the run's replacement, or cause an interrupt, according to
//! the lane's queue mode. Lane transitions:
//!
//! ```text
//! Idle → Running → (Running | Steering | Queueing) → Idle | Running
//! ```
//!
//! The lane owns the cancellation token; `chat.abort`, `/stop`, steering,
//! and interrupts all trip the same token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crosstalk_agent::error::AgentError;
use crosstalk_agent::runner::RunOutcome;
use crosstalk_channels::types::{Attachment, Envelope};
use crosstalk_core::types::RunId;

use crate::queue::{PushOutcome, QueueBuffer, QueueMode, QueuePatch, QueueSettings};

/// One unit of work handed to the executor.
#[derive(Debug, Clone)]
pub struct LaneJob {
    pub session_key: String,
    pub run_id: RunId,
    pub envelope: Envelope,
    /// Steering texts to fold into the prompt ahead of the envelope.
    pub steer_notes: Vec<String>,
    /// Tool output carried over from a cancelled run (steer+backlog).
    pub carried_output: Option<String>,
    /// Additional buffered envelopes riding along (steer+backlog).
    pub backlog: Vec<Envelope>,
    /// Live verbose flag — the executor polls it whenever tool results
    /// would be shown.
    pub verbose: Arc<AtomicBool>,
}

/// The scheduler-owned execution seam. The gateway implements this by
/// assembling the prompt, invoking the agent runner, and wiring a reply
/// dispatcher; the lane knows nothing about any of that.
#[async_trait]
pub trait LaneExecutor: Send + Sync {
    async fn execute(&self, job: LaneJob, cancel: CancellationToken)
        -> Result<RunOutcome, AgentError>;
}

/// Observable lane phase, for `/status` and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanePhase {
    Idle,
    Running,
    Steering,
    Queueing,
}

/// What happened to a submitted envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new run started immediately.
    Started(RunId),
    /// Buffered behind the in-flight run.
    Buffered { depth: usize },
    /// Oldest buffered entries were evicted or compacted to make room.
    BufferedWithDrop { depth: usize, dropped: usize },
    /// Rejected by drop policy `new` — surface a visible failure.
    RejectedFull,
    /// The in-flight run is being steered into a replacement.
    Steering(RunId),
    /// The in-flight run is being cancelled outright.
    Interrupting(RunId),
}

/// Sticky idempotency state for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdemState {
    InFlight,
    Ok,
    Failed,
}

struct ActiveRun {
    run_id: RunId,
    cancel: CancellationToken,
    /// Envelopes that arrived as steering input for the replacement run.
    steer_envelopes: Vec<Envelope>,
    /// Interrupt replacement: the next run's sole input.
    interrupt_with: Option<Envelope>,
    /// Idempotency keys resolved when this run completes.
    idem_keys: Vec<String>,
    /// Idempotency keys of steering/interrupt arrivals — they belong to the
    /// replacement run, not this one.
    handoff_idem: Vec<String>,
}

struct LaneInner {
    key: String,
    settings: Mutex<QueueSettings>,
    run: Mutex<Option<ActiveRun>>,
    buffer: Mutex<QueueBuffer>,
    verbose: Arc<AtomicBool>,
    idem: Mutex<HashMap<String, (IdemState, Option<Value>)>>,
}

pub struct Lane {
    inner: Arc<LaneInner>,
    executor: Arc<dyn LaneExecutor>,
}

impl Lane {
    fn new(key: String, settings: QueueSettings, executor: Arc<dyn LaneExecutor>) -> Self {
        Self {
            inner: Arc::new(LaneInner {
                key,
                settings: Mutex::new(settings),
                run: Mutex::new(None),
                buffer: Mutex::new(QueueBuffer::new()),
                verbose: Arc::new(AtomicBool::new(false)),
                idem: Mutex::new(HashMap::new()),
            }),
            executor,
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn settings(&self) -> QueueSettings {
        self.inner.settings.lock().unwrap().clone()
    }

    pub fn apply_queue_patch(&self, patch: &QueuePatch) -> QueueSettings {
        let mut settings = self.inner.settings.lock().unwrap();
        patch.apply(&mut settings);
        settings.clone()
    }

    pub fn phase(&self) -> LanePhase {
        let run = self.inner.run.lock().unwrap();
        match run.as_ref() {
            None => LanePhase::Idle,
            Some(active) => {
                if !active.steer_envelopes.is_empty() || active.interrupt_with.is_some() {
                    LanePhase::Steering
                } else if !self.inner.buffer.lock().unwrap().is_empty() {
                    LanePhase::Queueing
                } else {
                    LanePhase::Running
                }
            }
        }
    }

    pub fn set_verbose(&self, on: bool) {
        self.inner.verbose.store(on, Ordering::SeqCst);
    }

    pub fn verbose(&self) -> bool {
        self.inner.verbose.load(Ordering::SeqCst)
    }

    /// Buffered envelopes waiting behind the current run.
    pub fn queue_depth(&self) -> usize {
        let buffered = self.inner.buffer.lock().unwrap().len();
        let run = self.inner.run.lock().unwrap();
        let staged = run
            .as_ref()
            .map(|r| r.steer_envelopes.len() + usize::from(r.interrupt_with.is_some()))
            .unwrap_or(0);
        buffered + staged
    }

    /// Offer one envelope to the lane.
    pub fn submit(self: &Arc<Self>, envelope: Envelope) -> SubmitOutcome {
        self.submit_with(envelope, None)
    }

    /// Offer one envelope, optionally bound to an idempotency key that
    /// resolves when the run consuming the envelope completes.
    pub fn submit_with(
        self: &Arc<Self>,
        envelope: Envelope,
        idem_key: Option<String>,
    ) -> SubmitOutcome {
        let mode = self.settings().mode;
        let mut run_guard = self.inner.run.lock().unwrap();

        if run_guard.is_none() {
            let run_id = RunId::new();
            let cancel = CancellationToken::new();
            *run_guard = Some(ActiveRun {
                run_id: run_id.clone(),
                cancel: cancel.clone(),
                steer_envelopes: Vec::new(),
                interrupt_with: None,
                idem_keys: idem_key.into_iter().collect(),
                handoff_idem: Vec::new(),
            });
            drop(run_guard);

            self.spawn_run(self.job_for(envelope, Vec::new(), None, Vec::new(), &run_id), cancel);
            return SubmitOutcome::Started(run_id);
        }

        match mode {
            QueueMode::Collect | QueueMode::Followup => {
                // hold the run guard across the push so a completing run
                // cannot drain the buffer between our check and the insert
                let settings = self.settings();
                let outcome =
                    self.inner
                        .buffer
                        .lock()
                        .unwrap()
                        .push_keyed(envelope, idem_key, &settings);
                let depth = self.inner.buffer.lock().unwrap().len();
                match outcome {
                    PushOutcome::Buffered => SubmitOutcome::Buffered { depth },
                    PushOutcome::EvictedOld(n) => {
                        SubmitOutcome::BufferedWithDrop { depth, dropped: n }
                    }
                    PushOutcome::Summarized(n) => {
                        SubmitOutcome::BufferedWithDrop { depth, dropped: n }
                    }
                    PushOutcome::RejectedNew => SubmitOutcome::RejectedFull,
                }
            }
            QueueMode::Steer | QueueMode::SteerBacklog => {
                let Some(active) = run_guard.as_mut() else {
                    // unreachable: the guard was held since the None check
                    return SubmitOutcome::RejectedFull;
                };
                let run_id = active.run_id.clone();
                active.steer_envelopes.push(envelope);
                active.handoff_idem.extend(idem_key);
                let cancel = active.cancel.clone();
                drop(run_guard);
                info!(lane = %self.inner.key, run = %run_id, "steering in-flight run");
                cancel.cancel();
                SubmitOutcome::Steering(run_id)
            }
            QueueMode::Interrupt => {
                let Some(active) = run_guard.as_mut() else {
                    return SubmitOutcome::RejectedFull;
                };
                let run_id = active.run_id.clone();
                active.interrupt_with = Some(envelope);
                active.handoff_idem.extend(idem_key);
                let cancel = active.cancel.clone();
                drop(run_guard);
                info!(lane = %self.inner.key, run = %run_id, "interrupting in-flight run");
                cancel.cancel();
                SubmitOutcome::Interrupting(run_id)
            }
        }
    }

    /// Cancel the current run if `run_id` matches (or unconditionally when
    /// `run_id` is `None`). Returns whether a live run was cancelled.
    pub fn abort(&self, run_id: Option<&str>) -> bool {
        let run = self.inner.run.lock().unwrap();
        match run.as_ref() {
            Some(active) if run_id.is_none_or(|id| id == active.run_id.as_str()) => {
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    // -- idempotency (per-lane, under the lane's mutex) ---------------------

    /// Begin a keyed request. Returns the existing sticky state, or `None`
    /// after registering the key as in-flight.
    pub fn idem_begin(&self, key: &str) -> Option<(IdemState, Option<Value>)> {
        let mut idem = self.inner.idem.lock().unwrap();
        match idem.get(key) {
            Some(entry) => Some(entry.clone()),
            None => {
                idem.insert(key.to_string(), (IdemState::InFlight, None));
                None
            }
        }
    }

    /// Record the terminal state for a keyed request. The first terminal
    /// state sticks; later completions are ignored.
    pub fn idem_finish(&self, key: &str, ok: bool, payload: Option<Value>) {
        let mut idem = self.inner.idem.lock().unwrap();
        if let Some(entry) = idem.get_mut(key) {
            if entry.0 == IdemState::InFlight {
                *entry = (
                    if ok { IdemState::Ok } else { IdemState::Failed },
                    payload,
                );
            }
        }
    }

    // -- run lifecycle ------------------------------------------------------

    fn job_for(
        &self,
        envelope: Envelope,
        steer_notes: Vec<String>,
        carried_output: Option<String>,
        backlog: Vec<Envelope>,
        run_id: &RunId,
    ) -> LaneJob {
        LaneJob {
            session_key: self.inner.key.clone(),
            run_id: run_id.clone(),
            envelope,
            steer_notes,
            carried_output,
            backlog,
            verbose: self.inner.verbose.clone(),
        }
    }

    fn spawn_run(self: &Arc<Self>, job: LaneJob, cancel: CancellationToken) {
        let lane = Arc::clone(self);
        let executor = self.executor.clone();
        tokio::spawn(async move {
            let run_id = job.run_id.clone();
            let result = executor.execute(job, cancel).await;
            if let Err(e) = &result {
                match e {
                    AgentError::Cancelled => {
                        debug!(lane = %lane.inner.key, run = %run_id, "run cancelled")
                    }
                    other => {
                        warn!(lane = %lane.inner.key, run = %run_id, error = %other, "run failed")
                    }
                }
            }
            lane.on_run_complete(result);
        });
    }

    /// Completion handler: decide what (if anything) runs next.
    fn on_run_complete(self: &Arc<Self>, result: Result<RunOutcome, AgentError>) {
        let finished = {
            let mut run_guard = self.inner.run.lock().unwrap();
            run_guard.take()
        };
        let Some(finished) = finished else {
            return;
        };

        // resolve this run's idempotency keys to its terminal state
        let ok = result.is_ok();
        for key in &finished.idem_keys {
            self.idem_finish(
                key,
                ok,
                Some(serde_json::json!({
                    "status": if ok { "ok" } else { "failed" },
                    "runId": finished.run_id.as_str(),
                })),
            );
        }

        let mode = self.settings().mode;
        let handoff = finished.handoff_idem;

        // interrupt: partial output is discarded, the replacement runs alone
        if let Some(replacement) = finished.interrupt_with {
            self.start_next(replacement, Vec::new(), None, Vec::new(), handoff);
            return;
        }

        // steering: replacement prompt carries the steering text; in
        // steer+backlog mode the cancelled run's tool output and any other
        // buffered input ride along
        if !finished.steer_envelopes.is_empty() {
            let mut steer = finished.steer_envelopes;
            let notes: Vec<String> = steer
                .iter()
                .map(|e| e.text.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            let primary = steer.remove(0);

            let (carried, backlog) = if mode == QueueMode::SteerBacklog {
                let carried = result
                    .as_ref()
                    .ok()
                    .and_then(|outcome| outcome.partial_tool_output.clone());
                let mut backlog: Vec<Envelope> = steer;
                backlog.extend(
                    self.inner
                        .buffer
                        .lock()
                        .unwrap()
                        .drain()
                        .into_iter()
                        .map(|entry| entry.envelope),
                );
                (carried, backlog)
            } else {
                (None, Vec::new())
            };

            self.start_next(primary, notes, carried, backlog, handoff);
            return;
        }

        // queueing modes drain the buffer on completion
        match mode {
            QueueMode::Collect => {
                let entries = self.inner.buffer.lock().unwrap().drain();
                if !entries.is_empty() {
                    let mut keys = handoff;
                    keys.extend(entries.iter().filter_map(|e| e.idem_key.clone()));
                    let synthetic = synthesize(entries.into_iter().map(|e| e.envelope).collect());
                    self.start_next(synthetic, Vec::new(), None, Vec::new(), keys);
                }
            }
            QueueMode::Followup => {
                let next = self.inner.buffer.lock().unwrap().pop_front();
                if let Some(entry) = next {
                    let mut keys = handoff;
                    keys.extend(entry.idem_key);
                    self.start_next(entry.envelope, Vec::new(), None, Vec::new(), keys);
                }
            }
            _ => {
                // steer modes with an empty steer list and interrupt with no
                // replacement: nothing left to do
            }
        }
    }

    fn start_next(
        self: &Arc<Self>,
        envelope: Envelope,
        steer_notes: Vec<String>,
        carried_output: Option<String>,
        backlog: Vec<Envelope>,
        idem_keys: Vec<String>,
    ) {
        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        {
            let mut run_guard = self.inner.run.lock().unwrap();
            *run_guard = Some(ActiveRun {
                run_id: run_id.clone(),
                cancel: cancel.clone(),
                steer_envelopes: Vec::new(),
                interrupt_with: None,
                idem_keys,
                handoff_idem: Vec::new(),
            });
        }
        self.spawn_run(
            self.job_for(envelope, steer_notes, carried_output, backlog, &run_id),
            cancel,
        );
    }
}

/// Collect-mode flush: one synthetic envelope concatenating texts in arrival
/// order and unioning attachments.
fn synthesize(envelopes: Vec<Envelope>) -> Envelope {
    let mut iter = envelopes.into_iter();
    let mut combined = match iter.next() {
        Some(first) => first,
        None => return Envelope::text_message("internal", "scheduler", ""),
    };

    let mut texts: Vec<String> = Vec::new();
    let trimmed = combined.text.trim();
    if !trimmed.is_empty() {
        texts.push(trimmed.to_string());
    }
    let mut attachments: Vec<Attachment> = combined.attachments.clone();

    for envelope in iter {
        let trimmed = envelope.text.trim();
        if !trimmed.is_empty() {
            texts.push(trimmed.to_string());
        }
        attachments.extend(envelope.attachments);
        combined.received_at = combined.received_at.max(envelope.received_at);
    }

    for (index, attachment) in attachments.iter_mut().enumerate() {
        attachment.index = index;
    }

    combined.text = texts.join("\n");
    combined.attachments = attachments;
    combined
}

/// All lanes, keyed by session-key string.
pub struct LaneScheduler {
    lanes: DashMap<String, Arc<Lane>>,
    defaults: QueueSettings,
    executor: Arc<dyn LaneExecutor>,
}

impl LaneScheduler {
    pub fn new(defaults: QueueSettings, executor: Arc<dyn LaneExecutor>) -> Self {
        Self {
            lanes: DashMap::new(),
            defaults,
            executor,
        }
    }

    pub fn lane(&self, key: &str) -> Arc<Lane> {
        self.lanes
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Lane::new(
                    key.to_string(),
                    self.defaults.clone(),
                    self.executor.clone(),
                ))
            })
            .value()
            .clone()
    }

    pub fn existing_lane(&self, key: &str) -> Option<Arc<Lane>> {
        self.lanes.get(key).map(|entry| entry.value().clone())
    }

    pub fn submit(&self, key: &str, envelope: Envelope) -> SubmitOutcome {
        self.lane(key).submit(envelope)
    }

    /// Cancel the named run on the named lane.
    pub fn abort(&self, key: &str, run_id: Option<&str>) -> bool {
        self.existing_lane(key)
            .map(|lane| lane.abort(run_id))
            .unwrap_or(false)
    }

    /// Cancel every live run — `/stop`. Returns the lane keys that had one.
    pub fn abort_all(&self) -> Vec<String> {
        let mut cancelled = Vec::new();
        for entry in self.lanes.iter() {
            if entry.value().abort(None) {
                cancelled.push(entry.key().clone());
            }
        }
        cancelled
    }

    /// Sum of buffered envelopes across lanes — half of the restart gate's
    /// predicate.
    pub fn total_queue_size(&self) -> usize {
        self.lanes
            .iter()
            .map(|entry| entry.value().queue_depth())
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Executor stub: runs complete when a permit is released; cancellation
    /// wins over the permit, as with a real agent run.
    struct StubExecutor {
        jobs: Mutex<Vec<LaneJob>>,
        permits: Semaphore,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl StubExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                jobs: Mutex::new(Vec::new()),
                permits: Semaphore::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            })
        }

        fn release_one(&self) {
            self.permits.add_permits(1);
        }

        fn jobs(&self) -> Vec<LaneJob> {
            self.jobs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LaneExecutor for StubExecutor {
        async fn execute(
            &self,
            job: LaneJob,
            cancel: CancellationToken,
        ) -> Result<RunOutcome, AgentError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    self.jobs.lock().unwrap().push(job);
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    return Ok(RunOutcome {
                        partial_tool_output: Some("partial tool output".to_string()),
                        ..Default::default()
                    });
                }
                permit = self.permits.acquire() => {
                    permit.map(|p| p.forget()).map_err(|_| AgentError::Other("closed".into()))
                }
            };
            result?;

            self.jobs.lock().unwrap().push(job);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(RunOutcome::default())
        }
    }

    fn scheduler(mode: QueueMode, executor: Arc<StubExecutor>) -> LaneScheduler {
        let settings = QueueSettings {
            mode,
            cap: 10,
            drop: crate::queue::DropPolicy::Old,
            debounce_ms: 500,
        };
        LaneScheduler::new(settings, executor)
    }

    async fn settle() {
        // let spawned completion handlers run
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn env(text: &str) -> Envelope {
        Envelope::text_message("telegram", "alice", text)
    }

    #[tokio::test]
    async fn idle_lane_starts_run_immediately() {
        let exec = StubExecutor::new();
        let sched = scheduler(QueueMode::Collect, exec.clone());

        let outcome = sched.submit("agent:main:t:dm:1", env("hello"));
        assert!(matches!(outcome, SubmitOutcome::Started(_)));

        exec.release_one();
        settle().await;
        assert_eq!(exec.jobs().len(), 1);
        assert_eq!(exec.jobs()[0].envelope.text, "hello");
    }

    #[tokio::test]
    async fn collect_mode_flushes_buffer_as_one_synthetic_envelope() {
        let exec = StubExecutor::new();
        let sched = scheduler(QueueMode::Collect, exec.clone());
        let key = "agent:main:t:dm:2";

        sched.submit(key, env("first"));
        settle().await;
        assert!(matches!(
            sched.submit(key, env("second")),
            SubmitOutcome::Buffered { depth: 1 }
        ));
        assert!(matches!(
            sched.submit(key, env("third")),
            SubmitOutcome::Buffered { depth: 2 }
        ));
        assert_eq!(sched.total_queue_size(), 2);

        exec.release_one(); // finish run 1 → buffer flushes as run 2
        settle().await;
        exec.release_one();
        settle().await;

        let jobs = exec.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].envelope.text, "second\nthird");
        assert_eq!(sched.total_queue_size(), 0);
    }

    #[tokio::test]
    async fn followup_mode_processes_buffered_sequentially() {
        let exec = StubExecutor::new();
        let sched = scheduler(QueueMode::Followup, exec.clone());
        let key = "agent:main:t:dm:3";

        sched.submit(key, env("a"));
        settle().await;
        sched.submit(key, env("b"));
        sched.submit(key, env("c"));

        for _ in 0..3 {
            exec.release_one();
            settle().await;
        }

        let texts: Vec<String> = exec.jobs().iter().map(|j| j.envelope.text.clone()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert_eq!(exec.max_active.load(Ordering::SeqCst), 1, "one live run per lane");
    }

    #[tokio::test]
    async fn steer_cancels_and_restarts_with_new_text() {
        let exec = StubExecutor::new();
        let sched = scheduler(QueueMode::Steer, exec.clone());
        let key = "agent:main:t:dm:4";

        sched.submit(key, env("write a long poem"));
        settle().await;

        let outcome = sched.submit(key, env("actually, make it a haiku"));
        assert!(matches!(outcome, SubmitOutcome::Steering(_)));

        settle().await; // cancelled run completes, steered run starts
        exec.release_one();
        settle().await;

        let jobs = exec.jobs();
        assert_eq!(jobs.len(), 2);
        // first recorded job is the cancelled original
        assert_eq!(jobs[0].envelope.text, "write a long poem");
        let steered = &jobs[1];
        assert_eq!(steered.envelope.text, "actually, make it a haiku");
        assert_eq!(steered.steer_notes, vec!["actually, make it a haiku"]);
        // plain steer does not carry the cancelled run's tool output
        assert!(steered.carried_output.is_none());
    }

    #[tokio::test]
    async fn steer_backlog_carries_partial_output_and_buffer() {
        let exec = StubExecutor::new();
        let sched = scheduler(QueueMode::SteerBacklog, exec.clone());
        let key = "agent:main:t:dm:5";

        sched.submit(key, env("original"));
        settle().await;
        sched.submit(key, env("steer text"));
        settle().await;
        exec.release_one();
        settle().await;

        let jobs = exec.jobs();
        let steered = &jobs[1];
        assert_eq!(steered.carried_output.as_deref(), Some("partial tool output"));
        assert_eq!(steered.envelope.text, "steer text");
    }

    #[tokio::test]
    async fn interrupt_discards_and_runs_replacement_alone() {
        let exec = StubExecutor::new();
        let sched = scheduler(QueueMode::Interrupt, exec.clone());
        let key = "agent:main:t:dm:6";

        sched.submit(key, env("slow thing"));
        settle().await;
        let outcome = sched.submit(key, env("forget it, just say hi"));
        assert!(matches!(outcome, SubmitOutcome::Interrupting(_)));

        settle().await;
        exec.release_one();
        settle().await;

        let jobs = exec.jobs();
        assert_eq!(jobs.len(), 2);
        let replacement = &jobs[1];
        assert_eq!(replacement.envelope.text, "forget it, just say hi");
        assert!(replacement.steer_notes.is_empty());
        assert!(replacement.carried_output.is_none());
    }

    #[tokio::test]
    async fn abort_cancels_matching_run_only() {
        let exec = StubExecutor::new();
        let sched = scheduler(QueueMode::Collect, exec.clone());
        let key = "agent:main:t:dm:7";

        let SubmitOutcome::Started(run_id) = sched.submit(key, env("x")) else {
            panic!("expected run start");
        };

        assert!(!sched.abort(key, Some("not-the-run")));
        assert!(sched.abort(key, Some(run_id.as_str())));
        settle().await;
        assert!(!sched.abort(key, None), "no live run after cancellation");
    }

    #[tokio::test]
    async fn idempotency_is_sticky_per_lane() {
        let exec = StubExecutor::new();
        let sched = scheduler(QueueMode::Collect, exec.clone());
        let lane = sched.lane("agent:main:t:dm:8");

        assert!(lane.idem_begin("k1").is_none());
        assert_eq!(
            lane.idem_begin("k1").map(|(state, _)| state),
            Some(IdemState::InFlight)
        );

        lane.idem_finish("k1", true, Some(serde_json::json!({"status": "ok"})));
        assert_eq!(
            lane.idem_begin("k1").map(|(state, _)| state),
            Some(IdemState::Ok)
        );

        // terminal state sticks
        lane.idem_finish("k1", false, None);
        assert_eq!(
            lane.idem_begin("k1").map(|(state, _)| state),
            Some(IdemState::Ok)
        );
    }

    #[tokio::test]
    async fn idem_key_resolves_with_the_run_outcome() {
        let exec = StubExecutor::new();
        let sched = scheduler(QueueMode::Collect, exec.clone());
        let lane = sched.lane("agent:main:t:dm:10");

        assert!(lane.idem_begin("send-1").is_none());
        let outcome = lane.submit_with(env("hi"), Some("send-1".to_string()));
        assert!(matches!(outcome, SubmitOutcome::Started(_)));

        // second call with the same key sees in_flight, not a re-execution
        assert_eq!(
            lane.idem_begin("send-1").map(|(state, _)| state),
            Some(IdemState::InFlight)
        );

        exec.release_one();
        settle().await;

        let (state, payload) = lane.idem_begin("send-1").unwrap();
        assert_eq!(state, IdemState::Ok);
        assert_eq!(payload.unwrap()["status"], "ok");
        assert_eq!(exec.jobs().len(), 1, "one runner invocation for both calls");
    }

    #[tokio::test]
    async fn drop_new_surfaces_rejection() {
        let exec = StubExecutor::new();
        let settings = QueueSettings {
            mode: QueueMode::Collect,
            cap: 1,
            drop: crate::queue::DropPolicy::New,
            debounce_ms: 500,
        };
        let sched = LaneScheduler::new(settings, exec.clone());
        let key = "agent:main:t:dm:9";

        sched.submit(key, env("running"));
        settle().await;
        sched.submit(key, env("buffered"));
        assert_eq!(sched.submit(key, env("rejected")), SubmitOutcome::RejectedFull);
    }
}
