//! Per-run outbound dispatch with pending-reply reservations.
//!
//! A dispatcher is created when the scheduler starts a run and owns that
//! run's outbound queue. Deliveries serialize within a dispatcher and may
//! overlap across dispatchers. The reservation counter starts at 1 so a run
//! that completes before enqueueing anything still holds the restart gate
//! until `mark_complete`; every delivery releases its slot in a drop guard
//! so failures cannot leak reservations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crosstalk_agent::NO_REPLY;
use crosstalk_channels::types::{ReplyPayload, ReplyToMode};

/// Adapter-call side effect. Every invocation is wrapped so the reservation
/// releases on success and failure alike.
pub type DeliverFn =
    Arc<dyn Fn(ReplyPayload) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Where replies thread to and what the agent already said via its own
/// messaging tool.
#[derive(Debug, Clone, Default)]
pub struct ReplyContext {
    /// Message id of the originating envelope, for implicit threading and
    /// `[[reply:current]]`.
    pub origin_message_id: Option<String>,
    /// Channel threading capability.
    pub mode: ReplyToMode,
    /// Policy: thread to the originating message when the agent names
    /// nothing explicit.
    pub implicit_threading: bool,
    /// Chunk partial replies into block messages instead of interim sends.
    pub block_streaming: bool,
}

/// Why a payload was not enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResult {
    Enqueued,
    SuppressedNoReply,
    SuppressedDuplicate,
    SuppressedNotRenderable,
}

struct DispatcherInner {
    session_key: String,
    deliver: DeliverFn,
    context: ReplyContext,
    /// Queued-but-not-delivered plus in-flight deliveries.
    outstanding: AtomicUsize,
    /// The creation reservation; released once after `mark_complete` when
    /// the queue has drained.
    base_held: AtomicBool,
    complete: AtomicBool,
    idle: Notify,
    queue: Mutex<VecDeque<ReplyPayload>>,
    worker_wake: Notify,
    /// Trimmed texts the agent already delivered through its messaging
    /// tool; final replies matching by prefix are suppressed.
    tool_sent: Mutex<Vec<String>>,
    /// Block-streaming state: text already emitted as block replies.
    emitted_len: Mutex<usize>,
    chunk_buffer: Mutex<String>,
}

impl DispatcherInner {
    fn pending(&self) -> usize {
        let base = if self.base_held.load(Ordering::SeqCst) {
            1
        } else {
            0
        };
        self.outstanding.load(Ordering::SeqCst) + base
    }

    fn maybe_release_base(&self) {
        if self.complete.load(Ordering::SeqCst)
            && self.outstanding.load(Ordering::SeqCst) == 0
            && self.base_held.swap(false, Ordering::SeqCst)
        {
            self.idle.notify_waiters();
        }
    }
}

/// Released in all exits from a delivery, including panics in `deliver`.
struct DeliveryGuard {
    inner: Arc<DispatcherInner>,
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.inner.idle.notify_waiters();
        self.inner.maybe_release_base();
    }
}

#[derive(Clone)]
pub struct ReplyDispatcher {
    inner: Arc<DispatcherInner>,
    registry: DispatcherRegistry,
}

impl ReplyDispatcher {
    /// Create a dispatcher registered in the process-wide set.
    pub fn new(session_key: impl Into<String>, context: ReplyContext, deliver: DeliverFn) -> Self {
        Self::new_in(DispatcherRegistry::global(), session_key, context, deliver)
    }

    /// Create a dispatcher in an explicit registry — the injection seam for
    /// tests and embedded setups.
    pub fn new_in(
        registry: DispatcherRegistry,
        session_key: impl Into<String>,
        context: ReplyContext,
        deliver: DeliverFn,
    ) -> Self {
        let inner = Arc::new(DispatcherInner {
            session_key: session_key.into(),
            deliver,
            context,
            outstanding: AtomicUsize::new(0),
            base_held: AtomicBool::new(true),
            complete: AtomicBool::new(false),
            idle: Notify::new(),
            queue: Mutex::new(VecDeque::new()),
            worker_wake: Notify::new(),
            tool_sent: Mutex::new(Vec::new()),
            emitted_len: Mutex::new(0),
            chunk_buffer: Mutex::new(String::new()),
        });

        registry.entries.lock().unwrap().push(Arc::downgrade(&inner));
        spawn_worker(inner.clone());

        Self { inner, registry }
    }

    pub fn session_key(&self) -> &str {
        &self.inner.session_key
    }

    /// Record a text the agent sent itself via its messaging tool, for the
    /// duplicate-suppression step.
    pub fn record_tool_sent(&self, text: &str) {
        self.inner
            .tool_sent
            .lock()
            .unwrap()
            .push(text.trim().to_string());
    }

    /// Enqueue the run's terminal reply after the threading pipeline.
    pub fn send_final(&self, payload: ReplyPayload) -> SendResult {
        if payload
            .text
            .as_deref()
            .is_some_and(|t| t.trim() == NO_REPLY)
        {
            debug!(session = %self.inner.session_key, "NO_REPLY sentinel, delivery suppressed");
            return SendResult::SuppressedNoReply;
        }

        let mut prepared = match self.prepare(payload) {
            Ok(p) => p,
            Err(result) => return result,
        };

        // In block-streaming mode earlier partials already went out; the
        // final delivers only the unsent tail.
        if self.inner.context.block_streaming {
            let emitted = *self.inner.emitted_len.lock().unwrap();
            if emitted > 0 {
                let tail = prepared
                    .text
                    .as_deref()
                    .and_then(|text| text.get(emitted..))
                    .map(|tail| tail.trim_start().to_string());
                if let Some(tail) = tail {
                    if tail.is_empty() {
                        return SendResult::SuppressedDuplicate;
                    }
                    prepared.text = Some(tail);
                }
            }
        }

        self.enqueue(prepared);
        SendResult::Enqueued
    }

    /// Streaming partial. With block streaming enabled, deltas accumulate
    /// and complete blocks (blank-line separated) are delivered as they
    /// close; otherwise the delta goes out as one interim message.
    pub fn send_partial(&self, payload: ReplyPayload) -> SendResult {
        if !self.inner.context.block_streaming {
            if !payload.renderable() {
                return SendResult::SuppressedNotRenderable;
            }
            self.enqueue(payload);
            return SendResult::Enqueued;
        }

        let Some(delta) = payload.text else {
            return SendResult::SuppressedNotRenderable;
        };

        let mut enqueued = false;
        {
            let mut buffer = self.inner.chunk_buffer.lock().unwrap();
            buffer.push_str(&delta);
            while let Some(boundary) = buffer.find("\n\n") {
                let block: String = buffer[..boundary].trim().to_string();
                let consumed = boundary + 2;
                *self.inner.emitted_len.lock().unwrap() += consumed;
                buffer.drain(..consumed);
                if !block.is_empty() {
                    self.enqueue(ReplyPayload::text(block));
                    enqueued = true;
                }
            }
        }
        if enqueued {
            SendResult::Enqueued
        } else {
            SendResult::SuppressedNotRenderable
        }
    }

    /// No further replies will be enqueued; the creation reservation is
    /// released once the last delivery finishes.
    pub fn mark_complete(&self) {
        self.inner.complete.store(true, Ordering::SeqCst);
        self.inner.maybe_release_base();
        // wake the worker so it can observe completion and exit
        self.inner.worker_wake.notify_one();
    }

    /// Reservation + queued-but-not-delivered count.
    pub fn pending(&self) -> usize {
        self.inner.pending()
    }

    /// Resolves when `pending()` reaches zero.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // register before checking so a release between the check and
            // the await cannot be missed
            notified.as_mut().enable();
            if self.inner.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Remove this dispatcher from its registry.
    pub fn unregister(&self) {
        let target = Arc::as_ptr(&self.inner);
        self.registry
            .entries
            .lock()
            .unwrap()
            .retain(|weak| weak.upgrade().is_some_and(|arc| Arc::as_ptr(&arc) != target));
    }

    // -- internals ----------------------------------------------------------

    fn enqueue(&self, payload: ReplyPayload) {
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        self.inner.queue.lock().unwrap().push_back(payload);
        self.inner.worker_wake.notify_one();
    }

    /// The reply-threading pipeline: implicit thread target, explicit
    /// `[[reply:...]]` tags, channel capability filter, renderability,
    /// duplicate suppression (fail-closed).
    fn prepare(&self, mut payload: ReplyPayload) -> Result<ReplyPayload, SendResult> {
        let ctx = &self.inner.context;

        // 1. implicit threading
        if payload.reply_to_id.is_none() && !payload.reply_to_current && ctx.implicit_threading {
            payload.reply_to_id = ctx.origin_message_id.clone();
        }

        // 2. explicit tags win over implicit
        if let Some(text) = payload.text.take() {
            let (tag, stripped) = parse_reply_tag(&text);
            payload.text = Some(stripped);
            match tag {
                Some(ReplyTag::Current) => {
                    payload.reply_to_current = true;
                    payload.reply_to_id = ctx.origin_message_id.clone();
                }
                Some(ReplyTag::Id(id)) => payload.reply_to_id = Some(id),
                None => {}
            }
        }

        // 3. channel capability filter
        match ctx.mode {
            ReplyToMode::Any => {}
            ReplyToMode::CurrentOnly => {
                let is_current = payload.reply_to_current
                    || payload.reply_to_id == ctx.origin_message_id;
                if !is_current {
                    payload.reply_to_id = None;
                }
            }
            ReplyToMode::Never => {
                payload.reply_to_id = None;
                payload.reply_to_current = false;
            }
        }

        // 4. only renderable payloads are enqueued
        if !payload.renderable() {
            return Err(SendResult::SuppressedNotRenderable);
        }

        // 5. duplicate suppression against tool-sent texts; on doubt,
        // suppress.
        if let Some(text) = payload.text.as_deref() {
            let trimmed = text.trim();
            let sent = self.inner.tool_sent.lock().unwrap();
            let duplicate = sent.iter().any(|prior| {
                !prior.is_empty()
                    && (trimmed.starts_with(prior.as_str()) || prior.starts_with(trimmed))
            });
            if duplicate {
                debug!(session = %self.inner.session_key, "final reply duplicates tool-sent text, suppressed");
                return Err(SendResult::SuppressedDuplicate);
            }
        }

        Ok(payload)
    }
}

fn spawn_worker(inner: Arc<DispatcherInner>) {
    tokio::spawn(async move {
        loop {
            let payload = {
                let mut queue = inner.queue.lock().unwrap();
                queue.pop_front()
            };
            match payload {
                Some(payload) => {
                    let guard = DeliveryGuard {
                        inner: inner.clone(),
                    };
                    if let Err(e) = (inner.deliver)(payload).await {
                        warn!(session = %inner.session_key, error = %e, "reply delivery failed");
                    }
                    drop(guard);
                }
                None => {
                    // Exit once the run is complete and everything drained;
                    // otherwise park until new work arrives.
                    if inner.complete.load(Ordering::SeqCst)
                        && inner.outstanding.load(Ordering::SeqCst) == 0
                    {
                        return;
                    }
                    inner.worker_wake.notified().await;
                }
            }
        }
    });
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplyTag {
    Current,
    Id(String),
}

/// Extract and strip one `[[reply:<id>]]` / `[[reply:current]]` tag.
fn parse_reply_tag(text: &str) -> (Option<ReplyTag>, String) {
    const OPEN: &str = "[[reply:";
    let Some(start) = text.find(OPEN) else {
        return (None, text.to_string());
    };
    let after = &text[start + OPEN.len()..];
    let Some(end) = after.find("]]") else {
        return (None, text.to_string());
    };
    let id = after[..end].trim();
    if id.is_empty() {
        return (None, text.to_string());
    }

    let mut stripped = String::with_capacity(text.len());
    stripped.push_str(&text[..start]);
    stripped.push_str(&after[end + 2..]);
    let stripped = stripped.trim().to_string();

    let tag = if id.eq_ignore_ascii_case("current") {
        ReplyTag::Current
    } else {
        ReplyTag::Id(id.to_string())
    };
    (Some(tag), stripped)
}

// ---------------------------------------------------------------------------
// Dispatcher registry
// ---------------------------------------------------------------------------

/// Mutex-guarded set of live dispatchers. The process normally uses the
/// global instance; constructors accept an explicit one as the
/// dependency-injection seam.
#[derive(Clone, Default)]
pub struct DispatcherRegistry {
    entries: Arc<Mutex<Vec<Weak<DispatcherInner>>>>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> Self {
        static GLOBAL: OnceLock<DispatcherRegistry> = OnceLock::new();
        GLOBAL.get_or_init(DispatcherRegistry::new).clone()
    }

    /// Sum of `pending()` over all registered dispatchers — the value the
    /// restart gate observes.
    pub fn total_pending_replies(&self) -> usize {
        let mut guard = self.entries.lock().unwrap();
        guard.retain(|weak| weak.strong_count() > 0);
        guard
            .iter()
            .filter_map(|weak| weak.upgrade())
            .map(|inner| inner.pending())
            .sum()
    }

    /// Test-only: forget every registered dispatcher.
    #[cfg(any(test, feature = "test-support"))]
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Sum over the process-wide registry.
pub fn total_pending_replies() -> usize {
    DispatcherRegistry::global().total_pending_replies()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
