//! Queue modes, drop policies, the per-lane buffer, and `/queue` parsing.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crosstalk_channels::types::Envelope;
use crosstalk_core::config::QueueConfig;

/// What a lane does with arrivals while a run is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    /// Buffer, then flush the buffer as one synthetic envelope.
    #[default]
    Collect,
    /// Buffer, then process each buffered envelope sequentially.
    Followup,
    /// Cancel the in-flight run and start fresh with the new text merged in.
    Steer,
    /// Like steer, but the cancelled run's tool output and any buffered
    /// inputs ride along in the new prompt.
    SteerBacklog,
    /// Cancel and discard the current run's partial output entirely.
    Interrupt,
}

impl QueueMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueMode::Collect => "collect",
            QueueMode::Followup => "followup",
            QueueMode::Steer => "steer",
            QueueMode::SteerBacklog => "steer+backlog",
            QueueMode::Interrupt => "interrupt",
        }
    }

    pub fn is_steering(&self) -> bool {
        matches!(self, QueueMode::Steer | QueueMode::SteerBacklog)
    }
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "collect" => Ok(QueueMode::Collect),
            "followup" => Ok(QueueMode::Followup),
            "steer" => Ok(QueueMode::Steer),
            "steer+backlog" | "steer-backlog" => Ok(QueueMode::SteerBacklog),
            "interrupt" => Ok(QueueMode::Interrupt),
            other => Err(format!(
                "unknown queue mode '{other}' (collect, followup, steer, steer+backlog, interrupt)"
            )),
        }
    }
}

/// What happens when the buffer exceeds its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    /// Evict oldest buffered entries.
    #[default]
    Old,
    /// Reject the just-arrived entry with a visible failure.
    New,
    /// Compact oldest entries into a single lossy summary envelope.
    Summarize,
}

impl DropPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropPolicy::Old => "old",
            DropPolicy::New => "new",
            DropPolicy::Summarize => "summarize",
        }
    }
}

impl FromStr for DropPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "old" => Ok(DropPolicy::Old),
            "new" => Ok(DropPolicy::New),
            "summarize" => Ok(DropPolicy::Summarize),
            other => Err(format!("unknown drop policy '{other}' (old, new, summarize)")),
        }
    }
}

/// Effective lane settings: config defaults overlaid with per-session
/// `/queue` overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub mode: QueueMode,
    pub cap: usize,
    pub drop: DropPolicy,
    pub debounce_ms: u64,
}

impl QueueSettings {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            mode: config.mode.parse().unwrap_or_default(),
            cap: config.cap,
            drop: config.drop.parse().unwrap_or_default(),
            debounce_ms: config.debounce_ms,
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// The `/queue` report line.
    pub fn report(&self) -> String {
        format!(
            "queue: mode={} debounce={}ms cap={} drop={}",
            self.mode.as_str(),
            self.debounce_ms,
            self.cap,
            self.drop.as_str()
        )
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// Parsed `/queue` mutation: only the named fields change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueuePatch {
    pub mode: Option<QueueMode>,
    pub cap: Option<usize>,
    pub drop: Option<DropPolicy>,
    pub debounce_ms: Option<u64>,
}

impl QueuePatch {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none() && self.cap.is_none() && self.drop.is_none() && self.debounce_ms.is_none()
    }

    pub fn apply(&self, settings: &mut QueueSettings) {
        if let Some(mode) = self.mode {
            settings.mode = mode;
        }
        if let Some(cap) = self.cap {
            settings.cap = cap;
        }
        if let Some(drop) = self.drop {
            settings.drop = drop;
        }
        if let Some(debounce_ms) = self.debounce_ms {
            settings.debounce_ms = debounce_ms;
        }
    }
}

/// Parse `/queue` arguments: `mode:<m> debounce:<ms|s|m> cap:<n> drop:<p>`.
/// An empty argument string means "report current settings".
pub fn parse_queue_args(args: &str) -> Result<QueuePatch, String> {
    let mut patch = QueuePatch::default();
    for token in args.split_whitespace() {
        let (field, value) = token
            .split_once(':')
            .ok_or_else(|| format!("expected field:value, got '{token}'"))?;
        match field {
            "mode" => patch.mode = Some(value.parse()?),
            "cap" => {
                patch.cap = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| format!("cap must be a number, got '{value}'"))?,
                )
            }
            "drop" => patch.drop = Some(value.parse()?),
            "debounce" => patch.debounce_ms = Some(parse_duration_ms(value)?),
            other => return Err(format!("unknown queue field '{other}'")),
        }
    }
    Ok(patch)
}

/// `2000`, `2000ms`, `2s`, `1m` → milliseconds.
fn parse_duration_ms(value: &str) -> Result<u64, String> {
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => value.split_at(split),
        None => (value, "ms"),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{value}'"))?;
    match unit {
        "" | "ms" => Ok(n),
        "s" => Ok(n * 1_000),
        "m" => Ok(n * 60_000),
        other => Err(format!("unknown duration unit '{other}' in '{value}'")),
    }
}

/// One buffered arrival.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub envelope: Envelope,
    pub arrived_at: chrono::DateTime<chrono::Utc>,
    /// Idempotency key of the request that delivered this envelope, if any;
    /// resolved when the run that consumes the entry completes.
    pub idem_key: Option<String>,
}

/// Outcome of offering an entry to the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Buffered,
    /// Oldest entries were evicted to make room.
    EvictedOld(usize),
    /// Oldest entries were compacted into a summary envelope.
    Summarized(usize),
    /// The new entry was rejected (drop policy `new`).
    RejectedNew,
}

/// Bounded ring of buffered envelopes with the three drop policies.
#[derive(Debug, Default)]
pub struct QueueBuffer {
    entries: VecDeque<QueueEntry>,
}

impl QueueBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, envelope: Envelope, settings: &QueueSettings) -> PushOutcome {
        self.push_keyed(envelope, None, settings)
    }

    pub fn push_keyed(
        &mut self,
        envelope: Envelope,
        idem_key: Option<String>,
        settings: &QueueSettings,
    ) -> PushOutcome {
        if self.entries.len() < settings.cap {
            self.entries.push_back(QueueEntry {
                envelope,
                arrived_at: chrono::Utc::now(),
                idem_key,
            });
            return PushOutcome::Buffered;
        }

        match settings.drop {
            DropPolicy::New => PushOutcome::RejectedNew,
            DropPolicy::Old => {
                let mut evicted = 0;
                while !self.entries.is_empty() && self.entries.len() >= settings.cap {
                    self.entries.pop_front();
                    evicted += 1;
                }
                self.entries.push_back(QueueEntry {
                    envelope,
                    arrived_at: chrono::Utc::now(),
                    idem_key,
                });
                PushOutcome::EvictedOld(evicted)
            }
            DropPolicy::Summarize => {
                let compact_count = (self.entries.len() / 2 + 1).min(self.entries.len());
                let compacted: Vec<QueueEntry> =
                    self.entries.drain(..compact_count).collect();
                if !compacted.is_empty() {
                    let summary = summarize_entries(&compacted);
                    self.entries.push_front(QueueEntry {
                        envelope: summary,
                        arrived_at: chrono::Utc::now(),
                        idem_key: None,
                    });
                }
                self.entries.push_back(QueueEntry {
                    envelope,
                    arrived_at: chrono::Utc::now(),
                    idem_key,
                });
                PushOutcome::Summarized(compacted.len())
            }
        }
    }

    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    pub fn drain(&mut self) -> Vec<QueueEntry> {
        self.entries.drain(..).collect()
    }
}

/// Lossy compaction of dropped entries. No caller-supplied compaction prompt
/// exists at this layer, so a fixed one-line digest keeps the policy total.
fn summarize_entries(entries: &[QueueEntry]) -> Envelope {
    let first = &entries[0].envelope;
    let mut digest: Vec<String> = Vec::with_capacity(entries.len());
    for entry in entries {
        let text = entry.envelope.text.trim();
        let head: String = text.chars().take(80).collect();
        if !head.is_empty() {
            digest.push(head);
        }
    }
    let mut summary = first.clone();
    summary.text = format!(
        "[dropped {} earlier messages: {}]",
        entries.len(),
        digest.join(" | ")
    );
    summary.attachments = Vec::new();
    summary
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
