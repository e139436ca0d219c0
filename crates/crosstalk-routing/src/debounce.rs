//! Per-target inbound coalescing.
//!
//! Webhook bridges deliver one logical message as several events in quick
//! succession (text, then a link-preview balloon, then an image). The
//! debouncer buckets entries by coalesce key and holds each bucket open for
//! a sliding window; a new same-key arrival extends the window. When the
//! window closes the bucket is detached atomically and flushed exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

/// Flush callback: receives the detached bucket in arrival order.
pub type FlushFn<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

pub struct DebouncerOptions<T> {
    pub debounce: Duration,
    pub build_key: Arc<dyn Fn(&T) -> String + Send + Sync>,
    /// Entries this returns `false` for bypass the window and flush alone,
    /// immediately: bot-authored messages and slash commands must not wait.
    pub should_debounce: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    pub on_flush: FlushFn<T>,
    pub on_error: Arc<dyn Fn(String) + Send + Sync>,
}

struct Bucket<T> {
    entries: Vec<T>,
    /// Bumped on every arrival; a timer only flushes the generation it was
    /// armed for, which is what makes the window slide.
    generation: u64,
}

pub struct Debouncer<T: Send + 'static> {
    buckets: Arc<Mutex<HashMap<String, Bucket<T>>>>,
    opts: Arc<DebouncerOptions<T>>,
}

impl<T: Send + 'static> Clone for Debouncer<T> {
    fn clone(&self) -> Self {
        Self {
            buckets: self.buckets.clone(),
            opts: self.opts.clone(),
        }
    }
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new(opts: DebouncerOptions<T>) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            opts: Arc::new(opts),
        }
    }

    /// Add one entry. Bypass entries flush inline; everything else lands in
    /// its bucket and (re)arms the window timer.
    pub async fn enqueue(&self, entry: T) {
        if !(self.opts.should_debounce)(&entry) {
            self.flush_now(vec![entry]).await;
            return;
        }

        let key = (self.opts.build_key)(&entry);
        let generation = {
            let mut buckets = self.buckets.lock().unwrap();
            let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
                entries: Vec::new(),
                generation: 0,
            });
            bucket.entries.push(entry);
            bucket.generation += 1;
            bucket.generation
        };

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.opts.debounce).await;
            this.fire(&key, generation).await;
        });
    }

    /// Timer body: detach and flush the bucket iff no newer arrival has
    /// extended the window since this timer was armed.
    async fn fire(&self, key: &str, generation: u64) {
        let detached = {
            let mut buckets = self.buckets.lock().unwrap();
            match buckets.get(key) {
                Some(bucket) if bucket.generation == generation => buckets
                    .remove(key)
                    .map(|bucket| bucket.entries)
                    .unwrap_or_default(),
                _ => return, // window slid; a newer timer owns this bucket
            }
        };
        if detached.is_empty() {
            return;
        }
        debug!(key, entries = detached.len(), "debounce window closed");
        self.flush_now(detached).await;
    }

    async fn flush_now(&self, entries: Vec<T>) {
        if let Err(e) = (self.opts.on_flush)(entries).await {
            warn!(error = %e, "debounce flush failed");
            (self.opts.on_error)(e);
        }
    }

    /// Number of open buckets — observability only.
    pub fn open_buckets(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    fn collecting(
        debounce_ms: u64,
        flushed: Arc<AsyncMutex<Vec<Vec<String>>>>,
        bypass_slash: bool,
    ) -> Debouncer<String> {
        Debouncer::new(DebouncerOptions {
            debounce: Duration::from_millis(debounce_ms),
            build_key: Arc::new(|entry: &String| {
                entry.split(':').next().unwrap_or_default().to_string()
            }),
            should_debounce: Arc::new(move |entry: &String| {
                !(bypass_slash && entry.contains('/'))
            }),
            on_flush: Arc::new(move |entries| {
                let flushed = flushed.clone();
                Box::pin(async move {
                    flushed.lock().await.push(entries);
                    Ok(())
                })
            }),
            on_error: Arc::new(|_| {}),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_coalesces_into_one_flush() {
        let flushed = Arc::new(AsyncMutex::new(Vec::new()));
        let debouncer = collecting(500, flushed.clone(), false);

        debouncer.enqueue("k1:a".to_string()).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        debouncer.enqueue("k1:b".to_string()).await;

        tokio::time::sleep(Duration::from_millis(600)).await;

        let flushed = flushed.lock().await;
        assert_eq!(flushed.len(), 1, "exactly one flush per window");
        assert_eq!(flushed[0], vec!["k1:a".to_string(), "k1:b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_on_new_arrivals() {
        let flushed = Arc::new(AsyncMutex::new(Vec::new()));
        let debouncer = collecting(500, flushed.clone(), false);

        debouncer.enqueue("k1:a".to_string()).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        debouncer.enqueue("k1:b".to_string()).await;

        // original deadline passes; window extended, nothing flushed yet
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(flushed.lock().await.is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(flushed.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_flush_independently() {
        let flushed = Arc::new(AsyncMutex::new(Vec::new()));
        let debouncer = collecting(500, flushed.clone(), false);

        debouncer.enqueue("k1:a".to_string()).await;
        debouncer.enqueue("k2:b".to_string()).await;
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(flushed.lock().await.len(), 2);
        assert_eq!(debouncer.open_buckets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bypass_entries_flush_immediately() {
        let flushed = Arc::new(AsyncMutex::new(Vec::new()));
        let debouncer = collecting(500, flushed.clone(), true);

        debouncer.enqueue("k1:/help".to_string()).await;

        // no time advanced at all
        let got = flushed.lock().await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], vec!["k1:/help".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_error_reaches_on_error() {
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = errors.clone();
        let debouncer: Debouncer<String> = Debouncer::new(DebouncerOptions {
            debounce: Duration::from_millis(100),
            build_key: Arc::new(|_: &String| "k".to_string()),
            should_debounce: Arc::new(|_| true),
            on_flush: Arc::new(|_| Box::pin(async { Err("boom".to_string()) })),
            on_error: Arc::new(move |_| {
                errors_clone.fetch_add(1, Ordering::SeqCst);
            }),
        });

        debouncer.enqueue("x".to_string()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
