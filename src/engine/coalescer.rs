//! Debounced flush primitive for streamed fragments.
//!
//! Fragments pushed under a key accumulate in a buffer. The first push arms a
//! single timer for that key; later pushes while it is armed only extend the
//! buffer. When the timer fires it sends a [`FlushTick`] to the owner's
//! channel, and the owner drains the buffer through
//! [`StreamingCoalescer::on_tick`]. A generation number on each timer makes
//! ticks from cancelled or force-flushed timers harmless.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identifies one buffer across all coalescers of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlushKey {
    /// Thought text.
    Thought,
    /// Agent message blocks.
    Message,
    /// Content fragments of one tool call.
    ToolContent(String),
}

/// Timer expiry notice delivered to the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushTick<K> {
    /// Buffer whose timer fired.
    pub key: K,
    generation: u64,
}

#[derive(Debug)]
struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Per-key debounce buffers with at most one armed timer per key.
#[derive(Debug)]
pub struct StreamingCoalescer<K, T> {
    window: Duration,
    buffers: HashMap<K, Vec<T>>,
    timers: HashMap<K, Timer>,
    next_generation: u64,
    ticks: mpsc::UnboundedSender<FlushTick<K>>,
}

impl<K, T> StreamingCoalescer<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Create a coalescer whose timers fire after `window` into `ticks`.
    #[must_use]
    pub fn new(window: Duration, ticks: mpsc::UnboundedSender<FlushTick<K>>) -> Self {
        Self {
            window,
            buffers: HashMap::new(),
            timers: HashMap::new(),
            next_generation: 0,
            ticks,
        }
    }

    /// Buffer `item` under `key` and arm its timer if none is outstanding.
    pub fn push(&mut self, key: K, item: T) {
        self.buffers.entry(key.clone()).or_default().push(item);
        self.schedule(key);
    }

    /// Arm the timer for `key` unless one is already outstanding.
    pub fn schedule(&mut self, key: K) {
        if self.timers.contains_key(&key) {
            return;
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        let ticks = self.ticks.clone();
        let window = self.window;
        let tick_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // The owner may be gone after teardown.
            let _ = ticks.send(FlushTick {
                key: tick_key,
                generation,
            });
        });
        self.timers.insert(key, Timer { generation, handle });
    }

    /// Drain the buffer a live timer belongs to. Stale ticks yield `None`.
    pub fn on_tick(&mut self, tick: &FlushTick<K>) -> Option<Vec<T>> {
        let live = self
            .timers
            .get(&tick.key)
            .is_some_and(|t| t.generation == tick.generation);
        if !live {
            return None;
        }
        self.timers.remove(&tick.key);
        Some(self.buffers.remove(&tick.key).unwrap_or_default())
    }

    /// Cancel the timer for `key` and return its buffer immediately.
    pub fn force_flush(&mut self, key: &K) -> Vec<T> {
        if let Some(timer) = self.timers.remove(key) {
            timer.handle.abort();
        }
        self.buffers.remove(key).unwrap_or_default()
    }

    /// Cancel the timer for `key` and drop its buffer.
    pub fn discard(&mut self, key: &K) {
        drop(self.force_flush(key));
    }

    /// Cancel every timer and drop every buffer.
    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
        self.buffers.clear();
    }

    /// Keys with buffered items.
    pub fn pending_keys(&self) -> impl Iterator<Item = &K> {
        self.buffers
            .iter()
            .filter(|(_, items)| !items.is_empty())
            .map(|(key, _)| key)
    }

    /// Whether `key` has buffered items.
    #[must_use]
    pub fn has_pending(&self, key: &K) -> bool {
        self.buffers.get(key).is_some_and(|items| !items.is_empty())
    }

    /// Number of armed timers.
    #[must_use]
    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }
}

impl<K, T> Drop for StreamingCoalescer<K, T> {
    fn drop(&mut self) {
        for timer in self.timers.values() {
            timer.handle.abort();
        }
    }
}
