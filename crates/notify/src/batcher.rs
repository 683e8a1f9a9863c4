use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use common::{ActivityEvent, Notification, NotificationSink, Priority};

/// Rate-limited, summarized alerting over activity events.
///
/// Events accumulate in a bounded queue; a scheduled flush drains the
/// queue into one summarized notification per interval. On overflow the
/// oldest events are evicted first. Best-effort throughout: a full queue
/// drops events, a failed send drops the notification.
pub struct NotificationBatcher {
    queue: Mutex<VecDeque<ActivityEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    sink: Arc<dyn NotificationSink>,
    /// Minimum spacing between outbound notifications.
    min_interval: Duration,
    last_flush: Mutex<Option<Instant>>,
}

impl NotificationBatcher {
    pub fn new(sink: Arc<dyn NotificationSink>, capacity: usize, min_interval: Duration) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            sink,
            min_interval,
            last_flush: Mutex::new(None),
        }
    }

    pub fn push(&self, event: ActivityEvent) {
        let mut queue = self.queue.lock().expect("batcher lock poisoned");
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().expect("batcher lock poisoned").len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain the queue into one summarized notification, respecting the
    /// rate limit. A skipped flush leaves the queue intact.
    pub async fn flush(&self) {
        {
            let last = self.last_flush.lock().expect("batcher lock poisoned");
            if let Some(at) = *last {
                if at.elapsed() < self.min_interval {
                    debug!("Notification flush skipped by rate limit");
                    return;
                }
            }
        }

        let events: Vec<ActivityEvent> = {
            let mut queue = self.queue.lock().expect("batcher lock poisoned");
            queue.drain(..).collect()
        };
        if events.is_empty() {
            return;
        }

        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        let notification = summarize(&events, dropped);
        *self.last_flush.lock().expect("batcher lock poisoned") = Some(Instant::now());

        if let Err(e) = self.sink.send(&notification).await {
            warn!(error = %e, "Notification send failed; alert dropped");
        }
    }

    /// Enqueue from the activity channel. Call from `tokio::spawn`.
    pub async fn run(self: Arc<Self>, mut event_rx: mpsc::Receiver<ActivityEvent>) {
        while let Some(event) = event_rx.recv().await {
            self.push(event);
        }
        warn!("NotificationBatcher: activity channel closed");
    }
}

fn event_line(event: &ActivityEvent) -> (String, Priority) {
    match event {
        ActivityEvent::OrderRouted {
            strategy_id,
            venue,
            symbol,
            side,
            quantity,
        } => (
            format!("{strategy_id}: {side} {quantity:.6} {symbol} via {venue}"),
            Priority::Low,
        ),
        ActivityEvent::OrderRefused {
            strategy_id,
            failed_checks,
        } => (
            format!(
                "{strategy_id}: real-money order refused (failing: {})",
                failed_checks.join(", ")
            ),
            Priority::High,
        ),
        ActivityEvent::OrderFailed {
            strategy_id,
            symbol,
            error,
        } => (
            format!(
                "{}: order failed on {symbol}: {error}",
                strategy_id.as_deref().unwrap_or("-")
            ),
            Priority::Normal,
        ),
        ActivityEvent::CheckFailed { check_id, evidence } => (
            format!("safety check '{check_id}' failing: {evidence}"),
            Priority::High,
        ),
        ActivityEvent::AccountCycled {
            account_id,
            generation,
            reason,
        } => (
            format!("account {account_id} cycled to generation {generation} ({reason})"),
            Priority::High,
        ),
        ActivityEvent::PositionCloseFailed {
            account_id,
            symbol,
            error,
        } => (
            format!("cycle close failed for {symbol} on {account_id}: {error}"),
            Priority::High,
        ),
        ActivityEvent::AdapterUnavailable { venue, detail } => (
            format!("{venue} adapter unavailable: {detail}"),
            Priority::Normal,
        ),
    }
}

fn summarize(events: &[ActivityEvent], dropped: u64) -> Notification {
    let mut lines = Vec::with_capacity(events.len() + 1);
    let mut priority = Priority::Low;
    for event in events {
        let (line, p) = event_line(event);
        lines.push(line);
        priority = priority.max(p);
    }
    if dropped > 0 {
        lines.push(format!("({dropped} older events dropped under backpressure)"));
    }

    Notification {
        title: format!("Trading activity ({} events)", events.len()),
        body: lines.join("\n"),
        priority,
    }
}
