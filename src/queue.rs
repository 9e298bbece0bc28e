//! TTL-bounded outgoing message queue with backoff-retried batch upload.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::Transport;
use crate::health::HealthMetrics;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(10 * 60);

const INITIAL_BACKOFF: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Queue timing settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub flush_interval: Duration,
    pub message_ttl: Duration,
    /// When off, flushes are additionally rate limited to one per
    /// `flush_interval` because they are driven by manual report calls.
    pub auto_profiling: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            message_ttl: DEFAULT_MESSAGE_TTL,
            auto_profiling: true,
        }
    }
}

/// One queued message.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub content: serde_json::Value,
    pub added_at: SystemTime,
}

#[derive(Serialize)]
struct UploadPayload<'a> {
    messages: Vec<UploadMessage<'a>>,
}

#[derive(Serialize)]
struct UploadMessage<'a> {
    topic: &'a str,
    content: &'a serde_json::Value,
}

struct State {
    queue: Vec<Message>,
    backoff: Duration,
    /// Monotonic, so wall-clock steps never stall uploads.
    last_flush: Instant,
}

/// Outgoing messages awaiting upload.
///
/// Single-flight is timestamp based: no lock is held across the upload, so
/// two flushes started in the same instant may both send.
pub struct MessageQueue {
    cfg: QueueConfig,
    state: Mutex<State>,
    health: Option<Arc<HealthMetrics>>,
}

impl MessageQueue {
    pub fn new(cfg: QueueConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(State {
                queue: Vec::new(),
                backoff: Duration::ZERO,
                last_flush: Instant::now(),
            }),
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.cfg
    }

    /// Clears the queue and backoff and restarts the flush clock.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.backoff = Duration::ZERO;
        state.last_flush = Instant::now();
        self.record_state(&state);
    }

    /// Appends a message. Never blocks on upload and never rejects.
    pub fn add(&self, topic: &str, content: serde_json::Value) {
        let mut state = self.state.lock();
        state.queue.push(Message {
            topic: topic.to_string(),
            content,
            added_at: SystemTime::now(),
        });

        if let Some(health) = &self.health {
            health.messages_queued.inc();
        }
        self.record_state(&state);

        debug!(topic, "added message to the queue");
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    pub fn backoff(&self) -> Duration {
        self.state.lock().backoff
    }

    /// Copy of the queued messages, oldest first.
    pub fn snapshot(&self) -> Vec<Message> {
        self.state.lock().queue.clone()
    }

    /// Drops messages older than the TTL.
    pub fn expire(&self) {
        let mut state = self.state.lock();
        self.expire_locked(&mut state, SystemTime::now());
    }

    fn expire_locked(&self, state: &mut State, now: SystemTime) {
        let ttl = self.cfg.message_ttl;
        let before = state.queue.len();
        state.queue.retain(|m| {
            now.duration_since(m.added_at)
                .map_or(true, |age| age <= ttl)
        });

        let expired = before - state.queue.len();
        if expired > 0 {
            debug!(count = expired, "expired queued messages");
            if let Some(health) = &self.health {
                health.messages_expired.inc_by(expired as f64);
            }
            self.record_state(state);
        }
    }

    /// Uploads everything queued as one batch to the `upload` endpoint.
    ///
    /// Skipped while the queue is empty or the backoff since the last flush
    /// has not elapsed. On failure the batch is put back in front of anything
    /// added meanwhile and the backoff escalates.
    pub async fn flush<T: Transport>(&self, transport: &T) -> Result<()> {
        let now = Instant::now();

        let outgoing = {
            let mut state = self.state.lock();

            if !self.cfg.auto_profiling && state.last_flush + self.cfg.flush_interval > now {
                return Ok(());
            }

            if state.queue.is_empty() {
                return Ok(());
            }

            if state.last_flush + state.backoff > now {
                return Ok(());
            }

            self.expire_locked(&mut state, SystemTime::now());

            let outgoing = std::mem::take(&mut state.queue);
            state.last_flush = now;
            self.record_state(&state);
            outgoing
        };

        if outgoing.is_empty() {
            return Ok(());
        }

        let payload = UploadPayload {
            messages: outgoing
                .iter()
                .map(|m| UploadMessage {
                    topic: &m.topic,
                    content: &m.content,
                })
                .collect(),
        };
        let payload = serde_json::to_value(&payload).context("encoding upload payload")?;

        match transport.post("upload", payload).await {
            Ok(_) => {
                let mut state = self.state.lock();
                state.backoff = Duration::ZERO;
                self.record_state(&state);

                if let Some(health) = &self.health {
                    health.messages_uploaded.inc_by(outgoing.len() as f64);
                }
                debug!(count = outgoing.len(), "uploaded messages");

                Ok(())
            }
            Err(e) => {
                let mut state = self.state.lock();
                let live = std::mem::take(&mut state.queue);
                state.queue = outgoing;
                state.queue.extend(live);
                state.backoff = next_backoff(state.backoff);
                self.record_state(&state);

                if let Some(health) = &self.health {
                    health.upload_failures.inc();
                }
                warn!(
                    error = %e,
                    backoff_secs = state.backoff.as_secs(),
                    "uploading messages failed, backing off",
                );

                Err(e.context("uploading messages"))
            }
        }
    }

    fn record_state(&self, state: &State) {
        if let Some(health) = &self.health {
            health.queue_length.set(state.queue.len() as f64);
            health.upload_backoff_seconds.set(state.backoff.as_secs_f64());
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        INITIAL_BACKOFF
    } else {
        (current * 2).min(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use anyhow::bail;

    use super::*;

    /// Records payloads; optionally fails and injects a message mid-upload.
    struct MockTransport {
        queue: Option<Arc<MessageQueue>>,
        fail: AtomicBool,
        calls: AtomicUsize,
        payloads: Mutex<Vec<serde_json::Value>>,
    }

    impl MockTransport {
        fn new(queue: Option<Arc<MessageQueue>>, fail: bool) -> Self {
            Self {
                queue,
                fail: AtomicBool::new(fail),
                calls: AtomicUsize::new(0),
                payloads: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for MockTransport {
        async fn post(
            &self,
            endpoint: &str,
            payload: serde_json::Value,
        ) -> Result<serde_json::Value> {
            assert_eq!(endpoint, "upload");
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.payloads.lock().push(payload);

            if let Some(queue) = &self.queue {
                queue.add("m4", serde_json::json!({"m4": 4}));
            }

            if self.fail.load(Ordering::SeqCst) {
                bail!("connection refused");
            }
            Ok(serde_json::json!({}))
        }
    }

    #[test]
    fn test_expire_drops_old_messages() {
        let queue = MessageQueue::new(QueueConfig::default());
        queue.add("m1", serde_json::json!({"m1": 1}));
        queue.add("m2", serde_json::json!({"m2": 2}));

        {
            let mut state = queue.state.lock();
            state.queue[0].added_at -= Duration::from_secs(11 * 60);
            state.queue[1].added_at -= Duration::from_secs(60);
        }
        queue.expire();

        let remaining = queue.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].topic, "m2");
    }

    #[tokio::test]
    async fn test_flush_uploads_and_clears() {
        let queue = MessageQueue::new(QueueConfig::default());
        queue.add("m1", serde_json::json!({"m1": 1}));
        queue.add("m2", serde_json::json!({"m2": 2}));
        let transport = MockTransport::new(None, false);

        queue.flush(&transport).await.expect("flush");

        assert!(queue.is_empty());
        assert_eq!(queue.backoff(), Duration::ZERO);
        let payloads = transport.payloads.lock();
        assert_eq!(
            payloads[0],
            serde_json::json!({"messages": [
                {"topic": "m1", "content": {"m1": 1}},
                {"topic": "m2", "content": {"m2": 2}},
            ]})
        );
    }

    #[tokio::test]
    async fn test_flush_empty_is_noop() {
        let queue = MessageQueue::new(QueueConfig::default());
        let transport = MockTransport::new(None, false);

        queue.flush(&transport).await.expect("flush");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_restores_order_and_backs_off() {
        let queue = Arc::new(MessageQueue::new(QueueConfig::default()));
        queue.add("m1", serde_json::json!({"m1": 1}));
        queue.add("m2", serde_json::json!({"m2": 2}));
        queue.add("m3", serde_json::json!({"m3": 3}));
        let transport = MockTransport::new(Some(Arc::clone(&queue)), true);

        let err = queue.flush(&transport).await.expect_err("flush fails");
        assert!(err.to_string().contains("uploading messages"));

        let topics: Vec<String> = queue.snapshot().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["m1", "m2", "m3", "m4"]);
        assert_eq!(queue.backoff(), Duration::from_secs(10));

        // Inside the backoff window nothing is sent.
        queue.flush(&transport).await.expect("skipped flush");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_escalates_and_resets() {
        let queue = MessageQueue::new(QueueConfig::default());
        queue.add("m1", serde_json::json!({}));
        let transport = MockTransport::new(None, true);

        let mut seen = Vec::new();
        for _ in 0..5 {
            let backoff = queue.backoff();
            tokio::time::advance(backoff + Duration::from_secs(1)).await;
            let _ = queue.flush(&transport).await;
            seen.push(queue.backoff().as_secs());
        }
        assert_eq!(seen, vec![10, 20, 40, 60, 60]);

        transport.fail.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(61)).await;
        queue.flush(&transport).await.expect("flush");
        assert_eq!(queue.backoff(), Duration::ZERO);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_flush_drops_expired_before_upload() {
        let queue = MessageQueue::new(QueueConfig::default());
        queue.add("old", serde_json::json!({}));
        queue.add("new", serde_json::json!({}));
        queue.state.lock().queue[0].added_at -= Duration::from_secs(11 * 60);
        let transport = MockTransport::new(None, false);

        queue.flush(&transport).await.expect("flush");

        let payloads = transport.payloads.lock();
        let messages = payloads[0]["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["topic"], "new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_mode_rate_limits_flush() {
        let queue = MessageQueue::new(QueueConfig {
            auto_profiling: false,
            ..QueueConfig::default()
        });
        queue.add("m1", serde_json::json!({}));
        let transport = MockTransport::new(None, false);

        queue.flush(&transport).await.expect("flush");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        queue.flush(&transport).await.expect("flush");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_ignores_wall_clock() {
        let queue = MessageQueue::new(QueueConfig::default());
        queue.add("m1", serde_json::json!({}));
        let transport = MockTransport::new(None, true);

        let _ = queue.flush(&transport).await;
        assert_eq!(queue.backoff(), Duration::from_secs(10));

        // Message ages follow the wall clock, the backoff window does not.
        queue.state.lock().queue[0].added_at -= Duration::from_secs(60);
        queue.flush(&transport).await.expect("inside backoff");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = queue.flush(&transport).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_next_backoff() {
        assert_eq!(next_backoff(Duration::ZERO), Duration::from_secs(10));
        assert_eq!(next_backoff(Duration::from_secs(40)), Duration::from_secs(60));
        assert_eq!(next_backoff(Duration::from_secs(60)), Duration::from_secs(60));
    }

    #[test]
    fn test_health_tracks_queue() {
        let health = Arc::new(HealthMetrics::new().expect("health"));
        let queue = MessageQueue::new(QueueConfig::default()).with_health(Arc::clone(&health));
        queue.add("m1", serde_json::json!({}));
        queue.add("m2", serde_json::json!({}));

        assert_eq!(health.messages_queued.get(), 2.0);
        assert_eq!(health.queue_length.get(), 2.0);
    }
}
