//! Stream Registry (C4): a process-wide map from message id to a live,
//! typed event channel consumed by HTTP SSE handlers.
//!
//! Grounded in the console manager's `ensure_session`/broadcast pattern:
//! a keyed map of cheaply-cloneable handles, each owning its own broadcast
//! channel and a small buffer so a consumer that attaches late still sees
//! everything that matters.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

/// Events emitted over a message's SSE stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum StreamEvent {
    Text(String),
    /// Base64-encoded image bytes. `is_done` marks the final chunk, which is
    /// only ever emitted after the bytes have been durably persisted.
    Image { data: String, is_done: bool },
    Audio { data: String, is_done: bool },
    Error { code: String, message: String },
    Done,
}

impl StreamEvent {
    const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Error { .. } | Self::Done | Self::Image { is_done: true, .. } | Self::Audio { is_done: true, .. }
        )
    }
}

/// How many buffered events a handle retains for consumers that haven't
/// attached yet. Text deltas are evicted first when this is exceeded;
/// terminal events are never evicted.
const BUFFER_CAPACITY: usize = 256;

const BROADCAST_CAPACITY: usize = 256;

type PersistFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
/// Called synchronously (awaited in-line) with the final bytes before the
/// corresponding done event reaches any consumer.
pub type PersistCallback = Arc<dyn Fn(Vec<u8>) -> PersistFuture + Send + Sync>;

pub struct StreamHandle {
    message_id: Uuid,
    tx: broadcast::Sender<StreamEvent>,
    buffer: Mutex<VecDeque<StreamEvent>>,
    image_persist: Option<PersistCallback>,
    audio_persist: Option<PersistCallback>,
    closed: AtomicBool,
}

impl StreamHandle {
    fn new(
        message_id: Uuid,
        image_persist: Option<PersistCallback>,
        audio_persist: Option<PersistCallback>,
    ) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            message_id,
            tx,
            buffer: Mutex::new(VecDeque::with_capacity(BUFFER_CAPACITY)),
            image_persist,
            audio_persist,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Snapshot buffered events, then subscribe, under the same lock so no
    /// event sent between the two is missed or duplicated.
    pub async fn attach(&self) -> (Vec<StreamEvent>, broadcast::Receiver<StreamEvent>) {
        let buffer = self.buffer.lock().await;
        let snapshot: Vec<StreamEvent> = buffer.iter().cloned().collect();
        let rx = self.tx.subscribe();
        drop(buffer);
        (snapshot, rx)
    }

    async fn publish(&self, event: StreamEvent) {
        let mut buffer = self.buffer.lock().await;
        if buffer.len() >= BUFFER_CAPACITY {
            if let Some(idx) = buffer.iter().position(|e| !e.is_terminal()) {
                buffer.remove(idx);
            } else {
                buffer.pop_front();
            }
        }
        buffer.push_back(event.clone());
        drop(buffer);
        // No receivers is not an error: consumers may attach later and will
        // replay from the buffer.
        let _ = self.tx.send(event);
    }

    pub async fn send_text(&self, delta: impl Into<String>) {
        self.publish(StreamEvent::Text(delta.into())).await;
    }

    /// `is_done=true` invokes the image-persist callback and awaits it
    /// before the done-flagged event reaches any consumer, satisfying the
    /// image-persistence invariant.
    pub async fn send_image(&self, bytes: Vec<u8>, is_done: bool) -> anyhow::Result<()> {
        if is_done {
            if let Some(cb) = &self.image_persist {
                cb(bytes.clone()).await?;
            }
        }
        let data = BASE64.encode(&bytes);
        self.publish(StreamEvent::Image { data, is_done }).await;
        Ok(())
    }

    pub async fn send_audio(&self, bytes: Vec<u8>, is_done: bool) -> anyhow::Result<()> {
        if is_done {
            if let Some(cb) = &self.audio_persist {
                cb(bytes.clone()).await?;
            }
        }
        let data = BASE64.encode(&bytes);
        self.publish(StreamEvent::Audio { data, is_done }).await;
        Ok(())
    }

    pub async fn send_error(&self, code: impl Into<String>, message: impl Into<String>) {
        self.publish(StreamEvent::Error { code: code.into(), message: message.into() }).await;
    }

    pub async fn send_done(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.publish(StreamEvent::Done).await;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// Process-wide registry of live stream handles, keyed by message id.
#[derive(Default)]
pub struct StreamRegistry {
    handles: DashMap<Uuid, Arc<StreamHandle>>,
}

impl StreamRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        message_id: Uuid,
        image_persist: Option<PersistCallback>,
        audio_persist: Option<PersistCallback>,
    ) -> Arc<StreamHandle> {
        let handle = StreamHandle::new(message_id, image_persist, audio_persist);
        self.handles.insert(message_id, Arc::clone(&handle));
        handle
    }

    #[must_use]
    pub fn get(&self, message_id: Uuid) -> Option<Arc<StreamHandle>> {
        self.handles.get(&message_id).map(|e| Arc::clone(e.value()))
    }

    pub fn remove(&self, message_id: Uuid) {
        self.handles.remove(&message_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_replays_buffer_then_sees_live_events() {
        let handle = StreamHandle::new(Uuid::new_v4(), None, None);
        handle.send_text("hello").await;
        handle.send_text("world").await;

        let (snapshot, mut rx) = handle.attach().await;
        assert_eq!(snapshot.len(), 2);

        handle.send_done().await;
        let live = rx.recv().await.unwrap();
        assert!(matches!(live, StreamEvent::Done));
    }

    #[tokio::test]
    async fn image_persist_runs_before_done_flag_is_observable() {
        use std::sync::atomic::AtomicBool;

        let persisted = Arc::new(AtomicBool::new(false));
        let persisted_clone = Arc::clone(&persisted);
        let cb: PersistCallback = Arc::new(move |_bytes| {
            let persisted = Arc::clone(&persisted_clone);
            Box::pin(async move {
                persisted.store(true, Ordering::SeqCst);
                Ok(())
            })
        });

        let handle = StreamHandle::new(Uuid::new_v4(), Some(cb), None);
        handle.send_image(vec![1, 2, 3], true).await.unwrap();
        assert!(persisted.load(Ordering::SeqCst));

        let (snapshot, _rx) = handle.attach().await;
        assert!(matches!(snapshot.last(), Some(StreamEvent::Image { is_done: true, .. })));
    }

    #[tokio::test]
    async fn terminal_events_are_never_evicted_by_overflow() {
        let handle = StreamHandle::new(Uuid::new_v4(), None, None);
        handle.send_error("ai_error", "boom").await;
        for i in 0..(BUFFER_CAPACITY * 2) {
            handle.send_text(format!("delta-{i}")).await;
        }
        let (snapshot, _rx) = handle.attach().await;
        assert!(snapshot.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
    }

    #[test]
    fn registry_get_after_remove_is_none() {
        let registry = StreamRegistry::new();
        let id = Uuid::new_v4();
        registry.create(id, None, None);
        assert!(registry.get(id).is_some());
        registry.remove(id);
        assert!(registry.get(id).is_none());
    }
}
