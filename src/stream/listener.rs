//! Delivery of incoming metadata frames.
//!
//! Each incoming direction has one listener task. It owns the registered
//! [`HeaderListener`] (if any) and a backlog of frames that arrived before
//! registration. Registration travels through the same channel as frames,
//! so a late listener sees the backlog first and in arrival order.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use super::state::{ResetCode, ResetReason, StreamShared};
use crate::error::{DuplexError, Result};
use crate::metadata::{Metadata, MetadataFrame};

/// Receives metadata frames for one incoming direction.
///
/// Callbacks run on the stream's listener task, one at a time and in
/// arrival order. They should not block.
pub trait HeaderListener: Send + Sync + 'static {
    /// A metadata frame arrived.
    fn on_headers(&self, frame: MetadataFrame);

    /// The stream was reset. Called at most once, after every frame that
    /// preceded the reset.
    fn on_reset(&self, _reason: &ResetReason) {}
}

impl<F> HeaderListener for F
where
    F: Fn(MetadataFrame) + Send + Sync + 'static,
{
    fn on_headers(&self, frame: MetadataFrame) {
        self(frame)
    }
}

/// A listener that records everything it receives.
#[derive(Default)]
pub struct RecordingListener {
    inner: Mutex<Recorded>,
    notify: Notify,
}

#[derive(Default)]
struct Recorded {
    frames: Vec<MetadataFrame>,
    reset: Option<ResetReason>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Frames received so far.
    pub fn frames(&self) -> Vec<MetadataFrame> {
        self.lock().frames.clone()
    }

    /// Remove and return the frames received so far.
    pub fn take_all(&self) -> Vec<MetadataFrame> {
        std::mem::take(&mut self.lock().frames)
    }

    /// Just the metadata of each frame received so far.
    pub fn metadata(&self) -> Vec<Metadata> {
        self.lock()
            .frames
            .iter()
            .map(|f| f.metadata.clone())
            .collect()
    }

    /// The reset reported to this listener, if any.
    pub fn reset_reason(&self) -> Option<ResetReason> {
        self.lock().reset.clone()
    }

    /// Wait until at least `count` frames have been recorded.
    pub async fn wait_for(&self, count: usize) {
        self.wait_until(|r| r.frames.len() >= count).await
    }

    /// Wait until a reset has been reported.
    pub async fn wait_for_reset(&self) -> ResetReason {
        self.wait_until(|r| r.reset.is_some()).await;
        self.reset_reason()
            .unwrap_or_else(|| ResetReason::new(ResetCode::InternalError, ""))
    }

    async fn wait_until(&self, done: impl Fn(&Recorded) -> bool) {
        loop {
            let notified = self.notify.notified();
            if done(&self.lock()) {
                return;
            }
            notified.await;
        }
    }
}

impl HeaderListener for RecordingListener {
    fn on_headers(&self, frame: MetadataFrame) {
        self.lock().frames.push(frame);
        self.notify.notify_waiters();
    }

    fn on_reset(&self, reason: &ResetReason) {
        self.lock().reset = Some(reason.clone());
        self.notify.notify_waiters();
    }
}

pub(crate) enum ListenerEvent {
    Frame(MetadataFrame),
    Register(Arc<dyn HeaderListener>),
}

/// Owned by the listener task.
struct ListenerState {
    stream_id: u32,
    listener: Option<Arc<dyn HeaderListener>>,
    backlog: VecDeque<MetadataFrame>,
    reset: Option<ResetReason>,
    reset_delivered: bool,
}

impl ListenerState {
    fn new(stream_id: u32) -> Self {
        Self {
            stream_id,
            listener: None,
            backlog: VecDeque::new(),
            reset: None,
            reset_delivered: false,
        }
    }

    /// Hand a frame to the listener, or buffer it.
    fn deliver(&mut self, frame: MetadataFrame) -> Result<()> {
        match &self.listener {
            Some(listener) => {
                invoke(self.stream_id, || listener.on_headers(frame));
                Ok(())
            }
            None => {
                self.backlog.push_back(frame);
                Err(DuplexError::ListenerNotRegistered)
            }
        }
    }

    fn register(&mut self, listener: Arc<dyn HeaderListener>) {
        for frame in self.backlog.drain(..) {
            invoke(self.stream_id, || listener.on_headers(frame));
        }
        self.listener = Some(listener);
        self.deliver_reset();
    }

    fn on_reset(&mut self, reason: ResetReason) {
        self.reset = Some(reason);
        self.deliver_reset();
    }

    fn deliver_reset(&mut self) {
        if self.reset_delivered {
            return;
        }
        if let (Some(listener), Some(reason)) = (&self.listener, &self.reset) {
            invoke(self.stream_id, || listener.on_reset(reason));
            self.reset_delivered = true;
        }
    }
}

/// Run a listener callback; a panic is logged and otherwise ignored.
fn invoke(stream_id: u32, callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        tracing::error!("Header listener panicked on stream {}", stream_id);
    }
}

pub(crate) fn spawn_listener_task(
    shared: Arc<StreamShared>,
    mut rx: mpsc::UnboundedReceiver<ListenerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state = ListenerState::new(shared.id());
        let mut reset_rx = shared.subscribe();
        if let Some(reason) = reset_rx.borrow_and_update().clone() {
            state.on_reset(reason);
        }

        loop {
            tokio::select! {
                biased;

                event = rx.recv() => match event {
                    Some(ListenerEvent::Frame(frame)) => {
                        if let Err(e) = state.deliver(frame) {
                            tracing::trace!("Stream {}: {}, buffering", shared.id(), e);
                        }
                    }
                    Some(ListenerEvent::Register(listener)) => state.register(listener),
                    None => {
                        // The dispatcher drops its sender right after a reset.
                        if state.reset.is_none() {
                            if let Some(reason) = shared.reset_reason() {
                                state.on_reset(reason);
                            }
                        }
                        break;
                    }
                },

                changed = reset_rx.changed(), if state.reset.is_none() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Some(reason) = reset_rx.borrow_and_update().clone() {
                        state.on_reset(reason);
                    }
                }
            }
        }
    })
}

/// Registration side of a listener task.
pub(crate) struct ListenerHandle {
    tx: mpsc::UnboundedSender<ListenerEvent>,
    registered: bool,
}

impl ListenerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ListenerEvent>) -> Self {
        Self {
            tx,
            registered: false,
        }
    }

    pub(crate) fn register(&mut self, listener: Arc<dyn HeaderListener>) -> Result<()> {
        if self.registered {
            return Err(DuplexError::ListenerAlreadyRegistered);
        }
        self.registered = true;
        // The task only stops once every sender is gone, and we hold one.
        let _ = self.tx.send(ListenerEvent::Register(listener));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(offset: u64, name: &str) -> MetadataFrame {
        MetadataFrame {
            stream_id: 1,
            offset,
            metadata: Metadata::of(&[(name, "v")]),
        }
    }

    #[test]
    fn test_backlog_drained_in_order_on_register() {
        let mut state = ListenerState::new(1);
        assert!(matches!(
            state.deliver(frame(0, "a")),
            Err(DuplexError::ListenerNotRegistered)
        ));
        assert!(state.deliver(frame(4, "b")).is_err());

        let recorder = RecordingListener::new();
        state.register(recorder.clone());
        state.deliver(frame(9, "c")).unwrap();

        let offsets: Vec<_> = recorder.frames().iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 4, 9]);
    }

    #[test]
    fn test_reset_held_until_register() {
        let mut state = ListenerState::new(1);
        state.deliver(frame(0, "a")).unwrap_err();
        state.on_reset(ResetReason::new(ResetCode::Cancel, ""));

        let recorder = RecordingListener::new();
        state.register(recorder.clone());
        assert_eq!(recorder.frames().len(), 1);
        assert_eq!(recorder.reset_reason().unwrap().code, ResetCode::Cancel);
    }

    #[test]
    fn test_panicking_listener_does_not_poison_delivery() {
        let mut state = ListenerState::new(1);
        let l: Arc<dyn HeaderListener> = Arc::new(|_frame: MetadataFrame| panic!("listener bug"));
        state.register(l);
        state.deliver(frame(0, "a")).unwrap();
        state.deliver(frame(0, "b")).unwrap();
    }

    #[test]
    fn test_double_register_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut handle = ListenerHandle::new(tx);
        handle.register(RecordingListener::new()).unwrap();
        assert!(matches!(
            handle.register(RecordingListener::new()),
            Err(DuplexError::ListenerAlreadyRegistered)
        ));
    }

    #[tokio::test]
    async fn test_task_delivers_frames_then_reset() {
        let shared = StreamShared::new(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = spawn_listener_task(shared.clone(), rx);

        tx.send(ListenerEvent::Frame(frame(0, "early"))).unwrap();
        let recorder = RecordingListener::new();
        let mut handle = ListenerHandle::new(tx.clone());
        handle.register(recorder.clone()).unwrap();
        tx.send(ListenerEvent::Frame(frame(3, "late"))).unwrap();

        recorder.wait_for(2).await;
        shared.reset(ResetReason::new(ResetCode::Cancel, "bye"));

        let reason = tokio::time::timeout(Duration::from_secs(1), recorder.wait_for_reset())
            .await
            .unwrap();
        assert_eq!(reason.message, "bye");

        let names: Vec<_> = recorder
            .metadata()
            .iter()
            .map(|md| md.iter().next().unwrap().0.to_string())
            .collect();
        assert_eq!(names, vec!["early", "late"]);

        drop(tx);
        drop(handle);
        task.await.unwrap();
    }
}
