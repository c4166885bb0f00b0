use std::{
    collections::HashMap,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// How a supervised generation ended, as seen by an abort request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No generation is registered for the conversation, or it is still running.
    None,
    /// A client aborted the generation.
    Cancelled,
    /// The generation exceeded its time cap.
    TimedOut,
    /// The generation finished on its own.
    Completed,
}

const STATE_ACTIVE: u8 = 0;
const STATE_CANCELLED: u8 = 1;
const STATE_TIMEOUT: u8 = 2;
const STATE_COMPLETED: u8 = 3;

/// Cancellation handle for one running generation.
#[derive(Debug)]
pub struct GenerationSession {
    token: CancellationToken,
    /// Cancelled on any transition out of active; ends the timeout timer.
    stopped: CancellationToken,
    timer: OnceLock<JoinHandle<()>>,
    state: AtomicU8,
    started_at: Instant,
}

impl GenerationSession {
    fn new(max_duration: Option<Duration>) -> Arc<Self> {
        let session = Arc::new(Self {
            token: CancellationToken::new(),
            stopped: CancellationToken::new(),
            timer: OnceLock::new(),
            state: AtomicU8::new(STATE_ACTIVE),
            started_at: Instant::now(),
        });

        if let Some(duration) = max_duration.filter(|d| !d.is_zero()) {
            let weak = Arc::downgrade(&session);
            let stopped = session.stopped.clone();
            let timer = tokio::spawn(async move {
                tokio::select! {
                    () = stopped.cancelled() => {}
                    () = tokio::time::sleep(duration) => {
                        if let Some(session) = weak.upgrade() {
                            session.mark_timeout();
                        }
                    }
                }
            });
            let _ = session.timer.set(timer);
        }

        session
    }

    /// Token the streaming loop polls between deltas.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Moves an active session to cancelled. Returns `false` if it had already stopped.
    pub fn mark_cancelled(&self) -> bool {
        if self.transition(STATE_CANCELLED) {
            self.token.cancel();
            counter!("confab_generation_cancels_total").increment(1);
            let elapsed_ms = self.started_at.elapsed().as_secs_f64() * 1000.0;
            histogram!("confab_generation_cancel_latency_ms").record(elapsed_ms);
            true
        } else {
            false
        }
    }

    /// Moves an active session to timed out. Returns `false` if it had already stopped.
    pub fn mark_timeout(&self) -> bool {
        if self.transition(STATE_TIMEOUT) {
            self.token.cancel();
            counter!("confab_generation_timeouts_total").increment(1);
            true
        } else {
            false
        }
    }

    /// Records normal completion; a no-op once cancelled or timed out.
    pub fn mark_completed(&self) {
        self.transition(STATE_COMPLETED);
    }

    fn transition(&self, to: u8) -> bool {
        let moved = self
            .state
            .compare_exchange(STATE_ACTIVE, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if moved {
            self.stopped.cancel();
        }
        moved
    }

    #[cfg(test)]
    fn timer_finished(&self) -> bool {
        self.timer.get().is_none_or(JoinHandle::is_finished)
    }

    /// Current stop reason.
    #[must_use]
    pub fn stop_reason(&self) -> StopReason {
        match self.state.load(Ordering::SeqCst) {
            STATE_CANCELLED => StopReason::Cancelled,
            STATE_TIMEOUT => StopReason::TimedOut,
            STATE_COMPLETED => StopReason::Completed,
            _ => StopReason::None,
        }
    }
}

/// Registry of running generations keyed by conversation id.
///
/// Aborts look the generation up here instead of scanning runtime tasks.
#[derive(Debug)]
pub struct GenerationSupervisor {
    sessions: RwLock<HashMap<String, Arc<GenerationSession>>>,
    max_duration: Option<Duration>,
}

impl GenerationSupervisor {
    /// Creates a supervisor whose sessions time out after `max_duration`, if set.
    #[must_use]
    pub fn new(max_duration: Option<Duration>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_duration,
        }
    }

    /// Creates an unregistered session.
    #[must_use]
    pub fn create_session(&self) -> Arc<GenerationSession> {
        GenerationSession::new(self.max_duration)
    }

    /// Makes `session` the abort target for `conversation_id`.
    pub async fn register(&self, conversation_id: &str, session: Arc<GenerationSession>) {
        let mut guard = self.sessions.write().await;
        guard.insert(conversation_id.to_string(), session);
    }

    /// Removes `session` if it is still the one registered for `conversation_id`.
    pub async fn unregister(&self, conversation_id: &str, session: &Arc<GenerationSession>) {
        let mut guard = self.sessions.write().await;
        if guard
            .get(conversation_id)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            guard.remove(conversation_id);
        }
    }

    /// Returns whether a generation is registered for `conversation_id`.
    pub async fn is_running(&self, conversation_id: &str) -> bool {
        self.sessions.read().await.contains_key(conversation_id)
    }

    /// Cancels the generation of `conversation_id`.
    ///
    /// Returns [`StopReason::None`] when nothing is registered; repeated calls
    /// report the reason the session already stopped with.
    pub async fn cancel(&self, conversation_id: &str) -> StopReason {
        let session = {
            let guard = self.sessions.read().await;
            guard.get(conversation_id).cloned()
        };

        session.map_or(StopReason::None, |session| {
            if session.mark_cancelled() {
                StopReason::Cancelled
            } else {
                session.stop_reason()
            }
        })
    }
}
