//! Progress throttler: coalesces high-frequency progress events into at
//! most one status patch per window per job.
//!
//! The enqueue side (`schedule`) never blocks on network I/O: an immediate
//! send is handed off to a background task, and a coalesced send is armed on
//! a timer. `flush` is the one suspension point callers wait on, used right
//! before a processor issues its terminal patch so ordering holds: every
//! throttled send happens-before the terminal `succeeded|failed` patch.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::job::Progress;
use crate::status::StatusReporter;

const LOG_RING_CAPACITY: usize = 50;
const LOG_ATTACHMENT_CAPACITY: usize = 20;

struct ThrottleState {
    last_sent_at: Option<Instant>,
    pending: Option<Progress>,
    log_ring: VecDeque<String>,
    timer_armed: bool,
}

impl ThrottleState {
    fn new() -> Self {
        Self {
            last_sent_at: None,
            pending: None,
            log_ring: VecDeque::with_capacity(LOG_RING_CAPACITY),
            timer_armed: false,
        }
    }

    fn push_log(&mut self, message: Option<&str>) {
        if let Some(message) = message {
            if self.log_ring.len() == LOG_RING_CAPACITY {
                self.log_ring.pop_front();
            }
            self.log_ring.push_back(message.to_string());
        }
    }

    fn attachment(&self) -> Vec<String> {
        let skip = self.log_ring.len().saturating_sub(LOG_ATTACHMENT_CAPACITY);
        self.log_ring.iter().skip(skip).cloned().collect()
    }
}

#[derive(Clone)]
pub struct ProgressThrottler {
    state: Arc<Mutex<ThrottleState>>,
    status: StatusReporter,
    job_id: String,
    window: Duration,
}

impl ProgressThrottler {
    pub fn new(status: StatusReporter, job_id: impl Into<String>, window: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ThrottleState::new())),
            status,
            job_id: job_id.into(),
            window,
        }
    }

    /// Enqueue a progress event. Never awaits network I/O itself.
    pub async fn schedule(&self, mut progress: Progress) {
        let mut state = self.state.lock().await;
        state.push_log(progress.message.as_deref());

        let now = Instant::now();
        let elapsed = state.last_sent_at.map(|t| now.duration_since(t));

        if elapsed.is_none() || elapsed.unwrap() >= self.window {
            state.last_sent_at = Some(now);
            state.pending = None;
            state.timer_armed = false;
            progress.logs = Some(state.attachment());
            drop(state);

            let status = self.status.clone();
            let job_id = self.job_id.clone();
            tokio::spawn(async move {
                status.patch_progress(&job_id, progress).await;
            });
            return;
        }

        state.pending = Some(progress);

        if !state.timer_armed {
            state.timer_armed = true;
            let remaining = self.window - elapsed.unwrap();
            let state_handle = self.state.clone();
            let status = self.status.clone();
            let job_id = self.job_id.clone();

            tokio::spawn(async move {
                tokio::time::sleep(remaining).await;

                let mut state = state_handle.lock().await;
                state.timer_armed = false;
                if let Some(mut pending) = state.pending.take() {
                    state.last_sent_at = Some(Instant::now());
                    pending.logs = Some(state.attachment());
                    drop(state);
                    status.patch_progress(&job_id, pending).await;
                }
            });
        }
    }

    /// Force any pending coalesced event to send now, awaiting completion.
    /// Call before the processor's own terminal status patch.
    pub async fn flush(&self) {
        let mut state = self.state.lock().await;
        state.timer_armed = false;
        if let Some(mut pending) = state.pending.take() {
            state.last_sent_at = Some(Instant::now());
            pending.logs = Some(state.attachment());
            drop(state);
            self.status.patch_progress(&self.job_id, pending).await;
        }
    }
}
