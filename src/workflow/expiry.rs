//! Expiry monitor: forced restart after the verification token is
//! reported invalid.
//!
//! On an invalid token every store is purged at once and a countdown
//! starts. When it elapses (or the user asks to go now) the user is sent
//! back to the first step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::events::{FlowEvent, NoticeLevel};

use super::engine::{WorkflowEngine, lock};
use super::schedule::ScheduledTask;

/// Token validity as reported by the validation collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenValidity {
    pub is_valid: bool,
    #[serde(default)]
    pub message: Option<String>,
}

pub struct ExpiryMonitor {
    engine: Arc<WorkflowEngine>,
    expired: AtomicBool,
    progress: watch::Sender<f32>,
    countdown: Mutex<Option<ScheduledTask>>,
}

impl ExpiryMonitor {
    pub fn new(engine: Arc<WorkflowEngine>) -> Arc<Self> {
        let (progress, _rx) = watch::channel(0.0);
        Arc::new(Self {
            engine,
            expired: AtomicBool::new(false),
            progress,
            countdown: Mutex::new(None),
        })
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    /// Countdown progress in `[0, 1]`.
    pub fn subscribe_progress(&self) -> watch::Receiver<f32> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> f32 {
        *self.progress.borrow()
    }

    /// Feed a validity report. Returns `true` when it started a countdown.
    pub async fn handle_token(self: &Arc<Self>, validity: &TokenValidity) -> bool {
        if validity.is_valid {
            return false;
        }
        if self.expired.swap(true, Ordering::AcqRel) {
            debug!("Token already expired, countdown running");
            return false;
        }

        let message = validity
            .message
            .clone()
            .unwrap_or_else(|| "Your verification link has expired.".to_string());
        warn!(reason = %message, "Verification token invalid, restarting flow");
        self.engine.events().notice(NoticeLevel::Error, message);

        self.engine.reset_all().await;
        self.progress.send_replace(0.0);

        let duration = self.engine.config().expiry_countdown;
        let tick = self.engine.config().countdown_tick;
        let weak = Arc::downgrade(self);
        let task = ScheduledTask::spawn(async move {
            let started = Instant::now();
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    return;
                };
                let elapsed = started.elapsed();
                if elapsed >= duration {
                    monitor.finish().await;
                    return;
                }
                monitor.publish(
                    elapsed.as_secs_f32() / duration.as_secs_f32(),
                    duration - elapsed,
                );
            }
        });
        *lock(&self.countdown) = Some(task);
        info!(secs = duration.as_secs(), "Expiry countdown started");
        true
    }

    fn publish(&self, progress: f32, remaining: std::time::Duration) {
        let progress = progress.clamp(0.0, 1.0);
        self.progress.send_replace(progress);
        self.engine.events().emit(FlowEvent::Countdown {
            progress,
            remaining_ms: remaining.as_millis() as u64,
        });
    }

    /// Skip the rest of the countdown. No-op unless expired.
    pub async fn redirect_now(&self) -> Option<String> {
        if !self.is_expired() {
            return None;
        }
        self.cancel();
        Some(self.finish().await)
    }

    /// Stop the countdown without redirecting.
    pub fn cancel(&self) {
        if let Some(task) = lock(&self.countdown).take() {
            task.cancel();
            debug!("Expiry countdown cancelled");
        }
    }

    async fn finish(&self) -> String {
        self.publish(1.0, std::time::Duration::ZERO);
        let url = self.engine.force_to_first().await;
        self.expired.store(false, Ordering::Release);
        info!(url = %url, "Expiry countdown finished");
        url
    }
}
