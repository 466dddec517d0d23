//! Heartbeat / on-demand activity flags.
//!
//! Two flags share one lock: `heartbeat` while a background cycle runs (or
//! cools down) and `on_demand` while a user request runs (or cools down).
//! Ending an activity starts an abortable cooldown timer; when a timer
//! expires and both flags are false the idle trigger fires, at most once per
//! idle transition. A one-shot startup timer fires the trigger if nothing
//! has been active since boot.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Callback fired on the transition to fully idle.
pub type IdleTrigger = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct ActivityStatus {
    pub heartbeat: bool,
    pub on_demand: bool,
    pub heartbeat_session_id: Option<String>,
    pub heartbeat_cooldown_seconds: u64,
    pub on_demand_cooldown_seconds: u64,
}

#[derive(Default)]
struct Flags {
    heartbeat: bool,
    on_demand: bool,
    heartbeat_timer: Option<JoinHandle<()>>,
    on_demand_timer: Option<JoinHandle<()>>,
    /// True once any activity has started; gates the startup trigger.
    ever_active: bool,
    heartbeat_session_id: Option<String>,
}

pub struct ActivityCoordinator {
    heartbeat_cooldown: Duration,
    on_demand_cooldown: Duration,
    flags: Mutex<Flags>,
    trigger: std::sync::Mutex<Option<IdleTrigger>>,
}

impl ActivityCoordinator {
    pub fn new(heartbeat_cooldown: Duration, on_demand_cooldown: Duration) -> Arc<Self> {
        Arc::new(Self {
            heartbeat_cooldown,
            on_demand_cooldown,
            flags: Mutex::new(Flags::default()),
            trigger: std::sync::Mutex::new(None),
        })
    }

    pub fn set_trigger(&self, trigger: IdleTrigger) {
        *self.trigger.lock().unwrap_or_else(|e| e.into_inner()) = Some(trigger);
    }

    fn fire_trigger(&self) {
        let trigger = self
            .trigger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(trigger) = trigger {
            // Spawned, not awaited: the trigger runs a whole agent cycle and
            // must not hold the flag lock.
            tokio::spawn(trigger());
        }
    }

    pub async fn start_heartbeat(&self) {
        let mut flags = self.flags.lock().await;
        if let Some(timer) = flags.heartbeat_timer.take() {
            timer.abort();
        }
        flags.heartbeat = true;
        flags.ever_active = true;
        debug!("heartbeat flag set");
    }

    pub async fn end_heartbeat(self: &Arc<Self>) {
        let mut flags = self.flags.lock().await;
        if let Some(timer) = flags.heartbeat_timer.take() {
            timer.abort();
        }
        let this = Arc::clone(self);
        let cooldown = self.heartbeat_cooldown;
        flags.heartbeat_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            this.heartbeat_cooldown_expired().await;
        }));
        debug!("heartbeat cooldown started ({:?})", self.heartbeat_cooldown);
    }

    async fn heartbeat_cooldown_expired(&self) {
        let mut flags = self.flags.lock().await;
        let was_active = flags.heartbeat;
        flags.heartbeat = false;
        flags.heartbeat_timer = None;
        debug!("heartbeat flag cleared");
        if was_active && !flags.on_demand {
            info!("both flags idle after heartbeat cooldown, firing trigger");
            self.fire_trigger();
        }
    }

    pub async fn start_on_demand(&self) {
        let mut flags = self.flags.lock().await;
        if let Some(timer) = flags.on_demand_timer.take() {
            timer.abort();
        }
        flags.on_demand = true;
        flags.ever_active = true;
        debug!("on_demand flag set");
    }

    pub async fn end_on_demand(self: &Arc<Self>) {
        let mut flags = self.flags.lock().await;
        if let Some(timer) = flags.on_demand_timer.take() {
            timer.abort();
        }
        let this = Arc::clone(self);
        let cooldown = self.on_demand_cooldown;
        flags.on_demand_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            this.on_demand_cooldown_expired().await;
        }));
        debug!("on_demand cooldown started ({:?})", self.on_demand_cooldown);
    }

    async fn on_demand_cooldown_expired(&self) {
        let mut flags = self.flags.lock().await;
        let was_active = flags.on_demand;
        flags.on_demand = false;
        flags.on_demand_timer = None;
        debug!("on_demand flag cleared");
        if was_active && !flags.heartbeat {
            info!("both flags idle after on_demand cooldown, firing trigger");
            self.fire_trigger();
        }
    }

    /// Fire the trigger after `delay` unless any activity happened first.
    pub fn schedule_initial_trigger(self: &Arc<Self>, delay: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let flags = this.flags.lock().await;
            if !flags.ever_active && !flags.heartbeat && !flags.on_demand {
                info!("no activity since startup, firing initial trigger");
                this.fire_trigger();
            } else {
                debug!("activity seen since startup, skipping initial trigger");
            }
        })
    }

    pub async fn set_heartbeat_session_id(&self, session_id: String) {
        self.flags.lock().await.heartbeat_session_id = Some(session_id);
    }

    pub async fn status(&self) -> ActivityStatus {
        let flags = self.flags.lock().await;
        ActivityStatus {
            heartbeat: flags.heartbeat,
            on_demand: flags.on_demand,
            heartbeat_session_id: flags.heartbeat_session_id.clone(),
            heartbeat_cooldown_seconds: self.heartbeat_cooldown.as_secs(),
            on_demand_cooldown_seconds: self.on_demand_cooldown.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_trigger() -> (IdleTrigger, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_in = Arc::clone(&count);
        let trigger: IdleTrigger = Arc::new(move || {
            count_in.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        });
        (trigger, count)
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_waits_for_the_last_active_flag() {
        let coordinator = ActivityCoordinator::new(
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let (trigger, fired) = counting_trigger();
        coordinator.set_trigger(trigger);

        coordinator.start_heartbeat().await;
        coordinator.start_on_demand().await;
        coordinator.end_heartbeat().await;

        // Heartbeat cooldown expires while on_demand is still active.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        coordinator.end_on_demand().await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // No further idle transition, no further firing.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_an_activity_cancels_its_cooldown() {
        let coordinator = ActivityCoordinator::new(
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let (trigger, fired) = counting_trigger();
        coordinator.set_trigger(trigger);

        coordinator.start_on_demand().await;
        coordinator.end_on_demand().await;
        // New request arrives mid-cooldown.
        tokio::time::sleep(Duration::from_secs(2)).await;
        coordinator.start_on_demand().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(coordinator.status().await.on_demand);

        coordinator.end_on_demand().await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_trigger_fires_only_when_nothing_ever_ran() {
        let coordinator = ActivityCoordinator::new(
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let (trigger, fired) = counting_trigger();
        coordinator.set_trigger(trigger);

        coordinator.schedule_initial_trigger(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_trigger_skipped_after_user_activity() {
        let coordinator = ActivityCoordinator::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let (trigger, fired) = counting_trigger();
        coordinator.set_trigger(trigger);

        coordinator.schedule_initial_trigger(Duration::from_secs(30));
        coordinator.start_on_demand().await;
        coordinator.end_on_demand().await;
        tokio::time::sleep(Duration::from_secs(31)).await;
        // The cooldown-expiry trigger fired, the startup one did not.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn status_reports_flags_and_session() {
        let coordinator = ActivityCoordinator::new(
            Duration::from_secs(600),
            Duration::from_secs(600),
        );
        coordinator.start_heartbeat().await;
        coordinator
            .set_heartbeat_session_id("hb-1".to_string())
            .await;
        let status = coordinator.status().await;
        assert!(status.heartbeat);
        assert!(!status.on_demand);
        assert_eq!(status.heartbeat_session_id.as_deref(), Some("hb-1"));
        assert_eq!(status.heartbeat_cooldown_seconds, 600);
    }
}
