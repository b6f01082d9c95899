//! Liveness tracking for the capture and control stages.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::error;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
pub(crate) const STALE_AFTER_MS: u64 = 1_500;
pub(crate) const STARTUP_GRACE_MS: u64 = 5_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HealthComponent {
    Capture,
    Control,
}

impl HealthComponent {
    const ALL: [Self; 2] = [Self::Capture, Self::Control];

    fn index(self) -> usize {
        self as usize
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Control => "control",
        }
    }
}

/// Last heartbeat per stage, in milliseconds since the epoch.
pub(crate) struct PipelineHealth {
    last_beat: [AtomicU64; 2],
}

impl PipelineHealth {
    pub(crate) fn new() -> Self {
        Self::starting_at(epoch_millis())
    }

    /// Both stages count as alive until the startup grace period ends.
    fn starting_at(now: u64) -> Self {
        let deadline = now.saturating_add(STARTUP_GRACE_MS);
        Self {
            last_beat: [AtomicU64::new(deadline), AtomicU64::new(deadline)],
        }
    }

    pub(crate) fn beat(&self, component: HealthComponent) {
        self.beat_at(component, epoch_millis());
    }

    fn beat_at(&self, component: HealthComponent, now: u64) {
        self.last_beat[component.index()].store(now, Ordering::Relaxed);
    }

    pub(crate) fn stale_component(&self, now: u64) -> Option<HealthComponent> {
        HealthComponent::ALL.into_iter().find(|component| {
            let last = self.last_beat[component.index()].load(Ordering::Relaxed);
            now.saturating_sub(last) > STALE_AFTER_MS
        })
    }
}

/// Records the first stage the watchdog found stalled.
#[derive(Default)]
pub(crate) struct StallLatch(Mutex<Option<HealthComponent>>);

impl StallLatch {
    fn trip(&self, component: HealthComponent) {
        if let Ok(mut guard) = self.0.lock() {
            guard.get_or_insert(component);
        }
    }

    pub(crate) fn tripped(&self) -> Option<HealthComponent> {
        self.0.lock().ok().and_then(|guard| *guard)
    }
}

/// Poll `health` while `running` is set. On a stall, run `on_stall`, trip the
/// latch and clear `running` so the supervisor restarts the pipeline.
pub(crate) fn spawn_watchdog<F>(
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    latch: Arc<StallLatch>,
    on_stall: F,
) -> thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name("controller-watchdog".into())
        .spawn(move || {
            while running.load(Ordering::Relaxed) && !shutdown.load(Ordering::Relaxed) {
                thread::sleep(POLL_INTERVAL);
                let Some(component) = health.stale_component(epoch_millis()) else {
                    continue;
                };
                error!("{} stage stalled; halting base", component.label());
                metrics::counter!("controller_watchdog_trips_total", "stage" => component.label())
                    .increment(1);
                on_stall();
                latch.trip(component);
                running.store(false, Ordering::SeqCst);
                break;
            }
        })
        .expect("failed to spawn watchdog thread")
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
