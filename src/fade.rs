//! Linear crossfades between universe snapshots.
//!
//! At most one fade is in flight. The fade does not own a timer: the
//! engine's 25 ms driver calls [`FadeEngine::tick`], so interpolation
//! steps land on the same clock that publishes serial frames and the
//! transmitter never samples a half-applied step.

use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

use crate::universe::{Snapshot, Universe, DMX_CHANNELS};

struct ActiveFade {
    start: Snapshot,
    target: Snapshot,
    started: Instant,
    duration: Duration,
    done: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
pub struct FadeEngine {
    active: Option<ActiveFade>,
}

impl FadeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Begin a fade from the universe's current raw state to `target`.
    ///
    /// A zero duration applies the target immediately. An already-running
    /// fade is cancelled first (its completion handle resolves; no
    /// rollback). The returned receiver resolves when the fade completes
    /// or is superseded.
    pub fn fade_to(
        &mut self,
        universe: &mut Universe,
        target: Snapshot,
        duration_ms: u64,
    ) -> oneshot::Receiver<()> {
        self.cancel();

        let (tx, rx) = oneshot::channel();
        if duration_ms == 0 {
            universe.apply_snapshot(&target);
            let _ = tx.send(());
            return rx;
        }

        self.active = Some(ActiveFade {
            start: universe.raw(),
            target,
            started: Instant::now(),
            duration: Duration::from_millis(duration_ms),
            done: Some(tx),
        });
        rx
    }

    pub fn fade_to_blackout(
        &mut self,
        universe: &mut Universe,
        duration_ms: u64,
    ) -> oneshot::Receiver<()> {
        self.fade_to(universe, [0; DMX_CHANNELS], duration_ms)
    }

    /// Stop the current fade where it is and resolve its completion.
    pub fn cancel(&mut self) {
        if let Some(mut fade) = self.active.take() {
            if let Some(done) = fade.done.take() {
                let _ = done.send(());
            }
        }
    }

    /// Advance the active fade, if any. Called on every 25 ms engine tick.
    pub fn tick(&mut self, universe: &mut Universe, now: Instant) {
        let Some(fade) = self.active.as_mut() else {
            return;
        };

        let elapsed = now.saturating_duration_since(fade.started);
        let progress = (elapsed.as_secs_f64() / fade.duration.as_secs_f64()).min(1.0);

        let mut out = [0u8; DMX_CHANNELS];
        for i in 0..DMX_CHANNELS {
            let from = fade.start[i] as f64;
            let to = fade.target[i] as f64;
            out[i] = (from + (to - from) * progress).round().clamp(0.0, 255.0) as u8;
        }
        universe.apply_snapshot(&out);

        if progress >= 1.0 {
            let mut fade = self.active.take().expect("fade checked above");
            if let Some(done) = fade.done.take() {
                let _ = done.send(());
            }
        }
    }
}
