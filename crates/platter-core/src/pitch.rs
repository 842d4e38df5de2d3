//! Timecode pitch tracking
//!
//! The timecode decoder reports how far the record moved between two
//! successive sample periods. Those deltas are discrete and noisy, so they
//! cannot drive the playback resampler directly. This filter keeps a
//! two-state (position, velocity) estimate and corrects it with each
//! observation; the playback engine reads the smoothed velocity every
//! cycle.
//!
//! Observations come from one thread (the timecode thread) while the audio
//! thread reads [`Pitch::velocity`] concurrently. Both sides go through
//! relaxed atomic bit-casts of the f64 state, so neither ever takes a lock.

use std::sync::atomic::{AtomicU64, Ordering};

// Filter gains concluded experimentally.
const ALPHA: f64 = 1.0 / 512.0;
const BETA: f64 = ALPHA / 1024.0;

/// Two-state position/velocity filter over timecode observations.
pub struct Pitch {
    /// Seconds between observations
    dt: f64,
    /// Residual position relative to the last observation (f64 bits)
    x: AtomicU64,
    /// Velocity in position units per second (f64 bits)
    v: AtomicU64,
}

impl Pitch {
    /// Prepare the filter for observations every `dt` seconds.
    pub fn new(dt: f64) -> Self {
        Self {
            dt,
            x: AtomicU64::new(0f64.to_bits()),
            v: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Input an observation: in the last `dt` seconds the position moved
    /// by `dx`.
    ///
    /// The vinyl timecode is timestamped, so the values of `dx` are
    /// discrete rather than smooth. Only the timecode thread may call
    /// this; concurrent readers of [`velocity`](Self::velocity) are fine.
    pub fn observe(&self, dx: f64) {
        let x = f64::from_bits(self.x.load(Ordering::Relaxed));
        let v = f64::from_bits(self.v.load(Ordering::Relaxed));

        let predicted_x = x + v * self.dt;
        let predicted_v = v;

        let residual = dx - predicted_x;

        let x = predicted_x + residual * ALPHA;
        let v = predicted_v + residual * BETA / self.dt;

        // Rebase so the next observation is relative to this one.
        self.x.store((x - dx).to_bits(), Ordering::Relaxed);
        self.v.store(v.to_bits(), Ordering::Relaxed);
    }

    /// Current velocity estimate, in position units per second.
    ///
    /// Safe to call from any thread, including the audio callback.
    pub fn velocity(&self) -> f64 {
        f64::from_bits(self.v.load(Ordering::Relaxed))
    }

    /// The observation period this filter was built for.
    pub fn dt(&self) -> f64 {
        self.dt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f64 = 1.0 / 48_000.0;

    #[test]
    fn starts_at_rest() {
        let pitch = Pitch::new(DT);
        assert_eq!(pitch.velocity(), 0.0);
    }

    #[test]
    fn first_observation_applies_gains() {
        let pitch = Pitch::new(DT);
        let dx = 3.0 * DT;
        pitch.observe(dx);

        // From rest the residual is exactly dx.
        let expected_v = dx * BETA / DT;
        assert!((pitch.velocity() - expected_v).abs() < 1e-12);
    }

    #[test]
    fn stationary_record_stays_stationary() {
        let pitch = Pitch::new(DT);
        for _ in 0..1000 {
            pitch.observe(0.0);
        }
        assert_eq!(pitch.velocity(), 0.0);
    }

    #[test]
    fn converges_to_unit_velocity() {
        // Normal playback: the record advances one sample period per
        // observation, so velocity should settle at 1.0.
        let pitch = Pitch::new(DT);
        for _ in 0..10_000 {
            pitch.observe(DT);
        }
        let v = pitch.velocity();
        assert!((v - 1.0).abs() < 0.01, "velocity {v} not within 1% of 1.0");
    }

    #[test]
    fn converges_at_pitched_up_speed() {
        let pitch = Pitch::new(DT);
        let dx = 1.08 * DT;
        for _ in 0..20_000 {
            pitch.observe(dx);
        }
        let v = pitch.velocity();
        assert!((v - 1.08).abs() < 0.01, "velocity {v} not within 1% of 1.08");
    }

    #[test]
    fn decays_after_the_record_stops() {
        let pitch = Pitch::new(DT);
        for _ in 0..10_000 {
            pitch.observe(DT);
        }
        for _ in 0..30_000 {
            pitch.observe(0.0);
        }
        let v = pitch.velocity();
        assert!(v.abs() < 0.01, "velocity {v} did not decay");
    }

    #[test]
    fn velocity_readable_across_threads() {
        use std::sync::Arc;

        let pitch = Arc::new(Pitch::new(DT));
        let reader = {
            let pitch = Arc::clone(&pitch);
            std::thread::spawn(move || {
                let mut last = 0.0;
                for _ in 0..1000 {
                    let v = pitch.velocity();
                    assert!(v.is_finite());
                    last = v;
                }
                last
            })
        };
        for _ in 0..10_000 {
            pitch.observe(DT);
        }
        reader.join().unwrap();
        assert!(pitch.velocity().is_finite());
    }
}
