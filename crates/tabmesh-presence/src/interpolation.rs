//! Remote cursor smoothing
//!
//! Rendering runs one sample interval behind the latest position: the
//! cursor travels from the previous sample to the latest over the time that
//! separated them, and may overshoot by `extrapolation` of the interval.

use crate::CursorPosition;

pub const DEFAULT_EXTRAPOLATION: f64 = 0.5;

/// Last two timestamped samples of one remote cursor
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CursorTrack {
    previous: Option<(CursorPosition, u64)>,
    latest: (CursorPosition, u64),
}

impl CursorTrack {
    pub fn new(position: CursorPosition, received_ms: u64) -> Self {
        CursorTrack {
            previous: None,
            latest: (position, received_ms),
        }
    }

    pub fn push(&mut self, position: CursorPosition, received_ms: u64) {
        self.previous = Some(self.latest);
        self.latest = (position, received_ms);
    }

    pub fn latest(&self) -> CursorPosition {
        self.latest.0
    }

    /// Position to draw at `now_ms`
    pub fn render(&self, now_ms: u64, extrapolation: f64) -> CursorPosition {
        let (p1, t1) = self.latest;
        let Some((p0, t0)) = self.previous else {
            return p1;
        };
        if t1 <= t0 {
            return p1;
        }
        let interval = (t1 - t0) as f64;
        let elapsed = now_ms.saturating_sub(t1) as f64;
        let progress = (elapsed / interval).clamp(0.0, 1.0 + extrapolation.max(0.0));
        p0.lerp(&p1, progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(x: f64, y: f64) -> CursorPosition {
        CursorPosition::new(x, y)
    }

    #[test]
    fn test_single_sample_unmodified() {
        let track = CursorTrack::new(at(5.0, 5.0), 100);
        assert_eq!(track.render(1_000, DEFAULT_EXTRAPOLATION), at(5.0, 5.0));
    }

    #[test]
    fn test_interpolates_over_interval() {
        let mut track = CursorTrack::new(at(0.0, 0.0), 100);
        track.push(at(10.0, 20.0), 200);

        assert_eq!(track.render(200, DEFAULT_EXTRAPOLATION), at(0.0, 0.0));
        assert_eq!(track.render(250, DEFAULT_EXTRAPOLATION), at(5.0, 10.0));
        assert_eq!(track.render(300, DEFAULT_EXTRAPOLATION), at(10.0, 20.0));
        // Overshoot capped at 1.5
        assert_eq!(track.render(350, DEFAULT_EXTRAPOLATION), at(15.0, 30.0));
        assert_eq!(track.render(10_000, DEFAULT_EXTRAPOLATION), at(15.0, 30.0));
    }

    #[test]
    fn test_zero_interval_renders_latest() {
        let mut track = CursorTrack::new(at(0.0, 0.0), 100);
        track.push(at(3.0, 4.0), 100);
        assert_eq!(track.render(150, DEFAULT_EXTRAPOLATION), at(3.0, 4.0));
    }

    proptest! {
        #[test]
        fn prop_render_stays_on_segment(
            x0 in -1e3f64..1e3, x1 in -1e3f64..1e3,
            t0 in 0u64..10_000, dt in 1u64..1_000, later in 0u64..5_000,
        ) {
            let mut track = CursorTrack::new(at(x0, 0.0), t0);
            track.push(at(x1, 0.0), t0 + dt);
            let x = track.render(t0 + dt + later, DEFAULT_EXTRAPOLATION).x;
            let overshoot = x0 + (x1 - x0) * 1.5;
            let (lo, hi) = if x0 <= overshoot { (x0, overshoot) } else { (overshoot, x0) };
            prop_assert!(x >= lo - 1e-9 && x <= hi + 1e-9);
        }
    }
}
