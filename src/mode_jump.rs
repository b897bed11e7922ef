//! Detection of abrupt shifts in a log-likelihood trace.
//!
//! A chain that escapes a secondary mode shows a step in its log-likelihood.
//! For every candidate position we compare the mean of the `window` draws
//! after it with the mean of the `window` draws before it, scaled by the
//! total range of the trace. A clean step therefore scores close to 1 at the
//! first draw of the new mode, while a stationary trace scores close to 0.

use crate::math::prefix_sums;

/// Window used by [`PloidySampler::detect_mode_jump`](crate::PloidySampler::detect_mode_jump).
pub const DEFAULT_WINDOW: usize = 50;

/// Position and size of the largest jump in a trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeJump {
    /// Index of the first draw after the jump.
    pub position: usize,
    /// Size of the jump relative to the range of the trace, in `[0, 1]`.
    pub height: f64,
}

impl ModeJump {
    const NONE: ModeJump = ModeJump {
        position: 0,
        height: 0.,
    };
}

pub fn detect(loglikes: &[f64], window: usize) -> ModeJump {
    let n = loglikes.len();
    let window = window.min(n / 2);
    if window == 0 {
        return ModeJump::NONE;
    }

    let (min, max) = loglikes
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    if !(range.is_finite() && range > 0.) {
        return ModeJump::NONE;
    }

    let prefix = prefix_sums(loglikes);
    let width = window as f64;
    (window..=n - window)
        .map(|i| {
            let before = (prefix[i] - prefix[i - window]) / width;
            let after = (prefix[i + window] - prefix[i]) / width;
            ModeJump {
                position: i,
                height: (after - before).abs() / range,
            }
        })
        .fold(ModeJump::NONE, |best, jump| {
            if jump.height > best.height {
                jump
            } else {
                best
            }
        })
}
