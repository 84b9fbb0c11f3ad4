//! Window statistics for change-point detection
//!
//! Means and variances are computed with trueno's SIMD vectors. The
//! separation statistic is Welch's t: the absolute difference of the window
//! means over the combined standard error,
//!
//! ```text
//! t = |avg_f - avg_h| / sqrt(var_h / n_h + var_f / n_f)
//! ```
//!
//! It grows with the distance between the means, shrinks as either window
//! gets noisier, and grows with window size. When both variances are zero
//! the windows are treated as certain: any difference in means is an
//! infinite separation, equal means are zero.

use crate::datum::WindowStats;
use trueno::Vector;

/// Relative tolerance below which two means are considered equal.
///
/// Flat windows have exact means, so two flat windows at the same level can
/// only differ at the f64 ulp scale.
const MEAN_TOLERANCE: f64 = 64.0 * f64::EPSILON;

/// Mean, sample variance and size of a window
///
/// trueno reduces in f32, which cannot resolve the spread of a window that
/// sits at 1e4 or above. The window is shifted by its first value in f64 so
/// trueno only sees residuals, and the shift is added back to the mean.
///
/// # Example
/// ```
/// use perfalert::stats::window_stats;
///
/// let stats = window_stats(&[2.0, 4.0, 6.0, 8.0]);
/// assert_eq!(stats.n, 4);
/// assert!((stats.avg - 5.0).abs() < 1e-6);
///
/// let stats = window_stats(&[1e8, 1e8 + 1.0, 1e8 - 1.0, 1e8]);
/// assert!((stats.variance - 2.0 / 3.0).abs() < 1e-4);
/// ```
pub fn window_stats(values: &[f64]) -> WindowStats {
    let Some(&reference) = values.first() else {
        return WindowStats::default();
    };

    let residuals: Vec<f32> = values.iter().map(|&v| (v - reference) as f32).collect();
    let v = Vector::from_slice(&residuals);
    let n = values.len();

    let avg = reference + v.mean().unwrap_or(0.0) as f64;

    // trueno reports population variance (divide by n); rescale to n - 1
    let variance = if n > 1 {
        let population = v.variance().unwrap_or(0.0) as f64;
        (population * n as f64 / (n - 1) as f64).max(0.0)
    } else {
        0.0
    };

    WindowStats { avg, variance, n }
}

/// Statistics of a single observation
pub fn point_stats(value: f64) -> WindowStats {
    WindowStats {
        avg: value,
        variance: 0.0,
        n: 1,
    }
}

/// Welch's t between two windows, as a non-negative magnitude
///
/// Returns 0.0 when either window is empty or the result is not a number.
pub fn welch_t(historical: &WindowStats, forward: &WindowStats) -> f64 {
    if historical.n == 0 || forward.n == 0 {
        return 0.0;
    }

    let diff = (forward.avg - historical.avg).abs();
    let scale = historical.avg.abs().max(forward.avg.abs()).max(1.0);
    if diff <= MEAN_TOLERANCE * scale {
        return 0.0;
    }

    let standard_error_sq =
        historical.variance / historical.n as f64 + forward.variance / forward.n as f64;

    if standard_error_sq <= 0.0 {
        // Both windows are flat and their means differ
        return f64::INFINITY;
    }

    let t = diff / standard_error_sq.sqrt();
    if t.is_nan() {
        0.0
    } else {
        t
    }
}

/// Separation between two raw windows
pub fn separation(historical: &[f64], forward: &[f64]) -> f64 {
    welch_t(&window_stats(historical), &window_stats(forward))
}

/// Relative change from `old` to `new` in percent, `None` when `old` is zero
pub fn percentage_change(old: f64, new: f64) -> Option<f64> {
    if old == 0.0 {
        None
    } else {
        Some(100.0 * (new - old).abs() / old.abs())
    }
}
