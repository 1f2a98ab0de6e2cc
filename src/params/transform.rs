//! Internal/external parameter-space transforms.
//!
//! Purpose
//! -------
//! Map between the bounded "external" space the user declares (via limits on
//! [`ParameterSettings`]) and the unbounded "internal" space the minimizer
//! and the gradient kernel operate in. Each transform is a bijection on the
//! admissible region and supplies the first derivative needed to convert
//! internal-space gradients back to external scale.
//!
//! Key behaviors
//! -------------
//! - `Unbounded` parameters use the identity in both directions.
//! - Double-sided limits use the sine transform
//!   `ext = a + ((b−a)/2)·(sin(int) + 1)`, whose image is exactly `[a, b]`.
//! - Single-sided limits use the sqrt families
//!   `ext = b + 1 − sqrt(int² + 1)` (upper) and
//!   `ext = a − 1 + sqrt(int² + 1)` (lower).
//!
//! Invariants & assumptions
//! ------------------------
//! - Limits come from validated [`ParameterSettings`], so `lower < upper`
//!   and both are finite whenever present.
//! - `ext2int` clamps its argument to the closed admissible interval before
//!   inverting, so floating-point dust at a limit cannot produce NaN. The
//!   sqrt families return the non-negative internal branch.
//! - `int2ext ∘ ext2int` is the identity on the admissible region;
//!   `ext2int ∘ int2ext` is the identity for unbounded and double-sided
//!   transforms (the sine transform is periodic, so the round trip holds on
//!   the principal branch used by the kernel).
//!
//! Downstream usage
//! ----------------
//! - The derivator chooses steps in internal space and evaluates the
//!   objective at externally transformed points when exact Minuit mimicry
//!   is enabled; `d_int2ext` converts gradients between the two scales.
//! - Initial-gradient seeding maps the settings' step width through
//!   `ext2int` differences.
use crate::params::settings::ParameterSettings;

/// Bijective map between one parameter's external and internal coordinates.
///
/// Built from a parameter's limits via [`ParameterTransform::for_settings`].
/// All three operations are total; see the module notes on clamping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterTransform {
    /// No limits: identity in both directions.
    Unbounded,
    /// Both limits present: sine transform onto `[lower, upper]`.
    BothLimits { lower: f64, upper: f64 },
    /// Only a lower limit: `ext = lower − 1 + sqrt(int² + 1)`.
    LowerOnly { lower: f64 },
    /// Only an upper limit: `ext = upper + 1 − sqrt(int² + 1)`.
    UpperOnly { upper: f64 },
}

impl ParameterTransform {
    /// Derive the transform implied by a parameter's limit flags.
    pub fn for_settings(settings: &ParameterSettings) -> Self {
        match (settings.has_lower_limit, settings.has_upper_limit) {
            (false, false) => ParameterTransform::Unbounded,
            (true, true) => {
                ParameterTransform::BothLimits { lower: settings.lower, upper: settings.upper }
            }
            (true, false) => ParameterTransform::LowerOnly { lower: settings.lower },
            (false, true) => ParameterTransform::UpperOnly { upper: settings.upper },
        }
    }

    /// Map an internal value to external coordinates.
    #[inline]
    pub fn int2ext(&self, int: f64) -> f64 {
        match *self {
            ParameterTransform::Unbounded => int,
            ParameterTransform::BothLimits { lower, upper } => {
                lower + 0.5 * (upper - lower) * (int.sin() + 1.0)
            }
            ParameterTransform::LowerOnly { lower } => lower - 1.0 + (int * int + 1.0).sqrt(),
            ParameterTransform::UpperOnly { upper } => upper + 1.0 - (int * int + 1.0).sqrt(),
        }
    }

    /// Map an external value to internal coordinates.
    ///
    /// Arguments outside the admissible region are clamped to its closure
    /// first; the sqrt families return the non-negative branch.
    #[inline]
    pub fn ext2int(&self, ext: f64) -> f64 {
        match *self {
            ParameterTransform::Unbounded => ext,
            ParameterTransform::BothLimits { lower, upper } => {
                let arg = 2.0 * (ext - lower) / (upper - lower) - 1.0;
                arg.clamp(-1.0, 1.0).asin()
            }
            ParameterTransform::LowerOnly { lower } => {
                let shifted = (ext - lower + 1.0).max(1.0);
                (shifted * shifted - 1.0).sqrt()
            }
            ParameterTransform::UpperOnly { upper } => {
                let shifted = (upper - ext + 1.0).max(1.0);
                (shifted * shifted - 1.0).sqrt()
            }
        }
    }

    /// First derivative `d int2ext / d int` at an internal point.
    #[inline]
    pub fn d_int2ext(&self, int: f64) -> f64 {
        match *self {
            ParameterTransform::Unbounded => 1.0,
            ParameterTransform::BothLimits { lower, upper } => {
                0.5 * (upper - lower) * int.cos()
            }
            ParameterTransform::LowerOnly { .. } => int / (int * int + 1.0).sqrt(),
            ParameterTransform::UpperOnly { .. } => -int / (int * int + 1.0).sqrt(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - Round trips of the identity and sine transforms.
    // - Image bounds of the sine and sqrt transforms.
    // - Analytic derivative checks against central differences.
    //
    // They intentionally DO NOT cover:
    // - Derivator behavior built on top of the transforms.
    // -------------------------------------------------------------------------

    fn roundtrip_tol() -> f64 {
        10.0 * f64::EPSILON
    }

    #[test]
    // Purpose
    // -------
    // Verify the unbounded transform is the identity with unit derivative.
    //
    // Given
    // -----
    // - A few internal values across signs and magnitudes.
    //
    // Expect
    // ------
    // - int2ext, ext2int both return the input; d_int2ext is 1.
    fn unbounded_transform_is_identity() {
        let t = ParameterTransform::Unbounded;
        for &v in &[-3.0, 0.0, 1.5e7] {
            assert_eq!(t.int2ext(v), v);
            assert_eq!(t.ext2int(v), v);
            assert_eq!(t.d_int2ext(v), 1.0);
        }
    }

    #[test]
    // Purpose
    // -------
    // Verify the sine transform round trip on the principal branch and
    // that its image stays inside the limits.
    //
    // Given
    // -----
    // - Limits [-0.3, 0.3]; internal values in (-π/2, π/2).
    //
    // Expect
    // ------
    // - ext2int(int2ext(v)) == v within 10·eps; images lie in [a, b].
    fn sine_transform_round_trips_on_principal_branch() {
        let t = ParameterTransform::BothLimits { lower: -0.3, upper: 0.3 };
        for &v in &[-1.5, -0.7, 0.0, 0.2, 1.5] {
            let ext = t.int2ext(v);
            assert!((-0.3..=0.3).contains(&ext), "image {ext} outside limits");
            let back = t.ext2int(ext);
            assert!((back - v).abs() <= roundtrip_tol() * (1.0 + v.abs()), "round trip {v} -> {back}");
        }
    }

    #[test]
    // Purpose
    // -------
    // Verify that ext2int of the sine transform clamps values that fall
    // just outside the limits by floating-point dust.
    //
    // Given
    // -----
    // - External values epsilon beyond each limit.
    //
    // Expect
    // ------
    // - Finite internal values at ±π/2, not NaN.
    fn sine_transform_clamps_boundary_dust() {
        let t = ParameterTransform::BothLimits { lower: -1.0, upper: 1.0 };
        let above = t.ext2int(1.0 + 1e-14);
        let below = t.ext2int(-1.0 - 1e-14);
        assert!(above.is_finite());
        assert!(below.is_finite());
        assert!((above - std::f64::consts::FRAC_PI_2).abs() < 1e-6);
        assert!((below + std::f64::consts::FRAC_PI_2).abs() < 1e-6);
    }

    #[test]
    // Purpose
    // -------
    // Verify the sqrt families honor their one-sided bound and invert on
    // the non-negative branch.
    //
    // Given
    // -----
    // - A lower-only transform at 2.0 and an upper-only transform at 5.0.
    //
    // Expect
    // ------
    // - Images respect the bound; int2ext(ext2int(e)) == e within 10·eps
    //   for admissible e.
    fn sqrt_transforms_respect_single_bounds() {
        let lo = ParameterTransform::LowerOnly { lower: 2.0 };
        let up = ParameterTransform::UpperOnly { upper: 5.0 };
        for &v in &[0.0, 0.5, 3.0] {
            assert!(lo.int2ext(v) >= 2.0);
            assert!(up.int2ext(v) <= 5.0);
        }
        for &e in &[2.0, 2.5, 10.0] {
            let back = lo.int2ext(lo.ext2int(e));
            assert!((back - e).abs() <= roundtrip_tol() * (1.0 + e.abs()));
        }
        for &e in &[5.0, 4.5, -10.0] {
            let back = up.int2ext(up.ext2int(e));
            assert!((back - e).abs() <= roundtrip_tol() * (1.0 + e.abs()));
        }
    }

    #[test]
    // Purpose
    // -------
    // Check the analytic first derivative against a central difference for
    // each transform kind.
    //
    // Given
    // -----
    // - Internal point 0.4, step 1e-6.
    //
    // Expect
    // ------
    // - |analytic − numeric| < 1e-8 in all cases.
    fn derivatives_match_central_differences() {
        let transforms = [
            ParameterTransform::Unbounded,
            ParameterTransform::BothLimits { lower: -0.3, upper: 0.3 },
            ParameterTransform::LowerOnly { lower: 2.0 },
            ParameterTransform::UpperOnly { upper: 5.0 },
        ];
        let x = 0.4;
        let h = 1e-6;
        for t in transforms {
            let numeric = (t.int2ext(x + h) - t.int2ext(x - h)) / (2.0 * h);
            let analytic = t.d_int2ext(x);
            assert!(
                (numeric - analytic).abs() < 1e-8,
                "derivative mismatch for {t:?}: {numeric} vs {analytic}"
            );
        }
    }
}
