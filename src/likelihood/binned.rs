//! Binned Poisson negative log-likelihood.
//!
//! Purpose
//! -------
//! Provide the reference [`Evaluator`] of the crate: a template fit over
//! binned counts, `μ_i(x) = Σ_j x_j · T_j[i]`, scored by the Poisson
//! negative log-likelihood with Kahan-compensated accumulation. This is the
//! kind of objective the parallel gradient pipeline exists for.
//!
//! Key behaviors
//! -------------
//! - Validate counts and templates at construction; evaluation itself is
//!   total.
//! - Accumulate `Σ_i [μ_i − n_i·ln μ_i + ln Γ(n_i + 1)]` with a
//!   [`KahanSum`]; the carry of the last evaluation is exposed through
//!   [`Evaluator::carry`].
//! - Partition the bin range into contiguous chunks
//!   ([`BinnedNll::partition`]) so an event-loop splitter can hand disjoint
//!   subranges to different processes and merge the compensated partials.
//!
//! Invariants & assumptions
//! ------------------------
//! - Counts are finite and non-negative (weighted counts are admitted, so
//!   they need not be integers; the `ln Γ(n+1)` term generalizes the
//!   factorial).
//! - Predicted yields are clamped to a small positive floor before taking
//!   the log, so negative template coefficients cannot produce NaN; they
//!   produce a steeply penalized value instead.
use std::cell::Cell;

use statrs::function::gamma::ln_gamma;

use crate::likelihood::{
    errors::{LikError, LikResult},
    evaluator::Evaluator,
    kahan::KahanSum,
};

/// Floor applied to predicted yields before the logarithm.
const YIELD_FLOOR: f64 = 1e-9;

/// Poisson template likelihood over binned counts.
#[derive(Debug)]
pub struct BinnedNll {
    counts: Vec<f64>,
    templates: Vec<Vec<f64>>,
    last_carry: Cell<f64>,
}

impl BinnedNll {
    /// Build the likelihood from observed counts and one template per
    /// parameter.
    ///
    /// # Errors
    /// - [`LikError::EmptyBins`] when `counts` is empty.
    /// - [`LikError::InvalidCount`] for negative or non-finite counts.
    /// - [`LikError::TemplateLengthMismatch`] / [`LikError::InvalidTemplate`]
    ///   for malformed templates.
    pub fn new(counts: Vec<f64>, templates: Vec<Vec<f64>>) -> LikResult<Self> {
        if counts.is_empty() {
            return Err(LikError::EmptyBins);
        }
        for (bin, &n) in counts.iter().enumerate() {
            if !n.is_finite() || n < 0.0 {
                return Err(LikError::InvalidCount { bin, value: n });
            }
        }
        for (j, t) in templates.iter().enumerate() {
            if t.len() != counts.len() {
                return Err(LikError::TemplateLengthMismatch {
                    template: j,
                    expected: counts.len(),
                    actual: t.len(),
                });
            }
            for (bin, &v) in t.iter().enumerate() {
                if !v.is_finite() || v < 0.0 {
                    return Err(LikError::InvalidTemplate { template: j, bin, value: v });
                }
            }
        }
        Ok(BinnedNll { counts, templates, last_carry: Cell::new(0.0) })
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.counts.len()
    }

    /// Contiguous bin subrange for partition `i` of `n`.
    ///
    /// Ranges are disjoint, cover all bins, and differ in length by at most
    /// one; `partition(i, 1)` is the full range.
    pub fn partition(&self, i: usize, n: usize) -> std::ops::Range<usize> {
        assert!(n > 0 && i < n, "partition index {i} out of {n}");
        let bins = self.counts.len();
        let base = bins / n;
        let extra = bins % n;
        let start = i * base + i.min(extra);
        let len = base + usize::from(i < extra);
        start..start + len
    }

    /// Compensated NLL over a bin subrange; used by partitioned evaluation.
    pub fn value_over(&self, x: &[f64], bins: std::ops::Range<usize>) -> KahanSum {
        let mut acc = KahanSum::new();
        for i in bins {
            let mut mu = 0.0;
            for (xj, t) in x.iter().zip(&self.templates) {
                mu += xj * t[i];
            }
            let mu = mu.max(YIELD_FLOOR);
            let n = self.counts[i];
            acc.add(mu - n * mu.ln() + ln_gamma(n + 1.0));
        }
        acc
    }
}

impl Evaluator for BinnedNll {
    fn dim(&self) -> usize {
        self.templates.len()
    }

    fn value(&self, x: &[f64]) -> f64 {
        debug_assert_eq!(x.len(), self.dim());
        let acc = self.value_over(x, 0..self.counts.len());
        self.last_carry.set(acc.carry());
        acc.value()
    }

    fn carry(&self) -> f64 {
        self.last_carry.get()
    }
}
