//! Compensated (Kahan) summation.
//!
//! Likelihoods are sums over many events or bins; accumulating them in
//! plain `f64` loses low-order bits that matter when a minimizer compares
//! nearby function values. [`KahanSum`] tracks the lost bits in a carry
//! term that travels with the value, so partitioned sums can be combined
//! without losing the compensation.

/// Running compensated sum.
///
/// `value()` is the best estimate of the sum; `carry()` holds the
/// accumulated low-order bits. To merge partial sums across partitions, add
/// the partner's value and carry as ordinary terms.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KahanSum {
    sum: f64,
    carry: f64,
}

impl KahanSum {
    pub fn new() -> Self {
        KahanSum { sum: 0.0, carry: 0.0 }
    }

    /// Add one term, Neumaier-style: the branch keeps the compensation
    /// correct when the term is larger than the running sum.
    #[inline]
    pub fn add(&mut self, term: f64) {
        let t = self.sum + term;
        if self.sum.abs() >= term.abs() {
            self.carry += (self.sum - t) + term;
        } else {
            self.carry += (term - t) + self.sum;
        }
        self.sum = t;
    }

    /// Fold another compensated sum into this one.
    pub fn merge(&mut self, other: &KahanSum) {
        self.add(other.sum);
        self.add(other.carry);
    }

    /// Best estimate of the sum (principal value plus compensation).
    #[inline]
    pub fn value(&self) -> f64 {
        self.sum + self.carry
    }

    /// Accumulated low-order bits.
    #[inline]
    pub fn carry(&self) -> f64 {
        self.carry
    }
}
