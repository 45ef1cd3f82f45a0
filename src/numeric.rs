//! Numeric safety primitives shared by every evaluator.
//!
//! The interpreter, the flattened program and the JIT all route division, exponentiation
//! and equality through these functions, so the backends can never disagree on an edge
//! case. The JIT reaches them through the `extern "C"` shims in [`crate::operators`].

/// Tolerances copied into every artifact at build time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerances {
    /// Magnitude added away from zero to every denominator
    pub fudge_factor: f64,
    /// Relative tolerance of `==` and `!=`
    pub relative_tolerance: f64,
    /// Absolute tolerance of `==` and `!=`
    pub absolute_tolerance: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            fudge_factor: 1e-20,
            relative_tolerance: 1e-6,
            absolute_tolerance: 1e-12,
        }
    }
}

impl Tolerances {
    /// Tolerances whose fudge factor is derived from the simulator's minimum conductance.
    pub fn from_gmin(gmin: f64) -> Self {
        Self {
            fudge_factor: gmin * 1e-20,
            ..Self::default()
        }
    }

    pub fn with_fudge_factor(mut self, fudge_factor: f64) -> Self {
        self.fudge_factor = fudge_factor;
        self
    }

    pub fn with_relative_tolerance(mut self, relative_tolerance: f64) -> Self {
        self.relative_tolerance = relative_tolerance;
        self
    }

    pub fn with_absolute_tolerance(mut self, absolute_tolerance: f64) -> Self {
        self.absolute_tolerance = absolute_tolerance;
        self
    }
}

/// Division that never produces NaN from a zero denominator.
///
/// The denominator is pushed away from zero by `fudge` (a denominator of `+0.0` counts as
/// non-negative). A denominator that is still exactly zero afterwards yields `+∞`.
pub fn safe_divide(numerator: f64, denominator: f64, fudge: f64) -> f64 {
    let adjusted = if denominator >= 0.0 {
        denominator + fudge
    } else {
        denominator - fudge
    };
    if adjusted == 0.0 {
        f64::INFINITY
    } else {
        numerator / adjusted
    }
}

/// Exponentiation over the absolute value of the base.
///
/// `x^0 = 1`, `x^1 = |x|`, `x^2 = x*x`, anything else is `|x|^e`.
pub fn power(base: f64, exponent: f64) -> f64 {
    if exponent == 0.0 {
        1.0
    } else if exponent == 1.0 {
        base.abs()
    } else if exponent == 2.0 {
        base * base
    } else {
        base.abs().powf(exponent)
    }
}

/// Tolerant equality: `|a - b| <= max(rel * max(|a|, |b|), abs)`.
pub fn fuzzy_equals(a: f64, b: f64, relative: f64, absolute: f64) -> bool {
    let scale = a.abs().max(b.abs());
    (a - b).abs() <= (relative * scale).max(absolute)
}

/// Floating point remainder with the sign of the dividend.
pub fn modulo(a: f64, b: f64) -> f64 {
    a % b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_divide_boundaries() {
        assert_eq!(safe_divide(1.0, 0.0, 0.0), f64::INFINITY);
        assert!((safe_divide(1.0, 0.0, 1e-20) / 1e20 - 1.0).abs() < 1e-12);
        assert!(safe_divide(1.0, -0.0, 1e-20) > 0.0);
        assert!((safe_divide(1.0, -1e-20, 1e-20) / -5e19 - 1.0).abs() < 1e-12);
        assert!(safe_divide(0.0, 0.0, 1e-20) == 0.0);
        assert_eq!(safe_divide(6.0, 3.0, 0.0), 2.0);
        assert!((safe_divide(6.0, 3.0, 1e-20) - 2.0).abs() < 1e-15);
    }

    #[test]
    fn test_power_conventions() {
        assert_eq!(power(-2.0, 2.0), 4.0);
        assert_eq!(power(-2.0, 3.0), 8.0);
        assert_eq!(power(2.0, 3.0), 8.0);
        assert_eq!(power(-3.0, 1.0), 3.0);
        assert_eq!(power(0.0, 0.0), 1.0);
        assert_eq!(power(-7.5, 0.0), 1.0);
        assert!((power(-4.0, 0.5) - 2.0).abs() < 1e-15);
    }

    #[test]
    fn test_fuzzy_equals() {
        assert!(fuzzy_equals(1.0, 1.0 + 1e-7, 1e-6, 1e-12));
        assert!(!fuzzy_equals(1.0, 1.0 + 1e-5, 1e-6, 1e-12));
        assert!(fuzzy_equals(0.0, 1e-13, 1e-6, 1e-12));
        assert!(!fuzzy_equals(0.0, 1e-11, 1e-6, 1e-12));
        assert!(fuzzy_equals(1e9, 1e9 + 100.0, 1e-6, 1e-12));
    }

    #[test]
    fn test_from_gmin() {
        let tolerances = Tolerances::from_gmin(1e-12);
        assert!((tolerances.fudge_factor / 1e-32 - 1.0).abs() < 1e-12);
        assert_eq!(tolerances.relative_tolerance, 1e-6);
        assert_eq!(tolerances.absolute_tolerance, 1e-12);
    }
}
