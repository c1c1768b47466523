use crate::prelude::{Sample, StageError, StageResult};
use ndarray::{Array2, ArrayView2};
use num_complex::Complex64;
use rustfft::num_traits::Zero;

/// Relative pivot floor below which a covariance is treated as singular.
const PIVOT_FLOOR: f64 = 1e-12;

/// Dense complex Hermitian helpers for the adaptive beamformer. Everything
/// is carried in `f64` so the covariance inversion stays stable at the
/// array sizes used by automotive radars.
pub struct MatrixHelper;

impl MatrixHelper {
    /// Sample covariance `R = 1/K sum x x^H` over the rows of `snapshots`
    /// (`[snapshot][element]`).
    pub fn sample_covariance(snapshots: ArrayView2<Sample>) -> Array2<Complex64> {
        let (count, elements) = snapshots.dim();
        let mut cov = Array2::<Complex64>::zeros((elements, elements));
        if count == 0 {
            return cov;
        }
        for snapshot in snapshots.rows() {
            let x: Vec<Complex64> = snapshot
                .iter()
                .map(|s| Complex64::new(s.re as f64, s.im as f64))
                .collect();
            for i in 0..elements {
                for j in 0..elements {
                    cov[[i, j]] += x[i] * x[j].conj();
                }
            }
        }
        let scale = 1.0 / count as f64;
        cov.mapv_inplace(|v| v * scale);
        cov
    }

    pub fn trace(matrix: &Array2<Complex64>) -> f64 {
        matrix.diag().iter().map(|c| c.re).sum()
    }

    /// Adds `factor * trace(R) / M` to the diagonal.
    pub fn diagonal_loading(matrix: &mut Array2<Complex64>, factor: f64) {
        let size = matrix.nrows();
        if size == 0 {
            return;
        }
        let delta = factor * Self::trace(matrix) / size as f64;
        for i in 0..size {
            matrix[[i, i]].re += delta;
        }
    }

    /// Lower-triangular Cholesky factor `L` with `L L^H = R`.
    ///
    /// Fails with [`StageError::Numerical`] for empty, zero-power, indefinite
    /// or badly conditioned matrices (condition estimated from the factor's
    /// diagonal).
    pub fn cholesky(matrix: &Array2<Complex64>, max_condition: f64) -> StageResult<Array2<Complex64>> {
        let n = matrix.nrows();
        if n == 0 || matrix.ncols() != n {
            return Err(StageError::Numerical(format!(
                "covariance must be square and non-empty, got {:?}",
                matrix.dim()
            )));
        }
        let scale = matrix
            .diag()
            .iter()
            .map(|c| c.re)
            .fold(0.0f64, f64::max);
        if !scale.is_finite() || scale <= 0.0 {
            return Err(StageError::Numerical("covariance has no power".into()));
        }

        let mut lower = Array2::<Complex64>::zeros((n, n));
        for j in 0..n {
            let mut pivot = matrix[[j, j]].re;
            for k in 0..j {
                pivot -= lower[[j, k]].norm_sqr();
            }
            if !pivot.is_finite() || pivot <= scale * PIVOT_FLOOR {
                return Err(StageError::Numerical(format!(
                    "non-positive pivot {:e} at column {}",
                    pivot, j
                )));
            }
            let root = pivot.sqrt();
            lower[[j, j]] = Complex64::new(root, 0.0);
            for i in (j + 1)..n {
                let mut acc = matrix[[i, j]];
                for k in 0..j {
                    acc -= lower[[i, k]] * lower[[j, k]].conj();
                }
                lower[[i, j]] = acc / root;
            }
        }

        let (min, max) = lower
            .diag()
            .iter()
            .fold((f64::MAX, 0.0f64), |(lo, hi), c| (lo.min(c.re), hi.max(c.re)));
        let condition = (max / min).powi(2);
        if condition > max_condition {
            return Err(StageError::Numerical(format!(
                "covariance condition estimate {:e} exceeds {:e}",
                condition, max_condition
            )));
        }
        Ok(lower)
    }

    /// `a^H R^-1 a` from the Cholesky factor of `R` (forward substitution,
    /// then the squared norm).
    pub fn inverse_quadratic_form(lower: &Array2<Complex64>, a: &[Complex64]) -> f64 {
        let n = lower.nrows();
        let mut y = vec![Complex64::zero(); n];
        for i in 0..n {
            let mut acc = a[i];
            for k in 0..i {
                acc -= lower[[i, k]] * y[k];
            }
            y[i] = acc / lower[[i, i]];
        }
        y.iter().map(|c| c.norm_sqr()).sum()
    }
}
