//! Symmetric positive-definite algebra on `ndarray` matrices, backed by
//! faer's LLᵀ factorization.

use crate::error::{BnnError, Result};
use faer::linalg::solvers::{Llt, LltError, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayView2, Axis};

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

/// Borrows standard-layout arrays in place and copies anything else.
enum FaerView<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl<'a> FaerView<'a> {
    fn new(array: ArrayView2<'a, f64>) -> Self {
        let (rows, cols) = array.dim();
        match array.to_slice() {
            Some(slice) => FaerView::Borrowed(MatRef::from_row_major_slice(slice, rows, cols)),
            None => FaerView::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)])),
        }
    }

    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerView::Borrowed(view) => *view,
            FaerView::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Cholesky factor `L` of a symmetric positive-definite `A = L Lᵀ`.
pub struct Cholesky {
    factor: Llt<f64>,
}

impl Cholesky {
    pub fn new(a: ArrayView2<f64>) -> Result<Self> {
        if a.ncols() != a.nrows() {
            return Err(BnnError::shape("cholesky input", "square matrix", a.shape()));
        }
        if let Some(pivot) = (0..a.nrows()).find(|&i| a.row(i).iter().any(|v| !v.is_finite())) {
            return Err(BnnError::NotPositiveDefinite { pivot });
        }
        let view = FaerView::new(a);
        let factor = view.as_ref().llt(Side::Lower).map_err(|e| match e {
            LltError::NonPositivePivot { index } => BnnError::NotPositiveDefinite { pivot: index },
        })?;
        Ok(Self { factor })
    }

    pub fn dim(&self) -> usize {
        self.factor.L().nrows()
    }

    /// Solve `A X = B`.
    pub fn solve(&self, b: ArrayView2<f64>) -> Array2<f64> {
        let rhs = FaerView::new(b);
        mat_to_array(self.factor.solve(rhs.as_ref()).as_ref())
    }

    pub fn inverse(&self) -> Array2<f64> {
        let eye = Array2::<f64>::eye(self.dim());
        self.solve(eye.view())
    }

    /// `tr(Bᵀ A⁻¹ B)`; for a single column this is `bᵀ A⁻¹ b`.
    pub fn quad_form(&self, b: ArrayView2<f64>) -> f64 {
        (&self.solve(b) * &b).sum()
    }

    /// `log|A|`.
    pub fn log_det(&self) -> f64 {
        2.0 * self.diag().iter().map(|d| d.ln()).sum::<f64>()
    }

    pub fn diag(&self) -> Array1<f64> {
        let l = self.factor.L();
        Array1::from_shape_fn(l.nrows(), |i| l[(i, i)])
    }

    /// `L` with its strict upper triangle zeroed.
    pub fn lower(&self) -> Array2<f64> {
        let l = self.factor.L();
        Array2::from_shape_fn((l.nrows(), l.ncols()), |(i, j)| if j <= i { l[(i, j)] } else { 0.0 })
    }
}

/// Add `value` to the diagonal in place.
pub fn add_diagonal(a: &mut Array2<f64>, value: f64) {
    a.diag_mut().mapv_inplace(|d| d + value);
}

/// `Array1` -> `n×1`.
pub fn column(v: Array1<f64>) -> Array2<f64> {
    v.insert_axis(Axis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn factor_reconstructs_matrix() {
        let a = array![[4.0, 2.0, 0.4], [2.0, 3.0, 0.5], [0.4, 0.5, 2.0]];
        let l = Cholesky::new(a.view()).unwrap().lower();
        let back = l.dot(&l.t());
        for (x, y) in back.iter().zip(a.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
    }

    #[test]
    fn solve_inverse_and_log_det() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let chol = Cholesky::new(a.view()).unwrap();
        let eye = a.dot(&chol.inverse());
        assert_abs_diff_eq!(eye[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(eye[[0, 1]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(chol.log_det(), 11.0f64.ln(), epsilon = 1e-12);

        let b = array![[1.0], [2.0]];
        let x = chol.solve(b.view());
        assert_abs_diff_eq!(a.dot(&x)[[1, 0]], 2.0, epsilon = 1e-12);
        // bᵀ A⁻¹ b with A⁻¹ = [[3, -1], [-1, 4]] / 11
        assert_abs_diff_eq!(chol.quad_form(b.view()), 15.0 / 11.0, epsilon = 1e-12);
    }

    #[test]
    fn non_contiguous_inputs_are_copied() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let t = a.t();
        let chol = Cholesky::new(t).unwrap();
        assert_abs_diff_eq!(chol.log_det(), 11.0f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn rejects_indefinite() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(matches!(Cholesky::new(a.view()), Err(BnnError::NotPositiveDefinite { .. })));
        let nan = array![[1.0, 0.0], [0.0, f64::NAN]];
        assert!(matches!(
            Cholesky::new(nan.view()),
            Err(BnnError::NotPositiveDefinite { pivot: 1 })
        ));
    }
}
