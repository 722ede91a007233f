//! Gaussian-process head over learned features: ARD RBF kernel and the
//! exact posterior conditioned on training data.

use crate::error::{BnnError, Result};
use crate::linalg::{self, Cholesky};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Kernel hyperparameters of one posterior sample.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelParams {
    pub lengthscale: Array1<f64>,
    pub scale: f64,
    pub noise: f64,
}

/// `scale · exp(-½ Σ_d ((a_id - b_jd) / l_d)²)`
pub fn rbf(a: ArrayView2<f64>, b: ArrayView2<f64>, lengthscale: ArrayView1<f64>, scale: f64) -> Result<Array2<f64>> {
    if a.ncols() != b.ncols() || a.ncols() != lengthscale.len() {
        return Err(BnnError::DimensionMismatch {
            context: "kernel feature width".into(),
            expected: lengthscale.len(),
            got: a.ncols().max(b.ncols()),
        });
    }
    Ok(Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
        let mut r2 = 0.0;
        for d in 0..lengthscale.len() {
            let diff = (a[[i, d]] - b[[j, d]]) / lengthscale[d];
            r2 += diff * diff;
        }
        scale * (-0.5 * r2).exp()
    }))
}

/// Posterior mean and covariance at `z_new` given training features and targets.
///
/// With `noiseless` the returned covariance is that of the latent function;
/// otherwise the observation noise is added to its diagonal.
pub fn posterior(
    z_train: ArrayView2<f64>,
    y_train: ArrayView1<f64>,
    z_new: ArrayView2<f64>,
    kernel: &KernelParams,
    jitter: f64,
    noiseless: bool,
) -> Result<(Array1<f64>, Array2<f64>)> {
    if z_train.nrows() != y_train.len() {
        return Err(BnnError::RowMismatch {
            x_rows: z_train.nrows(),
            y_rows: y_train.len(),
        });
    }
    let ls = kernel.lengthscale.view();
    let mut k_train = rbf(z_train, z_train, ls, kernel.scale)?;
    linalg::add_diagonal(&mut k_train, kernel.noise + jitter);
    let chol = Cholesky::new(k_train.view())?;

    let k_cross = rbf(z_train, z_new, ls, kernel.scale)?;
    let alpha = chol.solve(linalg::column(y_train.to_owned()).view());
    let mean = k_cross.t().dot(&alpha).column(0).to_owned();

    let mut cov = rbf(z_new, z_new, ls, kernel.scale)? - k_cross.t().dot(&chol.solve(k_cross.view()));
    linalg::add_diagonal(&mut cov, if noiseless { jitter } else { kernel.noise + jitter });
    Ok((mean, cov))
}

/// One draw from `N(mean, cov)`.
pub fn sample_mvn<R: Rng + ?Sized>(mean: ArrayView1<f64>, cov: ArrayView2<f64>, rng: &mut R) -> Result<Array1<f64>> {
    let l = Cholesky::new(cov)?.lower();
    let z: Array1<f64> = (0..mean.len()).map(|_| StandardNormal.sample(rng)).collect();
    Ok(&mean + &l.dot(&z))
}
