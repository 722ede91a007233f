use crate::graph::{Graph, NodeId, Op};
use crate::linalg::Cholesky;
use ndarray::{Array2, Axis};
use std::f64::consts::TAU;

/// Values of every node, in insertion order.
pub fn forward(graph: &Graph, params: &[f64]) -> Vec<Array2<f64>> {
    let mut values: Vec<Array2<f64>> = Vec::with_capacity(graph.nodes.len());

    for node in &graph.nodes {
        let val = match &node.op {
            Op::Param { offset, rows, cols } => {
                let (offset, cols) = (*offset, *cols);
                Array2::from_shape_fn((*rows, cols), |(i, j)| params[offset + i * cols + j])
            }
            Op::Constant(idx) => graph.constants[*idx].clone(),
            Op::MatMul(a, b) => values[a.0].dot(&values[b.0]),
            Op::AddBias(a, b) => &values[a.0] + &values[b.0],
            Op::Activate(a, act) => values[a.0].mapv(|x| act.apply(x)),
            Op::Exp(a) => values[a.0].mapv(f64::exp),
            Op::Sum(a) => scalar(values[a.0].sum()),
            Op::ConcatCols(a, b) => {
                let (va, vb) = (&values[a.0], &values[b.0]);
                let ca = va.ncols();
                Array2::from_shape_fn((va.nrows(), ca + vb.ncols()), |(i, j)| {
                    if j < ca {
                        va[[i, j]]
                    } else {
                        vb[[i, j - ca]]
                    }
                })
            }
            Op::GatherRows { table, index } => {
                let t = &values[table.0];
                let idx = &graph.indices[*index];
                Array2::from_shape_fn((idx.len(), t.ncols()), |(i, j)| t[[idx[i], j]])
            }
            Op::TaskSlice {
                input,
                index,
                width,
            } => {
                let v = &values[input.0];
                let idx = &graph.indices[*index];
                let w = *width;
                Array2::from_shape_fn((v.nrows(), w), |(i, j)| v[[i, idx[i] * w + j]])
            }
            Op::GatherScale { scale, index } => {
                let s = &values[scale.0];
                let idx = &graph.indices[*index];
                Array2::from_shape_fn((idx.len(), 1), |(i, _)| s[[0, idx[i]]])
            }
            Op::PriorLogP { x, prior } => {
                let p = &graph.priors[*prior];
                scalar(
                    values[x.0]
                        .iter()
                        .enumerate()
                        .map(|(i, &v)| p.log_prob_elem(i, v))
                        .sum(),
                )
            }
            Op::NormalObsLogP { loc, scale, obs } => scalar(normal_obs_logp_sum(
                &values[loc.0],
                &values[scale.0],
                &graph.observed[*obs],
            )),
            Op::RbfKernel {
                z,
                lengthscale,
                scale,
                noise,
                jitter,
            } => rbf_kernel(
                &values[z.0],
                &values[lengthscale.0],
                values[scale.0][[0, 0]],
                values[noise.0][[0, 0]] + jitter,
            ),
            Op::MvnLogP { cov, obs } => scalar(mvn_logp(&values[cov.0], &graph.observed[*obs])),
        };
        values.push(val);
    }

    values
}

/// Joint log-density at `params`.
pub fn eval_logp(graph: &Graph, params: &[f64]) -> f64 {
    let values = forward(graph, params);
    total(graph, &values)
}

/// Value of one (named) node at `params`.
pub fn eval_node(graph: &Graph, params: &[f64], node: NodeId) -> Array2<f64> {
    let mut values = forward(graph, params);
    values.swap_remove(node.0)
}

fn total(graph: &Graph, values: &[Array2<f64>]) -> f64 {
    graph.logp_terms.iter().map(|id| values[id.0][[0, 0]]).sum()
}

/// Reverse-mode autodiff: gradient of total log-probability w.r.t. params.
pub fn grad_logp(graph: &Graph, params: &[f64]) -> (f64, Vec<f64>) {
    let values = forward(graph, params);
    let n = graph.nodes.len();
    let total_logp = total(graph, &values);

    let mut adj: Vec<Option<Array2<f64>>> = vec![None; n];

    // Every log-density term enters the total with weight one.
    for &id in &graph.logp_terms {
        accumulate(&mut adj[id.0], scalar(1.0));
    }

    // Reverse pass
    for node in graph.nodes.iter().rev() {
        let g = match adj[node.id.0].take() {
            Some(g) => g,
            None => continue,
        };

        match &node.op {
            Op::Param { .. } => {
                // Parameters are leaves; put the adjoint back for extraction.
                adj[node.id.0] = Some(g);
            }
            Op::Constant(_) => {}
            Op::MatMul(a, b) => {
                let da = g.dot(&values[b.0].t());
                let db = values[a.0].t().dot(&g);
                accumulate(&mut adj[a.0], da);
                accumulate(&mut adj[b.0], db);
            }
            Op::AddBias(a, b) => {
                let db = g.sum_axis(Axis(0)).insert_axis(Axis(0));
                accumulate(&mut adj[b.0], db);
                accumulate(&mut adj[a.0], g);
            }
            Op::Activate(a, act) => {
                let x = &values[a.0];
                let y = &values[node.id.0];
                let mut da = g;
                ndarray::Zip::from(&mut da)
                    .and(x)
                    .and(y)
                    .for_each(|d, &xv, &yv| *d *= act.derivative(xv, yv));
                accumulate(&mut adj[a.0], da);
            }
            Op::Exp(a) => {
                let da = g * &values[node.id.0];
                accumulate(&mut adj[a.0], da);
            }
            Op::Sum(a) => {
                let s = g[[0, 0]];
                let da = Array2::from_elem(values[a.0].raw_dim(), s);
                accumulate(&mut adj[a.0], da);
            }
            Op::ConcatCols(a, b) => {
                let ca = values[a.0].ncols();
                let da = g.slice(ndarray::s![.., ..ca]).to_owned();
                let db = g.slice(ndarray::s![.., ca..]).to_owned();
                accumulate(&mut adj[a.0], da);
                accumulate(&mut adj[b.0], db);
            }
            Op::GatherRows { table, index } => {
                let idx = &graph.indices[*index];
                let mut dt = Array2::<f64>::zeros(values[table.0].raw_dim());
                for (i, &row) in idx.iter().enumerate() {
                    let mut target = dt.row_mut(row);
                    target += &g.row(i);
                }
                accumulate(&mut adj[table.0], dt);
            }
            Op::TaskSlice {
                input,
                index,
                width,
            } => {
                let idx = &graph.indices[*index];
                let w = *width;
                let mut di = Array2::<f64>::zeros(values[input.0].raw_dim());
                for (i, &t) in idx.iter().enumerate() {
                    for j in 0..w {
                        di[[i, t * w + j]] += g[[i, j]];
                    }
                }
                accumulate(&mut adj[input.0], di);
            }
            Op::GatherScale { scale, index } => {
                let idx = &graph.indices[*index];
                let mut ds = Array2::<f64>::zeros(values[scale.0].raw_dim());
                for (i, &t) in idx.iter().enumerate() {
                    ds[[0, t]] += g[[i, 0]];
                }
                accumulate(&mut adj[scale.0], ds);
            }
            Op::PriorLogP { x, prior } => {
                let p = &graph.priors[*prior];
                let s = g[[0, 0]];
                let xv = &values[x.0];
                let cols = xv.ncols();
                let dx = Array2::from_shape_fn(xv.raw_dim(), |(i, j)| {
                    s * p.grad_elem(i * cols + j, xv[[i, j]])
                });
                accumulate(&mut adj[x.0], dx);
            }
            Op::NormalObsLogP { loc, scale, obs } => {
                let s = g[[0, 0]];
                let mu = &values[loc.0];
                let sig = &values[scale.0];
                let y = &graph.observed[*obs];
                let mut dmu = Array2::<f64>::zeros(mu.raw_dim());
                let mut dsig = Array2::<f64>::zeros(sig.raw_dim());
                for ((i, j), &m) in mu.indexed_iter() {
                    let (si, sj) = broadcast_index(sig, i, j);
                    let sv = sig[[si, sj]];
                    let diff = y[[i, j]] - m;
                    let s2 = sv * sv;
                    // d logp / d mu = (y - mu) / sigma^2
                    dmu[[i, j]] = s * diff / s2;
                    // d logp / d sigma = (y - mu)^2 / sigma^3 - 1/sigma
                    dsig[[si, sj]] += s * (diff * diff / (s2 * sv) - 1.0 / sv);
                }
                accumulate(&mut adj[loc.0], dmu);
                accumulate(&mut adj[scale.0], dsig);
            }
            Op::RbfKernel {
                z,
                lengthscale,
                scale,
                noise,
                ..
            } => {
                let zv = &values[z.0];
                let lv = &values[lengthscale.0];
                let sv = values[scale.0][[0, 0]];
                let (n, d) = zv.dim();
                let mut dz = Array2::<f64>::zeros((n, d));
                let mut dl = Array2::<f64>::zeros(lv.raw_dim());
                let mut ds = 0.0;
                let mut dnoise = 0.0;
                for i in 0..n {
                    dnoise += g[[i, i]];
                    for j in 0..n {
                        let gij = g[[i, j]];
                        if gij == 0.0 {
                            continue;
                        }
                        let r = rbf_unit(zv, lv, i, j);
                        ds += gij * r;
                        let k = sv * r;
                        for dd in 0..d {
                            let l = lv[[0, dd]];
                            let diff = zv[[i, dd]] - zv[[j, dd]];
                            dl[[0, dd]] += gij * k * diff * diff / (l * l * l);
                            let dzi = gij * k * (-diff / (l * l));
                            dz[[i, dd]] += dzi;
                            dz[[j, dd]] -= dzi;
                        }
                    }
                }
                accumulate(&mut adj[z.0], dz);
                accumulate(&mut adj[lengthscale.0], dl);
                accumulate(&mut adj[scale.0], scalar(ds));
                accumulate(&mut adj[noise.0], scalar(dnoise));
            }
            Op::MvnLogP { cov, obs } => {
                let s = g[[0, 0]];
                let k = &values[cov.0];
                // A non-PD covariance already produced -inf; nothing to propagate.
                if let Ok(chol) = Cholesky::new(k.view()) {
                    let y = &graph.observed[*obs];
                    let alpha = chol.solve(y.view());
                    let k_inv = chol.inverse();
                    // d logp / dK = ½(ααᵀ - K⁻¹)
                    let dk = (alpha.dot(&alpha.t()) - k_inv) * (0.5 * s);
                    accumulate(&mut adj[cov.0], dk);
                }
            }
        }
    }

    // Scatter parameter adjoints into the flat gradient.
    let mut grad = vec![0.0; graph.param_count];
    for node in &graph.nodes {
        if let Op::Param { offset, .. } = node.op {
            if let Some(a) = &adj[node.id.0] {
                for (k, v) in a.iter().enumerate() {
                    grad[offset + k] = *v;
                }
            }
        }
    }

    (total_logp, grad)
}

/// Reusable log-density + gradient evaluator used by the sampler.
#[derive(Debug, Clone)]
pub struct Evaluator {
    pub total_logp: f64,
    pub grad: Vec<f64>,
}

impl Evaluator {
    pub fn new(graph: &Graph) -> Self {
        Self {
            total_logp: f64::NEG_INFINITY,
            grad: vec![0.0; graph.param_count],
        }
    }

    pub fn compute(&mut self, graph: &Graph, q: &[f64]) {
        let (logp, grad) = grad_logp(graph, q);
        self.total_logp = logp;
        self.grad = grad;
    }
}

fn accumulate(slot: &mut Option<Array2<f64>>, incoming: Array2<f64>) {
    match slot {
        Some(existing) => *existing += &incoming,
        None => *slot = Some(incoming),
    }
}

fn scalar(v: f64) -> Array2<f64> {
    Array2::from_elem((1, 1), v)
}

#[inline]
fn broadcast_index(scale: &Array2<f64>, i: usize, j: usize) -> (usize, usize) {
    let (r, c) = scale.dim();
    (if r == 1 { 0 } else { i }, if c == 1 { 0 } else { j })
}

fn normal_obs_logp_sum(mu: &Array2<f64>, sigma: &Array2<f64>, obs: &Array2<f64>) -> f64 {
    let half_log_tau = 0.5 * TAU.ln();
    mu.indexed_iter()
        .map(|((i, j), &m)| {
            let (si, sj) = broadcast_index(sigma, i, j);
            let s = sigma[[si, sj]];
            let d = (obs[[i, j]] - m) / s;
            -0.5 * d * d - s.ln() - half_log_tau
        })
        .sum()
}

#[inline]
fn rbf_unit(z: &Array2<f64>, lengthscale: &Array2<f64>, i: usize, j: usize) -> f64 {
    let mut r2 = 0.0;
    for d in 0..z.ncols() {
        let diff = (z[[i, d]] - z[[j, d]]) / lengthscale[[0, d]];
        r2 += diff * diff;
    }
    (-0.5 * r2).exp()
}

fn rbf_kernel(z: &Array2<f64>, lengthscale: &Array2<f64>, scale: f64, diag: f64) -> Array2<f64> {
    let n = z.nrows();
    Array2::from_shape_fn((n, n), |(i, j)| {
        let k = scale * rbf_unit(z, lengthscale, i, j);
        if i == j {
            k + diag
        } else {
            k
        }
    })
}

fn mvn_logp(cov: &Array2<f64>, obs: &Array2<f64>) -> f64 {
    let Ok(chol) = Cholesky::new(cov.view()) else {
        return f64::NEG_INFINITY;
    };
    let n = obs.nrows() as f64;
    -0.5 * chol.quad_form(obs.view()) - 0.5 * chol.log_det() - 0.5 * n * TAU.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Prior;
    use crate::graph::Graph;
    use crate::nn::Activation;
    use ndarray::array;

    fn check_gradient(g: &Graph, params: &[f64]) {
        let (_, grad) = grad_logp(g, params);
        let eps = 1e-6;
        for k in 0..params.len() {
            let mut plus = params.to_vec();
            let mut minus = params.to_vec();
            plus[k] += eps;
            minus[k] -= eps;
            let fd = (eval_logp(g, &plus) - eval_logp(g, &minus)) / (2.0 * eps);
            assert!(
                (grad[k] - fd).abs() < 1e-4 * (1.0 + fd.abs()),
                "param {}: analytic={}, numerical={}",
                k,
                grad[k],
                fd
            );
        }
    }

    #[test]
    fn test_normal_prior_gradient() {
        let mut g = Graph::new();
        Prior::normal(0.0, 1.0).register(&mut g, "x", &[]).unwrap();

        let params = vec![1.5];
        let (logp, grad) = grad_logp(&g, &params);

        assert!((logp - (-0.5 * 1.5_f64.powi(2) - 0.5 * TAU.ln())).abs() < 1e-10);
        assert!((grad[0] - (-1.5)).abs() < 1e-10);
    }

    #[test]
    fn test_dense_layer_gradient() {
        let mut g = Graph::new();
        let x = g.add_constant(array![[0.5, -1.0], [1.5, 0.3], [-0.7, 0.9]]);
        let w = Prior::normal(0.0, 1.0).register(&mut g, "Dense0.kernel", &[2, 3]).unwrap();
        let b = Prior::cauchy(0.0, 1.0).register(&mut g, "Dense0.bias", &[3]).unwrap();
        let h = g.matmul(x, w);
        let h = g.add_bias(h, b);
        let h = g.activate(h, Activation::Tanh);
        let w1 = Prior::normal(0.0, 1.0).register(&mut g, "Dense1.kernel", &[3, 1]).unwrap();
        let mu = g.matmul(h, w1);
        let sig = Prior::half_normal(1.0).register(&mut g, "sig", &[]).unwrap();
        let obs = g.add_observed(array![[0.1], [0.8], [-0.4]]);
        g.normal_obs_logp(mu, sig, obs);

        let params: Vec<f64> = (0..g.param_count).map(|i| ((i as f64) * 0.37).sin() * 0.8).collect();
        check_gradient(&g, &params);
    }

    #[test]
    fn test_heteroskedastic_and_activations_gradient() {
        for act in [
            Activation::Relu,
            Activation::Silu,
            Activation::Sigmoid,
            Activation::Softplus,
        ] {
            let mut g = Graph::new();
            let x = g.add_constant(array![[0.5, -1.0], [1.5, 0.3]]);
            let w = Prior::normal(0.0, 1.0).register(&mut g, "w", &[2, 2]).unwrap();
            let h = g.matmul(x, w);
            let h = g.activate(h, act);
            let wm = Prior::normal(0.0, 1.0).register(&mut g, "wm", &[2, 1]).unwrap();
            let wv = Prior::normal(0.0, 1.0).register(&mut g, "wv", &[2, 1]).unwrap();
            let mu = g.matmul(h, wm);
            let v = g.matmul(h, wv);
            let sig = g.activate(v, Activation::Softplus);
            let obs = g.add_observed(array![[0.2], [-0.3]]);
            g.normal_obs_logp(mu, sig, obs);
            let params = vec![0.3, -0.4, 0.25, 0.7, 0.5, -0.2, 0.1, 0.9];
            check_gradient(&g, &params);
        }
    }

    #[test]
    fn test_task_gather_gradient() {
        let mut g = Graph::new();
        let table = Prior::normal(0.0, 1.0).register(&mut g, "emb", &[3, 2]).unwrap();
        let tasks = g.add_indices(vec![0, 2, 2, 1]);
        let e = g.gather_rows(table, tasks);
        let x = g.add_constant(array![[1.0], [0.5], [-0.5], [2.0]]);
        let xe = g.concat_cols(x, e);
        let w = Prior::normal(0.0, 1.0).register(&mut g, "w", &[3, 3]).unwrap();
        let out = g.matmul(xe, w);
        let mu = g.task_slice(out, tasks, 1);
        let sig = Prior::half_normal(1.0).register(&mut g, "sig", &[3]).unwrap();
        let sig_rows = g.gather_scale(sig, tasks);
        let obs = g.add_observed(array![[0.1], [0.4], [-0.3], [1.1]]);
        g.normal_obs_logp(mu, sig_rows, obs);

        let params: Vec<f64> = (0..g.param_count).map(|i| ((i as f64) * 0.61).cos() * 0.5).collect();
        check_gradient(&g, &params);
    }

    #[test]
    fn test_rbf_mvn_gradient() {
        let mut g = Graph::new();
        let x = g.add_constant(array![[0.1, 0.3], [0.8, -0.2], [-0.5, 0.4], [0.2, 0.9]]);
        let w = Prior::normal(0.0, 1.0).register(&mut g, "w", &[2, 2]).unwrap();
        let z = g.matmul(x, w);
        let l = Prior::log_normal(0.0, 1.0).register(&mut g, "k_length", &[2]).unwrap();
        let s = Prior::log_normal(0.0, 1.0).register(&mut g, "k_scale", &[]).unwrap();
        let noise = Prior::half_normal(1.0).register(&mut g, "noise", &[]).unwrap();
        let k = g.rbf_kernel(z, l, s, noise, 1e-6);
        let obs = g.add_observed(array![[0.3], [-0.1], [0.5], [0.2]]);
        g.mvn_logp(k, obs);

        let params = vec![0.6, -0.3, 0.2, 0.9, 0.1, -0.2, 0.3, -1.0];
        check_gradient(&g, &params);
    }

    #[test]
    fn test_evaluator_matches_grad_logp() {
        let mut g = Graph::new();
        Prior::normal(1.0, 2.0).register(&mut g, "a", &[3]).unwrap();
        let q = vec![0.1, 0.2, 0.3];
        let mut ev = Evaluator::new(&g);
        ev.compute(&g, &q);
        let (lp, grad) = grad_logp(&g, &q);
        assert_eq!(ev.total_logp, lp);
        assert_eq!(ev.grad, grad);
    }
}
