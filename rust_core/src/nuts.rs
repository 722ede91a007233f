//! No-U-Turn Sampler after Hoffman & Gelman (2014), with multinomial
//! selection of the proposal along the trajectory (Betancourt 2017).
//!
//! The trajectory doubles in a random direction until the endpoints turn
//! back on each other, an energy error above [`MAX_DELTA_H`] marks the
//! transition divergent, or `max_tree_depth` doublings have been made.
//!
//! A [`NutsChain`] owns its state and advances one transition per
//! [`step`](NutsChain::step), so callers decide how chains are interleaved.

use crate::autodiff::Evaluator;
use crate::error::{BnnError, Result};
use crate::graph::Graph;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

/// Energy error beyond which a leapfrog step counts as divergent.
pub const MAX_DELTA_H: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct NutsSettings {
    pub num_warmup: usize,
    pub max_tree_depth: usize,
    pub target_accept: f64,
    /// Initial step size; searched heuristically when `None`.
    pub step_size: Option<f64>,
}

impl Default for NutsSettings {
    fn default() -> Self {
        Self {
            num_warmup: 500,
            max_tree_depth: 10,
            target_accept: 0.8,
            step_size: None,
        }
    }
}

/// Outcome of one NUTS iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Unconstrained position after the iteration.
    pub position: Vec<f64>,
    pub accept_prob: f64,
    pub diverging: bool,
    /// Step size used for this iteration.
    pub step_size: f64,
    pub tree_depth: usize,
    /// Leapfrog steps taken.
    pub num_steps: usize,
    /// Negative log-density at `position`.
    pub potential_energy: f64,
    /// Hamiltonian of the selected phase point.
    pub energy: f64,
    pub warmup: bool,
}

/// Position, momentum, and the log-density with its gradient at the position.
#[derive(Clone)]
struct PhasePoint {
    q: Vec<f64>,
    p: Vec<f64>,
    grad: Vec<f64>,
    logp: f64,
}

impl PhasePoint {
    /// Hamiltonian under a diagonal inverse mass.
    fn hamiltonian(&self, inv_mass: &[f64]) -> f64 {
        let kinetic = 0.5 * self.p.iter().zip(inv_mass).map(|(p, m)| p * p * m).sum::<f64>();
        kinetic - self.logp
    }
}

/// A balanced subtree of `2^depth` leapfrog steps.
struct TreeResult {
    left: PhasePoint,
    right: PhasePoint,
    /// Multinomial-selected candidate among the subtree's leaves.
    proposal: PhasePoint,
    /// Log of the sum of leaf weights.
    log_sum_weight: f64,
    /// Sum over leaves of min(1, exp(-ΔH)).
    sum_accept: f64,
    depth: usize,
    n_leapfrog: usize,
    turning: bool,
    diverging: bool,
}

struct TreeStats {
    diverging: bool,
    mean_accept_prob: f64,
    depth: usize,
    n_leapfrog: usize,
}

/// Nesterov dual averaging of log step size.
#[derive(Debug, Clone)]
struct DualAveraging {
    target: f64,
    mu: f64,
    log_eps_bar: f64,
    h_bar: f64,
    count: u64,
}

impl DualAveraging {
    const GAMMA: f64 = 0.05;
    const T0: f64 = 10.0;
    const KAPPA: f64 = 0.75;

    fn new(step_size: f64, target: f64) -> Self {
        Self {
            target,
            mu: (10.0 * step_size).ln(),
            log_eps_bar: step_size.ln(),
            h_bar: 0.0,
            count: 0,
        }
    }

    /// Feed one acceptance statistic, return the next step size.
    fn update(&mut self, accept_stat: f64) -> f64 {
        self.count += 1;
        let m = self.count as f64;
        let w = 1.0 / (m + Self::T0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.target - accept_stat);
        let log_eps = self.mu - (m.sqrt() / Self::GAMMA) * self.h_bar;
        let m_pow = m.powf(-Self::KAPPA);
        self.log_eps_bar = m_pow * log_eps + (1.0 - m_pow) * self.log_eps_bar;
        log_eps.exp()
    }

    fn final_step_size(&self) -> f64 {
        self.log_eps_bar.exp()
    }
}

/// Running first and second moments of warmup positions.
#[derive(Debug, Clone)]
struct WindowStats {
    sum: Vec<f64>,
    sq_sum: Vec<f64>,
    count: usize,
}

impl WindowStats {
    fn new(dim: usize) -> Self {
        Self {
            sum: vec![0.0; dim],
            sq_sum: vec![0.0; dim],
            count: 0,
        }
    }

    fn push(&mut self, q: &[f64]) {
        for (i, &v) in q.iter().enumerate() {
            self.sum[i] += v;
            self.sq_sum[i] += v * v;
        }
        self.count += 1;
    }
}

/// One NUTS chain with diagonal mass matrix adaptation.
///
/// Warmup:
/// the first 15% of warmup tunes the step size under a unit mass, the next
/// 75% also records positions whose variances become the diagonal mass, and
/// the last 10% retunes the step size under that mass.
pub struct NutsChain<'g> {
    graph: &'g Graph,
    settings: NutsSettings,
    evaluator: Evaluator,
    rng: ChaCha8Rng,
    current: PhasePoint,
    inv_mass_diag: Vec<f64>,
    mass_sqrt: Vec<f64>,
    step_size: f64,
    adaptation: DualAveraging,
    window: WindowStats,
    phase1_end: usize,
    phase2_end: usize,
    iteration: usize,
}

impl<'g> NutsChain<'g> {
    /// Start a chain at `init`. Fails if the log-density or its gradient is
    /// not finite there.
    pub fn new(graph: &'g Graph, init: Vec<f64>, settings: NutsSettings, mut rng: ChaCha8Rng) -> Result<Self> {
        let dim = graph.param_count;
        if init.len() != dim {
            return Err(BnnError::DimensionMismatch {
                context: "initial position".into(),
                expected: dim,
                got: init.len(),
            });
        }
        let mut evaluator = Evaluator::new(graph);
        evaluator.compute(graph, &init[..]);
        if !evaluator.total_logp.is_finite() || evaluator.grad.iter().any(|g| !g.is_finite()) {
            return Err(BnnError::InitialPoint {
                chain: 0,
                reason: format!("log density {} at the initial point", evaluator.total_logp),
            });
        }
        let inv_mass_diag = vec![1.0f64; dim];
        let mass_sqrt = vec![1.0f64; dim];
        let step_size = match settings.step_size {
            Some(eps) if eps > 0.0 => eps,
            _ => initial_step_size(graph, &mut evaluator, &init, &inv_mass_diag, &mass_sqrt, &mut rng),
        };
        evaluator.compute(graph, &init);
        let current = PhasePoint {
            p: vec![0.0; dim],
            logp: evaluator.total_logp,
            grad: evaluator.grad.to_vec(),
            q: init,
        };
        Ok(Self {
            graph,
            adaptation: DualAveraging::new(step_size, settings.target_accept),
            phase1_end: settings.num_warmup * 15 / 100,
            phase2_end: settings.num_warmup * 90 / 100,
            settings,
            evaluator,
            rng,
            current,
            inv_mass_diag,
            mass_sqrt,
            step_size,
            window: WindowStats::new(dim),
            iteration: 0,
        })
    }

    pub fn position(&self) -> &[f64] {
        &self.current.q
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    pub fn inverse_mass(&self) -> &[f64] {
        &self.inv_mass_diag
    }

    /// Iterations run so far, warmup included.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Advance one iteration.
    pub fn step(&mut self) -> Transition {
        let iter = self.iteration;
        let is_warmup = iter < self.settings.num_warmup;
        let step_size = self.step_size;

        for (p, m) in self.current.p.iter_mut().zip(&self.mass_sqrt) {
            *p = m * self.rng.sample::<f64, _>(StandardNormal);
        }
        let h0 = self.current.hamiltonian(&self.inv_mass_diag);

        let (proposal, stats) = build_trajectory(
            self.graph,
            &mut self.evaluator,
            &self.current,
            step_size,
            &self.inv_mass_diag,
            h0,
            self.settings.max_tree_depth,
            &mut self.rng,
        );

        // The multinomial weighting already accounts for acceptance; only a
        // divergence keeps the chain in place.
        let energy = if stats.diverging {
            h0
        } else {
            let e = proposal.hamiltonian(&self.inv_mass_diag);
            self.current.q.copy_from_slice(&proposal.q);
            self.current.grad.copy_from_slice(&proposal.grad);
            self.current.logp = proposal.logp;
            e
        };

        if is_warmup {
            self.adapt(iter, stats.mean_accept_prob);
        }
        if self.settings.num_warmup > 0 && iter == self.settings.num_warmup - 1 {
            self.step_size = self.adaptation.final_step_size();
        }
        self.iteration += 1;

        Transition {
            position: self.current.q.clone(),
            accept_prob: stats.mean_accept_prob,
            diverging: stats.diverging,
            step_size,
            tree_depth: stats.depth,
            num_steps: stats.n_leapfrog,
            potential_energy: -self.current.logp,
            energy,
            warmup: is_warmup,
        }
    }

    fn adapt(&mut self, iter: usize, accept_stat: f64) {
        self.step_size = self.adaptation.update(accept_stat);

        if iter >= self.phase1_end && iter < self.phase2_end {
            self.window.push(&self.current.q);
        }

        if iter == self.phase2_end && self.window.count > 10 {
            let n = self.window.count as f64;
            for i in 0..self.inv_mass_diag.len() {
                let mean = self.window.sum[i] / n;
                let var = self.window.sq_sum[i] / n - mean * mean;
                // Inverse metric is the posterior variance; momenta draw from N(0, 1/var).
                if var > 1e-8 {
                    self.inv_mass_diag[i] = var;
                    self.mass_sqrt[i] = 1.0 / var.sqrt();
                }
            }
            let eps = initial_step_size(
                self.graph,
                &mut self.evaluator,
                &self.current.q,
                &self.inv_mass_diag,
                &self.mass_sqrt,
                &mut self.rng,
            );
            self.step_size = eps;
            self.adaptation = DualAveraging::new(eps, self.settings.target_accept);
            self.evaluator.compute(self.graph, &self.current.q);
            self.current.logp = self.evaluator.total_logp;
            self.current.grad.copy_from_slice(&self.evaluator.grad);
        }
    }
}

/// One NUTS transition from `initial`.
///
/// At each depth j the new subtree has 2^j leaves, added forward (+ε) or
/// backward (-ε) at random. Stops on a U-turn across the full tree, a
/// divergence, or at `max_depth`.
#[allow(clippy::too_many_arguments)]
fn build_trajectory(
    graph: &Graph,
    evaluator: &mut Evaluator,
    initial: &PhasePoint,
    eps: f64,
    inv_mass: &[f64],
    h0: f64,
    max_depth: usize,
    rng: &mut ChaCha8Rng,
) -> (PhasePoint, TreeStats) {
    let (mut left, mut right, mut proposal) = (initial.clone(), initial.clone(), initial.clone());
    let mut log_sum_weight = 0.0;
    let (mut depth, mut n_leapfrog) = (0, 0);
    let mut accept_total = 0.0;
    let mut diverging = false;

    while depth < max_depth {
        let forward = rng.gen::<bool>();
        let subtree = if forward {
            build_subtree(graph, evaluator, &right, eps, inv_mass, h0, depth, rng)
        } else {
            build_subtree(graph, evaluator, &left, -eps, inv_mass, h0, depth, rng)
        };

        n_leapfrog += subtree.n_leapfrog;
        accept_total += subtree.sum_accept;
        depth += 1;

        if subtree.diverging {
            diverging = true;
            break;
        }
        if subtree.turning {
            break;
        }

        // Biased progressive sampling favours the newer subtree.
        let take_new = (subtree.log_sum_weight - log_sum_weight).min(0.0).exp();
        if rng.gen::<f64>() < take_new {
            proposal = subtree.proposal;
        }
        log_sum_weight = logaddexp(log_sum_weight, subtree.log_sum_weight);

        if forward {
            right = subtree.right;
        } else {
            left = subtree.left;
        }

        if is_turning(&left, &right, inv_mass) {
            break;
        }
    }

    let mean_accept_prob = if n_leapfrog == 0 { 0.0 } else { (accept_total / n_leapfrog as f64).min(1.0) };
    let stats = TreeStats {
        diverging,
        mean_accept_prob,
        depth,
        n_leapfrog,
    };
    (proposal, stats)
}

/// Depth zero is a single leapfrog step; deeper trees join two halves of
/// `depth - 1`, the second starting where the first ended.
#[allow(clippy::too_many_arguments)]
fn build_subtree(
    graph: &Graph,
    evaluator: &mut Evaluator,
    point: &PhasePoint,
    eps: f64,
    inv_mass: &[f64],
    h0: f64,
    depth: usize,
    rng: &mut ChaCha8Rng,
) -> TreeResult {
    if depth == 0 {
        let next = leapfrog(graph, evaluator, point, eps, inv_mass);
        let delta_h = next.hamiltonian(inv_mass) - h0;
        let diverging = !delta_h.is_finite() || delta_h > MAX_DELTA_H;
        let sum_accept = if delta_h.is_finite() { (-delta_h).exp().min(1.0) } else { 0.0 };

        return TreeResult {
            left: next.clone(),
            right: next.clone(),
            proposal: next,
            log_sum_weight: if diverging { f64::NEG_INFINITY } else { -delta_h },
            sum_accept,
            depth: 0,
            n_leapfrog: 1,
            turning: false,
            diverging,
        };
    }

    let inner = build_subtree(graph, evaluator, point, eps, inv_mass, h0, depth - 1, rng);
    if inner.turning || inner.diverging {
        return inner;
    }

    let edge = if eps < 0.0 { &inner.left } else { &inner.right };
    let outer = build_subtree(graph, evaluator, edge, eps, inv_mass, h0, depth - 1, rng);
    let n_leapfrog = outer.n_leapfrog + inner.n_leapfrog;
    let sum_accept = outer.sum_accept + inner.sum_accept;

    if outer.diverging {
        return TreeResult {
            left: inner.left,
            right: inner.right,
            proposal: inner.proposal,
            log_sum_weight: inner.log_sum_weight,
            sum_accept,
            depth,
            n_leapfrog,
            turning: false,
            diverging: true,
        };
    }

    let log_sum_weight = logaddexp(inner.log_sum_weight, outer.log_sum_weight);
    // Uniform progressive sampling within a subtree.
    let proposal = if rng.gen::<f64>() < (outer.log_sum_weight - log_sum_weight).exp() {
        outer.proposal
    } else {
        inner.proposal
    };
    let (left, right) = if eps < 0.0 {
        (outer.left, inner.right)
    } else {
        (inner.left, outer.right)
    };
    let turning = outer.turning || is_turning(&left, &right, inv_mass);

    TreeResult {
        left,
        right,
        proposal,
        log_sum_weight,
        sum_accept,
        depth,
        n_leapfrog,
        turning,
        diverging: false,
    }
}

/// Velocity Verlet step of size `eps`.
fn leapfrog(graph: &Graph, evaluator: &mut Evaluator, point: &PhasePoint, eps: f64, inv_mass: &[f64]) -> PhasePoint {
    let half = 0.5 * eps;
    let mut p: Vec<f64> = point.p.iter().zip(&point.grad).map(|(p, g)| p + half * g).collect();
    let q: Vec<f64> = point
        .q
        .iter()
        .zip(&p)
        .zip(inv_mass)
        .map(|((q, p), m)| q + eps * m * p)
        .collect();
    evaluator.compute(graph, &q[..]);
    let grad = evaluator.grad.to_vec();
    p.iter_mut().zip(&grad).for_each(|(p, g)| *p += half * g);
    PhasePoint {
        logp: evaluator.total_logp,
        q,
        p,
        grad,
    }
}

/// True when the velocity at either end points back toward the other end.
fn is_turning(left: &PhasePoint, right: &PhasePoint, inv_mass: &[f64]) -> bool {
    let span = right.q.iter().zip(&left.q).map(|(r, l)| r - l);
    let (mut toward_left, mut toward_right) = (0.0, 0.0);
    for ((dq, m), (pl, pr)) in span.zip(inv_mass).zip(left.p.iter().zip(&right.p)) {
        toward_left += dq * m * pl;
        toward_right += dq * m * pr;
    }
    toward_left < 0.0 || toward_right < 0.0
}

fn logaddexp(a: f64, b: f64) -> f64 {
    let hi = a.max(b);
    if hi == f64::NEG_INFINITY {
        return hi;
    }
    hi + ((a - hi).exp() + (b - hi).exp()).ln()
}

/// Double or halve a trial step size until one leapfrog step crosses an
/// acceptance ratio of 1/2.
fn initial_step_size(
    graph: &Graph,
    evaluator: &mut Evaluator,
    q: &[f64],
    inv_mass_diag: &[f64],
    mass_sqrt: &[f64],
    rng: &mut ChaCha8Rng,
) -> f64 {
    evaluator.compute(graph, q);
    let start = PhasePoint {
        q: q.to_vec(),
        p: mass_sqrt.iter().map(|m| m * rng.sample::<f64, _>(StandardNormal)).collect(),
        grad: evaluator.grad.to_vec(),
        logp: evaluator.total_logp,
    };
    let h0 = start.hamiltonian(inv_mass_diag);
    let log_half = -std::f64::consts::LN_2;
    let log_ratio = |evaluator: &mut Evaluator, eps: f64| {
        h0 - leapfrog(graph, evaluator, &start, eps, inv_mass_diag).hamiltonian(inv_mass_diag)
    };

    let mut eps = 1.0;
    let grow = log_ratio(evaluator, eps) > log_half;
    for _ in 0..50 {
        let lr = log_ratio(evaluator, eps);
        if !lr.is_finite() {
            eps *= 0.5;
            break;
        }
        if (grow && lr < log_half) || (!grow && lr > log_half) {
            break;
        }
        eps = if grow { eps * 2.0 } else { eps * 0.5 };
    }

    eps.clamp(1e-10, 1e3)
}
