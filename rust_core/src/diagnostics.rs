//! Convergence diagnostics for posterior samples: split R-hat, bulk and tail
//! ESS, Monte Carlo standard error and central intervals.
//!
//! Definitions follow Vehtari et al. (2021), "Rank-normalization, folding,
//! and localization: An improved R-hat for assessing convergence of MCMC".

use crate::error::{BnnError, Result};
use crate::sampler::McmcRun;
use crate::samples::PosteriorSamples;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};

/// Summary of one scalar element of a site.
#[derive(Debug, Clone)]
pub struct ParamDiagnostics {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub hdi_3: f64,
    pub hdi_97: f64,
    pub ess_bulk: f64,
    pub ess_tail: f64,
    pub r_hat: f64,
    pub mcse_mean: f64,
}

#[derive(Debug, Clone)]
pub struct DiagnosticsReport {
    pub params: Vec<ParamDiagnostics>,
    pub num_chains: usize,
    pub num_draws: usize,
    pub accept_rates: Vec<f64>,
    pub divergences: usize,
}

fn fmt_ess(v: f64) -> String {
    if v.is_finite() {
        format!("{v:.0}")
    } else {
        "NaN".to_string()
    }
}

impl DiagnosticsReport {
    /// Plain-text table, one row per element.
    pub fn to_table(&self) -> String {
        let width = self.params.iter().map(|p| p.name.len()).max().unwrap_or(0).max(12);
        let rule = "─".repeat(width + 84);
        let mut lines = vec![
            format!("{} chains × {} draws per chain", self.num_chains, self.num_draws),
            String::new(),
            format!(
                "{:<width$} {:>8} {:>8} {:>10} {:>10} {:>10} {:>10} {:>8} {:>10}",
                "site", "mean", "std", "hdi_3%", "hdi_97%", "ess_bulk", "ess_tail", "r_hat", "mcse_mean"
            ),
            rule.clone(),
        ];
        lines.extend(self.params.iter().map(|p| {
            format!(
                "{:<width$} {:>8.4} {:>8.4} {:>10.4} {:>10.4} {:>10} {:>10} {:>8.4} {:>10.6}",
                p.name,
                p.mean,
                p.std,
                p.hdi_3,
                p.hdi_97,
                fmt_ess(p.ess_bulk),
                fmt_ess(p.ess_tail),
                p.r_hat,
                p.mcse_mean,
            )
        }));
        lines.push(rule);

        let accept = if self.accept_rates.is_empty() {
            f64::NAN
        } else {
            self.accept_rates.iter().sum::<f64>() / self.accept_rates.len() as f64
        };
        lines.push(format!("Mean accept rate: {accept:.2}  │  Divergences: {}", self.divergences));

        if self.params.iter().any(|p| p.r_hat > 1.05 || !p.r_hat.is_finite()) {
            lines.push("⚠  R-hat above 1.05 for some elements; chains may not have mixed.".into());
        }
        if self.params.iter().any(|p| p.ess_bulk < 400.0 || p.ess_tail < 400.0) {
            lines.push("⚠  ESS below 400 for some elements; draw more samples.".into());
        }
        if self.divergences > 0 {
            lines.push(format!("⚠  {} divergent transitions after warmup.", self.divergences));
        }
        lines.join("\n")
    }
}

/// Diagnostics for every scalar element of every site, e.g. `Dense0.kernel[1,0]`.
///
/// Flat samples are regrouped into the run's chains. Chains shorter than four
/// draws have undefined split statistics; those entries are NaN.
pub fn compute_diagnostics(samples: &PosteriorSamples, run: &McmcRun) -> Result<DiagnosticsReport> {
    let grouped;
    let samples = if samples.has_chain_dim() {
        samples
    } else {
        grouped = samples.group_by_chain(run.num_chains().max(1))?;
        &grouped
    };
    let n_chains = samples.num_chains();
    let n_draws = samples.num_samples() / n_chains.max(1);

    let mut params = Vec::new();
    for (name, value) in samples.iter() {
        let site_shape = &value.shape()[2..];
        let per_element: usize = site_shape.iter().product();
        let flat = value
            .to_shape((n_chains, n_draws, per_element))
            .map_err(|e| BnnError::InvalidConfig(format!("site `{name}`: {e}")))?;
        for e in 0..per_element {
            params.push(summarize(element_name(name, site_shape, e), flat.slice(s![.., .., e])));
        }
    }

    Ok(DiagnosticsReport {
        params,
        num_chains: n_chains,
        num_draws: n_draws,
        accept_rates: run.accept_rates.clone(),
        divergences: run.total_divergences(),
    })
}

fn element_name(site: &str, shape: &[usize], flat_index: usize) -> String {
    if shape.is_empty() {
        return site.to_string();
    }
    let mut rest = flat_index;
    let mut idx = vec![0; shape.len()];
    for (slot, &dim) in idx.iter_mut().zip(shape).rev() {
        *slot = rest % dim;
        rest /= dim;
    }
    let idx: Vec<String> = idx.iter().map(ToString::to_string).collect();
    format!("{site}[{}]", idx.join(","))
}

/// `draws` is `chains × draws`.
fn summarize(name: String, draws: ArrayView2<f64>) -> ParamDiagnostics {
    let mean = draws.mean().unwrap_or(f64::NAN);
    let std = if draws.len() > 1 { draws.std(1.0) } else { 0.0 };
    let sorted = sorted_values(draws);
    let (ess_bulk, ess_tail, r_hat) = if draws.ncols() >= 4 {
        (ess_bulk(draws), ess_tail(draws, &sorted), split_r_hat(draws))
    } else {
        (f64::NAN, f64::NAN, f64::NAN)
    };
    ParamDiagnostics {
        name,
        mean,
        std,
        hdi_3: quantile_sorted(&sorted, 0.03),
        hdi_97: quantile_sorted(&sorted, 0.97),
        ess_bulk,
        ess_tail,
        r_hat,
        mcse_mean: if ess_bulk > 0.0 { std / ess_bulk.sqrt() } else { f64::NAN },
    }
}

fn sorted_values(draws: ArrayView2<f64>) -> Vec<f64> {
    let mut all: Vec<f64> = draws.iter().copied().collect();
    all.sort_unstable_by(f64::total_cmp);
    all
}

/// Linear interpolation between order statistics.
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let Some(last) = sorted.len().checked_sub(1) else {
        return f64::NAN;
    };
    let pos = q * last as f64;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(last);
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Each chain cut into two halves, giving `2m` rows; an odd middle draw is dropped.
fn split_halves(draws: ArrayView2<f64>) -> Array2<f64> {
    let (m, n) = draws.dim();
    let half = n / 2;
    let mut out = Array2::zeros((2 * m, half));
    for (c, chain) in draws.outer_iter().enumerate() {
        out.row_mut(2 * c).assign(&chain.slice(s![..half]));
        out.row_mut(2 * c + 1).assign(&chain.slice(s![n - half..]));
    }
    out
}

/// Mean within-chain variance `W` and between-chain variance `B` of split chains.
fn within_between(split: &Array2<f64>) -> (f64, f64) {
    let (m, n) = split.dim();
    let means = split.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(m));
    let w = split.var_axis(Axis(1), 1.0).mean().unwrap_or(f64::NAN);
    let b = if m > 1 { n as f64 * means.var(1.0) } else { 0.0 };
    (w, b)
}

fn split_r_hat(draws: ArrayView2<f64>) -> f64 {
    let split = split_halves(draws);
    let n = split.ncols() as f64;
    let (w, b) = within_between(&split);
    if w.is_nan() || w < 1e-30 {
        return f64::NAN;
    }
    let var_plus = (n - 1.0) / n * w + b / n;
    (var_plus / w).sqrt()
}

fn ess_bulk(draws: ArrayView2<f64>) -> f64 {
    ess(rank_normalize(draws).view())
}

/// Smaller of the ESS of the 5% and 95% tail indicators.
fn ess_tail(draws: ArrayView2<f64>, sorted: &[f64]) -> f64 {
    let q05 = quantile_sorted(sorted, 0.05);
    let q95 = quantile_sorted(sorted, 0.95);
    let lower = draws.mapv(|x| if x <= q05 { 1.0 } else { 0.0 });
    let upper = draws.mapv(|x| if x >= q95 { 1.0 } else { 0.0 });
    ess(lower.view()).min(ess(upper.view()))
}

/// Normal scores `Φ⁻¹((r - 3/8) / (S + 1/4))` of the pooled ranks, ties averaged.
fn rank_normalize(draws: ArrayView2<f64>) -> Array2<f64> {
    let flat: Vec<f64> = draws.iter().copied().collect();
    let total = flat.len();
    let mut order: Vec<usize> = (0..total).collect();
    order.sort_unstable_by(|&a, &b| flat[a].total_cmp(&flat[b]));

    let mut scores = vec![0.0; total];
    let mut start = 0;
    while start < total {
        let mut end = start + 1;
        while end < total && flat[order[end]] == flat[order[start]] {
            end += 1;
        }
        let rank = (start + end + 1) as f64 / 2.0;
        let z = inv_normal_cdf((rank - 0.375) / (total as f64 + 0.25));
        for &i in &order[start..end] {
            scores[i] = z;
        }
        start = end;
    }
    Array2::from_shape_vec(draws.raw_dim(), scores).unwrap_or_else(|_| Array2::zeros(draws.raw_dim()))
}

/// Split-chain ESS with Geyer's initial positive sequence.
fn ess(draws: ArrayView2<f64>) -> f64 {
    let split = split_halves(draws);
    let (m, n) = split.dim();
    let (w, b) = within_between(&split);
    if w.is_nan() || w < 1e-30 || n < 2 {
        return f64::NAN;
    }
    let var_plus = (n as f64 - 1.0) / n as f64 * w + b / n as f64;
    let means = split.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(m));
    let centered = &split - &means.insert_axis(Axis(1));

    // Autocorrelations are only computed as far as the pair sums stay positive.
    let rho = |lag: usize| -> f64 {
        let mut acov = 0.0;
        for row in centered.outer_iter() {
            acov += row.slice(s![..n - lag]).dot(&row.slice(s![lag..])) / n as f64;
        }
        1.0 - (w - acov / m as f64) / var_plus
    };

    let mut tau = -1.0;
    let mut lag = 0;
    while lag + 1 < n {
        let pair = rho(lag) + rho(lag + 1);
        if pair < 0.0 {
            break;
        }
        tau += 2.0 * pair;
        lag += 2;
    }
    let total = (m * n) as f64;
    total / tau.max(1.0 / total.log10().max(1.0))
}

/// Inverse standard-normal CDF, rational approximation (Abramowitz & Stegun 26.2.23).
fn inv_normal_cdf(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    let tail = p.min(1.0 - p);
    let t = (-2.0 * tail.ln()).sqrt();
    let num = 2.515517 + t * (0.802853 + t * 0.010328);
    let den = 1.0 + t * (1.432788 + t * (0.189269 + t * 0.001308));
    let z = t - num / den;
    if p < 0.5 {
        -z
    } else {
        z
    }
}
