use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared progress state updated by all sampler chains.
///
/// Rendering is left to `indicatif`, which draws from its own ticker so the
/// sampling threads only bump counters.
pub struct ProgressState {
    bar: ProgressBar,
    completed: AtomicUsize,
    divergences: AtomicUsize,
    pub num_chains: usize,
    pub total_iters: usize,
}

impl ProgressState {
    pub fn new(num_chains: usize, num_warmup: usize, num_samples: usize, enabled: bool) -> Self {
        let total_iters = num_chains * (num_warmup + num_samples);
        let draw_target = if enabled && std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(10)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(total_iters as u64), draw_target);
        let style = ProgressStyle::with_template(
            "Sampling {prefix} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} ({per_sec}, {eta}) {msg}",
        )
        .map(|s| s.progress_chars("━╸╌"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_prefix(format!("{num_chains} chain{}", if num_chains == 1 { "" } else { "s" }));
        Self {
            bar,
            completed: AtomicUsize::new(0),
            divergences: AtomicUsize::new(0),
            num_chains,
            total_iters,
        }
    }

    /// A state that never draws.
    pub fn hidden() -> Self {
        Self::new(0, 0, 0, false)
    }

    pub fn increment(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bar.inc(1);
    }

    pub fn add_divergence(&self) {
        let n = self.divergences.fetch_add(1, Ordering::Relaxed) + 1;
        self.bar.set_message(format!("{} divergences", fmt_count(n)));
    }

    /// Iterations run so far, independent of what the bar displays.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn divergences(&self) -> usize {
        self.divergences.load(Ordering::Relaxed)
    }

    /// Stops the bar; a run cut short is left at its last position.
    pub fn finish(&self) {
        if self.completed() < self.total_iters {
            self.bar.abandon();
        } else {
            self.bar.finish();
        }
    }
}

fn fmt_count(n: usize) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 10_000 {
        format!("{:.1}k", n as f64 / 1_000.0)
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_iterations_and_divergences() {
        let state = ProgressState::new(2, 3, 4, false);
        assert_eq!(state.total_iters, 14);
        for _ in 0..5 {
            state.increment();
        }
        state.add_divergence();
        state.finish();
        assert_eq!(state.completed(), 5);
        assert_eq!(state.divergences(), 1);
    }

    #[test]
    fn finishing_a_full_run_keeps_the_count() {
        let state = ProgressState::new(1, 1, 2, false);
        for _ in 0..3 {
            state.increment();
        }
        state.finish();
        assert_eq!(state.completed(), state.total_iters);
    }

    #[test]
    fn compact_counts() {
        assert_eq!(fmt_count(42), "42");
        assert_eq!(fmt_count(12_500), "12.5k");
        assert_eq!(fmt_count(3_200_000), "3.2M");
    }
}
