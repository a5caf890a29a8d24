//! Running statistics used while sampling and evaluating.

use std::collections::VecDeque;

use ndarray::prelude::*;
use num_traits::ToPrimitive;

/// Acceptance rate over the most recent `capacity` Metropolis-Hastings decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptanceWindow {
    capacity: usize,
    queue: VecDeque<bool>,
    accepted: usize,
}

impl Default for AcceptanceWindow {
    fn default() -> Self {
        Self::new(100)
    }
}

impl AcceptanceWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: VecDeque::with_capacity(capacity.max(1)),
            accepted: 0,
        }
    }

    pub fn push(&mut self, accepted: bool) {
        self.queue.push_back(accepted);
        self.accepted += accepted as usize;
        if self.queue.len() > self.capacity {
            if let Some(true) = self.queue.pop_front() {
                self.accepted -= 1;
            }
        }
    }

    /// `None` until the first decision.
    pub fn rate(&self) -> Option<f64> {
        if self.queue.is_empty() {
            None
        } else {
            Some(self.accepted as f64 / self.queue.len() as f64)
        }
    }
}

/// Element-wise running mean and mean of squares of equally sized vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningMoments {
    n: u64,
    mean: Array1<f64>,
    mean_sq: Array1<f64>,
}

impl RunningMoments {
    pub fn new(dim: usize) -> Self {
        Self {
            n: 0,
            mean: Array1::zeros(dim),
            mean_sq: Array1::zeros(dim),
        }
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    /// Adds one observation. Values that do not convert to `f64` count as zero.
    pub fn push<T: ToPrimitive>(&mut self, x: &[T]) {
        debug_assert_eq!(x.len(), self.mean.len());
        self.n += 1;
        let n = self.n as f64;
        let x = Array1::from_iter(x.iter().map(|v| v.to_f64().unwrap_or(0.0)));
        self.mean = (&self.mean * (n - 1.0) + &x) / n;
        self.mean_sq = (&self.mean_sq * (n - 1.0) + x.mapv(|v| v * v)) / n;
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn mean_sq(&self) -> &Array1<f64> {
        &self.mean_sq
    }

    pub fn reset(&mut self) {
        self.n = 0;
        self.mean.fill(0.0);
        self.mean_sq.fill(0.0);
    }
}

/// `log(sum(exp(values)))` without overflow; `-inf` for an empty slice.
pub fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_acceptance_window_slides() {
        let mut window = AcceptanceWindow::new(4);
        assert_eq!(window.rate(), None);
        for accepted in [true, true, false, false] {
            window.push(accepted);
        }
        assert_eq!(window.rate(), Some(0.5));
        window.push(false);
        window.push(false);
        assert_eq!(window.rate(), Some(0.0));
    }

    #[test]
    fn test_running_moments() {
        let mut moments = RunningMoments::new(2);
        moments.push(&[1.0f32, -2.0]);
        moments.push(&[3.0f32, 2.0]);
        assert_eq!(moments.count(), 2);
        assert_eq!(moments.mean(), &array![2.0, 0.0]);
        assert_eq!(moments.mean_sq(), &array![5.0, 4.0]);
        moments.reset();
        assert_eq!(moments.count(), 0);
        assert_eq!(moments.mean_sq(), &array![0.0, 0.0]);
    }

    #[test]
    fn test_logsumexp() {
        assert_abs_diff_eq!(logsumexp(&[0.0, 0.0]), 2f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(logsumexp(&[1000.0, 1000.0]), 1000.0 + 2f64.ln(), epsilon = 1e-9);
        assert_eq!(logsumexp(&[]), f64::NEG_INFINITY);
    }
}
