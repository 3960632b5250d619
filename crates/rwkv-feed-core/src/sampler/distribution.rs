//! The nucleus pipeline as owned stages: [`Distribution`] → [`Truncated`] → [`Weights`].
//!
//! Each stage consumes the previous one, so truncation always happens before the
//! temperature reshape, and neither stage renormalizes.

use itertools::Itertools;

use crate::{Error, Result};

/// Normalized probabilities over the vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution(Vec<f32>);

impl Distribution {
    /// Numerically stable softmax of raw model output.
    pub fn softmax(logits: &[f32]) -> Result<Self> {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if !max.is_finite() {
            return Err(Error::Distribution(format!(
                "cannot normalize logits with maximum {max} over {} entries",
                logits.len()
            )));
        }
        let exp = logits.iter().map(|&x| (x - max).exp()).collect_vec();
        let sum: f32 = exp.iter().sum();
        if !sum.is_finite() {
            return Err(Error::Distribution("logits contain NaN".into()));
        }
        Ok(Self(exp.into_iter().map(|x| x / sum).collect()))
    }

    /// Wrap probabilities that are already normalized.
    pub fn from_probs(probs: Vec<f32>) -> Self {
        Self(probs)
    }

    pub fn probs(&self) -> &[f32] {
        &self.0
    }

    /// Keep the smallest high-probability prefix whose mass strictly exceeds `top_p`.
    ///
    /// Entries are ranked by a stable descending sort, so equal probabilities keep their
    /// index order; only the cutoff *value* is taken from the ranking, and every entry equal
    /// to it survives.
    ///
    /// When no prefix exceeds `top_p`, a threshold of `1.0` or more keeps the whole
    /// distribution, so rounding in the softmax sum cannot turn `top_p = 1` greedy.
    /// Any smaller threshold falls back to the mode alone, like an `argmax` over
    /// `cum > top_p` would.
    pub fn truncate(self, top_p: f32) -> Truncated {
        let sorted = self
            .0
            .iter()
            .copied()
            .sorted_by(|x, y| y.total_cmp(x))
            .collect_vec();
        let cutoff = sorted
            .iter()
            .scan(0.0f32, |cum, &x| {
                *cum += x;
                Some((*cum, x))
            })
            .find(|&(cum, _)| cum > top_p)
            .map(|(_, x)| x)
            .or_else(|| match top_p >= 1.0 {
                true => sorted.last().copied(),
                false => sorted.first().copied(),
            })
            .unwrap_or_default();

        let weights = self
            .0
            .into_iter()
            .map(|x| if x < cutoff { 0.0 } else { x })
            .collect();
        Truncated { weights, cutoff }
    }
}

/// Probabilities with every entry below the nucleus cutoff zeroed.
#[derive(Debug, Clone, PartialEq)]
pub struct Truncated {
    weights: Vec<f32>,
    cutoff: f32,
}

impl Truncated {
    /// The smallest probability still inside the nucleus.
    pub fn cutoff(&self) -> f32 {
        self.cutoff
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Raise the surviving weights to `1 / temperature`.
    pub fn reshape(self, temperature: f32) -> Weights {
        let mut weights = self.weights;
        if temperature != 1.0 {
            let exponent = 1.0 / temperature;
            weights
                .iter_mut()
                .filter(|x| **x > 0.0)
                .for_each(|x| *x = x.powf(exponent));
        }
        Weights(weights)
    }
}

/// Unnormalized sampling weights.
#[derive(Debug, Clone, PartialEq)]
pub struct Weights(Vec<f32>);

impl Weights {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Draw one index with probability proportional to its weight.
    pub fn draw(&self, rng: &mut fastrand::Rng) -> Result<u32> {
        let sum: f32 = self.0.iter().sum();
        if !(sum.is_finite() && sum > 0.0) {
            return Err(Error::Distribution(format!(
                "no positive weight survives truncation (sum {sum})"
            )));
        }

        let rand = rng.f32() * sum;
        let token = self
            .0
            .iter()
            .enumerate()
            .filter(|(_, &x)| x > 0.0)
            .scan(0.0f32, |cum, (id, &x)| {
                *cum += x;
                Some((id, *cum))
            })
            .find_or_last(|&(_, cum)| rand < cum)
            .map(|(id, _)| id as u32)
            .ok_or_else(|| Error::Distribution("empty weights".into()))?;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_is_stable() -> Result<()> {
        let probs = Distribution::softmax(&[1000.0, 1000.0, f32::NEG_INFINITY])?;
        assert_eq!(probs.probs(), &[0.5, 0.5, 0.0]);

        let probs = Distribution::softmax(&[0.0, 2.0f32.ln()])?;
        assert!((probs.probs()[0] - 1.0 / 3.0).abs() < 1e-6);
        assert!((probs.probs()[1] - 2.0 / 3.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn softmax_rejects_degenerate_logits() {
        assert!(matches!(
            Distribution::softmax(&[]),
            Err(Error::Distribution(_))
        ));
        assert!(matches!(
            Distribution::softmax(&[f32::NEG_INFINITY; 3]),
            Err(Error::Distribution(_))
        ));
        assert!(matches!(
            Distribution::softmax(&[0.0, f32::NAN]),
            Err(Error::Distribution(_))
        ));
    }

    #[test]
    fn cutoff_is_last_entry_of_nucleus() {
        let truncated = Distribution::from_probs(vec![0.1, 0.5, 0.15, 0.25]).truncate(0.6);
        assert_eq!(truncated.cutoff(), 0.25);
        assert_eq!(truncated.weights(), &[0.0, 0.5, 0.0, 0.25]);
    }

    #[test]
    fn mass_exactly_at_threshold_is_not_enough() {
        // 0.5 does not strictly exceed 0.5, so the nucleus needs a second entry
        let truncated = Distribution::from_probs(vec![0.5, 0.25, 0.25]).truncate(0.5);
        assert_eq!(truncated.cutoff(), 0.25);
        assert_eq!(truncated.weights(), &[0.5, 0.25, 0.25]);
    }

    #[test]
    fn ties_with_cutoff_survive() {
        let truncated = Distribution::from_probs(vec![0.3, 0.4, 0.3]).truncate(0.5);
        assert_eq!(truncated.cutoff(), 0.3);
        assert_eq!(truncated.weights(), &[0.3, 0.4, 0.3]);
    }

    #[test]
    fn tiny_top_p_keeps_the_mode() {
        let truncated = Distribution::from_probs(vec![0.2, 0.7, 0.1]).truncate(0.0);
        assert_eq!(truncated.weights(), &[0.0, 0.7, 0.0]);
    }

    #[test]
    fn unreachable_top_p_keeps_everything() {
        let truncated = Distribution::from_probs(vec![0.2, 0.7, 0.1]).truncate(1.5);
        assert_eq!(truncated.cutoff(), 0.1);
        assert_eq!(truncated.weights(), &[0.2, 0.7, 0.1]);

        let truncated = Distribution::from_probs(vec![0.25, 0.5, 0.25]).truncate(1.0);
        assert_eq!(truncated.weights(), &[0.25, 0.5, 0.25]);
    }

    #[test]
    fn unreachable_top_p_below_one_keeps_the_mode() {
        // the mass sums to 0.9, short of a threshold below 1
        let truncated = Distribution::from_probs(vec![0.2, 0.6, 0.1]).truncate(0.95);
        assert_eq!(truncated.cutoff(), 0.6);
        assert_eq!(truncated.weights(), &[0.0, 0.6, 0.0]);
    }

    #[test]
    fn reshape_applies_to_unnormalized_weights() {
        let weights = Distribution::from_probs(vec![0.5, 0.3, 0.2])
            .truncate(0.7)
            .reshape(0.5);
        let expected = [0.25f32, 0.09, 0.0];
        for (x, y) in weights.as_slice().iter().zip(expected) {
            assert!((x - y).abs() < 1e-6, "{:?}", weights);
        }

        let weights = Distribution::from_probs(vec![0.5, 0.3, 0.2])
            .truncate(1.0)
            .reshape(1.0);
        assert_eq!(weights.as_slice(), &[0.5, 0.3, 0.2]);
    }

    #[test]
    fn lower_temperature_concentrates_on_the_mode() {
        let share = |temperature: f32| {
            let weights = Distribution::from_probs(vec![0.5, 0.3, 0.2])
                .truncate(1.0)
                .reshape(temperature);
            let weights = weights.as_slice();
            weights[0] / weights.iter().sum::<f32>()
        };
        assert!(share(0.5) > share(1.0));
        assert!(share(0.25) > share(0.5));
        assert!(share(2.0) < share(1.0));
    }

    #[test]
    fn zero_weights_are_never_drawn() -> Result<()> {
        let weights = Distribution::from_probs(vec![0.0, 0.4, 0.0, 0.6, 0.0])
            .truncate(1.0)
            .reshape(1.0);
        let mut rng = fastrand::Rng::with_seed(9);
        for _ in 0..1000 {
            let token = weights.draw(&mut rng)?;
            assert!(token == 1 || token == 3);
        }
        Ok(())
    }

    #[test]
    fn all_zero_weights_fail() {
        let weights = Distribution::from_probs(vec![0.0; 4]).truncate(0.5).reshape(1.0);
        assert!(matches!(
            weights.draw(&mut fastrand::Rng::with_seed(0)),
            Err(Error::Distribution(_))
        ));
    }
}
