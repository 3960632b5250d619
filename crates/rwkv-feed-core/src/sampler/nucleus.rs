use derivative::Derivative;
use serde::{Deserialize, Serialize};

use super::distribution::Distribution;
use crate::{vocab::Tokenizer, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct NucleusParams {
    #[derivative(Default(value = "1.0"))]
    pub temperature: f32,
    #[derivative(Default(value = "0.7"))]
    #[serde(alias = "top_p")]
    pub top_p_usual: f32,
    /// Threshold used right after a newline, in char mode only.
    #[derivative(Default(value = "0.9"))]
    pub top_p_newline: f32,
}

#[derive(Debug, Default, Clone)]
pub struct NucleusSampler {
    pub params: NucleusParams,
}

impl NucleusSampler {
    pub fn new(params: NucleusParams) -> Result<Self> {
        let NucleusParams {
            temperature,
            top_p_usual,
            top_p_newline,
        } = params;
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(Error::Configuration(format!(
                "temperature must be positive, got {temperature}"
            )));
        }
        for top_p in [top_p_usual, top_p_newline] {
            if !(top_p.is_finite() && top_p >= 0.0) {
                return Err(Error::Configuration(format!(
                    "top_p must be non-negative, got {top_p}"
                )));
            }
        }
        Ok(Self { params })
    }

    /// The threshold that applies after `emitted`.
    pub fn top_p(&self, tokenizer: &Tokenizer, emitted: &[u32]) -> Result<f32> {
        match tokenizer.last_is_newline(emitted)? {
            true => Ok(self.params.top_p_newline),
            false => Ok(self.params.top_p_usual),
        }
    }

    /// Pick the next token from one step of raw model output.
    pub fn sample(
        &self,
        tokenizer: &Tokenizer,
        logits: &[f32],
        emitted: &[u32],
        rng: &mut fastrand::Rng,
    ) -> Result<u32> {
        let top_p = self.top_p(tokenizer, emitted)?;
        Distribution::softmax(logits)?
            .truncate(top_p)
            .reshape(self.params.temperature)
            .draw(rng)
    }
}
