use derivative::Derivative;
use serde::{Deserialize, Serialize};

pub use dataset::{Corpus, DatasetOptions, Window, WindowedDataset, Windows};
pub use sampler::nucleus::{NucleusParams, NucleusSampler};
pub use vocab::{DecodeMode, Tokenizer, VocabDescriptor, Vocabulary};

pub mod binidx;
pub mod dataset;
pub mod sampler;
pub mod vocab;

/// Name of the environment variable the driver reads the worker count from.
pub const NUM_GPUS_VAR: &str = "RWKV_NUM_GPUS";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Sizes or parameters that cannot produce a valid sample.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A symbol or token id with no counterpart in the vocabulary.
    #[error("lookup error: {kind} {key} not in vocabulary")]
    Lookup { kind: &'static str, key: String },
    /// The weights handed to the final draw are unusable.
    #[error("distribution error: {0}")]
    Distribution(String),
    /// A read past the end of an indexed store.
    #[error("read of {length} tokens at offset {offset} exceeds {count} tokens")]
    OutOfRange {
        offset: usize,
        length: usize,
        count: usize,
    },
}

impl Error {
    pub fn symbol(symbol: impl Into<String>) -> Self {
        Self::Lookup {
            kind: "symbol",
            key: format!("{:?}", symbol.into()),
        }
    }

    pub fn token(token: impl std::fmt::Display) -> Self {
        Self::Lookup {
            kind: "token",
            key: token.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Degree of data parallelism the epoch is sharded across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct ParallelConfig {
    #[derivative(Default(value = "1"))]
    pub num_gpus: usize,
}

impl ParallelConfig {
    /// Parse the raw value of [`NUM_GPUS_VAR`]. Missing, unparsable or zero values fall back to 1.
    pub fn from_env_value(value: Option<&str>) -> Self {
        let num_gpus = match value.map(|value| value.trim().parse::<usize>()) {
            Some(Ok(num_gpus)) if num_gpus > 0 => num_gpus,
            Some(_) => {
                log::warn!("invalid {NUM_GPUS_VAR} value {:?}, using 1", value);
                1
            }
            None => 1,
        };
        Self { num_gpus }
    }
}

/// An independent random stream for one parallel worker.
pub fn worker_rng(seed: u64, rank: usize) -> fastrand::Rng {
    // golden-ratio stride, as in splitmix64
    let seed = seed ^ (rank as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    fastrand::Rng::with_seed(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_gpus_defaults_to_one() {
        assert_eq!(ParallelConfig::from_env_value(None).num_gpus, 1);
        assert_eq!(ParallelConfig::from_env_value(Some("abc")).num_gpus, 1);
        assert_eq!(ParallelConfig::from_env_value(Some("0")).num_gpus, 1);
        assert_eq!(ParallelConfig::from_env_value(Some("-2")).num_gpus, 1);
        assert_eq!(ParallelConfig::from_env_value(Some(" 4 ")).num_gpus, 4);
        assert_eq!(ParallelConfig::default().num_gpus, 1);
    }

    #[test]
    fn worker_streams_differ() {
        let mut a = worker_rng(42, 0);
        let mut b = worker_rng(42, 1);
        let a = (0..8).map(|_| a.u64(..)).collect::<Vec<_>>();
        let b = (0..8).map(|_| b.u64(..)).collect::<Vec<_>>();
        assert_ne!(a, b);

        let mut c = worker_rng(42, 1);
        let c = (0..8).map(|_| c.u64(..)).collect::<Vec<_>>();
        assert_eq!(b, c);
    }
}
