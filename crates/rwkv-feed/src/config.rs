use std::path::PathBuf;

use derivative::Derivative;
use rwkv_feed_core::{dataset::DEFAULT_INDEXED_VOCAB_SIZE, DatasetOptions, NucleusParams, VocabDescriptor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base seed of the worker random streams. Drawn at random if absent.
    pub seed: Option<u64>,
    pub dataset: Dataset,
    pub tokenizer: VocabDescriptor,
    pub sampler: NucleusParams,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorpusKind {
    /// A UTF-8 text file, sampled character by character.
    #[default]
    Text,
    /// A `.idx`/`.bin` pair; `path` is the common prefix.
    Binidx,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct Dataset {
    pub kind: CorpusKind,
    /// Path to the corpus.
    #[derivative(Default(value = "\"assets/data/enwik8\".into()"))]
    pub path: PathBuf,
    #[serde(flatten)]
    pub options: DatasetOptions,
    /// Vocabulary size of a pre-tokenized corpus.
    #[derivative(Default(value = "DEFAULT_INDEXED_VOCAB_SIZE"))]
    pub vocab_size: usize,
    /// Where to persist the vocabulary built from a text corpus.
    #[derivative(Default(value = "Some(\"vocab.json\".into())"))]
    pub vocab_output: Option<PathBuf>,
}
