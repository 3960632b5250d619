//! Random fixed-length training windows over a flat token corpus.
//!
//! The dataset does **not** map an index to a fixed example: every draw picks a fresh,
//! uniformly random start offset. An "epoch" is therefore a configured number of draws,
//! independent of how many distinct windows the corpus holds. [`WindowedDataset::windows`]
//! exposes this honestly as an infinite stream; [`WindowedDataset::sample`] keeps an
//! index-taking signature for indexable consumers but ignores the index.

use std::{fmt, sync::Arc};

use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::{binidx::IndexedStore, vocab::Vocabulary, Error, Result};

/// Vocabulary size assumed for pre-tokenized stores.
pub const DEFAULT_INDEXED_VOCAB_SIZE: usize = 50304;

/// The token source, fixed at construction.
#[derive(Clone)]
pub enum Corpus {
    /// In-memory text, one symbol per character.
    Chars {
        chars: Arc<[char]>,
        vocab: Arc<Vocabulary>,
    },
    /// In-memory symbols with a vocabulary derived from them.
    Symbols {
        symbols: Arc<[String]>,
        vocab: Arc<Vocabulary>,
    },
    /// An external store of token ids with an agreed vocabulary size.
    Indexed {
        store: Arc<dyn IndexedStore + Send + Sync>,
        vocab_size: usize,
    },
}

impl fmt::Debug for Corpus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chars { chars, vocab } => f
                .debug_struct("Chars")
                .field("len", &chars.len())
                .field("vocab_size", &vocab.len())
                .finish(),
            Self::Symbols { symbols, vocab } => f
                .debug_struct("Symbols")
                .field("len", &symbols.len())
                .field("vocab_size", &vocab.len())
                .finish(),
            Self::Indexed { store, vocab_size } => f
                .debug_struct("Indexed")
                .field("len", &store.token_count())
                .field("vocab_size", vocab_size)
                .finish(),
        }
    }
}

impl Corpus {
    /// A character-level corpus.
    pub fn from_text(text: &str) -> Self {
        let chars: Arc<[char]> = text.chars().collect();
        let vocab = Vocabulary::from_chars(chars.iter().copied());
        Self::Chars {
            chars,
            vocab: Arc::new(vocab),
        }
    }

    /// A corpus of pre-split symbols; the vocabulary is built from their sorted distinct set.
    pub fn from_symbols(symbols: Vec<String>) -> Self {
        let vocab = Vocabulary::from_symbols(&symbols);
        Self::Symbols {
            symbols: symbols.into(),
            vocab: Arc::new(vocab),
        }
    }

    pub fn indexed(store: Arc<dyn IndexedStore + Send + Sync>, vocab_size: usize) -> Self {
        log::info!("current vocab size = {vocab_size} (make sure it's correct)");
        Self::Indexed { store, vocab_size }
    }

    pub fn token_count(&self) -> usize {
        match self {
            Self::Chars { chars, .. } => chars.len(),
            Self::Symbols { symbols, .. } => symbols.len(),
            Self::Indexed { store, .. } => store.token_count(),
        }
    }

    pub fn vocab_size(&self) -> usize {
        match self {
            Self::Chars { vocab, .. } | Self::Symbols { vocab, .. } => vocab.len(),
            Self::Indexed { vocab_size, .. } => *vocab_size,
        }
    }

    /// The derived vocabulary, for in-memory corpora.
    pub fn vocab(&self) -> Option<&Vocabulary> {
        match self {
            Self::Chars { vocab, .. } | Self::Symbols { vocab, .. } => Some(vocab.as_ref()),
            Self::Indexed { .. } => None,
        }
    }

    fn read(&self, offset: usize, length: usize) -> Result<Vec<u32>> {
        match self {
            Self::Chars { chars, vocab } => {
                let count = chars.len();
                let chunk = chars.get(offset..offset + length).ok_or(Error::OutOfRange {
                    offset,
                    length,
                    count,
                })?;
                let mut buf = [0u8; 4];
                chunk
                    .iter()
                    .map(|c| {
                        let symbol = c.encode_utf8(&mut buf);
                        vocab.id(symbol).ok_or_else(|| Error::symbol(&*symbol))
                    })
                    .collect()
            }
            Self::Symbols { symbols, vocab } => {
                let count = symbols.len();
                let chunk = symbols.get(offset..offset + length).ok_or(Error::OutOfRange {
                    offset,
                    length,
                    count,
                })?;
                chunk
                    .iter()
                    .map(|symbol| vocab.id(symbol).ok_or_else(|| Error::symbol(symbol)))
                    .collect()
            }
            Self::Indexed { store, vocab_size } => store
                .get(offset, length)?
                .into_iter()
                .map(|id| match u32::try_from(id) {
                    Ok(token) if (token as usize) < *vocab_size => Ok(token),
                    _ => Err(Error::token(id)),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct DatasetOptions {
    /// Number of tokens the model conditions on.
    #[derivative(Default(value = "1024"))]
    pub ctx_len: usize,
    /// Nominal number of examples per epoch, before sharding.
    #[derivative(Default(value = "10000"))]
    pub epoch_length_fixed: usize,
}

/// One training example: `target` is `input` shifted left by one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub input: Vec<u32>,
    pub target: Vec<u32>,
}

impl Window {
    fn from_chunk(mut chunk: Vec<u32>) -> Self {
        let target = chunk[1..].to_vec();
        chunk.pop();
        Self {
            input: chunk,
            target,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WindowedDataset {
    corpus: Corpus,
    options: DatasetOptions,
    num_gpus: usize,
}

impl WindowedDataset {
    pub fn new(corpus: Corpus, options: DatasetOptions, num_gpus: usize) -> Result<Self> {
        let DatasetOptions {
            ctx_len,
            epoch_length_fixed,
        } = options;
        if ctx_len == 0 || epoch_length_fixed == 0 || num_gpus == 0 {
            return Err(Error::Configuration(format!(
                "ctx_len ({ctx_len}), epoch_length_fixed ({epoch_length_fixed}) \
                 and num_gpus ({num_gpus}) must be positive"
            )));
        }
        let count = corpus.token_count();
        if count <= ctx_len + 1 {
            return Err(Error::Configuration(format!(
                "corpus of {count} tokens cannot hold a window of ctx_len {ctx_len}"
            )));
        }
        log::info!("{:?}, ctx_len: {}, epoch: {}", corpus, ctx_len, epoch_length_fixed);

        Ok(Self {
            corpus,
            options,
            num_gpus,
        })
    }

    /// Examples per epoch for each of the `num_gpus` workers.
    pub fn len(&self) -> usize {
        self.options.epoch_length_fixed / self.num_gpus
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ctx_len(&self) -> usize {
        self.options.ctx_len
    }

    pub fn vocab_size(&self) -> usize {
        self.corpus.vocab_size()
    }

    pub fn token_count(&self) -> usize {
        self.corpus.token_count()
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    /// Draw a window. `_index` is ignored: equal indices give independent windows.
    pub fn sample(&self, _index: usize, rng: &mut fastrand::Rng) -> Result<Window> {
        self.draw(rng)
    }

    /// An endless stream of independent windows.
    pub fn windows(&self, rng: fastrand::Rng) -> Windows<'_> {
        Windows { dataset: self, rng }
    }

    /// One epoch worth of windows, see [`WindowedDataset::len`].
    pub fn epoch(&self, rng: fastrand::Rng) -> std::iter::Take<Windows<'_>> {
        self.windows(rng).take(self.len())
    }

    fn draw(&self, rng: &mut fastrand::Rng) -> Result<Window> {
        let length = self.options.ctx_len + 1;
        let start = rng.usize(..self.token_count() - length);
        let chunk = self.corpus.read(start, length)?;
        Ok(Window::from_chunk(chunk))
    }
}

/// Infinite and not restartable; each item is a fresh random window.
#[derive(Debug)]
pub struct Windows<'a> {
    dataset: &'a WindowedDataset,
    rng: fastrand::Rng,
}

impl Iterator for Windows<'_> {
    type Item = Result<Window>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.dataset.draw(&mut self.rng))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (usize::MAX, None)
    }
}
