use std::{
    borrow::Cow,
    collections::{BTreeSet, HashMap},
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Result};
use itertools::Itertools;
use serde::{ser::SerializeMap, Deserialize, Serialize, Serializer};

use crate::Error;

/// Placeholder symbol the char vocabularies reserve for out-of-table characters.
pub const UNKNOWN_CHAR: char = '\u{e083}';

const UTF16_LE_BOM: [u8; 2] = [0xff, 0xfe];

/// A dense symbol table: ids are assigned in ascending order of the sorted distinct symbols.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    stoi: HashMap<String, u32>,
    itos: HashMap<u32, String>,
}

impl Vocabulary {
    /// Build the table from every symbol of a corpus.
    pub fn from_symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut count = 0usize;
        let unique: BTreeSet<String> = symbols
            .into_iter()
            .inspect(|_| count += 1)
            .map(|symbol| symbol.as_ref().to_owned())
            .collect();
        log::info!("data has {} tokens, {} unique.", count, unique.len());

        let itos: HashMap<u32, String> = unique
            .into_iter()
            .enumerate()
            .map(|(id, symbol)| (id as u32, symbol))
            .collect();
        Self::from_itos(itos)
    }

    /// Build the table from the characters of a text, without an allocation per character.
    pub fn from_chars(chars: impl IntoIterator<Item = char>) -> Self {
        let mut count = 0usize;
        let unique: BTreeSet<char> = chars.into_iter().inspect(|_| count += 1).collect();
        log::info!("data has {} tokens, {} unique.", count, unique.len());

        let itos: HashMap<u32, String> = unique
            .into_iter()
            .enumerate()
            .map(|(id, c)| (id as u32, c.to_string()))
            .collect();
        Self::from_itos(itos)
    }

    fn from_itos(itos: HashMap<u32, String>) -> Self {
        let stoi = itos
            .iter()
            .map(|(&id, symbol)| (symbol.clone(), id))
            .collect();
        Self { stoi, itos }
    }

    pub fn len(&self) -> usize {
        self.itos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.itos.is_empty()
    }

    pub fn id(&self, symbol: &str) -> Option<u32> {
        self.stoi.get(symbol).copied()
    }

    pub fn symbol(&self, id: u32) -> Option<&str> {
        self.itos.get(&id).map(String::as_str)
    }

    /// Persist as `{ "0": "<sym>", ... }` JSON in UTF-16 with a byte-order mark.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string(self)?;
        let mut bytes = Vec::with_capacity(2 + json.len() * 2);
        bytes.extend_from_slice(&UTF16_LE_BOM);
        bytes.extend(json.encode_utf16().flat_map(u16::to_le_bytes));

        let mut file = File::create(path.as_ref())?;
        file.write_all(&bytes)?;
        log::info!("vocabulary of {} symbols saved to {:?}", self.len(), path.as_ref());
        Ok(())
    }

    /// Load a table written by [`Vocabulary::save`]. Plain UTF-8 files are accepted too.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut bytes = vec![];
        File::open(path.as_ref())?.read_to_end(&mut bytes)?;
        let contents = decode_text(&bytes)?;

        let table: HashMap<String, String> = serde_json::from_str(&contents)?;
        let itos = table
            .into_iter()
            .map(|(key, symbol)| match key.parse::<u32>() {
                Ok(id) => Ok((id, symbol)),
                Err(_) => bail!("invalid token id {:?} in {:?}", key, path.as_ref()),
            })
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self::from_itos(itos))
    }
}

impl Serialize for Vocabulary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (id, symbol) in self.itos.iter().sorted_by_key(|(&id, _)| id) {
            map.serialize_entry(&id.to_string(), symbol)?;
        }
        map.end()
    }
}

fn decode_text(bytes: &[u8]) -> Result<String> {
    fn units(bytes: &[u8], convert: fn([u8; 2]) -> u16) -> Result<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            bail!("odd byte length for UTF-16 text");
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| convert([pair[0], pair[1]]))
            .collect())
    }

    let text = match bytes {
        [0xff, 0xfe, rest @ ..] => String::from_utf16(&units(rest, u16::from_le_bytes)?)?,
        [0xfe, 0xff, rest @ ..] => String::from_utf16(&units(rest, u16::from_be_bytes)?)?,
        [0xef, 0xbb, 0xbf, rest @ ..] => String::from_utf8(rest.to_vec())?,
        _ => String::from_utf8(bytes.to_vec())?,
    };
    Ok(text)
}

/// Where the id↔string mapping comes from; the variant fixes the decode mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VocabDescriptor {
    /// A byte-level BPE pair of files.
    Bpe { merges: PathBuf, vocab: PathBuf },
    /// A persisted char table, see [`Vocabulary::save`].
    Char { path: PathBuf },
}

impl Default for VocabDescriptor {
    fn default() -> Self {
        Self::Char {
            path: "vocab.json".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Char,
    Bpe,
}

#[derive(Debug, Clone)]
enum Inner {
    Char {
        vocab: Vocabulary,
        unknown: Option<u32>,
    },
    #[cfg(feature = "bpe")]
    Bpe(Box<tokenizers::Tokenizer>),
}

/// The decoding side's view of the vocabulary.
#[derive(Debug, Clone)]
pub struct Tokenizer(Inner);

impl Tokenizer {
    pub fn new(descriptor: &VocabDescriptor) -> Result<Self> {
        match descriptor {
            VocabDescriptor::Char { path } => {
                log::info!("loading char vocabulary {:?}", path);
                Ok(Self::from_vocabulary(Vocabulary::load(path)?))
            }
            #[cfg(feature = "bpe")]
            VocabDescriptor::Bpe { merges, vocab } => {
                use tokenizers::{models::bpe::BPE, pre_tokenizers::byte_level::ByteLevel};

                log::info!("loading bpe vocabulary {:?} with merges {:?}", vocab, merges);
                let model = BPE::from_file(&vocab.to_string_lossy(), &merges.to_string_lossy())
                    .build()
                    .map_err(|err| anyhow::anyhow!(err))?;
                let mut tokenizer = tokenizers::Tokenizer::new(model);
                tokenizer.with_pre_tokenizer(Some(ByteLevel::default().add_prefix_space(false)));
                tokenizer.with_decoder(Some(ByteLevel::default()));
                Ok(Self(Inner::Bpe(Box::new(tokenizer))))
            }
            #[cfg(not(feature = "bpe"))]
            VocabDescriptor::Bpe { .. } => bail!("bpe vocabularies need the `bpe` feature"),
        }
    }

    pub fn from_vocabulary(vocab: Vocabulary) -> Self {
        let unknown = vocab.id(&UNKNOWN_CHAR.to_string());
        if unknown.is_none() {
            log::warn!("unknown symbol {:?} not in vocabulary", UNKNOWN_CHAR);
        }
        Self(Inner::Char { vocab, unknown })
    }

    pub fn mode(&self) -> DecodeMode {
        match &self.0 {
            Inner::Char { .. } => DecodeMode::Char,
            #[cfg(feature = "bpe")]
            Inner::Bpe(_) => DecodeMode::Bpe,
        }
    }

    pub fn vocab_size(&self) -> usize {
        match &self.0 {
            Inner::Char { vocab, .. } => vocab.len(),
            #[cfg(feature = "bpe")]
            Inner::Bpe(tokenizer) => tokenizer.get_vocab_size(true),
        }
    }

    /// Id of [`UNKNOWN_CHAR`], if the char table has one.
    pub fn unknown(&self) -> Option<u32> {
        match &self.0 {
            Inner::Char { unknown, .. } => *unknown,
            #[cfg(feature = "bpe")]
            Inner::Bpe(_) => None,
        }
    }

    pub fn symbol(&self, id: u32) -> Result<Cow<'_, str>, Error> {
        match &self.0 {
            Inner::Char { vocab, .. } => vocab
                .symbol(id)
                .map(Cow::Borrowed)
                .ok_or_else(|| Error::token(id)),
            #[cfg(feature = "bpe")]
            Inner::Bpe(tokenizer) => tokenizer
                .id_to_token(id)
                .map(Cow::Owned)
                .ok_or_else(|| Error::token(id)),
        }
    }

    /// Whether the most recent token is the newline symbol. Always `false` outside char mode.
    pub fn last_is_newline(&self, emitted: &[u32]) -> Result<bool, Error> {
        match (self.mode(), emitted.last()) {
            (DecodeMode::Char, Some(&last)) => Ok(self.symbol(last)? == "\n"),
            _ => Ok(false),
        }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        match &self.0 {
            Inner::Char { vocab, unknown } => {
                let mut buf = [0u8; 4];
                let tokens = text
                    .chars()
                    .map(|c| {
                        let symbol = c.encode_utf8(&mut buf);
                        vocab
                            .id(symbol)
                            .or(*unknown)
                            .ok_or_else(|| Error::symbol(&*symbol))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(tokens)
            }
            #[cfg(feature = "bpe")]
            Inner::Bpe(tokenizer) => {
                let encoding = tokenizer
                    .encode(text, false)
                    .map_err(|err| anyhow::anyhow!(err))?;
                Ok(encoding.get_ids().to_vec())
            }
        }
    }

    pub fn decode(&self, tokens: &[u32]) -> Result<String> {
        match &self.0 {
            Inner::Char { vocab, .. } => {
                let text = tokens
                    .iter()
                    .map(|&id| vocab.symbol(id).ok_or_else(|| Error::token(id)))
                    .collect::<Result<Vec<_>, _>>()?
                    .concat();
                Ok(text)
            }
            #[cfg(feature = "bpe")]
            Inner::Bpe(tokenizer) => tokenizer
                .decode(tokens, false)
                .map_err(|err| anyhow::anyhow!(err)),
        }
    }

    /// Normalize a free-form prompt into the first context. A no-op outside char mode.
    pub fn refine_context(&self, context: &str) -> String {
        match self.mode() {
            DecodeMode::Char => refine_context(context),
            DecodeMode::Bpe => context.to_owned(),
        }
    }
}

/// Drop blank lines, trim the rest, and lead with a newline.
pub fn refine_context(context: &str) -> String {
    let lines = context
        .trim()
        .split('\n')
        .map(|line| line.trim().trim_matches('\u{3000}').trim_matches('\r'))
        .filter(|line| !line.is_empty())
        .join("\n");
    format!("\n{}", lines.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer(text: &str) -> Tokenizer {
        Tokenizer::from_vocabulary(Vocabulary::from_chars(text.chars()))
    }

    #[test]
    fn ids_follow_sorted_order() {
        let vocab = Vocabulary::from_symbols("hello\n".chars().map(String::from));
        assert_eq!(vocab.len(), 5);
        assert_eq!(vocab.id("\n"), Some(0));
        assert_eq!(vocab.id("e"), Some(1));
        assert_eq!(vocab.id("h"), Some(2));
        assert_eq!(vocab.id("l"), Some(3));
        assert_eq!(vocab.id("o"), Some(4));
        assert_eq!(vocab.symbol(3), Some("l"));
        assert_eq!(vocab.symbol(5), None);
    }

    #[test]
    fn chars_and_symbols_agree() {
        let text = "我 am rwkv\n\u{3000}";
        assert_eq!(
            Vocabulary::from_chars(text.chars()),
            Vocabulary::from_symbols(text.chars().map(String::from))
        );
    }

    #[test]
    fn save_writes_utf16_and_loads_back() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vocab.json");
        let vocab = Vocabulary::from_symbols(["\n", "我", "a", "\u{3000}"]);
        vocab.save(&path)?;

        let bytes = std::fs::read(&path)?;
        assert_eq!(&bytes[..2], &UTF16_LE_BOM);
        let text = decode_text(&bytes)?;
        assert!(text.starts_with(r#"{"0":"\n","1":"a""#));

        assert_eq!(Vocabulary::load(&path)?, vocab);
        Ok(())
    }

    #[test]
    fn load_accepts_utf8() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vocab.json");
        std::fs::write(&path, r#"{"0": "\n", "1": "a", "2": "b"}"#)?;

        let vocab = Vocabulary::load(&path)?;
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.symbol(0), Some("\n"));
        assert_eq!(vocab.id("b"), Some(2));

        std::fs::write(&path, r#"{"x": "a"}"#)?;
        assert!(Vocabulary::load(&path).is_err());
        Ok(())
    }

    #[test]
    fn decode_text_handles_big_endian() -> Result<()> {
        let mut bytes = vec![0xfe, 0xff];
        bytes.extend("{}".encode_utf16().flat_map(u16::to_be_bytes));
        assert_eq!(decode_text(&bytes)?, "{}");

        let mut bytes = vec![0xef, 0xbb, 0xbf];
        bytes.extend_from_slice(b"{}");
        assert_eq!(decode_text(&bytes)?, "{}");
        Ok(())
    }

    #[test]
    fn char_mode_encode_decode() -> Result<()> {
        let tokenizer = tokenizer("ab\n");
        assert_eq!(tokenizer.mode(), DecodeMode::Char);
        assert_eq!(tokenizer.vocab_size(), 3);
        assert_eq!(tokenizer.unknown(), None);

        let tokens = tokenizer.encode("ba\na")?;
        assert_eq!(tokens, vec![2, 1, 0, 1]);
        assert_eq!(tokenizer.decode(&tokens)?, "ba\na");

        let err = tokenizer.encode("abc").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Lookup { .. })));
        assert!(tokenizer.decode(&[7]).is_err());
        Ok(())
    }

    #[test]
    fn unknown_symbol_absorbs_missing_chars() -> Result<()> {
        let tokenizer = tokenizer(&format!("ab{UNKNOWN_CHAR}"));
        let unknown = tokenizer.unknown().expect("unknown symbol");
        assert_eq!(tokenizer.encode("axb")?, vec![0, unknown, 1]);
        Ok(())
    }

    #[test]
    fn newline_detection() -> Result<(), Error> {
        let tokenizer = tokenizer("ab\n");
        assert!(tokenizer.last_is_newline(&[1, 0])?);
        assert!(!tokenizer.last_is_newline(&[0, 1])?);
        assert!(!tokenizer.last_is_newline(&[])?);
        assert!(matches!(
            tokenizer.last_is_newline(&[9]),
            Err(Error::Lookup { .. })
        ));
        Ok(())
    }

    #[test]
    fn refine_drops_blank_lines() {
        assert_eq!(refine_context("  line1  \n\n  line2\r\n"), "\nline1\nline2");
        assert_eq!(refine_context("\u{3000}你好\u{3000}\r\n\r\n  "), "\n你好");
        assert_eq!(refine_context("one\ntwo"), "\none\ntwo");
    }

    #[test]
    fn refine_empty_is_newline() {
        assert_eq!(refine_context(""), "\n");
        assert_eq!(refine_context(" \r\n \n\u{3000}"), "\n");
        assert_eq!(tokenizer("a").refine_context(""), "\n");
    }

    #[test]
    fn descriptor_shape_selects_mode() -> Result<()> {
        let char: VocabDescriptor = serde_json::from_str(r#"{ "path": "vocab.json" }"#)?;
        assert_eq!(
            char,
            VocabDescriptor::Char {
                path: "vocab.json".into()
            }
        );
        let bpe: VocabDescriptor =
            serde_json::from_str(r#"{ "merges": "merges.txt", "vocab": "vocab.json" }"#)?;
        assert!(matches!(bpe, VocabDescriptor::Bpe { .. }));
        Ok(())
    }
}
