use std::{
    ffi::OsString,
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Result};
use memmap2::Mmap;

use crate::Error;

/// Bytes of token buffer per token when the store does not say otherwise.
pub const UNITS_PER_TOKEN: usize = 2;

const MAGIC: &[u8; 9] = b"MMIDIDX\x00\x00";
const VERSION: u64 = 1;

/// A pre-tokenized corpus that supports random-access range reads.
pub trait IndexedStore {
    /// Number of sequences in the store.
    fn element_count(&self) -> usize;
    /// Size of the flat token buffer, in bytes.
    fn raw_unit_count(&self) -> usize;
    /// Number of tokens in the flat buffer.
    fn token_count(&self) -> usize {
        self.raw_unit_count() / UNITS_PER_TOKEN
    }
    /// Read `length` tokens starting at token `offset` of the flat buffer.
    fn get(&self, offset: usize, length: usize) -> Result<Vec<i64>, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    U8,
    I8,
    I16,
    I32,
    I64,
    U16,
}

impl DType {
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::U8),
            2 => Ok(Self::I8),
            3 => Ok(Self::I16),
            4 => Ok(Self::I32),
            5 => Ok(Self::I64),
            8 => Ok(Self::U16),
            6 | 7 => bail!("floating point token buffers are not supported"),
            code => bail!("unknown dtype code {code}"),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::U8 => 1,
            Self::I8 => 2,
            Self::I16 => 3,
            Self::I32 => 4,
            Self::I64 => 5,
            Self::U16 => 8,
        }
    }

    pub fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 => 4,
            Self::I64 => 8,
        }
    }

    fn read(self, bytes: &[u8]) -> i64 {
        match self {
            Self::U8 => bytes[0] as i64,
            Self::I8 => bytes[0] as i8 as i64,
            Self::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
            Self::U16 => u16::from_le_bytes([bytes[0], bytes[1]]) as i64,
            Self::I32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
            Self::I64 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..8]);
                i64::from_le_bytes(buf)
            }
        }
    }
}

fn with_extension(prefix: &Path, extension: &str) -> PathBuf {
    let mut path = OsString::from(prefix.as_os_str());
    path.push(".");
    path.push(extension);
    path.into()
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = match self.pos.checked_add(len) {
            Some(end) if end <= self.data.len() => end,
            _ => bail!("index file truncated at byte {}", self.pos),
        };
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn array(&mut self, count: usize, size: usize) -> Result<&'a [u8]> {
        let Some(len) = count.checked_mul(size) else {
            bail!("array of {count} entries overflows the index file");
        };
        self.take(len)
    }

    fn i32s(&mut self, count: usize) -> Result<Vec<i32>> {
        let bytes = self.array(count, 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|x| i32::from_le_bytes([x[0], x[1], x[2], x[3]]))
            .collect())
    }

    fn i64s(&mut self, count: usize) -> Result<Vec<i64>> {
        let bytes = self.array(count, 8)?;
        Ok(bytes.chunks_exact(8).map(|x| DType::I64.read(x)).collect())
    }
}

/// Megatron-style `.idx`/`.bin` token store, memory mapped.
#[derive(Debug)]
pub struct MmapIndexedDataset {
    dtype: DType,
    sizes: Vec<i32>,
    pointers: Vec<i64>,
    doc_idx: Vec<i64>,
    bin: Mmap,
}

impl MmapIndexedDataset {
    pub fn open(prefix: impl AsRef<Path>) -> Result<Self> {
        let prefix = prefix.as_ref();
        let idx_path = with_extension(prefix, "idx");
        let bin_path = with_extension(prefix, "bin");
        log::info!("reading index {:?}", idx_path);

        let file = File::open(&idx_path)?;
        let map = unsafe { Mmap::map(&file)? };
        let mut cursor = Cursor {
            data: &map,
            pos: 0,
        };

        if cursor.take(MAGIC.len())? != MAGIC {
            bail!("{:?} is not an indexed dataset", idx_path);
        }
        let version = cursor.u64()?;
        if version != VERSION {
            bail!("unsupported index version {version}");
        }
        let dtype = DType::from_code(cursor.u8()?)?;
        let len = usize::try_from(cursor.u64()?)?;
        let doc_count = usize::try_from(cursor.u64()?)?;
        let sizes = cursor.i32s(len)?;
        let pointers = cursor.i64s(len)?;
        let doc_idx = cursor.i64s(doc_count)?;

        let file = File::open(&bin_path)?;
        let bin = unsafe { Mmap::map(&file)? };
        if bin.len() % dtype.size() != 0 {
            bail!("{:?} is not a whole number of {:?} tokens", bin_path, dtype);
        }
        log::info!(
            "{} sequences, {} tokens of {:?}",
            sizes.len(),
            bin.len() / dtype.size(),
            dtype
        );

        Ok(Self {
            dtype,
            sizes,
            pointers,
            doc_idx,
            bin,
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Token count of each sequence.
    pub fn sizes(&self) -> &[i32] {
        &self.sizes
    }

    /// Byte offset of each sequence in the token buffer.
    pub fn pointers(&self) -> &[i64] {
        &self.pointers
    }

    /// Sequence index at which each document starts, closed by the sequence count.
    pub fn doc_idx(&self) -> &[i64] {
        &self.doc_idx
    }

    /// Read one whole sequence.
    pub fn document(&self, index: usize) -> Result<Vec<i64>, Error> {
        let count = self.sizes.len();
        let (Some(&pointer), Some(&size)) = (self.pointers.get(index), self.sizes.get(index))
        else {
            return Err(Error::OutOfRange {
                offset: index,
                length: 1,
                count,
            });
        };
        self.get(pointer as usize / self.dtype.size(), size as usize)
    }
}

impl IndexedStore for MmapIndexedDataset {
    fn element_count(&self) -> usize {
        self.sizes.len()
    }

    fn raw_unit_count(&self) -> usize {
        self.bin.len()
    }

    fn token_count(&self) -> usize {
        self.bin.len() / self.dtype.size()
    }

    fn get(&self, offset: usize, length: usize) -> Result<Vec<i64>, Error> {
        let count = self.token_count();
        if offset.checked_add(length).map_or(true, |end| end > count) {
            return Err(Error::OutOfRange {
                offset,
                length,
                count,
            });
        }
        let size = self.dtype.size();
        let bytes = &self.bin[offset * size..(offset + length) * size];
        Ok(bytes
            .chunks_exact(size)
            .map(|x| self.dtype.read(x))
            .collect())
    }
}

/// Writes `u16` token documents in the format [`MmapIndexedDataset`] reads.
#[derive(Debug, Default, Clone)]
pub struct MmapIndexedDatasetBuilder {
    tokens: Vec<u16>,
    sizes: Vec<i32>,
}

impl MmapIndexedDatasetBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_document(&mut self, tokens: &[u16]) -> &mut Self {
        self.tokens.extend_from_slice(tokens);
        self.sizes.push(tokens.len() as i32);
        self
    }

    pub fn finish(&self, prefix: impl AsRef<Path>) -> Result<()> {
        let prefix = prefix.as_ref();
        let dtype = DType::U16;

        let mut bin = BufWriter::new(File::create(with_extension(prefix, "bin"))?);
        for token in &self.tokens {
            bin.write_all(&token.to_le_bytes())?;
        }
        bin.flush()?;

        let mut idx = BufWriter::new(File::create(with_extension(prefix, "idx"))?);
        idx.write_all(MAGIC)?;
        idx.write_all(&VERSION.to_le_bytes())?;
        idx.write_all(&[dtype.code()])?;
        idx.write_all(&(self.sizes.len() as u64).to_le_bytes())?;
        idx.write_all(&(self.sizes.len() as u64 + 1).to_le_bytes())?;
        for size in &self.sizes {
            idx.write_all(&size.to_le_bytes())?;
        }
        let mut pointer = 0i64;
        for size in &self.sizes {
            idx.write_all(&pointer.to_le_bytes())?;
            pointer += *size as i64 * dtype.size() as i64;
        }
        for doc in 0..=self.sizes.len() as i64 {
            idx.write_all(&doc.to_le_bytes())?;
        }
        idx.flush()?;

        log::info!(
            "wrote {} documents, {} tokens to {:?}",
            self.sizes.len(),
            self.tokens.len(),
            prefix
        );
        Ok(())
    }
}
