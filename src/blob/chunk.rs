use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::ops::Bound;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::bloom::Bloom;
use crate::key::Key;

/// On-disk size of a chunk control block.
pub const CHUNK_CTL_SIZE: usize = 8 + 8 + 8 + 4 + 4;

/// Persisted control block of one chunk. The chunk-meta file is a
/// concatenation of `(ChunkCtl, bloom_bytes[bloom_size])` entries, packed
/// little-endian.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkCtl {
    /// Byte offset of the compressed chunk in the data file
    pub data_offset: u64,
    /// Size of the compressed chunk on disk
    pub compressed_size: u64,
    /// Size of the record stream before compression
    pub uncompressed_size: u64,
    /// Number of records in the chunk
    pub num: i32,
    /// Bloom state size in bytes
    pub bloom_size: i32,
}

impl ChunkCtl {
    pub fn encode_into<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u64::<LittleEndian>(self.data_offset)?;
        w.write_u64::<LittleEndian>(self.compressed_size)?;
        w.write_u64::<LittleEndian>(self.uncompressed_size)?;
        w.write_i32::<LittleEndian>(self.num)?;
        w.write_i32::<LittleEndian>(self.bloom_size)?;
        Ok(())
    }

    pub fn decode_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            data_offset: r.read_u64::<LittleEndian>()?,
            compressed_size: r.read_u64::<LittleEndian>()?,
            uncompressed_size: r.read_u64::<LittleEndian>()?,
            num: r.read_i32::<LittleEndian>()?,
            bloom_size: r.read_i32::<LittleEndian>()?,
        })
    }
}

/// Sparse-index step for a chunk of `num` records: every `step`-th record
/// is indexed so at most `budget` entries (plus one) are kept.
pub(crate) fn rcache_step(num: usize, budget: usize) -> usize {
    if budget == 0 {
        return num.max(1);
    }
    ((num + budget - 1) / budget).max(1)
}

/// In-memory handle over one on-disk chunk: its control block, key range,
/// bloom filter, and the sparse rcache mapping keys to uncompressed
/// record-start offsets inside the chunk stream.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub(crate) ctl: ChunkCtl,
    pub(crate) start: Key,
    pub(crate) end: Key,
    pub(crate) bloom: Bloom,
    pub(crate) rcache: BTreeMap<Key, u64>,
}

impl Chunk {
    pub(crate) fn new(bloom_size: usize) -> Self {
        Self {
            ctl: ChunkCtl {
                bloom_size: bloom_size as i32,
                ..ChunkCtl::default()
            },
            start: Key::zero(),
            end: Key::zero(),
            bloom: Bloom::new(bloom_size),
            rcache: BTreeMap::new(),
        }
    }

    pub fn ctl(&self) -> &ChunkCtl {
        &self.ctl
    }

    pub fn start(&self) -> &Key {
        &self.start
    }

    pub fn end(&self) -> &Key {
        &self.end
    }

    pub fn bloom(&self) -> &Bloom {
        &self.bloom
    }

    pub fn num(&self) -> usize {
        self.ctl.num.max(0) as usize
    }

    pub fn contains(&self, key: &Key) -> bool {
        *key >= self.start && *key <= self.end
    }

    /// Upper bound on the uncompressed offset where `key` could live.
    ///
    /// `None` when `key` is outside `[start, end]`. Otherwise the offset
    /// of the first rcache entry strictly greater than `key`, or the
    /// chunk's uncompressed size when no such entry exists. A forward
    /// scan from the chunk start that stays at or below the returned
    /// offset is guaranteed to pass over `key`'s record if it exists.
    pub fn rcache_find(&self, key: &Key) -> Option<u64> {
        if !self.contains(key) {
            return None;
        }
        match self
            .rcache
            .range((Bound::Excluded(*key), Bound::Unbounded))
            .next()
        {
            Some((_, &offset)) => Some(offset),
            None => Some(self.ctl.uncompressed_size),
        }
    }

    pub fn rcache_len(&self) -> usize {
        self.rcache.len()
    }
}
