use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::bloom::Bloom;
use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::key::{Key, RECORD_SIZE};
use crate::mapped::{AppendWriter, MappedFile, SectionReader};

use super::chunk::{rcache_step, Chunk, ChunkCtl, CHUNK_CTL_SIZE};

/// Ordered write buffer handed to the store in sorted order.
pub(crate) type Cache = BTreeMap<Key, Vec<u8>>;

fn with_ext(prefix: &Path, ext: &str) -> PathBuf {
    let mut os = prefix.as_os_str().to_os_string();
    os.push(ext);
    PathBuf::from(os)
}

/// One on-disk store: the `.data` file holding compressed chunks and the
/// `.chunk` file journaling their control blocks and bloom state. A blob
/// owns two of these and ping-pongs between them on resort.
pub(crate) struct BlobStore {
    prefix: PathBuf,
    data: MappedFile,
    meta: MappedFile,
    bloom_size: usize,
}

impl BlobStore {
    pub(crate) fn open(prefix: &Path, bloom_size: usize) -> Result<Self> {
        let data = MappedFile::open(with_ext(prefix, ".data"))?;
        let meta = MappedFile::open(with_ext(prefix, ".chunk"))?;
        tracing::debug!(
            store = %prefix.display(),
            data_size = data.size(),
            meta_size = meta.size(),
            bloom_size,
            "blob store opened"
        );
        Ok(Self {
            prefix: prefix.to_path_buf(),
            data,
            meta,
            bloom_size,
        })
    }

    /// Path of the data file for a store prefix, without opening it.
    pub(crate) fn data_path(prefix: &Path) -> PathBuf {
        with_ext(prefix, ".data")
    }

    /// Compress the first `max_records` entries of `cache` into a new
    /// chunk at the end of the data file, journal its meta entry, and
    /// drop the consumed prefix from `cache`.
    pub(crate) fn store_chunk(
        &self,
        codec: &dyn Codec,
        cache: &mut Cache,
        max_records: usize,
        rcache_budget: usize,
    ) -> Result<Chunk> {
        if cache.is_empty() {
            return Err(Error::InvalidInput("store_chunk: empty cache".into()));
        }
        let num = cache.len().min(max_records);
        let step = rcache_step(num, rcache_budget);

        let mut chunk = Chunk::new(self.bloom_size);
        let data_offset = self.data.size();
        chunk.ctl.data_offset = data_offset;
        chunk.start = *cache.keys().next().unwrap();

        let mut uncompressed = 0u64;
        let mut end_key = chunk.start;
        let mut written = 0usize;
        {
            let sink = AppendWriter::new(&self.data, data_offset);
            let mut enc = codec.encoder(Box::new(sink)).map_err(Error::codec)?;
            let mut record = Vec::with_capacity(RECORD_SIZE);
            for (key, value) in cache.iter() {
                if written == num {
                    break;
                }
                let mut stored = *key;
                stored.descriptor_mut().data_offset = uncompressed;
                stored.descriptor_mut().data_size = value.len() as u32;

                record.clear();
                stored.encode_into(&mut record)?;
                enc.write_all(&record).map_err(Error::codec)?;
                enc.write_all(value).map_err(Error::codec)?;

                chunk.bloom.add(stored.id());
                if written % step == 0 {
                    chunk.rcache.insert(*key, uncompressed);
                }

                uncompressed += (RECORD_SIZE + value.len()) as u64;
                end_key = *key;
                written += 1;
            }
            enc.finish().map_err(Error::codec)?;
        }

        chunk.end = end_key;
        chunk.ctl.num = written as i32;
        chunk.ctl.uncompressed_size = uncompressed;
        chunk.ctl.compressed_size = self.data.size() - data_offset;

        // The meta entry goes in only after the data write completed, so
        // the journal never references bytes that are not on disk.
        self.append_meta(&chunk)?;

        let mut rest = cache.split_off(&end_key);
        rest.remove(&end_key);
        *cache = rest;

        tracing::debug!(
            store = %self.prefix.display(),
            start = %chunk.start,
            end = %chunk.end,
            num = written,
            data_offset,
            uncompressed,
            compressed = chunk.ctl.compressed_size,
            "chunk stored"
        );
        Ok(chunk)
    }

    /// Decompress the whole chunk into `out`. Existing entries win: the
    /// resort pass feeds caches freshest-source-first and relies on this
    /// to coalesce duplicates.
    pub(crate) fn read_chunk(
        &self,
        codec: &dyn Codec,
        chunk: &Chunk,
        out: &mut Cache,
    ) -> Result<()> {
        let mut dec = self.decoder(codec, chunk)?;
        for _ in 0..chunk.num() {
            let key = Key::decode_from(&mut dec).map_err(Error::codec)?;
            let mut value = vec![0u8; key.descriptor().data_size as usize];
            dec.read_exact(&mut value).map_err(Error::codec)?;
            out.entry(key).or_insert(value);
        }
        Ok(())
    }

    /// Point lookup inside one chunk: bloom test, rcache upper bound,
    /// then a bounded forward scan through the decompressed stream.
    pub(crate) fn chunk_read(
        &self,
        codec: &dyn Codec,
        key: &Key,
        chunk: &Chunk,
    ) -> Result<Option<Vec<u8>>> {
        if !chunk.bloom.check(key.id()) {
            return Ok(None);
        }
        let cap = match chunk.rcache_find(key) {
            Some(cap) => cap,
            None => return Ok(None),
        };

        let mut dec = self.decoder(codec, chunk)?;
        let mut pos = 0u64;
        for _ in 0..chunk.num() {
            if pos > cap {
                break;
            }
            let record = Key::decode_from(&mut dec).map_err(Error::codec)?;
            if record > *key {
                // Chunk is sorted; the key cannot appear further on.
                break;
            }
            let size = record.descriptor().data_size as usize;
            let mut value = vec![0u8; size];
            dec.read_exact(&mut value).map_err(Error::codec)?;
            if record == *key {
                return Ok(Some(value));
            }
            pos += (RECORD_SIZE + size) as u64;
        }
        Ok(None)
    }

    /// Rebuild the chunk sets from the meta journal. Entries replay in
    /// creation order; a chunk whose start is not past the last sorted
    /// chunk's end goes to the unsorted vector. The first truncated or
    /// invalid tail entry stops replay and keeps everything parsed so
    /// far.
    pub(crate) fn replay_chunk_meta(
        &self,
        codec: &dyn Codec,
        rcache_budget: usize,
    ) -> Result<(BTreeMap<Key, Chunk>, Vec<Chunk>)> {
        let mut sorted: BTreeMap<Key, Chunk> = BTreeMap::new();
        let mut unsorted: Vec<Chunk> = Vec::new();
        let meta_size = self.meta.size();
        let data_size = self.data.size();
        let mut offset = 0u64;

        while offset + CHUNK_CTL_SIZE as u64 <= meta_size {
            let mut ctl_buf = [0u8; CHUNK_CTL_SIZE];
            self.meta.read(&mut ctl_buf, offset)?;
            let ctl = ChunkCtl::decode_from(&mut ctl_buf.as_slice())?;

            if let Err(reason) = Self::validate_ctl(&ctl, offset, meta_size, data_size) {
                tracing::warn!(
                    store = %self.prefix.display(),
                    offset,
                    recovered = sorted.len() + unsorted.len(),
                    reason,
                    "chunk meta replay stopped"
                );
                break;
            }

            let mut bloom_buf = vec![0u8; ctl.bloom_size as usize];
            self.meta.read(&mut bloom_buf, offset + CHUNK_CTL_SIZE as u64)?;

            let mut chunk = Chunk {
                ctl,
                start: Key::zero(),
                end: Key::zero(),
                bloom: Bloom::from_bytes(bloom_buf),
                rcache: BTreeMap::new(),
            };
            if let Err(err) = self.scan_chunk(codec, &mut chunk, rcache_budget) {
                tracing::warn!(
                    store = %self.prefix.display(),
                    offset,
                    recovered = sorted.len() + unsorted.len(),
                    error = %err,
                    "chunk data scan failed, replay stopped"
                );
                break;
            }

            let in_order = match sorted.iter().next_back() {
                Some((_, last)) => chunk.start >= *last.end(),
                None => true,
            };
            if in_order {
                sorted.insert(chunk.start, chunk);
            } else {
                unsorted.push(chunk);
            }

            offset += CHUNK_CTL_SIZE as u64 + ctl.bloom_size as u64;
        }

        tracing::info!(
            store = %self.prefix.display(),
            sorted = sorted.len(),
            unsorted = unsorted.len(),
            "chunk meta replayed"
        );
        Ok((sorted, unsorted))
    }

    fn validate_ctl(
        ctl: &ChunkCtl,
        offset: u64,
        meta_size: u64,
        data_size: u64,
    ) -> std::result::Result<(), &'static str> {
        if ctl.num <= 0 || ctl.bloom_size <= 0 {
            return Err("non-positive record or bloom count");
        }
        if offset + CHUNK_CTL_SIZE as u64 + ctl.bloom_size as u64 > meta_size {
            return Err("truncated bloom state");
        }
        if ctl
            .data_offset
            .checked_add(ctl.compressed_size)
            .map_or(true, |end| end > data_size)
        {
            return Err("chunk range past data file end");
        }
        if ctl.uncompressed_size < ctl.num as u64 * RECORD_SIZE as u64 {
            return Err("uncompressed size below record floor");
        }
        Ok(())
    }

    /// Stream a replayed chunk once to recover its key range and rebuild
    /// the rcache at the configured density.
    fn scan_chunk(&self, codec: &dyn Codec, chunk: &mut Chunk, rcache_budget: usize) -> Result<()> {
        let num = chunk.num();
        let step = rcache_step(num, rcache_budget);
        let mut dec = self.decoder(codec, chunk)?;
        let mut pos = 0u64;
        for i in 0..num {
            let key = Key::decode_from(&mut dec).map_err(Error::codec)?;
            let size = key.descriptor().data_size as u64;
            let copied = io::copy(&mut (&mut dec).take(size), &mut io::sink()).map_err(Error::codec)?;
            if copied != size {
                return Err(Error::CorruptChunkMeta(format!(
                    "short value stream: wanted {size}, got {copied}"
                )));
            }
            if i == 0 {
                chunk.start = key;
            }
            if i % step == 0 {
                chunk.rcache.insert(key, pos);
            }
            chunk.end = key;
            pos += RECORD_SIZE as u64 + size;
        }
        if pos != chunk.ctl.uncompressed_size {
            return Err(Error::CorruptChunkMeta(format!(
                "uncompressed size mismatch: ctl {} streamed {pos}",
                chunk.ctl.uncompressed_size
            )));
        }
        Ok(())
    }

    /// Append a chunk from `src` without recompressing: raw copy of the
    /// compressed bytes plus a fresh meta entry.
    pub(crate) fn write_raw(&self, chunk: &Chunk, src: &BlobStore) -> Result<Chunk> {
        let mut out = chunk.clone();
        let dst_offset = self.data.size();

        let mut buf = vec![0u8; 64 * 1024];
        let mut copied = 0u64;
        while copied < chunk.ctl.compressed_size {
            let n = (buf.len() as u64).min(chunk.ctl.compressed_size - copied) as usize;
            src.data.read(&mut buf[..n], chunk.ctl.data_offset + copied)?;
            self.data.write(&buf[..n], dst_offset + copied)?;
            copied += n as u64;
        }

        out.ctl.data_offset = dst_offset;
        self.append_meta(&out)?;

        tracing::debug!(
            store = %self.prefix.display(),
            start = %out.start,
            end = %out.end,
            num = out.num(),
            data_offset = dst_offset,
            compressed = out.ctl.compressed_size,
            "chunk copied raw"
        );
        Ok(out)
    }

    /// Bulk-copy one of this store's chunks into `dst`.
    pub(crate) fn copy_chunk(&self, chunk: &Chunk, dst: &BlobStore) -> Result<Chunk> {
        dst.write_raw(chunk, self)
    }

    pub(crate) fn truncate(&self) -> Result<()> {
        self.data.truncate(0)?;
        self.meta.truncate(0)?;
        Ok(())
    }

    pub(crate) fn forget(&self) {
        self.data.forget();
        self.meta.forget();
    }

    /// Data bytes on disk.
    pub(crate) fn size(&self) -> u64 {
        self.data.size()
    }

    pub(crate) fn meta_size(&self) -> u64 {
        self.meta.size()
    }

    fn append_meta(&self, chunk: &Chunk) -> Result<()> {
        let mut buf = Vec::with_capacity(CHUNK_CTL_SIZE + self.bloom_size);
        chunk.ctl.encode_into(&mut buf)?;
        buf.extend_from_slice(chunk.bloom.as_bytes());
        self.meta.write(&buf, self.meta.size())?;
        Ok(())
    }

    fn decoder<'a>(&'a self, codec: &dyn Codec, chunk: &Chunk) -> Result<Box<dyn Read + 'a>> {
        let reader = SectionReader::new(
            &self.data,
            chunk.ctl.data_offset,
            chunk.ctl.data_offset + chunk.ctl.compressed_size,
        );
        codec.decoder(Box::new(reader)).map_err(Error::codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ZstdCodec;
    use tempfile::TempDir;

    fn test_cache(count: usize) -> Cache {
        let mut cache = Cache::new();
        for i in 0..count {
            let name = format!("record-{i:05}");
            cache.insert(
                Key::hashed(&name),
                format!("payload-{name}\n").into_bytes(),
            );
        }
        cache
    }

    fn open_store(dir: &TempDir) -> BlobStore {
        BlobStore::open(&dir.path().join("b.0"), 128).unwrap()
    }

    #[test]
    fn test_store_and_point_read() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let codec = ZstdCodec::default();

        let mut cache = test_cache(300);
        let expected: Vec<(Key, Vec<u8>)> =
            cache.iter().map(|(k, v)| (*k, v.clone())).collect();

        let chunk = store.store_chunk(&codec, &mut cache, 1000, 64).unwrap();
        assert!(cache.is_empty());
        assert_eq!(chunk.num(), 300);
        assert_eq!(chunk.start, expected.first().unwrap().0);
        assert_eq!(chunk.end, expected.last().unwrap().0);

        for (key, value) in &expected {
            let got = store.chunk_read(&codec, key, &chunk).unwrap();
            assert_eq!(got.as_deref(), Some(value.as_slice()));
        }

        let absent = Key::hashed("never-written");
        assert!(store.chunk_read(&codec, &absent, &chunk).unwrap().is_none());
    }

    #[test]
    fn test_store_chunk_respects_max_records() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let codec = ZstdCodec::default();

        let mut cache = test_cache(250);
        let chunk = store.store_chunk(&codec, &mut cache, 100, 64).unwrap();
        assert_eq!(chunk.num(), 100);
        assert_eq!(cache.len(), 150);

        // The consumed prefix is exactly the first 100 keys.
        assert!(cache.keys().next().unwrap() > chunk.end());
    }

    #[test]
    fn test_store_chunk_empty_cache_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let codec = ZstdCodec::default();
        let mut cache = Cache::new();
        assert!(matches!(
            store.store_chunk(&codec, &mut cache, 10, 64),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rcache_sparsity() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let codec = ZstdCodec::default();

        let mut cache = test_cache(1000);
        let chunk = store.store_chunk(&codec, &mut cache, 1000, 64).unwrap();

        let step = rcache_step(1000, 64);
        assert!(chunk.rcache_len() <= 1000 / step + 1);
        assert!(chunk.rcache_len() >= 2);
    }

    #[test]
    fn test_read_chunk_keeps_existing_entries() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let codec = ZstdCodec::default();

        let key = Key::hashed("contested");
        let mut cache = Cache::new();
        cache.insert(key, b"old".to_vec());
        let chunk = store.store_chunk(&codec, &mut cache, 10, 64).unwrap();

        let mut out = Cache::new();
        out.insert(key, b"new".to_vec());
        store.read_chunk(&codec, &chunk, &mut out).unwrap();
        assert_eq!(out.get(&key).unwrap(), b"new");
    }

    #[test]
    fn test_replay_rebuilds_chunks() {
        let dir = TempDir::new().unwrap();
        let codec = ZstdCodec::default();
        let expected: Vec<(Key, Vec<u8>)>;
        {
            let store = open_store(&dir);
            let mut cache = test_cache(500);
            expected = cache.iter().map(|(k, v)| (*k, v.clone())).collect();
            // Two sorted chunks in creation order.
            store.store_chunk(&codec, &mut cache, 250, 64).unwrap();
            store.store_chunk(&codec, &mut cache, 250, 64).unwrap();
        }

        let store = open_store(&dir);
        let (sorted, unsorted) = store.replay_chunk_meta(&codec, 64).unwrap();
        assert_eq!(sorted.len(), 2);
        assert!(unsorted.is_empty());

        for (key, value) in &expected {
            let hit = sorted.values().find_map(|chunk| {
                store.chunk_read(&codec, key, chunk).unwrap()
            });
            assert_eq!(hit.as_deref(), Some(value.as_slice()));
        }
    }

    #[test]
    fn test_replay_classifies_overlap_as_unsorted() {
        let dir = TempDir::new().unwrap();
        let codec = ZstdCodec::default();
        {
            let store = open_store(&dir);
            let mut first = test_cache(100);
            store.store_chunk(&codec, &mut first, 100, 64).unwrap();
            // Same key population again: overlapping range.
            let mut second = test_cache(100);
            store.store_chunk(&codec, &mut second, 100, 64).unwrap();
        }

        let store = open_store(&dir);
        let (sorted, unsorted) = store.replay_chunk_meta(&codec, 64).unwrap();
        assert_eq!(sorted.len(), 1);
        assert_eq!(unsorted.len(), 1);
    }

    #[test]
    fn test_replay_stops_at_truncated_tail() {
        let dir = TempDir::new().unwrap();
        let codec = ZstdCodec::default();
        let meta_path;
        {
            let store = open_store(&dir);
            let mut cache = test_cache(300);
            store.store_chunk(&codec, &mut cache, 100, 64).unwrap();
            store.store_chunk(&codec, &mut cache, 100, 64).unwrap();
            store.store_chunk(&codec, &mut cache, 100, 64).unwrap();
            meta_path = store.meta.path().to_path_buf();
        }

        // Cut into the last meta entry.
        let len = std::fs::metadata(&meta_path).unwrap().len();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&meta_path)
            .unwrap();
        file.set_len(len - 37).unwrap();
        drop(file);

        let store = open_store(&dir);
        let (sorted, unsorted) = store.replay_chunk_meta(&codec, 64).unwrap();
        assert_eq!(sorted.len() + unsorted.len(), 2);
    }

    #[test]
    fn test_copy_chunk_between_stores() {
        let dir = TempDir::new().unwrap();
        let codec = ZstdCodec::default();
        let src = open_store(&dir);
        let dst = BlobStore::open(&dir.path().join("b.1"), 128).unwrap();

        let mut cache = test_cache(80);
        let expected: Vec<(Key, Vec<u8>)> =
            cache.iter().map(|(k, v)| (*k, v.clone())).collect();
        let chunk = src.store_chunk(&codec, &mut cache, 80, 64).unwrap();

        // Offset the destination so the copy does not land at zero.
        let mut filler = test_cache(10);
        dst.store_chunk(&codec, &mut filler, 10, 64).unwrap();

        let copied = src.copy_chunk(&chunk, &dst).unwrap();
        assert_ne!(copied.ctl().data_offset, chunk.ctl().data_offset);
        assert_eq!(copied.ctl().compressed_size, chunk.ctl().compressed_size);

        for (key, value) in &expected {
            let got = dst.chunk_read(&codec, key, &copied).unwrap();
            assert_eq!(got.as_deref(), Some(value.as_slice()));
        }
    }

    #[test]
    fn test_truncate_clears_store() {
        let dir = TempDir::new().unwrap();
        let codec = ZstdCodec::default();
        let store = open_store(&dir);

        let mut cache = test_cache(50);
        store.store_chunk(&codec, &mut cache, 50, 64).unwrap();
        assert!(store.size() > 0);
        assert!(store.meta_size() > 0);

        store.truncate().unwrap();
        assert_eq!(store.size(), 0);
        assert_eq!(store.meta_size(), 0);

        let (sorted, unsorted) = store.replay_chunk_meta(&codec, 64).unwrap();
        assert!(sorted.is_empty());
        assert!(unsorted.is_empty());
    }
}
