//! The per-shard blob engine.
//!
//! A blob buffers writes in a sorted in-memory cache, flushes that cache
//! as compressed bloom-filtered chunks onto a data file, and merges every
//! chunk back into one sorted sequence during resort, ping-ponging
//! between two on-disk stores so the previous state survives until the
//! new one is complete.
//!
//! ```text
//!  write/remove          flush                    resort
//! ┌───────────┐   ┌──────────────────┐   ┌─────────────────────────┐
//! │  wcache   │──▶│ unsorted chunks  │──▶│ single sorted sequence  │
//! │ rm-cache  │   │   (store N)      │   │      (store 1-N)        │
//! └───────────┘   └──────────────────┘   └─────────────────────────┘
//! ```
//!
//! Two locks coordinate the engine: the write lock guards the caches,
//! the disk lock guards the chunk sets and the active store. The write
//! lock is always taken before the disk lock, never the other way
//! around.

pub mod chunk;
pub(crate) mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::codec::{Codec, ZstdCodec};
use crate::config::BlobConfig;
use crate::error::{Error, Result};
use crate::key::Key;

use self::chunk::Chunk;
use self::store::{BlobStore, Cache};

struct WriteState {
    wcache: Cache,
    remove_cache: BTreeSet<Key>,
}

struct DiskState {
    stores: [BlobStore; 2],
    active: usize,
    chunks_sorted: BTreeMap<Key, Chunk>,
    chunks_unsorted: Vec<Chunk>,
    split_dst: Option<Arc<Blob>>,
    split_start: Option<Key>,
    want_resort: bool,
    last_average_key: Option<Key>,
    start: Option<Key>,
}

impl DiskState {
    fn active_store(&self) -> &BlobStore {
        &self.stores[self.active]
    }
}

/// The shard-level engine. See the module docs for the moving parts;
/// the enclosing router drives `flush` from its own workers and reacts
/// to the overflow hints returned by the mutating operations.
pub struct Blob {
    config: BlobConfig,
    codec: Arc<dyn Codec>,
    write: Mutex<WriteState>,
    disk: Mutex<DiskState>,
}

impl Blob {
    /// Open a blob with the consumer-contract parameters.
    pub fn new(path: impl Into<PathBuf>, bloom_size: usize, cache_size: usize) -> Result<Self> {
        Self::open(
            BlobConfig::new(path)
                .bloom_size(bloom_size)
                .cache_size(cache_size),
        )
    }

    /// Open a blob with the default zstd codec.
    pub fn open(config: BlobConfig) -> Result<Self> {
        let codec = Arc::new(ZstdCodec::new(config.compression_level));
        Self::open_with_codec(config, codec)
    }

    /// Open a blob with a caller-provided codec. The codec choice is
    /// fixed for the blob's lifetime; the on-disk chunks must have been
    /// written with the same codec.
    pub fn open_with_codec(config: BlobConfig, codec: Arc<dyn Codec>) -> Result<Self> {
        if config.bloom_size == 0 {
            return Err(Error::InvalidInput("bloom_size must be non-zero".into()));
        }
        if config.cache_size == 0 {
            return Err(Error::InvalidInput("cache_size must be non-zero".into()));
        }
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Pick the store written last: greater mtime, ties to the larger
        // file. Stat before opening so creating the missing sibling does
        // not disturb the comparison.
        let mut active = 0usize;
        let mut best: Option<(SystemTime, u64)> = None;
        for i in 0..2 {
            let prefix = Self::store_prefix(&config.path, i);
            if let Ok(md) = std::fs::metadata(BlobStore::data_path(&prefix)) {
                let mtime = md.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                let size = md.len();
                let wins = match best {
                    None => true,
                    Some((best_mtime, best_size)) => {
                        mtime > best_mtime || (mtime == best_mtime && size > best_size)
                    }
                };
                if wins {
                    best = Some((mtime, size));
                    active = i;
                }
            }
        }

        let stores = [
            BlobStore::open(&Self::store_prefix(&config.path, 0), config.bloom_size)?,
            BlobStore::open(&Self::store_prefix(&config.path, 1), config.bloom_size)?,
        ];

        let (chunks_sorted, chunks_unsorted) = if best.is_some() {
            stores[active].replay_chunk_meta(&*codec, config.rcache_budget)?
        } else {
            (BTreeMap::new(), Vec::new())
        };

        let want_resort = !chunks_unsorted.is_empty();
        let start = chunks_sorted.keys().next().copied();
        tracing::info!(
            path = %config.path.display(),
            active,
            sorted = chunks_sorted.len(),
            unsorted = chunks_unsorted.len(),
            "blob opened"
        );

        Ok(Self {
            config,
            codec,
            write: Mutex::new(WriteState {
                wcache: Cache::new(),
                remove_cache: BTreeSet::new(),
            }),
            disk: Mutex::new(DiskState {
                stores,
                active,
                chunks_sorted,
                chunks_unsorted,
                split_dst: None,
                split_start: None,
                want_resort,
                last_average_key: None,
                start,
            }),
        })
    }

    fn store_prefix(path: &Path, idx: usize) -> PathBuf {
        let mut os = path.as_os_str().to_os_string();
        os.push(format!(".{idx}"));
        PathBuf::from(os)
    }

    /// Buffer a write. Returns true when the write cache reached the
    /// configured size and a flush is due.
    pub fn write(&self, key: Key, value: &[u8]) -> bool {
        let mut w = self.write.lock().unwrap();
        w.remove_cache.remove(&key);
        w.wcache.insert(key, value.to_vec());
        w.wcache.len() >= self.config.cache_size
    }

    /// Read the newest state of a key: the remove cache beats the write
    /// cache beats the disk chunks.
    pub fn read(&self, key: &Key) -> Result<Vec<u8>> {
        let write_guard = self.write.lock().unwrap();
        if write_guard.remove_cache.contains(key) {
            return Err(Error::Removed);
        }
        if let Some(value) = write_guard.wcache.get(key) {
            return Ok(value.clone());
        }

        // Take the disk lock before releasing the write lock, so a
        // concurrent flush cannot retire the wcache between "not in
        // wcache" and "not on disk".
        let disk = self.disk.lock().unwrap();
        drop(write_guard);

        let codec = &*self.codec;
        let store = disk.active_store();

        if !disk.chunks_sorted.is_empty() {
            // The two candidates around the partition point: the first
            // chunk starting past the key and its predecessor. Covers a
            // key sitting exactly on a chunk's start or end.
            let upper = disk
                .chunks_sorted
                .range((Bound::Excluded(*key), Bound::Unbounded))
                .next();
            if let Some((_, ch)) = upper {
                if let Some(value) = store.chunk_read(codec, key, ch)? {
                    return Ok(value);
                }
            }
            if let Some((_, ch)) = disk.chunks_sorted.range(..=*key).next_back() {
                if let Some(value) = store.chunk_read(codec, key, ch)? {
                    return Ok(value);
                }
            }
        }

        // Unsorted chunks may overlap; newest wins, so probe in reverse
        // creation order.
        for ch in disk.chunks_unsorted.iter().rev() {
            if !ch.contains(key) {
                continue;
            }
            if let Some(value) = store.chunk_read(codec, key, ch)? {
                return Ok(value);
            }
        }

        Err(Error::NoData)
    }

    /// Mark a key removed. Returns true when the remove cache outgrew
    /// the configured size.
    pub fn remove(&self, key: &Key) -> bool {
        let mut w = self.write.lock().unwrap();
        w.remove_cache.insert(*key);
        w.wcache.remove(key);
        w.remove_cache.len() > self.config.cache_size
    }

    /// Push buffered writes to disk. Writes land as unsorted chunks
    /// until too many pile up, a split is pending, or a resort was
    /// requested; then the whole blob is rewritten sorted onto the
    /// sibling store.
    pub fn flush(&self) -> Result<bool> {
        let mut tmp = {
            let mut w = self.write.lock().unwrap();
            std::mem::take(&mut w.wcache)
        };

        let pending_split = {
            let mut disk = self.disk.lock().unwrap();
            if disk.chunks_unsorted.len() > self.config.resort_threshold
                || disk.split_dst.is_some()
                || disk.want_resort
            {
                self.resort(&mut disk, &mut tmp)?
            } else {
                if !tmp.is_empty() {
                    self.write_cache_to_chunks(&mut disk, &mut tmp, false)?;
                }
                None
            }
        };

        // Writes that raced into the wcache while the resort ran and
        // belong to the destination move over now. The disk lock is no
        // longer held; the write lock is taken fresh, preserving the
        // write-before-disk order.
        if let Some((dst, split_start)) = pending_split {
            let moved = {
                let mut w = self.write.lock().unwrap();
                w.wcache.split_off(&split_start)
            };
            for (key, value) in moved {
                dst.write(key, &value);
            }
        }

        Ok(self.write.lock().unwrap().wcache.len() >= self.config.cache_size)
    }

    /// Current data bytes on disk and whether a split is pending.
    pub fn size(&self) -> (u64, bool) {
        let disk = self.disk.lock().unwrap();
        (disk.active_store().size(), disk.split_dst.is_some())
    }

    /// Number of unsorted chunks currently on disk.
    pub fn have_unsorted_chunks(&self) -> usize {
        self.disk.lock().unwrap().chunks_unsorted.len()
    }

    /// First key of the blob's sorted range, or the zero key before the
    /// first resort.
    pub fn start(&self) -> Key {
        self.disk.lock().unwrap().start.unwrap_or_else(Key::zero)
    }

    /// Arm a split: at the next resort every key at or above the last
    /// midpoint key migrates into `dst`. A no-op when a split is already
    /// pending.
    pub fn set_split_dst(&self, dst: Arc<Blob>) {
        let mut disk = self.disk.lock().unwrap();
        if disk.split_dst.is_some() {
            return;
        }
        let split_start = disk.last_average_key.unwrap_or_else(Key::zero);
        dst.set_start(split_start);
        tracing::info!(
            path = %self.config.path.display(),
            split_start = %split_start,
            "split destination set"
        );
        disk.split_start = Some(split_start);
        disk.split_dst = Some(dst);
    }

    pub(crate) fn set_start(&self, key: Key) {
        self.disk.lock().unwrap().start = Some(key);
    }

    /// Merge-compact every chunk plus `tmp` into a sorted sequence on
    /// the sibling store. Returns the armed split, if any, for the
    /// caller to finish the wcache migration outside the disk lock.
    fn resort(
        &self,
        disk: &mut DiskState,
        tmp: &mut Cache,
    ) -> Result<Option<(Arc<Blob>, Key)>> {
        // Freshest source first: tmp already holds the newest writes,
        // unsorted chunks beat sorted ones, and a newer unsorted chunk
        // beats an older one. read_chunk keeps existing entries, so
        // this order makes the newest value win.
        {
            let store = disk.active_store();
            for ch in disk.chunks_unsorted.iter().rev() {
                store.read_chunk(&*self.codec, ch, tmp)?;
            }
            for ch in disk.chunks_sorted.values() {
                store.read_chunk(&*self.codec, ch, tmp)?;
            }
        }
        disk.chunks_unsorted.clear();
        disk.chunks_sorted.clear();
        disk.active_store().forget();

        let prev = disk.active;
        disk.active = (disk.active + 1) % disk.stores.len();
        disk.active_store().truncate()?;
        tracing::info!(
            path = %self.config.path.display(),
            from = prev,
            to = disk.active,
            keys = tmp.len(),
            "resort"
        );

        let pending = match (disk.split_dst.clone(), disk.split_start) {
            (Some(dst), Some(split_start)) => {
                let moved = tmp.split_off(&split_start);
                let moved_count = moved.len();
                for (key, value) in moved {
                    dst.write(key, &value);
                }
                tracing::info!(
                    path = %self.config.path.display(),
                    split_start = %split_start,
                    moved = moved_count,
                    kept = tmp.len(),
                    "split migrated"
                );
                disk.split_dst = None;
                disk.split_start = None;
                Some((dst, split_start))
            }
            _ => None,
        };

        if !tmp.is_empty() {
            self.write_cache_to_chunks(disk, tmp, true)?;
        }

        // The old store falls away only now that the new one is
        // complete; a crash anywhere above leaves it intact and the
        // mtime comparison at open picks whichever store finished last.
        disk.stores[prev].truncate()?;

        disk.want_resort = false;
        disk.start = disk.chunks_sorted.keys().next().copied();
        Ok(pending)
    }

    /// Drain `tmp` into chunks. The last batch is stretched up to half a
    /// cache size so no tiny remainder chunk is written.
    fn write_cache_to_chunks(
        &self,
        disk: &mut DiskState,
        tmp: &mut Cache,
        sorted: bool,
    ) -> Result<()> {
        while !tmp.is_empty() {
            let batch = if tmp.len() < self.config.cache_size * 3 / 2 {
                tmp.len()
            } else {
                self.config.cache_size
            };
            self.write_chunk(disk, tmp, batch, sorted)?;
        }
        Ok(())
    }

    fn write_chunk(
        &self,
        disk: &mut DiskState,
        cache: &mut Cache,
        num: usize,
        sorted: bool,
    ) -> Result<()> {
        let average = cache.keys().nth(cache.len() / 2).copied();
        let chunk = disk.active_store().store_chunk(
            &*self.codec,
            cache,
            num,
            self.config.rcache_budget,
        )?;
        if let Some(key) = average {
            disk.last_average_key = Some(key);
        }
        if sorted {
            disk.chunks_sorted.insert(chunk.start, chunk);
        } else {
            disk.chunks_unsorted.push(chunk);
        }
        Ok(())
    }
}
