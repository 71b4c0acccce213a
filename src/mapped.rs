use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use memmap2::{MmapMut, MmapOptions, UncheckedAdvice};

/// Growth floor for the mapping; capacity doubles from here.
const MIN_CAPACITY: u64 = 1 << 20;

/// A growable file addressed through a writable memory map.
///
/// The logical size is tracked separately from the mapped capacity: the
/// file on disk is extended in large steps so the map is not remade on
/// every append, and cut back to the logical size when the handle is
/// dropped. Reads never see past the logical size.
pub struct MappedFile {
    path: PathBuf,
    inner: RwLock<Inner>,
}

struct Inner {
    file: File,
    map: Option<MmapMut>,
    size: u64,
    capacity: u64,
}

impl MappedFile {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        let map = if len > 0 {
            Some(unsafe { MmapOptions::new().map_mut(&file)? })
        } else {
            None
        };
        Ok(Self {
            path,
            inner: RwLock::new(Inner {
                file,
                map,
                size: len,
                capacity: len,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.read().unwrap().size
    }

    /// Fill `buf` from `offset`. Fails with `UnexpectedEof` when the
    /// range extends past the logical size.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let inner = self.inner.read().unwrap();
        let end = offset + buf.len() as u64;
        if end > inner.size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "read past end: offset {} len {} size {}",
                    offset,
                    buf.len(),
                    inner.size
                ),
            ));
        }
        let map = inner.map.as_ref().expect("non-empty file is mapped");
        buf.copy_from_slice(&map[offset as usize..end as usize]);
        Ok(())
    }

    /// Write `data` at `offset`, extending the file and the mapping as
    /// needed. Overlapping writes must be serialized by the caller.
    pub fn write(&self, data: &[u8], offset: u64) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write().unwrap();
        let end = offset + data.len() as u64;
        if end > inner.capacity {
            let mut capacity = inner.capacity.max(MIN_CAPACITY);
            while capacity < end {
                capacity *= 2;
            }
            inner.map = None;
            inner.file.set_len(capacity)?;
            let map = unsafe { MmapOptions::new().map_mut(&inner.file)? };
            inner.map = Some(map);
            inner.capacity = capacity;
        }
        let map = inner.map.as_mut().expect("grown file is mapped");
        map[offset as usize..end as usize].copy_from_slice(data);
        inner.size = inner.size.max(end);
        Ok(())
    }

    pub fn truncate(&self, len: u64) -> io::Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.map = None;
        inner.file.set_len(len)?;
        let map = if len > 0 {
            Some(unsafe { MmapOptions::new().map_mut(&inner.file)? })
        } else {
            None
        };
        inner.map = map;
        inner.size = len;
        inner.capacity = len;
        Ok(())
    }

    /// Advise the OS that resident pages are no longer needed. The
    /// mapping is file-backed and shared, so dropped pages re-fault from
    /// disk.
    pub fn forget(&self) {
        let inner = self.inner.read().unwrap();
        if let Some(map) = inner.map.as_ref() {
            let _ = unsafe { map.unchecked_advise(UncheckedAdvice::DontNeed) };
        }
    }

}

impl Drop for MappedFile {
    fn drop(&mut self) {
        // Cut the growth padding so a reopened file's length equals the
        // logical size. Files that were never grown are left alone; the
        // store-selection logic compares mtimes and an idle sibling must
        // not look freshly written.
        if let Ok(mut inner) = self.inner.write() {
            if let Some(map) = inner.map.take() {
                let _ = map.flush();
            }
            if inner.capacity != inner.size {
                let size = inner.size;
                let _ = inner.file.set_len(size);
            }
        }
    }
}

/// Bounded reader over `[offset, end)` of a mapped file, for wrapping a
/// decompressor around a chunk's bytes.
pub struct SectionReader<'a> {
    file: &'a MappedFile,
    pos: u64,
    end: u64,
}

impl<'a> SectionReader<'a> {
    pub fn new(file: &'a MappedFile, offset: u64, end: u64) -> Self {
        Self {
            file,
            pos: offset,
            end,
        }
    }
}

impl Read for SectionReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.end.saturating_sub(self.pos);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.file.read(&mut buf[..n], self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// Appending writer starting at a fixed offset, for wrapping a
/// compressor around the data file.
pub struct AppendWriter<'a> {
    file: &'a MappedFile,
    pos: u64,
}

impl<'a> AppendWriter<'a> {
    pub fn new(file: &'a MappedFile, offset: u64) -> Self {
        Self { file, pos: offset }
    }

    /// Offset one past the last byte written.
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl Write for AppendWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf, self.pos)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_path(dir: &TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let file = MappedFile::open(temp_path(&dir, "a.data")).unwrap();

        file.write(b"hello", 0).unwrap();
        file.write(b"world", 5).unwrap();
        assert_eq!(file.size(), 10);

        let mut buf = [0u8; 10];
        file.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"helloworld");

        let mut mid = [0u8; 4];
        file.read(&mut mid, 3).unwrap();
        assert_eq!(&mid, b"lowo");
    }

    #[test]
    fn test_read_past_end_fails() {
        let dir = TempDir::new().unwrap();
        let file = MappedFile::open(temp_path(&dir, "b.data")).unwrap();
        file.write(b"abc", 0).unwrap();

        let mut buf = [0u8; 4];
        let err = file.read(&mut buf, 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_growth_past_capacity() {
        let dir = TempDir::new().unwrap();
        let file = MappedFile::open(temp_path(&dir, "c.data")).unwrap();

        let blob = vec![7u8; 3 << 20];
        file.write(&blob, 0).unwrap();
        assert_eq!(file.size(), 3 << 20);

        let mut tail = [0u8; 16];
        file.read(&mut tail, (3 << 20) - 16).unwrap();
        assert!(tail.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_drop_restores_logical_size() {
        let dir = TempDir::new().unwrap();
        let path = temp_path(&dir, "d.data");
        {
            let file = MappedFile::open(&path).unwrap();
            file.write(b"0123456789", 0).unwrap();
            // The on-disk file is padded out to the growth capacity here.
            assert!(std::fs::metadata(&path).unwrap().len() >= 10);
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);

        let reopened = MappedFile::open(&path).unwrap();
        assert_eq!(reopened.size(), 10);
        let mut buf = [0u8; 10];
        reopened.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"0123456789");
    }

    #[test]
    fn test_truncate() {
        let dir = TempDir::new().unwrap();
        let file = MappedFile::open(temp_path(&dir, "e.data")).unwrap();
        file.write(b"some bytes here", 0).unwrap();

        file.truncate(4).unwrap();
        assert_eq!(file.size(), 4);
        let mut buf = [0u8; 4];
        file.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"some");

        file.truncate(0).unwrap();
        assert_eq!(file.size(), 0);
        file.write(b"fresh", 0).unwrap();
        assert_eq!(file.size(), 5);
    }

    #[test]
    fn test_section_reader_bounds() {
        let dir = TempDir::new().unwrap();
        let file = MappedFile::open(temp_path(&dir, "f.data")).unwrap();
        file.write(b"abcdefgh", 0).unwrap();

        let mut section = SectionReader::new(&file, 2, 6);
        let mut out = Vec::new();
        section.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"cdef");
    }

    #[test]
    fn test_append_writer_tracks_position() {
        let dir = TempDir::new().unwrap();
        let file = MappedFile::open(temp_path(&dir, "g.data")).unwrap();
        file.write(b"prefix::", 0).unwrap();

        let mut writer = AppendWriter::new(&file, file.size());
        writer.write_all(b"one").unwrap();
        writer.write_all(b"two").unwrap();
        assert_eq!(writer.position(), 14);

        let mut buf = [0u8; 14];
        file.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"prefix::onetwo");
    }
}
