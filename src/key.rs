use std::cmp::Ordering;
use std::fmt;
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha512};

/// Width of a key identifier in bytes.
pub const KEY_SIZE: usize = 64;

/// On-disk size of a record descriptor: the id plus the packed header.
pub const RECORD_SIZE: usize = KEY_SIZE + 8 + 8 + 4 + 4;

/// Record header embedded in every key.
///
/// `data_offset` and `data_size` locate the value inside the chunk the
/// record was last stored in; `timestamp` and `flags` belong to the
/// caller and are carried verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct Descriptor {
    pub timestamp: u64,
    pub data_offset: u64,
    pub data_size: u32,
    pub flags: u32,
}

/// A fixed-width binary key.
///
/// Keys order and compare by the id bytes alone; the embedded descriptor
/// never participates, so the in-memory copy of a key and the on-disk
/// copy of the same key are interchangeable as map keys.
#[derive(Clone, Copy)]
pub struct Key {
    id: [u8; KEY_SIZE],
    desc: Descriptor,
}

impl Key {
    /// All-zero key, smaller than or equal to every other key.
    pub fn zero() -> Self {
        Self {
            id: [0u8; KEY_SIZE],
            desc: Descriptor::default(),
        }
    }

    /// Build a key from raw id bytes. Shorter ids are zero-padded;
    /// longer ones are truncated to [`KEY_SIZE`].
    pub fn from_id(id: &[u8]) -> Self {
        let mut key = Self::zero();
        let n = id.len().min(KEY_SIZE);
        key.id[..n].copy_from_slice(&id[..n]);
        key
    }

    /// Build a key by hashing a string: SHA-512 of the UTF-8 bytes,
    /// truncated to [`KEY_SIZE`]. The timestamp is set to the current
    /// UNIX time in seconds.
    pub fn hashed(name: &str) -> Self {
        let digest = Sha512::digest(name.as_bytes());
        let mut key = Self::from_id(digest.as_slice());
        key.desc.timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        key
    }

    pub fn id(&self) -> &[u8; KEY_SIZE] {
        &self.id
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    pub fn descriptor_mut(&mut self) -> &mut Descriptor {
        &mut self.desc
    }

    /// Full lowercase hex form of the id.
    pub fn hex(&self) -> String {
        let mut out = String::with_capacity(KEY_SIZE * 2);
        for b in &self.id {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }

    /// Serialize the record descriptor in its packed on-disk layout:
    /// `id[64], timestamp u64, data_offset u64, data_size u32, flags u32`,
    /// all little-endian.
    pub fn encode_into<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&self.id)?;
        w.write_u64::<LittleEndian>(self.desc.timestamp)?;
        w.write_u64::<LittleEndian>(self.desc.data_offset)?;
        w.write_u32::<LittleEndian>(self.desc.data_size)?;
        w.write_u32::<LittleEndian>(self.desc.flags)?;
        Ok(())
    }

    pub fn decode_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let mut id = [0u8; KEY_SIZE];
        r.read_exact(&mut id)?;
        let timestamp = r.read_u64::<LittleEndian>()?;
        let data_offset = r.read_u64::<LittleEndian>()?;
        let data_size = r.read_u32::<LittleEndian>()?;
        let flags = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            id,
            desc: Descriptor {
                timestamp,
                data_offset,
                data_size,
                flags,
            },
        })
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Shortened form for logs; hex() has the full id.
        for b in &self.id[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.to_string())
            .field("desc", &self.desc)
            .finish()
    }
}
