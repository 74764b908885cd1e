use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, TarnError};
use crate::pager::{PageNum, Pager};

pub mod btree;
pub mod hash;

pub use btree::BTreeIndex;
pub use hash::HashIndex;

/// On-disk organisation of a table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexKind {
    BTree,
    Hash,
}

impl IndexKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::BTree => "btree",
            IndexKind::Hash => "hash",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "btree" => Some(IndexKind::BTree),
            "hash" => Some(IndexKind::Hash),
            _ => None,
        }
    }
}

/// A single key/value pair. Keys and values are fixed-width 64-bit signed
/// integers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Entry {
    pub key: i64,
    pub value: i64,
}

/// Common surface of both index organisations, as consumed by the command
/// dispatcher, the recovery manager and the join.
pub trait Index: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> IndexKind;
    fn pager(&self) -> &Pager;
    /// Point insert; fails with `Duplicate` if the key exists.
    fn insert(&self, key: i64, value: i64) -> Result<()>;
    /// Point update; fails with `NotFound` if the key is absent.
    fn update(&self, key: i64, value: i64) -> Result<()>;
    /// Point delete; fails with `NotFound` if the key is absent.
    fn delete(&self, key: i64) -> Result<()>;
    fn find(&self, key: i64) -> Result<i64>;
    /// Full scan: key order for a B+-tree, unspecified order for a hash
    /// table.
    fn select(&self) -> Result<Vec<Entry>>;
    /// Persists pages and index metadata.
    fn flush(&self) -> Result<()>;
}

const META_MAGIC: &[u8; 8] = b"TARNMETA";
const KIND_BTREE: u8 = 1;
const KIND_HASH: u8 = 2;

/// Parsed contents of a table's `.meta` companion file.
#[derive(Clone, Debug)]
pub(crate) enum MetaPayload {
    BTree {
        root: PageNum,
    },
    Hash {
        global_depth: u32,
        directory: Vec<PageNum>,
    },
}

impl MetaPayload {
    pub(crate) fn kind(&self) -> IndexKind {
        match self {
            MetaPayload::BTree { .. } => IndexKind::BTree,
            MetaPayload::Hash { .. } => IndexKind::Hash,
        }
    }
}

pub(crate) fn meta_path(data_path: &Path) -> PathBuf {
    let mut os_string = data_path.as_os_str().to_owned();
    os_string.push(".meta");
    PathBuf::from(os_string)
}

pub(crate) fn write_meta(data_path: &Path, page_count: i64, payload: &MetaPayload) -> Result<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(META_MAGIC);
    match payload {
        MetaPayload::BTree { root } => {
            buf.push(KIND_BTREE);
            buf.extend_from_slice(&page_count.to_le_bytes());
            buf.extend_from_slice(&root.to_le_bytes());
        }
        MetaPayload::Hash {
            global_depth,
            directory,
        } => {
            buf.push(KIND_HASH);
            buf.extend_from_slice(&page_count.to_le_bytes());
            buf.extend_from_slice(&global_depth.to_le_bytes());
            buf.extend_from_slice(&(directory.len() as u64).to_le_bytes());
            for page_num in directory {
                buf.extend_from_slice(&page_num.to_le_bytes());
            }
        }
    }
    let checksum = crc32fast::hash(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    let mut file = File::create(meta_path(data_path))?;
    file.write_all(&buf)?;
    file.sync_data()?;
    Ok(())
}

pub(crate) fn read_meta(data_path: &Path) -> Result<(i64, MetaPayload)> {
    let mut buf = Vec::new();
    File::open(meta_path(data_path))?.read_to_end(&mut buf)?;
    if buf.len() < META_MAGIC.len() + 1 + 8 + 4 {
        return Err(TarnError::Corrupt("meta file truncated".into()));
    }
    let (body, checksum_bytes) = buf.split_at(buf.len() - 4);
    let stored = u32::from_le_bytes([
        checksum_bytes[0],
        checksum_bytes[1],
        checksum_bytes[2],
        checksum_bytes[3],
    ]);
    if crc32fast::hash(body) != stored {
        return Err(TarnError::Corrupt("meta file checksum mismatch".into()));
    }
    if &body[..META_MAGIC.len()] != META_MAGIC {
        return Err(TarnError::Corrupt("meta file has wrong magic".into()));
    }
    let mut reader = MetaReader {
        body,
        offset: META_MAGIC.len(),
    };
    let kind = reader.read_u8()?;
    let page_count = reader.read_i64()?;
    let payload = match kind {
        KIND_BTREE => MetaPayload::BTree {
            root: reader.read_i64()?,
        },
        KIND_HASH => {
            let global_depth = reader.read_u32()?;
            if global_depth > 32 {
                return Err(TarnError::Corrupt(format!(
                    "implausible hash global depth {global_depth}"
                )));
            }
            let len = reader.read_u64()? as usize;
            if len != 1usize << global_depth {
                return Err(TarnError::Corrupt(
                    "hash directory length does not match global depth".into(),
                ));
            }
            let mut directory = Vec::with_capacity(len);
            for _ in 0..len {
                directory.push(reader.read_i64()?);
            }
            MetaPayload::Hash {
                global_depth,
                directory,
            }
        }
        other => {
            return Err(TarnError::Corrupt(format!(
                "unknown index kind {other} in meta file"
            )))
        }
    };
    Ok((page_count, payload))
}

struct MetaReader<'a> {
    body: &'a [u8],
    offset: usize,
}

impl<'a> MetaReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.offset + len;
        let slice = self
            .body
            .get(self.offset..end)
            .ok_or_else(|| TarnError::Corrupt("meta file truncated".into()))?;
        self.offset = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(arr))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(arr))
    }
}
