//! Minute Archive Format
//!
//! One archive holds every item a channel received in one minute, in key order:
//!
//! ```text
//! ┌───────────────────────────────┐
//! │ Header                        │
//! │  magic "CHBA"   version u16   │
//! │  entry count    u32           │
//! ├───────────────────────────────┤
//! │ Entry 1                       │
//! │  key length u16 | key url     │
//! │  item length u32 | item       │  (item format, see `codec::item`)
//! ├───────────────────────────────┤
//! │ ...                           │
//! ├───────────────────────────────┤
//! │ Footer                        │
//! │  crc32 u32      magic "CHBA"  │
//! └───────────────────────────────┘
//! ```
//!
//! Items keep their own compression, so reading one entry decompresses only that entry.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use chronohub_core::{Content, ContentKey};

use super::item::{decode_item, encode_item};
use crate::error::{Error, Result};

pub const ARCHIVE_MAGIC: [u8; 4] = *b"CHBA";
pub const ARCHIVE_VERSION: u16 = 1;

const HEADER_SIZE: usize = 10;
const FOOTER_SIZE: usize = 8;

/// Collects items for one minute and serializes them.
#[derive(Debug, Default)]
pub struct BatchArchiveWriter {
    entries: BTreeMap<ContentKey, Bytes>,
}

impl BatchArchiveWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a keyed item. A second add with the same key replaces the first.
    pub fn add(&mut self, content: &Content) -> Result<()> {
        let key = content
            .key()
            .cloned()
            .ok_or_else(|| Error::InvalidRequest("archived content needs a key".to_string()))?;
        self.entries.insert(key, encode_item(content)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> BTreeSet<ContentKey> {
        self.entries.keys().cloned().collect()
    }

    pub fn finish(self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(&ARCHIVE_MAGIC);
        buf.put_u16(ARCHIVE_VERSION);
        buf.put_u32(self.entries.len() as u32);

        for (key, item) in &self.entries {
            let url = key.to_url();
            buf.put_u16(url.len() as u16);
            buf.put_slice(url.as_bytes());
            buf.put_u32(item.len() as u32);
            buf.put_slice(item);
        }

        let crc = crc32fast::hash(&buf[..]);
        buf.put_u32(crc);
        buf.put_slice(&ARCHIVE_MAGIC);
        buf.freeze()
    }
}

/// A parsed archive. Entries are decoded lazily.
#[derive(Debug, Clone)]
pub struct BatchArchive {
    data: Bytes,
    entries: BTreeMap<ContentKey, Range<usize>>,
}

impl BatchArchive {
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(Error::Corrupt("archive too short".to_string()));
        }

        let footer_start = data.len() - FOOTER_SIZE;
        let mut footer = &data[footer_start..];
        let stored_crc = footer.get_u32();
        if footer[..4] != ARCHIVE_MAGIC {
            return Err(Error::Corrupt("archive footer magic mismatch".to_string()));
        }
        if stored_crc != crc32fast::hash(&data[..footer_start]) {
            return Err(Error::Corrupt("archive checksum mismatch".to_string()));
        }

        let mut cursor = &data[..footer_start];
        if cursor[..4] != ARCHIVE_MAGIC {
            return Err(Error::Corrupt("archive header magic mismatch".to_string()));
        }
        cursor.advance(4);
        let version = cursor.get_u16();
        if version != ARCHIVE_VERSION {
            return Err(Error::Corrupt(format!("unsupported archive version {}", version)));
        }
        let count = cursor.get_u32() as usize;

        let mut entries = BTreeMap::new();
        for _ in 0..count {
            if cursor.remaining() < 2 {
                return Err(Error::Corrupt("archive entry truncated".to_string()));
            }
            let url_len = cursor.get_u16() as usize;
            if cursor.remaining() < url_len + 4 {
                return Err(Error::Corrupt("archive entry truncated".to_string()));
            }
            let url = std::str::from_utf8(&cursor[..url_len])
                .map_err(|e| Error::Corrupt(format!("archive key: {}", e)))?;
            let key = ContentKey::from_url(url)
                .ok_or_else(|| Error::Corrupt(format!("archive key {}", url)))?;
            cursor.advance(url_len);

            let item_len = cursor.get_u32() as usize;
            if cursor.remaining() < item_len {
                return Err(Error::Corrupt(format!("archive item {} truncated", key)));
            }
            let start = footer_start - cursor.remaining();
            entries.insert(key, start..start + item_len);
            cursor.advance(item_len);
        }

        Ok(Self { data, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ContentKey> {
        self.entries.keys()
    }

    pub fn contains(&self, key: &ContentKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &ContentKey) -> Result<Option<Content>> {
        match self.entries.get(key) {
            Some(range) => decode_item(&self.data[range.clone()], key.clone()).map(Some),
            None => Ok(None),
        }
    }

    pub fn contents(&self) -> Result<BTreeMap<ContentKey, Content>> {
        self.entries
            .iter()
            .map(|(key, range)| {
                decode_item(&self.data[range.clone()], key.clone()).map(|c| (key.clone(), c))
            })
            .collect()
    }
}
