//! Content Item Format
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ magic "CHIT"          4 bytes        │
//! │ version               u16            │
//! │ flags                 u16 (bit 0 = LZ4)
//! │ meta length           u32            │
//! │ meta                  JSON           │
//! │ payload length        u32            │
//! │ payload               raw or LZ4     │
//! │ crc32                 u32            │
//! └──────────────────────────────────────┘
//! ```
//!
//! The key is not stored: it is the item's path. Payloads shorter than [`COMPRESS_MIN_BYTES`]
//! are stored raw.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use chronohub_core::{Content, ContentKey};

use crate::error::{Error, Result};

pub const ITEM_MAGIC: [u8; 4] = *b"CHIT";
pub const ITEM_VERSION: u16 = 1;
pub const COMPRESS_MIN_BYTES: usize = 256;

const FLAG_LZ4: u16 = 1;
const FOOTER_SIZE: usize = 4;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_language: Option<String>,
    size: u64,
    #[serde(default)]
    large: bool,
}

/// Serializes `content` without its key.
pub fn encode_item(content: &Content) -> Result<Bytes> {
    let meta = serde_json::to_vec(&ItemMeta {
        content_type: content.content_type().map(str::to_string),
        content_language: content.content_language().map(str::to_string),
        size: content.size(),
        large: content.is_large(),
    })?;

    let data = content.data();
    let (flags, payload) = if data.len() >= COMPRESS_MIN_BYTES {
        (FLAG_LZ4, Bytes::from(lz4_flex::compress_prepend_size(data)))
    } else {
        (0, data.clone())
    };

    let mut buf = BytesMut::with_capacity(16 + meta.len() + payload.len() + FOOTER_SIZE);
    buf.put_slice(&ITEM_MAGIC);
    buf.put_u16(ITEM_VERSION);
    buf.put_u16(flags);
    buf.put_u32(meta.len() as u32);
    buf.put_slice(&meta);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);

    let crc = crc32fast::hash(&buf[..]);
    buf.put_u32(crc);
    Ok(buf.freeze())
}

/// Parses an item written by [`encode_item`] and attaches `key`.
pub fn decode_item(data: &[u8], key: ContentKey) -> Result<Content> {
    if data.len() < 16 + FOOTER_SIZE {
        return Err(Error::Corrupt(format!("item {} too short", key)));
    }
    let body_len = data.len() - FOOTER_SIZE;
    let stored_crc = (&data[body_len..]).get_u32();
    if stored_crc != crc32fast::hash(&data[..body_len]) {
        return Err(Error::Corrupt(format!("item {} checksum mismatch", key)));
    }

    let mut cursor = &data[..body_len];
    let mut magic = [0u8; 4];
    cursor.copy_to_slice(&mut magic);
    if magic != ITEM_MAGIC {
        return Err(Error::Corrupt(format!("item {} bad magic", key)));
    }
    let version = cursor.get_u16();
    if version != ITEM_VERSION {
        return Err(Error::Corrupt(format!("item {} unsupported version {}", key, version)));
    }
    let flags = cursor.get_u16();

    let meta_len = cursor.get_u32() as usize;
    if cursor.remaining() < meta_len + 4 {
        return Err(Error::Corrupt(format!("item {} truncated meta", key)));
    }
    let meta: ItemMeta = serde_json::from_slice(&cursor[..meta_len])?;
    cursor.advance(meta_len);

    let payload_len = cursor.get_u32() as usize;
    if cursor.remaining() != payload_len {
        return Err(Error::Corrupt(format!("item {} truncated payload", key)));
    }
    let payload = if flags & FLAG_LZ4 != 0 {
        Bytes::from(
            lz4_flex::decompress_size_prepended(cursor)
                .map_err(|e| Error::Corrupt(format!("item {}: {}", key, e)))?,
        )
    } else {
        Bytes::copy_from_slice(cursor)
    };

    let mut content = Content::new(payload).with_key(key);
    if let Some(content_type) = meta.content_type {
        content = content.with_content_type(content_type);
    }
    if let Some(language) = meta.content_language {
        content = content.with_content_language(language);
    }
    content.set_size(meta.size);
    content.set_large(meta.large);
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ContentKey {
        ContentKey::from_url("2024/01/01/00/00/00/000/abc").unwrap()
    }

    #[test]
    fn test_small_item_is_stored_raw() {
        let content = Content::new("hello").with_content_type("text/plain");
        let bytes = encode_item(&content).unwrap();
        assert_eq!(&bytes[0..4], &ITEM_MAGIC);
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), 0);

        let decoded = decode_item(&bytes, key()).unwrap();
        assert_eq!(decoded.data().as_ref(), b"hello");
        assert_eq!(decoded.content_type(), Some("text/plain"));
        assert_eq!(decoded.key(), Some(&key()));
        assert_eq!(decoded.size(), 5);
    }

    #[test]
    fn test_large_payload_is_compressed() {
        let data = vec![b'x'; 64 * 1024];
        let content = Content::new(data.clone()).with_content_language("en");
        let bytes = encode_item(&content).unwrap();
        assert!(bytes.len() < data.len() / 4);

        let decoded = decode_item(&bytes, key()).unwrap();
        assert_eq!(decoded.data().as_ref(), &data[..]);
        assert_eq!(decoded.content_language(), Some("en"));
    }

    #[test]
    fn test_corruption_is_detected() {
        let bytes = encode_item(&Content::new("payload")).unwrap();
        let mut corrupted = bytes.to_vec();
        corrupted[20] ^= 0xff;
        assert!(matches!(decode_item(&corrupted, key()), Err(Error::Corrupt(_))));
        assert!(matches!(
            decode_item(&bytes[..bytes.len() - 2], key()),
            Err(Error::Corrupt(_))
        ));
    }
}
