//! Items stored in a channel.
//!
//! Payloads above the large-payload threshold do not travel through the fast tier. They are
//! written to the large payload store and a small [`LargeIndex`] record takes their place, marked
//! by the [`LARGE_INDEX_CONTENT_TYPE`] content type.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::key::ContentKey;

pub const LARGE_INDEX_CONTENT_TYPE: &str = "application/x-chronohub-large-index";

/// A payload plus its metadata. Equality compares payload bytes by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Content {
    key: Option<ContentKey>,
    content_type: Option<String>,
    content_language: Option<String>,
    data: Bytes,
    size: u64,
    large: bool,
}

impl Content {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            key: None,
            content_type: None,
            content_language: None,
            size: data.len() as u64,
            data,
            large: false,
        }
    }

    pub fn with_key(mut self, key: ContentKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_language(mut self, language: impl Into<String>) -> Self {
        self.content_language = Some(language.into());
        self
    }

    /// Flags the payload as large when it exceeds `threshold` bytes.
    pub fn with_large_threshold(mut self, threshold: u64) -> Self {
        self.large = self.size > threshold;
        self
    }

    pub fn key(&self) -> Option<&ContentKey> {
        self.key.as_ref()
    }

    pub fn set_key(&mut self, key: ContentKey) {
        self.key = Some(key);
    }

    /// Returns the existing key or assigns a fresh one.
    pub fn key_or_assign(&mut self) -> ContentKey {
        self.key.get_or_insert_with(ContentKey::new_now).clone()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_language(&self) -> Option<&str> {
        self.content_language.as_deref()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn set_large(&mut self, large: bool) {
        self.large = large;
    }

    pub fn is_large(&self) -> bool {
        self.large
    }

    pub fn is_large_index(&self) -> bool {
        self.content_type.as_deref() == Some(LARGE_INDEX_CONTENT_TYPE)
    }
}

/// Pointer from the normal path to a payload in the large payload store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LargeIndex {
    pub key: ContentKey,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_language: Option<String>,
}

impl LargeIndex {
    /// Builds the index record that stands in for `large` in the fast tier.
    pub fn index_content(large: &Content) -> Result<Content> {
        let key = large
            .key()
            .cloned()
            .ok_or_else(|| Error::InvalidIndex("large content has no key".to_string()))?;
        let index = LargeIndex {
            key: key.clone(),
            size: large.size(),
            content_type: large.content_type.clone(),
            content_language: large.content_language.clone(),
        };
        let json = serde_json::to_vec(&index)?;
        Ok(Content::new(json)
            .with_key(key)
            .with_content_type(LARGE_INDEX_CONTENT_TYPE))
    }

    pub fn from_content(index: &Content) -> Result<Self> {
        if !index.is_large_index() {
            return Err(Error::InvalidIndex(format!(
                "unexpected content type {:?}",
                index.content_type()
            )));
        }
        Ok(serde_json::from_slice(index.data())?)
    }

    /// Restores the caller-visible shape of a payload fetched from the large store.
    pub fn resolve(&self, mut payload: Content) -> Content {
        payload.key = Some(self.key.clone());
        payload.size = self.size;
        payload.large = true;
        if payload.content_type.is_none() {
            payload.content_type = self.content_type.clone();
        }
        if payload.content_language.is_none() {
            payload.content_language = self.content_language.clone();
        }
        payload
    }
}
