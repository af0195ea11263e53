//! Binary formats for stored content.
//!
//! - [`item`]: one content item, used by fast tier files and by long-term single and large objects.
//! - [`archive`]: every item written to a channel in one minute, used by long-term batch objects.
//!
//! Both formats end with a CRC32 over everything before it, so truncated or partially written
//! objects are rejected instead of served.

pub mod archive;
pub mod item;

pub use archive::{BatchArchive, BatchArchiveWriter};
pub use item::{decode_item, encode_item};
