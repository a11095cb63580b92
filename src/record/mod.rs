//! Records - the variable-length entries stored in the directory tree.
//!
//! A record binds a filename and a 4-byte structure id to a typed payload.
//! Records act as both key and value: the tree orders them by
//! `(name, structure id)` and an insert with an existing key replaces the
//! payload.
//!
//! # Wire form (big-endian)
//! ```text
//! Offset  Size     Field
//! ------  ----     -----
//! 0       4        name length in UTF-16 units
//! 4       2×len    name, UTF-16BE
//! ...     4        structure id
//! ...     4        payload type code
//! ...     varies   payload (see [`Value`])
//! ```

mod compare;
mod value;

pub use compare::compare_names;
pub use value::Value;

use std::cmp::Ordering;
use std::fmt;

use crate::common::{Error, Result};
use crate::storage::Block;

/// A four-character code, used for structure ids and payload type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Build a code from a 4-byte ASCII literal.
    pub const fn new(code: [u8; 4]) -> Self {
        FourCC(code)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

/// One directory entry: `(name, structure id, typed payload)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    name: String,
    id: FourCC,
    value: Value,
}

impl Record {
    /// Build a record.
    ///
    /// The name is stored as given; supply canonically decomposed Unicode
    /// to match the on-disk convention.
    pub fn new(name: impl Into<String>, id: FourCC, value: Value) -> Self {
        Self {
            name: name.into(),
            id,
            value,
        }
    }

    /// The filename this record describes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The structure id.
    pub fn id(&self) -> FourCC {
        self.id
    }

    /// The payload.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Serialized length in bytes.
    ///
    /// Agrees exactly with [`write`](Record::write).
    pub fn byte_len(&self) -> usize {
        4 + 2 * self.name.encode_utf16().count() + 8 + self.value.payload_len()
    }

    /// Decode a record at the block cursor.
    pub fn read(block: &mut Block) -> Result<Record> {
        let chars = block.read_u32()? as usize;
        let raw = block.read(2 * chars)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        let name = String::from_utf16(&units)
            .map_err(|_| Error::Format("invalid UTF-16 in record name".into()))?;
        let id = FourCC(block.read(4)?.try_into().expect("fixed-size read"));
        let code = FourCC(block.read(4)?.try_into().expect("fixed-size read"));
        let value = Value::read(code, block)?;
        Ok(Record { name, id, value })
    }

    /// Serialize the record.
    fn encode(&self) -> Vec<u8> {
        let units: Vec<u16> = self.name.encode_utf16().collect();
        let mut out = Vec::with_capacity(self.byte_len());
        out.extend_from_slice(&(units.len() as u32).to_be_bytes());
        for u in units {
            out.extend_from_slice(&u.to_be_bytes());
        }
        out.extend_from_slice(&self.id.0);
        out.extend_from_slice(&self.value.type_code().0);
        self.value.write(&mut out);
        out
    }

    /// Write the record at the block cursor, overwriting in place.
    pub fn write(&self, block: &mut Block) -> Result<()> {
        block.write(&self.encode())
    }

    /// Splice the record in at the block cursor, shifting trailing bytes.
    pub fn insert_into(&self, block: &mut Block) {
        block.insert(&self.encode());
    }

    /// Total order on `(folded name, structure id)`.
    ///
    /// This is the ordering the tree maintains; records comparing equal
    /// here are the same key.
    pub fn key_cmp(&self, other: &Record) -> Ordering {
        compare_names(&self.name, &other.name).then_with(|| self.id.cmp(&other.id))
    }

    /// Whether this record matches a name and optional structure id filter.
    pub(crate) fn matches(&self, name: &str, id: Option<FourCC>) -> bool {
        compare_names(&self.name, name) == Ordering::Equal && id.map_or(true, |id| self.id == id)
    }

    // ========================================================================
    // Well-known structure constructors
    // ========================================================================

    /// An `Iloc` icon-location record.
    pub fn icon_location(name: impl Into<String>, x: u32, y: u32) -> Record {
        let mut blob = Vec::with_capacity(16);
        blob.extend_from_slice(&x.to_be_bytes());
        blob.extend_from_slice(&y.to_be_bytes());
        blob.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00]);
        Record::new(name, FourCC(*b"Iloc"), Value::Blob(blob))
    }

    /// A `BKGD` record selecting the default background.
    pub fn background_default(name: impl Into<String>) -> Record {
        let mut blob = Vec::with_capacity(12);
        blob.extend_from_slice(b"DefB");
        blob.extend_from_slice(&[0u8; 8]);
        Record::new(name, FourCC(*b"BKGD"), Value::Blob(blob))
    }

    /// A `BKGD` record selecting a solid color background.
    ///
    /// # Errors
    /// Always `NotImplemented`: the legacy `ClrB` shape is reserved and
    /// rejected immediately rather than written incorrectly.
    pub fn background_color(_name: &str, _rgb: [u16; 3]) -> Result<Record> {
        Err(Error::NotImplemented("ClrB background records"))
    }
}
