//! Versioned per-document metadata codec.
//!
//! Every document carries an opaque `rev_meta` payload whose layout has
//! evolved through three wire-compatible versions. No header byte selects
//! the version: the payload size alone is authoritative.
//!
//! | Version | Size | Layout |
//! |---------|------|--------|
//! | V0      | 16 B | `cas:u64be, exptime:u32be, flags:u32(host)` |
//! | V1      | 18 B | V0 + `flex_code:u8, datatype:u8` |
//! | V2      | 19 B | V1 + `legacy_deleted:u8` (discarded on read) |
//!
//! `cas` and `exptime` are big-endian on disk; `flags` is host-endian, a
//! historical quirk that must be preserved for bit-exact compatibility with
//! existing files. All new writes use V1.

use vellumdb_common::{StoreError, StoreResult};

use crate::item::DATATYPE_RAW;

/// The only value `flex_code` has ever held.
pub const FLEX_META_CODE: u8 = 0x01;

/// Metadata payload versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaVersion {
    V0,
    V1,
    V2,
}

impl MetaVersion {
    /// Encoded size of this version in bytes.
    pub const fn size(self) -> usize {
        match self {
            MetaVersion::V0 => 16,
            MetaVersion::V1 => 18,
            MetaVersion::V2 => 19,
        }
    }
}

/// Decoded view of a document's metadata.
///
/// Whatever version the payload was initialised from, accessors always
/// present the full V1 field set; decoding a V0 payload synthesises
/// `flex_code = 0x01` and `datatype = RAW`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocMeta {
    cas: u64,
    exptime: u32,
    flags: u32,
    flex_code: u8,
    datatype: u8,
    initialised_from: MetaVersion,
}

impl DocMeta {
    /// Metadata for a new write. New writes are always V1.
    pub fn new(cas: u64, exptime: u32, flags: u32, datatype: u8) -> Self {
        Self {
            cas,
            exptime,
            flags,
            flex_code: FLEX_META_CODE,
            datatype,
            initialised_from: MetaVersion::V1,
        }
    }

    /// Decode a raw `rev_meta` payload.
    ///
    /// Accepts exactly the sizes {16, 18, 19}; anything else is
    /// [`StoreError::MalformedMeta`]. A V2 payload is narrowed to V1: the
    /// trailing `legacy_deleted` byte is discarded and the record re-saves
    /// as V1.
    pub fn decode(buf: &[u8]) -> StoreResult<Self> {
        let initialised_from = match buf.len() {
            16 => MetaVersion::V0,
            18 => MetaVersion::V1,
            19 => MetaVersion::V1, // V2 narrows to V1
            _ => return Err(StoreError::MalformedMeta),
        };

        let cas = u64::from_be_bytes(buf[0..8].try_into().expect("length checked"));
        let exptime = u32::from_be_bytes(buf[8..12].try_into().expect("length checked"));
        // Host-endian on disk for historical reasons.
        let flags = u32::from_ne_bytes(buf[12..16].try_into().expect("length checked"));

        let (flex_code, datatype) = if buf.len() >= MetaVersion::V1.size() {
            (buf[16], buf[17])
        } else {
            (FLEX_META_CODE, DATATYPE_RAW)
        };

        Ok(Self {
            cas,
            exptime,
            flags,
            flex_code,
            datatype,
            initialised_from,
        })
    }

    /// Serialise into `out`, whose length must equal `target.size()`.
    pub fn encode_into(&self, out: &mut [u8], target: MetaVersion) -> StoreResult<()> {
        if out.len() != target.size() {
            return Err(StoreError::InvalidArguments);
        }

        out[0..8].copy_from_slice(&self.cas.to_be_bytes());
        out[8..12].copy_from_slice(&self.exptime.to_be_bytes());
        out[12..16].copy_from_slice(&self.flags.to_ne_bytes());

        match target {
            MetaVersion::V0 => {}
            MetaVersion::V1 => {
                out[16] = self.flex_code;
                out[17] = self.datatype;
            }
            MetaVersion::V2 => {
                out[16] = self.flex_code;
                out[17] = self.datatype;
                // V2's legacy_deleted byte is never written as set; the
                // deleted bit lives in the DocInfo.
                out[18] = 0;
            }
        }
        Ok(())
    }

    /// Serialise to a fresh buffer of exactly `target.size()` bytes.
    pub fn encode(&self, target: MetaVersion) -> Vec<u8> {
        let mut out = vec![0u8; target.size()];
        self.encode_into(&mut out, target)
            .expect("buffer sized to target version");
        out
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn exptime(&self) -> u32 {
        self.exptime
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn flex_code(&self) -> u8 {
        self.flex_code
    }

    pub fn datatype(&self) -> u8 {
        self.datatype
    }

    /// The version the payload was decoded from. V2 reports V1, because the
    /// record is normalised on read and narrows on re-save.
    pub fn version_initialised_from(&self) -> MetaVersion {
        self.initialised_from
    }
}
