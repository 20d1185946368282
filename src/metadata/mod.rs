//! The textual volume group description stored in metadata areas.
//!
//! Decoding happens in three separate steps: [`Lexer`] splits the text into
//! tokens, [`parse_document`] builds a generic [`Document`] tree, and
//! [`Metadata::from_document`] projects that tree onto the typed model below.

use core::ops::Range;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use snafu::Snafu;

pub(crate) mod deserialize;
mod lexer;
mod mapper;
mod parser;
mod value;

pub use deserialize::{from_section, from_value};
pub use lexer::{Lexer, Token, TokenKind};
pub use parser::parse_document;
pub use value::{Document, Section, Value};

/// Extents are counted in 512-byte sectors.
pub const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("metadata text is not valid UTF-8 after byte {position}"))]
    Encoding { position: usize },
    #[snafu(display("unexpected character {found:?} at line {line}, column {column} (byte {position})"))]
    Lex {
        position: usize,
        line: usize,
        column: usize,
        found: char,
    },
    #[snafu(display("expected {expected} at line {line}, column {column} (byte {position}), found {found}"))]
    Parse {
        position: usize,
        line: usize,
        column: usize,
        expected: &'static str,
        found: String,
    },
    #[snafu(display("unexpected metadata shape at `{path}`: {problem}"))]
    UnexpectedShape { path: String, problem: String },
}

/// Lexes, parses and maps one metadata text.
pub fn parse_metadata(text: &str) -> Result<Metadata, Error> {
    let document = parse_document(text)?;
    Metadata::from_document(&document)
}

/// Like [`parse_metadata`], for raw bytes straight off the disk.
pub fn parse_metadata_bytes(raw: &[u8]) -> Result<Metadata, Error> {
    let text = core::str::from_utf8(raw).map_err(|e| Error::Encoding { position: e.valid_up_to() })?;
    parse_metadata(text)
}

/// One decoded metadata text.
#[derive(Clone, Debug, PartialEq)]
pub struct Metadata {
    pub contents: Option<String>,
    pub version: Option<u64>,
    pub description: Option<String>,
    pub creation_host: Option<String>,
    pub creation_time: Option<u64>,
    /// Every top-level section, keyed by volume group name.
    pub volume_groups: BTreeMap<String, VolumeGroup>,
    /// Top-level keys not covered by the fields above.
    pub properties: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VolumeGroup {
    pub name: String,
    pub id: String,
    pub seqno: u64,
    pub format: Option<String>,
    pub status: Vec<String>,
    pub flags: Vec<String>,
    pub tags: Vec<String>,
    /// In sectors.
    pub extent_size: u64,
    pub max_lv: Option<u64>,
    pub max_pv: Option<u64>,
    pub metadata_copies: Option<u64>,
    pub physical_volumes: Vec<PhysicalVolume>,
    pub logical_volumes: Vec<LogicalVolume>,
    pub properties: BTreeMap<String, Value>,
}

impl VolumeGroup {
    pub fn extent_size_bytes(&self) -> u64 {
        self.extent_size.saturating_mul(SECTOR_SIZE)
    }

    pub fn physical_volume(&self, name: &str) -> Option<&PhysicalVolume> {
        self.physical_volumes.iter().find(|pv| pv.name == name)
    }

    pub fn logical_volume(&self, name: &str) -> Option<&LogicalVolume> {
        self.logical_volumes.iter().find(|lv| lv.name == name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PhysicalVolume {
    /// The key in `physical_volumes`, usually `pv0`, `pv1`...
    pub name: String,
    pub id: String,
    /// Only a hint of where the PV was last seen.
    pub device: Option<String>,
    pub status: Vec<String>,
    pub flags: Vec<String>,
    pub tags: Vec<String>,
    /// In sectors.
    pub dev_size: Option<u64>,
    /// First sector of the first extent.
    pub pe_start: u64,
    pub pe_count: u64,
    pub ba_start: Option<u64>,
    pub ba_size: Option<u64>,
    pub properties: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogicalVolume {
    pub name: String,
    pub id: String,
    pub status: Vec<String>,
    pub flags: Vec<String>,
    pub tags: Vec<String>,
    pub creation_time: Option<u64>,
    pub creation_host: Option<String>,
    /// `segment1` first.
    pub segments: Vec<Segment>,
    pub properties: BTreeMap<String, Value>,
}

impl LogicalVolume {
    pub fn size_in_extents(&self) -> u64 {
        self.segments.iter().map(|s| s.extents().end).max().unwrap_or(0)
    }

    /// The segment covering logical extent `extent`.
    pub fn segment_at(&self, extent: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.extents().contains(&extent))
    }

    pub fn is_visible(&self) -> bool {
        self.status.iter().any(|s| s == "VISIBLE")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub name: String,
    pub start_extent: u64,
    pub extent_count: u64,
    /// `striped`, `mirror`, `raid1`, `thin-pool`, ...
    pub segment_type: String,
    pub stripe_count: Option<u64>,
    /// In sectors.
    pub stripe_size: Option<u64>,
    pub stripes: Vec<StripeArea>,
    pub tags: Vec<String>,
    /// Type-specific keys such as `mirrors`, `raids` or `thin_pool`.
    pub properties: BTreeMap<String, Value>,
}

impl Segment {
    /// Saturates at `u64::MAX`; mapped segments never get there.
    pub fn extents(&self) -> Range<u64> {
        self.start_extent..self.start_extent.saturating_add(self.extent_count)
    }

    /// A single stripe maps extents one to one onto a physical volume.
    pub fn is_linear(&self) -> bool {
        self.segment_type == "striped" && self.stripes.len() == 1
    }
}

/// Where one stripe of a segment lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StripeArea {
    /// A key of [`VolumeGroup::physical_volumes`].
    pub physical_volume: String,
    pub start_extent: u64,
}
