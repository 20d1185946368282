//! Pure-rust, read-only decoder for LVM2 physical volumes.
//!
//! Given anything that implements [`Read`] + [`Seek`] (a block device, a disk
//! image, a partition slice), [`Volume::decode`] walks the on-disk structures
//! of a physical volume and returns its label, its header and every metadata
//! area copy, each with the volume group description it holds.
//!
//! ```no_run
//! # fn main() -> Result<(), lvm2::Error> {
//! let mut image = std::fs::File::open("image.raw").unwrap();
//! if lvm2::probe(&mut image)? {
//!     let volume = lvm2::Volume::decode(&mut image)?;
//!     for metadata in volume.metadata() {
//!         for (name, vg) in &metadata.volume_groups {
//!             println!("{name}: {} logical volumes", vg.logical_volumes.len());
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```
#![no_std]
extern crate alloc;

#[cfg(test)]
extern crate std;

use acid_io::{ErrorKind, Read, Seek, SeekFrom};
use alloc::string::String;
use alloc::vec::Vec;
use snafu::{ResultExt, Snafu};

pub mod checksum;
pub mod header;
pub mod mda;
pub mod metadata;
mod stream;

pub use header::{
    DataAreaDescriptor, LabelHeader, MetadataAreaHeader, PhysicalVolumeHeader, PvExtension, PvId,
    RawLocationDescriptor,
};
pub use mda::MetadataArea;
pub use metadata::{LogicalVolume, Metadata, PhysicalVolume, Segment, StripeArea, VolumeGroup};

use crate::stream::RestoreCursor;

// Vocabulary: in this crate we use the term "sheet" to describe a block of exactly 512 bytes
// (to avoid confusion around the word "sector")

// on-disk format: https://github.com/libyal/libvslvm/blob/main/documentation/Logical%20Volume%20Manager%20(LVM)%20format.asciidoc#2-physical-volume-label

pub const SHEET_SIZE: usize = 512;

/// The label lives in the second sheet of the device; the first one is left alone.
pub const LABEL_OFFSET: u64 = SHEET_SIZE as u64;

pub const LABEL_SIGNATURE: &[u8; 8] = b"LABELONE";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("I/O error at byte offset {offset}"))]
    Io { offset: u64, source: acid_io::Error },
    #[snafu(display("could not determine the stream position"))]
    Position { source: acid_io::Error },
    #[snafu(display("stream ended while reading {what} at byte offset {offset} ({needed} bytes needed)"))]
    TruncatedRead {
        what: &'static str,
        offset: u64,
        needed: u64,
    },
    #[snafu(display("bad LVM label at byte offset {offset}: {reason}"))]
    BadLabel { offset: u64, reason: String },
    #[snafu(display("corrupt metadata area at byte offset {offset}: {reason}"))]
    MetadataAreaCorrupt { offset: u64, reason: String },
    #[snafu(display(
        "{what} checksum mismatch at byte offset {offset}: stored {expected:#010x}, computed {actual:#010x}"
    ))]
    ChecksumMismatch {
        what: &'static str,
        offset: u64,
        expected: u32,
        actual: u32,
    },
    #[snafu(display("invalid metadata text at byte offset {offset}"))]
    MetadataParse {
        offset: u64,
        source: metadata::Error,
    },
}

/// Knobs for how strict decoding is.
///
/// The defaults check every signature but only log checksum mismatches, which
/// is what you want when looking at images that may have been damaged.
#[derive(Clone, Debug)]
pub struct DecodeOptions {
    /// Reject labels and metadata area headers with wrong magic or version.
    pub verify_signatures: bool,
    /// Turn checksum mismatches into [`Error::ChecksumMismatch`].
    pub verify_checksums: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            verify_signatures: true,
            verify_checksums: false,
        }
    }
}

impl DecodeOptions {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn verify_signatures(mut self, verify: bool) -> Self {
        self.verify_signatures = verify;
        self
    }
    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }
}

/// Checks whether `reader` looks like an LVM2 physical volume.
///
/// The cursor is left at the start of the device afterwards, whatever the outcome.
/// A device too short to hold a label is simply not LVM.
pub fn probe<T: Read + Seek>(reader: &mut T) -> Result<bool, Error> {
    let mut reader = RestoreCursor::restore_to(reader, 0);
    reader.seek(SeekFrom::Start(LABEL_OFFSET)).context(IoSnafu { offset: LABEL_OFFSET })?;

    let mut sheet = [0u8; SHEET_SIZE];
    match reader.read_exact(&mut sheet) {
        Ok(()) => {
            let found = &sheet[..LABEL_SIGNATURE.len()] == LABEL_SIGNATURE;
            tracing::debug!(found, "probed for LVM label");
            Ok(found)
        }
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(source) => Err(Error::Io { offset: LABEL_OFFSET, source }),
    }
}

/// Everything decoded from one physical volume.
#[derive(Clone, Debug)]
pub struct Volume {
    pub label_header: LabelHeader,
    pub header: PhysicalVolumeHeader,
    /// One entry per metadata area descriptor, in descriptor order.
    pub metadata_areas: Vec<MetadataArea>,
}

impl Volume {
    /// Decodes a physical volume with the default [`DecodeOptions`].
    pub fn decode<T: Read + Seek>(reader: &mut T) -> Result<Self, Error> {
        Self::decode_with(reader, &DecodeOptions::default())
    }

    /// Decodes a physical volume. The reader may be positioned anywhere and is
    /// put back where it was once decoding finishes, successfully or not.
    pub fn decode_with<T: Read + Seek>(reader: &mut T, options: &DecodeOptions) -> Result<Self, Error> {
        let mut reader = RestoreCursor::save(reader)?;

        let label_header = LabelHeader::read(&mut *reader, options)?;
        tracing::trace!(?label_header);
        let header = PhysicalVolumeHeader::read(&mut *reader, label_header.pv_header_offset())?;
        tracing::trace!(?header);

        let mut metadata_areas = Vec::with_capacity(header.metadata_descriptors.len());
        for descriptor in &header.metadata_descriptors {
            let area = MetadataArea::read(&mut *reader, descriptor, options)?;
            tracing::debug!(offset = descriptor.offset, decoded = area.metadata.is_some(), "read metadata area");
            metadata_areas.push(area);
        }

        Ok(Self { label_header, header, metadata_areas })
    }

    pub fn pv_id(&self) -> &PvId {
        &self.header.pv_ident
    }

    /// Metadata documents of every area that had one, in descriptor order.
    pub fn metadata(&self) -> impl Iterator<Item = &Metadata> {
        self.metadata_areas.iter().filter_map(|area| area.metadata.as_ref())
    }
}
