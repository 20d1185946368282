//! Metadata areas: a one-sheet header followed by a circular buffer holding
//! the textual volume group description.

use acid_io::{Read, Seek};
use alloc::format;
use alloc::vec::Vec;
use snafu::{ensure, ResultExt};

use crate::checksum;
use crate::header::{DataAreaDescriptor, MetadataAreaHeader, RawLocationDescriptor, MDA_HEADER_SIZE};
use crate::metadata::{parse_metadata_bytes, Metadata};
use crate::stream::{parse_exact, StructReader};
use crate::{DecodeOptions, Error, MetadataAreaCorruptSnafu, MetadataParseSnafu};

/// One metadata area of a physical volume, as found on disk.
#[derive(Clone, Debug)]
pub struct MetadataArea {
    pub descriptor: DataAreaDescriptor,
    pub header: MetadataAreaHeader,
    /// The text of the last used raw location. `None` when every slot is unused.
    pub metadata: Option<Metadata>,
}

impl MetadataArea {
    /// Reads the area `descriptor` points at and decodes its metadata.
    ///
    /// When several raw locations are in use, each is read and parsed in table
    /// order and the last one is kept.
    pub fn read<T: Read + Seek>(
        reader: &mut T,
        descriptor: &DataAreaDescriptor,
        options: &DecodeOptions,
    ) -> Result<Self, Error> {
        let offset = descriptor.offset;
        let sheet = StructReader::at(&mut *reader, offset)
            .and_then(|mut sheet| sheet.read_raw(MDA_HEADER_SIZE, "metadata area header"))
            .map_err(|e| Error::MetadataAreaCorrupt { offset, reason: format!("could not read header: {e}") })?;
        let header: MetadataAreaHeader = parse_exact(&sheet, offset)?;
        tracing::trace!(?header);

        if options.verify_signatures {
            ensure!(
                header.has_valid_signature(),
                MetadataAreaCorruptSnafu {
                    offset,
                    reason: format!(
                        "bad signature \"{}\" or version {}",
                        header.signature.escape_ascii(),
                        header.version
                    ),
                }
            );
        }
        checksum::verify(
            "metadata area header",
            offset,
            header.checksum,
            &sheet[MetadataAreaHeader::CHECKSUM_START..],
            options,
        )?;

        let mut metadata = None;
        for location in header.location_descriptors.iter().filter(|l| !l.is_unused()) {
            let text_offset = absolute(&header, location.offset)?;
            let text = read_text(&mut *reader, &header, location, options)?;
            checksum::verify("metadata text", text_offset, location.checksum, &text, options)?;

            // the stored size counts the NUL that ends the text
            let body = &text[..text.len() - 1];
            tracing::debug!(offset = text_offset, len = body.len(), "extracted metadata text");
            metadata = Some(parse_metadata_bytes(body).context(MetadataParseSnafu { offset: text_offset })?);
        }

        Ok(Self { descriptor: *descriptor, header, metadata })
    }
}

/// Absolute byte offset of a position inside the area.
fn absolute(header: &MetadataAreaHeader, relative: u64) -> Result<u64, Error> {
    header.start.checked_add(relative).ok_or_else(|| Error::MetadataAreaCorrupt {
        offset: header.start,
        reason: format!("area start {} plus offset {relative} is past the end of any device", header.start),
    })
}

/// Reads the bytes a raw location points at, following the wrap back to the
/// start of the buffer when the text runs past the end of the area.
///
/// A location that does not fit the area is an error with signature checks
/// on. Without them it is read as one contiguous run at `start + offset`.
fn read_text<T: Read + Seek>(
    reader: &mut T,
    header: &MetadataAreaHeader,
    location: &RawLocationDescriptor,
    options: &DecodeOptions,
) -> Result<Vec<u8>, Error> {
    let offset = header.start;
    let buffer_start = MDA_HEADER_SIZE as u64;
    let text_offset = absolute(header, location.offset)?;
    let len = |n: u64| {
        usize::try_from(n).map_err(|_| Error::MetadataAreaCorrupt { offset, reason: format!("text of {n} bytes") })
    };

    // offset < size with offset >= 512 keeps `size - 512` from underflowing
    let fits = location.offset >= buffer_start
        && location.offset < header.size
        && location.size <= header.size - buffer_start;
    if !fits {
        ensure!(
            !options.verify_signatures,
            MetadataAreaCorruptSnafu {
                offset,
                reason: format!(
                    "text at offset {} ({} bytes) does not fit in the {}-byte area",
                    location.offset, location.size, header.size
                ),
            }
        );
        tracing::warn!(
            offset = text_offset,
            size = location.size,
            area_size = header.size,
            "metadata text lies outside its area"
        );
        return StructReader::at(&mut *reader, text_offset)?.read_raw(len(location.size)?, "metadata text");
    }

    let first = location.size.min(header.size - location.offset);
    let mut text = StructReader::at(&mut *reader, text_offset)?.read_raw(len(first)?, "metadata text")?;
    if first < location.size {
        let wrapped = location.size - first;
        tracing::debug!(wrapped, "metadata text wraps around the area");
        let rest =
            StructReader::at(&mut *reader, absolute(header, buffer_start)?)?.read_raw(len(wrapped)?, "metadata text")?;
        text.extend_from_slice(&rest);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use acid_io::Cursor;
    use alloc::vec;

    use super::*;
    use crate::checksum::lvm_crc;
    use crate::header::MDA_SIGNATURE;
    use crate::metadata;

    const AREA: u64 = 4096;
    const AREA_SIZE: u64 = 8192;

    fn vg_text(seqno: u64) -> Vec<u8> {
        format!(
            "vg0 {{\nid = \"x\"\nseqno = {seqno}\nextent_size = 8192\nphysical_volumes {{\n}}\n}}\n\
             contents = \"Text Format Volume Group\"\nversion = 1\n\0"
        )
        .into_bytes()
    }

    struct Image {
        bytes: Vec<u8>,
        locations: Vec<(u64, Vec<u8>)>,
    }

    impl Image {
        fn new() -> Self {
            Self { bytes: vec![0u8; (AREA + AREA_SIZE) as usize], locations: Vec::new() }
        }

        /// Places `text` at `offset` within the area, wrapping like LVM does.
        fn text(mut self, offset: u64, text: Vec<u8>) -> Self {
            for (i, byte) in text.iter().enumerate() {
                let mut at = offset + i as u64;
                if at >= AREA_SIZE {
                    at = at - AREA_SIZE + MDA_HEADER_SIZE as u64;
                }
                self.bytes[(AREA + at) as usize] = *byte;
            }
            self.locations.push((offset, text));
            self
        }

        /// A slot with no size; its offset is out of bounds so reading it would fail.
        fn unused_slot(mut self) -> Self {
            self.locations.push((AREA_SIZE * 4, Vec::new()));
            self
        }

        fn build(mut self) -> Vec<u8> {
            let mut sheet = vec![0u8; MDA_HEADER_SIZE];
            sheet[4..20].copy_from_slice(MDA_SIGNATURE);
            sheet[20..24].copy_from_slice(&1u32.to_le_bytes());
            sheet[24..32].copy_from_slice(&AREA.to_le_bytes());
            sheet[32..40].copy_from_slice(&AREA_SIZE.to_le_bytes());
            for (slot, (offset, text)) in self.locations.iter().enumerate() {
                let at = 40 + slot * 24;
                let checksum = if text.is_empty() { 0 } else { lvm_crc(text) };
                sheet[at..at + 8].copy_from_slice(&offset.to_le_bytes());
                sheet[at + 8..at + 16].copy_from_slice(&(text.len() as u64).to_le_bytes());
                sheet[at + 16..at + 20].copy_from_slice(&checksum.to_le_bytes());
            }
            let crc = lvm_crc(&sheet[4..]);
            sheet[..4].copy_from_slice(&crc.to_le_bytes());
            self.bytes[AREA as usize..AREA as usize + MDA_HEADER_SIZE].copy_from_slice(&sheet);
            self.bytes
        }
    }

    fn read(bytes: Vec<u8>, options: &DecodeOptions) -> Result<MetadataArea, Error> {
        let descriptor = DataAreaDescriptor { offset: AREA, size: AREA_SIZE };
        MetadataArea::read(&mut Cursor::new(bytes), &descriptor, options)
    }

    fn seqno(area: &MetadataArea) -> u64 {
        area.metadata.as_ref().unwrap().volume_groups["vg0"].seqno
    }

    #[test]
    fn single_location() {
        let bytes = Image::new().text(512, vg_text(7)).build();
        let area = read(bytes, &DecodeOptions::new().verify_checksums(true)).unwrap();
        assert!(area.header.has_valid_signature());
        assert_eq!(seqno(&area), 7);
        assert_eq!(area.metadata.unwrap().version, Some(1));
    }

    #[test]
    fn last_location_wins() {
        let bytes = Image::new().text(512, vg_text(1)).text(2048, vg_text(2)).build();
        let area = read(bytes, &DecodeOptions::new().verify_checksums(true)).unwrap();
        assert_eq!(area.header.location_descriptors.len(), 2);
        assert_eq!(seqno(&area), 2);
    }

    #[test]
    fn unused_locations_are_skipped() {
        let bytes = Image::new().text(512, vg_text(3)).unused_slot().build();
        let area = read(bytes, &DecodeOptions::default()).unwrap();
        assert!(area.header.location_descriptors[1].is_unused());
        assert_eq!(seqno(&area), 3);

        let area = read(Image::new().unused_slot().build(), &DecodeOptions::default()).unwrap();
        assert!(area.metadata.is_none());
    }

    #[test]
    fn text_wraps_around_the_buffer() {
        let text = vg_text(9);
        let offset = AREA_SIZE - 20;
        let bytes = Image::new().text(offset, text).build();
        let area = read(bytes, &DecodeOptions::new().verify_checksums(true)).unwrap();
        assert_eq!(seqno(&area), 9);
    }

    #[test]
    fn corrupt_header() {
        let mut bytes = Image::new().text(512, vg_text(1)).build();
        bytes[AREA as usize + 5] = b'X';
        let err = read(bytes.clone(), &DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, Error::MetadataAreaCorrupt { offset: AREA, .. }), "{err:?}");

        // without signature checks the broken header is still read, and its
        // checksum only complains when asked to
        let lenient = DecodeOptions::new().verify_signatures(false);
        assert_eq!(seqno(&read(bytes.clone(), &lenient).unwrap()), 1);
        let err = read(bytes, &lenient.verify_checksums(true)).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { what: "metadata area header", .. }), "{err:?}");
    }

    #[test]
    fn header_past_end_of_device() {
        let bytes = vec![0u8; AREA as usize + 100];
        let err = read(bytes, &DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, Error::MetadataAreaCorrupt { offset: AREA, .. }), "{err:?}");
    }

    #[test]
    fn location_outside_area() {
        let mut image = Image::new().text(512, vg_text(1));
        image.locations[0].0 = AREA_SIZE + 4;
        let err = read(image.build(), &DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, Error::MetadataAreaCorrupt { .. }), "{err:?}");
    }

    #[test]
    fn area_without_size_is_read_when_lenient() {
        let mut bytes = Image::new().text(512, vg_text(5)).build();
        // zero the size field and fix up the header checksum
        let header = AREA as usize;
        bytes[header + 32..header + 40].copy_from_slice(&0u64.to_le_bytes());
        let crc = lvm_crc(&bytes[header + 4..header + MDA_HEADER_SIZE]);
        bytes[header..header + 4].copy_from_slice(&crc.to_le_bytes());

        let err = read(bytes.clone(), &DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, Error::MetadataAreaCorrupt { offset: AREA, .. }), "{err:?}");

        let area = read(bytes, &DecodeOptions::new().verify_signatures(false).verify_checksums(true)).unwrap();
        assert_eq!(area.header.size, 0);
        assert_eq!(seqno(&area), 5);
    }

    #[test]
    fn area_start_near_end_of_address_space() {
        let mut bytes = Image::new().text(512, b"vg0 { }\n\0".to_vec()).build();
        let header = AREA as usize;
        bytes[header + 24..header + 32].copy_from_slice(&(u64::MAX - 10).to_le_bytes());
        let crc = lvm_crc(&bytes[header + 4..header + MDA_HEADER_SIZE]);
        bytes[header..header + 4].copy_from_slice(&crc.to_le_bytes());

        for options in [DecodeOptions::default(), DecodeOptions::new().verify_signatures(false)] {
            let err = read(bytes.clone(), &options).unwrap_err();
            assert!(matches!(err, Error::MetadataAreaCorrupt { offset, .. } if offset == u64::MAX - 10), "{err:?}");
        }
    }

    #[test]
    fn bad_text_is_a_parse_error() {
        let bytes = Image::new().text(1024, b"vg0 { id = }\n\0".to_vec()).build();
        let err = read(bytes, &DecodeOptions::default()).unwrap_err();
        match err {
            Error::MetadataParse { offset, source: metadata::Error::Parse { position, .. } } => {
                assert_eq!(offset, AREA + 1024);
                assert_eq!(position, 11);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn text_checksum() {
        let image = Image::new().text(512, vg_text(1));
        // the id string, so the grammar still holds
        let at = AREA as usize + 512 + image.locations[0].1.iter().position(|&b| b == b'x').unwrap();
        let mut bytes = image.build();
        bytes[at] = b'y';
        assert_eq!(seqno(&read(bytes.clone(), &DecodeOptions::default()).unwrap()), 1);
        let err = read(bytes, &DecodeOptions::new().verify_checksums(true)).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { what: "metadata text", offset, .. } if offset == AREA + 512));
    }
}
