use core::fmt;

use acid_io::{Read, Seek};
use alloc::format;
use alloc::vec::Vec;
use nom::bytes::complete::take;
use nom::combinator::map;
use nom::number::complete::{le_u32, le_u64};
use nom::IResult;
use snafu::ensure;

use crate::checksum;
use crate::stream::{parse_exact, Decode, StructReader};
use crate::{BadLabelSnafu, DecodeOptions, Error, LABEL_OFFSET, LABEL_SIGNATURE, SHEET_SIZE};

pub const LABEL_TYPE: &[u8; 8] = b"LVM2 001";

pub const MDA_SIGNATURE: &[u8; 16] = b" LVM2 x[5A%r0N*>"; // lol
pub const MDA_VERSION: u32 = 1;
/// The metadata area header always takes one full sheet.
pub const MDA_HEADER_SIZE: usize = SHEET_SIZE;

/// Offset of the first checksummed byte in the label sheet.
const LABEL_CHECKSUM_START: usize = 20;

fn array<const N: usize>(input: &[u8]) -> IResult<&[u8], [u8; N]> {
    map(take(N), |raw: &[u8]| {
        let mut out = [0u8; N];
        out.copy_from_slice(raw);
        out
    })(input)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelHeader {
    pub signature: [u8; 8],
    pub sector_number: u64,
    pub checksum: u32,
    /// Offset of the physical volume header, relative to the label sheet.
    pub data_offset: u32,
    pub type_indicator: [u8; 8],
}

impl Decode for LabelHeader {
    const SIZE: usize = 32;
    const NAME: &'static str = "label header";

    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, signature) = array::<8>(input)?;
        let (input, sector_number) = le_u64(input)?;
        let (input, checksum) = le_u32(input)?;
        let (input, data_offset) = le_u32(input)?;
        let (input, type_indicator) = array::<8>(input)?;
        Ok((input, Self { signature, sector_number, checksum, data_offset, type_indicator }))
    }
}

impl LabelHeader {
    /// Reads the label sheet at [`LABEL_OFFSET`].
    ///
    /// Any failure to read the sheet, and (with signature checks on) a wrong
    /// magic or label type, is reported as [`Error::BadLabel`].
    pub fn read<T: Read + Seek>(reader: &mut T, options: &DecodeOptions) -> Result<Self, Error> {
        let offset = LABEL_OFFSET;
        let sheet = StructReader::at(reader, offset)
            .and_then(|mut sheet| sheet.read_raw(SHEET_SIZE, "label sector"))
            .map_err(|e| Error::BadLabel { offset, reason: format!("could not read label sector: {e}") })?;
        let label: Self = parse_exact(&sheet, offset)?;

        if options.verify_signatures {
            ensure!(
                label.signature == *LABEL_SIGNATURE,
                BadLabelSnafu {
                    offset,
                    reason: format!("expected signature \"LABELONE\", found \"{}\"", label.signature.escape_ascii()),
                }
            );
            ensure!(
                label.type_indicator == *LABEL_TYPE,
                BadLabelSnafu {
                    offset,
                    reason: format!("expected label type \"LVM2 001\", found \"{}\"", label.type_indicator.escape_ascii()),
                }
            );
        }
        ensure!(
            (label.data_offset as usize) < SHEET_SIZE,
            BadLabelSnafu { offset, reason: format!("header offset {} points outside the label sector", label.data_offset) }
        );
        if label.sector_number != LABEL_OFFSET / SHEET_SIZE as u64 {
            tracing::warn!(sector_number = label.sector_number, "label claims to live in an unexpected sector");
        }

        checksum::verify("label", offset, label.checksum, &sheet[LABEL_CHECKSUM_START..], options)?;
        Ok(label)
    }

    pub fn is_lvm2(&self) -> bool {
        self.signature == *LABEL_SIGNATURE && self.type_indicator == *LABEL_TYPE
    }

    /// Absolute byte offset of the physical volume header.
    pub fn pv_header_offset(&self) -> u64 {
        LABEL_OFFSET + u64::from(self.data_offset)
    }
}

/// The 32 raw bytes identifying a physical volume.
///
/// LVM fills these with alphanumeric characters and shows them in groups
/// separated by dashes; that is what [`Display`](fmt::Display) prints. Ids
/// that are not plain alphanumeric are shown in hex instead.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PvId(pub [u8; 32]);

impl PvId {
    const GROUPS: [usize; 7] = [6, 4, 4, 4, 4, 4, 6];

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.0.iter().all(u8::is_ascii_alphanumeric) {
            return self.0.iter().try_for_each(|b| write!(f, "{b:02x}"));
        }
        let mut rest = &self.0[..];
        for (i, len) in Self::GROUPS.iter().enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            let (group, tail) = rest.split_at(*len);
            group.iter().try_for_each(|&b| write!(f, "{}", b as char))?;
            rest = tail;
        }
        Ok(())
    }
}

impl fmt::Debug for PvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PvId({self})")
    }
}

#[derive(Clone, Copy, Debug)]
struct PvIdentity {
    pv_ident: PvId,
    pv_size: u64,
}

impl Decode for PvIdentity {
    const SIZE: usize = 40;
    const NAME: &'static str = "physical volume header";

    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, pv_ident) = map(array::<32>, PvId)(input)?;
        let (input, pv_size) = le_u64(input)?;
        Ok((input, Self { pv_ident, pv_size }))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalVolumeHeader {
    pub pv_ident: PvId,
    pub pv_size: u64,
    pub data_descriptors: Vec<DataAreaDescriptor>,
    pub metadata_descriptors: Vec<DataAreaDescriptor>,
    pub extension: Option<PvExtension>,
}

impl PhysicalVolumeHeader {
    /// Decodes the header starting at the absolute byte `offset`.
    ///
    /// The two descriptor tables come in a fixed order: data areas, then
    /// metadata areas.
    pub fn read<T: Read + Seek>(reader: &mut T, offset: u64) -> Result<Self, Error> {
        let mut reader = StructReader::at(reader, offset)?;
        let PvIdentity { pv_ident, pv_size } = reader.decode()?;
        let data_descriptors = reader.descriptor_table()?;
        let metadata_descriptors = reader.descriptor_table()?;
        let extension = PvExtension::read(&mut reader)?;
        Ok(Self { pv_ident, pv_size, data_descriptors, metadata_descriptors, extension })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataAreaDescriptor {
    pub offset: u64,
    pub size: u64,
}

impl Decode for DataAreaDescriptor {
    const SIZE: usize = 16;
    const NAME: &'static str = "area descriptor";

    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, offset) = le_u64(input)?;
        let (input, size) = le_u64(input)?;
        Ok((input, Self { offset, size }))
    }
}

impl DataAreaDescriptor {
    pub fn is_sentinel(&self) -> bool {
        self.offset == 0 && self.size == 0
    }
}

/// Trailer written after the descriptor tables by newer LVM versions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PvExtension {
    pub version: u32,
    pub flags: u32,
    pub bootloader_descriptors: Vec<DataAreaDescriptor>,
}

#[derive(Clone, Copy, Debug)]
struct PvExtensionHeader {
    version: u32,
    flags: u32,
}

impl Decode for PvExtensionHeader {
    const SIZE: usize = 8;
    const NAME: &'static str = "physical volume extension header";

    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, version) = le_u32(input)?;
        let (input, flags) = le_u32(input)?;
        Ok((input, Self { version, flags }))
    }
}

impl PvExtension {
    // Old volumes end right after the metadata table, so running out of data here is fine.
    fn read<T: Read + Seek>(reader: &mut StructReader<'_, T>) -> Result<Option<Self>, Error> {
        let header: PvExtensionHeader = match reader.decode() {
            Ok(header) => header,
            Err(Error::TruncatedRead { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if header.version == 0 {
            return Ok(None);
        }
        let bootloader_descriptors = reader.descriptor_table()?;
        Ok(Some(Self { version: header.version, flags: header.flags, bootloader_descriptors }))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataAreaHeader {
    pub checksum: u32,
    pub signature: [u8; 16],
    pub version: u32,
    /// Absolute offset of the metadata area; raw locations are relative to it.
    pub start: u64,
    pub size: u64,
    /// Every slot up to the all-zero terminator. Slots with a zero size are unused.
    pub location_descriptors: Vec<RawLocationDescriptor>,
}

impl MetadataAreaHeader {
    /// Offset of the first checksummed byte in the header sheet.
    pub(crate) const CHECKSUM_START: usize = 4;
    const FIXED_SIZE: usize = 40;

    pub fn has_valid_signature(&self) -> bool {
        self.signature == *MDA_SIGNATURE && self.version == MDA_VERSION
    }
}

impl Decode for MetadataAreaHeader {
    const SIZE: usize = MDA_HEADER_SIZE;
    const NAME: &'static str = "metadata area header";

    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, checksum) = le_u32(input)?;
        let (input, signature) = array::<16>(input)?;
        let (input, version) = le_u32(input)?;
        let (input, start) = le_u64(input)?;
        let (mut input, size) = le_u64(input)?;

        let mut location_descriptors = Vec::new();
        let slots = (MDA_HEADER_SIZE - Self::FIXED_SIZE) / RawLocationDescriptor::SIZE;
        for _ in 0..slots {
            let (rest, location) = RawLocationDescriptor::parse(input)?;
            input = rest;
            if location.is_terminator() {
                break;
            }
            location_descriptors.push(location);
        }
        Ok((input, Self { checksum, signature, version, start, size, location_descriptors }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawLocationDescriptor {
    /// Relative to [`MetadataAreaHeader::start`].
    pub offset: u64,
    /// Includes the trailing NUL byte.
    pub size: u64,
    pub checksum: u32,
    pub flags: u32,
}

impl Decode for RawLocationDescriptor {
    const SIZE: usize = 24;
    const NAME: &'static str = "raw location descriptor";

    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, offset) = le_u64(input)?;
        let (input, size) = le_u64(input)?;
        let (input, checksum) = le_u32(input)?;
        let (input, flags) = le_u32(input)?;
        Ok((input, Self { offset, size, checksum, flags }))
    }
}

impl RawLocationDescriptor {
    pub fn is_unused(&self) -> bool {
        self.size == 0
    }

    fn is_terminator(&self) -> bool {
        self.offset == 0 && self.size == 0 && self.checksum == 0 && self.flags == 0
    }
}

#[cfg(test)]
mod tests {
    use acid_io::Cursor;
    use alloc::string::ToString;
    use alloc::vec;

    use super::*;

    fn pv_header_bytes(id: &[u8; 32], size: u64, data: &[(u64, u64)], metadata: &[(u64, u64)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(id);
        out.extend_from_slice(&size.to_le_bytes());
        for table in [data, metadata] {
            for (offset, size) in table.iter().chain(&[(0, 0)]) {
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&size.to_le_bytes());
            }
        }
        out
    }

    const ID: &[u8; 32] = b"Qm3xVdO6h2EsKyS1ci6pTTBoBhGtvwz9";

    #[test]
    fn pv_header_roundtrip() {
        let data = [(1048576, 0), (2097152, 4096)];
        let metadata = [(4096, 1044480), (8192, 512), (12288, 512)];
        let bytes = pv_header_bytes(ID, 10737418240, &data, &metadata);
        let mut cursor = Cursor::new(bytes);

        let pvh = PhysicalVolumeHeader::read(&mut cursor, 0).unwrap();
        assert_eq!(pvh.pv_ident.as_bytes(), ID);
        assert_eq!(pvh.pv_size, 10737418240);
        let pairs = |v: &[DataAreaDescriptor]| v.iter().map(|d| (d.offset, d.size)).collect::<Vec<_>>();
        assert_eq!(pairs(&pvh.data_descriptors), data);
        assert_eq!(pairs(&pvh.metadata_descriptors), metadata);
        assert_eq!(pvh.extension, None);
    }

    #[test]
    fn pv_header_with_extension() {
        let mut bytes = pv_header_bytes(ID, 4194304, &[(1048576, 0)], &[(4096, 1044480)]);
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]);
        let mut cursor = Cursor::new(bytes);

        let pvh = PhysicalVolumeHeader::read(&mut cursor, 0).unwrap();
        let extension = pvh.extension.unwrap();
        assert_eq!(extension.version, 2);
        assert_eq!(extension.flags, 1);
        assert!(extension.bootloader_descriptors.is_empty());
    }

    #[test]
    fn pv_header_missing_metadata_sentinel() {
        let mut bytes = pv_header_bytes(ID, 4194304, &[(1048576, 0)], &[]);
        // drop the metadata table sentinel entirely
        bytes.truncate(bytes.len() - 16);
        bytes.extend_from_slice(&4096u64.to_le_bytes());
        let mut cursor = Cursor::new(bytes);

        let err = PhysicalVolumeHeader::read(&mut cursor, 0).unwrap_err();
        assert!(matches!(err, Error::TruncatedRead { what: "area descriptor", offset: 72, .. }), "{err:?}");
    }

    #[test]
    fn pv_id_display() {
        assert_eq!(PvId(*ID).to_string(), "Qm3xVd-O6h2-EsKy-S1ci-6pTT-BoBh-Gtvwz9");
        let mut raw = [0u8; 32];
        raw[31] = 0xab;
        assert_eq!(PvId(raw).to_string(), "00".repeat(31) + "ab");
    }

    #[test]
    fn label_header_fields() {
        let mut sheet = vec![0u8; 32];
        sheet[..8].copy_from_slice(b"LABELONE");
        sheet[8..16].copy_from_slice(&1u64.to_le_bytes());
        sheet[16..20].copy_from_slice(&0xdeadbeefu32.to_le_bytes());
        sheet[20..24].copy_from_slice(&32u32.to_le_bytes());
        sheet[24..32].copy_from_slice(b"LVM2 001");

        let label: LabelHeader = parse_exact(&sheet, LABEL_OFFSET).unwrap();
        assert!(label.is_lvm2());
        assert_eq!(label.sector_number, 1);
        assert_eq!(label.checksum, 0xdeadbeef);
        assert_eq!(label.pv_header_offset(), 544);
    }

    #[test]
    fn mda_header_stops_at_terminator() {
        let mut sheet = vec![0u8; MDA_HEADER_SIZE];
        sheet[4..20].copy_from_slice(MDA_SIGNATURE);
        sheet[20..24].copy_from_slice(&1u32.to_le_bytes());
        sheet[24..32].copy_from_slice(&4096u64.to_le_bytes());
        sheet[32..40].copy_from_slice(&1044480u64.to_le_bytes());
        // an unused slot, a used one, then the terminator and some junk after it
        sheet[40..48].copy_from_slice(&512u64.to_le_bytes());
        sheet[64..72].copy_from_slice(&1024u64.to_le_bytes());
        sheet[72..80].copy_from_slice(&300u64.to_le_bytes());
        sheet[112..120].copy_from_slice(&77u64.to_le_bytes());

        let mdah: MetadataAreaHeader = parse_exact(&sheet, 4096).unwrap();
        assert!(mdah.has_valid_signature());
        assert_eq!(mdah.start, 4096);
        assert_eq!(mdah.size, 1044480);
        assert_eq!(mdah.location_descriptors.len(), 2);
        assert!(mdah.location_descriptors[0].is_unused());
        assert_eq!(mdah.location_descriptors[1].offset, 1024);
        assert_eq!(mdah.location_descriptors[1].size, 300);
    }

    #[test]
    fn short_mda_header_is_truncated() {
        let err = parse_exact::<MetadataAreaHeader>(&[0u8; 100], 4096).unwrap_err();
        assert!(matches!(err, Error::TruncatedRead { offset: 4096, needed: 512, .. }));
    }
}
