//! The CRC-32 flavour LVM uses for labels, metadata area headers and metadata text.
//!
//! It is the usual reflected CRC-32 (polynomial `0xedb88320`), but seeded with
//! [`INITIAL_CRC`] and without the final inversion.

use snafu::ensure;

use crate::{ChecksumMismatchSnafu, DecodeOptions, Error};

pub const INITIAL_CRC: u32 = 0xf597a6cf;

pub fn lvm_crc(data: &[u8]) -> u32 {
    crc_with_initial(INITIAL_CRC, data)
}

// crc32fast inverts on the way in and on the way out, LVM does neither
fn crc_with_initial(initial: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(!initial);
    hasher.update(data);
    !hasher.finalize()
}

pub(crate) fn verify(
    what: &'static str,
    offset: u64,
    expected: u32,
    data: &[u8],
    options: &DecodeOptions,
) -> Result<(), Error> {
    let actual = lvm_crc(data);
    if actual == expected {
        return Ok(());
    }
    ensure!(
        !options.verify_checksums,
        ChecksumMismatchSnafu { what, offset, expected, actual }
    );
    tracing::warn!(what, offset, expected, actual, "checksum mismatch");
    Ok(())
}
