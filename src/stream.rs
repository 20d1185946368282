use core::ops::{Deref, DerefMut};

use acid_io::{ErrorKind, Read, Seek, SeekFrom};
use alloc::vec::Vec;
use nom::IResult;
use snafu::ResultExt;

use crate::header::DataAreaDescriptor;
use crate::{Error, IoSnafu, PositionSnafu, TruncatedReadSnafu};

/// A structure with a fixed on-disk size.
pub trait Decode: Sized {
    /// Bytes occupied on disk.
    const SIZE: usize;
    /// Used in error messages.
    const NAME: &'static str;

    fn parse(input: &[u8]) -> IResult<&[u8], Self>;
}

/// Parses `T` out of a buffer that holds at least `T::SIZE` bytes read from `offset`.
pub(crate) fn parse_exact<T: Decode>(input: &[u8], offset: u64) -> Result<T, Error> {
    let truncated = TruncatedReadSnafu { what: T::NAME, offset, needed: T::SIZE as u64 };
    if input.len() < T::SIZE {
        return truncated.fail();
    }
    match T::parse(&input[..T::SIZE]) {
        Ok((_, value)) => Ok(value),
        Err(_) => truncated.fail(),
    }
}

/// Sequential reads from an absolute starting point, keeping track of where we
/// are so errors can say which byte went wrong.
pub(crate) struct StructReader<'a, T> {
    reader: &'a mut T,
    offset: u64,
}

impl<'a, T: Read + Seek> StructReader<'a, T> {
    pub fn at(reader: &'a mut T, offset: u64) -> Result<Self, Error> {
        reader.seek(SeekFrom::Start(offset)).context(IoSnafu { offset })?;
        Ok(Self { reader, offset })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads exactly `len` bytes. The buffer grows with what the stream
    /// actually holds, so a bogus on-disk length cannot force a huge allocation.
    pub fn read_raw(&mut self, len: usize, what: &'static str) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        let read = self.reader.by_ref().take(len as u64).read_to_end(&mut buf);
        match read {
            Ok(n) if n == len => {
                self.offset += len as u64;
                Ok(buf)
            }
            Ok(_) => TruncatedReadSnafu { what, offset: self.offset, needed: len as u64 }.fail(),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                TruncatedReadSnafu { what, offset: self.offset, needed: len as u64 }.fail()
            }
            Err(source) => Err(Error::Io { offset: self.offset, source }),
        }
    }

    pub fn decode<D: Decode>(&mut self) -> Result<D, Error> {
        let offset = self.offset;
        let buf = self.read_raw(D::SIZE, D::NAME)?;
        parse_exact(&buf, offset)
    }

    /// Reads (offset, size) pairs up to and including the all-zero sentinel.
    /// Running out of input before the sentinel means the table is broken.
    pub fn descriptor_table(&mut self) -> Result<Vec<DataAreaDescriptor>, Error> {
        let mut descriptors = Vec::new();
        loop {
            let descriptor: DataAreaDescriptor = self.decode()?;
            if descriptor.is_sentinel() {
                return Ok(descriptors);
            }
            descriptors.push(descriptor);
        }
    }
}

/// Puts the cursor of a stream back to a fixed position when dropped, so an
/// early return (or `?`) never leaves the caller's stream somewhere unexpected.
pub(crate) struct RestoreCursor<'a, T: Seek> {
    reader: &'a mut T,
    position: u64,
}

impl<'a, T: Seek> RestoreCursor<'a, T> {
    pub fn restore_to(reader: &'a mut T, position: u64) -> Self {
        Self { reader, position }
    }

    pub fn save(reader: &'a mut T) -> Result<Self, Error> {
        let position = reader.seek(SeekFrom::Current(0)).context(PositionSnafu)?;
        Ok(Self { reader, position })
    }
}

impl<'a, T: Seek> Deref for RestoreCursor<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.reader
    }
}

impl<'a, T: Seek> DerefMut for RestoreCursor<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.reader
    }
}

impl<'a, T: Seek> Drop for RestoreCursor<'a, T> {
    fn drop(&mut self) {
        if let Err(error) = self.reader.seek(SeekFrom::Start(self.position)) {
            tracing::warn!(position = self.position, %error, "could not restore stream position");
        }
    }
}
