//! Length prefixed bson frames, the format of every `.bson` file written by mongodump.
//!
//! A frame is a bson document: a 4 bytes little endian length which counts itself, followed
//! by the rest of the document.  Frames are written back-to-back with nothing in between.

use crate::error::{RestoreError, Result};
use crate::MAX_BSON_SIZE;
use bson::Document;
use std::io::{ErrorKind as IoErrorKind, Read, Write};

/// Smallest valid document: length prefix plus trailing null byte.
const MIN_BSON_SIZE: usize = 5;

/// Length prefix which ends a section of a mongodump archive.
const ARCHIVE_TERMINATOR: i32 = -1;

/// One item of a mongodump archive stream.
#[derive(Debug, PartialEq, Eq)]
pub enum ArchiveBlock<'a> {
    /// a bson document.
    Frame(&'a [u8]),
    /// end of the current section.
    Terminator,
}

/// Reads frames one by one from an underlying reader.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    /// create a frame reader on top of `reader`.
    pub fn new(reader: R) -> Self {
        FrameReader {
            reader,
            buf: Vec::new(),
        }
    }

    /// Read next frame into the internal buffer, and return it.
    ///
    /// The returned slice is only valid until the next call, the same buffer is reused for
    /// every frame.  Returns `None` when the stream ends cleanly on a frame boundary.
    pub fn next_frame(&mut self) -> Result<Option<&[u8]>> {
        match self.read_size()? {
            None => Ok(None),
            Some(size_buf) => self.read_frame(size_buf).map(Some),
        }
    }

    /// Like [next_frame](FrameReader::next_frame), but a length prefix of `0xffffffff` is
    /// returned as [ArchiveBlock::Terminator] instead of being rejected.
    pub fn next_block(&mut self) -> Result<Option<ArchiveBlock<'_>>> {
        let size_buf = match self.read_size()? {
            None => return Ok(None),
            Some(size_buf) => size_buf,
        };
        if i32::from_le_bytes(size_buf) == ARCHIVE_TERMINATOR {
            return Ok(Some(ArchiveBlock::Terminator));
        }
        Ok(Some(ArchiveBlock::Frame(self.read_frame(size_buf)?)))
    }

    fn read_size(&mut self) -> Result<Option<[u8; 4]>> {
        let mut size_buf = [0; 4];
        let read = read_full(&mut self.reader, &mut size_buf)?;
        if read == 0 {
            return Ok(None);
        }
        if read < size_buf.len() {
            return Err(RestoreError::TruncatedDocument {
                expected: size_buf.len(),
                read,
            });
        }
        Ok(Some(size_buf))
    }

    fn read_frame(&mut self, size_buf: [u8; 4]) -> Result<&[u8]> {
        let size = i32::from_le_bytes(size_buf);
        if size < MIN_BSON_SIZE as i32 || size as usize > MAX_BSON_SIZE {
            return Err(RestoreError::InvalidDocumentSize { size });
        }

        let size = size as usize;
        self.buf.clear();
        self.buf.resize(size, 0);
        self.buf[..4].copy_from_slice(&size_buf);
        let read = read_full(&mut self.reader, &mut self.buf[4..])?;
        if read < size - 4 {
            return Err(RestoreError::TruncatedDocument {
                expected: size,
                read: read + 4,
            });
        }
        Ok(&self.buf)
    }

    /// Read next frame into a newly allocated buffer.
    ///
    /// Use this when frames need to outlive the next read, e.g. when they are sent to
    /// another thread.
    pub fn next_owned_frame(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.next_frame()?.map(|frame| frame.to_vec()))
    }

    /// Read next frame and decode it into a document.
    ///
    /// Stream errors come back as [RestoreError::InvalidDocumentSize] or
    /// [RestoreError::TruncatedDocument], a frame which can't be decoded comes back as
    /// [RestoreError::BsonDecodeError].
    pub fn next_document(&mut self) -> Result<Option<Document>> {
        match self.next_frame()? {
            None => Ok(None),
            Some(frame) => Ok(Some(decode_document(frame)?)),
        }
    }

    /// get back the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_document().transpose()
    }
}

/// Decode one frame into a document.
pub fn decode_document(frame: &[u8]) -> Result<Document> {
    Ok(bson::from_slice(frame)?)
}

/// Encode `doc` into one frame.
pub fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    Ok(bson::to_vec(doc)?)
}

/// Write `doc` as one frame to `writer`.
pub fn write_document<W: Write>(writer: &mut W, doc: &Document) -> Result<()> {
    writer.write_all(&encode_document(doc)?)?;
    Ok(())
}

/// Walk through every element of `frame`, nested documents and arrays included.
///
/// Frames are decoded lazily by the server side, so a malformed element deep inside a
/// document would otherwise only be noticed by the server.
pub fn validate_frame(frame: &[u8]) -> Result<()> {
    let raw = bson::RawDocument::from_bytes(frame)?;
    validate_raw_document(raw)
}

fn validate_raw_document(raw: &bson::RawDocument) -> Result<()> {
    for element in raw {
        let (_, value) = element?;
        validate_raw_value(value)?;
    }
    Ok(())
}

fn validate_raw_value(value: bson::RawBsonRef<'_>) -> Result<()> {
    match value {
        bson::RawBsonRef::Document(d) => validate_raw_document(d),
        bson::RawBsonRef::Array(a) => {
            for item in a {
                validate_raw_value(item?)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Read until `buf` is full or the reader reaches end of file, returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}
