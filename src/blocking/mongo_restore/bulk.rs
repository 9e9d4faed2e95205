use super::frame::{decode_document, encode_document};
use super::intent::Namespace;
use crate::blocking::{BatchOutcome, RestoreTarget, WriteOptions};
use crate::error::Result;
use crate::MAX_BSON_SIZE;
use bson::Document;

/// Buffers documents for one collection and writes them with one insert command per batch.
///
/// A batch is written when it holds `doc_limit` documents, or before a document would push
/// it over `byte_limit` bytes.  Call [flush](BufferedBulkInserter::flush) after the last
/// insert to write what's left.
pub struct BufferedBulkInserter<'a, T: RestoreTarget + ?Sized> {
    target: &'a T,
    ns: &'a Namespace,
    options: WriteOptions,
    doc_limit: usize,
    byte_limit: usize,
    docs: Vec<Document>,
    byte_count: usize,
}

impl<'a, T: RestoreTarget + ?Sized> BufferedBulkInserter<'a, T> {
    /// create an inserter which writes into `ns`, at most `doc_limit` documents per batch.
    pub fn new(target: &'a T, ns: &'a Namespace, options: WriteOptions, doc_limit: usize) -> Self {
        let doc_limit = doc_limit.max(1);
        BufferedBulkInserter {
            target,
            ns,
            options,
            doc_limit,
            byte_limit: MAX_BSON_SIZE,
            docs: Vec::with_capacity(doc_limit),
            byte_count: 0,
        }
    }

    /// Change the byte ceiling of one batch, it can't exceed [MAX_BSON_SIZE].
    pub fn with_byte_limit(mut self, byte_limit: usize) -> Self {
        self.byte_limit = byte_limit.min(MAX_BSON_SIZE);
        self
    }

    /// Buffer `doc`.
    ///
    /// Returns the outcome of batches written because of this call, if any.
    pub fn insert(&mut self, doc: Document) -> Result<Option<BatchOutcome>> {
        let size = encode_document(&doc)?.len();
        self.push(doc, size)
    }

    /// Buffer a document given as one encoded frame.
    pub fn insert_raw(&mut self, frame: &[u8]) -> Result<Option<BatchOutcome>> {
        let doc = decode_document(frame)?;
        self.push(doc, frame.len())
    }

    /// Write all buffered documents with one insert command.
    ///
    /// Counters are reset whether the write succeeds or not.  An empty buffer writes nothing.
    pub fn flush(&mut self) -> Result<BatchOutcome> {
        if self.docs.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let mut data_to_write = Vec::with_capacity(self.doc_limit);
        std::mem::swap(&mut self.docs, &mut data_to_write);
        self.byte_count = 0;
        self.target
            .insert_documents(self.ns, data_to_write, &self.options)
    }

    /// documents waiting in buffer.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// bytes waiting in buffer.
    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    fn push(&mut self, doc: Document, size: usize) -> Result<Option<BatchOutcome>> {
        let mut outcome: Option<BatchOutcome> = None;
        if !self.docs.is_empty() && self.byte_count + size > self.byte_limit {
            outcome = Some(self.flush()?);
        }

        self.docs.push(doc);
        self.byte_count += size;

        if self.docs.len() >= self.doc_limit {
            let flushed = self.flush()?;
            outcome = Some(match outcome {
                Some(mut previous) => {
                    previous.merge(flushed);
                    previous
                }
                None => flushed,
            });
        }
        Ok(outcome)
    }
}
