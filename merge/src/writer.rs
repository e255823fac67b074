use {
    crate::{ByteSpan, IoSize, MergeError},
    std::io::{self, IoSlice, Write},
};

/// Default slice-record capacity: the portable `UIO_MAXIOV` bound for a
/// single vectored write.
pub const DEFAULT_BATCH_CAPACITY: usize = 1024;

/// Bounded batch of output slices flushed with vectored writes.
///
/// Records reference either loaned reader buffers or driver-owned header
/// bytes; the driver flushes before any referenced loan is recycled, which is
/// what keeps the raw spans valid. Everything the merge emits funnels through
/// one batch, so `bytes_written` doubles as the conservation counter.
pub struct OutputBatch<W> {
    out: W,
    spans: Vec<ByteSpan>,
    capacity: usize,
    bytes_written: u64,
}

impl<W: Write> OutputBatch<W> {
    pub fn new(out: W) -> Self {
        Self::with_capacity(out, DEFAULT_BATCH_CAPACITY)
    }

    pub fn with_capacity(out: W, capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            out,
            spans: Vec::with_capacity(capacity),
            capacity,
            bytes_written: 0,
        }
    }

    /// Append a slice record, flushing first if the batch is at capacity.
    pub fn push(&mut self, span: ByteSpan) -> Result<(), MergeError> {
        if span.is_empty() {
            return Ok(());
        }
        if self.spans.len() == self.capacity {
            self.flush()?;
        }
        self.spans.push(span);
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.spans.len()
    }

    /// Total bytes pushed to the sink so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Write out all pending records.
    ///
    /// Short writes advance past fully written records and trim the
    /// partially written one before retrying; a zero-byte write is reported
    /// as an I/O failure rather than retried forever.
    pub fn flush(&mut self) -> Result<(), MergeError> {
        let mut index = 0;
        // Bytes of `spans[index]` consumed by a previous short write.
        let mut trim: IoSize = 0;
        while index < self.spans.len() {
            let iovs: Vec<IoSlice<'_>> = self.spans[index..]
                .iter()
                .enumerate()
                .map(|(i, span)| {
                    let span = if i == 0 {
                        span.slice(trim, span.len())
                    } else {
                        *span
                    };
                    // Safety: the driver only flushes while every referenced
                    // loan is still outstanding.
                    IoSlice::new(unsafe { span.as_slice() })
                })
                .collect();
            match self.out.write_vectored(&iovs) {
                Ok(0) => {
                    return Err(MergeError::Io {
                        desc: "write merged output",
                        source: io::ErrorKind::WriteZero.into(),
                    })
                }
                Ok(written) => {
                    self.bytes_written += written as u64;
                    let mut left = written as u64;
                    while index < self.spans.len() && left > 0 {
                        let span_left = (self.spans[index].len() - trim) as u64;
                        if left >= span_left {
                            left -= span_left;
                            trim = 0;
                            index += 1;
                        } else {
                            trim += left as IoSize;
                            left = 0;
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(MergeError::Io {
                        desc: "write merged output",
                        source: err,
                    })
                }
            }
        }
        self.spans.clear();
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.out
    }
}
