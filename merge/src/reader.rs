use {
    crate::{memory::ReaderArena, ByteSpan, FileSize, IoSize, MergeError},
    std::{
        collections::VecDeque,
        fs::File,
        io::{self, Read},
        ops::Range,
        path::PathBuf,
        ptr::{self, NonNull},
        slice,
    },
};

/// Default per-source bucket size. Merge keys are whole lines, so anything
/// comfortably above realistic line lengths works; larger buckets just buy
/// bigger sequential reads.
pub const DEFAULT_BUCKET_SIZE: IoSize = 256 * 1024;

/// Reader construction knobs shared by the ring and blocking variants.
#[derive(Clone, Debug)]
pub struct ReaderOptions {
    /// Per-source read buffer (bucket) size.
    pub bucket_size: IoSize,
    /// Size of the caller-owned arena tail (see [`SourceRead::extra_area`]).
    pub extra_len: usize,
    pub extra_align: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            extra_len: 0,
            extra_align: 8,
        }
    }
}

/// One completed read handed to the consumer.
#[derive(Debug)]
pub enum Filled {
    /// A loaned buffer: the previous carry bytes followed by fresh data. The
    /// loan stays valid until `recycle` (or `close_source`) is called for
    /// this source.
    Data { source: u32, loan: ByteSpan },
    /// The source hit end-of-file. `carry` exposes any bytes that were
    /// carried into the final (zero-length) read; they form the unterminated
    /// last line and remain valid until the source is closed.
    Eof { source: u32, carry: ByteSpan },
}

/// The loan contract shared by the io_uring reader and the blocking
/// fallback.
///
/// At most one loan per source is outstanding; the reader never writes into
/// a loaned bucket. `next_filled` may block, everything else is immediate.
pub trait SourceRead {
    fn source_count(&self) -> usize;

    /// Current read capacity of `source`'s buckets: a line without a
    /// terminator that fills a whole bucket is truncated for comparison
    /// purposes.
    fn bucket_capacity(&self, source: u32) -> IoSize;

    /// Return any source's completed, not-yet-loaned buffer, waiting for a
    /// completion if none is ready.
    fn next_filled(&mut self) -> Result<Filled, MergeError>;

    /// Return the loan of `source` and request its next read. `carry` is the
    /// unterminated tail (offsets into the loan) to be preserved in front of
    /// the fresh data.
    fn recycle(&mut self, source: u32, carry: Range<IoSize>) -> Result<(), MergeError>;

    /// Stop reading `source` and release its resources. Idempotent.
    fn close_source(&mut self, source: u32) -> Result<(), MergeError>;

    /// Caller-owned tail of the reader's arena, sized by
    /// [`ReaderOptions::extra_len`]; valid until the reader is dropped.
    fn extra_area(&self) -> NonNull<u8>;

    /// Cumulative payload bytes read across all sources.
    fn bytes_read_total(&self) -> u64;
}

#[derive(Debug)]
struct BlockingSource {
    file: Option<File>,
    /// Bucket offset within the arena.
    base: usize,
    carry_len: IoSize,
    loaned: bool,
    eof: bool,
    bytes_read: FileSize,
}

/// Portable loan-contract reader over plain blocking `read(2)`.
///
/// One bucket per source: `recycle` memmoves the carry to the bucket start
/// and the next read fills the remainder. Spans from a recycled loan die at
/// that point, which the loan discipline already requires.
#[derive(Debug)]
pub struct BlockingReader {
    arena: ReaderArena,
    sources: Vec<BlockingSource>,
    bucket_size: IoSize,
    /// Sources with a requested read, served FIFO by `next_filled`.
    queue: VecDeque<u32>,
    total_read: u64,
}

impl BlockingReader {
    /// Open all `paths` and queue an initial read for each.
    pub fn open(paths: &[PathBuf], options: &ReaderOptions) -> Result<Self, MergeError> {
        let bucket_size = options.bucket_size as usize;
        let arena = ReaderArena::new(
            paths.len() * bucket_size,
            options.extra_len,
            options.extra_align,
        )
        .map_err(MergeError::resource("allocate read buffers"))?;

        let mut sources = Vec::with_capacity(paths.len());
        for (index, path) in paths.iter().enumerate() {
            let file = File::open(path).map_err(|source| MergeError::Open {
                path: path.clone(),
                source,
            })?;
            sources.push(BlockingSource {
                file: Some(file),
                base: index * bucket_size,
                carry_len: 0,
                loaned: false,
                eof: false,
                bytes_read: 0,
            });
        }

        let queue = (0..sources.len() as u32).collect();
        Ok(Self {
            arena,
            sources,
            bucket_size: options.bucket_size,
            queue,
            total_read: 0,
        })
    }
}

impl SourceRead for BlockingReader {
    fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn bucket_capacity(&self, _source: u32) -> IoSize {
        self.bucket_size
    }

    fn next_filled(&mut self) -> Result<Filled, MergeError> {
        let Some(source) = self.queue.pop_front() else {
            return Err(MergeError::Invariant("next_filled without a requested read"));
        };
        let bucket_size = self.bucket_size;
        let src = &mut self.sources[source as usize];
        debug_assert!(!src.loaned);
        let Some(file) = src.file.as_mut() else {
            return Err(MergeError::Invariant("read requested on a closed source"));
        };

        let base = src.base;
        // Safety: the bucket beyond the carry prefix is owned by the reader
        // while no loan is outstanding.
        let free = unsafe {
            slice::from_raw_parts_mut(
                self.arena.buckets_ptr().add(base + src.carry_len as usize),
                (bucket_size - src.carry_len) as usize,
            )
        };
        let read_len = loop {
            match file.read(free) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(MergeError::Io {
                        desc: "read input",
                        source,
                    })
                }
            }
        };
        src.bytes_read += read_len as FileSize;
        self.total_read += read_len as u64;
        src.loaned = true;

        let bucket = unsafe {
            // Safety: the bucket stays allocated for the reader's lifetime.
            ByteSpan::from_raw(self.arena.buckets_ptr().add(base), bucket_size)
        };
        if read_len == 0 {
            src.eof = true;
            Ok(Filled::Eof {
                source,
                carry: bucket.slice(0, src.carry_len),
            })
        } else {
            Ok(Filled::Data {
                source,
                loan: bucket.slice(0, src.carry_len + read_len as IoSize),
            })
        }
    }

    fn recycle(&mut self, source: u32, carry: Range<IoSize>) -> Result<(), MergeError> {
        let bucket_size = self.bucket_size;
        let src = &mut self.sources[source as usize];
        if !src.loaned || src.file.is_none() {
            return Err(MergeError::Invariant("recycle without an outstanding loan"));
        }
        if src.eof {
            return Err(MergeError::Invariant("recycle after end of file"));
        }
        if carry.start > carry.end || carry.end > bucket_size {
            return Err(MergeError::Invariant("carry range outside the loan"));
        }
        let carry_len = carry.end - carry.start;
        if carry_len >= bucket_size {
            // A full bucket of carry can never gain a terminator; the driver
            // streams such lines instead of recycling.
            return Err(MergeError::Invariant("carry fills the whole bucket"));
        }

        if carry_len > 0 && carry.start != 0 {
            // Safety: both ranges lie within this source's bucket; copy
            // handles the overlap.
            unsafe {
                let bucket = self.arena.buckets_ptr().add(src.base);
                ptr::copy(bucket.add(carry.start as usize), bucket, carry_len as usize);
            }
        }
        src.carry_len = carry_len;
        src.loaned = false;
        self.queue.push_back(source);
        Ok(())
    }

    fn close_source(&mut self, source: u32) -> Result<(), MergeError> {
        let src = &mut self.sources[source as usize];
        src.file = None;
        src.loaned = false;
        src.carry_len = 0;
        self.queue.retain(|&s| s != source);
        Ok(())
    }

    fn extra_area(&self) -> NonNull<u8> {
        self.arena.extra_area()
    }

    fn bytes_read_total(&self) -> u64 {
        self.total_read
    }
}
