use {
    super::IO_PRIO_BE_HIGHEST,
    crate::{
        memory::ReaderArena,
        reader::{Filled, ReaderOptions, SourceRead},
        ByteSpan, FileSize, IoSize, MergeError,
    },
    io_uring::{opcode, register::Restriction, squeue, types, IoUring},
    std::{
        collections::VecDeque,
        ffi::CString,
        io,
        ops::Range,
        os::fd::RawFd,
        path::PathBuf,
        pin::Pin,
        ptr::{self, NonNull},
    },
    tailmerge_io_uring::{Completion, Ring, RingOp},
};

// IORING_REGISTER_* opcodes that remain permitted once restrictions are
// installed (setup runs with the ring disabled, so the registrations that
// follow the restriction call need explicit whitelisting).
const IORING_REGISTER_BUFFERS: u8 = 0;
const IORING_REGISTER_FILES: u8 = 2;
const IORING_REGISTER_ENABLE_RINGS: u8 = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// openat submitted, first read not yet completed.
    Opening,
    Open,
    Eof,
    Closed,
}

/// One of a source's two read buffers, as (arena offset, size).
///
/// Invariant: `buckets[0]` ends exactly where `buckets[1]` begins, so a
/// source's territory is contiguous. Donation extends `buckets[0]` to the
/// left and keeps that invariant, which is what makes chained donations
/// possible.
#[derive(Clone, Copy, Debug)]
struct Bucket {
    base: usize,
    size: IoSize,
}

#[derive(Debug)]
struct Source {
    path: PathBuf,
    phase: Phase,
    bytes_read: FileSize,
    buckets: [Bucket; 2],
    /// Bucket targeted by the in-flight or most recently completed read.
    active: usize,
    loaned: bool,
    carry_len: IoSize,
    /// carry + fresh bytes of the completed read (loan length).
    filled_len: IoSize,
    /// Slab key of the in-flight read, for async cancellation.
    read_key: Option<usize>,
    /// Donated territory, applied at the next recycle so it can never race
    /// an outstanding loan or in-flight read.
    pending_grow: Option<[Bucket; 2]>,
}

#[derive(Debug, Default)]
struct ReaderStats {
    reads: u64,
    short_reads: u64,
    writes: u64,
    donations: u32,
    donations_skipped: u32,
}

/// Ring context shared with the completion handlers.
struct ReaderState {
    sources: Vec<Source>,
    /// Sources with a completed, not yet loaned read.
    ready: VecDeque<u32>,
    open_files: usize,
    /// Set when an openat fails, so the wait loop can name the file.
    failed_open: Option<u32>,
    pending_writes: usize,
    bytes_out: u64,
    total_read: u64,
    stats: ReaderStats,
}

#[derive(Debug)]
struct OpenOp {
    source: u32,
    /// NUL-terminated path; pinned because the submitted SQE points at it.
    path: Pin<CString>,
}

impl OpenOp {
    fn entry(&mut self) -> squeue::Entry {
        let slot = types::DestinationSlot::try_from_slot_target(self.source)
            .expect("source index is a valid fixed-file slot");
        opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), self.path.as_ptr())
            .flags(libc::O_RDONLY)
            .file_index(Some(slot))
            .build()
    }

    fn complete(
        &mut self,
        completion: &mut Completion<ReaderState, ReaderOp>,
        res: io::Result<i32>,
    ) -> io::Result<()> {
        // Successful opens are suppressed (CQE_SKIP_SUCCESS); only failures
        // get here. The linked read will surface separately as ECANCELED.
        let err = match res {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };
        let state = completion.context_mut();
        state.failed_open = Some(self.source);
        let source = &mut state.sources[self.source as usize];
        source.phase = Phase::Closed;
        state.open_files -= 1;
        Err(err)
    }
}

#[derive(Debug)]
struct ReadOp {
    source: u32,
    ptr: *mut u8,
    len: IoSize,
    offset: FileSize,
    buf_index: u16,
}

impl ReadOp {
    fn entry(&mut self) -> squeue::Entry {
        // The source index doubles as the registered fixed-file slot.
        opcode::ReadFixed::new(types::Fixed(self.source), self.ptr, self.len, self.buf_index)
            .offset(self.offset)
            .ioprio(IO_PRIO_BE_HIGHEST)
            .build()
    }

    fn complete(
        &mut self,
        completion: &mut Completion<ReaderState, ReaderOp>,
        res: io::Result<i32>,
    ) -> io::Result<()> {
        let state = completion.context_mut();
        let source = &mut state.sources[self.source as usize];
        source.read_key = None;

        let read_len = match res {
            Ok(len) => len as IoSize,
            // close_source cancelled this read (or a failed linked open
            // broke the chain); either way the source is already retired.
            Err(err) if err.raw_os_error() == Some(libc::ECANCELED) => return Ok(()),
            Err(err) => return Err(err),
        };

        source.bytes_read += read_len as FileSize;
        source.filled_len = source.carry_len + read_len;
        state.total_read += read_len as u64;
        state.stats.reads += 1;
        if read_len > 0 && read_len < self.len {
            state.stats.short_reads += 1;
        }

        if read_len == 0 {
            source.phase = Phase::Eof;
            state.open_files -= 1;
        } else if source.phase == Phase::Opening {
            source.phase = Phase::Open;
        }
        state.ready.push_back(self.source);
        Ok(())
    }
}

#[derive(Debug)]
struct WriteOp {
    fd: RawFd,
    /// Owned iovec array; the SQE points into it until completion.
    iovecs: Box<[libc::iovec]>,
    total: usize,
}

impl WriteOp {
    fn entry(&mut self) -> squeue::Entry {
        opcode::Writev::new(
            types::Fd(self.fd),
            self.iovecs.as_ptr(),
            self.iovecs.len() as u32,
        )
        // -1: append at the descriptor's current file position.
        .offset(u64::MAX)
        .build()
    }

    fn complete(
        &mut self,
        completion: &mut Completion<ReaderState, ReaderOp>,
        res: io::Result<i32>,
    ) -> io::Result<()> {
        let written = match res {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(written) => written as usize,
            Err(err) => return Err(err),
        };
        let state = completion.context_mut();
        state.bytes_out += written as u64;

        if written < self.total {
            // Short write: resubmit the remainder, advancing past fully
            // written iovecs and trimming the partial one.
            let mut left = written;
            let mut remainder = Vec::with_capacity(self.iovecs.len());
            for iov in self.iovecs.iter() {
                if left >= iov.iov_len {
                    left -= iov.iov_len;
                    continue;
                }
                remainder.push(libc::iovec {
                    // Safety: stays within the original iovec.
                    iov_base: unsafe { (iov.iov_base as *mut u8).add(left) } as *mut libc::c_void,
                    iov_len: iov.iov_len - left,
                });
                left = 0;
            }
            completion.push(ReaderOp::Write(WriteOp {
                fd: self.fd,
                total: self.total - written,
                iovecs: remainder.into_boxed_slice(),
            }));
        } else {
            state.pending_writes -= 1;
            state.stats.writes += 1;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct CancelOp {
    target: u64,
}

impl CancelOp {
    fn entry(&mut self) -> squeue::Entry {
        opcode::AsyncCancel::new(self.target).build()
    }

    fn complete(
        &mut self,
        _completion: &mut Completion<ReaderState, ReaderOp>,
        _res: io::Result<i32>,
    ) -> io::Result<()> {
        // ENOENT/EALREADY just mean the read finished first.
        Ok(())
    }
}

#[derive(Debug)]
enum ReaderOp {
    Open(OpenOp),
    Read(ReadOp),
    Write(WriteOp),
    Cancel(CancelOp),
}

impl RingOp<ReaderState> for ReaderOp {
    fn entry(&mut self) -> squeue::Entry {
        match self {
            Self::Open(op) => op.entry(),
            Self::Read(op) => op.entry(),
            Self::Write(op) => op.entry(),
            Self::Cancel(op) => op.entry(),
        }
    }

    fn complete(
        &mut self,
        completion: &mut Completion<ReaderState, Self>,
        res: io::Result<i32>,
    ) -> io::Result<()> {
        match self {
            Self::Open(op) => op.complete(completion, res),
            Self::Read(op) => op.complete(completion, res),
            Self::Write(op) => op.complete(completion, res),
            Self::Cancel(op) => op.complete(completion, res),
        }
    }
}

/// Builder for [`RingReader`], mirroring the reader tuning knobs plus the
/// pinned output descriptor used by the ring write path.
pub struct RingReaderBuilder {
    options: ReaderOptions,
    output_fd: RawFd,
}

impl RingReaderBuilder {
    pub fn new() -> Self {
        Self {
            options: ReaderOptions::default(),
            output_fd: libc::STDOUT_FILENO,
        }
    }

    pub fn options(mut self, options: ReaderOptions) -> Self {
        self.options = options;
        self
    }

    /// Descriptor targeted by `write_batch`. Always explicit in tests; the
    /// CLI pins standard output.
    pub fn output_fd(mut self, fd: RawFd) -> Self {
        self.output_fd = fd;
        self
    }

    pub fn open(self, paths: &[PathBuf]) -> Result<RingReader, MergeError> {
        RingReader::open(paths, &self.options, self.output_fd)
    }
}

impl Default for RingReaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull-based multi-file reader over io_uring.
///
/// Keeps one read in flight per open source using two registered buffers per
/// source (one loaned out while the other fills), a sparse fixed-file table
/// indexed by source, and linked openat→read pairs for the initial
/// submissions. Only `submit_and_wait` ever blocks.
pub struct RingReader {
    // Note: ops hold pointers into `arena`; field order drops the ring (which
    // drains the kernel) before the arena.
    ring: Ring<ReaderState, ReaderOp>,
    out_fd: RawFd,
    arena: ReaderArena,
}

impl RingReader {
    /// Set up the ring per the fixed recipe: create disabled with a
    /// user-sized completion queue, install operation restrictions, register
    /// the sparse file table and the buffer region, enable, then submit the
    /// initial openat→read pair for every source (first half, drain,
    /// second half).
    pub fn open(
        paths: &[PathBuf],
        options: &ReaderOptions,
        output_fd: RawFd,
    ) -> Result<Self, MergeError> {
        let count = paths.len() as u32;
        if count == 0 {
            return Err(MergeError::Invariant("at least one source required"));
        }
        let bucket_size = options.bucket_size;

        // Ring capacity: the source count rounded up to even, so the initial
        // pair submission splits into two equal batches.
        let sq_entries = (count + count % 2).max(2);
        // The completion queue sizes the op slab: one read per source plus
        // headroom for writes and cancels.
        let cq_entries = sq_entries * 2 + 8;

        let io_uring =
            create_io_uring(sq_entries, cq_entries).map_err(MergeError::resource("set up io_uring"))?;

        {
            let submitter = io_uring.submitter();
            let mut restrictions = [
                Restriction::sqe_op(opcode::OpenAt::CODE),
                Restriction::sqe_op(opcode::ReadFixed::CODE),
                Restriction::sqe_op(opcode::Writev::CODE),
                Restriction::sqe_op(opcode::AsyncCancel::CODE),
                Restriction::sqe_flags_allowed(
                    (squeue::Flags::FIXED_FILE | squeue::Flags::IO_LINK | squeue::Flags::SKIP_SUCCESS).bits(),
                ),
                Restriction::register_op(IORING_REGISTER_BUFFERS),
                Restriction::register_op(IORING_REGISTER_FILES),
                Restriction::register_op(IORING_REGISTER_ENABLE_RINGS),
            ];
            submitter
                .register_restrictions(&mut restrictions)
                .map_err(MergeError::resource("restrict io_uring operations"))?;
            submitter
                .register_files_sparse(count)
                .map_err(MergeError::resource("register the file table"))?;
        }

        // Two buckets per source, adjacent, in one registered region.
        let arena = ReaderArena::new(
            2 * bucket_size as usize * count as usize,
            options.extra_len,
            options.extra_align,
        )
        .map_err(MergeError::resource("allocate read buffers"))?;
        let iovecs = arena.registration_iovecs();
        // Safety: the arena outlives the ring (field order in RingReader).
        unsafe { io_uring.submitter().register_buffers(&iovecs) }
            .map_err(MergeError::resource("register read buffers"))?;

        io_uring
            .submitter()
            .register_enable_rings()
            .map_err(MergeError::resource("enable the ring"))?;

        let mut sources = Vec::with_capacity(count as usize);
        for (index, path) in paths.iter().enumerate() {
            let territory = 2 * bucket_size as usize * index;
            sources.push(Source {
                path: path.clone(),
                phase: Phase::Opening,
                bytes_read: 0,
                buckets: [
                    Bucket {
                        base: territory,
                        size: bucket_size,
                    },
                    Bucket {
                        base: territory + bucket_size as usize,
                        size: bucket_size,
                    },
                ],
                active: 0,
                loaned: false,
                carry_len: 0,
                filled_len: 0,
                read_key: None,
                pending_grow: None,
            });
        }

        let state = ReaderState {
            sources,
            ready: VecDeque::with_capacity(count as usize),
            open_files: count as usize,
            failed_open: None,
            pending_writes: 0,
            bytes_out: 0,
            total_read: 0,
            stats: ReaderStats::default(),
        };

        let mut reader = Self {
            ring: Ring::new(io_uring, state),
            out_fd: output_fd,
            arena,
        };

        let half = count / 2;
        for index in 0..count {
            if index == half {
                // Drain the first batch of pairs to stay within the ring.
                reader.ring.submit().map_err(MergeError::resource("submit opens"))?;
            }
            reader.push_open_pair(paths, index)?;
        }
        reader.ring.submit().map_err(MergeError::resource("submit opens"))?;

        Ok(reader)
    }

    fn push_open_pair(&mut self, paths: &[PathBuf], source: u32) -> Result<(), MergeError> {
        let path = &paths[source as usize];
        let cstring =
            CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| MergeError::Open {
                path: path.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"),
            })?;

        let bucket = self.ring.context().sources[source as usize].buckets[0];
        let read = ReadOp {
            source,
            // Safety: bucket offsets stay within the arena.
            ptr: unsafe { self.arena.buckets_ptr().add(bucket.base) },
            len: bucket.size,
            offset: 0,
            buf_index: ReaderArena::buf_index(bucket.base),
        };
        let open = OpenOp {
            source,
            path: Pin::new(cstring),
        };

        // The open carries IO_LINK|CQE_SKIP_SUCCESS: on success its
        // completion is suppressed and the read fires immediately; on
        // failure the link breaks and the read completes with ECANCELED.
        let (_, read_key) = self
            .ring
            .push_linked(ReaderOp::Open(open), ReaderOp::Read(read), true)
            .map_err(MergeError::resource("queue the initial reads"))?;
        self.ring.context_mut().sources[source as usize].read_key = Some(read_key);
        Ok(())
    }

    fn map_ring_error(&mut self, err: io::Error) -> MergeError {
        if let Some(source) = self.ring.context_mut().failed_open.take() {
            return MergeError::Open {
                path: self.ring.context().sources[source as usize].path.clone(),
                source: err,
            };
        }
        MergeError::Io {
            desc: "read input",
            source: err,
        }
    }

    /// Bookkeeping shared by `recycle` and `write_batch_and_recycle`: apply
    /// any donated territory, copy the carry into the other bucket and
    /// describe the next read.
    fn prepare_next_read(
        &mut self,
        source: u32,
        carry: Range<IoSize>,
    ) -> Result<ReadOp, MergeError> {
        let region = self.arena.buckets_ptr();
        let state = self.ring.context_mut();
        let src = &mut state.sources[source as usize];
        if !src.loaned || src.phase != Phase::Open {
            return Err(MergeError::Invariant("recycle without an outstanding loan"));
        }
        if carry.start > carry.end || carry.end > src.filled_len {
            return Err(MergeError::Invariant("carry range outside the loan"));
        }

        let carry_len = carry.end - carry.start;
        let old_bucket = src.buckets[src.active];
        // Safety: the carry range lies within the loaned bucket.
        let carry_src = unsafe { region.add(old_bucket.base + carry.start as usize) };

        if let Some(grown) = src.pending_grow.take() {
            src.buckets = grown;
            state.stats.donations += 1;
        }

        let next = 1 - src.active;
        let dest = src.buckets[next];
        if carry_len >= dest.size {
            return Err(MergeError::Invariant("carry fills the whole bucket"));
        }
        if carry_len > 0 {
            // Safety: destination is the unloaned bucket; `ptr::copy`
            // tolerates any overlap with the carry source.
            unsafe {
                ptr::copy(carry_src, region.add(dest.base), carry_len as usize);
            }
        }

        src.active = next;
        src.carry_len = carry_len;
        src.filled_len = 0;
        src.loaned = false;
        let offset = src.bytes_read;

        Ok(ReadOp {
            source,
            // Safety: stays within the destination bucket.
            ptr: unsafe { region.add(dest.base + carry_len as usize) },
            len: dest.size - carry_len,
            offset,
            buf_index: ReaderArena::buf_index(dest.base),
        })
    }

    /// Queue one vectored write of `spans` to the pinned output descriptor.
    /// Completion is observed via [`Self::wait_writes`] (or any later read
    /// wait); the byte accumulator is bumped when the write completes.
    pub fn write_batch(&mut self, spans: &[ByteSpan]) -> Result<(), MergeError> {
        let Some(op) = Self::write_op(self.out_fd, spans) else {
            return Ok(());
        };
        self.ring.context_mut().pending_writes += 1;
        self.ring
            .push(ReaderOp::Write(op))
            .map_err(MergeError::io("write merged output"))?;
        Ok(())
    }

    /// Fused flush + loan return: one submission carrying the vectored write
    /// linked to the follow-up read into the same source's buffers.
    pub fn write_batch_and_recycle(
        &mut self,
        spans: &[ByteSpan],
        source: u32,
        carry: Range<IoSize>,
    ) -> Result<(), MergeError> {
        let read = self.prepare_next_read(source, carry)?;
        let Some(write) = Self::write_op(self.out_fd, spans) else {
            let read_key = self
                .ring
                .push(ReaderOp::Read(read))
                .map_err(MergeError::io("read input"))?;
            self.ring.context_mut().sources[source as usize].read_key = Some(read_key);
            return Ok(());
        };
        self.ring.context_mut().pending_writes += 1;
        let (_, read_key) = self
            .ring
            .push_linked(ReaderOp::Write(write), ReaderOp::Read(read), false)
            .map_err(MergeError::io("write merged output"))?;
        self.ring.context_mut().sources[source as usize].read_key = Some(read_key);
        Ok(())
    }

    /// `None` when nothing would be written (a 0-length writev completion
    /// would be indistinguishable from a stalled sink).
    fn write_op(fd: RawFd, spans: &[ByteSpan]) -> Option<WriteOp> {
        let iovecs: Box<[libc::iovec]> = spans
            .iter()
            .filter(|span| !span.is_empty())
            .map(|span| libc::iovec {
                iov_base: span.as_ptr() as *mut libc::c_void,
                iov_len: span.len() as usize,
            })
            .collect();
        let total: usize = iovecs.iter().map(|iov| iov.iov_len).sum();
        (total > 0).then_some(WriteOp { fd, iovecs, total })
    }

    /// Block until every queued write has completed.
    pub fn wait_writes(&mut self) -> Result<(), MergeError> {
        while self.ring.context().pending_writes > 0 {
            self.ring
                .submit_and_wait(1, None)
                .and_then(|_| self.ring.process_completions())
                .map_err(|err| self.map_ring_error(err))?;
        }
        Ok(())
    }

    /// Bytes pushed through the ring write path.
    pub fn bytes_out(&self) -> u64 {
        self.ring.context().bytes_out
    }

    /// Wait until the in-flight read of `source` (if any) has retired, so
    /// its buffers are quiescent.
    fn wait_read_retired(&mut self, source: u32) -> Result<(), MergeError> {
        while self.ring.context().sources[source as usize].read_key.is_some() {
            self.ring
                .submit_and_wait(1, None)
                .and_then(|_| self.ring.process_completions())
                .map_err(|err| self.map_ring_error(err))?;
        }
        Ok(())
    }
}

fn create_io_uring(sq_entries: u32, cq_entries: u32) -> io::Result<IoUring> {
    // Preferred setup: start disabled (required for restrictions), submit
    // all on error, cooperative task running when the kernel has it.
    let mut builder = IoUring::builder();
    builder
        .setup_cqsize(cq_entries)
        .setup_r_disabled()
        .setup_submit_all()
        .setup_coop_taskrun();
    match builder.build(sq_entries) {
        Ok(io_uring) => Ok(io_uring),
        Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
            // Kernel predates the optional flags; the disabled start is the
            // only one setup cannot do without.
            let mut builder = IoUring::builder();
            builder.setup_cqsize(cq_entries).setup_r_disabled();
            builder.build(sq_entries)
        }
        Err(err) => Err(err),
    }
}

impl SourceRead for RingReader {
    fn source_count(&self) -> usize {
        self.ring.context().sources.len()
    }

    fn bucket_capacity(&self, source: u32) -> IoSize {
        let src = &self.ring.context().sources[source as usize];
        src.buckets[src.active].size
    }

    fn next_filled(&mut self) -> Result<Filled, MergeError> {
        loop {
            self.ring
                .process_completions()
                .map_err(|err| self.map_ring_error(err))?;

            let region = self.arena.buckets_ptr();
            let state = self.ring.context_mut();
            if let Some(source) = state.ready.pop_front() {
                let src = &mut state.sources[source as usize];
                debug_assert!(!src.loaned, "two loans for one source");
                src.loaned = true;
                let bucket = src.buckets[src.active];
                // Safety: the bucket stays allocated for the arena's
                // lifetime; the loan contract governs aliasing.
                let loan = unsafe {
                    ByteSpan::from_raw(region.add(bucket.base).cast_const(), src.filled_len)
                };
                return Ok(if src.phase == Phase::Eof {
                    Filled::Eof {
                        source,
                        carry: loan.slice(0, src.carry_len),
                    }
                } else {
                    Filled::Data { source, loan }
                });
            }

            if self.ring.num_in_flight() == 0 {
                return Err(MergeError::Invariant("waiting with no reads in flight"));
            }
            self.ring
                .submit_and_wait(1, None)
                .map_err(|err| self.map_ring_error(err))?;
        }
    }

    fn recycle(&mut self, source: u32, carry: Range<IoSize>) -> Result<(), MergeError> {
        let read = self.prepare_next_read(source, carry)?;
        let read_key = self
            .ring
            .push(ReaderOp::Read(read))
            .map_err(MergeError::io("read input"))?;
        self.ring.context_mut().sources[source as usize].read_key = Some(read_key);
        Ok(())
    }

    fn close_source(&mut self, source: u32) -> Result<(), MergeError> {
        let read_key = self.ring.context().sources[source as usize].read_key;
        if let Some(key) = read_key {
            self.ring
                .push(ReaderOp::Cancel(CancelOp { target: key as u64 }))
                .map_err(MergeError::io("cancel a pending read"))?;
            // Donated territory must be quiescent before the neighbor may
            // read into it.
            self.wait_read_retired(source)?;
        }

        let state = self.ring.context_mut();
        let index = source as usize;
        {
            let src = &mut state.sources[index];
            if src.phase == Phase::Closed {
                return Ok(());
            }
            if matches!(src.phase, Phase::Opening | Phase::Open) {
                state.open_files -= 1;
            }
            src.phase = Phase::Closed;
            src.loaned = false;
            src.carry_len = 0;
        }
        state.ready.retain(|&s| s != source);

        // Donate this source's territory to the nearest open right
        // neighbor: its first bucket grows leftward, keeping both of its
        // buckets contiguous. Source 0 has no left edge to give away to.
        let donor = &state.sources[index];
        let donor_base = donor.buckets[0].base;
        let donor_total = donor.buckets[0].size + donor.buckets[1].size;
        let donor_end = donor.buckets[1].base + donor.buckets[1].size as usize;
        let recipient = state.sources[index + 1..]
            .iter()
            .position(|s| matches!(s.phase, Phase::Opening | Phase::Open))
            .map(|offset| index + 1 + offset);
        if let Some(recipient) = recipient {
            let neighbor = &mut state.sources[recipient];
            let effective = neighbor.pending_grow.unwrap_or(neighbor.buckets);
            if donor_end == effective[0].base {
                neighbor.pending_grow = Some([
                    Bucket {
                        base: donor_base,
                        size: donor_total + effective[0].size,
                    },
                    effective[1],
                ]);
            } else {
                // A still-loaned gap sits between donor and recipient;
                // widening across it would alias live buffers.
                state.stats.donations_skipped += 1;
            }
        }
        Ok(())
    }

    fn extra_area(&self) -> NonNull<u8> {
        self.arena.extra_area()
    }

    fn bytes_read_total(&self) -> u64 {
        self.ring.context().total_read
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        let stats = &self.ring.context().stats;
        log::debug!(
            "ring reader: {} reads ({} short), {} writes, {} donations ({} skipped)",
            stats.reads,
            stats.short_reads,
            stats.writes,
            stats.donations,
            stats.donations_skipped
        );
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::reader::Filled,
        assert_matches::assert_matches,
        std::{fs::File, io::Write, os::fd::AsRawFd, path::Path},
        tempfile::NamedTempFile,
    };

    fn temp_with(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file
    }

    fn small_options(bucket_size: IoSize) -> ReaderOptions {
        ReaderOptions {
            bucket_size,
            ..ReaderOptions::default()
        }
    }

    /// Rings are unavailable in some sandboxes; skip quietly there.
    fn try_open(paths: &[&Path], bucket_size: IoSize, out: RawFd) -> Option<RingReader> {
        let paths: Vec<PathBuf> = paths.iter().map(|p| p.to_path_buf()).collect();
        match RingReader::open(&paths, &small_options(bucket_size), out) {
            Ok(reader) => Some(reader),
            Err(MergeError::Resource { source, .. }) if super::super::ring_unsupported(&source) => {
                eprintln!("skipping: io_uring unavailable here");
                None
            }
            Err(err) => panic!("ring setup failed: {err}"),
        }
    }

    fn read_everything(reader: &mut RingReader, source: u32) -> Vec<u8> {
        let mut collected = Vec::new();
        loop {
            match reader.next_filled().unwrap() {
                Filled::Data { source: s, loan } if s == source => {
                    collected.extend_from_slice(unsafe { loan.as_slice() });
                    reader.recycle(source, loan.len()..loan.len()).unwrap();
                }
                Filled::Eof { source: s, carry } if s == source => {
                    collected.extend_from_slice(unsafe { carry.as_slice() });
                    return collected;
                }
                other => panic!("unexpected completion: {other:?}"),
            }
        }
    }

    #[test]
    fn reads_one_file_through_the_loan_api() {
        let file = temp_with(b"ring\nreader\npayload\n");
        let Some(mut reader) = try_open(&[file.path()], 64, libc::STDOUT_FILENO) else {
            return;
        };
        assert_eq!(read_everything(&mut reader, 0), b"ring\nreader\npayload\n");
        assert_eq!(reader.bytes_read_total(), 20);
        reader.close_source(0).unwrap();
    }

    #[test]
    fn reads_in_bucket_sized_chunks_with_carry() {
        // 8-byte buckets force refills; empty-carry recycles stream the
        // contents through both buckets alternately.
        let payload = b"0123456789abcdefghij";
        let file = temp_with(payload);
        let Some(mut reader) = try_open(&[file.path()], 8, libc::STDOUT_FILENO) else {
            return;
        };
        assert_eq!(read_everything(&mut reader, 0), payload);
    }

    #[test]
    fn carry_prefixes_the_next_loan() {
        let file = temp_with(b"abcdefgh");
        let Some(mut reader) = try_open(&[file.path()], 4, libc::STDOUT_FILENO) else {
            return;
        };
        let loan = assert_matches!(reader.next_filled().unwrap(), Filled::Data { loan, .. } => loan);
        assert_eq!(unsafe { loan.as_slice() }, b"abcd");
        // Keep "cd" as carry.
        reader.recycle(0, 2..4).unwrap();
        let loan = assert_matches!(reader.next_filled().unwrap(), Filled::Data { loan, .. } => loan);
        assert_eq!(unsafe { loan.as_slice() }, b"cdefgh");
    }

    #[test]
    fn several_sources_complete_independently() {
        let one = temp_with(b"first\n");
        let two = temp_with(b"second\n");
        let three = temp_with(b"");
        let Some(mut reader) =
            try_open(&[one.path(), two.path(), three.path()], 32, libc::STDOUT_FILENO)
        else {
            return;
        };

        let mut seen_data = 0;
        let mut seen_eof = 0;
        for _ in 0..3 {
            match reader.next_filled().unwrap() {
                Filled::Data { source, loan } => {
                    assert!(!loan.is_empty());
                    seen_data += 1;
                    let len = loan.len();
                    reader.recycle(source, len..len).unwrap();
                }
                Filled::Eof { carry, .. } => {
                    assert!(carry.is_empty());
                    seen_eof += 1;
                }
            }
        }
        assert_eq!(seen_data, 2);
        assert_eq!(seen_eof, 1);
    }

    #[test]
    fn missing_file_surfaces_as_open_error() {
        let missing = PathBuf::from("/definitely/not/here.lst");
        let Some(mut reader) = try_open(&[missing.as_path()], 32, libc::STDOUT_FILENO) else {
            return;
        };
        let err = reader.next_filled().unwrap_err();
        assert_matches!(err, MergeError::Open { .. });
    }

    #[test]
    fn ring_writes_land_on_the_pinned_descriptor() {
        let input = temp_with(b"x\n");
        let out_file = NamedTempFile::new().unwrap();
        let out: &File = out_file.as_file();
        let Some(mut reader) = try_open(&[input.path()], 32, out.as_raw_fd()) else {
            return;
        };

        reader
            .write_batch(&[ByteSpan::new(b"hello "), ByteSpan::new(b"world\n")])
            .unwrap();
        reader.wait_writes().unwrap();
        assert_eq!(reader.bytes_out(), 12);
        assert_eq!(std::fs::read(out_file.path()).unwrap(), b"hello world\n");
    }

    #[test]
    fn fused_write_and_recycle_keeps_reading() {
        let input = temp_with(b"abcdefgh");
        let out_file = NamedTempFile::new().unwrap();
        let out_fd = out_file.as_file().as_raw_fd();
        let Some(mut reader) = try_open(&[input.path()], 4, out_fd) else {
            return;
        };

        let loan = assert_matches!(reader.next_filled().unwrap(), Filled::Data { loan, .. } => loan);
        assert_eq!(unsafe { loan.as_slice() }, b"abcd");
        reader
            .write_batch_and_recycle(&[loan], 0, 4..4)
            .unwrap();
        let loan = assert_matches!(reader.next_filled().unwrap(), Filled::Data { loan, .. } => loan);
        assert_eq!(unsafe { loan.as_slice() }, b"efgh");
        reader.wait_writes().unwrap();
        assert_eq!(std::fs::read(out_file.path()).unwrap(), b"abcd");
    }

    #[test]
    fn closing_a_source_donates_its_buckets_rightward() {
        let one = temp_with(b"1\n");
        let two = temp_with(b"atleasttwobuckets\nofdata\n");
        let Some(mut reader) = try_open(&[one.path(), two.path()], 8, libc::STDOUT_FILENO) else {
            return;
        };

        // Pull both first loans so the sources are quiescent.
        let mut loans = Vec::new();
        for _ in 0..2 {
            let (source, loan) =
                assert_matches!(reader.next_filled().unwrap(), Filled::Data { source, loan } => (source, loan));
            loans.push((source, loan));
        }
        assert_eq!(reader.bucket_capacity(1), 8);

        reader.close_source(0).unwrap();

        // The donation is applied at source 1's next recycle; the read after
        // that lands in the widened first bucket (8 own + 16 donated bytes).
        let (_, loan1) = loans.iter().find(|(s, _)| *s == 1).unwrap();
        let len = loan1.len();
        reader.recycle(1, len..len).unwrap();
        let loan = assert_matches!(reader.next_filled().unwrap(), Filled::Data { loan, .. } => loan);
        let len = loan.len();
        reader.recycle(1, len..len).unwrap();
        assert_eq!(reader.bucket_capacity(1), 24);
        assert_matches!(reader.next_filled().unwrap(), Filled::Data { source: 1, .. });
    }
}
