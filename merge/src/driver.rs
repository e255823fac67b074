use {
    crate::{
        framer::LineCursor,
        heap::{compare_keys, LineHeap},
        reader::{Filled, SourceRead},
        writer::OutputBatch,
        ByteSpan, MergeError,
    },
    std::{cmp::Ordering, io::Write, mem, ptr::NonNull},
};

const HEADER_PREFIX: &[u8] = b">>> ";
const NEWLINE: &[u8] = b"\n";

/// What the resident heap entry (or directly-continued line) of a source is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SourceState {
    /// A read is outstanding; the source has no merge candidate yet.
    Filling,
    /// A complete line is the candidate.
    Armed,
    /// The candidate is the bucket-sized prefix of a line that overflows the
    /// bucket; the rest streams at emission time.
    ArmedTruncated,
    /// The candidate is the unterminated final line; close after emitting.
    ArmedFinal,
    Closed,
}

#[derive(Debug, Default)]
pub struct MergeStats {
    pub lines: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Pulls the smallest line across all sources and pushes it to the sink,
/// emitting a `>>> <filename>` header before each maximal run of lines from
/// one source.
///
/// A source re-enters the merge cheaply: after emitting one of its lines the
/// driver compares the next line against the heap root and keeps emitting
/// while the source cannot lose, so the heap is only touched on source
/// switches and refills.
pub struct MergeDriver<R, W: Write> {
    reader: R,
    heap: LineHeap,
    cursors: Vec<LineCursor>,
    states: Vec<SourceState>,
    /// Rendered `>>> <name>\n` bytes per source; spans handed to the batch
    /// point into these.
    headers: Vec<Box<[u8]>>,
    batch: OutputBatch<W>,
    last_source: Option<u32>,
    /// Number of sources in `Filling` state.
    filling: usize,
    lines: u64,
}

/// Arena tail `(len, align)` a reader must be built with so the driver can
/// install its heap storage there (see `ReaderOptions::extra_len`).
pub fn heap_extra(source_count: usize) -> (usize, usize) {
    (LineHeap::needed_bytes(source_count as u32), LineHeap::ALIGN)
}

impl<R: SourceRead, W: Write> MergeDriver<R, W> {
    /// Build a driver over `reader`. `names` are the per-source display
    /// names used in headers; `reader` must have been constructed with the
    /// `heap_extra` arena tail.
    pub fn new(
        reader: R,
        names: &[impl AsRef<[u8]>],
        out: W,
    ) -> Result<Self, MergeError> {
        let count = reader.source_count();
        if names.len() != count {
            return Err(MergeError::Invariant("one display name per source required"));
        }

        let storage: NonNull<u8> = reader.extra_area();
        if (storage.as_ptr() as usize) % LineHeap::ALIGN != 0 {
            return Err(MergeError::Invariant("misaligned heap storage area"));
        }
        // Safety: the area is sized via `heap_extra` and stays valid for the
        // reader's lifetime; the reader outlives the heap inside this struct.
        let heap = unsafe { LineHeap::from_raw(storage, count as u32) };

        let headers = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                let mut header = Vec::with_capacity(HEADER_PREFIX.len() + name.len() + 1);
                header.extend_from_slice(HEADER_PREFIX);
                header.extend_from_slice(name);
                header.push(b'\n');
                header.into_boxed_slice()
            })
            .collect();

        Ok(Self {
            reader,
            heap,
            cursors: (0..count).map(|_| LineCursor::new()).collect(),
            states: vec![SourceState::Filling; count],
            headers,
            batch: OutputBatch::new(out),
            last_source: None,
            filling: count,
            lines: 0,
        })
    }

    /// Run the merge to completion.
    pub fn run(mut self) -> Result<MergeStats, MergeError> {
        loop {
            // Every open source must have a candidate before a pop can be
            // trusted to be the global minimum.
            while self.filling > 0 {
                self.pump()?;
            }
            let Some((key, source)) = self.heap.pop() else {
                break;
            };
            self.emit_run(key, source)?;
        }

        self.batch.flush()?;
        for source in 0..self.states.len() as u32 {
            if self.states[source as usize] != SourceState::Closed {
                self.close(source)?;
            }
        }

        let stats = MergeStats {
            lines: self.lines,
            bytes_read: self.reader.bytes_read_total(),
            bytes_written: self.batch.bytes_written(),
        };
        log::debug!(
            "merged {} lines, {} bytes in, {} bytes out",
            stats.lines,
            stats.bytes_read,
            stats.bytes_written
        );
        Ok(stats)
    }

    fn set_state(&mut self, source: u32, state: SourceState) {
        let old = mem::replace(&mut self.states[source as usize], state);
        if old == SourceState::Filling && state != SourceState::Filling {
            self.filling -= 1;
        } else if old != SourceState::Filling && state == SourceState::Filling {
            self.filling += 1;
        }
    }

    fn close(&mut self, source: u32) -> Result<(), MergeError> {
        self.reader.close_source(source)?;
        self.set_state(source, SourceState::Closed);
        Ok(())
    }

    fn push_key(&mut self, key: ByteSpan, source: u32) -> Result<(), MergeError> {
        self.heap
            .push(key, source)
            .map_err(|_| MergeError::Invariant("more merge candidates than sources"))
    }

    /// Receive one completed read and try to arm its source.
    fn pump(&mut self) -> Result<(), MergeError> {
        match self.reader.next_filled()? {
            Filled::Data { source, loan } => {
                self.cursors[source as usize].set_loan(loan);
                self.admit(source)
            }
            Filled::Eof { source, carry } => {
                if carry.is_empty() {
                    self.close(source)
                } else {
                    // Unterminated last line: it still competes by key.
                    self.push_key(carry, source)?;
                    self.set_state(source, SourceState::ArmedFinal);
                    Ok(())
                }
            }
        }
    }

    /// Arm `source` from its current loan: push a candidate into the heap or
    /// request more bytes.
    fn admit(&mut self, source: u32) -> Result<(), MergeError> {
        let cursor = &mut self.cursors[source as usize];
        if let Some(line) = cursor.next_line() {
            self.push_key(line.span, source)?;
            self.set_state(source, SourceState::Armed);
            return Ok(());
        }

        let carry = cursor.carry();
        if carry.end - carry.start == self.reader.bucket_capacity(source) {
            // The line overflows the bucket: its comparison key is the
            // bucket-sized prefix, the remainder streams at emission time.
            let span = cursor.take_rest();
            self.push_key(span, source)?;
            self.set_state(source, SourceState::ArmedTruncated);
            return Ok(());
        }

        // Recycling reuses the loan; everything referencing it must reach
        // the sink first.
        self.batch.flush()?;
        self.reader.recycle(source, carry)?;
        debug_assert_eq!(self.states[source as usize], SourceState::Filling);
        Ok(())
    }

    /// Emit a maximal run of lines from `source`, starting with the popped
    /// candidate `key`.
    fn emit_run(&mut self, key: ByteSpan, source: u32) -> Result<(), MergeError> {
        if self.last_source != Some(source) {
            if self.last_source.is_some() {
                self.batch.push(ByteSpan::new(NEWLINE))?;
            }
            let header = ByteSpan::new(&self.headers[source as usize]);
            self.batch.push(header)?;
            self.last_source = Some(source);
        }

        let mut key = key;
        loop {
            self.batch.push(key)?;
            self.lines += 1;

            match self.states[source as usize] {
                SourceState::Armed => {}
                SourceState::ArmedTruncated => {
                    return self.stream_long_line(source);
                }
                SourceState::ArmedFinal => {
                    // The final line had no terminator; give it one before
                    // any follow-on output, then retire the source.
                    self.batch.push(ByteSpan::new(NEWLINE))?;
                    self.batch.flush()?;
                    return self.close(source);
                }
                _ => return Err(MergeError::Invariant("emitted a candidate for an idle source")),
            }

            // Advance within the loan; keep the run going while the next
            // line cannot lose against the rest of the field.
            let cursor = &mut self.cursors[source as usize];
            if let Some(line) = cursor.next_line() {
                if let Some(root) = self.heap.peek_key() {
                    if compare_keys(&line.span, &root) == Ordering::Greater {
                        self.push_key(line.span, source)?;
                        return Ok(());
                    }
                }
                key = line.span;
                continue;
            }

            let carry = cursor.carry();
            if carry.end - carry.start == self.reader.bucket_capacity(source) {
                let span = cursor.take_rest();
                self.set_state(source, SourceState::ArmedTruncated);
                if let Some(root) = self.heap.peek_key() {
                    if compare_keys(&span, &root) == Ordering::Greater {
                        self.push_key(span, source)?;
                        return Ok(());
                    }
                }
                key = span;
                continue;
            }

            // Need a refill before the next candidate exists.
            self.batch.flush()?;
            self.reader.recycle(source, carry)?;
            self.set_state(source, SourceState::Filling);
            return Ok(());
        }
    }

    /// The bucket-sized prefix of an overlong line was just emitted; pass
    /// the rest of the line straight through until its terminator shows up.
    fn stream_long_line(&mut self, source: u32) -> Result<(), MergeError> {
        self.batch.flush()?;
        loop {
            {
                let cursor = &mut self.cursors[source as usize];
                debug_assert_eq!(cursor.remaining(), 0);
                let carry = cursor.carry();
                self.reader.recycle(source, carry)?;
            }
            match self.reader.next_filled()? {
                Filled::Data { source: filled, loan } => {
                    if filled != source {
                        return Err(MergeError::Invariant(
                            "unexpected source while streaming a long line",
                        ));
                    }
                    let cursor = &mut self.cursors[source as usize];
                    cursor.set_loan(loan);
                    if let Some(line) = cursor.next_line() {
                        // Terminator found: emit the tail, then re-enter the
                        // merge with whatever follows in this loan.
                        self.batch.push(line.span)?;
                        self.set_state(source, SourceState::Filling);
                        return self.admit(source);
                    }
                    let chunk = cursor.take_rest();
                    self.batch.push(chunk)?;
                    // The chunk references the loan we recycle next round.
                    self.batch.flush()?;
                }
                Filled::Eof { source: filled, carry } => {
                    if filled != source || !carry.is_empty() {
                        return Err(MergeError::Invariant(
                            "unexpected completion while streaming a long line",
                        ));
                    }
                    // The line never got a terminator; synthesize one.
                    self.batch.push(ByteSpan::new(NEWLINE))?;
                    self.batch.flush()?;
                    return self.close(source);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{heap::LineHeap, IoSize},
        std::collections::VecDeque,
    };

    /// Loan-contract reader fed from in-memory chunk scripts, one queue of
    /// read results per source. Asserts the loan discipline as it goes.
    struct ScriptedReader {
        chunks: Vec<VecDeque<Vec<u8>>>,
        bucket: IoSize,
        /// Currently loaned bytes per source; reused only after recycle.
        current: Vec<Vec<u8>>,
        carry: Vec<Vec<u8>>,
        queue: VecDeque<u32>,
        loaned: Vec<bool>,
        closed: Vec<bool>,
        extra: Box<[u64]>,
        total: u64,
    }

    impl ScriptedReader {
        fn new(sources: &[&[&[u8]]], bucket: IoSize) -> Self {
            let count = sources.len();
            let words = LineHeap::needed_bytes(count as u32)
                .div_ceil(std::mem::size_of::<u64>())
                .max(1);
            Self {
                chunks: sources
                    .iter()
                    .map(|chunks| chunks.iter().map(|c| c.to_vec()).collect())
                    .collect(),
                bucket,
                current: vec![Vec::new(); count],
                carry: vec![Vec::new(); count],
                queue: (0..count as u32).collect(),
                loaned: vec![false; count],
                closed: vec![false; count],
                extra: vec![0u64; words].into_boxed_slice(),
                total: 0,
            }
        }
    }

    impl SourceRead for ScriptedReader {
        fn source_count(&self) -> usize {
            self.chunks.len()
        }

        fn bucket_capacity(&self, _source: u32) -> IoSize {
            self.bucket
        }

        fn next_filled(&mut self) -> Result<Filled, MergeError> {
            let source = self
                .queue
                .pop_front()
                .ok_or(MergeError::Invariant("next_filled without a requested read"))?;
            let index = source as usize;
            assert!(!self.loaned[index], "loan already outstanding");
            assert!(!self.closed[index], "read on closed source");

            let mut buf = std::mem::take(&mut self.carry[index]);
            let filled = match self.chunks[index].pop_front() {
                Some(chunk) => {
                    assert!(
                        buf.len() + chunk.len() <= self.bucket as usize,
                        "scripted chunk overflows the bucket"
                    );
                    self.total += chunk.len() as u64;
                    buf.extend_from_slice(&chunk);
                    self.current[index] = buf;
                    Filled::Data {
                        source,
                        loan: ByteSpan::new(&self.current[index]),
                    }
                }
                None => {
                    self.current[index] = buf;
                    Filled::Eof {
                        source,
                        carry: ByteSpan::new(&self.current[index]),
                    }
                }
            };
            self.loaned[index] = true;
            Ok(filled)
        }

        fn recycle(&mut self, source: u32, carry: std::ops::Range<IoSize>) -> Result<(), MergeError> {
            let index = source as usize;
            assert!(self.loaned[index], "recycle without a loan");
            self.carry[index] =
                self.current[index][carry.start as usize..carry.end as usize].to_vec();
            self.loaned[index] = false;
            self.queue.push_back(source);
            Ok(())
        }

        fn close_source(&mut self, source: u32) -> Result<(), MergeError> {
            let index = source as usize;
            self.closed[index] = true;
            self.loaned[index] = false;
            self.queue.retain(|&s| s != source);
            Ok(())
        }

        fn extra_area(&self) -> NonNull<u8> {
            NonNull::new(self.extra.as_ptr() as *mut u8).unwrap()
        }

        fn bytes_read_total(&self) -> u64 {
            self.total
        }
    }

    fn merge_scripted(
        sources: &[&[&[u8]]],
        names: &[&str],
        bucket: IoSize,
    ) -> (Vec<u8>, MergeStats) {
        let reader = ScriptedReader::new(sources, bucket);
        let mut out = Vec::new();
        let stats = MergeDriver::new(reader, names, &mut out)
            .unwrap()
            .run()
            .unwrap();
        (out, stats)
    }

    #[test]
    fn merges_two_overlapping_sources() {
        let (out, stats) = merge_scripted(
            &[&[b"1\n2\n3\n4\n5\n6\n"], &[b"4\n5\n6\n7\n8\n9\n"]],
            &["foo.lst", "bar.lst"],
            64,
        );
        assert_eq!(
            out.as_slice(),
            b">>> foo.lst\n1\n2\n3\n4\n\n>>> bar.lst\n4\n5\n\n>>> foo.lst\n5\n6\n\n>>> bar.lst\n6\n7\n8\n9\n"
                .as_slice()
        );
        assert_eq!(stats.lines, 12);
        assert_eq!(stats.bytes_read, 24);
    }

    #[test]
    fn single_source_passes_through_with_one_header() {
        let (out, _) = merge_scripted(&[&[b"alpha\nbeta\n"]], &["only.log"], 64);
        assert_eq!(out.as_slice(), b">>> only.log\nalpha\nbeta\n");
    }

    #[test]
    fn empty_source_produces_no_header() {
        let (out, _) = merge_scripted(&[&[], &[b"x\n"]], &["empty", "full"], 64);
        assert_eq!(out.as_slice(), b">>> full\nx\n");
    }

    #[test]
    fn unterminated_final_line_gets_a_newline() {
        let (out, _) = merge_scripted(&[&[b"tail"]], &["f"], 64);
        assert_eq!(out.as_slice(), b">>> f\ntail\n");
    }

    #[test]
    fn unterminated_line_terminates_before_next_header() {
        // "zz" (no newline) sorts after everything in the other source.
        let (out, _) = merge_scripted(&[&[b"zz"], &[b"a\nb\n"]], &["one", "two"], 64);
        assert_eq!(out.as_slice(), b">>> two\na\nb\n\n>>> one\nzz\n");
    }

    #[test]
    fn equal_first_lines_follow_argument_order() {
        let (out, _) = merge_scripted(&[&[b"x\ny\n"], &[b"x\n"]], &["A", "B"], 64);
        assert_eq!(out.as_slice(), b">>> A\nx\n\n>>> B\nx\n\n>>> A\ny\n");
    }

    #[test]
    fn lines_straddling_refills_are_reassembled() {
        // The second line arrives split across two loans; the carry makes it
        // contiguous again before it is framed.
        let (out, _) = merge_scripted(
            &[&[b"abc\nlongli", b"ne\n"]],
            &["s"],
            16,
        );
        assert_eq!(out.as_slice(), b">>> s\nabc\nlongline\n");
    }

    #[test]
    fn overlong_line_streams_past_the_bucket() {
        // The line fills whole buckets; only its first-bucket prefix is the
        // comparison key, but the bytes all come out, in order.
        let (out, stats) = merge_scripted(
            &[&[b"abcd", b"efgh", b"ij\n", b"k\n"], &[b"x\n"]],
            &["big", "small"],
            4,
        );
        assert_eq!(out.as_slice(), b">>> big\nabcdefghij\nk\n\n>>> small\nx\n");
        assert_eq!(stats.bytes_read, 15);
    }

    #[test]
    fn overlong_line_at_eof_is_terminated() {
        let (out, _) = merge_scripted(&[&[b"abcd", b"ef"]], &["s"], 4);
        assert_eq!(out.as_slice(), b">>> s\nabcdef\n");
    }

    #[test]
    fn conservation_across_many_sources() {
        let sources: &[&[&[u8]]] = &[
            &[b"b\nd\nf\n"],
            &[b"a\nc\ne\n"],
            &[b"c\nc\nz\n"],
        ];
        let (out, stats) = merge_scripted(sources, &["s0", "s1", "s2"], 64);
        // Every payload byte shows up exactly once.
        let payload: usize = out
            .split(|&b| b == b'\n')
            .filter(|line| !line.starts_with(b">>> ") && !line.is_empty())
            .map(|line| line.len() + 1)
            .sum();
        assert_eq!(payload as u64, stats.bytes_read);
        assert_eq!(stats.bytes_written, out.len() as u64);
        assert_eq!(stats.lines, 9);
    }
}
