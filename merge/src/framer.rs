use {
    crate::{ByteSpan, IoSize},
    memchr::memchr,
    std::ops::Range,
};

/// One framed line: the span includes the terminating `\n` when present.
#[derive(Clone, Copy, Debug)]
pub struct LineInfo {
    /// Offset of the line within the current loan.
    pub byte_offset: IoSize,
    /// 1-based line counter across all loans of this source.
    pub line_number: u64,
    pub span: ByteSpan,
}

/// Per-source cursor that frames newline-terminated lines out of the current
/// loan without copying.
///
/// The reader guarantees that a loan starts with the previous loan's carry
/// (the unterminated tail bytes), so a line that straddled a buffer refill is
/// contiguous again and the cursor never has to stitch ranges together.
#[derive(Debug, Default)]
pub struct LineCursor {
    loan: Option<ByteSpan>,
    pos: IoSize,
    line_number: u64,
}

impl LineCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly loaned buffer. Any unconsumed bytes of the previous
    /// loan must have been handed to the reader as carry before this call.
    pub fn set_loan(&mut self, loan: ByteSpan) {
        self.loan = Some(loan);
        self.pos = 0;
    }

    fn loan(&self) -> ByteSpan {
        self.loan.unwrap_or(ByteSpan::empty())
    }

    /// Frame the next complete line of the loan, terminator included.
    /// Returns `None` when no `\n` remains; the leftover bytes are the carry.
    pub fn next_line(&mut self) -> Option<LineInfo> {
        let loan = self.loan();
        // Safety: the loan is valid until the driver recycles it, and the
        // driver drops the cursor's spans before doing so.
        let rest = unsafe { loan.as_slice() };
        let newline = memchr(b'\n', &rest[self.pos as usize..])?;
        let byte_offset = self.pos;
        let end = self.pos + newline as IoSize + 1;
        let span = loan.slice(self.pos, end);
        self.pos = end;
        self.line_number += 1;
        Some(LineInfo {
            byte_offset,
            line_number: self.line_number,
            span,
        })
    }

    /// Unterminated tail of the loan, as offsets the reader copies forward
    /// into the next loan.
    pub fn carry(&self) -> Range<IoSize> {
        self.pos..self.loan().len()
    }

    /// Consume the rest of the loan in one span (truncated-line emission and
    /// end-of-file tails). Counts as a line boundary for numbering.
    pub fn take_rest(&mut self) -> ByteSpan {
        let loan = self.loan();
        let span = loan.slice(self.pos, loan.len());
        self.pos = loan.len();
        self.line_number += 1;
        span
    }

    pub fn remaining(&self) -> IoSize {
        self.loan().len() - self.pos
    }

    pub fn line_number(&self) -> u64 {
        self.line_number
    }
}
