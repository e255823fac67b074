#![cfg(target_os = "linux")]

mod slab;

pub use slab::FixedSlab;

use {
    io_uring::{cqueue, squeue, types, IoUring, Submitter},
    std::{io, time::Duration},
};

/// A single kernel operation owned by a [`Ring`] from submission until its
/// completion has been dispatched.
pub trait RingOp<S>: Sized {
    /// Build the submission entry for this op.
    ///
    /// Any pointer stored in the entry must stay valid until [`Self::complete`]
    /// runs; the ring keeps the op alive in its slab for exactly that long, so
    /// pointers into the op itself (or into memory the op owns) are fine.
    fn entry(&mut self) -> squeue::Entry;

    /// Handle the completion result. `res` is the raw CQE result translated
    /// into `io::Result` (negative results become errors).
    fn complete(
        &mut self,
        completion: &mut Completion<'_, S, Self>,
        res: io::Result<i32>,
    ) -> io::Result<()>;
}

/// Access handed to [`RingOp::complete`]: the ring context plus the ability to
/// queue follow-up operations (e.g. resubmitting the remainder of a short
/// read). Queued ops are pushed once the current completion returns.
pub struct Completion<'a, S, O> {
    context: &'a mut S,
    spawned: &'a mut Vec<O>,
}

impl<S, O> Completion<'_, S, O> {
    pub fn context(&self) -> &S {
        self.context
    }

    pub fn context_mut(&mut self) -> &mut S {
        self.context
    }

    pub fn push(&mut self, op: O) {
        self.spawned.push(op);
    }
}

struct InFlight<O> {
    op: O,
    /// Slab key of a linked CQE_SKIP_SUCCESS head that this op retires on
    /// successful completion (see [`Ring::push_linked`]).
    skip_parent: Option<usize>,
}

/// Completion-driven wrapper around an [`IoUring`] instance.
///
/// Operations are stored in a fixed slab whose keys double as CQE user_data,
/// so every completion can be dispatched back to the op that issued it. The
/// shared per-ring state `S` is threaded into each completion handler.
pub struct Ring<S, O> {
    io_uring: IoUring,
    in_flight: FixedSlab<InFlight<O>>,
    context: S,
}

impl<S, O: RingOp<S>> Ring<S, O> {
    /// Wrap `io_uring`. The completion-queue size bounds the number of
    /// operations that may be in flight at any time.
    pub fn new(io_uring: IoUring, context: S) -> Self {
        let in_flight = FixedSlab::with_capacity(io_uring.params().cq_entries() as usize);
        Self {
            io_uring,
            in_flight,
            context,
        }
    }

    pub fn context(&self) -> &S {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut S {
        &mut self.context
    }

    /// Number of operations currently owned by the ring.
    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Queue `op` for submission and return its slab key (usable as an
    /// async-cancel target). The entry is pushed to the submission queue
    /// immediately but only submitted to the kernel when the queue fills or
    /// one of the submit methods is called.
    pub fn push(&mut self, op: O) -> io::Result<usize> {
        self.reserve(1)?;
        let key = self.in_flight.insert(InFlight {
            op,
            skip_parent: None,
        });
        self.push_entry(key, squeue::Flags::empty())?;
        Ok(key)
    }

    /// Queue `first` and `second` as an IOSQE_IO_LINK chain.
    ///
    /// With `skip_first_success` the head also carries CQE_SKIP_SUCCESS: its
    /// completion is suppressed when it succeeds, and the tail's completion
    /// retires the head's slot instead. When the head fails, its error CQE
    /// precedes the tail's `ECANCELED`, so the head retires itself first.
    pub fn push_linked(
        &mut self,
        first: O,
        second: O,
        skip_first_success: bool,
    ) -> io::Result<(usize, usize)> {
        self.reserve(2)?;
        let mut head_flags = squeue::Flags::IO_LINK;
        if skip_first_success {
            head_flags |= squeue::Flags::SKIP_SUCCESS;
        }
        let head = self.in_flight.insert(InFlight {
            op: first,
            skip_parent: None,
        });
        let tail = self.in_flight.insert(InFlight {
            op: second,
            skip_parent: skip_first_success.then_some(head),
        });
        self.push_entry(head, head_flags)?;
        self.push_entry(tail, squeue::Flags::empty())?;
        Ok((head, tail))
    }

    /// Make room for `want` more ops in both the slab and the submission queue.
    ///
    /// Reserving submission-queue space up front also guarantees that a linked
    /// chain is never split by an implicit submit.
    fn reserve(&mut self, want: usize) -> io::Result<()> {
        while self.in_flight.len() + want > self.in_flight.capacity() {
            self.submit_and_wait(1, None)?;
            self.process_completions()?;
        }
        let free = {
            let sq = self.io_uring.submission();
            sq.capacity() - sq.len()
        };
        if free < want {
            self.submit()?;
        }
        Ok(())
    }

    fn push_entry(&mut self, key: usize, flags: squeue::Flags) -> io::Result<()> {
        let entry = self
            .in_flight
            .get_mut(key)
            .unwrap()
            .op
            .entry()
            .user_data(key as u64)
            .flags(flags);
        // Safety: pointers referenced by the entry live in the slab-held op
        // (or in memory it owns) until the completion is dispatched.
        unsafe {
            if self.io_uring.submission().push(&entry).is_err() {
                self.submit()?;
                self.io_uring
                    .submission()
                    .push(&entry)
                    .map_err(|_| io::Error::other("submission queue full after submit"))?;
            }
        }
        Ok(())
    }

    /// Submit all queued entries without waiting.
    pub fn submit(&mut self) -> io::Result<()> {
        loop {
            match self.io_uring.submit() {
                Ok(_) => return Ok(()),
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {
                    // Completion queue is full; reap before submitting more.
                    self.process_completions()?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Submit queued entries and wait until at least `want` completions are
    /// available (or `timeout` expires, which is not an error).
    pub fn submit_and_wait(&mut self, want: usize, timeout: Option<Duration>) -> io::Result<()> {
        loop {
            let res = match timeout {
                Some(timeout) => {
                    let ts = types::Timespec::new()
                        .sec(timeout.as_secs())
                        .nsec(timeout.subsec_nanos());
                    let args = types::SubmitArgs::new().timespec(&ts);
                    self.io_uring.submitter().submit_with_args(want, &args)
                }
                None => self.io_uring.submit_and_wait(want),
            };
            match res {
                Ok(_) => return Ok(()),
                Err(err) if err.raw_os_error() == Some(libc::ETIME) => return Ok(()),
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {
                    self.process_completions()?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drain the completion queue, dispatching every CQE to its op.
    ///
    /// Every reaped CQE is dispatched even when an earlier handler fails
    /// (the first error is reported afterwards); dropping dispatches would
    /// leak their slab slots and stall the shutdown drain.
    pub fn process_completions(&mut self) -> io::Result<()> {
        let mut first_err = None;
        loop {
            let entries: Vec<cqueue::Entry> = self.io_uring.completion().collect();
            if entries.is_empty() {
                break;
            }
            for cqe in entries {
                if let Err(err) = self.dispatch(cqe) {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn dispatch(&mut self, cqe: cqueue::Entry) -> io::Result<()> {
        let key = cqe.user_data() as usize;
        let Some(mut entry) = self.in_flight.try_remove(key) else {
            return Err(io::Error::other("completion carries an unknown user_data tag"));
        };
        let res = cqe.result();
        let res = if res < 0 {
            Err(io::Error::from_raw_os_error(-res))
        } else {
            Ok(res)
        };

        if let Some(parent) = entry.skip_parent {
            // Retire the suppressed head's slot. If the head failed instead,
            // its error CQE was posted (and dispatched) before this one, so
            // the slot is already gone and this is a no-op.
            let _ = self.in_flight.try_remove(parent);
        }

        let mut spawned = Vec::new();
        let mut completion = Completion {
            context: &mut self.context,
            spawned: &mut spawned,
        };
        entry.op.complete(&mut completion, res)?;
        for op in spawned {
            self.push(op)?;
        }
        Ok(())
    }

    /// Submit everything queued and wait for all in-flight ops to finish.
    pub fn drain(&mut self) -> io::Result<()> {
        self.submit()?;
        while !self.in_flight.is_empty() {
            self.submit_and_wait(1, None)?;
            self.process_completions()?;
        }
        Ok(())
    }

    /// Register `iovecs` as fixed buffers.
    ///
    /// # Safety
    /// The memory behind `iovecs` must stay valid and unmoved until the ring
    /// is dropped (or the buffers are unregistered).
    pub unsafe fn register_buffers(&self, iovecs: &[libc::iovec]) -> io::Result<()> {
        unsafe { self.io_uring.submitter().register_buffers(iovecs) }
    }

    /// Raw access for registration calls not wrapped here.
    pub fn submitter(&self) -> Submitter<'_> {
        self.io_uring.submitter()
    }
}

impl<S, O> Drop for Ring<S, O> {
    fn drop(&mut self) {
        // In-flight ops reference buffers that may be freed right after the
        // ring; wait for the kernel to finish with them. Completions are not
        // dispatched here (O: RingOp is not available in a generic Drop), the
        // slab entries just need to outlive the kernel's use of their memory.
        let bound = self.in_flight.capacity().saturating_mul(2);
        for _ in 0..bound {
            if self.in_flight.is_empty() {
                break;
            }
            if self.io_uring.submit_and_wait(1).is_err() {
                break;
            }
            for cqe in self.io_uring.completion() {
                let _ = self.in_flight.try_remove(cqe.user_data() as usize);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, io_uring::opcode};

    struct CountedNop;

    impl RingOp<u32> for CountedNop {
        fn entry(&mut self) -> squeue::Entry {
            opcode::Nop::new().build()
        }

        fn complete(
            &mut self,
            completion: &mut Completion<'_, u32, Self>,
            res: io::Result<i32>,
        ) -> io::Result<()> {
            res?;
            *completion.context_mut() += 1;
            Ok(())
        }
    }

    fn test_ring(entries: u32) -> Option<Ring<u32, CountedNop>> {
        // Not all CI kernels/sandboxes permit io_uring; skip quietly there.
        let io_uring = IoUring::builder().build(entries).ok()?;
        Some(Ring::new(io_uring, 0))
    }

    #[test]
    fn nops_complete_and_retire() {
        let Some(mut ring) = test_ring(8) else {
            return;
        };
        for _ in 0..20 {
            ring.push(CountedNop).unwrap();
        }
        ring.drain().unwrap();
        assert_eq!(*ring.context(), 20);
        assert_eq!(ring.num_in_flight(), 0);
    }

    #[test]
    fn skip_success_head_is_retired_by_tail() {
        let Some(mut ring) = test_ring(8) else {
            return;
        };
        ring.push_linked(CountedNop, CountedNop, true).unwrap();
        ring.drain().unwrap();
        // Head CQE was suppressed, only the tail bumped the counter.
        assert_eq!(*ring.context(), 1);
        assert_eq!(ring.num_in_flight(), 0);
    }
}
