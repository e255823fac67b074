//! Script-driven exerciser for [`LineHeap`], used by the `heap-probe`
//! development binary and the seed-scenario tests.
//!
//! Script grammar: bytes followed by `,` are pushed with the next insertion
//! number as the value; `-` first pushes any pending bytes, then pops one
//! entry; when the script ends, pending bytes are pushed and the heap is
//! drained. All results accumulate in an explicit [`ProbeRun`] value.

use {
    crate::{heap::LineHeap, ByteSpan},
    std::ptr::NonNull,
};

/// One reported pop: the value assigned at push time and the popped key.
#[derive(Debug, PartialEq, Eq)]
pub struct PopRecord {
    pub value: u32,
    pub key: Vec<u8>,
}

/// Mutable state of one script run: the insertion counter and the pops
/// recorded so far.
#[derive(Debug, Default)]
pub struct ProbeRun {
    counter: u32,
    pops: Vec<PopRecord>,
}

impl ProbeRun {
    pub fn pops(&self) -> &[PopRecord] {
        &self.pops
    }

    pub fn into_pops(self) -> Vec<PopRecord> {
        self.pops
    }
}

/// Execute `script` against a fresh heap, returning the recorded pops.
pub fn run_script(script: &str) -> ProbeRun {
    // Upper bound on concurrent entries: every `,` and `-` can introduce at
    // most one push, plus the trailing token.
    let capacity = script
        .bytes()
        .filter(|b| matches!(b, b',' | b'-'))
        .count() as u32
        + 1;

    let words = LineHeap::needed_bytes(capacity)
        .div_ceil(std::mem::size_of::<u64>())
        .max(1);
    let storage = vec![0u64; words].into_boxed_slice();
    let ptr = NonNull::new(storage.as_ptr() as *mut u8).unwrap();
    // Safety: `storage` is 8-aligned, sized by needed_bytes, and outlives
    // `heap` (dropped at the end of this function, after the drain).
    let mut heap = unsafe { LineHeap::from_raw(ptr, capacity) };

    let mut run = ProbeRun::default();
    let bytes = script.as_bytes();
    let mut start = 0;
    for (index, byte) in bytes.iter().enumerate() {
        match byte {
            b',' => {
                push(&mut heap, &mut run, &bytes[start..index]);
                start = index + 1;
            }
            b'-' => {
                if start < index {
                    push(&mut heap, &mut run, &bytes[start..index]);
                }
                pop(&mut heap, &mut run);
                start = index + 1;
            }
            _ => {}
        }
    }
    if start < bytes.len() {
        push(&mut heap, &mut run, &bytes[start..]);
    }
    while !heap.is_empty() {
        pop(&mut heap, &mut run);
    }
    run
}

fn push(heap: &mut LineHeap, run: &mut ProbeRun, key: &[u8]) {
    run.counter += 1;
    heap.push(ByteSpan::new(key), run.counter)
        .expect("probe script exceeded its push bound");
}

fn pop(heap: &mut LineHeap, run: &mut ProbeRun) {
    if let Some((key, value)) = heap.pop() {
        run.pops.push(PopRecord {
            value,
            // Safety: keys borrow from the script string, alive all run.
            key: unsafe { key.as_slice() }.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use {super::*, test_case::test_case};

    #[test_case("z,y,x", &[("x", 3), ("y", 2), ("z", 1)]; "reverse input")]
    #[test_case("app,apple,applejuice", &[("app", 1), ("apple", 2), ("applejuice", 3)]; "shared prefixes in order")]
    #[test_case("applejuice,app,apple", &[("app", 2), ("apple", 3), ("applejuice", 1)]; "shared prefixes shuffled")]
    #[test_case("foo,foo,bar", &[("bar", 3), ("foo", 1), ("foo", 2)]; "equal keys pop fifo")]
    #[test_case("d-c-b-a", &[("d", 1), ("c", 2), ("b", 3), ("a", 4)]; "push pop interleaved")]
    #[test_case("u,x-y,w--a,b", &[("u", 1), ("w", 4), ("x", 2), ("a", 5), ("b", 6), ("y", 3)]; "mixed script")]
    fn seed_scenarios(script: &str, expected: &[(&str, u32)]) {
        let run = run_script(script);
        let got: Vec<(String, u32)> = run
            .pops()
            .iter()
            .map(|p| (String::from_utf8(p.key.clone()).unwrap(), p.value))
            .collect();
        let expected: Vec<(String, u32)> = expected
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn pop_on_empty_heap_reports_nothing() {
        let run = run_script("-x");
        assert_eq!(run.pops().len(), 1);
        assert_eq!(run.pops()[0].key, b"x");
    }
}
