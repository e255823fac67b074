//! Development harness for the byte-slice min-heap.
//!
//! Each argument is a script: bytes followed by `,` push them with the next
//! insertion number, `-` pops one entry, and the heap is drained when the
//! script ends. One output line per script, `value:key` per pop.

use {std::process::exit, tailmerge_merge::probe};

fn main() {
    let scripts: Vec<String> = std::env::args().skip(1).collect();
    if scripts.is_empty() {
        eprintln!("usage: heap-probe <script>...");
        exit(64);
    }
    for script in scripts {
        let run = probe::run_script(&script);
        let rendered: Vec<String> = run
            .pops()
            .iter()
            .map(|pop| format!("{}:{}", pop.value, String::from_utf8_lossy(&pop.key)))
            .collect();
        println!("{}", rendered.join(" "));
    }
}
