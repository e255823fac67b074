use {
    clap::{CommandFactory, Parser},
    std::{io, path::PathBuf, process::exit},
    tailmerge_merge::{
        driver::{heap_extra, MergeDriver, MergeStats},
        reader::{BlockingReader, ReaderOptions},
        MergeError,
    },
};

// sysexits(3) codes for the merge error taxonomy.
const EX_USAGE: i32 = 64;
const EX_NOINPUT: i32 = 66;
const EX_UNAVAILABLE: i32 = 69;
const EX_SOFTWARE: i32 = 70;
const EX_IOERR: i32 = 74;

#[derive(Parser)]
#[command(
    name = "tailmerge",
    about = "Merge sorted line-oriented files into one stream, tagging each run with its source",
    version
)]
struct Args {
    /// Input files with line-sorted contents.
    files: Vec<PathBuf>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if args.files.is_empty() {
        let _ = Args::command().print_help();
        exit(EX_USAGE);
    }
    match run(&args.files) {
        Ok(stats) => {
            log::info!(
                "done: {} lines, {} bytes in, {} bytes out",
                stats.lines,
                stats.bytes_read,
                stats.bytes_written
            );
        }
        Err(err) => {
            eprintln!("{err}");
            exit(exit_code(&err));
        }
    }
}

fn exit_code(err: &MergeError) -> i32 {
    match err {
        MergeError::Open { .. } => EX_NOINPUT,
        MergeError::Io { .. } => EX_IOERR,
        MergeError::Resource { .. } => EX_UNAVAILABLE,
        MergeError::Invariant(_) => EX_SOFTWARE,
    }
}

fn run(files: &[PathBuf]) -> Result<MergeStats, MergeError> {
    let names: Vec<Vec<u8>> = files
        .iter()
        .map(|path| path.as_os_str().as_encoded_bytes().to_vec())
        .collect();
    let (extra_len, extra_align) = heap_extra(files.len());
    let options = ReaderOptions {
        extra_len,
        extra_align,
        ..ReaderOptions::default()
    };

    #[cfg(target_os = "linux")]
    {
        use tailmerge_merge::io_uring::{ring_unsupported, RingReaderBuilder};
        match RingReaderBuilder::new()
            .options(options.clone())
            .output_fd(libc::STDOUT_FILENO)
            .open(files)
        {
            Ok(reader) => {
                return MergeDriver::new(reader, &names, io::stdout().lock())?.run();
            }
            Err(MergeError::Resource { source, .. }) if ring_unsupported(&source) => {
                eprintln!("tailmerge: io_uring unavailable ({source}), using blocking reads");
            }
            Err(err) => return Err(err),
        }
    }

    let reader = BlockingReader::open(files, &options)?;
    MergeDriver::new(reader, &names, io::stdout().lock())?.run()
}
