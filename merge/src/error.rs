use std::{io, path::PathBuf};

/// Error taxonomy of the merge pipeline.
///
/// The `Failed to <desc>: <cause>` rendering is the user-facing diagnostic;
/// drivers map the variants onto sysexits-style process exit codes.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// An input file could not be opened.
    #[error("Failed to open {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    /// A read or write failed mid-merge.
    #[error("Failed to {desc}: {source}")]
    Io {
        desc: &'static str,
        source: io::Error,
    },

    /// Allocation, ring setup or kernel registration failed.
    #[error("Failed to {desc}: {source}")]
    Resource {
        desc: &'static str,
        source: io::Error,
    },

    /// An internal invariant was violated (heap overflow, unknown completion
    /// tag, loan discipline breach). Always a bug, never an input problem.
    #[error("Internal error: {0}")]
    Invariant(&'static str),
}

impl MergeError {
    pub fn io(desc: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Io { desc, source }
    }

    pub fn resource(desc: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Resource { desc, source }
    }
}
