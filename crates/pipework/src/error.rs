//! Error type for pipeline configuration and setup failures.

use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

/// Failures surfaced synchronously by [`Pipeline::run`](crate::Pipeline::run).
///
/// All of these occur before or while launching children; a child that fails
/// to exec is not an error here — it is observable as exit code 255 on its
/// stage. Transient I/O conditions inside the event loop are retried and
/// never surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// `run` was called on a pipeline with no stages.
    #[error("pipeline has no stages")]
    NoStages,

    /// A stage was registered with an empty argument vector.
    #[error("stage {0} has an empty argument vector")]
    EmptyArgv(usize),

    /// A program path, argument, or environment entry contains a NUL byte.
    #[error("stage {stage} has an argument with an interior NUL byte")]
    NulArgument {
        stage: usize,
        #[source]
        source: std::ffi::NulError,
    },

    /// An anonymous pipe could not be allocated.
    #[error("could not create a pipe: {0}")]
    CreatePipe(#[source] Errno),

    /// Non-blocking mode could not be installed on a pipe end.
    #[error("could not set non-blocking mode on a pipe: {0}")]
    SetNonBlocking(#[source] Errno),

    /// The input file endpoint could not be opened.
    #[error("could not open input file {}: {source}", path.display())]
    OpenInput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The output file endpoint could not be created.
    #[error("could not open output file {}: {source}", path.display())]
    OpenOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A child process could not be forked.
    #[error("could not fork child process: {0}")]
    Fork(#[source] Errno),

    /// The readiness poll over the pipeline descriptors failed.
    #[error("error polling pipeline descriptors: {0}")]
    Poll(#[source] Errno),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
