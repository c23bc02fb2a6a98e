//! pipework: child-program pipelines with in-process byte transformers.
//!
//! Build a linear chain of child programs connected by anonymous pipes, the
//! way a shell pipes commands together, and run it to completion from one
//! call. The input of the first program and the output of the last can each
//! be redirected to a descriptor, a file, an in-memory byte buffer, or a
//! caller object, and in-process transformers can be spliced between any
//! two programs (or placed at either end) to generate, inspect, or rewrite
//! the bytes flowing through.
//!
//! This crate provides:
//!
//! - **[`Pipeline`]**: the builder and runner — endpoints, stages, and
//!   per-stage exit status inspection after the run
//! - **[`Source`] / [`Filter`] / [`Sink`]**: capability traits for
//!   in-process participants, driven from the single-threaded event loop
//! - **[`RingBuffer`]**: the auto-growing circular byte buffer backing
//!   every in-process producer
//!
//! # Example
//!
//! ```no_run
//! use pipework::Pipeline;
//!
//! let input = b"3\n1\n2\n".to_vec();
//! let mut output = Vec::new();
//!
//! let mut ep = Pipeline::new();
//! ep.set_input_bytes(&input);
//! ep.set_output_bytes(&mut output);
//! ep.add_execp("sort", &[]);
//! ep.run()?;
//! assert!(ep.all_return_codes_zero());
//! # Ok::<(), pipework::PipelineError>(())
//! ```
//!
//! Unix only: the implementation is built on `fork`, `pipe`, `dup2`, the
//! `exec` family, and `poll(2)`. Child processes run in parallel under the
//! OS while the parent pumps bytes from one thread; transformer callbacks
//! are serialized on that thread and need not be `Send`.

mod error;
mod event_loop;
mod pipeline;
mod ring;
mod stage;
mod transform;

pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, DEFAULT_OUTPUT_MODE};
pub use ring::RingBuffer;
pub use transform::{Filter, PipeWriter, Sink, Source};

// Raw wait status, re-exported so callers can match on it without
// depending on nix directly.
pub use nix::sys::wait::WaitStatus;
