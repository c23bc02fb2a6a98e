//! Pipeline stage representation.
//!
//! A stage is either a child program (exec stage) or an in-process
//! [`Filter`]. Both carry the parent-allocated descriptors that will become
//! the stage's standard input and output; exec stages additionally carry
//! their launch spec, child pid, and reaped wait status.

use std::os::fd::OwnedFd;

use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::ring::RingBuffer;
use crate::transform::Filter;

/// How an exec stage invokes its program.
#[derive(Debug)]
pub(crate) struct ExecSpec {
    /// Program path handed to the exec call. May differ from `argv[0]`
    /// when the stage was added through the explicit-env variant.
    pub prog: String,
    /// Full argument vector; `argv[0]` is the program name the child sees.
    pub argv: Vec<String>,
    /// Explicit environment (`KEY=value` entries), or `None` to inherit.
    pub env: Option<Vec<String>>,
    /// Use the PATH-searching exec variant. Ignored when `env` is set.
    pub search_path: bool,
}

/// A child-program stage.
pub(crate) struct ExecStage {
    pub spec: ExecSpec,
    /// Pid of the running child, set at fork time.
    pub pid: Option<Pid>,
    /// Descriptor to install over the child's standard input.
    pub stdin_fd: Option<OwnedFd>,
    /// Descriptor to install over the child's standard output.
    pub stdout_fd: Option<OwnedFd>,
    /// Wait status recorded by the reaper.
    pub status: Option<WaitStatus>,
}

impl ExecStage {
    pub fn new(spec: ExecSpec) -> Self {
        Self {
            spec,
            pid: None,
            stdin_fd: None,
            stdout_fd: None,
            status: None,
        }
    }
}

/// An in-process transformer stage.
pub(crate) struct FilterStage<'a> {
    pub func: &'a mut dyn Filter,
    /// Sole source of bytes the event loop writes to `stdout_fd`.
    pub outbuf: RingBuffer,
    /// Parent-side read end from the preceding stage (non-blocking).
    pub stdin_fd: Option<OwnedFd>,
    /// Parent-side write end to the following stage (non-blocking).
    pub stdout_fd: Option<OwnedFd>,
}

impl<'a> FilterStage<'a> {
    pub fn new(func: &'a mut dyn Filter) -> Self {
        Self {
            func,
            outbuf: RingBuffer::new(),
            stdin_fd: None,
            stdout_fd: None,
        }
    }
}

/// One node of the pipeline, in insertion order.
pub(crate) enum Stage<'a> {
    Exec(ExecStage),
    Filter(FilterStage<'a>),
}

impl Stage<'_> {
    pub fn is_filter(&self) -> bool {
        matches!(self, Stage::Filter(_))
    }

    /// Assign the descriptor to install over this stage's standard input.
    pub fn set_stdin(&mut self, fd: OwnedFd) {
        match self {
            Stage::Exec(s) => s.stdin_fd = Some(fd),
            Stage::Filter(s) => s.stdin_fd = Some(fd),
        }
    }

    /// Assign the descriptor to install over this stage's standard output.
    pub fn set_stdout(&mut self, fd: OwnedFd) {
        match self {
            Stage::Exec(s) => s.stdout_fd = Some(fd),
            Stage::Filter(s) => s.stdout_fd = Some(fd),
        }
    }

    pub fn stdin_fd(&self) -> Option<&OwnedFd> {
        match self {
            Stage::Exec(s) => s.stdin_fd.as_ref(),
            Stage::Filter(s) => s.stdin_fd.as_ref(),
        }
    }

    pub fn stdout_fd(&self) -> Option<&OwnedFd> {
        match self {
            Stage::Exec(s) => s.stdout_fd.as_ref(),
            Stage::Filter(s) => s.stdout_fd.as_ref(),
        }
    }

    /// Drop both assigned descriptors, closing them.
    pub fn close_fds(&mut self) {
        match self {
            Stage::Exec(s) => {
                s.stdin_fd = None;
                s.stdout_fd = None;
            }
            Stage::Filter(s) => {
                s.stdin_fd = None;
                s.stdout_fd = None;
            }
        }
    }
}
