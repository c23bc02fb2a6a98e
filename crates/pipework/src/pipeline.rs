//! Pipeline construction and execution.
//!
//! A [`Pipeline`] is built in three steps, in any order: configure the input
//! endpoint, append stages, configure the output endpoint. [`Pipeline::run`]
//! then drives four phases:
//!
//! 1. **Wiring** — allocate kernel pipes between adjacent stages, open file
//!    endpoints, and assign each stage the descriptors that will become its
//!    standard streams.
//! 2. **Launch** — fork each exec stage; the child installs its assigned
//!    descriptors over stdin/stdout, closes every unrelated descriptor, and
//!    execs its program.
//! 3. **Event loop** — multiplex non-blocking I/O across all parent-side
//!    descriptors until every stream has drained (see `event_loop`).
//! 4. **Reap** — wait for every child and record its status.
//!
//! ```text
//!    input                     stages                        output
//!   inherit  |                                           |  inherit
//!     fd     |            exec (child program)           |    fd
//!    file    |-> stage ->        or          -> stage -> |   file
//!    bytes   |           filter (in-process)             |   bytes
//!   Source   |                                           |   Sink
//! ```

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::wait::{wait, WaitStatus};
use nix::unistd::{dup2, fork, pipe, ForkResult};

use crate::error::{PipelineError, Result};
use crate::ring::RingBuffer;
use crate::stage::{ExecSpec, ExecStage, FilterStage, Stage};
use crate::transform::{Filter, Sink, Source};

/// Default permission mode for output-file endpoints, moderated by umask.
pub const DEFAULT_OUTPUT_MODE: u32 = 0o666;

/// Configured input endpoint.
pub(crate) enum Input<'a> {
    /// First stage inherits the parent's standard input; nothing is pumped.
    Inherit,
    /// Caller-provided descriptor, handed to the first stage at wiring time.
    Fd(Option<OwnedFd>),
    /// Path opened read-only at wiring time.
    File(PathBuf),
    /// Byte slice written to the first stage; `pos` is the send cursor.
    Bytes { data: &'a [u8], pos: usize },
    /// Polled producer feeding the input ring buffer.
    Source(&'a mut dyn Source),
}

/// Configured output endpoint.
pub(crate) enum Output<'a> {
    /// Last stage inherits the parent's standard output.
    Inherit,
    /// Caller-provided descriptor, handed to the last stage at wiring time.
    Fd(Option<OwnedFd>),
    /// Path created or truncated at wiring time with the given mode.
    File { path: PathBuf, mode: u32 },
    /// Buffer accumulating everything the last stage writes.
    Bytes(&'a mut Vec<u8>),
    /// Consumer receiving everything the last stage writes.
    Sink(&'a mut dyn Sink),
}

/// A linear sequence of child programs and in-process filters connected by
/// anonymous pipes.
///
/// Caller-supplied endpoints and filters are borrowed for the lifetime of
/// the pipeline; kernel pipes and opened files are owned by it. `run` is a
/// one-shot operation: endpoint descriptors are consumed by the first call,
/// and re-running is not part of the contract.
pub struct Pipeline<'a> {
    pub(crate) input: Input<'a>,
    pub(crate) output: Output<'a>,
    pub(crate) stages: Vec<Stage<'a>>,

    /// Parent-side write end feeding the first stage (bytes/source input).
    pub(crate) input_fd: Option<OwnedFd>,
    /// Parent-side read end draining the last stage (bytes/sink output).
    pub(crate) output_fd: Option<OwnedFd>,
    /// Ring buffer filled by the input source.
    pub(crate) input_buf: RingBuffer,
}

impl Default for Pipeline<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Pipeline<'a> {
    /// Create an empty pipeline with inherited input and output.
    pub fn new() -> Self {
        Self {
            input: Input::Inherit,
            output: Output::Inherit,
            stages: Vec::new(),
            input_fd: None,
            output_fd: None,
            input_buf: RingBuffer::new(),
        }
    }

    /// Number of stages added so far.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True if no stages have been added.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    // ===== input endpoint =====

    /// Feed the first stage from an already opened descriptor.
    ///
    /// The descriptor is owned by the pipeline from here on and is closed
    /// in the parent once the children have been launched. Like all input
    /// selectors, the first configured endpoint wins; later calls are
    /// ignored.
    pub fn set_input_fd(&mut self, fd: OwnedFd) {
        if !matches!(self.input, Input::Inherit) {
            tracing::warn!("pipeline input endpoint is already configured");
            return;
        }
        self.input = Input::Fd(Some(fd));
    }

    /// Feed the first stage from a file, opened read-only at run time.
    pub fn set_input_file(&mut self, path: impl Into<PathBuf>) {
        if !matches!(self.input, Input::Inherit) {
            tracing::warn!("pipeline input endpoint is already configured");
            return;
        }
        self.input = Input::File(path.into());
    }

    /// Feed the first stage the contents of a byte slice.
    pub fn set_input_bytes(&mut self, data: &'a [u8]) {
        if !matches!(self.input, Input::Inherit) {
            tracing::warn!("pipeline input endpoint is already configured");
            return;
        }
        self.input = Input::Bytes { data, pos: 0 };
    }

    /// Feed the first stage from a polled [`Source`].
    pub fn set_input_source(&mut self, source: &'a mut dyn Source) {
        if !matches!(self.input, Input::Inherit) {
            tracing::warn!("pipeline input endpoint is already configured");
            return;
        }
        self.input = Input::Source(source);
    }

    // ===== output endpoint =====

    /// Send the last stage's output to an already opened descriptor.
    ///
    /// Ownership transfers to the pipeline; the descriptor is closed in the
    /// parent once the children have been launched.
    pub fn set_output_fd(&mut self, fd: OwnedFd) {
        if !matches!(self.output, Output::Inherit) {
            tracing::warn!("pipeline output endpoint is already configured");
            return;
        }
        self.output = Output::Fd(Some(fd));
    }

    /// Send the last stage's output to a file, created or truncated at run
    /// time with mode [`DEFAULT_OUTPUT_MODE`].
    pub fn set_output_file(&mut self, path: impl Into<PathBuf>) {
        self.set_output_file_mode(path, DEFAULT_OUTPUT_MODE);
    }

    /// Like [`set_output_file`](Self::set_output_file) with an explicit
    /// permission mode for the open call.
    pub fn set_output_file_mode(&mut self, path: impl Into<PathBuf>, mode: u32) {
        if !matches!(self.output, Output::Inherit) {
            tracing::warn!("pipeline output endpoint is already configured");
            return;
        }
        self.output = Output::File {
            path: path.into(),
            mode,
        };
    }

    /// Accumulate the last stage's output into a byte buffer.
    pub fn set_output_bytes(&mut self, out: &'a mut Vec<u8>) {
        if !matches!(self.output, Output::Inherit) {
            tracing::warn!("pipeline output endpoint is already configured");
            return;
        }
        self.output = Output::Bytes(out);
    }

    /// Deliver the last stage's output to a [`Sink`].
    pub fn set_output_sink(&mut self, sink: &'a mut dyn Sink) {
        if !matches!(self.output, Output::Inherit) {
            tracing::warn!("pipeline output endpoint is already configured");
            return;
        }
        self.output = Output::Sink(sink);
    }

    // ===== stages =====

    /// Append a child program. The child's `argv[0]` is `prog`, followed by
    /// `args`; `prog` must be a path (no PATH search).
    pub fn add_exec(&mut self, prog: &str, args: &[&str]) {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(prog.to_string());
        argv.extend(args.iter().map(|a| a.to_string()));
        self.push_exec(prog.to_string(), argv, None, false);
    }

    /// Append a child program with the full argument vector given; the
    /// program path is `argv[0]`.
    pub fn add_exec_argv(&mut self, argv: Vec<String>) {
        let prog = argv.first().cloned().unwrap_or_default();
        self.push_exec(prog, argv, None, false);
    }

    /// Like [`add_exec`](Self::add_exec), but the program is looked up in
    /// `PATH` when it contains no slash.
    pub fn add_execp(&mut self, prog: &str, args: &[&str]) {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(prog.to_string());
        argv.extend(args.iter().map(|a| a.to_string()));
        self.push_exec(prog.to_string(), argv, None, true);
    }

    /// Like [`add_exec_argv`](Self::add_exec_argv) with PATH search.
    pub fn add_execp_argv(&mut self, argv: Vec<String>) {
        let prog = argv.first().cloned().unwrap_or_default();
        self.push_exec(prog, argv, None, true);
    }

    /// Append a child program with an explicit argument vector and
    /// environment. `argv` is taken literally — `argv[0]` is not overridden
    /// by `path`, which allows calls under a faked program name. An `env` of
    /// `None` inherits the parent environment; entries are `KEY=value`
    /// strings.
    pub fn add_exece(&mut self, path: &str, argv: Vec<String>, env: Option<Vec<String>>) {
        self.push_exec(path.to_string(), argv, env, false);
    }

    fn push_exec(&mut self, prog: String, argv: Vec<String>, env: Option<Vec<String>>, search_path: bool) {
        self.stages.push(Stage::Exec(ExecStage::new(ExecSpec {
            prog,
            argv,
            env,
            search_path,
        })));
    }

    /// Append an in-process [`Filter`] stage. The filter runs on the event
    /// loop's call stack while the pipeline executes.
    pub fn add_filter(&mut self, func: &'a mut dyn Filter) {
        self.stages.push(Stage::Filter(FilterStage::new(func)));
    }

    // ===== execution =====

    /// Run the pipeline to completion: wire descriptors, launch every child,
    /// pump data until all streams drain, and reap the children.
    ///
    /// Errors cover configuration and system-call setup only; whether each
    /// child *program* succeeded is inspected afterwards through
    /// [`return_code`](Self::return_code) /
    /// [`all_return_codes_zero`](Self::all_return_codes_zero).
    pub fn run(&mut self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(PipelineError::NoStages);
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if let Stage::Exec(ex) = stage {
                if ex.spec.argv.is_empty() {
                    return Err(PipelineError::EmptyArgv(i));
                }
            }
        }

        self.wire_descriptors()?;
        self.launch_children()?;
        self.event_loop()?;
        self.reap_children();

        tracing::debug!("finished running pipeline");
        Ok(())
    }

    /// Phase 1: allocate pipes and open files, assigning each stage the
    /// descriptor pair that will become its standard streams.
    fn wire_descriptors(&mut self) -> Result<()> {
        match &mut self.input {
            Input::Inherit => {}
            Input::Bytes { .. } | Input::Source(_) => {
                let (read, write) = pipe().map_err(PipelineError::CreatePipe)?;
                set_nonblocking(&write)?;
                if self.stages[0].is_filter() {
                    set_nonblocking(&read)?;
                }
                self.input_fd = Some(write);
                self.stages[0].set_stdin(read);
            }
            Input::File(path) => {
                let file = File::open(&path).map_err(|source| PipelineError::OpenInput {
                    path: path.clone(),
                    source,
                })?;
                self.stages[0].set_stdin(file.into());
            }
            Input::Fd(fd) => {
                if let Some(fd) = fd.take() {
                    self.stages[0].set_stdin(fd);
                }
            }
        }

        for i in 0..self.stages.len() - 1 {
            let (read, write) = pipe().map_err(PipelineError::CreatePipe)?;
            if self.stages[i].is_filter() {
                set_nonblocking(&write)?;
            }
            if self.stages[i + 1].is_filter() {
                set_nonblocking(&read)?;
            }
            self.stages[i].set_stdout(write);
            self.stages[i + 1].set_stdin(read);
        }

        match &mut self.output {
            Output::Inherit => {}
            Output::Bytes(_) | Output::Sink(_) => {
                let (read, write) = pipe().map_err(PipelineError::CreatePipe)?;
                set_nonblocking(&read)?;
                let last = self.stages.len() - 1;
                if self.stages[last].is_filter() {
                    set_nonblocking(&write)?;
                }
                self.output_fd = Some(read);
                self.stages[last].set_stdout(write);
            }
            Output::File { path, mode } => {
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(*mode)
                    .open(&path)
                    .map_err(|source| PipelineError::OpenOutput {
                        path: path.clone(),
                        source,
                    })?;
                let last = self.stages.len() - 1;
                self.stages[last].set_stdout(file.into());
            }
            Output::Fd(fd) => {
                if let Some(fd) = fd.take() {
                    let last = self.stages.len() - 1;
                    self.stages[last].set_stdout(fd);
                }
            }
        }

        Ok(())
    }

    /// Phase 2: fork every exec stage, then drop the exec-stage descriptors
    /// in the parent. Filter-stage descriptors stay open — they are the
    /// event loop's working set.
    fn launch_children(&mut self) -> Result<()> {
        for i in 0..self.stages.len() {
            let spec = match &self.stages[i] {
                Stage::Exec(ex) => &ex.spec,
                Stage::Filter(_) => continue,
            };

            let prog = CString::new(spec.prog.clone())
                .map_err(|source| PipelineError::NulArgument { stage: i, source })?;
            let argv = spec
                .argv
                .iter()
                .map(|a| CString::new(a.clone()))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|source| PipelineError::NulArgument { stage: i, source })?;
            let envp = match &spec.env {
                Some(env) => Some(
                    env.iter()
                        .map(|e| CString::new(e.clone()))
                        .collect::<std::result::Result<Vec<_>, _>>()
                        .map_err(|source| PipelineError::NulArgument { stage: i, source })?,
                ),
                None => None,
            };
            let search_path = spec.search_path;
            tracing::debug!("exec stage {}: {}", i, spec.argv.join(" "));

            match unsafe { fork() }.map_err(PipelineError::Fork)? {
                ForkResult::Child => {
                    self.child_exec(i, &prog, &argv, envp.as_deref(), search_path);
                }
                ForkResult::Parent { child } => {
                    if let Stage::Exec(ex) = &mut self.stages[i] {
                        ex.pid = Some(child);
                    }
                }
            }
        }

        for stage in &mut self.stages {
            if let Stage::Exec(_) = stage {
                stage.close_fds();
            }
        }
        Ok(())
    }

    /// Child side of the fork: install the stage's descriptors over the
    /// standard streams, close everything unrelated, and exec. Never
    /// returns; exec failure exits with status 255.
    fn child_exec(
        &mut self,
        stage_index: usize,
        prog: &std::ffi::CStr,
        argv: &[CString],
        envp: Option<&[CString]>,
        search_path: bool,
    ) -> ! {
        use nix::libc::{STDIN_FILENO, STDOUT_FILENO};

        self.input_fd = None;

        for j in 0..self.stages.len() {
            if j == stage_index {
                if let Some(fd) = self.stages[j].stdin_fd() {
                    if dup2(fd.as_raw_fd(), STDIN_FILENO).is_err() {
                        eprintln!("pipework: could not redirect child stdin");
                        process::exit(255);
                    }
                }
                if let Some(fd) = self.stages[j].stdout_fd() {
                    if dup2(fd.as_raw_fd(), STDOUT_FILENO).is_err() {
                        eprintln!("pipework: could not redirect child stdout");
                        process::exit(255);
                    }
                }
            } else {
                self.stages[j].close_fds();
            }
        }
        self.output_fd = None;

        let result = match envp {
            Some(env) => nix::unistd::execve(prog, argv, env),
            None if search_path => nix::unistd::execvp(prog, argv),
            None => nix::unistd::execv(prog, argv),
        };
        // exec only returns on failure
        if let Err(e) = result {
            eprintln!("pipework: could not exec child program: {}", e);
        }
        process::exit(255);
    }

    /// Phase 4: wait until every exec stage has been reaped, recording each
    /// child's status on its stage. Wait failures and unknown pids are
    /// logged; a wait failure stops the reaper.
    fn reap_children(&mut self) {
        let total = self
            .stages
            .iter()
            .filter(|s| matches!(s, Stage::Exec(_)))
            .count();
        let mut reaped = 0;

        while reaped < total {
            let status = match wait() {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!("error waiting for child processes: {}", e);
                    break;
                }
            };
            let Some(pid) = status.pid() else {
                continue;
            };

            let mut matched = false;
            for (i, stage) in self.stages.iter_mut().enumerate() {
                let Stage::Exec(ex) = stage else { continue };
                if ex.pid == Some(pid) {
                    match status {
                        WaitStatus::Exited(_, code) => {
                            tracing::debug!("exec stage {} (pid {}) exited with code {}", i, pid, code);
                        }
                        WaitStatus::Signaled(_, signal, _) => {
                            tracing::debug!(
                                "exec stage {} (pid {}) terminated by signal {}",
                                i,
                                pid,
                                signal
                            );
                        }
                        other => {
                            tracing::error!("unexpected wait status for pid {}: {:?}", pid, other);
                        }
                    }
                    ex.status = Some(status);
                    reaped += 1;
                    matched = true;
                    break;
                }
            }
            if !matched {
                tracing::error!("wait() returned unknown child pid {}", pid);
            }
        }
    }

    // ===== inspection after execution =====

    /// Raw wait status of exec stage `stage`, or `None` for a filter stage
    /// or a child that was never reaped.
    pub fn return_status(&self, stage: usize) -> Option<WaitStatus> {
        match &self.stages[stage] {
            Stage::Exec(ex) => ex.status,
            Stage::Filter(_) => None,
        }
    }

    /// Exit code of exec stage `stage` for a normally terminated child, or
    /// -1 if it was terminated by a signal (or never reaped).
    pub fn return_code(&self, stage: usize) -> i32 {
        match self.return_status(stage) {
            Some(WaitStatus::Exited(_, code)) => code,
            _ => -1,
        }
    }

    /// Terminating signal number of exec stage `stage`, or -1 if the child
    /// exited normally.
    pub fn return_signal(&self, stage: usize) -> i32 {
        match self.return_status(stage) {
            Some(WaitStatus::Signaled(_, signal, _)) => signal as i32,
            _ => -1,
        }
    }

    /// True iff every exec stage exited normally with code 0. Filter stages
    /// are skipped.
    pub fn all_return_codes_zero(&self) -> bool {
        self.stages.iter().enumerate().all(|(i, stage)| match stage {
            Stage::Filter(_) => true,
            Stage::Exec(_) => self.return_code(i) == 0,
        })
    }
}

/// Install `O_NONBLOCK` on a descriptor, preserving its other status flags.
fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(PipelineError::SetNonBlocking)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(PipelineError::SetNonBlocking)?;
    Ok(())
}
