//! The readiness loop that pumps bytes across a running pipeline.
//!
//! Single-threaded and non-blocking: each iteration builds the set of
//! parent-side descriptors still in play, blocks in one `poll(2)` call, and
//! dispatches tight drain loops on whatever became ready. Transformer
//! callbacks ([`Source::poll`], [`Filter::process`]/[`eof`],
//! [`Sink::process`]/[`eof`]) all execute on this call stack.
//!
//! Close decisions drive termination:
//! - the input descriptor closes when the byte slice is exhausted or the
//!   source has finished and its buffer drained, which the first child sees
//!   as end-of-file;
//! - a filter's input closes on upstream eof (after `eof()` fires), and its
//!   output closes once the outbound buffer is empty *and* the input is
//!   already closed, propagating eof downstream;
//! - the output descriptor closes on eof from the last child.
//!
//! The loop exits when no descriptor is left to enroll. `EAGAIN` and
//! `EINTR` are benign everywhere; other I/O errors are logged and only
//! close the producing side.
//!
//! [`Source::poll`]: crate::Source::poll
//! [`Filter::process`]: crate::Filter::process
//! [`eof`]: crate::Filter::eof
//! [`Sink::process`]: crate::Sink::process
//! [`Sink::eof`]: crate::Sink::eof

use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{read, write};

use crate::error::{PipelineError, Result};
use crate::pipeline::{Input, Output, Pipeline};
use crate::stage::Stage;
use crate::transform::PipeWriter;

/// Scratch buffer size for the tight read loops.
const SCRATCH_SIZE: usize = 4096;

/// Identifies one enrolled descriptor across a poll round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    /// Pipeline input descriptor, enrolled writable.
    Input,
    /// Pipeline output descriptor, enrolled readable.
    Output,
    /// Filter stage input descriptor, enrolled readable.
    FilterIn(usize),
    /// Filter stage output descriptor, enrolled writable.
    FilterOut(usize),
}

fn interest(token: Token) -> PollFlags {
    match token {
        Token::Input | Token::FilterOut(_) => PollFlags::POLLOUT,
        Token::Output | Token::FilterIn(_) => PollFlags::POLLIN,
    }
}

impl Pipeline<'_> {
    /// Phase 3: pump data between the parent-side descriptors until every
    /// stream has drained and closed.
    pub(crate) fn event_loop(&mut self) -> Result<()> {
        loop {
            let enrolled = self.build_interest_set();
            if enrolled.is_empty() {
                break;
            }

            for token in self.poll_ready(&enrolled)? {
                match token {
                    Token::Input => self.drain_input(),
                    Token::Output => self.drain_output(),
                    Token::FilterIn(i) => self.read_filter_input(i),
                    Token::FilterOut(i) => self.write_filter_output(i),
                }
            }
        }
        Ok(())
    }

    /// Decide which descriptors participate in this iteration. This is also
    /// where the input source is polled for more data and where a drained
    /// filter's output descriptor is closed so downstream sees eof.
    fn build_interest_set(&mut self) -> Vec<Token> {
        let mut set = Vec::new();

        if self.input_fd.is_some() {
            let enroll = match &mut self.input {
                Input::Source(source) => {
                    if self.input_buf.is_empty() {
                        let more = source.poll(&mut PipeWriter::new(&mut self.input_buf));
                        if !more && self.input_buf.is_empty() {
                            tracing::debug!("input source finished, closing input descriptor");
                            self.input_fd = None;
                            false
                        } else {
                            true
                        }
                    } else {
                        true
                    }
                }
                _ => true,
            };
            if enroll {
                tracing::trace!("enroll input descriptor writable");
                set.push(Token::Input);
            }
        }

        for i in 0..self.stages.len() {
            let Stage::Filter(f) = &mut self.stages[i] else {
                continue;
            };
            if f.stdin_fd.is_some() {
                tracing::trace!("enroll stage {} input descriptor readable", i);
                set.push(Token::FilterIn(i));
            }
            if f.stdout_fd.is_some() {
                if !f.outbuf.is_empty() {
                    tracing::trace!("enroll stage {} output descriptor writable", i);
                    set.push(Token::FilterOut(i));
                } else if f.stdin_fd.is_none() {
                    // Upstream closed and nothing buffered: propagate eof.
                    tracing::debug!("filter stage {} drained, closing stage output descriptor", i);
                    f.stdout_fd = None;
                }
            }
        }

        if self.output_fd.is_some() {
            tracing::trace!("enroll output descriptor readable");
            set.push(Token::Output);
        }

        set
    }

    /// Block in `poll(2)` over the enrolled descriptors and return the ones
    /// that are ready. An interrupted poll simply yields an empty round.
    fn poll_ready(&self, enrolled: &[Token]) -> Result<Vec<Token>> {
        let mut tokens = Vec::with_capacity(enrolled.len());
        let mut fds = Vec::with_capacity(enrolled.len());
        for &token in enrolled {
            if let Some(fd) = self.token_fd(token) {
                tokens.push(token);
                fds.push(PollFd::new(fd, interest(token)));
            }
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(n) => tracing::trace!("poll() reported {} ready descriptors", n),
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::Poll(e)),
        }

        let ready = tokens
            .iter()
            .zip(&fds)
            .filter(|(token, pollfd)| {
                let wanted = interest(**token) | PollFlags::POLLERR | PollFlags::POLLHUP;
                pollfd.revents().is_some_and(|r| r.intersects(wanted))
            })
            .map(|(token, _)| *token)
            .collect();
        Ok(ready)
    }

    fn token_fd(&self, token: Token) -> Option<BorrowedFd<'_>> {
        match token {
            Token::Input => self.input_fd.as_ref().map(AsFd::as_fd),
            Token::Output => self.output_fd.as_ref().map(AsFd::as_fd),
            Token::FilterIn(i) => match &self.stages[i] {
                Stage::Filter(f) => f.stdin_fd.as_ref().map(AsFd::as_fd),
                Stage::Exec(_) => None,
            },
            Token::FilterOut(i) => match &self.stages[i] {
                Stage::Filter(f) => f.stdout_fd.as_ref().map(AsFd::as_fd),
                Stage::Exec(_) => None,
            },
        }
    }

    /// Input descriptor became writable: push pending bytes to the first
    /// stage until the pipe would block or the producer is exhausted.
    fn drain_input(&mut self) {
        match &mut self.input {
            Input::Bytes { data, pos } => loop {
                if *pos >= data.len() {
                    tracing::debug!("input bytes exhausted, closing input descriptor");
                    self.input_fd = None;
                    break;
                }
                let Some(fd) = &self.input_fd else { break };
                match write(fd, &data[*pos..]) {
                    Ok(n) => {
                        tracing::trace!("write on input descriptor: {}", n);
                        *pos += n;
                    }
                    Err(Errno::EAGAIN | Errno::EINTR) => break,
                    Err(e) => {
                        tracing::info!("error writing to input descriptor: {}", e);
                        self.input_fd = None;
                        break;
                    }
                }
            },
            Input::Source(_) => loop {
                if self.input_buf.is_empty() {
                    break;
                }
                let Some(fd) = &self.input_fd else { break };
                match write(fd, self.input_buf.bottom()) {
                    Ok(n) => {
                        tracing::trace!("write on input descriptor: {}", n);
                        self.input_buf.advance(n);
                    }
                    Err(Errno::EAGAIN | Errno::EINTR) => break,
                    Err(e) => {
                        tracing::info!("error writing to input descriptor: {}", e);
                        self.input_fd = None;
                        break;
                    }
                }
            },
            _ => {}
        }
    }

    /// Output descriptor became readable: pull everything available from
    /// the last stage into the configured consumer.
    fn drain_output(&mut self) {
        let mut scratch = [0u8; SCRATCH_SIZE];
        loop {
            let Some(fd) = &self.output_fd else { break };
            match read(fd.as_raw_fd(), &mut scratch) {
                Ok(0) => {
                    tracing::debug!("end of output stream, closing output descriptor");
                    if let Output::Sink(sink) = &mut self.output {
                        sink.eof();
                    }
                    self.output_fd = None;
                }
                Ok(n) => {
                    tracing::trace!("read on output descriptor: {}", n);
                    match &mut self.output {
                        Output::Bytes(out) => out.extend_from_slice(&scratch[..n]),
                        Output::Sink(sink) => sink.process(&scratch[..n]),
                        _ => {}
                    }
                }
                Err(Errno::EAGAIN | Errno::EINTR) => break,
                Err(e) => {
                    tracing::error!("error reading from output descriptor: {}", e);
                    break;
                }
            }
        }
    }

    /// A filter stage's input became readable: feed every chunk through the
    /// filter; on upstream eof, fire `eof()` once and close the input.
    fn read_filter_input(&mut self, index: usize) {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let Stage::Filter(f) = &mut self.stages[index] else {
            return;
        };
        loop {
            let Some(fd) = &f.stdin_fd else { break };
            match read(fd.as_raw_fd(), &mut scratch) {
                Ok(0) => {
                    tracing::debug!("end of stage {} input, closing stage input descriptor", index);
                    f.func.eof(&mut PipeWriter::new(&mut f.outbuf));
                    f.stdin_fd = None;
                }
                Ok(n) => {
                    tracing::trace!("read on stage {} input descriptor: {}", index, n);
                    f.func.process(&scratch[..n], &mut PipeWriter::new(&mut f.outbuf));
                }
                Err(Errno::EAGAIN | Errno::EINTR) => break,
                Err(e) => {
                    tracing::error!("error reading from stage {} input descriptor: {}", index, e);
                    break;
                }
            }
        }
    }

    /// A filter stage's output became writable: drain the outbound buffer,
    /// and close the descriptor once the filter is finished and empty.
    fn write_filter_output(&mut self, index: usize) {
        let Stage::Filter(f) = &mut self.stages[index] else {
            return;
        };
        while !f.outbuf.is_empty() {
            let Some(fd) = &f.stdout_fd else { break };
            match write(fd, f.outbuf.bottom()) {
                Ok(n) => {
                    tracing::trace!("write on stage {} output descriptor: {}", index, n);
                    f.outbuf.advance(n);
                }
                Err(Errno::EAGAIN | Errno::EINTR) => break,
                Err(e) => {
                    // Downstream is gone (EPIPE or worse); the buffer can
                    // never drain through this descriptor.
                    tracing::info!("error writing to stage {} output descriptor: {}", index, e);
                    f.stdout_fd = None;
                    break;
                }
            }
        }

        if f.stdin_fd.is_none() && f.outbuf.is_empty() && f.stdout_fd.is_some() {
            tracing::debug!("filter stage {} drained, closing stage output descriptor", index);
            f.stdout_fd = None;
        }
    }
}
