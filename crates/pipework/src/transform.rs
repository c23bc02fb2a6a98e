//! Capability traits for in-process pipeline participants.
//!
//! Three seams let caller code take part in a pipeline without spawning a
//! process:
//!
//! - **[`Source`]**: produces the pipeline's input bytes.
//! - **[`Filter`]**: transforms bytes between two stages.
//! - **[`Sink`]**: consumes the pipeline's output bytes.
//!
//! Sources and filters deposit bytes through the [`PipeWriter`] handed to
//! each callback; it appends into the ring buffer the event loop drains into
//! the downstream descriptor. The loop never forwards bytes implicitly — a
//! filter that wants pass-through must `write` what it received.

use crate::ring::RingBuffer;

/// Handle for depositing bytes bound for the next stage.
///
/// Borrowed from the event loop for the duration of one callback. Writes
/// are buffered and attempted on the wire in subsequent loop iterations; no
/// data is dropped while the pipeline is running.
pub struct PipeWriter<'a> {
    buf: &'a mut RingBuffer,
}

impl<'a> PipeWriter<'a> {
    pub(crate) fn new(buf: &'a mut RingBuffer) -> Self {
        Self { buf }
    }

    /// Append bytes to the outbound buffer.
    pub fn write(&mut self, data: &[u8]) {
        self.buf.write(data);
    }
}

/// Produces the input stream of a pipeline.
///
/// Registered with [`Pipeline::set_input_source`](crate::Pipeline::set_input_source).
pub trait Source {
    /// Called whenever the input buffer has drained and more data may be
    /// needed. Deposit bytes through `out` (any number of writes, including
    /// none). Return `true` if more data may exist and the source should be
    /// polled again; `false` once no more data will ever be produced. After
    /// a `false` return the input descriptor is closed as soon as the
    /// buffered bytes have drained.
    fn poll(&mut self, out: &mut PipeWriter<'_>) -> bool;
}

/// Transforms bytes between two pipeline stages.
///
/// Registered with [`Pipeline::add_filter`](crate::Pipeline::add_filter).
pub trait Filter {
    /// Called with each chunk read from the preceding stage.
    fn process(&mut self, data: &[u8], out: &mut PipeWriter<'_>);

    /// Called exactly once, after the preceding stage has closed its end and
    /// every byte has been delivered through [`process`](Filter::process).
    /// May still write trailing bytes through `out`; the stage's outbound
    /// descriptor closes only after the buffer has drained.
    fn eof(&mut self, out: &mut PipeWriter<'_>);
}

/// Consumes the output stream of a pipeline.
///
/// Registered with [`Pipeline::set_output_sink`](crate::Pipeline::set_output_sink).
/// Unlike a [`Filter`], a sink cannot forward bytes.
pub trait Sink {
    /// Called with each chunk read from the final stage.
    fn process(&mut self, data: &[u8]);

    /// Called exactly once when the final stage closes its output.
    fn eof(&mut self);
}
