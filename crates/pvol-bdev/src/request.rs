//! Parent I/O requests and child-completion aggregation.
//!
//! A [`ParentIo`] tracks one top-level request from submission to its single
//! completion callback. Children are issued in strip order; their completions
//! may arrive in any order. The parent completes exactly once, when no child
//! is pending (not yet submitted) and none is outstanding (submitted, not yet
//! completed), with the AND of all child statuses.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::device::{CoreId, IoType};
use crate::volume::VolumeChannel;

/// Completion callback for a parent request. Fired exactly once.
pub type CompletionFn = Box<dyn FnOnce(IoCompletion) + Send>;

/// Outcome of a parent request.
#[derive(Debug)]
pub struct IoCompletion {
    /// AND of all child statuses (true if and only if every child succeeded).
    pub success: bool,
    /// Read data, present for successful reads.
    pub data: Option<Bytes>,
}

/// One I/O request as submitted to a pooled volume.
pub struct IoRequest {
    pub io_type: IoType,
    pub offset_blocks: u64,
    pub num_blocks: u64,
    /// Write payload; exactly `num_blocks` blocks. `None` for reads/flush.
    pub payload: Option<Bytes>,
    pub on_complete: CompletionFn,
}

impl IoRequest {
    pub fn read(offset_blocks: u64, num_blocks: u64, on_complete: CompletionFn) -> Self {
        Self {
            io_type: IoType::Read,
            offset_blocks,
            num_blocks,
            payload: None,
            on_complete,
        }
    }

    pub fn write(
        offset_blocks: u64,
        num_blocks: u64,
        payload: Bytes,
        on_complete: CompletionFn,
    ) -> Self {
        Self {
            io_type: IoType::Write,
            offset_blocks,
            num_blocks,
            payload: Some(payload),
            on_complete,
        }
    }

    pub fn flush(on_complete: CompletionFn) -> Self {
        Self {
            io_type: IoType::Flush,
            offset_blocks: 0,
            num_blocks: 0,
            payload: None,
            on_complete,
        }
    }
}

struct ParentState {
    children_pending: u16,
    children_outstanding: u16,
    aggregate_status: bool,
    completed: bool,
    /// Destination for child read data, one flat buffer in strip order.
    read_buf: Option<BytesMut>,
    /// Write payload; children slice windows out of it.
    payload: Option<Bytes>,
    /// Channel this parent was submitted on; resumption happens on the same
    /// channel (and therefore the same core).
    channel: Option<Arc<VolumeChannel>>,
    on_complete: Option<CompletionFn>,
}

/// Aggregation state for one in-flight parent request.
pub struct ParentIo {
    io_type: IoType,
    offset_blocks: u64,
    num_blocks: u64,
    start_strip: u64,
    end_strip: u64,
    block_size_shift: u32,
    core: CoreId,
    state: Mutex<ParentState>,
}

impl ParentIo {
    /// Create the parent for a striped request covering
    /// `start_strip..=end_strip`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        request: IoRequest,
        start_strip: u64,
        end_strip: u64,
        block_size_shift: u32,
        core: CoreId,
        channel: Arc<VolumeChannel>,
    ) -> Arc<Self> {
        let num_children = end_strip - start_strip + 1;
        assert!(num_children <= u16::MAX as u64, "request touches too many strips");
        let read_buf = match request.io_type {
            IoType::Read => Some(BytesMut::zeroed(
                (request.num_blocks << block_size_shift) as usize,
            )),
            _ => None,
        };
        Arc::new(Self {
            io_type: request.io_type,
            offset_blocks: request.offset_blocks,
            num_blocks: request.num_blocks,
            start_strip,
            end_strip,
            block_size_shift,
            core,
            state: Mutex::new(ParentState {
                children_pending: num_children as u16,
                children_outstanding: 0,
                aggregate_status: true,
                completed: false,
                read_buf,
                payload: request.payload,
                channel: Some(channel),
                on_complete: Some(request.on_complete),
            }),
        })
    }

    pub(crate) fn io_type(&self) -> IoType {
        self.io_type
    }

    pub(crate) fn offset_blocks(&self) -> u64 {
        self.offset_blocks
    }

    pub(crate) fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    pub(crate) fn core(&self) -> CoreId {
        self.core
    }

    pub(crate) fn channel(&self) -> Option<Arc<VolumeChannel>> {
        self.state.lock().channel.clone()
    }

    /// Strip to resume from: submission stopped after issuing
    /// `total - children_pending` children.
    pub(crate) fn cur_strip(&self) -> u64 {
        let pending = self.state.lock().children_pending as u64;
        self.start_strip + (self.end_strip - self.start_strip + 1 - pending)
    }

    /// Slice the write payload window for a child.
    pub(crate) fn payload_window(&self, buffer_offset_blocks: u64, length_blocks: u32) -> Bytes {
        let state = self.state.lock();
        let payload = state.payload.as_ref().expect("write without payload");
        let start = (buffer_offset_blocks << self.block_size_shift) as usize;
        let end = start + ((length_blocks as u64) << self.block_size_shift) as usize;
        payload.slice(start..end)
    }

    /// Account one child handed to the base device: pending -> outstanding.
    pub(crate) fn note_child_issued(&self) {
        let mut state = self.state.lock();
        assert!(state.children_pending > 0);
        state.children_pending -= 1;
        state.children_outstanding += 1;
    }

    /// Undo [`ParentIo::note_child_issued`] after the base device refused the
    /// submission. The child was never sent; it stays pending.
    pub(crate) fn note_child_refused(&self) {
        let mut state = self.state.lock();
        assert!(state.children_outstanding > 0);
        state.children_outstanding -= 1;
        state.children_pending += 1;
    }

    /// A child read completed. Copies data into the parent buffer at the
    /// child's window and folds the status into the aggregate.
    pub(crate) fn on_child_read_complete(
        self: &Arc<Self>,
        buffer_offset_blocks: u64,
        result: pvol_types::Result<Bytes>,
    ) {
        match result {
            Ok(data) => {
                let mut state = self.state.lock();
                if let Some(buf) = state.read_buf.as_mut() {
                    let start = (buffer_offset_blocks << self.block_size_shift) as usize;
                    buf[start..start + data.len()].copy_from_slice(&data);
                }
                self.child_done_locked(&mut state, true);
            }
            Err(status) => {
                debug!(status = %status, "child read failed");
                let mut state = self.state.lock();
                self.child_done_locked(&mut state, false);
            }
        }
    }

    /// A child write completed.
    pub(crate) fn on_child_write_complete(self: &Arc<Self>, success: bool) {
        let mut state = self.state.lock();
        self.child_done_locked(&mut state, success);
    }

    fn child_done_locked(
        self: &Arc<Self>,
        state: &mut parking_lot::MutexGuard<'_, ParentState>,
        success: bool,
    ) {
        assert!(state.children_outstanding > 0);
        state.children_outstanding -= 1;
        if !success {
            // Any child failure fails the parent, reported only once all
            // children have completed.
            state.aggregate_status = false;
            if let Some(channel) = state.channel.as_ref() {
                channel.volume().stats().record_child_failure();
            }
        }
        self.maybe_complete_locked(state);
    }

    /// Fail this parent. If children are outstanding, stop issuing more and
    /// let their completions drive the (failed) parent completion; otherwise
    /// complete immediately.
    pub(crate) fn terminate(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.completed {
            return;
        }
        state.children_pending = 0;
        state.aggregate_status = false;
        self.maybe_complete_locked(&mut state);
    }

    fn maybe_complete_locked(
        self: &Arc<Self>,
        state: &mut parking_lot::MutexGuard<'_, ParentState>,
    ) {
        if state.completed || state.children_pending != 0 || state.children_outstanding != 0 {
            return;
        }
        state.completed = true;
        let success = state.aggregate_status;
        let on_complete = state.on_complete.take().expect("parent completed twice");
        let data = if success {
            state.read_buf.take().map(BytesMut::freeze)
        } else {
            state.read_buf = None;
            None
        };
        state.payload = None;
        state.channel = None;
        // Fire outside the lock; the callback may reenter the volume.
        parking_lot::MutexGuard::unlocked(state, || {
            on_complete(IoCompletion { success, data });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_constructors() {
        let r = IoRequest::read(8, 16, Box::new(|_| {}));
        assert_eq!(r.io_type, IoType::Read);
        assert!(r.payload.is_none());

        let w = IoRequest::write(0, 1, Bytes::from(vec![0u8; 512]), Box::new(|_| {}));
        assert_eq!(w.io_type, IoType::Write);
        assert!(w.payload.is_some());

        let f = IoRequest::flush(Box::new(|_| {}));
        assert_eq!(f.io_type, IoType::Flush);
        assert_eq!(f.num_blocks, 0);
    }
}
