//! In-memory base device.
//!
//! Backs the pooled volume in tests and simulation. Completions are never
//! delivered from inside a submit call: they queue up and run when the owner
//! calls [`MemBdev::pump`], which makes interleavings explicit and
//! reproducible. Submission-time failures (resource exhaustion, fatal
//! errors) and completion-time failures are injectable.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use pvol_types::{BdevCode, Result, Status};

use crate::device::{
    BaseBdev, BaseChannel, BaseDesc, CoreId, ReadCompletion, SubmitError, SubmitResult,
    WriteCompletion,
};

struct MemState {
    data: Mutex<Vec<u8>>,
    pending: Mutex<VecDeque<Box<dyn FnOnce() + Send>>>,
    descs: Mutex<HashSet<u64>>,
    next_handle: AtomicU64,
    open_channels: AtomicU64,
    /// Remaining submissions accepted before `ResourceExhausted`; `None`
    /// means unlimited.
    submit_budget: Mutex<Option<u64>>,
    /// Number of upcoming completions to fail.
    fail_next: AtomicU64,
}

pub struct MemBdev {
    name: String,
    block_size: u32,
    num_blocks: u64,
    state: Arc<MemState>,
}

impl MemBdev {
    pub fn new(name: impl Into<String>, block_size: u32, num_blocks: u64) -> Self {
        let bytes = (num_blocks as usize) * (block_size as usize);
        Self {
            name: name.into(),
            block_size,
            num_blocks,
            state: Arc::new(MemState {
                data: Mutex::new(vec![0u8; bytes]),
                pending: Mutex::new(VecDeque::new()),
                descs: Mutex::new(HashSet::new()),
                next_handle: AtomicU64::new(1),
                open_channels: AtomicU64::new(0),
                submit_budget: Mutex::new(None),
                fail_next: AtomicU64::new(0),
            }),
        }
    }

    /// Accept `n` more submissions, then refuse with `ResourceExhausted`
    /// until the budget is reset.
    pub fn set_submit_budget(&self, n: u64) {
        *self.state.submit_budget.lock() = Some(n);
    }

    pub fn clear_submit_budget(&self) {
        *self.state.submit_budget.lock() = None;
    }

    /// Fail the next `n` completions (delivered as I/O errors, not as
    /// submission refusals).
    pub fn fail_next_completions(&self, n: u64) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }

    /// Deliver every queued completion, in submission order. Returns how
    /// many ran. Completions enqueued while pumping wait for the next call.
    pub fn pump(&self) -> usize {
        let batch: Vec<_> = self.state.pending.lock().drain(..).collect();
        let count = batch.len();
        for completion in batch {
            completion();
        }
        count
    }

    pub fn pending_completions(&self) -> usize {
        self.state.pending.lock().len()
    }

    pub fn open_channels(&self) -> u64 {
        self.state.open_channels.load(Ordering::SeqCst)
    }

    /// Raw device contents, for assertions.
    pub fn contents(&self) -> Vec<u8> {
        self.state.data.lock().clone()
    }

    /// Write raw contents directly, bypassing the I/O path.
    pub fn fill(&self, offset: usize, bytes: &[u8]) {
        self.state.data.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn check_submit(&self, desc: BaseDesc, lba: u64, num_blocks: u32) -> SubmitResult {
        if !self.state.descs.lock().contains(&desc.0) {
            return Err(SubmitError::Fatal(BdevCode::IO_FAILED));
        }
        if lba + num_blocks as u64 > self.num_blocks {
            return Err(SubmitError::Fatal(BdevCode::OUT_OF_RANGE));
        }
        let mut budget = self.state.submit_budget.lock();
        if let Some(remaining) = budget.as_mut() {
            if *remaining == 0 {
                return Err(SubmitError::ResourceExhausted);
            }
            *remaining -= 1;
        }
        Ok(())
    }

    fn take_failure(state: &MemState) -> bool {
        state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl BaseBdev for MemBdev {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn open(&self) -> Result<BaseDesc> {
        let handle = self.state.next_handle.fetch_add(1, Ordering::SeqCst);
        self.state.descs.lock().insert(handle);
        Ok(BaseDesc(handle))
    }

    fn close(&self, desc: BaseDesc) {
        let removed = self.state.descs.lock().remove(&desc.0);
        assert!(removed, "closing a descriptor that is not open");
    }

    fn get_io_channel(&self, _core: CoreId) -> BaseChannel {
        self.state.open_channels.fetch_add(1, Ordering::SeqCst);
        BaseChannel(self.state.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    fn release_io_channel(&self, _channel: BaseChannel) {
        let prev = self.state.open_channels.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "releasing more channels than were taken");
    }

    fn submit_read(
        &self,
        desc: BaseDesc,
        _channel: BaseChannel,
        lba: u64,
        num_blocks: u32,
        on_complete: ReadCompletion,
    ) -> SubmitResult {
        self.check_submit(desc, lba, num_blocks)?;
        let state = Arc::clone(&self.state);
        let start = (lba as usize) * (self.block_size as usize);
        let len = (num_blocks as usize) * (self.block_size as usize);
        self.state.pending.lock().push_back(Box::new(move || {
            if Self::take_failure(&state) {
                on_complete(Err(Status::new(BdevCode::IO_FAILED)));
            } else {
                let data = Bytes::copy_from_slice(&state.data.lock()[start..start + len]);
                on_complete(Ok(data));
            }
        }));
        Ok(())
    }

    fn submit_write(
        &self,
        desc: BaseDesc,
        _channel: BaseChannel,
        data: Bytes,
        lba: u64,
        num_blocks: u32,
        on_complete: WriteCompletion,
    ) -> SubmitResult {
        self.check_submit(desc, lba, num_blocks)?;
        let len = (num_blocks as usize) * (self.block_size as usize);
        if data.len() != len {
            return Err(SubmitError::Fatal(BdevCode::IO_FAILED));
        }
        let state = Arc::clone(&self.state);
        let start = (lba as usize) * (self.block_size as usize);
        self.state.pending.lock().push_back(Box::new(move || {
            if Self::take_failure(&state) {
                on_complete(false);
            } else {
                state.data.lock()[start..start + len].copy_from_slice(&data);
                on_complete(true);
            }
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_write_then_read_roundtrip() {
        let dev = MemBdev::new("m", 512, 64);
        let desc = dev.open().unwrap();
        let channel = dev.get_io_channel(0);

        let payload = Bytes::from(vec![7u8; 2 * 512]);
        let wrote = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&wrote);
        dev.submit_write(
            desc,
            channel,
            payload,
            4,
            2,
            Box::new(move |ok| {
                assert!(ok);
                flag.store(true, Ordering::SeqCst);
            }),
        )
        .unwrap();
        // Deferred until pumped.
        assert!(!wrote.load(Ordering::SeqCst));
        assert_eq!(dev.pump(), 1);
        assert!(wrote.load(Ordering::SeqCst));

        let read = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&read);
        dev.submit_read(
            desc,
            channel,
            4,
            2,
            Box::new(move |result| {
                let data = result.unwrap();
                assert!(data.iter().all(|&b| b == 7));
                flag.store(true, Ordering::SeqCst);
            }),
        )
        .unwrap();
        dev.pump();
        assert!(read.load(Ordering::SeqCst));
    }

    #[test]
    fn test_submit_budget_exhaustion() {
        let dev = MemBdev::new("m", 512, 64);
        let desc = dev.open().unwrap();
        let channel = dev.get_io_channel(0);

        dev.set_submit_budget(1);
        dev.submit_read(desc, channel, 0, 1, Box::new(|_| {})).unwrap();
        let err = dev
            .submit_read(desc, channel, 0, 1, Box::new(|_| {}))
            .unwrap_err();
        assert_eq!(err, SubmitError::ResourceExhausted);

        dev.clear_submit_budget();
        dev.submit_read(desc, channel, 0, 1, Box::new(|_| {})).unwrap();
        assert_eq!(dev.pump(), 2);
    }

    #[test]
    fn test_out_of_range_is_fatal() {
        let dev = MemBdev::new("m", 512, 64);
        let desc = dev.open().unwrap();
        let channel = dev.get_io_channel(0);
        let err = dev
            .submit_read(desc, channel, 60, 8, Box::new(|_| {}))
            .unwrap_err();
        assert_eq!(err, SubmitError::Fatal(BdevCode::OUT_OF_RANGE));
    }

    #[test]
    fn test_closed_desc_rejected() {
        let dev = MemBdev::new("m", 512, 64);
        let desc = dev.open().unwrap();
        let channel = dev.get_io_channel(0);
        dev.close(desc);
        let err = dev
            .submit_read(desc, channel, 0, 1, Box::new(|_| {}))
            .unwrap_err();
        assert_eq!(err, SubmitError::Fatal(BdevCode::IO_FAILED));
    }

    #[test]
    fn test_fail_next_completions() {
        let dev = MemBdev::new("m", 512, 64);
        let desc = dev.open().unwrap();
        let channel = dev.get_io_channel(0);

        dev.fail_next_completions(1);
        let failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failed);
        dev.submit_read(
            desc,
            channel,
            0,
            1,
            Box::new(move |result| {
                assert!(result.is_err());
                flag.store(true, Ordering::SeqCst);
            }),
        )
        .unwrap();
        dev.submit_read(desc, channel, 0, 1, Box::new(|result| {
            assert!(result.is_ok());
        }))
        .unwrap();
        dev.pump();
        assert!(failed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_channel_accounting() {
        let dev = MemBdev::new("m", 512, 64);
        let a = dev.get_io_channel(0);
        let b = dev.get_io_channel(1);
        assert_eq!(dev.open_channels(), 2);
        dev.release_io_channel(a);
        dev.release_io_channel(b);
        assert_eq!(dev.open_channels(), 0);
    }
}
