//! Boundary traits between the pooled-volume core and its collaborators.
//!
//! [`BaseBdev`] is the consumed capability: one underlying block device,
//! addressed by block, with asynchronous completion callbacks. [`BlockDevice`]
//! is the exposed capability: the pooled volume registers itself under this
//! trait once it is online.
//!
//! Descriptors and channels are opaque integer handles. The device
//! implementation owns the mapping from handle to its internal state; the
//! core never holds raw pointers into a device.

use std::sync::Arc;

use bytes::Bytes;
use pvol_types::{status_code_t, Result, Status};

use crate::admin::VolumeDump;
use crate::request::IoRequest;
use crate::volume::VolumeChannel;

/// Identifier of a worker core. Cores are numbered `0..num_cores`.
pub type CoreId = usize;

/// An open descriptor on a base device, owned by the claiming slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BaseDesc(pub u64);

/// A per-core I/O channel on a base device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BaseChannel(pub u64);

/// I/O types the block-device layer knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    Read,
    Write,
    Flush,
    Unmap,
    Reset,
}

/// Why a child submission did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// Transient resource exhaustion. The caller may retry later; nothing
    /// about the request is wrong.
    ResourceExhausted,
    /// Anything else. Callers treat this as a permanent failure of the
    /// submission path.
    Fatal(status_code_t),
}

/// Result of a submit attempt at the base-device boundary.
pub type SubmitResult = std::result::Result<(), SubmitError>;

/// Completion of a child read: the data on success, a status on failure.
///
/// Invoked exactly once, strictly after the submit call has returned.
pub type ReadCompletion = Box<dyn FnOnce(Result<Bytes>) + Send>;

/// Completion of a child write: success flag only.
///
/// Invoked exactly once, strictly after the submit call has returned.
pub type WriteCompletion = Box<dyn FnOnce(bool) + Send>;

/// One underlying block device, as consumed by the pooled-volume core.
///
/// Implementations must not invoke a completion callback from inside
/// `submit_read`/`submit_write`; completion is always deferred until after
/// the submit call has returned.
pub trait BaseBdev: Send + Sync {
    /// Device name, unique among base devices.
    fn name(&self) -> &str;

    /// Block size in bytes.
    fn block_size(&self) -> u32;

    /// Device capacity in blocks.
    fn num_blocks(&self) -> u64;

    /// Open a descriptor on this device.
    fn open(&self) -> Result<BaseDesc>;

    /// Close a descriptor previously returned by [`BaseBdev::open`].
    fn close(&self, desc: BaseDesc);

    /// Get (or create) the I/O channel for the calling core.
    fn get_io_channel(&self, core: CoreId) -> BaseChannel;

    /// Release an I/O channel.
    fn release_io_channel(&self, channel: BaseChannel);

    /// Submit a read of `num_blocks` blocks starting at `lba`.
    fn submit_read(
        &self,
        desc: BaseDesc,
        channel: BaseChannel,
        lba: u64,
        num_blocks: u32,
        on_complete: ReadCompletion,
    ) -> SubmitResult;

    /// Submit a write of `data` (exactly `num_blocks` blocks) at `lba`.
    fn submit_write(
        &self,
        desc: BaseDesc,
        channel: BaseChannel,
        data: Bytes,
        lba: u64,
        num_blocks: u32,
        on_complete: WriteCompletion,
    ) -> SubmitResult;
}

/// The capability a pooled volume exposes upward once it is online.
pub trait BlockDevice: Send + Sync {
    /// Volume name.
    fn name(&self) -> &str;

    /// Logical block size in bytes.
    fn block_size(&self) -> u32;

    /// Usable capacity in blocks.
    fn total_blocks(&self) -> u64;

    /// Whether the given I/O type is accepted by `submit_request`.
    fn supports_io_type(&self, io_type: IoType) -> bool;

    /// Get (or create) the per-core channel used to submit I/O.
    fn get_io_channel(&self, core: CoreId) -> Result<Arc<VolumeChannel>>;

    /// Submit one I/O request on the given channel. Completion is delivered
    /// through the request's callback; this call itself never fails.
    fn submit_request(&self, channel: &Arc<VolumeChannel>, request: IoRequest);

    /// Request destruction of this device.
    fn destruct(&self);

    /// Dump live state for the administrative surface.
    fn dump_info(&self) -> VolumeDump;
}

/// Upstream notifications: who to tell when a pooled volume comes and goes.
///
/// The surrounding application registers one listener on the registry; the
/// default is to log and do nothing else.
pub trait VolumeEvents: Send + Sync {
    /// The volume completed configuration and is accepting I/O.
    fn on_volume_online(&self, _volume: Arc<dyn BlockDevice>) {}

    /// The volume left the online state and must no longer be used.
    fn on_volume_offline(&self, _name: &str) {}
}

/// Listener that does nothing. Used when no listener is registered.
pub struct NullVolumeEvents;

impl VolumeEvents for NullVolumeEvents {}

impl From<SubmitError> for Status {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::ResourceExhausted => {
                Status::new(pvol_types::StatusCode::NOT_ENOUGH_MEMORY)
            }
            SubmitError::Fatal(code) => Status::new(code),
        }
    }
}
