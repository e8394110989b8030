//! Pooled-volume block-device core.
//!
//! A pooled volume (pvol) aggregates N same-block-size base devices into one
//! logical device with RAID-0 striping: fixed power-of-two strips mapped
//! round-robin across the constituents. The crate provides
//!
//! - [`registry::RegistryContext`]: the root object owning volume
//!   configurations, announced devices and per-core retry queues,
//! - [`volume::PooledVolume`]: the striped volume with its submission path,
//! - [`split`]: the pure strip-splitting arithmetic,
//! - [`device::BaseBdev`] / [`device::BlockDevice`]: the traits at the
//!   bottom and top boundary,
//! - [`sched`]: the per-core scheduling services the core is driven by,
//! - [`membdev::MemBdev`]: an in-memory base device for tests and
//!   simulation.
//!
//! Backpressure is first-class: when a base device refuses a child
//! submission with resource exhaustion, the parent parks in a per-core FIFO
//! and a periodic poller resumes it from exactly where submission stopped.

pub mod admin;
pub mod device;
pub mod membdev;
pub mod registry;
pub mod request;
pub mod sched;
pub mod split;
pub mod stats;
pub mod volume;

mod waitq;

pub use admin::{VolumeCategory, VolumeDump};
pub use device::{
    BaseBdev, BaseChannel, BaseDesc, BlockDevice, CoreId, IoType, NullVolumeEvents,
    ReadCompletion, SubmitError, SubmitResult, VolumeEvents, WriteCompletion,
};
pub use registry::RegistryContext;
pub use request::{CompletionFn, IoCompletion, IoRequest};
pub use sched::{CoreExecutor, InlineScheduler, PollResult, PollerFn, PollerHandle, Scheduler};
pub use split::ChildSpec;
pub use stats::{IoStats, IoStatsSnapshot};
pub use volume::{Geometry, PooledVolume, VolumeChannel, VolumeState};
