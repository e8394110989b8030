//! The pooled volume: geometry, constituent slots, per-core channels and the
//! I/O submission path.
//!
//! A volume is created when the first of its configured base devices is
//! discovered and moves through `Configuring -> Online -> Offline`. Offline
//! is terminal; a volume comes back only by being recreated through the
//! configuration layer.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use pvol_config::VolumeConfig;
use pvol_types::{make_error_msg, BdevCode, ConfigCode, Result, Status};

use crate::admin::VolumeDump;
use crate::device::{
    BaseBdev, BaseChannel, BaseDesc, BlockDevice, CoreId, IoType, SubmitError, SubmitResult,
};
use crate::registry::RegistryContext;
use crate::request::{IoCompletion, IoRequest, ParentIo};
use crate::split;
use crate::stats::IoStats;

/// Lifecycle states of a pooled volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Configuring,
    Online,
    Offline,
}

/// Striping geometry, computed once when the last constituent attaches.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// Strip size in blocks (power of two).
    pub strip_size: u32,
    pub strip_size_shift: u32,
    /// Shared block size of all constituents, in bytes.
    pub block_size: u32,
    pub block_size_shift: u32,
    /// Usable capacity: bounded by the smallest constituent, truncated to
    /// whole strips, times the number of constituents.
    pub total_blocks: u64,
    pub num_devices: u32,
}

/// One configured constituent position. The slot index is the striping index.
pub(crate) struct ConstituentSlot {
    pub device: Option<Arc<dyn BaseBdev>>,
    pub desc: Option<BaseDesc>,
    pub pending_removal: bool,
}

struct VolumeInner {
    state: VolumeState,
    slots: Vec<ConstituentSlot>,
    num_discovered: u16,
    destruct_requested: bool,
    geometry: Option<Geometry>,
}

/// A pooled volume aggregating N base devices into one striped device.
pub struct PooledVolume {
    config: VolumeConfig,
    registry: Weak<RegistryContext>,
    self_ref: Weak<PooledVolume>,
    inner: Mutex<VolumeInner>,
    channels: DashMap<CoreId, Arc<VolumeChannel>>,
    stats: IoStats,
}

/// Per-core channel on a pooled volume, holding one base-device channel per
/// constituent. Created lazily the first time a core touches the volume.
pub struct VolumeChannel {
    volume: Arc<PooledVolume>,
    core: CoreId,
    bases: Vec<(Arc<dyn BaseBdev>, BaseChannel)>,
}

impl VolumeChannel {
    pub fn volume(&self) -> &Arc<PooledVolume> {
        &self.volume
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    fn base(&self, index: usize) -> (&Arc<dyn BaseBdev>, BaseChannel) {
        let (device, channel) = &self.bases[index];
        (device, *channel)
    }
}

impl Drop for VolumeChannel {
    fn drop(&mut self) {
        for (device, channel) in self.bases.drain(..) {
            device.release_io_channel(channel);
        }
    }
}

impl PooledVolume {
    pub(crate) fn new(
        config: VolumeConfig,
        registry: Weak<RegistryContext>,
        stats_enabled: bool,
    ) -> Arc<Self> {
        let num_devices = config.base_devices.len();
        Arc::new_cyclic(|self_ref| Self {
            config,
            registry,
            self_ref: self_ref.clone(),
            inner: Mutex::new(VolumeInner {
                state: VolumeState::Configuring,
                slots: (0..num_devices)
                    .map(|_| ConstituentSlot {
                        device: None,
                        desc: None,
                        pending_removal: false,
                    })
                    .collect(),
                num_discovered: 0,
                destruct_requested: false,
                geometry: None,
            }),
            channels: DashMap::new(),
            stats: IoStats::new(stats_enabled),
        })
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn state(&self) -> VolumeState {
        self.inner.lock().state
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.inner.lock().geometry
    }

    pub fn num_discovered(&self) -> u16 {
        self.inner.lock().num_discovered
    }

    pub fn destruct_requested(&self) -> bool {
        self.inner.lock().destruct_requested
    }

    pub(crate) fn stats(&self) -> &IoStats {
        &self.stats
    }

    fn arc(&self) -> Arc<PooledVolume> {
        self.self_ref.upgrade().expect("volume self reference gone")
    }

    // ----- lifecycle (driven by the registry) -----

    /// Claim `device` into `slot_index`. Returns `Ok(true)` when this attach
    /// completed the volume and it transitioned to Online.
    pub(crate) fn attach_device(
        &self,
        slot_index: usize,
        device: Arc<dyn BaseBdev>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        assert!(
            inner.state != VolumeState::Online,
            "attach to an online volume"
        );
        let num_devices = inner.slots.len();
        let slot = &mut inner.slots[slot_index];
        if slot.device.is_some() {
            return make_error_msg(
                BdevCode::DEVICE_ALREADY_CLAIMED,
                format!("slot {} of {} already holds a device", slot_index, self.config.name),
            );
        }
        let desc = device.open().map_err(|status| {
            Status::with_message(
                BdevCode::DEVICE_OPEN_FAILED,
                format!("open {} failed: {}", device.name(), status),
            )
        })?;
        debug!(volume = %self.config.name, device = device.name(), slot = slot_index, "claimed base device");
        slot.device = Some(device);
        slot.desc = Some(desc);
        slot.pending_removal = false;
        inner.num_discovered += 1;
        assert!(inner.num_discovered as usize <= num_devices);

        if (inner.num_discovered as usize) < num_devices {
            return Ok(false);
        }

        match compute_geometry(&self.config, &inner.slots) {
            Ok(geometry) => {
                info!(
                    volume = %self.config.name,
                    total_blocks = geometry.total_blocks,
                    strip_size = geometry.strip_size,
                    "volume online"
                );
                inner.geometry = Some(geometry);
                inner.state = VolumeState::Online;
                Ok(true)
            }
            Err(status) => {
                // Never exposed with partial/ambiguous capacity.
                error!(volume = %self.config.name, status = %status, "volume failed to come online");
                inner.state = VolumeState::Offline;
                Err(status)
            }
        }
    }

    /// Record that the base device in `slot_index` has signalled removal.
    pub(crate) fn mark_slot_removal(&self, slot_index: usize) {
        let mut inner = self.inner.lock();
        inner.slots[slot_index].pending_removal = true;
    }

    /// Close the descriptor in `slot_index` and release the claim. Returns
    /// the number of constituents still attached.
    pub(crate) fn close_slot(&self, slot_index: usize) -> u16 {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[slot_index];
        let device = slot.device.take().expect("closing an empty slot");
        let desc = slot.desc.take().expect("slot without descriptor");
        device.close(desc);
        assert!(inner.num_discovered > 0);
        inner.num_discovered -= 1;
        inner.num_discovered
    }

    pub(crate) fn set_offline(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.state != VolumeState::Offline);
        inner.state = VolumeState::Offline;
    }

    pub(crate) fn set_destruct_requested(&self) {
        self.inner.lock().destruct_requested = true;
    }

    /// Drop all cached per-core channels. In-flight requests keep their
    /// channel alive until they complete.
    pub(crate) fn release_channels(&self) {
        self.channels.clear();
    }

    /// Names of the devices currently attached, in slot order.
    pub(crate) fn attached_device_names(&self) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter_map(|s| s.device.as_ref().map(|d| d.name().to_string()))
            .collect()
    }

    /// Slot index currently holding the device with this name, if any.
    pub(crate) fn slot_of_attached_device(&self, device_name: &str) -> Option<usize> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .position(|s| s.device.as_deref().is_some_and(|d| d.name() == device_name))
    }

    // ----- I/O path -----

    pub(crate) fn channel_for_core(&self, core: CoreId) -> Result<Arc<VolumeChannel>> {
        if let Some(channel) = self.channels.get(&core) {
            return Ok(channel.value().clone());
        }
        let bases: Vec<(Arc<dyn BaseBdev>, BaseChannel)> = {
            let inner = self.inner.lock();
            if inner.state != VolumeState::Online {
                return make_error_msg(
                    BdevCode::VOLUME_NOT_ONLINE,
                    format!("{} is not online", self.config.name),
                );
            }
            inner
                .slots
                .iter()
                .map(|slot| {
                    let device = Arc::clone(slot.device.as_ref().expect("online volume with empty slot"));
                    let channel = device.get_io_channel(core);
                    (device, channel)
                })
                .collect()
        };
        let channel = Arc::new(VolumeChannel {
            volume: self.arc(),
            core,
            bases,
        });
        Ok(self.channels.entry(core).or_insert(channel).value().clone())
    }

    pub(crate) fn submit(&self, channel: &Arc<VolumeChannel>, request: IoRequest) {
        match request.io_type {
            // Flush is not fanned out to constituents: this layer holds no
            // volatile cache of its own. Known limitation.
            IoType::Flush => {
                (request.on_complete)(IoCompletion {
                    success: true,
                    data: None,
                });
            }
            IoType::Read | IoType::Write => self.submit_rw(channel, request),
            other => {
                warn!(volume = %self.config.name, ?other, "unsupported io type");
                (request.on_complete)(IoCompletion {
                    success: false,
                    data: None,
                });
            }
        }
    }

    fn submit_rw(&self, channel: &Arc<VolumeChannel>, request: IoRequest) {
        let geometry = {
            let inner = self.inner.lock();
            if inner.state != VolumeState::Online {
                drop(inner);
                warn!(volume = %self.config.name, "io submitted to a volume that is not online");
                return fail_request(request);
            }
            inner.geometry.expect("online volume without geometry")
        };

        if request.num_blocks == 0 {
            warn!(volume = %self.config.name, "zero-length io");
            return fail_request(request);
        }
        let in_range = request
            .offset_blocks
            .checked_add(request.num_blocks)
            .is_some_and(|end| end <= geometry.total_blocks);
        if !in_range {
            warn!(
                volume = %self.config.name,
                offset = request.offset_blocks,
                num_blocks = request.num_blocks,
                "io beyond end of volume"
            );
            return fail_request(request);
        }
        if request.io_type == IoType::Write {
            let expected = (request.num_blocks << geometry.block_size_shift) as usize;
            if request.payload.as_ref().map(|p| p.len()) != Some(expected) {
                warn!(volume = %self.config.name, "write payload does not match block count");
                return fail_request(request);
            }
        }

        match request.io_type {
            IoType::Read => self.stats.record_read(request.num_blocks),
            IoType::Write => self.stats.record_write(request.num_blocks),
            _ => {}
        }

        let core = channel.core();
        let (parent, result) = if geometry.num_devices == 1 {
            let parent = ParentIo::new(request, 0, 0, geometry.block_size_shift, core, Arc::clone(channel));
            let result = self.issue_passthru(channel, &parent);
            (parent, result)
        } else {
            let first = split::start_strip(request.offset_blocks, geometry.strip_size_shift);
            let last = split::end_strip(
                request.offset_blocks,
                request.num_blocks,
                geometry.strip_size_shift,
            );
            let parent = ParentIo::new(
                request,
                first,
                last,
                geometry.block_size_shift,
                core,
                Arc::clone(channel),
            );
            let result = self.issue_children(channel, &parent, first);
            (parent, result)
        };

        match result {
            Ok(()) => {}
            Err(SubmitError::ResourceExhausted) => {
                // Not a failure: the parent stays pending and resumes from
                // where submission stopped, on this core.
                self.stats.record_exhaustion();
                debug!(volume = %self.config.name, core, "child submission exhausted, queueing parent");
                match self.registry.upgrade() {
                    Some(registry) => registry.enqueue_waitq(parent.core(), parent),
                    None => parent.terminate(),
                }
            }
            Err(SubmitError::Fatal(code)) => {
                warn!(volume = %self.config.name, code, "fatal error issuing children");
                parent.terminate();
            }
        }
    }

    /// Issue the children of `parent` starting at `cur_strip`, in strip
    /// order. Stops at the first refusal; already-issued children keep
    /// running (partial submission is permanent forward progress).
    pub(crate) fn issue_children(
        &self,
        channel: &Arc<VolumeChannel>,
        parent: &Arc<ParentIo>,
        cur_strip: u64,
    ) -> SubmitResult {
        let (geometry, descs) = match self.snapshot_online() {
            Some(snapshot) => snapshot,
            None => return Err(SubmitError::Fatal(BdevCode::VOLUME_NOT_ONLINE)),
        };

        let first = split::start_strip(parent.offset_blocks(), geometry.strip_size_shift);
        let children = split::split(
            parent.offset_blocks(),
            parent.num_blocks(),
            geometry.strip_size_shift,
            geometry.num_devices,
        );
        for (i, child) in children.iter().enumerate() {
            if first + (i as u64) < cur_strip {
                continue;
            }
            parent.note_child_issued();
            let index = child.device_index as usize;
            let (device, base_channel) = channel.base(index);
            let result = match parent.io_type() {
                IoType::Read => {
                    let p = Arc::clone(parent);
                    let offset = child.buffer_offset_blocks;
                    device.submit_read(
                        descs[index],
                        base_channel,
                        child.device_lba,
                        child.length_blocks,
                        Box::new(move |res| p.on_child_read_complete(offset, res)),
                    )
                }
                IoType::Write => {
                    let p = Arc::clone(parent);
                    let data = parent.payload_window(child.buffer_offset_blocks, child.length_blocks);
                    device.submit_write(
                        descs[index],
                        base_channel,
                        data,
                        child.device_lba,
                        child.length_blocks,
                        Box::new(move |ok| p.on_child_write_complete(ok)),
                    )
                }
                other => unreachable!("io type {:?} does not split", other),
            };
            if let Err(err) = result {
                parent.note_child_refused();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Single-constituent fast path: forward the request 1:1 to slot 0.
    pub(crate) fn issue_passthru(
        &self,
        channel: &Arc<VolumeChannel>,
        parent: &Arc<ParentIo>,
    ) -> SubmitResult {
        let (_, descs) = match self.snapshot_online() {
            Some(snapshot) => snapshot,
            None => return Err(SubmitError::Fatal(BdevCode::VOLUME_NOT_ONLINE)),
        };
        assert!(parent.num_blocks() <= u32::MAX as u64);

        parent.note_child_issued();
        let (device, base_channel) = channel.base(0);
        let result = match parent.io_type() {
            IoType::Read => {
                let p = Arc::clone(parent);
                device.submit_read(
                    descs[0],
                    base_channel,
                    parent.offset_blocks(),
                    parent.num_blocks() as u32,
                    Box::new(move |res| p.on_child_read_complete(0, res)),
                )
            }
            IoType::Write => {
                let p = Arc::clone(parent);
                let data = parent.payload_window(0, parent.num_blocks() as u32);
                device.submit_write(
                    descs[0],
                    base_channel,
                    data,
                    parent.offset_blocks(),
                    parent.num_blocks() as u32,
                    Box::new(move |ok| p.on_child_write_complete(ok)),
                )
            }
            other => unreachable!("io type {:?} does not split", other),
        };
        if let Err(err) = result {
            parent.note_child_refused();
            return Err(err);
        }
        Ok(())
    }

    /// Re-drive a parent that stopped on resource exhaustion, from exactly
    /// where submission stopped.
    pub(crate) fn resume(&self, parent: &Arc<ParentIo>) -> SubmitResult {
        let channel = parent.channel().expect("queued parent without channel");
        let geometry = match self.geometry() {
            Some(geometry) => geometry,
            None => return Err(SubmitError::Fatal(BdevCode::VOLUME_NOT_ONLINE)),
        };
        if geometry.num_devices == 1 {
            self.issue_passthru(&channel, parent)
        } else {
            self.issue_children(&channel, parent, parent.cur_strip())
        }
    }

    fn snapshot_online(&self) -> Option<(Geometry, Vec<BaseDesc>)> {
        let inner = self.inner.lock();
        if inner.state != VolumeState::Online {
            return None;
        }
        let geometry = inner.geometry.expect("online volume without geometry");
        let descs = inner
            .slots
            .iter()
            .map(|slot| slot.desc.expect("online volume with empty slot"))
            .collect();
        Some((geometry, descs))
    }

    /// Live-state dump for the administrative surface.
    pub fn dump(&self) -> VolumeDump {
        let inner = self.inner.lock();
        VolumeDump {
            name: self.config.name.clone(),
            state: inner.state,
            raid_level: self.config.raid_level,
            strip_size_kb: self.config.strip_size_kb,
            strip_size_blocks: inner.geometry.map(|g| g.strip_size).unwrap_or(0),
            block_size: inner.geometry.map(|g| g.block_size).unwrap_or(0),
            block_size_shift: inner.geometry.map(|g| g.block_size_shift).unwrap_or(0),
            total_blocks: inner.geometry.map(|g| g.total_blocks).unwrap_or(0),
            destruct_requested: inner.destruct_requested,
            num_base_devices: inner.slots.len() as u16,
            num_discovered: inner.num_discovered,
            base_devices: inner
                .slots
                .iter()
                .map(|slot| match &slot.device {
                    Some(device) => device.name().to_string(),
                    None => "SlotEmpty".to_string(),
                })
                .collect(),
            io_stats: self.stats.enabled().then(|| self.stats.snapshot()),
        }
    }
}

fn fail_request(request: IoRequest) {
    (request.on_complete)(IoCompletion {
        success: false,
        data: None,
    });
}

/// Validate constituent geometry and compute the volume geometry.
///
/// All constituents must share one block size; the strip size must convert
/// to a whole power-of-two number of blocks. Capacity deliberately discards
/// the excess of larger constituents: smallest device, truncated to whole
/// strips, times the device count.
fn compute_geometry(config: &VolumeConfig, slots: &[ConstituentSlot]) -> Result<Geometry> {
    let devices: Vec<&Arc<dyn BaseBdev>> = slots
        .iter()
        .map(|slot| slot.device.as_ref().expect("geometry of incomplete volume"))
        .collect();

    let block_size = devices[0].block_size();
    for device in &devices {
        if device.block_size() != block_size {
            return make_error_msg(
                BdevCode::BLOCK_SIZE_MISMATCH,
                format!(
                    "{}: {} has block size {}, expected {}",
                    config.name,
                    device.name(),
                    device.block_size(),
                    block_size
                ),
            );
        }
    }
    if !block_size.is_power_of_two() {
        return make_error_msg(
            BdevCode::BLOCK_SIZE_MISMATCH,
            format!("{}: block size {} is not a power of two", config.name, block_size),
        );
    }

    let strip_bytes = config.strip_size_kb as u64 * 1024;
    if strip_bytes % block_size as u64 != 0 || strip_bytes < block_size as u64 {
        return make_error_msg(
            ConfigCode::INVALID_STRIP_SIZE,
            format!(
                "{}: strip size {} KB does not hold whole {}-byte blocks",
                config.name, config.strip_size_kb, block_size
            ),
        );
    }
    let strip_size = (strip_bytes / block_size as u64) as u32;
    assert!(strip_size.is_power_of_two());

    let min_blocks = devices.iter().map(|d| d.num_blocks()).min().unwrap();
    let strip_size_shift = strip_size.trailing_zeros();
    let total_blocks =
        ((min_blocks >> strip_size_shift) << strip_size_shift) * devices.len() as u64;

    Ok(Geometry {
        strip_size,
        strip_size_shift,
        block_size,
        block_size_shift: block_size.trailing_zeros(),
        total_blocks,
        num_devices: devices.len() as u32,
    })
}

impl BlockDevice for PooledVolume {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn block_size(&self) -> u32 {
        self.geometry().map(|g| g.block_size).unwrap_or(0)
    }

    fn total_blocks(&self) -> u64 {
        self.geometry().map(|g| g.total_blocks).unwrap_or(0)
    }

    fn supports_io_type(&self, io_type: IoType) -> bool {
        matches!(io_type, IoType::Read | IoType::Write | IoType::Flush)
    }

    fn get_io_channel(&self, core: CoreId) -> Result<Arc<VolumeChannel>> {
        self.channel_for_core(core)
    }

    fn submit_request(&self, channel: &Arc<VolumeChannel>, request: IoRequest) {
        self.submit(channel, request);
    }

    fn destruct(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let name = self.config.name.clone();
            if let Err(status) = registry.destroy_volume(&name) {
                warn!(volume = %name, status = %status, "destruct failed");
            }
        }
    }

    fn dump_info(&self) -> VolumeDump {
        self.dump()
    }
}
