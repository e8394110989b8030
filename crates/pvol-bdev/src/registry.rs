//! Device registry and lifecycle orchestration.
//!
//! One [`RegistryContext`] owns every volume configuration, the set of
//! announced base devices, and the per-core retry queues. Base devices are
//! matched to configured slots by name as they appear; a volume object is
//! created on the first match and transitions Online when the last slot
//! fills. Device removal from an Online volume forces it Offline, aborts its
//! queued requests on every core, and notifies the registered listener.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use pvol_config::VolumeConfig;
use pvol_types::{make_error_msg, BdevCode, ConfigCode, Result};

use crate::device::{BaseBdev, BlockDevice, CoreId, NullVolumeEvents, SubmitError, VolumeEvents};
use crate::request::ParentIo;
use crate::sched::{PollResult, PollerHandle, Scheduler};
use crate::volume::{PooledVolume, VolumeState};
use crate::waitq::WaitQueue;

struct ConfigSlot {
    config: VolumeConfig,
    volume: Option<Arc<PooledVolume>>,
}

struct RegistryInner {
    configs: Vec<ConfigSlot>,
    /// Base devices announced by the host, claimed or not.
    devices: HashMap<String, Arc<dyn BaseBdev>>,
}

/// Listener notifications collected under the registry lock and fired after
/// it is released.
enum Event {
    Online(Arc<PooledVolume>),
    Offline(String),
}

/// The root object of the pooled-volume module. All state hangs off one
/// registry; there are no globals.
pub struct RegistryContext {
    scheduler: Arc<dyn Scheduler>,
    io_stats_enabled: bool,
    listener: Mutex<Arc<dyn VolumeEvents>>,
    inner: Mutex<RegistryInner>,
    waitqs: Vec<Mutex<WaitQueue>>,
    pollers: Mutex<Vec<PollerHandle>>,
}

impl RegistryContext {
    pub fn new(scheduler: Arc<dyn Scheduler>, io_stats_enabled: bool) -> Arc<Self> {
        let waitqs = (0..scheduler.num_cores())
            .map(|_| Mutex::new(WaitQueue::new()))
            .collect();
        Arc::new(Self {
            scheduler,
            io_stats_enabled,
            listener: Mutex::new(Arc::new(NullVolumeEvents)),
            inner: Mutex::new(RegistryInner {
                configs: Vec::new(),
                devices: HashMap::new(),
            }),
            waitqs,
            pollers: Mutex::new(Vec::new()),
        })
    }

    /// Replace the volume-event listener.
    pub fn set_listener(&self, listener: Arc<dyn VolumeEvents>) {
        *self.listener.lock() = listener;
    }

    /// Register the retry-queue poller on every core.
    pub fn start(self: &Arc<Self>) {
        let mut pollers = self.pollers.lock();
        assert!(pollers.is_empty(), "registry already started");
        for core in 0..self.scheduler.num_cores() {
            let this = Arc::clone(self);
            pollers.push(
                self.scheduler
                    .register_periodic(core, Box::new(move || this.poll_waitq(core))),
            );
        }
        info!(cores = self.scheduler.num_cores(), "pvol registry started");
    }

    /// Unregister the pollers. Stopping with requests still queued is a bug
    /// in the shutdown sequence of the host.
    pub fn stop(&self) {
        for handle in self.pollers.lock().drain(..) {
            self.scheduler.unregister_periodic(handle);
        }
        for (core, waitq) in self.waitqs.iter().enumerate() {
            let len = waitq.lock().len();
            assert!(len == 0, "stopping with {} queued request(s) on core {}", len, core);
        }
        info!("pvol registry stopped");
    }

    // ----- configuration -----

    /// Register a volume configuration. Base devices already announced are
    /// claimed immediately; the rest attach as they appear.
    pub fn define_volume(self: &Arc<Self>, config: VolumeConfig) -> Result<()> {
        let mut events = Vec::new();
        let result = self.define_volume_inner(config, &mut events);
        self.fire_events(events);
        result
    }

    fn define_volume_inner(
        self: &Arc<Self>,
        config: VolumeConfig,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        config.validate()?;
        let mut inner = self.inner.lock();
        if inner.configs.iter().any(|slot| slot.config.name == config.name) {
            return make_error_msg(
                BdevCode::VOLUME_ALREADY_PRESENT,
                format!("volume {} already exists", config.name),
            );
        }
        for device_name in &config.base_devices {
            if let Some(owner) = inner.configs.iter().find(|slot| {
                slot.config.base_devices.iter().any(|d| d == device_name)
            }) {
                return make_error_msg(
                    BdevCode::DEVICE_NOT_CLAIMABLE,
                    format!(
                        "device {} is already claimed by volume {}",
                        device_name, owner.config.name
                    ),
                );
            }
        }

        let device_names = config.base_devices.clone();
        debug!(volume = %config.name, devices = device_names.len(), "volume defined");
        inner.configs.push(ConfigSlot {
            config,
            volume: None,
        });
        let config_index = inner.configs.len() - 1;

        // Claim anything that was announced before the configuration.
        for (slot_index, device_name) in device_names.iter().enumerate() {
            if let Some(device) = inner.devices.get(device_name).cloned() {
                self.attach_locked(&mut inner, config_index, slot_index, device, events)?;
            }
        }
        Ok(())
    }

    /// Register every volume from a loaded configuration. Stops at the
    /// first rejected record; volumes defined before it stay defined.
    pub fn apply_config(self: &Arc<Self>, config: &pvol_config::PvolConfig) -> Result<()> {
        config.validate()?;
        for volume in &config.volumes {
            self.define_volume(volume.clone())?;
        }
        Ok(())
    }

    /// Create a volume whose base devices must all be announced already; the
    /// volume is Online when this returns `Ok`.
    pub fn create_volume(self: &Arc<Self>, config: VolumeConfig) -> Result<()> {
        config.validate()?;
        {
            let inner = self.inner.lock();
            for device_name in &config.base_devices {
                if !inner.devices.contains_key(device_name) {
                    return make_error_msg(
                        BdevCode::DEVICE_NOT_FOUND,
                        format!("base device {} does not exist", device_name),
                    );
                }
            }
        }
        let name = config.name.clone();
        match self.define_volume(config) {
            Ok(()) => match self.lookup_by_name(&name).map(|v| v.state()) {
                Some(VolumeState::Online) => Ok(()),
                _ => {
                    let _ = self.destroy_volume(&name);
                    make_error_msg(
                        BdevCode::DEVICE_NOT_FOUND,
                        format!("a base device of {} disappeared during creation", name),
                    )
                }
            },
            Err(status) => {
                if self.lookup_by_name(&name).is_some() {
                    let _ = self.destroy_volume(&name);
                }
                Err(status)
            }
        }
    }

    /// Tear down a volume and forget its configuration. Attached devices are
    /// released and may be claimed again by a later configuration.
    pub fn destroy_volume(self: &Arc<Self>, name: &str) -> Result<()> {
        let volume = {
            let mut inner = self.inner.lock();
            let index = match inner.configs.iter().position(|s| s.config.name == name) {
                Some(index) => index,
                None => {
                    return make_error_msg(
                        BdevCode::VOLUME_NOT_FOUND,
                        format!("volume {} does not exist", name),
                    )
                }
            };
            match &inner.configs[index].volume {
                None => {
                    // Configuration only; no device ever attached.
                    inner.configs.remove(index);
                    return Ok(());
                }
                Some(volume) => Arc::clone(volume),
            }
        };

        volume.set_destruct_requested();
        for device_name in volume.attached_device_names() {
            self.release_base_device(&device_name);
        }
        assert_eq!(volume.num_discovered(), 0, "destroy left a slot attached");

        let mut inner = self.inner.lock();
        inner.configs.retain(|slot| slot.config.name != name);
        info!(volume = name, "volume destroyed");
        Ok(())
    }

    // ----- device events -----

    /// A base device has been announced by the host. Returns `Ok(true)` if
    /// some volume configuration claimed it.
    pub fn on_device_appeared(self: &Arc<Self>, device: Arc<dyn BaseBdev>) -> Result<bool> {
        let mut events = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            let name = device.name().to_string();
            if inner.devices.contains_key(&name) {
                return make_error_msg(
                    ConfigCode::DUPLICATE_DEVICE_NAME,
                    format!("device {} announced twice", name),
                );
            }
            inner.devices.insert(name.clone(), Arc::clone(&device));

            let claim = inner.configs.iter().enumerate().find_map(|(ci, slot)| {
                slot.config
                    .base_devices
                    .iter()
                    .position(|d| *d == name)
                    .map(|si| (ci, si))
            });
            match claim {
                None => {
                    debug!(device = %name, "device not claimed by any volume");
                    Ok(false)
                }
                Some((config_index, slot_index)) => self
                    .attach_locked(&mut inner, config_index, slot_index, device, &mut events)
                    .map(|_| true),
            }
        };
        self.fire_events(events);
        result
    }

    /// A base device has gone away. If an Online volume held it, the volume
    /// goes Offline immediately.
    pub fn on_device_removed(self: &Arc<Self>, device_name: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.devices.remove(device_name).is_none() {
                return make_error_msg(
                    BdevCode::DEVICE_NOT_FOUND,
                    format!("device {} is not announced", device_name),
                );
            }
        }
        self.release_base_device(device_name);
        Ok(())
    }

    fn attach_locked(
        self: &Arc<Self>,
        inner: &mut RegistryInner,
        config_index: usize,
        slot_index: usize,
        device: Arc<dyn BaseBdev>,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        let slot = &mut inner.configs[config_index];
        let volume = match &slot.volume {
            Some(volume) => Arc::clone(volume),
            None => {
                let volume = PooledVolume::new(
                    slot.config.clone(),
                    Arc::downgrade(self),
                    self.io_stats_enabled,
                );
                slot.volume = Some(Arc::clone(&volume));
                volume
            }
        };
        if volume.attach_device(slot_index, device)? {
            events.push(Event::Online(volume));
        }
        Ok(())
    }

    /// Release one attached base device from its volume; shared between
    /// hot removal and destruction.
    fn release_base_device(self: &Arc<Self>, device_name: &str) {
        let found = {
            let inner = self.inner.lock();
            inner.configs.iter().find_map(|slot| {
                let volume = slot.volume.as_ref()?;
                volume
                    .slot_of_attached_device(device_name)
                    .map(|slot_index| (Arc::clone(volume), slot_index))
            })
        };
        let Some((volume, slot_index)) = found else {
            return;
        };
        let name = volume.config().name.clone();
        let was_online = volume.state() == VolumeState::Online;

        volume.mark_slot_removal(slot_index);
        let mut freed = false;
        if volume.destruct_requested() && volume.close_slot(slot_index) == 0 {
            freed = true;
        }
        if was_online {
            volume.set_offline();
            info!(volume = %name, device = device_name, "base device removed, volume offline");
            self.abort_waitq_entries(&volume);
            volume.release_channels();
            self.fire_events(vec![Event::Offline(name.clone())]);
        }
        if freed {
            let mut inner = self.inner.lock();
            if let Some(slot) = inner.configs.iter_mut().find(|s| s.config.name == name) {
                slot.volume = None;
            }
        }
    }

    fn abort_waitq_entries(self: &Arc<Self>, volume: &Arc<PooledVolume>) {
        let this = Arc::clone(self);
        let volume = Arc::clone(volume);
        let name = volume.config().name.clone();
        self.scheduler.run_on_every_core(
            Arc::new(move |core| {
                let removed = this.waitqs[core].lock().remove_for_volume(&volume);
                for parent in removed {
                    parent.terminate();
                }
            }),
            Box::new(move || debug!(volume = %name, "queued requests aborted on all cores")),
        );
    }

    fn fire_events(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let listener = self.listener.lock().clone();
        for event in events {
            match event {
                Event::Online(volume) => listener.on_volume_online(volume),
                Event::Offline(name) => listener.on_volume_offline(&name),
            }
        }
    }

    // ----- lookups -----

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<PooledVolume>> {
        self.inner
            .lock()
            .configs
            .iter()
            .find(|slot| slot.config.name == name)
            .and_then(|slot| slot.volume.clone())
    }

    /// The volume configuration claiming `device_name`, if any, with the
    /// slot index the device would occupy. Derived from configuration alone,
    /// independent of whether the device has appeared.
    pub fn lookup_claiming_device(&self, device_name: &str) -> Option<(String, usize)> {
        self.inner.lock().configs.iter().find_map(|slot| {
            slot.config
                .base_devices
                .iter()
                .position(|d| d == device_name)
                .map(|slot_index| (slot.config.name.clone(), slot_index))
        })
    }

    /// Resolve an Online volume for I/O.
    pub fn open_volume(&self, name: &str) -> Result<Arc<dyn BlockDevice>> {
        let volume = match self.lookup_by_name(name) {
            Some(volume) => volume,
            None => {
                return make_error_msg(
                    BdevCode::VOLUME_NOT_FOUND,
                    format!("volume {} does not exist", name),
                )
            }
        };
        if volume.state() != VolumeState::Online {
            return make_error_msg(
                BdevCode::VOLUME_NOT_ONLINE,
                format!("volume {} is not online", name),
            );
        }
        Ok(volume)
    }

    /// All volume objects that exist (configurations with at least one
    /// attached or previously attached device).
    pub(crate) fn volumes_snapshot(&self) -> Vec<Arc<PooledVolume>> {
        self.inner
            .lock()
            .configs
            .iter()
            .filter_map(|slot| slot.volume.clone())
            .collect()
    }

    // ----- retry queue -----

    pub(crate) fn enqueue_waitq(&self, core: CoreId, parent: Arc<ParentIo>) {
        self.waitqs[core].lock().enqueue(parent);
    }

    /// Drain the retry queue of one core. Strictly head-first: a head that
    /// hits exhaustion again stays in place and blocks everything behind it.
    pub(crate) fn poll_waitq(&self, core: CoreId) -> PollResult {
        let mut progressed = false;
        loop {
            let Some(parent) = self.waitqs[core].lock().peek_head() else {
                return if progressed {
                    PollResult::Busy
                } else {
                    PollResult::Idle
                };
            };
            let volume = parent.channel().map(|ch| Arc::clone(ch.volume()));
            let result = match &volume {
                Some(volume) => volume.resume(&parent),
                // A parent without a channel has already completed; it should
                // never still be queued.
                None => Err(SubmitError::Fatal(BdevCode::VOLUME_NOT_ONLINE)),
            };
            match result {
                Ok(()) => {
                    self.waitqs[core].lock().pop_head(&parent);
                    progressed = true;
                }
                Err(SubmitError::ResourceExhausted) => {
                    return PollResult::Busy;
                }
                Err(SubmitError::Fatal(code)) => {
                    warn!(core, code, "queued request failed on resume");
                    self.waitqs[core].lock().pop_head(&parent);
                    parent.terminate();
                    progressed = true;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn waitq_len(&self, core: CoreId) -> usize {
        self.waitqs[core].lock().len()
    }
}
