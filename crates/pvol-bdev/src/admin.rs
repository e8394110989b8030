//! Administrative surface: volume enumeration and state dumps.
//!
//! Dumps are serializable snapshots; nothing here holds a lock across the
//! boundary to the caller.

use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;

use pvol_types::{make_error_msg, BdevCode, Result, Status, StatusCode};

use crate::registry::RegistryContext;
use crate::stats::IoStatsSnapshot;
use crate::volume::{PooledVolume, VolumeState};

/// Filter for volume enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeCategory {
    All,
    Online,
    Configuring,
    Offline,
}

impl VolumeCategory {
    fn matches(self, state: VolumeState) -> bool {
        match self {
            VolumeCategory::All => true,
            VolumeCategory::Online => state == VolumeState::Online,
            VolumeCategory::Configuring => state == VolumeState::Configuring,
            VolumeCategory::Offline => state == VolumeState::Offline,
        }
    }
}

impl FromStr for VolumeCategory {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(VolumeCategory::All),
            "online" => Ok(VolumeCategory::Online),
            "configuring" => Ok(VolumeCategory::Configuring),
            "offline" => Ok(VolumeCategory::Offline),
            other => make_error_msg(
                StatusCode::INVALID_ARG,
                format!("unknown volume category {:?}", other),
            ),
        }
    }
}

/// Point-in-time snapshot of one volume's state.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeDump {
    pub name: String,
    pub state: VolumeState,
    pub raid_level: u8,
    pub strip_size_kb: u32,
    /// Zero until the volume has computed its geometry.
    pub strip_size_blocks: u32,
    pub block_size: u32,
    pub block_size_shift: u32,
    pub total_blocks: u64,
    pub destruct_requested: bool,
    pub num_base_devices: u16,
    pub num_discovered: u16,
    /// Device name per slot, `"SlotEmpty"` for undiscovered slots.
    pub base_devices: Vec<String>,
    /// Present only when I/O stats are enabled on the registry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub io_stats: Option<IoStatsSnapshot>,
}

impl RegistryContext {
    /// Dump every volume matching the category.
    pub fn list_volumes(&self, category: VolumeCategory) -> Vec<VolumeDump> {
        self.volumes_snapshot()
            .iter()
            .filter(|volume| category.matches(volume.state()))
            .map(|volume| volume.dump())
            .collect()
    }

    /// Dump one volume by name.
    pub fn dump_volume(&self, name: &str) -> Result<VolumeDump> {
        match self.lookup_by_name(name) {
            Some(volume) => Ok(volume.dump()),
            None => make_error_msg(
                BdevCode::VOLUME_NOT_FOUND,
                format!("volume {} does not exist", name),
            ),
        }
    }

    /// Volume handles matching the category, for callers that need more
    /// than a dump.
    pub fn volumes(&self, category: VolumeCategory) -> Vec<Arc<PooledVolume>> {
        self.volumes_snapshot()
            .into_iter()
            .filter(|volume| category.matches(volume.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BaseBdev;
    use crate::membdev::MemBdev;
    use crate::sched::InlineScheduler;
    use pvol_config::VolumeConfig;

    fn config(name: &str, devices: &[&str]) -> VolumeConfig {
        VolumeConfig {
            name: name.into(),
            strip_size_kb: 32,
            raid_level: 0,
            base_devices: devices.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_category_from_str() {
        assert_eq!("all".parse::<VolumeCategory>().unwrap(), VolumeCategory::All);
        assert_eq!(
            "online".parse::<VolumeCategory>().unwrap(),
            VolumeCategory::Online
        );
        assert_eq!(
            "configuring".parse::<VolumeCategory>().unwrap(),
            VolumeCategory::Configuring
        );
        assert_eq!(
            "offline".parse::<VolumeCategory>().unwrap(),
            VolumeCategory::Offline
        );
        let err = "bogus".parse::<VolumeCategory>().unwrap_err();
        assert_eq!(err.code(), StatusCode::INVALID_ARG);
    }

    #[test]
    fn test_list_volumes_by_category() {
        let registry = RegistryContext::new(Arc::new(InlineScheduler::new(1)), false);
        registry.define_volume(config("cfg", &["a", "b"])).unwrap();
        registry.define_volume(config("up", &["c", "d"])).unwrap();

        for name in ["a", "c", "d"] {
            let dev: Arc<dyn BaseBdev> = Arc::new(MemBdev::new(name, 512, 4096));
            registry.on_device_appeared(dev).unwrap();
        }

        assert_eq!(registry.list_volumes(VolumeCategory::All).len(), 2);
        let online = registry.list_volumes(VolumeCategory::Online);
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].name, "up");
        let configuring = registry.list_volumes(VolumeCategory::Configuring);
        assert_eq!(configuring.len(), 1);
        assert_eq!(configuring[0].name, "cfg");
        assert_eq!(configuring[0].base_devices, vec!["a", "SlotEmpty"]);
        assert!(registry.list_volumes(VolumeCategory::Offline).is_empty());
    }

    #[test]
    fn test_dump_serializes_to_json() {
        let registry = RegistryContext::new(Arc::new(InlineScheduler::new(1)), true);
        registry.define_volume(config("pvol1", &["a", "b"])).unwrap();
        for name in ["a", "b"] {
            let dev: Arc<dyn BaseBdev> = Arc::new(MemBdev::new(name, 512, 4096));
            registry.on_device_appeared(dev).unwrap();
        }

        let dump = registry.dump_volume("pvol1").unwrap();
        assert_eq!(dump.state, VolumeState::Online);
        assert_eq!(dump.strip_size_blocks, 64);
        assert_eq!(dump.total_blocks, 8192);

        let json = serde_json::to_value(&dump).unwrap();
        assert_eq!(json["state"], "online");
        assert_eq!(json["base_devices"][1], "b");
        assert!(json["io_stats"].is_object());
    }

    #[test]
    fn test_dump_unknown_volume() {
        let registry = RegistryContext::new(Arc::new(InlineScheduler::new(1)), false);
        let err = registry.dump_volume("nope").unwrap_err();
        assert_eq!(err.code(), BdevCode::VOLUME_NOT_FOUND);
    }
}
