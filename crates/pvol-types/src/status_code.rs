/// Status code type alias; codes fit in 16 bits.
#[allow(non_camel_case_types)]
pub type status_code_t = u16;

/// Common status codes (0-999).
pub mod StatusCode {
    use super::status_code_t;

    pub const OK: status_code_t = 0;
    pub const NOT_IMPLEMENTED: status_code_t = 1;
    pub const INVALID_ARG: status_code_t = 3;
    pub const INVALID_CONFIG: status_code_t = 4;
    pub const NOT_ENOUGH_MEMORY: status_code_t = 26;
    pub const IO_ERROR: status_code_t = 69;
    pub const FOUND_BUG: status_code_t = 998;
    pub const UNKNOWN: status_code_t = 999;
}

/// Block-device layer status codes (1000-1999).
pub mod BdevCode {
    use super::status_code_t;

    pub const DEVICE_NOT_FOUND: status_code_t = 1000;
    pub const DEVICE_NOT_CLAIMABLE: status_code_t = 1001;
    pub const DEVICE_ALREADY_CLAIMED: status_code_t = 1002;
    pub const DEVICE_OPEN_FAILED: status_code_t = 1003;
    pub const VOLUME_NOT_FOUND: status_code_t = 1010;
    pub const VOLUME_ALREADY_PRESENT: status_code_t = 1011;
    pub const VOLUME_NOT_ONLINE: status_code_t = 1012;
    pub const BLOCK_SIZE_MISMATCH: status_code_t = 1013;
    pub const UNSUPPORTED_IO_TYPE: status_code_t = 1020;
    pub const IO_FAILED: status_code_t = 1021;
    pub const OUT_OF_RANGE: status_code_t = 1022;
}

/// Configuration status codes (2000-2999).
pub mod ConfigCode {
    use super::status_code_t;

    pub const INVALID_STRIP_SIZE: status_code_t = 2000;
    pub const INVALID_RAID_LEVEL: status_code_t = 2001;
    pub const INVALID_DEVICE_COUNT: status_code_t = 2002;
    pub const DUPLICATE_VOLUME_NAME: status_code_t = 2003;
    pub const DUPLICATE_DEVICE_NAME: status_code_t = 2004;
    pub const EMPTY_NAME: status_code_t = 2005;
}

/// Map a status code to its symbolic name for display.
pub fn to_string(code: status_code_t) -> &'static str {
    match code {
        StatusCode::OK => "OK",
        StatusCode::NOT_IMPLEMENTED => "NotImplemented",
        StatusCode::INVALID_ARG => "InvalidArg",
        StatusCode::INVALID_CONFIG => "InvalidConfig",
        StatusCode::NOT_ENOUGH_MEMORY => "NotEnoughMemory",
        StatusCode::IO_ERROR => "IoError",
        StatusCode::FOUND_BUG => "FoundBug",
        StatusCode::UNKNOWN => "Unknown",

        BdevCode::DEVICE_NOT_FOUND => "Bdev::DeviceNotFound",
        BdevCode::DEVICE_NOT_CLAIMABLE => "Bdev::DeviceNotClaimable",
        BdevCode::DEVICE_ALREADY_CLAIMED => "Bdev::DeviceAlreadyClaimed",
        BdevCode::DEVICE_OPEN_FAILED => "Bdev::DeviceOpenFailed",
        BdevCode::VOLUME_NOT_FOUND => "Bdev::VolumeNotFound",
        BdevCode::VOLUME_ALREADY_PRESENT => "Bdev::VolumeAlreadyPresent",
        BdevCode::VOLUME_NOT_ONLINE => "Bdev::VolumeNotOnline",
        BdevCode::BLOCK_SIZE_MISMATCH => "Bdev::BlockSizeMismatch",
        BdevCode::UNSUPPORTED_IO_TYPE => "Bdev::UnsupportedIoType",
        BdevCode::IO_FAILED => "Bdev::IoFailed",
        BdevCode::OUT_OF_RANGE => "Bdev::OutOfRange",

        ConfigCode::INVALID_STRIP_SIZE => "Config::InvalidStripSize",
        ConfigCode::INVALID_RAID_LEVEL => "Config::InvalidRaidLevel",
        ConfigCode::INVALID_DEVICE_COUNT => "Config::InvalidDeviceCount",
        ConfigCode::DUPLICATE_VOLUME_NAME => "Config::DuplicateVolumeName",
        ConfigCode::DUPLICATE_DEVICE_NAME => "Config::DuplicateDeviceName",
        ConfigCode::EMPTY_NAME => "Config::EmptyName",

        _ => "Unrecognized",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_names() {
        assert_eq!(to_string(StatusCode::OK), "OK");
        assert_eq!(to_string(BdevCode::VOLUME_NOT_FOUND), "Bdev::VolumeNotFound");
        assert_eq!(
            to_string(ConfigCode::INVALID_STRIP_SIZE),
            "Config::InvalidStripSize"
        );
        assert_eq!(to_string(54321), "Unrecognized");
    }

    #[test]
    fn test_ranges_disjoint() {
        assert!(BdevCode::DEVICE_NOT_FOUND >= 1000);
        assert!(BdevCode::OUT_OF_RANGE < 2000);
        assert!(ConfigCode::INVALID_STRIP_SIZE >= 2000);
    }
}
