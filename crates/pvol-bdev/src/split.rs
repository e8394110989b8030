//! Strip splitter.
//!
//! Splitting is a pure function of the I/O range and the volume geometry.
//! The children come out in ascending strip order and their buffer offsets
//! describe one flat contiguous buffer laid out in that same order, not in
//! per-device order.

/// One child I/O produced by splitting a parent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSpec {
    /// Index of the constituent device this child goes to.
    pub device_index: u32,
    /// Start LBA on that device.
    pub device_lba: u64,
    /// Length of this child in blocks.
    pub length_blocks: u32,
    /// Offset of this child's data within the parent buffer, in blocks.
    pub buffer_offset_blocks: u64,
}

/// First strip index touched by the range.
pub fn start_strip(offset_blocks: u64, strip_size_shift: u32) -> u64 {
    offset_blocks >> strip_size_shift
}

/// Last strip index touched by the range (inclusive).
pub fn end_strip(offset_blocks: u64, num_blocks: u64, strip_size_shift: u32) -> u64 {
    (offset_blocks + num_blocks - 1) >> strip_size_shift
}

/// Split a parent range into per-device children, one per touched strip.
///
/// Each strip maps round-robin onto the constituent devices: strip `s` lands
/// on device `s % num_devices` at device-local strip `s / num_devices`. The
/// first child starts at the offset within its strip; the last child carries
/// the remainder; every child in between is exactly one strip long.
///
/// `num_blocks` must be non-zero; a zero-length I/O is a caller error.
pub fn split(
    offset_blocks: u64,
    num_blocks: u64,
    strip_size_shift: u32,
    num_devices: u32,
) -> Vec<ChildSpec> {
    assert!(num_blocks > 0, "zero-length io");
    assert!(num_devices > 0);

    let strip_size: u64 = 1 << strip_size_shift;
    let first = start_strip(offset_blocks, strip_size_shift);
    let last = end_strip(offset_blocks, num_blocks, strip_size_shift);

    let mut children = Vec::with_capacity((last - first + 1) as usize);
    let mut buffer_offset_blocks = 0u64;
    let mut remaining = num_blocks;

    for strip in first..=last {
        let device_index = (strip % num_devices as u64) as u32;
        let device_strip = strip / num_devices as u64;

        let offset_in_strip = if strip == first {
            offset_blocks & (strip_size - 1)
        } else {
            0
        };
        let device_lba = (device_strip << strip_size_shift) + offset_in_strip;
        let length = remaining.min(strip_size - offset_in_strip);

        children.push(ChildSpec {
            device_index,
            device_lba,
            length_blocks: length as u32,
            buffer_offset_blocks,
        });
        buffer_offset_blocks += length;
        remaining -= length;
    }
    debug_assert_eq!(remaining, 0);

    children
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total_len(children: &[ChildSpec]) -> u64 {
        children.iter().map(|c| c.length_blocks as u64).sum()
    }

    #[test]
    fn test_unaligned_two_strip_split() {
        // strip_size=64 blocks, 2 devices, offset=100, len=40.
        let children = split(100, 40, 6, 2);
        assert_eq!(children.len(), 2);
        assert_eq!(
            children[0],
            ChildSpec {
                device_index: 1,
                device_lba: 36,
                length_blocks: 28,
                buffer_offset_blocks: 0,
            }
        );
        assert_eq!(
            children[1],
            ChildSpec {
                device_index: 0,
                device_lba: 64,
                length_blocks: 12,
                buffer_offset_blocks: 28,
            }
        );
    }

    #[test]
    fn test_single_strip_io() {
        // Entirely inside strip 0.
        let children = split(3, 10, 6, 4);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].device_index, 0);
        assert_eq!(children[0].device_lba, 3);
        assert_eq!(children[0].length_blocks, 10);
        assert_eq!(children[0].buffer_offset_blocks, 0);
    }

    #[test]
    fn test_strip_aligned_full_strips() {
        // Two exact strips starting on a strip boundary.
        let children = split(128, 128, 6, 2);
        assert_eq!(children.len(), 2);
        // Strip 2 -> device 0, device strip 1.
        assert_eq!(children[0].device_index, 0);
        assert_eq!(children[0].device_lba, 64);
        assert_eq!(children[0].length_blocks, 64);
        // Strip 3 -> device 1, device strip 1.
        assert_eq!(children[1].device_index, 1);
        assert_eq!(children[1].device_lba, 64);
        assert_eq!(children[1].length_blocks, 64);
    }

    #[test]
    fn test_middle_strips_are_full() {
        let children = split(10, 200, 6, 3);
        assert_eq!(children.len(), 4);
        assert_eq!(children[0].length_blocks, 54);
        assert_eq!(children[1].length_blocks, 64);
        assert_eq!(children[2].length_blocks, 64);
        assert_eq!(children[3].length_blocks, 18);
        assert_eq!(total_len(&children), 200);
    }

    #[test]
    fn test_lengths_sum_and_buffer_offsets_accumulate() {
        for &(offset, len, shift, devices) in &[
            (0u64, 1u64, 3u32, 1u32),
            (7, 9, 3, 2),
            (100, 40, 6, 2),
            (1023, 4097, 10, 5),
            (65536, 12345, 7, 3),
        ] {
            let children = split(offset, len, shift, devices);
            assert_eq!(total_len(&children), len);

            let mut expect_offset = 0u64;
            for child in &children {
                assert_eq!(child.buffer_offset_blocks, expect_offset);
                assert!(child.length_blocks > 0);
                assert!((child.length_blocks as u64) <= (1u64 << shift));
                assert!(child.device_index < devices);
                expect_offset += child.length_blocks as u64;
            }
        }
    }

    #[test]
    fn test_per_device_lbas_monotonic() {
        let children = split(5, 100_000, 4, 3);
        for device in 0..3u32 {
            let lbas: Vec<u64> = children
                .iter()
                .filter(|c| c.device_index == device)
                .map(|c| c.device_lba)
                .collect();
            for pair in lbas.windows(2) {
                assert!(pair[0] < pair[1]);
            }
        }
    }

    #[test]
    fn test_determinism() {
        let a = split(100, 40, 6, 2);
        let b = split(100, 40, 6, 2);
        assert_eq!(a, b);
    }

    #[test]
    #[should_panic(expected = "zero-length io")]
    fn test_zero_length_panics() {
        split(0, 0, 6, 2);
    }
}
