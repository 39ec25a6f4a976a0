// This file is part of Kiln.
//
// Kiln is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Kiln is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Kiln.  If not, see <http://www.gnu.org/licenses/>.

//! On-disk layout of the `.kaspf` profile format.
//!
//! Every structure here is written by memcpy through a page-aligned memory
//! map; layouts are `repr(C)` plain-old-data with exact sizes pinned by
//! static assertions. File layout:
//!
//! ```text
//! [ header (8192, embeds the L1 table)
//! | label table (65536)
//! | per-task subsystem table (4096)
//! | L2 table | L3 table | frame 0 | frame 1 | ...
//! | L3 table | frame 255 | ...
//! | L2 table | ... ]
//! ```
//!
//! Each frame table level maps a wall-clock interval to 255 children; a
//! timestamp resolves to a frame by three binary searches.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

pub const KASPF_MAJOR: u32 = 1;
pub const KASPF_MINOR: u32 = 0;

pub const KASPF_HEADER_SIZE: usize = 8192;
pub const FRAME_TABLE_FULL_SIZE: usize = 4096;
/// Size of the entry array inside a frame table.
pub const FRAME_TABLE_SIZE: usize = FRAME_TABLE_FULL_SIZE - 16;

pub const L3_FRAME_COUNT: u64 = (FRAME_TABLE_SIZE / 16) as u64;
pub const L2_FRAME_COUNT: u64 = L3_FRAME_COUNT * L3_FRAME_COUNT;
pub const L1_FRAME_COUNT: u64 = L3_FRAME_COUNT * L3_FRAME_COUNT * L3_FRAME_COUNT;

pub const KASPF_UNIQUE_TASK_COUNT_MAX: u32 = 1024;
pub const KASPF_LABEL_BUFSIZE: usize = 64;
pub const KASPF_LABEL_TABLE_SIZE: usize =
    KASPF_LABEL_BUFSIZE * KASPF_UNIQUE_TASK_COUNT_MAX as usize;
pub const KASPF_SYSTEM_TABLE_SIZE: usize = KASPF_UNIQUE_TASK_COUNT_MAX as usize * 4;

pub const LABEL_TABLE_OFFSET: u64 = KASPF_HEADER_SIZE as u64;
pub const SYSTEM_TABLE_OFFSET: u64 = LABEL_TABLE_OFFSET + KASPF_LABEL_TABLE_SIZE as u64;
pub const FIRST_TABLE_OFFSET: u64 = SYSTEM_TABLE_OFFSET + KASPF_SYSTEM_TABLE_SIZE as u64;

#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Debug, Default)]
pub struct FtEntry {
    pub ns_start: u64,
    pub offset: u64,
}

/// One level of the sparse frame index. Unused entries carry all-ones.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
pub struct FrameTable {
    pub ns_start: u64,
    pub ns_end: u64,
    pub entries: [FtEntry; L3_FRAME_COUNT as usize],
}

const_assert_eq!(std::mem::size_of::<FrameTable>(), FRAME_TABLE_FULL_SIZE);

impl FrameTable {
    pub fn vacant() -> Self {
        Self {
            ns_start: u64::MAX,
            ns_end: u64::MAX,
            entries: [FtEntry {
                ns_start: u64::MAX,
                offset: u64::MAX,
            }; L3_FRAME_COUNT as usize],
        }
    }

    /// Index of the entry whose time interval contains `ns_time`, or None
    /// outside the table's range. Binary search; unused entries hold
    /// `u64::MAX` and therefore sort after every real timestamp.
    pub fn index_from_time(&self, ns_time: u64) -> Option<u64> {
        if ns_time < self.ns_start || self.ns_end < ns_time {
            return None;
        }
        let mut low = 0usize;
        let mut high = self.entries.len() - 1;
        let mut index = high / 2;
        while low < high {
            if ns_time < self.entries[index].ns_start {
                high = index - 1;
                index = (high + low) / 2;
            } else {
                low = index;
                index = 1 + (high + low) / 2;
            }
        }
        Some(low as u64)
    }
}

/// Per-frame l1/l2/l3 positions of a frame number.
pub fn frame_table_indices(frame: u64) -> (u64, u64, u64) {
    (
        frame / L2_FRAME_COUNT,
        (frame / L3_FRAME_COUNT) % L3_FRAME_COUNT,
        frame % L3_FRAME_COUNT,
    )
}

/// File header at offset 0; padded so the embedded L1 table starts
/// page-aligned.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
pub struct KaspfHeaderDisk {
    pub major: u32,
    pub minor: u32,
    pub frame_count: u64,
    pub worker_count: u64,
    pub kernel_buffer_count: u64,
    pub pid: i32,
    pub _pad0: u32,
    pub page_size: u64,
    pub clock_freq: u64,
    pub rdtsc_freq: u64,
    /// File cursor: bytes allocated, page-padded after every frame.
    pub bytes: u64,
    pub task_count_max: u32,
    pub _pad1: u32,
    pub reserved: [u8; 4016],
    pub l1_table: FrameTable,
}

const_assert_eq!(std::mem::size_of::<KaspfHeaderDisk>(), KASPF_HEADER_SIZE);

/// Frame header; the payload follows immediately:
/// `lw_header[worker_count] | kt_header[kernel_buffer_count] | data`.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Debug, Default)]
pub struct FrameHeaderDisk {
    pub ns_start: u64,
    /// Patched when the next frame begins.
    pub ns_end: u64,
    pub tsc_start: u64,
    pub tsc_end: u64,
    /// Header plus payload bytes, unpadded.
    pub size: u64,
}

pub const FRAME_HEADER_SIZE: usize = std::mem::size_of::<FrameHeaderDisk>();
const_assert_eq!(FRAME_HEADER_SIZE, 40);

/// One worker's slice of a frame payload; offsets are frame-relative.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Debug, Default)]
pub struct LwHeader {
    pub profile_offset: u64,
    pub profile_count: u64,
    pub activity_offset: u64,
    pub activity_count: u64,
}

/// One kernel buffer's slice of a frame payload.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Debug, Default)]
pub struct KtHeader {
    pub pr_offset: u64,
    pub pr_count: u64,
}

/// Lightweight task record sampled at scope entry/exit.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LwProfile {
    pub tsc_start: u64,
    pub tsc_end: u64,
    pub core_start: u32,
    pub core_end: u32,
    /// Index of the parent record within the same worker frame; record 0
    /// is the frame's stub task.
    pub parent: u32,
    pub task_id: u16,
    pub _pad: u16,
}

const_assert_eq!(std::mem::size_of::<LwProfile>(), 32);

pub const PROCESS_WAKING: u32 = 0;
pub const PROCESS_RUNNING: u32 = 1;
pub const PROCESS_SLEEPING: u32 = 2;
pub const PROCESS_BLOCKED: u32 = 3;
pub const PROCESS_UNHANDLED_STATE: u32 = 4;

/// Scheduling span of a worker thread within a frame.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerActivity {
    pub ns_start: u64,
    pub ns_end: u64,
    pub process_state: u32,
    pub _pad: u32,
}

const_assert_eq!(std::mem::size_of::<WorkerActivity>(), 24);

pub const PROCESS_NON_WAKING: u64 = u64::MAX;

/// One online span of some thread on one CPU, from schedule-switch pairs.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessRuntime {
    /// Wake-up time preceding the span, or PROCESS_NON_WAKING.
    pub waking_start_ns: u64,
    pub online_start_ns: u64,
    pub online_end_ns: u64,
    pub pid: i32,
    pub state_end: u32,
    /// Null-terminated process name.
    pub process: [u8; 16],
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self {
            waking_start_ns: PROCESS_NON_WAKING,
            online_start_ns: 0,
            online_end_ns: 0,
            pid: 0,
            state_end: PROCESS_UNHANDLED_STATE,
            process: [0; 16],
        }
    }
}

const_assert_eq!(std::mem::size_of::<ProcessRuntime>(), 48);

/// Round `at` up to the next multiple of `page`.
pub fn page_align(at: u64, page: u64) -> u64 {
    let rem = at % page;
    if rem == 0 {
        at
    } else {
        at + page - rem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_counts() {
        assert_eq!(L3_FRAME_COUNT, 255);
        assert_eq!(L2_FRAME_COUNT, 255 * 255);
        assert_eq!(L1_FRAME_COUNT, 255 * 255 * 255);
    }

    #[test]
    fn frame_indices_decompose() {
        assert_eq!(frame_table_indices(0), (0, 0, 0));
        assert_eq!(frame_table_indices(254), (0, 0, 254));
        assert_eq!(frame_table_indices(255), (0, 1, 0));
        assert_eq!(frame_table_indices(255 * 255), (1, 0, 0));
        assert_eq!(
            frame_table_indices(2 * 255 * 255 + 3 * 255 + 7),
            (2, 3, 7)
        );
    }

    #[test]
    fn time_lookup_binary_search() {
        let mut table = FrameTable::vacant();
        table.ns_start = 100;
        table.ns_end = 1_100;
        for (i, entry) in table.entries.iter_mut().enumerate().take(10) {
            entry.ns_start = 100 + i as u64 * 100;
            entry.offset = i as u64 * 4096;
        }

        assert_eq!(table.index_from_time(100), Some(0));
        assert_eq!(table.index_from_time(150), Some(0));
        assert_eq!(table.index_from_time(999), Some(8));
        assert_eq!(table.index_from_time(1_050), Some(9));
        assert_eq!(table.index_from_time(99), None);
        assert_eq!(table.index_from_time(1_101), None);
    }

    #[test]
    fn field_offsets_match_the_format() {
        assert_eq!(memoffset::offset_of!(KaspfHeaderDisk, l1_table), 4096);
        assert_eq!(memoffset::offset_of!(KaspfHeaderDisk, bytes), 64);
        assert_eq!(memoffset::offset_of!(ProcessRuntime, pid), 24);
        assert_eq!(memoffset::offset_of!(ProcessRuntime, state_end), 28);
        assert_eq!(memoffset::offset_of!(ProcessRuntime, process), 32);
        assert_eq!(memoffset::offset_of!(LwProfile, parent), 24);
        assert_eq!(memoffset::offset_of!(LwProfile, task_id), 28);
    }

    #[test]
    fn page_alignment() {
        assert_eq!(page_align(0, 4096), 0);
        assert_eq!(page_align(1, 4096), 4096);
        assert_eq!(page_align(4096, 4096), 4096);
        assert_eq!(page_align(4097, 4096), 8192);
    }
}
