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

//! Streaming `.kaspf` reader.
//!
//! Keeps a ring of processed frames covering the smallest frame interval
//! that contains the requested time interval. A process() call compares
//! the request against the cached range and extends, discards, or rebuilds;
//! the table branches around both ends stay mapped with containment checks
//! deciding when a mapping has gone stale.

use crate::{
    file::{MappedRegion, ProfileFile},
    format::{
        frame_table_indices, FrameHeaderDisk, FrameTable, FtEntry, KaspfHeaderDisk, KtHeader,
        LwHeader, LwProfile, ProcessRuntime, WorkerActivity, FRAME_HEADER_SIZE,
        FRAME_TABLE_FULL_SIZE, KASPF_HEADER_SIZE, L3_FRAME_COUNT,
    },
    PAGE_SIZE,
};
use anyhow::{ensure, Result};
use log::trace;
use std::{collections::VecDeque, path::Path};
use timebase::ns_from_tsc_truth;
use zerocopy::FromBytes;

/// One deserialized task record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HwProfile {
    pub ns_start: u64,
    pub ns_end: u64,
    /// Index of the parent record on the same worker, or None for roots.
    pub parent: Option<u32>,
    pub task_id: u16,
    pub depth: u32,
    pub core_start: u32,
    pub core_end: u32,
}

#[derive(Clone, Debug, Default)]
pub struct WorkerProfiles {
    pub profiles: Vec<HwProfile>,
    pub activity: Vec<WorkerActivity>,
}

/// One processed frame in the ring.
#[derive(Clone, Debug, Default)]
pub struct HwFrame {
    pub frame: u64,
    pub ns_start: u64,
    pub ns_end: u64,
    pub tsc_start: u64,
    pub tsc_end: u64,
    pub workers: Vec<WorkerProfiles>,
    pub cpus: Vec<Vec<ProcessRuntime>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReaderMode {
    Fixed,
    Stream { ns_interval: u64 },
}

/// Cached (l2, l3) table branch around one end of the ring.
struct BranchCache {
    l1_i: u64,
    l2_i: u64,
    l2: MappedRegion,
    l3: MappedRegion,
}

pub struct KaspfReader {
    file: ProfileFile,
    header: MappedRegion,
    ring: VecDeque<HwFrame>,
    frame_low: u64,
    frame_high: u64,
    mode: ReaderMode,
    ns_start: u64,
    ns_end: u64,
    branch_low: Option<BranchCache>,
    branch_high: Option<BranchCache>,
}

impl KaspfReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = ProfileFile::open(path, PAGE_SIZE)?;
        let header = file.map(0, KASPF_HEADER_SIZE)?;
        {
            let disk = header.as_ref::<KaspfHeaderDisk>();
            ensure!(
                disk.major == crate::format::KASPF_MAJOR,
                "unsupported kaspf major version {}",
                disk.major
            );
        }
        Ok(Self {
            file,
            header,
            ring: VecDeque::new(),
            frame_low: u64::MAX,
            frame_high: u64::MAX,
            mode: ReaderMode::Fixed,
            ns_start: 0,
            ns_end: 0,
            branch_low: None,
            branch_high: None,
        })
    }

    fn header(&self) -> &KaspfHeaderDisk {
        self.header.as_ref::<KaspfHeaderDisk>()
    }

    pub fn frame_count(&self) -> u64 {
        self.header().frame_count
    }

    pub fn rdtsc_freq(&self) -> u64 {
        self.header().rdtsc_freq
    }

    pub fn frames(&self) -> &VecDeque<HwFrame> {
        &self.ring
    }

    /// Pin the requested interval.
    pub fn set_fixed(&mut self, ns_start: u64, ns_end: u64) {
        self.mode = ReaderMode::Fixed;
        self.ns_start = ns_start;
        self.ns_end = ns_end;
    }

    /// Slide the requested interval with the latest completed frame.
    pub fn set_stream(&mut self, ns_interval: u64) {
        self.mode = ReaderMode::Stream { ns_interval };
    }

    fn map_table(&mut self, offset: u64) -> Result<MappedRegion> {
        self.file.map(offset, FRAME_TABLE_FULL_SIZE)
    }

    /// Map (or reuse) the branch tables containing `frame`; the cache is
    /// valid only while the frame's l1/l2 indices match.
    fn branch_for(&mut self, frame: u64, high_end: bool) -> Result<(u64, u64, u64)> {
        let (l1_i, l2_i, l3_i) = frame_table_indices(frame);
        let cached = if high_end {
            &self.branch_high
        } else {
            &self.branch_low
        };
        let stale = match cached {
            Some(cache) => cache.l1_i != l1_i || cache.l2_i != l2_i,
            None => true,
        };
        if stale {
            let l2_offset = self.header().l1_table.entries[l1_i as usize].offset;
            ensure!(l2_offset != u64::MAX, "frame {} beyond the L1 table", frame);
            let l2 = self.map_table(l2_offset)?;
            let l3_offset = l2.as_ref::<FrameTable>().entries[l2_i as usize].offset;
            ensure!(l3_offset != u64::MAX, "frame {} beyond the L2 table", frame);
            let l3 = self.map_table(l3_offset)?;
            let cache = Some(BranchCache { l1_i, l2_i, l2, l3 });
            if high_end {
                self.branch_high = cache;
            } else {
                self.branch_low = cache;
            }
        }
        Ok((l1_i, l2_i, l3_i))
    }

    fn frame_offset(&mut self, frame: u64, high_end: bool) -> Result<u64> {
        let (_, _, l3_i) = self.branch_for(frame, high_end)?;
        let cache = if high_end {
            self.branch_high.as_ref()
        } else {
            self.branch_low.as_ref()
        }
        .expect("branch cache");
        let entry: FtEntry = cache.l3.as_ref::<FrameTable>().entries[l3_i as usize];
        ensure!(entry.offset != u64::MAX, "frame {} beyond the L3 table", frame);
        Ok(entry.offset)
    }

    /// Resolve a timestamp to a frame number by binary search per level.
    fn frame_from_time(&mut self, ns_time: u64) -> Result<u64> {
        let (l1_i, l2_offset) = {
            let header = self.header();
            let l1_i = header.l1_table.index_from_time(ns_time).unwrap_or(0);
            (l1_i, header.l1_table.entries[l1_i as usize].offset)
        };
        ensure!(l2_offset != u64::MAX, "empty profile file");
        let l2 = self.map_table(l2_offset)?;
        let l2_table = l2.as_ref::<FrameTable>();
        let l2_i = l2_table.index_from_time(ns_time).unwrap_or(0);
        let l3_offset = l2_table.entries[l2_i as usize].offset;
        ensure!(l3_offset != u64::MAX, "truncated L2 table");
        let l3 = self.map_table(l3_offset)?;
        let l3_i = l3.as_ref::<FrameTable>().index_from_time(ns_time).unwrap_or(0);

        let frame = (l1_i * L3_FRAME_COUNT + l2_i) * L3_FRAME_COUNT + l3_i;
        Ok(frame.min(self.frame_count().saturating_sub(1)))
    }

    fn read_pod<T: FromBytes>(bytes: &[u8], at: usize) -> T {
        T::read_from(&bytes[at..at + std::mem::size_of::<T>()]).expect("pod read")
    }

    fn load_frame(&mut self, frame: u64, high_end: bool) -> Result<HwFrame> {
        let offset = self.frame_offset(frame, high_end)?;
        let head = self.file.map(offset, FRAME_HEADER_SIZE)?;
        let disk: FrameHeaderDisk = *head.as_ref::<FrameHeaderDisk>();
        drop(head);

        let mut out = HwFrame {
            frame,
            ns_start: disk.ns_start,
            ns_end: disk.ns_end,
            tsc_start: disk.tsc_start,
            tsc_end: disk.tsc_end,
            workers: Vec::new(),
            cpus: Vec::new(),
        };

        let worker_count = self.header().worker_count as usize;
        let cpu_count = self.header().kernel_buffer_count as usize;
        let rdtsc_freq = self.header().rdtsc_freq;
        if disk.size <= FRAME_HEADER_SIZE as u64 {
            // the frame was begun but never completed
            out.workers = vec![WorkerProfiles::default(); worker_count];
            out.cpus = vec![Vec::new(); cpu_count];
            return Ok(out);
        }

        let map = self.file.map(offset, disk.size as usize)?;
        let bytes = map.bytes();

        let mut header_at = FRAME_HEADER_SIZE;
        for _ in 0..worker_count {
            let lw: LwHeader = Self::read_pod(bytes, header_at);
            header_at += std::mem::size_of::<LwHeader>();

            let mut worker = WorkerProfiles::default();
            let mut depths: Vec<u32> = Vec::with_capacity(lw.profile_count as usize);
            let mut at = lw.profile_offset as usize;
            for _ in 0..lw.profile_count {
                let lw_profile: LwProfile = Self::read_pod(bytes, at);
                at += std::mem::size_of::<LwProfile>();

                // parent indices count the on-disk records shifted past the
                // in-memory stub record
                let parent = if lw_profile.parent == 0 {
                    None
                } else {
                    Some(lw_profile.parent - 1)
                };
                let depth = match parent {
                    None => 0,
                    Some(p) => depths.get(p as usize).copied().unwrap_or(0) + 1,
                };
                depths.push(depth);
                worker.profiles.push(HwProfile {
                    ns_start: ns_from_tsc_truth(
                        lw_profile.tsc_start,
                        disk.ns_start,
                        disk.tsc_start,
                        rdtsc_freq,
                    ),
                    ns_end: ns_from_tsc_truth(
                        lw_profile.tsc_end,
                        disk.ns_start,
                        disk.tsc_start,
                        rdtsc_freq,
                    ),
                    parent,
                    task_id: lw_profile.task_id,
                    depth,
                    core_start: lw_profile.core_start,
                    core_end: lw_profile.core_end,
                });
            }

            let mut at = lw.activity_offset as usize;
            for _ in 0..lw.activity_count {
                worker
                    .activity
                    .push(Self::read_pod::<WorkerActivity>(bytes, at));
                at += std::mem::size_of::<WorkerActivity>();
            }
            out.workers.push(worker);
        }

        for _ in 0..cpu_count {
            let kt: KtHeader = Self::read_pod(bytes, header_at);
            header_at += std::mem::size_of::<KtHeader>();
            let mut runtimes = Vec::with_capacity(kt.pr_count as usize);
            let mut at = kt.pr_offset as usize;
            for _ in 0..kt.pr_count {
                runtimes.push(Self::read_pod::<ProcessRuntime>(bytes, at));
                at += std::mem::size_of::<ProcessRuntime>();
            }
            out.cpus.push(runtimes);
        }

        Ok(out)
    }

    /// Bring the ring in line with the requested interval: extend it at
    /// either end, discard frames that fell out, or rebuild outright.
    pub fn process(&mut self) -> Result<()> {
        if self.frame_count() == 0 {
            return Ok(());
        }

        if let ReaderMode::Stream { ns_interval } = self.mode {
            let last = self.frame_count() - 1;
            let offset = self.frame_offset(last, true)?;
            let head = self.file.map(offset, FRAME_HEADER_SIZE)?;
            let disk = head.as_ref::<FrameHeaderDisk>();
            let end = if disk.ns_end != 0 {
                disk.ns_end
            } else {
                disk.ns_start
            };
            self.ns_start = end.saturating_sub(ns_interval);
            self.ns_end = end;
        }

        let target_low = self.frame_from_time(self.ns_start)?;
        let target_high = self.frame_from_time(self.ns_end)?;
        debug_assert!(target_low <= target_high);

        let disjoint = self.ring.is_empty()
            || target_high < self.frame_low
            || self.frame_high < target_low;
        if disjoint {
            trace!(
                "reader rebuild: frames [{}, {}]",
                target_low,
                target_high
            );
            self.ring.clear();
            for frame in target_low..=target_high {
                let loaded = self.load_frame(frame, frame == target_high)?;
                self.ring.push_back(loaded);
            }
            self.frame_low = target_low;
            self.frame_high = target_high;
            return Ok(());
        }

        // discard the ends that fell outside the request
        while self.frame_low < target_low {
            self.ring.pop_front();
            self.frame_low += 1;
        }
        while self.frame_high > target_high {
            self.ring.pop_back();
            self.frame_high -= 1;
        }
        // extend toward the request
        while self.frame_low > target_low {
            let frame = self.frame_low - 1;
            let loaded = self.load_frame(frame, false)?;
            self.ring.push_front(loaded);
            self.frame_low = frame;
        }
        while self.frame_high < target_high {
            let frame = self.frame_high + 1;
            let loaded = self.load_frame(frame, true)?;
            self.ring.push_back(loaded);
            self.frame_high = frame;
        }
        Ok(())
    }
}
