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

//! Task-level profiler with a memory-mapped on-disk frame index.
//!
//! Worker threads record scope entry/exit into thread-owned double-buffered
//! frames; at every frame boundary the main thread swaps the buffers,
//! optionally folds in kernel scheduling traces, and appends the completed
//! frame to the `.kaspf` file behind a three-level time-indexed table. The
//! [reader] side maps frames back out of the file into a ring.

pub mod file;
pub mod format;
pub mod ktrace;
pub mod reader;

use crate::{
    file::{MappedRegion, ProfileFile},
    format::{
        frame_table_indices, page_align, FrameHeaderDisk, FrameTable, KaspfHeaderDisk, KtHeader,
        LwHeader, LwProfile, ProcessRuntime, WorkerActivity, FIRST_TABLE_OFFSET,
        FRAME_HEADER_SIZE, FRAME_TABLE_FULL_SIZE, KASPF_HEADER_SIZE, KASPF_LABEL_BUFSIZE,
        KASPF_LABEL_TABLE_SIZE, KASPF_MAJOR, KASPF_MINOR, KASPF_SYSTEM_TABLE_SIZE,
        KASPF_UNIQUE_TASK_COUNT_MAX, L1_FRAME_COUNT, L2_FRAME_COUNT, L3_FRAME_COUNT,
        LABEL_TABLE_OFFSET, SYSTEM_TABLE_OFFSET,
    },
    ktrace::{ingest_cpu_events, CpuIngestState, KernelTraceSource, SchedEvent},
};
use anyhow::Result;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::{
    cell::Cell,
    path::Path,
    sync::{
        atomic::{AtomicI32, AtomicU32, Ordering},
        Arc,
    },
};
use timebase::tsc_sample;

pub const PAGE_SIZE: u64 = 4096;
pub const WORKER_FRAME_LEN_DEFAULT: u32 = 16 * 1024;
pub const WORKER_STACK_LEN_DEFAULT: u32 = 256;

/// Profiling granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfileLevel {
    /// Task scopes only.
    Task,
    /// Task scopes plus kernel scheduling traces.
    Kernel,
}

/// Subsystem tags recorded per task id.
pub const SYSTEM_NONE: u32 = 0;
pub const SYSTEM_RENDER: u32 = 1;
pub const SYSTEM_UI: u32 = 2;
pub const SYSTEM_TASK: u32 = 3;
pub const SYSTEM_EDITOR: u32 = 4;
pub const SYSTEM_PHYSICS: u32 = 5;

struct FrameBuffers {
    build: Vec<LwProfile>,
    stack: Vec<u32>,
    completed: Vec<LwProfile>,
    frame_len: u32,
    stack_len: u32,
}

impl FrameBuffers {
    fn new(frame_len: u32, stack_len: u32) -> Self {
        let mut buffers = Self {
            build: Vec::with_capacity(frame_len as usize),
            stack: Vec::with_capacity(stack_len as usize),
            completed: Vec::new(),
            frame_len,
            stack_len,
        };
        buffers.reset_build();
        buffers
    }

    fn reset_build(&mut self) {
        self.build.clear();
        // index 0 is the frame's stub task so every real record has a
        // parent
        self.build.push(LwProfile::default());
        self.stack.clear();
        self.stack.push(0);
    }
}

/// One worker's double-buffered profile frame. The mutex is uncontended
/// except at the frame-boundary swap.
pub struct WorkerFrame {
    buffers: Mutex<FrameBuffers>,
}

/// State shared between scope guards on any thread and the main-thread
/// writer.
pub struct ProfilerShared {
    worker_frames: Vec<WorkerFrame>,
    worker_pids: Vec<AtomicI32>,
    next_task_id: AtomicU32,
    tables: Mutex<TaskTables>,
}

struct TaskTables {
    labels: MappedRegion,
    systems: MappedRegion,
    /// Mirror of the on-disk label table for cheap lookups.
    names: Vec<String>,
}

thread_local! {
    static TLS_WORKER: Cell<u32> = Cell::new(u32::MAX);
}

impl ProfilerShared {
    /// Bind the calling thread to `worker_id`'s profile frame. Call once
    /// per worker at startup (worker 0 = main).
    pub fn register_worker_thread(&self, worker_id: u32) {
        TLS_WORKER.with(|tls| tls.set(worker_id));
        self.worker_pids[worker_id as usize].store(thread_id(), Ordering::Release);
    }

    pub fn worker_count(&self) -> u32 {
        self.worker_frames.len() as u32
    }

    fn resolve_task_id(&self, site: &AtomicU32, label: &str, system: u32) -> u16 {
        let cached = site.load(Ordering::Acquire);
        if cached != u32::MAX {
            return cached as u16;
        }
        let mut tables = self.tables.lock();
        // the first caller through the lock assigns the id
        let cached = site.load(Ordering::Acquire);
        if cached != u32::MAX {
            return cached as u16;
        }
        let id = self.next_task_id.fetch_add(1, Ordering::AcqRel);
        if id >= KASPF_UNIQUE_TASK_COUNT_MAX {
            warn!("task id space exhausted; {:?} recorded as task 0", label);
            site.store(0, Ordering::Release);
            return 0;
        }

        let bytes = label.as_bytes();
        let len = bytes.len().min(KASPF_LABEL_BUFSIZE - 1);
        let at = id as usize * KASPF_LABEL_BUFSIZE;
        tables.labels.bytes_mut()[at..at + len].copy_from_slice(&bytes[..len]);
        tables.systems.bytes_mut()[id as usize * 4..id as usize * 4 + 4]
            .copy_from_slice(&system.to_le_bytes());
        if tables.names.len() <= id as usize {
            tables.names.resize(id as usize + 1, String::new());
        }
        tables.names[id as usize] = label[..len].to_owned();

        site.store(id, Ordering::Release);
        id as u16
    }

    pub fn task_label(&self, task_id: u16) -> String {
        let tables = self.tables.lock();
        tables
            .names
            .get(task_id as usize)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(target_os = "linux")]
fn thread_id() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

#[cfg(not(target_os = "linux"))]
fn thread_id() -> i32 {
    0
}

/// RAII task scope; entry samples the counter, drop samples it again.
pub struct ProfileScope<'a> {
    shared: &'a ProfilerShared,
    worker: u32,
    index: u32,
}

impl<'a> ProfileScope<'a> {
    pub fn enter(
        shared: &'a ProfilerShared,
        site: &AtomicU32,
        label: &str,
        system: u32,
    ) -> Option<Self> {
        let worker = TLS_WORKER.with(|tls| tls.get());
        if worker == u32::MAX {
            return None;
        }
        let task_id = shared.resolve_task_id(site, label, system);

        let frame = &shared.worker_frames[worker as usize];
        let mut buffers = frame.buffers.lock();
        if buffers.build.len() >= buffers.frame_len as usize
            || buffers.stack.len() >= buffers.stack_len as usize
        {
            warn!("profiler frame full on worker {}", worker);
            return None;
        }
        let parent = *buffers.stack.last().expect("profile stack");
        let index = buffers.build.len() as u32;
        let sample = tsc_sample();
        buffers.build.push(LwProfile {
            tsc_start: sample.tsc,
            tsc_end: 0,
            core_start: sample.core,
            core_end: sample.core,
            parent,
            task_id,
            _pad: 0,
        });
        buffers.stack.push(index);
        Some(Self {
            shared,
            worker,
            index,
        })
    }
}

impl Drop for ProfileScope<'_> {
    fn drop(&mut self) {
        let frame = &self.shared.worker_frames[self.worker as usize];
        let mut buffers = frame.buffers.lock();
        let sample = tsc_sample();
        let record = &mut buffers.build[self.index as usize];
        record.tsc_end = sample.tsc;
        record.core_end = sample.core;
        let popped = buffers.stack.pop();
        debug_assert_eq!(popped, Some(self.index));
    }
}

/// Per call site a task id is assigned once; subsequent entries reuse it.
/// Expands to an RAII guard bound for the rest of the enclosing block.
#[macro_export]
macro_rules! profile_scope {
    ($shared:expr, $label:expr, $system:expr) => {
        let __profile_scope = {
            static __TASK_ID: std::sync::atomic::AtomicU32 =
                std::sync::atomic::AtomicU32::new(u32::MAX);
            $crate::ProfileScope::enter($shared, &__TASK_ID, $label, $system)
        };
    };
}

pub struct ProfilerConfig {
    pub worker_count: u32,
    pub frame_len: u32,
    pub stack_len: u32,
    pub clock_freq: u64,
    pub rdtsc_freq: u64,
    pub level: ProfileLevel,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            frame_len: WORKER_FRAME_LEN_DEFAULT,
            stack_len: WORKER_STACK_LEN_DEFAULT,
            clock_freq: timebase::NSEC_PER_SEC,
            rdtsc_freq: 1_000_000_000,
            level: ProfileLevel::Task,
        }
    }
}

/// Main-thread profiler: owns the file, the current table branch mappings
/// and the frame cursor.
pub struct KasProfiler {
    shared: Arc<ProfilerShared>,
    file: ProfileFile,
    header: MappedRegion,

    /// Currently mapped L2 table, L3 table and frame header.
    branch_l2: Option<MappedRegion>,
    branch_l3: Option<MappedRegion>,
    branch_frame: Option<MappedRegion>,
    frame_offset: u64,

    frame_counter: u64,
    stopped: bool,

    kt: Option<Box<dyn KernelTraceSource>>,
    cpu_states: Vec<CpuIngestState>,
    event_scratch: Vec<SchedEvent>,
    frame_pr: Vec<Vec<ProcessRuntime>>,
    frame_activity: Vec<Vec<WorkerActivity>>,
}

impl KasProfiler {
    pub fn create(
        path: &Path,
        config: ProfilerConfig,
        kt: Option<Box<dyn KernelTraceSource>>,
    ) -> Result<Self> {
        let mut file = ProfileFile::create(path, PAGE_SIZE)?;

        let kernel_buffer_count = match (&config.level, &kt) {
            (ProfileLevel::Kernel, Some(source)) => source.cpu_count(),
            (ProfileLevel::Kernel, None) => {
                info!("kernel tracing unavailable; profiling at task level");
                0
            }
            _ => 0,
        };

        let mut header = file.map(0, KASPF_HEADER_SIZE)?;
        {
            let disk = header.as_mut::<KaspfHeaderDisk>();
            disk.major = KASPF_MAJOR;
            disk.minor = KASPF_MINOR;
            disk.frame_count = 0;
            disk.worker_count = config.worker_count as u64;
            disk.kernel_buffer_count = kernel_buffer_count as u64;
            disk.pid = std::process::id() as i32;
            disk.page_size = PAGE_SIZE;
            disk.clock_freq = config.clock_freq;
            disk.rdtsc_freq = config.rdtsc_freq;
            disk.bytes = FIRST_TABLE_OFFSET;
            disk.task_count_max = KASPF_UNIQUE_TASK_COUNT_MAX;
            disk.l1_table = FrameTable::vacant();
            disk.l1_table.ns_start = 0;
            disk.l1_table.ns_end = u64::MAX;
        }

        let mut labels = file.map(LABEL_TABLE_OFFSET, KASPF_LABEL_TABLE_SIZE)?;
        labels.bytes_mut().fill(0);
        let mut systems = file.map(SYSTEM_TABLE_OFFSET, KASPF_SYSTEM_TABLE_SIZE)?;
        systems.bytes_mut().fill(0);

        let shared = Arc::new(ProfilerShared {
            worker_frames: (0..config.worker_count)
                .map(|_| WorkerFrame {
                    buffers: Mutex::new(FrameBuffers::new(config.frame_len, config.stack_len)),
                })
                .collect(),
            worker_pids: (0..config.worker_count).map(|_| AtomicI32::new(0)).collect(),
            next_task_id: AtomicU32::new(1),
            tables: Mutex::new(TaskTables {
                labels,
                systems,
                names: vec![String::new()],
            }),
        });

        let cpu_count = kernel_buffer_count as usize;
        debug!(
            "profiler online: {} worker(s), {} kernel buffer(s)",
            config.worker_count, cpu_count
        );
        Ok(Self {
            shared,
            file,
            header,
            branch_l2: None,
            branch_l3: None,
            branch_frame: None,
            frame_offset: 0,
            frame_counter: 0,
            stopped: false,
            kt,
            cpu_states: vec![CpuIngestState::default(); cpu_count],
            event_scratch: Vec::new(),
            frame_pr: vec![Vec::new(); cpu_count],
            frame_activity: vec![Vec::new(); config.worker_count as usize],
        })
    }

    pub fn shared(&self) -> &Arc<ProfilerShared> {
        &self.shared
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    fn header(&self) -> &KaspfHeaderDisk {
        self.header.as_ref::<KaspfHeaderDisk>()
    }

    fn header_mut(&mut self) -> &mut KaspfHeaderDisk {
        self.header.as_mut::<KaspfHeaderDisk>()
    }

    fn alloc_table(&mut self) -> Result<u64> {
        let offset = self.header().bytes;
        self.header_mut().bytes = offset + FRAME_TABLE_FULL_SIZE as u64;
        let mut map = self.file.map(offset, FRAME_TABLE_FULL_SIZE)?;
        *map.as_mut::<FrameTable>() = FrameTable::vacant();
        Ok(offset)
    }

    fn alloc_frame_header(&mut self) -> Result<u64> {
        let offset = self.header().bytes;
        self.header_mut().bytes = offset + FRAME_HEADER_SIZE as u64;
        // mapping is page-granular; the header sits at the page head
        let mut map = self.file.map(offset, FRAME_HEADER_SIZE)?;
        *map.as_mut::<FrameHeaderDisk>() = FrameHeaderDisk::default();
        Ok(offset)
    }

    /// Open the table branch for the next frame, patching the previous
    /// frame's end times on the way out.
    fn alloc_headers_in_frame(&mut self, ns_time: u64, tsc_time: u64) -> Result<()> {
        if self.frame_counter == L1_FRAME_COUNT {
            error!(
                "kaspf files hold at most {} frames; profiling stopped",
                L1_FRAME_COUNT
            );
            self.stopped = true;
            return Ok(());
        }

        let frame = self.header().frame_count;
        let (l1_i, l2_i, l3_i) = frame_table_indices(frame);

        if frame % L2_FRAME_COUNT == 0 {
            if let Some(mut l2) = self.branch_l2.take() {
                l2.as_mut::<FrameTable>().ns_end = ns_time;
            }
            let offset = self.alloc_table()?;
            {
                let header = self.header_mut();
                header.l1_table.entries[l1_i as usize].ns_start = ns_time;
                header.l1_table.entries[l1_i as usize].offset = offset;
            }
            let mut map = self.file.map(offset, FRAME_TABLE_FULL_SIZE)?;
            map.as_mut::<FrameTable>().ns_start = ns_time;
            self.branch_l2 = Some(map);
        }

        if frame % L3_FRAME_COUNT == 0 {
            if let Some(mut l3) = self.branch_l3.take() {
                l3.as_mut::<FrameTable>().ns_end = ns_time;
            }
            let offset = self.alloc_table()?;
            {
                let l2 = self.branch_l2.as_mut().expect("l2 branch");
                let table = l2.as_mut::<FrameTable>();
                table.entries[l2_i as usize].ns_start = ns_time;
                table.entries[l2_i as usize].offset = offset;
            }
            let mut map = self.file.map(offset, FRAME_TABLE_FULL_SIZE)?;
            map.as_mut::<FrameTable>().ns_start = ns_time;
            self.branch_l3 = Some(map);
        }

        if let Some(mut prev) = self.branch_frame.take() {
            let disk = prev.as_mut::<FrameHeaderDisk>();
            disk.ns_end = ns_time;
            disk.tsc_end = tsc_time;
        }

        let offset = self.alloc_frame_header()?;
        {
            let l3 = self.branch_l3.as_mut().expect("l3 branch");
            let table = l3.as_mut::<FrameTable>();
            table.entries[l3_i as usize].ns_start = ns_time;
            table.entries[l3_i as usize].offset = offset;
        }
        let mut map = self.file.map(offset, FRAME_HEADER_SIZE)?;
        {
            let disk = map.as_mut::<FrameHeaderDisk>();
            disk.ns_start = ns_time;
            disk.tsc_start = tsc_time;
        }
        self.branch_frame = Some(map);
        self.frame_offset = offset;

        self.header_mut().frame_count = frame + 1;
        Ok(())
    }

    fn gather_kernel_profiles(&mut self) {
        for pr in self.frame_pr.iter_mut() {
            pr.clear();
        }
        for activity in self.frame_activity.iter_mut() {
            activity.clear();
        }
        let Some(kt) = self.kt.as_mut() else {
            return;
        };

        let worker_pids: Vec<i32> = self
            .shared
            .worker_pids
            .iter()
            .map(|pid| pid.load(Ordering::Acquire))
            .collect();
        for cpu in 0..self.cpu_states.len() {
            self.event_scratch.clear();
            kt.drain(cpu as u32, &mut self.event_scratch);
            ingest_cpu_events(
                &mut self.cpu_states[cpu],
                &self.event_scratch,
                &worker_pids,
                &mut self.frame_pr[cpu],
                &mut self.frame_activity,
            );
        }
    }

    /// Append the previous frame's payload behind its header.
    fn write_completed_frame(&mut self) -> Result<()> {
        if self.header().frame_count == 0 {
            return Ok(());
        }

        // swap out every worker's completed records
        let worker_count = self.shared.worker_frames.len();
        let mut worker_profiles: Vec<Vec<LwProfile>> = Vec::with_capacity(worker_count);
        for frame in self.shared.worker_frames.iter() {
            let buffers = frame.buffers.lock();
            worker_profiles.push(buffers.completed.clone());
        }

        let cpu_count = self.frame_pr.len();
        let lw_kt_headers = worker_count * std::mem::size_of::<LwHeader>()
            + cpu_count * std::mem::size_of::<KtHeader>();
        let mut data_size = 0u64;
        for (worker, profiles) in worker_profiles.iter().enumerate() {
            data_size += (profiles.len() * std::mem::size_of::<LwProfile>()) as u64;
            data_size += (self.frame_activity[worker].len()
                * std::mem::size_of::<WorkerActivity>()) as u64;
        }
        for pr in self.frame_pr.iter() {
            data_size += (pr.len() * std::mem::size_of::<ProcessRuntime>()) as u64;
        }
        let frame_size = FRAME_HEADER_SIZE as u64 + lw_kt_headers as u64 + data_size;

        let frame_offset = self.frame_offset;
        let mut map = self.file.map(frame_offset, frame_size as usize)?;
        {
            let disk = map.as_mut::<FrameHeaderDisk>();
            disk.size = frame_size;
        }

        let bytes = map.bytes_mut();
        let mut header_at = FRAME_HEADER_SIZE;
        let mut data_at = FRAME_HEADER_SIZE + lw_kt_headers;
        for (worker, profiles) in worker_profiles.iter().enumerate() {
            let mut lw = LwHeader::default();
            lw.profile_offset = data_at as u64;
            lw.profile_count = profiles.len() as u64;
            for profile in profiles.iter() {
                bytes[data_at..data_at + std::mem::size_of::<LwProfile>()]
                    .copy_from_slice(zerocopy::AsBytes::as_bytes(profile));
                data_at += std::mem::size_of::<LwProfile>();
            }
            lw.activity_offset = data_at as u64;
            lw.activity_count = self.frame_activity[worker].len() as u64;
            for span in self.frame_activity[worker].iter() {
                bytes[data_at..data_at + std::mem::size_of::<WorkerActivity>()]
                    .copy_from_slice(zerocopy::AsBytes::as_bytes(span));
                data_at += std::mem::size_of::<WorkerActivity>();
            }
            bytes[header_at..header_at + std::mem::size_of::<LwHeader>()]
                .copy_from_slice(zerocopy::AsBytes::as_bytes(&lw));
            header_at += std::mem::size_of::<LwHeader>();
        }
        for pr in self.frame_pr.iter() {
            let mut kt = KtHeader::default();
            kt.pr_offset = data_at as u64;
            kt.pr_count = pr.len() as u64;
            for runtime in pr.iter() {
                bytes[data_at..data_at + std::mem::size_of::<ProcessRuntime>()]
                    .copy_from_slice(zerocopy::AsBytes::as_bytes(runtime));
                data_at += std::mem::size_of::<ProcessRuntime>();
            }
            bytes[header_at..header_at + std::mem::size_of::<KtHeader>()]
                .copy_from_slice(zerocopy::AsBytes::as_bytes(&kt));
            header_at += std::mem::size_of::<KtHeader>();
        }
        debug_assert_eq!(data_at as u64, frame_size);
        drop(map);

        // advance and page-pad the cursor; the header alloc already counted
        // its own bytes
        let header = self.header_mut();
        header.bytes += frame_size - FRAME_HEADER_SIZE as u64;
        header.bytes = page_align(header.bytes, PAGE_SIZE);
        Ok(())
    }

    fn swap_worker_frames(&mut self) {
        for frame in self.shared.worker_frames.iter() {
            let mut buffers = frame.buffers.lock();
            debug_assert!(
                buffers.stack.len() == 1,
                "profile scopes still open at the frame boundary"
            );
            // records exclude the stub at index 0
            let completed: Vec<LwProfile> = buffers.build[1..].to_vec();
            buffers.completed = completed;
            buffers.reset_build();
        }
    }

    /// Frame boundary: swap build buffers, fold in kernel traces, write the
    /// completed frame, then open the next one.
    pub fn new_frame(&mut self, ns_time: u64, tsc_time: u64) -> Result<()> {
        if self.stopped {
            return Ok(());
        }

        self.swap_worker_frames();
        self.gather_kernel_profiles();
        self.write_completed_frame()?;
        self.alloc_headers_in_frame(ns_time, tsc_time)?;
        if !self.stopped {
            self.frame_counter += 1;
        }
        Ok(())
    }

    /// Final boundary: write the last frame's payload, patch its end times
    /// and release every mapping.
    pub fn shutdown(mut self, ns_time: u64, tsc_time: u64) -> Result<()> {
        if !self.stopped {
            self.swap_worker_frames();
            self.gather_kernel_profiles();
            self.write_completed_frame()?;
            if let Some(mut prev) = self.branch_frame.take() {
                let disk = prev.as_mut::<FrameHeaderDisk>();
                disk.ns_end = ns_time;
                disk.tsc_end = tsc_time;
            }
        }
        self.branch_l2 = None;
        self.branch_l3 = None;
        self.branch_frame = None;
        debug!("profiler offline after {} frame(s)", self.frame_counter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::KaspfReader;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("kiln-kaspf-{}-{}.kaspf", tag, std::process::id()))
    }

    #[test]
    fn task_ids_are_assigned_once_per_site() {
        let path = temp_path("ids");
        let profiler = KasProfiler::create(&path, ProfilerConfig::default(), None).unwrap();
        let shared = profiler.shared().clone();
        shared.register_worker_thread(0);

        static SITE_A: AtomicU32 = AtomicU32::new(u32::MAX);
        static SITE_B: AtomicU32 = AtomicU32::new(u32::MAX);
        let a0 = shared.resolve_task_id(&SITE_A, "frame", SYSTEM_RENDER);
        let a1 = shared.resolve_task_id(&SITE_A, "frame", SYSTEM_RENDER);
        let b = shared.resolve_task_id(&SITE_B, "solve", SYSTEM_UI);
        assert_eq!(a0, a1);
        assert_ne!(a0, b);
        assert_eq!(shared.task_label(a0), "frame");
        assert_eq!(shared.task_label(b), "solve");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn scope_records_nest_by_parent() {
        let path = temp_path("nest");
        let profiler = KasProfiler::create(&path, ProfilerConfig::default(), None).unwrap();
        let shared = profiler.shared().clone();
        shared.register_worker_thread(0);

        {
            profile_scope!(&shared, "outer", SYSTEM_NONE);
            {
                profile_scope!(&shared, "inner_a", SYSTEM_NONE);
            }
            {
                profile_scope!(&shared, "inner_b", SYSTEM_NONE);
            }
        }

        let buffers = shared.worker_frames[0].buffers.lock();
        // stub + outer + two inners
        assert_eq!(buffers.build.len(), 4);
        assert_eq!(buffers.build[1].parent, 0);
        assert_eq!(buffers.build[2].parent, 1);
        assert_eq!(buffers.build[3].parent, 1);
        assert!(buffers.build[1].tsc_end >= buffers.build[1].tsc_start);
        assert_eq!(buffers.stack.len(), 1);
        drop(buffers);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn profile_round_trips_through_the_file() {
        let path = temp_path("round-trip");
        let mut profiler =
            KasProfiler::create(&path, ProfilerConfig::default(), None).unwrap();
        let shared = profiler.shared().clone();
        shared.register_worker_thread(0);

        // open the first frame
        profiler.new_frame(1_000, 10_000).unwrap();

        // frame 1 content: one parent task with two children
        {
            profile_scope!(&shared, "parent", SYSTEM_RENDER);
            {
                profile_scope!(&shared, "child_a", SYSTEM_RENDER);
            }
            {
                profile_scope!(&shared, "child_b", SYSTEM_RENDER);
            }
        }
        profiler.new_frame(2_000, 20_000).unwrap();

        // frame 2 content, then flush through shutdown
        {
            profile_scope!(&shared, "parent", SYSTEM_RENDER);
        }
        profiler.shutdown(3_000, 30_000).unwrap();

        let mut reader = KaspfReader::open(&path).unwrap();
        assert_eq!(reader.frame_count(), 2);

        reader.set_fixed(1_000, 2_000);
        reader.process().unwrap();
        let frames = reader.frames();
        assert!(!frames.is_empty());

        // frame 0 spans [1000, 2000] and carries parent + two children
        let frame = frames.iter().find(|f| f.frame == 0).expect("frame 0");
        assert_eq!(frame.ns_start, 1_000);
        assert_eq!(frame.ns_end, 2_000);
        let profiles = &frame.workers[0].profiles;
        assert_eq!(profiles.len(), 3);
        assert_eq!(profiles[0].parent, None);
        assert_eq!(profiles[1].parent, Some(0));
        assert_eq!(profiles[2].parent, Some(0));
        // start times are monotonically non-decreasing in record order
        assert!(profiles[0].ns_start <= profiles[1].ns_start);
        assert!(profiles[1].ns_start <= profiles[2].ns_start);
        assert_eq!(profiles[0].depth, 0);
        assert_eq!(profiles[1].depth, 1);

        // frame 1 carries the single parent scope
        let frame = frames.iter().find(|f| f.frame == 1).expect("frame 1");
        assert_eq!(frame.workers[0].profiles.len(), 1);
        let _ = std::fs::remove_file(&path);
    }
}
