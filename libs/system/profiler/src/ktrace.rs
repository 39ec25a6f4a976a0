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

//! Kernel scheduling-trace ingest.
//!
//! A [KernelTraceSource] hands over per-CPU schedule events collected since
//! the previous frame; pairing switch events yields one [ProcessRuntime]
//! per online span. Platforms without a privileged tracer simply provide no
//! source and the profiler stays at task-level granularity.

use crate::format::{
    ProcessRuntime, WorkerActivity, PROCESS_NON_WAKING, PROCESS_RUNNING,
};

#[derive(Clone, Copy, Debug)]
pub struct ScheduleWaking {
    pub ns_time: u64,
    pub pid: i32,
    pub cpu: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct ScheduleSwitch {
    pub ns_time: u64,
    /// Scheduler state of the task being switched out (PROCESS_*).
    pub state_prev: u32,
    pub pid_prev: i32,
    pub pid_next: i32,
    pub process_prev: [u8; 16],
    pub process_next: [u8; 16],
    pub cpu: u32,
}

#[derive(Clone, Copy, Debug)]
pub enum SchedEvent {
    Waking(ScheduleWaking),
    Switch(ScheduleSwitch),
}

impl SchedEvent {
    pub fn ns_time(&self) -> u64 {
        match self {
            Self::Waking(w) => w.ns_time,
            Self::Switch(s) => s.ns_time,
        }
    }
}

/// Producer side of the per-CPU single-producer/single-consumer event
/// rings. The profiler drains every ring once per frame on the main
/// thread.
pub trait KernelTraceSource: Send {
    fn cpu_count(&self) -> u32;
    /// Move all events recorded on `cpu` since the last drain into `out`,
    /// in time order.
    fn drain(&mut self, cpu: u32, out: &mut Vec<SchedEvent>);
}

/// Per-CPU pairing state carried across frames: a span that has not closed
/// by the frame boundary belongs to the next frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuIngestState {
    current_pid: i32,
    current_online_start: u64,
    current_waking_ns: u64,
    current_has_waking: bool,
    pending_wake_pid: i32,
    pending_wake_ns: u64,
    has_current: bool,
    has_pending_wake: bool,
}

/// Fold one CPU's events into finished runtimes. `worker_pids` identifies
/// worker threads; their spans are mirrored into `activity`.
pub fn ingest_cpu_events(
    state: &mut CpuIngestState,
    events: &[SchedEvent],
    worker_pids: &[i32],
    runtimes: &mut Vec<ProcessRuntime>,
    activity: &mut [Vec<WorkerActivity>],
) {
    for event in events {
        match event {
            SchedEvent::Waking(waking) => {
                state.pending_wake_pid = waking.pid;
                state.pending_wake_ns = waking.ns_time;
                state.has_pending_wake = true;
            }
            SchedEvent::Switch(switch) => {
                if state.has_current && state.current_pid == switch.pid_prev {
                    let runtime = ProcessRuntime {
                        waking_start_ns: if state.current_has_waking {
                            state.current_waking_ns
                        } else {
                            PROCESS_NON_WAKING
                        },
                        online_start_ns: state.current_online_start,
                        online_end_ns: switch.ns_time,
                        pid: switch.pid_prev,
                        state_end: switch.state_prev,
                        process: switch.process_prev,
                    };
                    runtimes.push(runtime);

                    if let Some(worker) =
                        worker_pids.iter().position(|&pid| pid == switch.pid_prev)
                    {
                        activity[worker].push(WorkerActivity {
                            ns_start: state.current_online_start,
                            ns_end: switch.ns_time,
                            process_state: PROCESS_RUNNING,
                            _pad: 0,
                        });
                    }
                }

                state.current_pid = switch.pid_next;
                state.current_online_start = switch.ns_time;
                state.has_current = true;

                // a pending wake-up belongs to the span it started
                state.current_has_waking =
                    state.has_pending_wake && state.pending_wake_pid == switch.pid_next;
                state.current_waking_ns = state.pending_wake_ns;
                state.has_pending_wake = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(tag: &str) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..tag.len()].copy_from_slice(tag.as_bytes());
        out
    }

    fn switch(ns: u64, prev: i32, next: i32) -> SchedEvent {
        SchedEvent::Switch(ScheduleSwitch {
            ns_time: ns,
            state_prev: crate::format::PROCESS_SLEEPING,
            pid_prev: prev,
            pid_next: next,
            process_prev: name("prev"),
            process_next: name("next"),
            cpu: 0,
        })
    }

    #[test]
    fn switch_pairs_become_runtimes() {
        let mut state = CpuIngestState::default();
        let mut runtimes = Vec::new();
        let mut activity = vec![Vec::new()];

        let events = [
            switch(100, 10, 20), // 20 goes online at 100
            switch(250, 20, 30), // 20 ran [100, 250]
            switch(400, 30, 20),
            switch(900, 20, 10), // 20 ran [400, 900]
        ];
        ingest_cpu_events(&mut state, &events, &[], &mut runtimes, &mut activity);

        assert_eq!(runtimes.len(), 3);
        assert_eq!(runtimes[0].pid, 20);
        assert_eq!(runtimes[0].online_start_ns, 100);
        assert_eq!(runtimes[0].online_end_ns, 250);
        assert_eq!(runtimes[2].pid, 20);
        assert_eq!(runtimes[2].online_start_ns, 400);
        assert_eq!(runtimes[2].online_end_ns, 900);
    }

    #[test]
    fn open_span_carries_into_the_next_frame() {
        let mut state = CpuIngestState::default();
        let mut runtimes = Vec::new();
        let mut activity = vec![Vec::new()];

        ingest_cpu_events(
            &mut state,
            &[switch(100, 1, 2)],
            &[],
            &mut runtimes,
            &mut activity,
        );
        assert!(runtimes.is_empty());

        // the span closes in the next frame's drain
        ingest_cpu_events(
            &mut state,
            &[switch(300, 2, 1)],
            &[],
            &mut runtimes,
            &mut activity,
        );
        assert_eq!(runtimes.len(), 1);
        assert_eq!(runtimes[0].online_start_ns, 100);
        assert_eq!(runtimes[0].online_end_ns, 300);
    }

    #[test]
    fn worker_spans_mirror_into_activity() {
        let mut state = CpuIngestState::default();
        let mut runtimes = Vec::new();
        let mut activity = vec![Vec::new(), Vec::new()];

        let events = [switch(10, 0, 77), switch(60, 77, 0)];
        ingest_cpu_events(&mut state, &events, &[55, 77], &mut runtimes, &mut activity);

        assert!(activity[0].is_empty());
        assert_eq!(activity[1].len(), 1);
        assert_eq!(activity[1][0].ns_start, 10);
        assert_eq!(activity[1][0].ns_end, 60);
    }
}
