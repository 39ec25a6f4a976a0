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

//! Headless editor runtime: the full core loop without a window or GPU.
//! Useful for soak-testing the pipeline and producing profile captures;
//! the platform front end drives the very same sequence per frame.

use anyhow::Result;
use editor::Editor;
use log::info;
use profiler::{KasProfiler, ProfileLevel, ProfilerConfig, SYSTEM_EDITOR, SYSTEM_RENDER, SYSTEM_UI};
use std::{path::PathBuf, sync::Arc, time::Duration};
use structopt::StructOpt;
use task::TaskContext;
use timebase::Timebase;
use ui::{InputSnapshot, Ui, UiVisual};

#[derive(Debug, StructOpt)]
#[structopt(name = "kiln", about = "Interactive 3D level editor core, headless.")]
struct Opt {
    /// Worker threads, main thread included.
    #[structopt(short, long, default_value = "4")]
    workers: u32,

    /// Frames to simulate before exiting.
    #[structopt(short, long, default_value = "600")]
    frames: u64,

    /// Frame cadence in nanoseconds.
    #[structopt(long, default_value = "16666667")]
    ns_tick: u64,

    /// Where to write the profile capture.
    #[structopt(short, long, default_value = "kiln.kaspf")]
    profile: PathBuf,

    /// Record kernel scheduling traces when a tracer is available.
    #[structopt(long)]
    kernel_profile: bool,
}

fn seed_demo_level(editor: &mut Editor) {
    for line in [
        "collision_box_add floor 20 0.5 20",
        "collision_sphere_add ball 1.0",
        "collision_capsule_add pillar 2.0 0.5",
        "render_mesh_add floor_mesh floor",
        "render_mesh_add ball_mesh ball",
        "render_mesh_add pillar_mesh pillar",
        "rb_prefab_add ball_rb ball 1.0 0.6 0.4 1",
        "led_node_add floor_1",
        "led_node_set_proxy3d floor_1 floor_mesh 0.4 0.4 0.45 1 0",
        "led_node_add ball_1",
        "led_node_set_position ball_1 0 5 0",
        "led_node_set_proxy3d ball_1 ball_mesh 0.9 0.2 0.2 1 0",
        "led_node_set_rb_prefab ball_1 ball_rb",
        "led_node_add pillar_1",
        "led_node_set_position pillar_1 3 2 0",
        "led_node_set_proxy3d pillar_1 pillar_mesh 0.2 0.6 0.9 1 0",
    ] {
        editor.dispatch_line(line, 0);
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let timebase = Timebase::new();

    let profiler_config = ProfilerConfig {
        worker_count: opt.workers,
        rdtsc_freq: timebase.tsc_frequency(),
        level: if opt.kernel_profile {
            ProfileLevel::Kernel
        } else {
            ProfileLevel::Task
        },
        ..Default::default()
    };
    // no privileged tracer is wired up in the headless build; the profiler
    // downgrades to task level on its own
    let mut kas = KasProfiler::create(&opt.profile, profiler_config, None)?;
    let shared = kas.shared().clone();
    shared.register_worker_thread(0);

    let worker_shared = shared.clone();
    let worker_init: task::WorkerInit = Some(Arc::new(move |worker| {
        worker_shared.register_worker_thread(worker)
    }));
    let (tasks, mut main_worker) = TaskContext::new(opt.workers, worker_init)?;

    let mut editor = Editor::new()?;
    let mut ui_state = Ui::new(Vec::new(), Vec::new())?;
    let visual = UiVisual::default();
    seed_demo_level(&mut editor);

    info!(
        "running {} frame(s) at {} ns with {} worker(s)",
        opt.frames, opt.ns_tick, opt.workers
    );
    let mut console = ui::widgets::Console {
        visible: true,
        ..Default::default()
    };

    for frame in 0..opt.frames {
        let ns_now = timebase.ns_now();
        kas.new_frame(ns_now, timebase.tsc_now())?;

        {
            profiler::profile_scope!(&shared, "ui_build", SYSTEM_UI);
            ui_state.frame_begin([1280.0, 720.0], &visual, InputSnapshot::default(), ns_now);
            if let Some(line) = ui::widgets::console(&mut ui_state, &mut console, "main") {
                editor.dispatch_line(&line, ns_now);
            }
            ui_state.frame_end();
        }

        {
            profiler::profile_scope!(&shared, "render_frame", SYSTEM_RENDER);
            editor.render_frame(Some(&ui_state), ns_now);
        }

        {
            profiler::profile_scope!(&shared, "frame_idle", SYSTEM_EDITOR);
            tasks.run_available(&mut main_worker);
            tasks.frame_clear();
        }

        // hold the cadence; a platform front end would block on vsync here
        let elapsed = timebase.ns_now() - ns_now;
        if elapsed < opt.ns_tick {
            std::thread::sleep(Duration::from_nanos(opt.ns_tick - elapsed));
        }
        if frame % 120 == 0 {
            info!(
                "frame {}: {} command(s), {} bucket(s)",
                frame,
                editor.scene.commands().len(),
                editor.scene.buckets().len()
            );
        }
    }

    kas.shutdown(timebase.ns_now(), timebase.tsc_now())?;
    tasks.shutdown();
    info!("clean exit");
    Ok(())
}
