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

//! Level-editor front end: the string-keyed node, collision-shape,
//! rigid-body-prefab and render-mesh databases, the console command
//! surface over them, and the per-frame glue that feeds the scene
//! pipeline. The physics solver is a black box; its per-body snapshots
//! and events arrive through [Editor::apply_body_snapshots] and
//! [Editor::drain_events].

mod command;

pub use crate::command::{Command, CommandRegistry, CommandSpec};

use arena::Arena;
use log::{info, warn};
use mesh::{Dcel, RMesh, TriMesh};
use namedb::{NameDb, STUB_INDEX};
use nalgebra::{UnitQuaternion, Vector3, Vector4};
use proxy3d::{ProxyConfig, ProxyForest};
use scene::{CmdKey, FrameContext, Scene};
use ui::Ui;

pub const NODE_NONE: u32 = u32::MAX;

/// One placed editor object.
#[derive(Clone, Debug)]
pub struct LedNode {
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    /// Proxy handle, or NODE_NONE while the node has no visual.
    pub proxy: u32,
    /// Rigid-body prefab handle (referenced), STUB when not a physics
    /// instance.
    pub prefab: u32,
}

impl Default for LedNode {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            proxy: NODE_NONE,
            prefab: STUB_INDEX,
        }
    }
}

/// Collision shape descriptors consumed by the physics solver and the
/// render-mesh builder.
#[derive(Clone, Debug)]
pub enum CollisionShape {
    Box { half: Vector3<f32> },
    Sphere { radius: f32 },
    Capsule { half_height: f32, radius: f32 },
    Hull(Dcel),
    TriMesh(TriMesh),
}

impl Default for CollisionShape {
    fn default() -> Self {
        Self::Box {
            half: Vector3::new(0.5, 0.5, 0.5),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RigidBodyPrefab {
    /// Referenced collision-shape handle.
    pub shape: u32,
    pub density: f32,
    pub restitution: f32,
    pub friction: f32,
    pub dynamic: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Editing,
    Compiling,
    Running,
    Paused,
}

/// Solver output for one body, sampled once per physics tick.
#[derive(Clone, Copy, Debug)]
pub struct BodySnapshot {
    /// Node database handle the body belongs to.
    pub node: u32,
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub linear_velocity: Vector3<f32>,
    pub angular_velocity: Vector3<f32>,
    pub flags: u32,
}

#[derive(Clone, Copy, Debug)]
pub enum PhysicsEvent {
    BodyCreated { node: u32 },
    BodyDestroyed { node: u32 },
    BodySleep { node: u32 },
    BodyWake { node: u32 },
}

pub struct Editor {
    pub scene: Scene,
    pub proxies: ProxyForest,
    /// Render meshes, shared with the scene pipeline.
    pub meshes: NameDb<RMesh>,

    nodes: NameDb<LedNode>,
    shapes: NameDb<CollisionShape>,
    prefabs: NameDb<RigidBodyPrefab>,

    registry: CommandRegistry,
    run_state: RunState,
    scratch: Arena,
}

impl Editor {
    pub fn new() -> anyhow::Result<Self> {
        let mut meshes: NameDb<RMesh> = NameDb::new(1024, 1024, true);
        // slot 0 doubles as the stub mesh every failed path draws with
        meshes.get_mut(STUB_INDEX).set_stub_box();

        Ok(Self {
            scene: Scene::new()?,
            proxies: ProxyForest::new(1024),
            meshes,
            nodes: NameDb::new(1024, 1024, true),
            shapes: NameDb::new(256, 256, true),
            prefabs: NameDb::new(256, 256, true),
            registry: CommandRegistry::with_builtin_commands(),
            run_state: RunState::default(),
            scratch: Arena::with_capacity(256 * 1024)?,
        })
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn node_lookup(&self, id: &str) -> u32 {
        self.nodes.lookup(id)
    }

    pub fn node(&self, handle: u32) -> &LedNode {
        self.nodes.get(handle)
    }

    pub fn shape_lookup(&self, id: &str) -> u32 {
        self.shapes.lookup(id)
    }

    pub fn prefab_lookup(&self, id: &str) -> u32 {
        self.prefabs.lookup(id)
    }

    // ------------------------------------------------------------------
    // node database

    pub fn node_add(&mut self, id: &str) -> u32 {
        self.nodes.add(id)
    }

    pub fn node_remove(&mut self, id: &str) {
        let handle = self.nodes.lookup(id);
        if handle == STUB_INDEX {
            return;
        }
        let node = self.nodes.get(handle).clone();
        if node.proxy != NODE_NONE {
            let mut released = Vec::new();
            self.proxies
                .dealloc(&mut self.scratch, node.proxy, &mut released);
            for mesh in released {
                self.meshes.dereference(mesh);
            }
        }
        if node.prefab != STUB_INDEX {
            self.prefabs.dereference(node.prefab);
        }
        self.nodes.remove(id);
    }

    pub fn node_set_position(&mut self, id: &str, position: Vector3<f32>, ns_time: u64) {
        let handle = self.nodes.lookup(id);
        if handle == STUB_INDEX {
            warn!("node {:?} does not exist", id);
            return;
        }
        let node = self.nodes.get_mut(handle);
        node.position = position;
        let proxy = node.proxy;
        let rotation = node.rotation;
        if proxy != NODE_NONE {
            self.proxies.set_linear_speculation(
                proxy,
                position,
                rotation,
                Vector3::zeros(),
                Vector3::zeros(),
                ns_time,
            );
        }
    }

    /// Make the node a physics instance of `prefab`, if both exist.
    pub fn node_set_rb_prefab(&mut self, id: &str, prefab: &str) {
        let handle = self.nodes.lookup(id);
        if handle == STUB_INDEX {
            warn!("node {:?} does not exist", id);
            return;
        }
        let prefab_handle = self.prefabs.reference(prefab);
        if prefab_handle == STUB_INDEX {
            warn!("prefab {:?} does not exist", prefab);
            return;
        }
        let old = std::mem::replace(&mut self.nodes.get_mut(handle).prefab, prefab_handle);
        if old != STUB_INDEX {
            self.prefabs.dereference(old);
        }
    }

    /// Attach (or replace) the node's render proxy.
    pub fn node_set_proxy3d(
        &mut self,
        id: &str,
        mesh: &str,
        color: Vector4<f32>,
        blend: f32,
        ns_time: u64,
    ) {
        let handle = self.nodes.lookup(id);
        if handle == STUB_INDEX {
            warn!("node {:?} does not exist", id);
            return;
        }
        let mesh_handle = self.meshes.reference(mesh);
        if mesh_handle == STUB_INDEX {
            warn!("render mesh {:?} does not exist", mesh);
            return;
        }

        let old_proxy = self.nodes.get(handle).proxy;
        if old_proxy != NODE_NONE {
            let mut released = Vec::new();
            self.proxies
                .dealloc(&mut self.scratch, old_proxy, &mut released);
            for released_mesh in released {
                self.meshes.dereference(released_mesh);
            }
        }

        let position = self.nodes.get(handle).position;
        let rotation = self.nodes.get(handle).rotation;
        let proxy = self.proxies.alloc(&ProxyConfig {
            ns_time,
            position,
            rotation,
            color,
            blend,
            mesh: mesh_handle,
            ..Default::default()
        });
        match proxy {
            Some(proxy) => self.nodes.get_mut(handle).proxy = proxy,
            None => {
                warn!("proxy forest full; {:?} stays invisible", id);
                self.meshes.dereference(mesh_handle);
            }
        }
    }

    // ------------------------------------------------------------------
    // collision shapes and prefabs

    pub fn shape_add(&mut self, id: &str, shape: CollisionShape) -> u32 {
        let handle = self.shapes.add(id);
        if handle != STUB_INDEX {
            *self.shapes.get_mut(handle) = shape;
        }
        handle
    }

    pub fn shape_remove(&mut self, id: &str) {
        self.shapes.remove(id);
    }

    pub fn prefab_add(
        &mut self,
        id: &str,
        shape: &str,
        density: f32,
        restitution: f32,
        friction: f32,
        dynamic: bool,
    ) -> u32 {
        let shape_handle = self.shapes.reference(shape);
        if shape_handle == STUB_INDEX {
            warn!("collision shape {:?} does not exist", shape);
            return STUB_INDEX;
        }
        let handle = self.prefabs.add(id);
        if handle == STUB_INDEX {
            self.shapes.dereference(shape_handle);
            return STUB_INDEX;
        }
        *self.prefabs.get_mut(handle) = RigidBodyPrefab {
            shape: shape_handle,
            density,
            restitution,
            friction,
            dynamic,
        };
        handle
    }

    pub fn prefab_remove(&mut self, id: &str) {
        let handle = self.prefabs.lookup(id);
        if handle == STUB_INDEX {
            return;
        }
        if self.prefabs.references(handle) != 0 {
            warn!("prefab {:?} still referenced; not removed", id);
            return;
        }
        let shape = self.prefabs.get(handle).shape;
        self.shapes.dereference(shape);
        self.prefabs.remove(id);
    }

    /// Build a render mesh from a collision shape and register it under
    /// `id`.
    pub fn render_mesh_add(&mut self, id: &str, shape: &str) -> u32 {
        let shape_handle = self.shapes.lookup(shape);
        if shape_handle == STUB_INDEX {
            warn!("collision shape {:?} does not exist", shape);
            return STUB_INDEX;
        }
        let handle = self.meshes.add(id);
        if handle == STUB_INDEX {
            return STUB_INDEX;
        }
        let shape = self.shapes.get(shape_handle).clone();
        let mesh = self.meshes.get_mut(handle);
        match shape {
            CollisionShape::Box { half } => mesh.set_box(half),
            CollisionShape::Sphere { radius } => mesh.set_sphere(radius, 16),
            CollisionShape::Capsule {
                half_height,
                radius,
            } => mesh.set_capsule(half_height, radius, 8),
            CollisionShape::Hull(hull) => mesh.set_hull(&hull),
            CollisionShape::TriMesh(soup) => mesh.set_tri_mesh(&soup),
        }
        handle
    }

    pub fn render_mesh_remove(&mut self, id: &str) {
        self.meshes.remove(id);
    }

    // ------------------------------------------------------------------
    // physics ingestion

    /// Feed the solver's per-body output into the proxy forest.
    pub fn apply_body_snapshots(&mut self, snapshots: &[BodySnapshot], ns_time: u64) {
        for snapshot in snapshots {
            if !(snapshot.node != STUB_INDEX && self.nodes.is_live(snapshot.node)) {
                continue;
            }
            let node = self.nodes.get_mut(snapshot.node);
            node.position = snapshot.position;
            node.rotation = snapshot.rotation;
            let proxy = node.proxy;
            if proxy != NODE_NONE {
                self.proxies.set_linear_speculation(
                    proxy,
                    snapshot.position,
                    snapshot.rotation,
                    snapshot.linear_velocity,
                    snapshot.angular_velocity,
                    ns_time,
                );
            }
        }
    }

    pub fn drain_events(&mut self, events: &mut Vec<PhysicsEvent>) {
        for event in events.drain(..) {
            match event {
                PhysicsEvent::BodyCreated { node } | PhysicsEvent::BodyWake { node } => {
                    log::trace!("body event on node {}", node);
                }
                PhysicsEvent::BodySleep { node } => {
                    // a sleeping body stops extrapolating
                    if self.nodes.is_live(node) {
                        let data = self.nodes.get(node).clone();
                        if data.proxy != NODE_NONE {
                            self.proxies.set_linear_speculation(
                                data.proxy,
                                data.position,
                                data.rotation,
                                Vector3::zeros(),
                                Vector3::zeros(),
                                0,
                            );
                        }
                    }
                }
                PhysicsEvent::BodyDestroyed { node } => {
                    if self.nodes.is_live(node) {
                        let id = self.nodes.id_of(node).to_owned();
                        self.node_remove(&id);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // run state

    pub fn compile(&mut self) {
        if self.run_state == RunState::Editing {
            info!("compiling level");
            self.run_state = RunState::Compiling;
        }
    }

    pub fn run(&mut self) {
        match self.run_state {
            RunState::Compiling | RunState::Paused => {
                info!("running");
                self.run_state = RunState::Running;
            }
            _ => warn!("cannot run from {:?}", self.run_state),
        }
    }

    pub fn pause(&mut self) {
        if self.run_state == RunState::Running {
            self.run_state = RunState::Paused;
        }
    }

    pub fn stop(&mut self) {
        match self.run_state {
            RunState::Running | RunState::Paused | RunState::Compiling => {
                info!("back to editing");
                self.run_state = RunState::Editing;
            }
            RunState::Editing => {}
        }
    }

    // ------------------------------------------------------------------
    // console dispatch

    fn parse_f32(token: &str) -> Option<f32> {
        match token.parse::<f32>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("expected a number, got {:?}", token);
                None
            }
        }
    }

    /// Execute one committed console line.
    pub fn dispatch_line(&mut self, line: &str, ns_time: u64) {
        let Some((command, args)) = self.registry.parse(line) else {
            return;
        };
        match command {
            Command::NodeAdd => {
                self.node_add(args[0]);
            }
            Command::NodeRemove => self.node_remove(args[0]),
            Command::NodeSetPosition => {
                let (Some(x), Some(y), Some(z)) = (
                    Self::parse_f32(args[1]),
                    Self::parse_f32(args[2]),
                    Self::parse_f32(args[3]),
                ) else {
                    return;
                };
                self.node_set_position(args[0], Vector3::new(x, y, z), ns_time);
            }
            Command::NodeSetRbPrefab => self.node_set_rb_prefab(args[0], args[1]),
            Command::NodeSetProxy3d => {
                let (Some(r), Some(g), Some(b), Some(a), Some(blend)) = (
                    Self::parse_f32(args[2]),
                    Self::parse_f32(args[3]),
                    Self::parse_f32(args[4]),
                    Self::parse_f32(args[5]),
                    Self::parse_f32(args[6]),
                ) else {
                    return;
                };
                self.node_set_proxy3d(args[0], args[1], Vector4::new(r, g, b, a), blend, ns_time);
            }
            Command::CollisionShapeRemove => self.shape_remove(args[0]),
            Command::CollisionBoxAdd => {
                let (Some(x), Some(y), Some(z)) = (
                    Self::parse_f32(args[1]),
                    Self::parse_f32(args[2]),
                    Self::parse_f32(args[3]),
                ) else {
                    return;
                };
                self.shape_add(
                    args[0],
                    CollisionShape::Box {
                        half: Vector3::new(x, y, z),
                    },
                );
            }
            Command::CollisionSphereAdd => {
                let Some(radius) = Self::parse_f32(args[1]) else {
                    return;
                };
                self.shape_add(args[0], CollisionShape::Sphere { radius });
            }
            Command::CollisionCapsuleAdd => {
                let (Some(half_height), Some(radius)) =
                    (Self::parse_f32(args[1]), Self::parse_f32(args[2]))
                else {
                    return;
                };
                self.shape_add(
                    args[0],
                    CollisionShape::Capsule {
                        half_height,
                        radius,
                    },
                );
            }
            Command::RbPrefabAdd => {
                let (Some(density), Some(restitution), Some(friction)) = (
                    Self::parse_f32(args[2]),
                    Self::parse_f32(args[3]),
                    Self::parse_f32(args[4]),
                ) else {
                    return;
                };
                let dynamic = args[5] != "0";
                self.prefab_add(args[0], args[1], density, restitution, friction, dynamic);
            }
            Command::RbPrefabRemove => self.prefab_remove(args[0]),
            Command::RenderMeshAdd => {
                self.render_mesh_add(args[0], args[1]);
            }
            Command::RenderMeshRemove => self.render_mesh_remove(args[0]),
            Command::Compile => self.compile(),
            Command::Run => self.run(),
            Command::Pause => self.pause(),
            Command::Stop => self.stop(),
        }
    }

    // ------------------------------------------------------------------
    // frame glue

    /// One render frame: speculate the proxy forest, register every placed
    /// node plus the UI's buckets, then run the pipeline.
    pub fn render_frame(&mut self, ui_state: Option<&Ui>, ns_time: u64) {
        self.proxies.speculate(&mut self.scratch, ns_time);
        self.scene.frame_begin();

        let submissions: Vec<(u32, CmdKey)> = self
            .nodes
            .iter()
            .filter(|(_, _, node)| node.proxy != NODE_NONE)
            .map(|(handle, _, node)| {
                // without a camera the editor orders meshes by database
                // handle; deeper handles draw later
                let depth = scene::DEPTH_MAX - (handle as u64).min(scene::DEPTH_MAX);
                let mesh = self.proxies.get(node.proxy).mesh as u64;
                let key = CmdKey::new(
                    scene::SCREEN_LAYER_GAME,
                    depth,
                    scene::TRANSPARENCY_OPAQUE,
                    scene::material(scene::PROGRAM_PROXY3D, mesh, 0),
                    scene::PRIMITIVE_TRIANGLE,
                    scene::INSTANCED,
                    scene::ELEMENTS,
                );
                (node.proxy, key)
            })
            .collect();
        for (proxy, key) in submissions {
            self.scene.instance_add(proxy, key);
        }

        if let Some(ui_state) = ui_state {
            self.scene.submit_ui(ui_state);
        }

        let ctx = FrameContext {
            proxies: &self.proxies,
            meshes: &self.meshes,
            ui: ui_state,
        };
        self.scene.frame_end(&ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn editor() -> Editor {
        Editor::new().unwrap()
    }

    #[test]
    fn shape_prefab_mesh_chain_through_console() {
        let mut ed = editor();
        ed.dispatch_line("collision_sphere_add ball 2.0", 0);
        ed.dispatch_line("rb_prefab_add ball_rb ball 1.0 0.4 0.7 1", 0);
        ed.dispatch_line("render_mesh_add ball_mesh ball", 0);

        let shape = ed.shape_lookup("ball");
        assert_ne!(shape, STUB_INDEX);
        assert!(matches!(
            ed.shapes.get(shape),
            CollisionShape::Sphere { radius } if *radius == 2.0
        ));
        assert_ne!(ed.prefab_lookup("ball_rb"), STUB_INDEX);
        let mesh = ed.meshes.lookup("ball_mesh");
        assert_ne!(mesh, STUB_INDEX);
        assert!(ed.meshes.get(mesh).vertex_count() > 0);

        // the prefab holds a shape reference: removal is a no-op
        ed.dispatch_line("collision_shape_remove ball", 0);
        assert_ne!(ed.shape_lookup("ball"), STUB_INDEX);

        // dropping the prefab releases the shape
        ed.dispatch_line("rb_prefab_remove ball_rb", 0);
        ed.dispatch_line("collision_shape_remove ball", 0);
        assert_eq!(ed.shape_lookup("ball"), STUB_INDEX);
    }

    #[test]
    fn node_with_proxy_draws_and_removes_cleanly() {
        let mut ed = editor();
        ed.dispatch_line("collision_box_add crate 0.5 0.5 0.5", 0);
        ed.dispatch_line("render_mesh_add crate_mesh crate", 0);
        ed.dispatch_line("led_node_add box_1", 0);
        ed.dispatch_line("led_node_set_position box_1 1 2 3", 0);
        ed.dispatch_line("led_node_set_proxy3d box_1 crate_mesh 1 0 0 1 0.5", 0);

        let node = ed.node_lookup("box_1");
        assert_ne!(node, STUB_INDEX);
        let proxy = ed.node(node).proxy;
        assert_ne!(proxy, NODE_NONE);
        assert_relative_eq!(ed.proxies.get(proxy).position.x, 1.0);

        ed.render_frame(None, 0);
        assert_eq!(ed.scene.commands().len(), 1);

        // mesh is referenced by the proxy: removal refuses
        let mesh = ed.meshes.lookup("crate_mesh");
        ed.dispatch_line("render_mesh_remove crate_mesh", 0);
        assert_eq!(ed.meshes.lookup("crate_mesh"), mesh);

        ed.dispatch_line("led_node_remove box_1", 0);
        assert_eq!(ed.node_lookup("box_1"), STUB_INDEX);
        assert_eq!(ed.proxies.count(), 0);
        ed.dispatch_line("render_mesh_remove crate_mesh", 0);
        assert_eq!(ed.meshes.lookup("crate_mesh"), STUB_INDEX);

        // next frame the stale instance is pruned
        ed.render_frame(None, 16_000_000);
        assert_eq!(ed.scene.commands().len(), 0);
    }

    #[test]
    fn body_snapshots_drive_proxy_speculation() {
        let mut ed = editor();
        ed.dispatch_line("collision_sphere_add s 1.0", 0);
        ed.dispatch_line("render_mesh_add s_mesh s", 0);
        ed.dispatch_line("led_node_add n", 0);
        ed.dispatch_line("led_node_set_proxy3d n s_mesh 1 1 1 1 0.0", 0);

        let node = ed.node_lookup("n");
        let snapshot = BodySnapshot {
            node,
            position: Vector3::new(0.0, 10.0, 0.0),
            rotation: UnitQuaternion::identity(),
            linear_velocity: Vector3::new(0.0, -9.8, 0.0),
            angular_velocity: Vector3::zeros(),
            flags: 0,
        };
        ed.apply_body_snapshots(&[snapshot], 1_000_000_000);

        // half a second later the proxy has fallen
        ed.render_frame(None, 1_500_000_000);
        let proxy = ed.node(node).proxy;
        assert_relative_eq!(
            ed.proxies.get(proxy).spec_position.y,
            10.0 - 9.8 * 0.5,
            epsilon = 1e-3
        );
    }

    #[test]
    fn run_state_machine() {
        let mut ed = editor();
        assert_eq!(ed.run_state(), RunState::Editing);
        ed.run();
        assert_eq!(ed.run_state(), RunState::Editing);
        ed.compile();
        assert_eq!(ed.run_state(), RunState::Compiling);
        ed.run();
        assert_eq!(ed.run_state(), RunState::Running);
        ed.pause();
        assert_eq!(ed.run_state(), RunState::Paused);
        ed.run();
        assert_eq!(ed.run_state(), RunState::Running);
        ed.stop();
        assert_eq!(ed.run_state(), RunState::Editing);
    }
}
