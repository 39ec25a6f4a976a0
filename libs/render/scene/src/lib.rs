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

//! Per-frame draw command pipeline.
//!
//! The scene is partially immediate: every frame callers register the units
//! they want drawn with a sort key. Instances registered in earlier frames
//! cache their command; only new or re-keyed commands are sorted (merge
//! sort), then merged with the still-sorted cache while untouched instances
//! are pruned. The sorted command array is cut into buckets wherever a
//! draw-state field of the key changes, buckets are cut into buffers at
//! hardware limits, and each buffer's vertex/index/instance bytes land
//! contiguously in one of two frame arenas rotating on frame parity.

mod key;

pub use crate::key::*;

use arena::Arena;
use containers::{ChainMap, Pool, HASH_NULL, INDEX_NONE};
use log::warn;
use mesh::RMesh;
use namedb::NameDb;
use proxy3d::ProxyForest;
use static_assertions::const_assert_eq;
use std::sync::Arc;
use ui::Ui;
use zerocopy::AsBytes;

pub const FRAME_ARENA_BYTES: usize = 64 * 1024 * 1024;

/// Per-instance shared record of a proxy3d draw.
#[repr(C)]
#[derive(AsBytes, Clone, Copy, Debug, Default)]
pub struct ProxyShared {
    /// xyz = speculative translation, w = color/texture blend
    pub translation_blend: [f32; 4],
    pub rotation: [f32; 4],
    pub color: [f32; 4],
}

pub const PROXY_SHARED_STRIDE: usize = std::mem::size_of::<ProxyShared>();
const_assert_eq!(PROXY_SHARED_STRIDE, 48);

/// Buffer splitting limits.
const BUFFER_INSTANCE_MAX: u32 = 1 << 20;
const BUFFER_LOCAL_BYTES_MAX: u64 = 48 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default)]
pub struct RCommand {
    pub key: CmdKey,
    pub instance: u32,
}

/// What a registered instance draws.
#[derive(Clone, Debug, Default)]
pub enum InstanceUnit {
    #[default]
    None,
    /// Proxy handle in the forest; cached across frames.
    Proxy(u32),
    /// UI draw bucket index, valid for this frame only.
    UiBucket(u32),
    /// Frame-local raw mesh.
    Mesh(Arc<RMesh>),
}

#[derive(Clone, Debug, Default)]
pub struct Instance {
    pub frame_last_touched: u64,
    /// Frame at which the current key was issued; a cache entry whose
    /// instance renewed this frame has been superseded by a new command.
    renewed_frame: u64,
    pub key: CmdKey,
    pub unit: InstanceUnit,
    /// Index of this instance's command in `cmd_frame`, bound by
    /// `frame_end`.
    pub cmd_slot: u32,
    next_new: u32,
}

/// Where a buffer's bytes live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DataRef {
    #[default]
    None,
    /// Span in the current frame arena.
    Frame {
        offset: usize,
        len: usize,
    },
    /// The vertex bytes of a mesh-database entry.
    MeshVertices(u32),
    /// The index array of a mesh-database entry.
    MeshIndices(u32),
}

#[derive(Clone, Debug, Default)]
pub struct RBuffer {
    pub c_l: u32,
    pub c_h: u32,
    pub local_size: u64,
    pub shared_size: u64,
    pub index_count: u32,
    pub instance_count: u32,
    pub shared: DataRef,
    pub local: DataRef,
    pub index: DataRef,
}

/// Consecutive commands drawable in one draw call.
#[derive(Clone, Debug, Default)]
pub struct RBucket {
    pub c_l: u32,
    pub c_h: u32,
    pub screen_layer: u64,
    pub transparency: u64,
    pub material: u64,
    pub primitive: u64,
    pub instanced: u64,
    pub elements: u64,
    pub buffers: Vec<RBuffer>,
}

/// Read access the pipeline needs while ending a frame.
pub struct FrameContext<'a> {
    pub proxies: &'a ProxyForest,
    pub meshes: &'a NameDb<RMesh>,
    pub ui: Option<&'a Ui>,
}

pub struct Scene {
    frame: u64,
    mem_frame: [Arena; 2],

    instances: Pool<Instance>,
    unit_map: ChainMap,
    instance_new_first: u32,

    cmd_cache: Vec<RCommand>,
    cmd_frame: Vec<RCommand>,
    cmd_new_count: u32,
    cmd_frame_count: u32,

    buckets: Vec<RBucket>,
}

impl Scene {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_frame_capacity(FRAME_ARENA_BYTES)
    }

    pub fn with_frame_capacity(bytes: usize) -> anyhow::Result<Self> {
        Ok(Self {
            frame: 0,
            mem_frame: [Arena::with_capacity(bytes)?, Arena::with_capacity(bytes)?],
            instances: Pool::new(4096, true),
            unit_map: ChainMap::new(4096, 4096, true),
            instance_new_first: INDEX_NONE,
            cmd_cache: Vec::new(),
            cmd_frame: Vec::new(),
            cmd_new_count: 0,
            cmd_frame_count: 0,
            buckets: Vec::new(),
        })
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn instance_count(&self) -> u32 {
        self.instances.count()
    }

    pub fn commands(&self) -> &[RCommand] {
        &self.cmd_frame
    }

    pub fn buckets(&self) -> &[RBucket] {
        &self.buckets
    }

    pub fn instance(&self, index: u32) -> &Instance {
        self.instances.get(index)
    }

    pub fn proxy_instance(&self, unit: u32) -> Option<u32> {
        let mut at = self.unit_map.first(unit);
        while at != HASH_NULL {
            if matches!(self.instances.get(at).unit, InstanceUnit::Proxy(u) if u == unit) {
                return Some(at);
            }
            at = self.unit_map.next(at);
        }
        None
    }

    fn frame_arena(&self) -> &Arena {
        &self.mem_frame[(self.frame & 1) as usize]
    }

    /// Resolve a frame-local [DataRef] to its bytes.
    pub fn frame_bytes(&self, data: &DataRef) -> Option<&[u8]> {
        match *data {
            DataRef::Frame { offset, len } => Some(self.frame_arena().bytes(offset, len)),
            _ => None,
        }
    }

    /// Rotate frame arenas and recycle last frame's command array as the
    /// cache.
    pub fn frame_begin(&mut self) {
        self.frame += 1;
        self.mem_frame[(self.frame & 1) as usize].flush();

        self.instance_new_first = INDEX_NONE;
        self.cmd_new_count = 0;
        self.cmd_cache = std::mem::take(&mut self.cmd_frame);
        self.cmd_frame_count = 0;
        self.buckets.clear();
    }

    fn link_new(&mut self, index: u32) {
        let head = self.instance_new_first;
        self.instances.get_mut(index).next_new = head;
        self.instance_new_first = index;
        self.cmd_new_count += 1;
    }

    /// Register a proxy unit for this frame. Cached: when the key is
    /// unchanged since the last registration the existing command is
    /// reused untouched.
    pub fn instance_add(&mut self, unit: u32, key: CmdKey) -> u32 {
        if let Some(index) = self.proxy_instance(unit) {
            debug_assert_ne!(
                self.instances.get(index).frame_last_touched,
                self.frame,
                "unit registered twice in one frame"
            );
            if self.instances.get(index).key != key {
                let instance = self.instances.get_mut(index);
                instance.key = key;
                instance.renewed_frame = self.frame;
                self.link_new(index);
            }
            let instance = self.instances.get_mut(index);
            instance.frame_last_touched = self.frame;
            self.cmd_frame_count += 1;
            return index;
        }

        let index = match self.instances.reserve() {
            Some(index) => index,
            None => {
                warn!("scene instance pool exhausted");
                return INDEX_NONE;
            }
        };
        self.unit_map.add(unit, index);
        {
            let instance = self.instances.get_mut(index);
            instance.unit = InstanceUnit::Proxy(unit);
            instance.key = key;
            instance.renewed_frame = self.frame;
            instance.frame_last_touched = self.frame;
        }
        self.link_new(index);
        self.cmd_frame_count += 1;
        index
    }

    /// Register a unit that lives for this frame only (no cache entry).
    fn instance_add_non_cached(&mut self, unit: InstanceUnit, key: CmdKey) -> u32 {
        let index = match self.instances.reserve() {
            Some(index) => index,
            None => {
                warn!("scene instance pool exhausted");
                return INDEX_NONE;
            }
        };
        {
            let instance = self.instances.get_mut(index);
            instance.unit = unit;
            instance.key = key;
            instance.renewed_frame = self.frame;
            instance.frame_last_touched = self.frame;
        }
        self.link_new(index);
        self.cmd_frame_count += 1;
        index
    }

    pub fn instance_add_mesh(&mut self, mesh: Arc<RMesh>, key: CmdKey) -> u32 {
        self.instance_add_non_cached(InstanceUnit::Mesh(mesh), key)
    }

    /// Register every UI draw bucket of the finished `ui` frame. Bucket
    /// depth is flipped into the command key's depth field: deeper UI draws
    /// later, while larger scene keys draw earlier.
    pub fn submit_ui(&mut self, ui_state: &Ui) {
        for (bucket_index, bucket) in ui_state.buckets().iter().enumerate() {
            if bucket.count == 0 {
                continue;
            }
            let ui_depth = ui::ui_cmd_depth(bucket.cmd) as u64;
            let layer = ui::ui_cmd_layer(bucket.cmd) as u64;
            let texture = ui::ui_cmd_texture(bucket.cmd) as u64;
            let depth = DEPTH_MAX - (ui_depth << ui::UI_CMD_LAYER_BITS) + layer;
            let key = CmdKey::new(
                SCREEN_LAYER_HUD,
                depth,
                TRANSPARENCY_ADDITIVE,
                material(PROGRAM_UI, MESH_NONE, texture),
                PRIMITIVE_TRIANGLE,
                INSTANCED,
                ELEMENTS,
            );
            self.instance_add_non_cached(InstanceUnit::UiBucket(bucket_index as u32), key);
        }
    }

    fn prune(&mut self, index: u32) {
        if let InstanceUnit::Proxy(unit) = self.instances.get(index).unit {
            self.unit_map.remove(unit, index);
        }
        self.instances.remove(index);
    }

    /// Merge two key-descending runs of `cmd[left..mid]` and
    /// `cmd[mid..right]` through `tmp`. Stable: the left run wins ties.
    fn merge_runs(cmd: &mut [RCommand], tmp: &mut [RCommand], left: usize, mid: usize, right: usize) {
        let mut l = left;
        let mut r = mid;
        for slot in tmp.iter_mut().take(right).skip(left) {
            if r < right && (l >= mid || cmd[r].key > cmd[l].key) {
                *slot = cmd[r];
                r += 1;
            } else {
                *slot = cmd[l];
                l += 1;
            }
        }
        cmd[left..right].copy_from_slice(&tmp[left..right]);
    }

    fn sort_commands_and_prune_instances(&mut self) {
        // gather new commands off the intrusive list
        let mut cmd_new = Vec::with_capacity(self.cmd_new_count as usize);
        let mut at = self.instance_new_first;
        while at != INDEX_NONE {
            let instance = self.instances.get(at);
            cmd_new.push(RCommand {
                key: instance.key,
                instance: at,
            });
            at = instance.next_new;
        }
        debug_assert_eq!(cmd_new.len(), self.cmd_new_count as usize);

        // bottom-up merge sort, descending
        let mut tmp = vec![RCommand::default(); cmd_new.len()];
        let count = cmd_new.len();
        let mut width = 2usize;
        while width / 2 < count {
            let mut i = 0usize;
            while i + width <= count {
                Self::merge_runs(&mut cmd_new, &mut tmp, i, i + width / 2, i + width);
                i += width;
            }
            if i + width / 2 < count {
                Self::merge_runs(&mut cmd_new, &mut tmp, i, i + width / 2, count);
            }
            width *= 2;
        }

        // merge the cache and the new run, pruning dead instances in place
        let cache = std::mem::take(&mut self.cmd_cache);
        self.cmd_frame = Vec::with_capacity(self.cmd_frame_count as usize);
        let mut cache_i = 0usize;
        let mut new_i = 0usize;
        for _ in 0..self.cmd_frame_count {
            while cache_i < cache.len() {
                let entry = cache[cache_i];
                let instance = self.instances.get(entry.instance);
                if instance.frame_last_touched != self.frame {
                    self.prune(entry.instance);
                    cache_i += 1;
                    continue;
                }
                if instance.renewed_frame == self.frame {
                    // superseded: its fresh command sits in cmd_new
                    cache_i += 1;
                    continue;
                }
                break;
            }

            let command = if cache_i >= cache.len() {
                let command = cmd_new[new_i];
                new_i += 1;
                command
            } else if new_i >= cmd_new.len() || cache[cache_i].key >= cmd_new[new_i].key {
                let command = cache[cache_i];
                cache_i += 1;
                command
            } else {
                let command = cmd_new[new_i];
                new_i += 1;
                command
            };

            let slot = self.cmd_frame.len() as u32;
            self.cmd_frame.push(command);
            self.instances.get_mut(command.instance).cmd_slot = slot;
        }

        // prune whatever the merge never reached
        while cache_i < cache.len() {
            let entry = cache[cache_i];
            if self.instances.is_allocated(entry.instance)
                && self.instances.get(entry.instance).frame_last_touched != self.frame
            {
                self.prune(entry.instance);
            }
            cache_i += 1;
        }

        debug_assert!(self
            .cmd_frame
            .windows(2)
            .all(|pair| pair[0].key >= pair[1].key));
    }

    fn buffer_accounting(
        ctx: &FrameContext,
        buffer: &mut RBuffer,
        instance: &Instance,
        first_of_buffer: bool,
    ) {
        match &instance.unit {
            InstanceUnit::UiBucket(bucket) => {
                let count = ctx
                    .ui
                    .expect("ui bucket registered without a ui context")
                    .buckets()[*bucket as usize]
                    .count;
                buffer.index_count = 6;
                buffer.shared_size += count as u64 * ui::UI_SHARED_STRIDE as u64;
                buffer.instance_count += count;
            }
            InstanceUnit::Proxy(unit) => {
                if first_of_buffer {
                    // the bucket's material pins the mesh; its vertex and
                    // index bytes are shared by every instance
                    let proxy = ctx.proxies.get(*unit);
                    let mesh = ctx.meshes.get(proxy.mesh);
                    buffer.index_count = mesh.index_count();
                    buffer.local_size = mesh.vertex_size();
                }
                buffer.shared_size += PROXY_SHARED_STRIDE as u64;
                buffer.instance_count += 1;
            }
            InstanceUnit::Mesh(mesh) => {
                buffer.local_size += mesh.vertex_size();
            }
            InstanceUnit::None => {
                debug_assert!(false, "unset instance in bucket accounting");
            }
        }
    }

    fn buffer_needs_split(buffer: &RBuffer) -> bool {
        buffer.instance_count >= BUFFER_INSTANCE_MAX
            || buffer.local_size >= BUFFER_LOCAL_BYTES_MAX
    }

    fn generate_buckets(&mut self, ctx: &FrameContext) {
        self.buckets.clear();
        for i in 0..self.cmd_frame.len() {
            let command = self.cmd_frame[i];
            let key = command.key;

            let start_bucket = match self.buckets.last() {
                None => true,
                Some(bucket) => {
                    bucket.transparency != key.transparency()
                        || bucket.material != key.material()
                        || bucket.screen_layer != key.screen_layer()
                        || bucket.primitive != key.primitive()
                        || bucket.instanced != key.instanced()
                }
            };
            if start_bucket {
                if let Some(bucket) = self.buckets.last_mut() {
                    bucket.c_h = i as u32 - 1;
                    if let Some(buffer) = bucket.buffers.last_mut() {
                        buffer.c_h = i as u32 - 1;
                    }
                }
                self.buckets.push(RBucket {
                    c_l: i as u32,
                    c_h: i as u32,
                    screen_layer: key.screen_layer(),
                    transparency: key.transparency(),
                    material: key.material(),
                    primitive: key.primitive(),
                    instanced: key.instanced(),
                    elements: key.elements(),
                    buffers: vec![RBuffer {
                        c_l: i as u32,
                        ..Default::default()
                    }],
                });
            }

            let bucket = self.buckets.last_mut().expect("bucket");
            let split = Self::buffer_needs_split(bucket.buffers.last().expect("buffer"));
            if split {
                bucket.buffers.last_mut().expect("buffer").c_h = i as u32 - 1;
                bucket.buffers.push(RBuffer {
                    c_l: i as u32,
                    ..Default::default()
                });
            }

            let first_of_buffer = {
                let buffer = bucket.buffers.last().expect("buffer");
                buffer.c_l == i as u32
            };
            let instance = self.instances.get(command.instance).clone();
            let buffer = self
                .buckets
                .last_mut()
                .expect("bucket")
                .buffers
                .last_mut()
                .expect("buffer");
            Self::buffer_accounting(ctx, buffer, &instance, first_of_buffer);
        }
        if let Some(bucket) = self.buckets.last_mut() {
            let last = self.cmd_frame.len() as u32 - 1;
            bucket.c_h = last;
            if let Some(buffer) = bucket.buffers.last_mut() {
                buffer.c_h = last;
            }
        }
    }

    fn emit_bucket_data(&mut self, ctx: &FrameContext, bucket_index: usize) {
        let arena = &self.mem_frame[(self.frame & 1) as usize];
        let bucket = &self.buckets[bucket_index];
        let first_instance = self
            .instances
            .get(self.cmd_frame[bucket.c_l as usize].instance)
            .unit
            .clone();

        let mut emitted: Vec<RBuffer> = Vec::with_capacity(bucket.buffers.len());
        for buffer in bucket.buffers.iter() {
            let mut out = buffer.clone();
            match &first_instance {
                InstanceUnit::UiBucket(_) => {
                    let ui_state = ctx.ui.expect("ui context");
                    let shared = match arena.push(out.shared_size as usize) {
                        Some(span) => span,
                        None => {
                            warn!("frame arena exhausted on ui shared data");
                            emitted.push(out);
                            continue;
                        }
                    };
                    let quad: [u32; 6] = [0, 1, 2, 0, 2, 3];
                    let index = arena.push_copy_of(&quad[..]).expect("quad indices");

                    let mut cursor = 0usize;
                    for c in out.c_l..=out.c_h {
                        let command = self.cmd_frame[c as usize];
                        if let InstanceUnit::UiBucket(b) =
                            self.instances.get(command.instance).unit
                        {
                            let bucket_ref = &ui_state.buckets()[b as usize];
                            let size = bucket_ref.count as usize * ui::UI_SHARED_STRIDE;
                            ui_state.write_bucket_instances(
                                bucket_ref,
                                &mut shared[cursor..cursor + size],
                            );
                            cursor += size;
                        }
                    }
                    debug_assert_eq!(cursor, out.shared_size as usize);

                    out.shared = DataRef::Frame {
                        offset: arena.offset_of(shared),
                        len: shared.len(),
                    };
                    out.index = DataRef::Frame {
                        offset: arena.offset_of(index.as_bytes()),
                        len: index.as_bytes().len(),
                    };
                    out.local = DataRef::None;
                }
                InstanceUnit::Proxy(_) => {
                    let shared = match arena.push(out.shared_size as usize) {
                        Some(span) => span,
                        None => {
                            warn!("frame arena exhausted on proxy shared data");
                            emitted.push(out);
                            continue;
                        }
                    };
                    let mut cursor = 0usize;
                    let mut mesh_handle = 0u32;
                    for c in out.c_l..=out.c_h {
                        let command = self.cmd_frame[c as usize];
                        if let InstanceUnit::Proxy(unit) =
                            self.instances.get(command.instance).unit
                        {
                            let proxy = ctx.proxies.get(unit);
                            mesh_handle = proxy.mesh;
                            let record = ProxyShared {
                                translation_blend: [
                                    proxy.spec_position.x,
                                    proxy.spec_position.y,
                                    proxy.spec_position.z,
                                    proxy.blend,
                                ],
                                rotation: [
                                    proxy.spec_rotation.coords.x,
                                    proxy.spec_rotation.coords.y,
                                    proxy.spec_rotation.coords.z,
                                    proxy.spec_rotation.coords.w,
                                ],
                                color: [
                                    proxy.color.x,
                                    proxy.color.y,
                                    proxy.color.z,
                                    proxy.color.w,
                                ],
                            };
                            shared[cursor..cursor + PROXY_SHARED_STRIDE]
                                .copy_from_slice(record.as_bytes());
                            cursor += PROXY_SHARED_STRIDE;
                        }
                    }
                    debug_assert_eq!(cursor, out.shared_size as usize);

                    out.shared = DataRef::Frame {
                        offset: arena.offset_of(shared),
                        len: shared.len(),
                    };
                    out.local = DataRef::MeshVertices(mesh_handle);
                    out.index = DataRef::MeshIndices(mesh_handle);
                }
                InstanceUnit::Mesh(_) => {
                    let local = match arena.push(out.local_size as usize) {
                        Some(span) => span,
                        None => {
                            warn!("frame arena exhausted on mesh local data");
                            emitted.push(out);
                            continue;
                        }
                    };
                    let mut cursor = 0usize;
                    for c in out.c_l..=out.c_h {
                        let command = self.cmd_frame[c as usize];
                        if let InstanceUnit::Mesh(mesh) =
                            &self.instances.get(command.instance).unit
                        {
                            let bytes = mesh.vertex_bytes();
                            local[cursor..cursor + bytes.len()].copy_from_slice(bytes);
                            cursor += bytes.len();
                        }
                    }
                    debug_assert_eq!(cursor, out.local_size as usize);

                    out.local = DataRef::Frame {
                        offset: arena.offset_of(local),
                        len: local.len(),
                    };
                    out.shared = DataRef::None;
                    out.index = DataRef::None;
                }
                InstanceUnit::None => {}
            }
            emitted.push(out);
        }
        self.buckets[bucket_index].buffers = emitted;
    }

    /// Sort, bucket and emit the frame's draw data.
    pub fn frame_end(&mut self, ctx: &FrameContext) {
        self.sort_commands_and_prune_instances();
        if self.cmd_frame.is_empty() {
            return;
        }
        self.generate_buckets(ctx);
        for bucket_index in 0..self.buckets.len() {
            self.emit_bucket_data(ctx, bucket_index);
        }

        #[cfg(debug_assertions)]
        self.assert_instance_cmd_bijection();
    }

    #[cfg(debug_assertions)]
    fn assert_instance_cmd_bijection(&self) {
        for (slot, command) in self.cmd_frame.iter().enumerate() {
            debug_assert!(self.instances.is_allocated(command.instance));
            debug_assert_eq!(
                self.instances.get(command.instance).cmd_slot,
                slot as u32
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3, Vector4};
    use proxy3d::ProxyConfig;

    struct World {
        scene: Scene,
        proxies: ProxyForest,
        meshes: NameDb<RMesh>,
    }

    impl World {
        fn new() -> Self {
            let mut meshes: NameDb<RMesh> = NameDb::new(64, 64, false);
            // stub mesh at slot 0
            meshes.get_mut(0).set_stub_box();
            let cube = meshes.add("cube");
            meshes.get_mut(cube).set_stub_box();
            Self {
                scene: Scene::with_frame_capacity(1024 * 1024).unwrap(),
                proxies: ProxyForest::new(256),
                meshes,
            }
        }

        fn proxy(&mut self) -> u32 {
            let mesh = self.meshes.reference("cube");
            self.proxies
                .alloc(&ProxyConfig {
                    mesh,
                    position: Vector3::new(1.0, 2.0, 3.0),
                    rotation: UnitQuaternion::identity(),
                    color: Vector4::new(1.0, 0.0, 0.0, 1.0),
                    blend: 0.25,
                    ..Default::default()
                })
                .unwrap()
        }

        fn end_frame(&mut self) {
            let ctx = FrameContext {
                proxies: &self.proxies,
                meshes: &self.meshes,
                ui: None,
            };
            self.scene.frame_end(&ctx);
        }
    }

    fn game_key(screen: u64, depth: u64, mesh: u64) -> CmdKey {
        CmdKey::new(
            screen,
            depth,
            TRANSPARENCY_OPAQUE,
            material(PROGRAM_PROXY3D, mesh, 0),
            PRIMITIVE_TRIANGLE,
            INSTANCED,
            ELEMENTS,
        )
    }

    #[test]
    fn commands_sort_descending_by_key() {
        let mut world = World::new();
        let a = world.proxy();
        let b = world.proxy();
        let c = world.proxy();

        world.scene.frame_begin();
        world.scene.instance_add(a, game_key(1, 10, 1));
        world.scene.instance_add(b, game_key(1, 20, 1));
        world.scene.instance_add(c, game_key(0, 50, 1));
        world.end_frame();

        let keys: Vec<u64> = world.scene.commands().iter().map(|c| c.key.0).collect();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0], game_key(1, 20, 1).0);
        assert_eq!(keys[1], game_key(1, 10, 1).0);
        assert_eq!(keys[2], game_key(0, 50, 1).0);
    }

    #[test]
    fn untouched_instances_are_pruned() {
        let mut world = World::new();
        let a = world.proxy();
        let b = world.proxy();

        world.scene.frame_begin();
        world.scene.instance_add(a, game_key(1, 10, 1));
        world.scene.instance_add(b, game_key(1, 20, 1));
        world.end_frame();
        assert_eq!(world.scene.instance_count(), 2);

        // frame 2: resubmit only a, with an unchanged key
        world.scene.frame_begin();
        world.scene.instance_add(a, game_key(1, 10, 1));
        world.end_frame();

        assert_eq!(world.scene.commands().len(), 1);
        assert_eq!(world.scene.instance_count(), 1);
        assert!(world.scene.proxy_instance(a).is_some());
        assert!(world.scene.proxy_instance(b).is_none());
    }

    #[test]
    fn unchanged_keys_reuse_the_cached_command() {
        let mut world = World::new();
        let a = world.proxy();

        world.scene.frame_begin();
        world.scene.instance_add(a, game_key(1, 10, 1));
        world.end_frame();

        world.scene.frame_begin();
        let index = world.scene.instance_add(a, game_key(1, 10, 1));
        // no new command was issued for the cached registration
        assert_eq!(world.scene.cmd_new_count, 0);
        world.end_frame();
        assert_eq!(world.scene.commands()[0].instance, index);
    }

    #[test]
    fn changed_keys_resort_correctly() {
        let mut world = World::new();
        let a = world.proxy();
        let b = world.proxy();

        world.scene.frame_begin();
        world.scene.instance_add(a, game_key(1, 10, 1));
        world.scene.instance_add(b, game_key(1, 20, 1));
        world.end_frame();

        // swap the order by re-keying a to the front
        world.scene.frame_begin();
        world.scene.instance_add(a, game_key(1, 30, 1));
        world.scene.instance_add(b, game_key(1, 20, 1));
        world.end_frame();

        let commands = world.scene.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].key, game_key(1, 30, 1));
        assert_eq!(commands[1].key, game_key(1, 20, 1));
        // bijection holds after the re-key
        for (slot, command) in commands.iter().enumerate() {
            assert_eq!(world.scene.instance(command.instance).cmd_slot, slot as u32);
        }
    }

    #[test]
    fn buckets_split_on_material_change() {
        let mut world = World::new();
        let sphere = world.meshes.add("sphere");
        world.meshes.get_mut(sphere).set_sphere(1.0, 3);

        let a = world.proxy();
        let b = world.proxy();
        let c = world.proxy();
        world.proxies.get_mut(c).mesh = sphere;
        world.meshes.reference("sphere");

        world.scene.frame_begin();
        world.scene.instance_add(a, game_key(1, 10, 1));
        world.scene.instance_add(b, game_key(1, 20, 1));
        world.scene.instance_add(c, game_key(1, 30, sphere as u64));
        world.end_frame();

        // two buckets: sphere material first (higher depth), cube second
        let buckets = world.scene.buckets();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].c_l, 0);
        assert_eq!(buckets[0].c_h, 0);
        assert_eq!(buckets[1].c_l, 1);
        assert_eq!(buckets[1].c_h, 2);

        // the cube bucket shares one mesh: 2 instances, one set of indices
        let buffer = &buckets[1].buffers[0];
        assert_eq!(buffer.instance_count, 2);
        assert_eq!(
            buffer.shared_size,
            2 * PROXY_SHARED_STRIDE as u64
        );
        assert_eq!(buffer.local, DataRef::MeshVertices(1));
        assert_eq!(buffer.index, DataRef::MeshIndices(1));

        // emitted shared data carries each proxy's speculative transform
        let bytes = world.scene.frame_bytes(&buffer.shared).unwrap();
        assert_eq!(bytes.len(), 2 * PROXY_SHARED_STRIDE);
        let translation = f32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(translation, 1.0);
    }

    #[test]
    fn raw_mesh_instances_concatenate_vertices() {
        let mut world = World::new();
        let mut tri = RMesh::default();
        tri.set_tri_mesh(&mesh::TriMesh {
            vertices: vec![
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(0.0, 1.0, 0.0),
            ],
            triangles: vec![[0, 1, 2]],
        });
        let tri = Arc::new(tri);

        world.scene.frame_begin();
        let debug_key = CmdKey::new(
            SCREEN_LAYER_GAME,
            5,
            TRANSPARENCY_NORMAL,
            material(PROGRAM_DEBUG, MESH_NONE, 0),
            PRIMITIVE_TRIANGLE,
            NON_INSTANCED,
            ARRAYS,
        );
        world.scene.instance_add_mesh(tri.clone(), debug_key);
        world.scene.instance_add_mesh(tri.clone(), debug_key);
        world.end_frame();

        let buckets = world.scene.buckets();
        assert_eq!(buckets.len(), 1);
        let buffer = &buckets[0].buffers[0];
        assert_eq!(buffer.local_size, 2 * tri.vertex_size());
        let bytes = world.scene.frame_bytes(&buffer.local).unwrap();
        assert_eq!(bytes.len(), buffer.local_size as usize);
        assert_eq!(&bytes[..tri.vertex_bytes().len()], tri.vertex_bytes());
    }

    #[test]
    fn ui_buckets_flow_into_hud_commands() {
        use ui::{InputSnapshot, NodeFlags, UiVisual};

        let mut world = World::new();
        let mut ui_state = Ui::new(Vec::new(), Vec::new()).unwrap();
        ui_state.frame_begin(
            [640.0, 480.0],
            &UiVisual::default(),
            InputSnapshot::default(),
            0,
        );
        ui_state.node(NodeFlags::DRAW_BACKGROUND, "###panel");
        ui_state.node(NodeFlags::DRAW_TEXT, "go###label");
        ui_state.frame_end();
        assert!(!ui_state.buckets().is_empty());

        world.scene.frame_begin();
        world.scene.submit_ui(&ui_state);
        {
            let ctx = FrameContext {
                proxies: &world.proxies,
                meshes: &world.meshes,
                ui: Some(&ui_state),
            };
            world.scene.frame_end(&ctx);
        }

        let buckets = world.scene.buckets();
        assert!(!buckets.is_empty());
        for bucket in buckets.iter() {
            assert_eq!(bucket.screen_layer, SCREEN_LAYER_HUD);
            assert_eq!(material_program(bucket.material), PROGRAM_UI);
            let buffer = &bucket.buffers[0];
            assert_eq!(buffer.index_count, 6);
            // emitted shared bytes sized to the quad count
            let bytes = world.scene.frame_bytes(&buffer.shared).unwrap();
            assert_eq!(
                bytes.len(),
                buffer.instance_count as usize * ui::UI_SHARED_STRIDE
            );
        }
    }
}
