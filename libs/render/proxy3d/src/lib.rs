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

//! Render-proxy forest with speculative motion.
//!
//! The physics step runs at a fixed cadence while frames render as fast as
//! they can, so draw transforms are extrapolated from the last
//! authoritative state. `spec_position`/`spec_rotation` are derived values:
//! every [ProxyForest::speculate] pass recomputes them in full from the
//! authoritative transform, the velocities, the elapsed time and (for
//! relative proxies) the parent's speculated transform.

use arena::Arena;
use bitflags::bitflags;
use containers::{HierarchyIndex, HI_NULL_INDEX, HI_ROOT_STUB_INDEX};
use nalgebra::{Quaternion, UnitQuaternion, Vector3, Vector4};
use timebase::NSEC_PER_SEC;

bitflags! {
    #[derive(Default)]
    pub struct ProxyFlags: u32 {
        /// Any velocity component is non-zero.
        const MOVING            = 1 << 0;
        /// Transform is pinned; never extrapolate.
        const SPECULATE_NONE    = 1 << 1;
        const SPECULATE_LINEAR  = 1 << 2;
        /// Has a non-root parent; composes with the parent's speculation.
        const RELATIVE          = 1 << 3;

        const SPECULATE_MASK    = Self::SPECULATE_NONE.bits | Self::SPECULATE_LINEAR.bits;
    }
}

/// Fixed handle of the forest root; children of the root are world-space.
pub const PROXY_ROOT: u32 = 2;

#[derive(Clone, Debug)]
pub struct Proxy {
    pub flags: ProxyFlags,
    pub ns_at_update: u64,
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub spec_position: Vector3<f32>,
    pub spec_rotation: UnitQuaternion<f32>,
    pub linear_velocity: Vector3<f32>,
    pub angular_velocity: Vector3<f32>,
    /// Mesh database handle; reference counting is the owner's concern.
    pub mesh: u32,
    pub color: Vector4<f32>,
    pub blend: f32,
}

impl Default for Proxy {
    fn default() -> Self {
        Self {
            flags: ProxyFlags::empty(),
            ns_at_update: 0,
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            spec_position: Vector3::zeros(),
            spec_rotation: UnitQuaternion::identity(),
            linear_velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            mesh: 0,
            color: Vector4::new(1.0, 1.0, 1.0, 1.0),
            blend: 0.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub ns_time: u64,
    pub parent: u32,
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub linear_velocity: Vector3<f32>,
    pub angular_velocity: Vector3<f32>,
    pub color: Vector4<f32>,
    /// Percentage of color against texture.
    pub blend: f32,
    /// Pre-referenced mesh handle.
    pub mesh: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ns_time: 0,
            parent: PROXY_ROOT,
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            linear_velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            color: Vector4::new(1.0, 1.0, 1.0, 1.0),
            blend: 0.0,
            mesh: 0,
        }
    }
}

pub struct ProxyForest {
    hierarchy: HierarchyIndex<Proxy>,
    root: u32,
}

impl ProxyForest {
    pub fn new(capacity: u32) -> Self {
        let mut hierarchy = HierarchyIndex::new(capacity, true);
        let root = hierarchy.add(HI_ROOT_STUB_INDEX).expect("proxy root");
        debug_assert_eq!(root, PROXY_ROOT);
        Self { hierarchy, root }
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    pub fn count(&self) -> u32 {
        // exclude the hierarchy stub and the forest root
        self.hierarchy.count() - 2
    }

    pub fn get(&self, index: u32) -> &Proxy {
        self.hierarchy.get(index)
    }

    pub fn get_mut(&mut self, index: u32) -> &mut Proxy {
        self.hierarchy.get_mut(index)
    }

    /// Allocate a proxy under `config.parent`. Returns `None` when the
    /// forest is out of slots; the caller falls back to its stub handle.
    pub fn alloc(&mut self, config: &ProxyConfig) -> Option<u32> {
        let index = self.hierarchy.add(config.parent)?;
        {
            let proxy = self.hierarchy.get_mut(index);
            proxy.flags = if config.parent != PROXY_ROOT {
                ProxyFlags::RELATIVE
            } else {
                ProxyFlags::empty()
            };
            proxy.mesh = config.mesh;
            proxy.color = config.color;
            proxy.blend = config.blend;
        }

        self.set_linear_speculation(
            index,
            config.position,
            config.rotation,
            config.linear_velocity,
            config.angular_velocity,
            config.ns_time,
        );
        Some(index)
    }

    /// Remove `index` and its whole subtree. The caller dereferences the
    /// mesh handles reported back.
    pub fn dealloc(&mut self, scratch: &mut Arena, index: u32, released_meshes: &mut Vec<u32>) {
        debug_assert_ne!(index, self.root);
        scratch.push_record();
        for at in self.hierarchy.iter_df(scratch, index) {
            released_meshes.push(self.hierarchy.get(at).mesh);
        }
        scratch.pop_record();

        let report = self.hierarchy.remove(scratch, index);
        if report.forced_heap {
            log::warn!("proxy removal fell back to heap traversal");
        }
    }

    /// Install a fresh authoritative state. MOVING is set iff the combined
    /// velocity is non-zero.
    pub fn set_linear_speculation(
        &mut self,
        index: u32,
        position: Vector3<f32>,
        rotation: UnitQuaternion<f32>,
        linear_velocity: Vector3<f32>,
        angular_velocity: Vector3<f32>,
        ns_time: u64,
    ) {
        let proxy = self.hierarchy.get_mut(index);
        proxy
            .flags
            .remove(ProxyFlags::SPECULATE_MASK | ProxyFlags::MOVING);
        proxy.flags.insert(ProxyFlags::SPECULATE_LINEAR);
        proxy.ns_at_update = ns_time;
        proxy.position = position;
        proxy.rotation = rotation;
        proxy.spec_position = position;
        proxy.spec_rotation = rotation;
        proxy.linear_velocity = linear_velocity;
        proxy.angular_velocity = angular_velocity;
        if linear_velocity.norm_squared() + angular_velocity.norm_squared() > 0.0 {
            proxy.flags.insert(ProxyFlags::MOVING);
        }
    }

    fn speculate_local(proxy: &mut Proxy, ns_time: u64) {
        let dt = (ns_time.saturating_sub(proxy.ns_at_update)) as f32 / NSEC_PER_SEC as f32;
        if proxy.flags & ProxyFlags::SPECULATE_MASK == ProxyFlags::SPECULATE_LINEAR {
            proxy.spec_position = proxy.position + proxy.linear_velocity * dt;

            let velocity_quat = Quaternion::new(
                0.0,
                proxy.angular_velocity.x,
                proxy.angular_velocity.y,
                proxy.angular_velocity.z,
            );
            let delta = velocity_quat * proxy.rotation.quaternion() * (dt / 2.0);
            proxy.spec_rotation =
                UnitQuaternion::new_normalize(proxy.rotation.quaternion() + delta);
        } else {
            proxy.spec_position = proxy.position;
            proxy.spec_rotation = proxy.rotation;
        }
    }

    /// Depth-first speculation pass. Parents precede children, so relative
    /// proxies compose against this frame's parent speculation.
    pub fn speculate(&mut self, scratch: &mut Arena, ns_time: u64) {
        scratch.push_record();
        {
            let capacity = self.hierarchy.count() as usize;
            let mut heap_stack: Vec<u32>;
            let mut len = 0usize;
            let stack: &mut [u32] = match scratch.push_slice::<u32>(capacity) {
                Some(stack) => stack,
                None => {
                    heap_stack = vec![0; capacity];
                    &mut heap_stack[..]
                }
            };

            stack[len] = self.root;
            len += 1;
            while len > 0 {
                len -= 1;
                let at = stack[len];
                let links = *self.hierarchy.links(at);
                if at != self.root && links.next != HI_NULL_INDEX {
                    stack[len] = links.next;
                    len += 1;
                }
                if links.first != HI_NULL_INDEX {
                    stack[len] = links.first;
                    len += 1;
                }

                if at == self.root {
                    continue;
                }

                let moving = self.hierarchy.get(at).flags.contains(ProxyFlags::MOVING);
                if moving {
                    Self::speculate_local(self.hierarchy.get_mut(at), ns_time);
                }

                if links.parent != self.root {
                    let parent_spec_position = self.hierarchy.get(links.parent).spec_position;
                    let parent_spec_rotation = self.hierarchy.get(links.parent).spec_rotation;
                    let proxy = self.hierarchy.get_mut(at);
                    if !moving {
                        proxy.spec_position = proxy.position;
                        proxy.spec_rotation = proxy.rotation;
                    }
                    proxy.spec_position += parent_spec_position;
                    proxy.spec_rotation = proxy.spec_rotation * parent_spec_rotation;
                }
            }
        }
        scratch.pop_record();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn scratch() -> Arena {
        Arena::with_capacity(64 * 1024).unwrap()
    }

    fn forest_with(config: ProxyConfig) -> (ProxyForest, u32) {
        let mut forest = ProxyForest::new(64);
        let index = forest.alloc(&config).unwrap();
        (forest, index)
    }

    #[test]
    fn moving_follows_velocity_sign() {
        let (forest, index) = forest_with(ProxyConfig {
            linear_velocity: Vector3::new(1.0, 0.0, 0.0),
            ..Default::default()
        });
        assert!(forest.get(index).flags.contains(ProxyFlags::MOVING));

        let (forest, index) = forest_with(ProxyConfig::default());
        assert!(!forest.get(index).flags.contains(ProxyFlags::MOVING));
    }

    #[test]
    fn linear_extrapolation_is_linear_in_dt() {
        let (mut forest, index) = forest_with(ProxyConfig {
            ns_time: 1_000_000_000,
            position: Vector3::new(1.0, 2.0, 3.0),
            linear_velocity: Vector3::new(2.0, -4.0, 0.5),
            ..Default::default()
        });

        // 0.5 s later
        let mut mem = scratch();
        forest.speculate(&mut mem, 1_500_000_000);
        let proxy = forest.get(index);
        assert_relative_eq!(proxy.spec_position.x, 2.0, epsilon = 1e-5);
        assert_relative_eq!(proxy.spec_position.y, 0.0, epsilon = 1e-5);
        assert_relative_eq!(proxy.spec_position.z, 3.25, epsilon = 1e-5);
        // authoritative state untouched
        assert_relative_eq!(proxy.position.x, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn speculation_is_recomputed_not_accumulated() {
        let (mut forest, index) = forest_with(ProxyConfig {
            ns_time: 0,
            linear_velocity: Vector3::new(1.0, 0.0, 0.0),
            ..Default::default()
        });
        let mut mem = scratch();
        forest.speculate(&mut mem, 2_000_000_000);
        forest.speculate(&mut mem, 2_000_000_000);
        forest.speculate(&mut mem, 1_000_000_000);
        // three passes, the last at t=1s: exactly v * 1s
        assert_relative_eq!(forest.get(index).spec_position.x, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn angular_velocity_integrates_about_axis() {
        let omega = 0.2f32; // rad/s about +z
        let (mut forest, index) = forest_with(ProxyConfig {
            ns_time: 0,
            angular_velocity: Vector3::new(0.0, 0.0, omega),
            ..Default::default()
        });
        let mut mem = scratch();
        let dt = 0.1f32;
        forest.speculate(&mut mem, (dt * 1e9) as u64);
        let spec = forest.get(index).spec_rotation;
        let expect = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), omega * dt);
        // first-order integration stays close for small steps
        assert!(spec.angle_to(&expect) < 1e-3);
    }

    #[test]
    fn non_moving_proxy_copies_authoritative_state() {
        let (mut forest, index) = forest_with(ProxyConfig {
            position: Vector3::new(5.0, 6.0, 7.0),
            ..Default::default()
        });
        let mut mem = scratch();
        forest.speculate(&mut mem, 3_000_000_000);
        assert_eq!(forest.get(index).spec_position, Vector3::new(5.0, 6.0, 7.0));
    }

    #[test]
    fn relative_child_composes_with_parent() {
        let mut forest = ProxyForest::new(64);
        let parent = forest
            .alloc(&ProxyConfig {
                ns_time: 0,
                position: Vector3::new(10.0, 0.0, 0.0),
                linear_velocity: Vector3::new(1.0, 0.0, 0.0),
                ..Default::default()
            })
            .unwrap();
        let child = forest
            .alloc(&ProxyConfig {
                parent,
                position: Vector3::new(0.0, 2.0, 0.0),
                ..Default::default()
            })
            .unwrap();
        assert!(forest.get(child).flags.contains(ProxyFlags::RELATIVE));

        let mut mem = scratch();
        forest.speculate(&mut mem, 1_000_000_000);
        // parent extrapolated to x=11; child rides along
        let spec = forest.get(child).spec_position;
        assert_relative_eq!(spec.x, 11.0, epsilon = 1e-5);
        assert_relative_eq!(spec.y, 2.0, epsilon = 1e-5);
    }

    #[test]
    fn dealloc_reports_subtree_mesh_handles() {
        let mut forest = ProxyForest::new(64);
        let parent = forest
            .alloc(&ProxyConfig {
                mesh: 3,
                ..Default::default()
            })
            .unwrap();
        let _child = forest
            .alloc(&ProxyConfig {
                parent,
                mesh: 4,
                ..Default::default()
            })
            .unwrap();

        let mut released = Vec::new();
        let mut mem = scratch();
        forest.dealloc(&mut mem, parent, &mut released);
        released.sort_unstable();
        assert_eq!(released, vec![3, 4]);
        assert_eq!(forest.count(), 0);
    }
}
