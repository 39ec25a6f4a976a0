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

//! Parametric render meshes and hull-to-mesh conversion.
//!
//! All meshes interleave `position(vec3) normal(vec3)` vertices; indices are
//! `u32` triangle lists (tri-mesh soups carry no indices at all). Normals
//! are CCW face normals for flat geometry and radial for lathed surfaces.

use nalgebra::Vector3;
use zerocopy::AsBytes;

#[repr(C)]
#[derive(AsBytes, Clone, Copy, Debug, Default, PartialEq)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

pub const LOCAL_STRIDE: u64 = std::mem::size_of::<MeshVertex>() as u64;

fn vertex(position: Vector3<f32>, normal: Vector3<f32>) -> MeshVertex {
    MeshVertex {
        position: position.into(),
        normal: normal.into(),
    }
}

fn tri_ccw_normal(a: Vector3<f32>, b: Vector3<f32>, c: Vector3<f32>) -> Vector3<f32> {
    let normal = (b - a).cross(&(c - a));
    let len = normal.norm();
    if len > f32::EPSILON {
        normal / len
    } else {
        Vector3::new(0.0, 1.0, 0.0)
    }
}

/// One renderable mesh: interleaved vertices plus an optional index list.
#[derive(Clone, Debug, Default)]
pub struct RMesh {
    pub vertex_data: Vec<MeshVertex>,
    pub index_data: Vec<u32>,
    pub index_max_used: u32,
    pub local_stride: u64,
}

impl RMesh {
    pub fn vertex_count(&self) -> u32 {
        self.vertex_data.len() as u32
    }

    pub fn index_count(&self) -> u32 {
        self.index_data.len() as u32
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        self.vertex_data.as_bytes()
    }

    pub fn vertex_size(&self) -> u64 {
        self.vertex_data.len() as u64 * self.local_stride
    }

    /// Unit box centered at the origin; the fallback for every failed mesh
    /// construction path.
    pub fn set_stub_box(&mut self) {
        self.set_box(Vector3::new(0.5, 0.5, 0.5));
    }

    pub fn set_box(&mut self, half: Vector3<f32>) {
        self.vertex_data.clear();
        self.index_data.clear();
        self.local_stride = LOCAL_STRIDE;

        let corners = [
            Vector3::new(-half.x, -half.y, -half.z),
            Vector3::new(half.x, -half.y, -half.z),
            Vector3::new(half.x, half.y, -half.z),
            Vector3::new(-half.x, half.y, -half.z),
            Vector3::new(-half.x, -half.y, half.z),
            Vector3::new(half.x, -half.y, half.z),
            Vector3::new(half.x, half.y, half.z),
            Vector3::new(-half.x, half.y, half.z),
        ];
        // (corner indices, outward normal), CCW from outside
        let faces: [([usize; 4], Vector3<f32>); 6] = [
            ([1, 0, 3, 2], Vector3::new(0.0, 0.0, -1.0)),
            ([4, 5, 6, 7], Vector3::new(0.0, 0.0, 1.0)),
            ([0, 1, 5, 4], Vector3::new(0.0, -1.0, 0.0)),
            ([2, 3, 7, 6], Vector3::new(0.0, 1.0, 0.0)),
            ([0, 4, 7, 3], Vector3::new(-1.0, 0.0, 0.0)),
            ([5, 1, 2, 6], Vector3::new(1.0, 0.0, 0.0)),
        ];
        for (quad, normal) in faces.iter() {
            let base = self.vertex_data.len() as u32;
            for &corner in quad.iter() {
                self.vertex_data.push(vertex(corners[corner], *normal));
            }
            self.index_data
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        self.index_max_used = self.vertex_data.len() as u32 - 1;
    }

    /// Latitude-strip sphere. `refinement` rings of `2 * refinement` points
    /// each, seamlessly wrapped; requires `refinement >= 3`.
    pub fn set_sphere(&mut self, radius: f32, refinement: u32) {
        debug_assert!(refinement >= 3);
        let rings: Vec<LatheRing> = (1..refinement)
            .map(|i| {
                let polar = std::f32::consts::PI * i as f32 / refinement as f32;
                LatheRing {
                    y: radius * polar.cos(),
                    radius: radius * polar.sin(),
                    normal_y: polar.cos(),
                    normal_radial: polar.sin(),
                }
            })
            .collect();
        self.set_lathe(
            &rings,
            2 * refinement,
            Vector3::new(0.0, radius, 0.0),
            Vector3::new(0.0, -radius, 0.0),
        );
    }

    /// Capsule of total height `2 * half_height + 2 * radius`. Hemisphere
    /// cap rings share the cylinder equator rings, so the surface carries no
    /// duplicate vertices; requires `refinement >= 2`.
    pub fn set_capsule(&mut self, half_height: f32, radius: f32, refinement: u32) {
        debug_assert!(refinement >= 2);
        debug_assert!(half_height > 0.0 && radius > 0.0);

        let mut rings = Vec::new();
        // top hemisphere, pole side down to its equator
        for i in 1..=refinement {
            let polar = std::f32::consts::FRAC_PI_2 * i as f32 / refinement as f32;
            rings.push(LatheRing {
                y: half_height + radius * polar.cos(),
                radius: radius * polar.sin(),
                normal_y: polar.cos(),
                normal_radial: polar.sin(),
            });
        }
        // cylinder body between the equators
        for i in 1..refinement {
            let y = half_height - 2.0 * half_height * i as f32 / refinement as f32;
            rings.push(LatheRing {
                y,
                radius,
                normal_y: 0.0,
                normal_radial: 1.0,
            });
        }
        // bottom hemisphere, equator down to the pole side
        for i in (1..=refinement).rev() {
            let polar = std::f32::consts::FRAC_PI_2 * i as f32 / refinement as f32;
            rings.push(LatheRing {
                y: -half_height - radius * polar.cos(),
                radius: radius * polar.sin(),
                normal_y: -polar.cos(),
                normal_radial: polar.sin(),
            });
        }

        self.set_lathe(
            &rings,
            2 * refinement,
            Vector3::new(0.0, half_height + radius, 0.0),
            Vector3::new(0.0, -half_height - radius, 0.0),
        );
    }

    /// Triangulate a surface of revolution: a top pole, `rings` stacked
    /// top-down, a bottom pole. Each ring carries `points_per_ring`
    /// azimuthal samples with wrap-around.
    fn set_lathe(
        &mut self,
        rings: &[LatheRing],
        points_per_ring: u32,
        top: Vector3<f32>,
        bottom: Vector3<f32>,
    ) {
        self.vertex_data.clear();
        self.index_data.clear();
        self.local_stride = LOCAL_STRIDE;

        self.vertex_data
            .push(vertex(top, Vector3::new(0.0, 1.0, 0.0)));
        for ring in rings.iter() {
            for j in 0..points_per_ring {
                let azimuth = 2.0 * std::f32::consts::PI * j as f32 / points_per_ring as f32;
                let (sin_a, cos_a) = azimuth.sin_cos();
                let position =
                    Vector3::new(ring.radius * cos_a, ring.y, -ring.radius * sin_a);
                let normal = Vector3::new(
                    ring.normal_radial * cos_a,
                    ring.normal_y,
                    -ring.normal_radial * sin_a,
                )
                .normalize();
                self.vertex_data.push(vertex(position, normal));
            }
        }
        self.vertex_data
            .push(vertex(bottom, Vector3::new(0.0, -1.0, 0.0)));

        let pps = points_per_ring;
        // top fan
        let mut base = 0u32;
        for i in 0..pps {
            self.index_data
                .extend_from_slice(&[base + 1 + (i + 1) % pps, base, base + i + 1]);
        }
        base += 1;
        // quad strips between consecutive rings
        for _ in 1..rings.len() as u32 {
            base += pps;
            for j in 0..pps {
                let next = (j + 1) % pps;
                self.index_data.extend_from_slice(&[
                    base + next,
                    base + j - pps,
                    base + j,
                    base + next,
                    base + next - pps,
                    base + j - pps,
                ]);
            }
        }
        // bottom fan
        for i in 0..pps {
            self.index_data
                .extend_from_slice(&[base + pps, base + (i + 1) % pps, base + i]);
        }
        self.index_max_used = base + pps;
        debug_assert_eq!(self.index_max_used, self.vertex_data.len() as u32 - 1);
    }

    /// Fan-triangulate each convex face of `hull` from its first vertex.
    /// Vertices are duplicated per face so the flat face normal survives.
    pub fn set_hull(&mut self, hull: &Dcel) {
        self.vertex_data.clear();
        self.index_data.clear();
        self.local_stride = LOCAL_STRIDE;

        for face in hull.faces.iter() {
            debug_assert!(face.count >= 3);
            let at = |k: u32| hull.vertices[hull.edges[(face.first + k) as usize].origin as usize];
            let normal = tri_ccw_normal(at(0), at(1), at(2));

            let base = self.vertex_data.len() as u32;
            for k in 0..face.count {
                self.vertex_data.push(vertex(at(k), normal));
            }
            for k in 1..face.count - 1 {
                self.index_data
                    .extend_from_slice(&[base, base + k, base + k + 1]);
            }
        }
        self.index_max_used = self.vertex_data.len().saturating_sub(1) as u32;
    }

    /// Unpack a triangle soup; no index data is produced.
    pub fn set_tri_mesh(&mut self, tri_mesh: &TriMesh) {
        self.vertex_data.clear();
        self.index_data.clear();
        self.local_stride = LOCAL_STRIDE;
        self.index_max_used = 0;

        for tri in tri_mesh.triangles.iter() {
            let a = tri_mesh.vertices[tri[0] as usize];
            let b = tri_mesh.vertices[tri[1] as usize];
            let c = tri_mesh.vertices[tri[2] as usize];
            let normal = tri_ccw_normal(a, b, c);
            self.vertex_data.push(vertex(a, normal));
            self.vertex_data.push(vertex(b, normal));
            self.vertex_data.push(vertex(c, normal));
        }
    }
}

struct LatheRing {
    y: f32,
    radius: f32,
    normal_y: f32,
    normal_radial: f32,
}

/// Convex polyhedron as a doubly-connected edge list; the edges of a face
/// are stored contiguously starting at `face.first`, CCW from outside.
#[derive(Clone, Debug, Default)]
pub struct Dcel {
    pub vertices: Vec<Vector3<f32>>,
    pub edges: Vec<DcelEdge>,
    pub faces: Vec<DcelFace>,
}

#[derive(Clone, Copy, Debug)]
pub struct DcelEdge {
    pub origin: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct DcelFace {
    pub first: u32,
    pub count: u32,
}

impl Dcel {
    /// Axis-aligned box hull; the standard smoke-test polyhedron.
    pub fn box_hull(half: Vector3<f32>) -> Self {
        let vertices = vec![
            Vector3::new(-half.x, -half.y, -half.z),
            Vector3::new(half.x, -half.y, -half.z),
            Vector3::new(half.x, half.y, -half.z),
            Vector3::new(-half.x, half.y, -half.z),
            Vector3::new(-half.x, -half.y, half.z),
            Vector3::new(half.x, -half.y, half.z),
            Vector3::new(half.x, half.y, half.z),
            Vector3::new(-half.x, half.y, half.z),
        ];
        let quads: [[u32; 4]; 6] = [
            [1, 0, 3, 2],
            [4, 5, 6, 7],
            [0, 1, 5, 4],
            [2, 3, 7, 6],
            [0, 4, 7, 3],
            [5, 1, 2, 6],
        ];
        let mut edges = Vec::new();
        let mut faces = Vec::new();
        for quad in quads.iter() {
            faces.push(DcelFace {
                first: edges.len() as u32,
                count: 4,
            });
            for &origin in quad.iter() {
                edges.push(DcelEdge { origin });
            }
        }
        Self {
            vertices,
            edges,
            faces,
        }
    }
}

/// Triangle soup input for collision debug drawing.
#[derive(Clone, Debug, Default)]
pub struct TriMesh {
    pub vertices: Vec<Vector3<f32>>,
    pub triangles: Vec<[u32; 3]>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sphere_counts_match_strip_layout() {
        let refinement = 4u32;
        let pps = 2 * refinement;
        let mut mesh = RMesh::default();
        mesh.set_sphere(2.0, refinement);

        assert_eq!(mesh.vertex_count(), 2 + (refinement - 1) * pps);
        assert_eq!(
            mesh.index_count(),
            2 * 3 * pps + (refinement - 2) * pps * 6
        );
        assert_eq!(mesh.index_max_used, mesh.vertex_count() - 1);
        assert!(mesh.index_data.iter().all(|&i| i < mesh.vertex_count()));
    }

    #[test]
    fn sphere_vertices_lie_on_surface_with_outward_normals() {
        let mut mesh = RMesh::default();
        mesh.set_sphere(3.0, 5);
        for v in mesh.vertex_data.iter() {
            let p = Vector3::from(v.position);
            let n = Vector3::from(v.normal);
            assert_relative_eq!(p.norm(), 3.0, epsilon = 1e-4);
            assert_relative_eq!(n.norm(), 1.0, epsilon = 1e-4);
            assert!(n.dot(&p) > 0.0);
        }
    }

    #[test]
    fn sphere_triangles_face_outward() {
        let mut mesh = RMesh::default();
        mesh.set_sphere(1.0, 4);
        for tri in mesh.index_data.chunks(3) {
            let a = Vector3::from(mesh.vertex_data[tri[0] as usize].position);
            let b = Vector3::from(mesh.vertex_data[tri[1] as usize].position);
            let c = Vector3::from(mesh.vertex_data[tri[2] as usize].position);
            let centroid = (a + b + c) / 3.0;
            let normal = (b - a).cross(&(c - a));
            assert!(normal.dot(&centroid) > 0.0);
        }
    }

    #[test]
    fn capsule_surface_distances() {
        let hh = 1.5f32;
        let r = 0.5f32;
        let mut mesh = RMesh::default();
        mesh.set_capsule(hh, r, 4);

        for v in mesh.vertex_data.iter() {
            let p = Vector3::from(v.position);
            // distance to the segment [(0,-hh,0), (0,hh,0)] equals the radius
            let clamped_y = p.y.clamp(-hh, hh);
            let d = (p - Vector3::new(0.0, clamped_y, 0.0)).norm();
            assert_relative_eq!(d, r, epsilon = 1e-4);
        }
        assert_eq!(mesh.index_max_used, mesh.vertex_count() - 1);
    }

    #[test]
    fn capsule_shares_ring_vertices() {
        let refinement = 3u32;
        let pps = 2 * refinement;
        let mut mesh = RMesh::default();
        mesh.set_capsule(1.0, 0.25, refinement);
        // poles + (2 * refinement cap rings + refinement - 1 cylinder rings)
        let rings = 2 * refinement + refinement - 1;
        assert_eq!(mesh.vertex_count(), 2 + rings * pps);
    }

    #[test]
    fn hull_fan_triangulation() {
        let hull = Dcel::box_hull(Vector3::new(0.5, 0.5, 0.5));
        let mut mesh = RMesh::default();
        mesh.set_hull(&hull);

        // 6 quads: 4 vertices and 2 triangles each
        assert_eq!(mesh.vertex_count(), 24);
        assert_eq!(mesh.index_count(), 36);

        // every face is flat: all four vertices share the face normal
        for face in mesh.vertex_data.chunks(4) {
            let n = face[0].normal;
            assert!(face.iter().all(|v| v.normal == n));
        }
    }

    #[test]
    fn box_triangles_face_outward() {
        let mut mesh = RMesh::default();
        mesh.set_stub_box();
        for tri in mesh.index_data.chunks(3) {
            let a = Vector3::from(mesh.vertex_data[tri[0] as usize].position);
            let b = Vector3::from(mesh.vertex_data[tri[1] as usize].position);
            let c = Vector3::from(mesh.vertex_data[tri[2] as usize].position);
            let centroid = (a + b + c) / 3.0;
            let normal = (b - a).cross(&(c - a));
            assert!(normal.dot(&centroid) > 0.0);
        }
    }

    #[test]
    fn tri_mesh_unpacks_soup() {
        let soup = TriMesh {
            vertices: vec![
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(0.0, 1.0, 0.0),
                Vector3::new(0.0, 0.0, 1.0),
            ],
            triangles: vec![[0, 1, 2], [0, 3, 1]],
        };
        let mut mesh = RMesh::default();
        mesh.set_tri_mesh(&soup);
        assert_eq!(mesh.vertex_count(), 6);
        assert_eq!(mesh.index_count(), 0);
        // CCW normal of the first triangle is +z
        assert_relative_eq!(mesh.vertex_data[0].normal[2], 1.0, epsilon = 1e-6);
    }
}
