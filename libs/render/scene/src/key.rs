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

//! 64-bit render command sort key.
//!
//! MSB-first field layout; a plain unsigned compare therefore orders by
//! screen layer, then transparency, then depth, then material, with the
//! primitive/instanced/elements bits as tie breakers. Larger keys draw
//! earlier.

pub const SCREEN_LAYER_BITS: u32 = 1;
pub const TRANSPARENCY_BITS: u32 = 2;
pub const DEPTH_BITS: u32 = 23;
pub const MATERIAL_BITS: u32 = 30;
pub const PRIMITIVE_BITS: u32 = 1;
pub const INSTANCED_BITS: u32 = 1;
pub const ELEMENTS_BITS: u32 = 1;
pub const UNUSED_BITS: u32 = 64
    - SCREEN_LAYER_BITS
    - TRANSPARENCY_BITS
    - DEPTH_BITS
    - MATERIAL_BITS
    - PRIMITIVE_BITS
    - INSTANCED_BITS
    - ELEMENTS_BITS;

pub const ELEMENTS_LOW_BIT: u32 = 0;
pub const INSTANCED_LOW_BIT: u32 = ELEMENTS_BITS;
pub const PRIMITIVE_LOW_BIT: u32 = INSTANCED_LOW_BIT + INSTANCED_BITS;
pub const MATERIAL_LOW_BIT: u32 = PRIMITIVE_LOW_BIT + PRIMITIVE_BITS;
pub const DEPTH_LOW_BIT: u32 = MATERIAL_LOW_BIT + MATERIAL_BITS;
pub const TRANSPARENCY_LOW_BIT: u32 = DEPTH_LOW_BIT + DEPTH_BITS;
pub const SCREEN_LAYER_LOW_BIT: u32 = TRANSPARENCY_LOW_BIT + TRANSPARENCY_BITS;

pub const SCREEN_LAYER_HUD: u64 = 0;
pub const SCREEN_LAYER_GAME: u64 = 1;

/// Opaque draws first, normal blending last.
pub const TRANSPARENCY_OPAQUE: u64 = 3;
pub const TRANSPARENCY_ADDITIVE: u64 = 2;
pub const TRANSPARENCY_SUBTRACTIVE: u64 = 1;
pub const TRANSPARENCY_NORMAL: u64 = 0;

pub const PRIMITIVE_TRIANGLE: u64 = 0;
pub const PRIMITIVE_LINE: u64 = 1;

pub const NON_INSTANCED: u64 = 0;
pub const INSTANCED: u64 = 1;

pub const ARRAYS: u64 = 0;
pub const ELEMENTS: u64 = 1;

pub const DEPTH_MAX: u64 = (1 << DEPTH_BITS) - 1;

// material sub-layout, MSB-first program | mesh | texture | unused
pub const MATERIAL_PROGRAM_BITS: u32 = 2;
pub const MATERIAL_MESH_BITS: u32 = 10;
pub const MATERIAL_TEXTURE_BITS: u32 = 3;
pub const MATERIAL_UNUSED_BITS: u32 =
    MATERIAL_BITS - MATERIAL_PROGRAM_BITS - MATERIAL_MESH_BITS - MATERIAL_TEXTURE_BITS;

pub const MATERIAL_TEXTURE_LOW_BIT: u32 = 0;
pub const MATERIAL_MESH_LOW_BIT: u32 = MATERIAL_TEXTURE_BITS;
pub const MATERIAL_PROGRAM_LOW_BIT: u32 = MATERIAL_MESH_LOW_BIT + MATERIAL_MESH_BITS;

pub const MESH_NONE: u64 = 0;

pub const PROGRAM_UI: u64 = 0;
pub const PROGRAM_PROXY3D: u64 = 1;
pub const PROGRAM_DEBUG: u64 = 2;
pub const PROGRAM_COUNT: u64 = 3;

fn field_fits(value: u64, bits: u32) -> bool {
    value < (1u64 << bits)
}

pub fn material(program: u64, mesh: u64, texture: u64) -> u64 {
    debug_assert!(field_fits(program, MATERIAL_PROGRAM_BITS));
    debug_assert!(field_fits(mesh, MATERIAL_MESH_BITS));
    debug_assert!(field_fits(texture, MATERIAL_TEXTURE_BITS));
    (program << MATERIAL_PROGRAM_LOW_BIT)
        | (mesh << MATERIAL_MESH_LOW_BIT)
        | (texture << MATERIAL_TEXTURE_LOW_BIT)
}

pub fn material_program(material: u64) -> u64 {
    (material >> MATERIAL_PROGRAM_LOW_BIT) & ((1 << MATERIAL_PROGRAM_BITS) - 1)
}

pub fn material_mesh(material: u64) -> u64 {
    (material >> MATERIAL_MESH_LOW_BIT) & ((1 << MATERIAL_MESH_BITS) - 1)
}

pub fn material_texture(material: u64) -> u64 {
    material & ((1 << MATERIAL_TEXTURE_BITS) - 1)
}

/// Newtype over the packed key; field extraction goes through the
/// accessors below.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct CmdKey(pub u64);

impl CmdKey {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        screen_layer: u64,
        depth: u64,
        transparency: u64,
        material: u64,
        primitive: u64,
        instanced: u64,
        elements: u64,
    ) -> Self {
        debug_assert!(field_fits(screen_layer, SCREEN_LAYER_BITS));
        debug_assert!(field_fits(depth, DEPTH_BITS));
        debug_assert!(field_fits(transparency, TRANSPARENCY_BITS));
        debug_assert!(field_fits(material, MATERIAL_BITS));
        debug_assert!(field_fits(primitive, PRIMITIVE_BITS));
        debug_assert!(field_fits(instanced, INSTANCED_BITS));
        debug_assert!(field_fits(elements, ELEMENTS_BITS));
        Self(
            (screen_layer << SCREEN_LAYER_LOW_BIT)
                | (depth << DEPTH_LOW_BIT)
                | (transparency << TRANSPARENCY_LOW_BIT)
                | (material << MATERIAL_LOW_BIT)
                | (primitive << PRIMITIVE_LOW_BIT)
                | (instanced << INSTANCED_LOW_BIT)
                | (elements << ELEMENTS_LOW_BIT),
        )
    }

    pub fn screen_layer(&self) -> u64 {
        (self.0 >> SCREEN_LAYER_LOW_BIT) & ((1 << SCREEN_LAYER_BITS) - 1)
    }

    pub fn depth(&self) -> u64 {
        (self.0 >> DEPTH_LOW_BIT) & ((1 << DEPTH_BITS) - 1)
    }

    pub fn transparency(&self) -> u64 {
        (self.0 >> TRANSPARENCY_LOW_BIT) & ((1 << TRANSPARENCY_BITS) - 1)
    }

    pub fn material(&self) -> u64 {
        (self.0 >> MATERIAL_LOW_BIT) & ((1 << MATERIAL_BITS) - 1)
    }

    pub fn primitive(&self) -> u64 {
        (self.0 >> PRIMITIVE_LOW_BIT) & ((1 << PRIMITIVE_BITS) - 1)
    }

    pub fn instanced(&self) -> u64 {
        (self.0 >> INSTANCED_LOW_BIT) & ((1 << INSTANCED_BITS) - 1)
    }

    pub fn elements(&self) -> u64 {
        (self.0 >> ELEMENTS_LOW_BIT) & ((1 << ELEMENTS_BITS) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_round_trip() {
        let mat = material(PROGRAM_PROXY3D, 37, 5);
        let key = CmdKey::new(
            SCREEN_LAYER_GAME,
            123_456,
            TRANSPARENCY_OPAQUE,
            mat,
            PRIMITIVE_LINE,
            INSTANCED,
            ELEMENTS,
        );
        assert_eq!(key.screen_layer(), SCREEN_LAYER_GAME);
        assert_eq!(key.depth(), 123_456);
        assert_eq!(key.transparency(), TRANSPARENCY_OPAQUE);
        assert_eq!(key.material(), mat);
        assert_eq!(key.primitive(), PRIMITIVE_LINE);
        assert_eq!(key.instanced(), INSTANCED);
        assert_eq!(key.elements(), ELEMENTS);
        assert_eq!(material_program(mat), PROGRAM_PROXY3D);
        assert_eq!(material_mesh(mat), 37);
        assert_eq!(material_texture(mat), 5);
    }

    #[test]
    fn ordering_is_screen_then_transparency_then_depth() {
        let low = CmdKey::new(SCREEN_LAYER_HUD, DEPTH_MAX, TRANSPARENCY_OPAQUE, 0, 0, 0, 0);
        let high = CmdKey::new(SCREEN_LAYER_GAME, 0, TRANSPARENCY_NORMAL, 0, 0, 0, 0);
        assert!(high > low);

        let opaque = CmdKey::new(SCREEN_LAYER_GAME, 10, TRANSPARENCY_OPAQUE, 0, 0, 0, 0);
        let blended = CmdKey::new(SCREEN_LAYER_GAME, 500, TRANSPARENCY_NORMAL, 0, 0, 0, 0);
        assert!(opaque > blended);

        let near = CmdKey::new(SCREEN_LAYER_GAME, 10, TRANSPARENCY_OPAQUE, 0, 0, 0, 0);
        let far = CmdKey::new(SCREEN_LAYER_GAME, 20, TRANSPARENCY_OPAQUE, 0, 0, 0, 0);
        assert!(far > near);
    }

    #[test]
    fn bit_budget_is_exact() {
        assert_eq!(
            SCREEN_LAYER_BITS
                + TRANSPARENCY_BITS
                + DEPTH_BITS
                + MATERIAL_BITS
                + PRIMITIVE_BITS
                + INSTANCED_BITS
                + ELEMENTS_BITS
                + UNUSED_BITS,
            64
        );
        assert_eq!(UNUSED_BITS, 5);
        assert_eq!(MATERIAL_UNUSED_BITS, 15);
    }
}
