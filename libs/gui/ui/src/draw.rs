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

//! Draw buckets and the GPU-facing quad-instance records.
//!
//! Every drawn quad, one bucket per `(depth, layer, texture)` key. The
//! renderer consumes buckets as instanced draw units; the packed record
//! layout below is the shared (per-instance) vertex stream.

use crate::{
    node::{AlignX, AlignY, NodeFlags, UiNode, AXIS_X, AXIS_Y},
    text::Font,
    Ui,
};
use static_assertions::const_assert_eq;
use zerocopy::AsBytes;

pub const UI_CMD_TEXTURE_BITS: u32 = 14;
pub const UI_CMD_LAYER_BITS: u32 = 2;
pub const UI_CMD_DEPTH_BITS: u32 = 32 - UI_CMD_TEXTURE_BITS - UI_CMD_LAYER_BITS;

pub const UI_CMD_TEXTURE_LOW_BIT: u32 = 0;
pub const UI_CMD_LAYER_LOW_BIT: u32 = UI_CMD_TEXTURE_BITS;
pub const UI_CMD_DEPTH_LOW_BIT: u32 = UI_CMD_TEXTURE_BITS + UI_CMD_LAYER_BITS;

pub const UI_LAYER_TEXT: u32 = 0;
pub const UI_LAYER_TEXT_SELECTION: u32 = 1;
pub const UI_LAYER_INTER: u32 = 2;
pub const UI_LAYER_VISUAL: u32 = 3;

pub fn ui_cmd(depth: u32, layer: u32, texture: u32) -> u32 {
    debug_assert!(depth < (1 << UI_CMD_DEPTH_BITS));
    debug_assert!(layer < (1 << UI_CMD_LAYER_BITS));
    debug_assert!(texture < (1 << UI_CMD_TEXTURE_BITS));
    (depth << UI_CMD_DEPTH_LOW_BIT)
        | (layer << UI_CMD_LAYER_LOW_BIT)
        | (texture << UI_CMD_TEXTURE_LOW_BIT)
}

pub fn ui_cmd_depth(cmd: u32) -> u32 {
    cmd >> UI_CMD_DEPTH_LOW_BIT
}

pub fn ui_cmd_layer(cmd: u32) -> u32 {
    (cmd >> UI_CMD_LAYER_LOW_BIT) & ((1 << UI_CMD_LAYER_BITS) - 1)
}

pub fn ui_cmd_texture(cmd: u32) -> u32 {
    cmd & ((1 << UI_CMD_TEXTURE_BITS) - 1)
}

/// Shared (instanced) vertex record; little-endian floats, packed to 4.
/// Rectangles are `(center_x, center_y, half_w, half_h)`.
#[repr(C)]
#[derive(AsBytes, Clone, Copy, Debug, Default)]
pub struct UiSharedInstance {
    pub node_rect: [f32; 4],
    pub visible_rect: [f32; 4],
    pub uv_rect: [f32; 4],
    pub background_color: [f32; 4],
    pub border_color: [f32; 4],
    pub sprite_color: [f32; 4],
    /// border_size, corner_radius, edge_softness
    pub extra: [f32; 3],
    pub gradient_br: [f32; 4],
    pub gradient_tr: [f32; 4],
    pub gradient_tl: [f32; 4],
    pub gradient_bl: [f32; 4],
}

pub const UI_SHARED_STRIDE: usize = std::mem::size_of::<UiSharedInstance>();
const_assert_eq!(UI_SHARED_STRIDE, 172);

/// Atlas sprite rectangle.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sprite {
    pub texture: u32,
    pub bl: [f32; 2],
    pub tr: [f32; 2],
}

/// A text-selection rectangle queued for this frame.
#[derive(Clone, Debug)]
pub(crate) struct TextSelection {
    pub node: u32,
    pub low: u32,
    pub high: u32,
    pub color: [f32; 4],
}

/// One instanced draw unit; `entries` are node indices (or selection stack
/// indices on the TEXT_SELECTION layer) and `count` is the quad count.
#[derive(Clone, Debug, Default)]
pub struct DrawBucket {
    pub cmd: u32,
    pub count: u32,
    pub(crate) entries: Vec<u32>,
}

fn rect_center(low: [f32; 2], size: [f32; 2]) -> [f32; 4] {
    [
        low[0] + size[0] / 2.0,
        low[1] + size[1] / 2.0,
        size[0] / 2.0,
        size[1] / 2.0,
    ]
}

fn visible_rect(node: &UiNode) -> [f32; 4] {
    let x = &node.pixel_visible[AXIS_X];
    let y = &node.pixel_visible[AXIS_Y];
    [
        (x.high + x.low) / 2.0,
        (y.high + y.low) / 2.0,
        (x.high - x.low) / 2.0,
        (y.high - y.low) / 2.0,
    ]
}

fn uv_rect(bl: [f32; 2], tr: [f32; 2]) -> [f32; 4] {
    [
        (tr[0] + bl[0]) / 2.0,
        (tr[1] + bl[1]) / 2.0,
        (tr[0] - bl[0]) / 2.0,
        (tr[1] - bl[1]) / 2.0,
    ]
}

/// Window-space origin of a node's text block under its alignment.
fn text_origin(node: &UiNode, font: &Font) -> [f32; 2] {
    let layout = node.text_layout.as_ref().expect("text layout");
    let x = match node.text_align.0 {
        AlignX::Center => {
            node.pixel_position[AXIS_X] + (node.pixel_size[AXIS_X] - layout.width) / 2.0
        }
        AlignX::Left => node.pixel_position[AXIS_X] + node.text_pad[AXIS_X],
        AlignX::Right => {
            node.pixel_position[AXIS_X] + node.pixel_size[AXIS_X]
                - node.text_pad[AXIS_X]
                - layout.width
        }
    };
    let block_height = font.linespace * layout.line_count() as f32;
    let y = match node.text_align.1 {
        AlignY::Center => {
            node.pixel_position[AXIS_Y] + (node.pixel_size[AXIS_Y] + block_height) / 2.0
        }
        AlignY::Top => {
            node.pixel_position[AXIS_Y] + node.pixel_size[AXIS_Y] - node.text_pad[AXIS_Y]
        }
        AlignY::Bottom => node.pixel_position[AXIS_Y] + block_height + node.text_pad[AXIS_Y],
    };
    [x.round(), y.round()]
}

impl Ui {
    pub(crate) fn bucket_for(&mut self, cmd: u32) -> usize {
        if self.bucket_cache < self.buckets.len() && self.buckets[self.bucket_cache].cmd == cmd {
            return self.bucket_cache;
        }
        let mut at = self.bucket_map.first(cmd);
        while at != containers::HASH_NULL {
            if self.buckets[at as usize].cmd == cmd {
                self.bucket_cache = at as usize;
                return at as usize;
            }
            at = self.bucket_map.next(at);
        }
        let index = self.buckets.len();
        self.buckets.push(DrawBucket {
            cmd,
            count: 0,
            entries: Vec::new(),
        });
        self.bucket_map.add(cmd, index as u32);
        self.bucket_cache = index;
        index
    }

    /// Build this frame's buckets from the laid-out tree. Text buckets
    /// count glyphs, not nodes, so the renderer can size instance buffers
    /// directly from `count`.
    pub(crate) fn build_buckets(&mut self, order: &[u32]) {
        self.buckets.clear();
        self.bucket_map.flush();
        self.bucket_cache = 0;

        for &at in order.iter() {
            if at == self.root {
                continue;
            }
            let node = self.nodes.get(at);
            let depth = node.depth.min((1 << UI_CMD_DEPTH_BITS) - 1);

            if node.has_draw_flags() {
                let layer = if node.has_inter_flags() {
                    UI_LAYER_INTER
                } else {
                    UI_LAYER_VISUAL
                };
                let texture = if node.flags.contains(NodeFlags::DRAW_SPRITE) {
                    self.sprites[node.sprite as usize].texture
                } else {
                    0
                };
                let bucket = self.bucket_for(ui_cmd(depth, layer, texture));
                self.buckets[bucket].entries.push(at);
                self.buckets[bucket].count += 1;
            }

            let node = self.nodes.get(at);
            if node.flags.contains(NodeFlags::DRAW_TEXT) {
                if let Some(layout) = node.text_layout.as_ref() {
                    let glyphs = layout.glyph_count();
                    if glyphs > 0 {
                        let texture = self.fonts[node.font as usize].texture;
                        let bucket = self.bucket_for(ui_cmd(depth, UI_LAYER_TEXT, texture));
                        self.buckets[bucket].entries.push(at);
                        self.buckets[bucket].count += glyphs;
                    }
                }
            }
        }

        for index in 0..self.selections.len() {
            let node = self.selections[index].node;
            if !self.nodes.is_allocated(node) {
                continue;
            }
            let depth = self.nodes.get(node).depth;
            let cmd = ui_cmd(depth, UI_LAYER_TEXT_SELECTION, 0);
            let bucket = self.bucket_for(cmd);
            self.buckets[bucket].entries.push(index as u32);
            self.buckets[bucket].count += 1;
        }
    }

    pub fn buckets(&self) -> &[DrawBucket] {
        &self.buckets
    }

    /// Serialize one bucket's shared instance stream into `out`, which must
    /// hold exactly `count * UI_SHARED_STRIDE` bytes.
    pub fn write_bucket_instances(&self, bucket: &DrawBucket, out: &mut [u8]) {
        debug_assert_eq!(out.len(), bucket.count as usize * UI_SHARED_STRIDE);
        let mut cursor = 0usize;
        let mut emit = |record: &UiSharedInstance, cursor: &mut usize| {
            out[*cursor..*cursor + UI_SHARED_STRIDE].copy_from_slice(record.as_bytes());
            *cursor += UI_SHARED_STRIDE;
        };

        match ui_cmd_layer(bucket.cmd) {
            UI_LAYER_TEXT => {
                for &at in bucket.entries.iter() {
                    let node = self.nodes.get(at);
                    let font = &self.fonts[node.font as usize];
                    let layout = node.text_layout.as_ref().expect("text bucket layout");
                    let origin = text_origin(node, font);
                    let visible = visible_rect(node);
                    for (l, line) in layout.lines.iter().enumerate() {
                        let baseline = [
                            origin[0],
                            origin[1] - font.ascent - l as f32 * font.linespace,
                        ];
                        for placed in line.glyphs.iter() {
                            let glyph = font.glyph(placed.codepoint);
                            let low = [
                                baseline[0] + glyph.bearing[0] + placed.x,
                                baseline[1] + glyph.bearing[1],
                            ];
                            emit(
                                &UiSharedInstance {
                                    node_rect: [
                                        low[0] + glyph.size[0] / 2.0,
                                        low[1] - glyph.size[1] / 2.0,
                                        glyph.size[0] / 2.0,
                                        glyph.size[1] / 2.0,
                                    ],
                                    visible_rect: visible,
                                    uv_rect: uv_rect(glyph.uv_bl, glyph.uv_tr),
                                    sprite_color: node.sprite_color,
                                    ..Default::default()
                                },
                                &mut cursor,
                            );
                        }
                    }
                }
            }
            UI_LAYER_TEXT_SELECTION => {
                for &index in bucket.entries.iter() {
                    let selection = &self.selections[index as usize];
                    let node = self.nodes.get(selection.node);
                    let font = &self.fonts[node.font as usize];
                    let layout = node.text_layout.as_ref().expect("selection layout");
                    debug_assert_eq!(layout.line_count(), 1);
                    let line = &layout.lines[0];
                    let mut origin = text_origin(node, font);

                    let space = font.glyph(' ' as u32);
                    let height = font.linespace;
                    let mut width = space.advance;
                    let low = selection.low as usize;
                    let high = selection.high as usize;
                    if low != high && high >= 1 && high - 1 < line.glyphs.len() {
                        width += line.glyphs[high - 1].x - line.glyphs[low.min(line.glyphs.len() - 1)].x;
                    }
                    if low > 0 && low <= line.glyphs.len() {
                        let end = font.glyph(line.glyphs[low - 1].codepoint);
                        origin[0] += line.glyphs[low - 1].x + end.advance;
                    }

                    emit(
                        &UiSharedInstance {
                            node_rect: [
                                origin[0] + width / 2.0,
                                origin[1] - height / 2.0,
                                width / 2.0,
                                height / 2.0,
                            ],
                            visible_rect: visible_rect(node),
                            background_color: selection.color,
                            ..Default::default()
                        },
                        &mut cursor,
                    );
                }
            }
            _ => {
                for &at in bucket.entries.iter() {
                    let node = self.nodes.get(at);
                    let sprite = &self.sprites[node.sprite as usize];
                    emit(
                        &UiSharedInstance {
                            node_rect: rect_center(node.pixel_position, node.pixel_size),
                            visible_rect: visible_rect(node),
                            uv_rect: uv_rect(sprite.bl, sprite.tr),
                            background_color: node.background_color,
                            border_color: node.border_color,
                            sprite_color: node.sprite_color,
                            extra: [node.border_size, node.corner_radius, node.edge_softness],
                            gradient_br: node.gradient_color[0],
                            gradient_tr: node.gradient_color[1],
                            gradient_tl: node.gradient_color[2],
                            gradient_bl: node.gradient_color[3],
                        },
                        &mut cursor,
                    );
                }
            }
        }
        debug_assert_eq!(cursor, out.len());
    }
}
