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

use crate::text::TextLayout;
use bitflags::bitflags;

pub const AXIS_X: usize = 0;
pub const AXIS_Y: usize = 1;

bitflags! {
    #[derive(Default)]
    pub struct NodeFlags: u64 {
        // render path
        const DRAW_BACKGROUND       = 1 << 0;
        const DRAW_BORDER           = 1 << 1;
        const DRAW_EDGE_SOFTNESS    = 1 << 2;
        const DRAW_ROUNDED_CORNERS  = 1 << 3;
        const DRAW_GRADIENT         = 1 << 4;
        const DRAW_TEXT             = 1 << 5;
        const DRAW_SPRITE           = 1 << 6;
        const DRAW_TEXT_FADE        = 1 << 7;

        // interactions
        const INTER_HOVER             = 1 << 19;
        const INTER_LEFT_CLICK        = 1 << 20;
        const INTER_LEFT_DOUBLE_CLICK = 1 << 21;
        const INTER_DRAG              = 1 << 22;
        const INTER_SCROLL            = 1 << 23;

        // general control
        const SKIP_HOVER_SEARCH     = 1 << 38;
        const TEXT_ATTACHED         = 1 << 39;
        /// Lay text out against an infinite line width.
        const TEXT_ALLOW_OVERFLOW   = 1 << 40;
        /// Children may spill outside this node on the axis.
        const ALLOW_VIOLATION_X     = 1 << 43;
        const ALLOW_VIOLATION_Y     = 1 << 44;
        /// Absolute position from the floating stacks; exempt from the
        /// parent's compaction and violation solving.
        const FLOATING_X            = 1 << 45;
        const FLOATING_Y            = 1 << 46;
        /// Keeps its creation-time relative position but still joins
        /// violation solving.
        const FIXED_X               = 1 << 47;
        const FIXED_Y               = 1 << 48;

        // implicit; set by the library, never by callers
        const NON_HASHED            = 1 << 55;
        const TEXT_LAYOUT_POSTPONED = 1 << 56;
        const PAD                   = 1 << 57;
        const PAD_FILL              = 1 << 58;
        const PERC_POSTPONED_X      = 1 << 59;
        const PERC_POSTPONED_Y      = 1 << 60;

        const DRAW_MASK = Self::DRAW_BACKGROUND.bits
            | Self::DRAW_BORDER.bits
            | Self::DRAW_EDGE_SOFTNESS.bits
            | Self::DRAW_ROUNDED_CORNERS.bits
            | Self::DRAW_GRADIENT.bits
            | Self::DRAW_SPRITE.bits
            | Self::DRAW_TEXT_FADE.bits;

        const INTER_MASK = Self::INTER_HOVER.bits
            | Self::INTER_LEFT_CLICK.bits
            | Self::INTER_LEFT_DOUBLE_CLICK.bits
            | Self::INTER_DRAG.bits
            | Self::INTER_SCROLL.bits;
    }
}

impl NodeFlags {
    pub fn perc_postponed(axis: usize) -> Self {
        if axis == AXIS_X {
            Self::PERC_POSTPONED_X
        } else {
            Self::PERC_POSTPONED_Y
        }
    }

    pub fn floating(axis: usize) -> Self {
        if axis == AXIS_X {
            Self::FLOATING_X
        } else {
            Self::FLOATING_Y
        }
    }

    pub fn fixed(axis: usize) -> Self {
        if axis == AXIS_X {
            Self::FIXED_X
        } else {
            Self::FIXED_Y
        }
    }

    pub fn allow_violation(axis: usize) -> Self {
        if axis == AXIS_X {
            Self::ALLOW_VIOLATION_X
        } else {
            Self::ALLOW_VIOLATION_Y
        }
    }
}

/// Semantic size of one axis; resolved to pixels over the layout passes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SemanticSize {
    None,
    Pixel { px: f32, strictness: f32 },
    /// Percentage of the parent's final size.
    PercParent { pct: f32, strictness: f32 },
    /// Percentage of a pushed viewable interval in user units.
    Unit { low: f32, high: f32 },
    /// Sum of children along the layout axis (max across it).
    ChildSum { strictness: f32 },
    /// The text layout's bounding box.
    Text { strictness: f32 },
}

impl Default for SemanticSize {
    fn default() -> Self {
        Self::None
    }
}

impl SemanticSize {
    pub fn strictness(&self) -> f32 {
        match *self {
            Self::Pixel { strictness, .. }
            | Self::PercParent { strictness, .. }
            | Self::ChildSum { strictness }
            | Self::Text { strictness } => strictness,
            Self::None | Self::Unit { .. } => 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Interval {
    pub low: f32,
    pub high: f32,
}

impl Interval {
    pub fn new(low: f32, high: f32) -> Self {
        Self { low, high }
    }

    pub fn length(&self) -> f32 {
        (self.high - self.low).max(0.0)
    }

    pub fn contains(&self, at: f32) -> bool {
        self.low <= at && at <= self.high
    }

    pub fn intersect(&self, other: &Interval) -> Interval {
        Interval {
            low: self.low.max(other.low),
            high: self.high.min(other.high),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AlignX {
    Left,
    #[default]
    Center,
    Right,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AlignY {
    Bottom,
    #[default]
    Center,
    Top,
}

/// Per-node interaction results; written at `frame_end`, read by widget
/// code the following frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct InterState {
    pub hovered: bool,
    pub active: bool,
    pub clicked: bool,
    pub double_clicked: bool,
    pub released: bool,
    pub dragging: bool,
    pub drag_delta: [f32; 2],
    pub scrolled: i32,
}

#[derive(Clone, Debug, Default)]
pub struct UiNode {
    /// Stable identity (the part after `###`).
    pub id: String,
    /// Display text (the part before `###`).
    pub text: String,
    pub flags: NodeFlags,
    pub last_frame_touched: u64,
    pub key: u32,
    pub depth: u32,

    pub font: u32,
    pub sprite: u32,

    pub child_layout_axis: usize,
    pub semantic_size: [SemanticSize; 2],
    pub viewable: [Interval; 2],
    pub unit_interval: [Interval; 2],

    pub text_align: (AlignX, AlignY),
    pub text_pad: [f32; 2],
    pub text_layout: Option<TextLayout>,

    /// Parent-relative position and resolved size during layout.
    pub layout_position: [f32; 2],
    pub layout_size: [f32; 2],
    /// Creation-time absolute position for floating axes.
    pub floating_position: [f32; 2],

    /// Final window-absolute placement, bottom-left origin.
    pub pixel_position: [f32; 2],
    pub pixel_size: [f32; 2],
    pub pixel_visible: [Interval; 2],

    pub background_color: [f32; 4],
    pub border_color: [f32; 4],
    pub sprite_color: [f32; 4],
    pub gradient_color: [[f32; 4]; 4],
    pub border_size: f32,
    pub edge_softness: f32,
    pub corner_radius: f32,

    pub inter: InterState,
}

impl UiNode {
    pub fn rect_contains(&self, at: [f32; 2]) -> bool {
        self.pixel_visible[AXIS_X].contains(at[0]) && self.pixel_visible[AXIS_Y].contains(at[1])
    }

    pub fn has_draw_flags(&self) -> bool {
        self.flags.intersects(NodeFlags::DRAW_MASK)
    }

    pub fn has_inter_flags(&self) -> bool {
        self.flags.intersects(NodeFlags::INTER_MASK)
    }
}
