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

//! Retained-immediate UI.
//!
//! Callers rebuild the widget tree every frame; nodes are keyed by a stable
//! identity so state (interactions, caching) survives across frames. A
//! frame runs: build (node creation against attribute stacks) → prune →
//! autolayout → interaction update → draw-bucket emission. The renderer
//! consumes the buckets as instanced quads.
//!
//! Node identifiers follow the `display text###stable identity` convention;
//! everything after the `###` names the node, everything before it is shown.

mod draw;
mod interact;
mod layout;
mod node;
mod text;
pub mod widgets;

pub use crate::{
    draw::{
        ui_cmd, ui_cmd_depth, ui_cmd_layer, ui_cmd_texture, DrawBucket, Sprite, UiSharedInstance,
        UI_CMD_DEPTH_BITS, UI_CMD_LAYER_BITS, UI_CMD_TEXTURE_BITS, UI_LAYER_INTER, UI_LAYER_TEXT,
        UI_LAYER_TEXT_SELECTION, UI_LAYER_VISUAL, UI_SHARED_STRIDE,
    },
    interact::{
        InputSnapshot, Key, KeyPress, MOUSE_BUTTON_COUNT, MOUSE_LEFT, MOUSE_MIDDLE, MOUSE_RIGHT,
    },
    node::{
        AlignX, AlignY, InterState, Interval, NodeFlags, SemanticSize, UiNode, AXIS_X, AXIS_Y,
    },
    text::{
        apply_text_op, layout_text, Font, Glyph, PlacedGlyph, TextEditState, TextLayout, TextLine,
        TextOp,
    },
};

use crate::{draw::TextSelection, interact::InterPersist};
use arena::Arena;
use containers::{ChainMap, HierarchyIndex, HASH_NULL, HI_ROOT_STUB_INDEX};
use log::warn;

pub const DEFAULT_NS_DOUBLE_CLICK: u64 = 350_000_000;

/// Default visual attributes pushed at the bottom of every stack each
/// frame.
#[derive(Clone, Debug)]
pub struct UiVisual {
    pub background_color: [f32; 4],
    pub border_color: [f32; 4],
    pub sprite_color: [f32; 4],
    pub gradient_color: [[f32; 4]; 4],
    pub text_cursor_color: [f32; 4],
    pub text_selection_color: [f32; 4],
    pub border_size: f32,
    pub edge_softness: f32,
    pub corner_radius: f32,
    pub text_pad: [f32; 2],
}

impl Default for UiVisual {
    fn default() -> Self {
        Self {
            background_color: [0.10, 0.10, 0.12, 1.0],
            border_color: [0.35, 0.35, 0.40, 1.0],
            sprite_color: [1.0, 1.0, 1.0, 1.0],
            gradient_color: [[0.0; 4]; 4],
            text_cursor_color: [0.9, 0.9, 0.9, 0.9],
            text_selection_color: [0.25, 0.40, 0.70, 0.55],
            border_size: 1.0,
            edge_softness: 1.0,
            corner_radius: 4.0,
            text_pad: [4.0, 2.0],
        }
    }
}

macro_rules! attr_stack {
    ($push:ident, $pop:ident, $field:ident, $t:ty) => {
        pub fn $push(&mut self, value: $t) {
            self.$field.push(value);
        }

        pub fn $pop(&mut self) {
            self.$field.pop();
            debug_assert!(!self.$field.is_empty(), "attribute stack underflow");
        }
    };
}

pub struct Ui {
    nodes: HierarchyIndex<UiNode>,
    node_map: ChainMap,
    root: u32,
    frame: u64,
    window_size: [f32; 2],
    mem_frame: Arena,

    pub(crate) fonts: Vec<Font>,
    pub(crate) sprites: Vec<Sprite>,

    // attribute stacks; index 0 holds the frame default
    stack_parent: Vec<u32>,
    stack_font: Vec<u32>,
    stack_sprite: Vec<u32>,
    stack_size: [Vec<SemanticSize>; 2],
    stack_viewable: [Vec<Interval>; 2],
    stack_child_axis: Vec<usize>,
    stack_floating: [Vec<f32>; 2],
    stack_align_x: Vec<AlignX>,
    stack_align_y: Vec<AlignY>,
    stack_text_pad: [Vec<f32>; 2],
    stack_background: Vec<[f32; 4]>,
    stack_border_color: Vec<[f32; 4]>,
    stack_sprite_color: Vec<[f32; 4]>,
    stack_gradient: Vec<[[f32; 4]; 4]>,
    stack_border_size: Vec<f32>,
    stack_edge_softness: Vec<f32>,
    stack_corner_radius: Vec<f32>,

    pub(crate) floating_nodes: Vec<u32>,
    pub(crate) selections: Vec<TextSelection>,
    pub(crate) buckets: Vec<DrawBucket>,
    pub(crate) bucket_map: ChainMap,
    pub(crate) bucket_cache: usize,

    pub(crate) input: InputSnapshot,
    pub(crate) persist: InterPersist,
    pub(crate) ns_now: u64,
    pub ns_double_click: u64,
    text_edit: Option<TextEditState>,
    visual: UiVisual,

    node_count_frame: u32,
    node_count_prev_frame: u32,
}

impl Ui {
    pub fn new(mut fonts: Vec<Font>, mut sprites: Vec<Sprite>) -> anyhow::Result<Self> {
        if fonts.is_empty() {
            fonts.push(Font::fixed_advance(8.0, 10.0, 3.0));
        }
        if sprites.is_empty() {
            sprites.push(Sprite {
                texture: 0,
                bl: [0.0, 0.0],
                tr: [1.0, 1.0],
            });
        }

        let mut nodes: HierarchyIndex<UiNode> = HierarchyIndex::new(1024, true);
        let root = nodes
            .add(HI_ROOT_STUB_INDEX)
            .expect("ui root allocation");
        {
            let node = nodes.get_mut(root);
            node.id = "root".to_owned();
            node.key = fxhash::hash32("root");
            node.depth = 0;
        }

        Ok(Self {
            nodes,
            node_map: ChainMap::new(1024, 1024, true),
            root,
            frame: 0,
            window_size: [0.0, 0.0],
            mem_frame: Arena::with_capacity(256 * 1024)?,
            fonts,
            sprites,
            stack_parent: Vec::new(),
            stack_font: Vec::new(),
            stack_sprite: Vec::new(),
            stack_size: [Vec::new(), Vec::new()],
            stack_viewable: [Vec::new(), Vec::new()],
            stack_child_axis: Vec::new(),
            stack_floating: [Vec::new(), Vec::new()],
            stack_align_x: Vec::new(),
            stack_align_y: Vec::new(),
            stack_text_pad: [Vec::new(), Vec::new()],
            stack_background: Vec::new(),
            stack_border_color: Vec::new(),
            stack_sprite_color: Vec::new(),
            stack_gradient: Vec::new(),
            stack_border_size: Vec::new(),
            stack_edge_softness: Vec::new(),
            stack_corner_radius: Vec::new(),
            floating_nodes: Vec::new(),
            selections: Vec::new(),
            buckets: Vec::new(),
            bucket_map: ChainMap::new(256, 256, true),
            bucket_cache: 0,
            input: InputSnapshot::default(),
            persist: InterPersist::default(),
            ns_now: 0,
            ns_double_click: DEFAULT_NS_DOUBLE_CLICK,
            text_edit: None,
            visual: UiVisual::default(),
            node_count_frame: 0,
            node_count_prev_frame: 0,
        })
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn window_size(&self) -> [f32; 2] {
        self.window_size
    }

    pub fn node_count_prev_frame(&self) -> u32 {
        self.node_count_prev_frame
    }

    pub fn get(&self, index: u32) -> &UiNode {
        self.nodes.get(index)
    }

    pub fn get_mut(&mut self, index: u32) -> &mut UiNode {
        self.nodes.get_mut(index)
    }

    /// Begin a frame: reset every attribute stack to `visual`'s defaults
    /// and touch the persistent root node.
    pub fn frame_begin(
        &mut self,
        window_size: [f32; 2],
        visual: &UiVisual,
        input: InputSnapshot,
        ns_now: u64,
    ) {
        self.frame += 1;
        self.window_size = window_size;
        self.input = input;
        self.ns_now = ns_now;
        self.visual = visual.clone();
        self.mem_frame.flush();

        self.stack_parent.clear();
        self.stack_parent.push(self.root);
        self.stack_font.clear();
        self.stack_font.push(0);
        self.stack_sprite.clear();
        self.stack_sprite.push(0);
        for axis in [AXIS_X, AXIS_Y] {
            self.stack_size[axis].clear();
            self.stack_size[axis].push(SemanticSize::PercParent {
                pct: 1.0,
                strictness: 0.0,
            });
            self.stack_viewable[axis].clear();
            self.stack_viewable[axis].push(Interval::new(0.0, 1.0));
            self.stack_floating[axis].clear();
            self.stack_floating[axis].push(0.0);
            self.stack_text_pad[axis].clear();
            self.stack_text_pad[axis].push(visual.text_pad[axis]);
        }
        self.stack_child_axis.clear();
        self.stack_child_axis.push(AXIS_Y);
        self.stack_align_x.clear();
        self.stack_align_x.push(AlignX::Center);
        self.stack_align_y.clear();
        self.stack_align_y.push(AlignY::Center);
        self.stack_background.clear();
        self.stack_background.push(visual.background_color);
        self.stack_border_color.clear();
        self.stack_border_color.push(visual.border_color);
        self.stack_sprite_color.clear();
        self.stack_sprite_color.push(visual.sprite_color);
        self.stack_gradient.clear();
        self.stack_gradient.push(visual.gradient_color);
        self.stack_border_size.clear();
        self.stack_border_size.push(visual.border_size);
        self.stack_edge_softness.clear();
        self.stack_edge_softness.push(visual.edge_softness);
        self.stack_corner_radius.clear();
        self.stack_corner_radius.push(visual.corner_radius);

        self.floating_nodes.clear();
        self.selections.clear();
        self.node_count_frame = 0;

        let frame = self.frame;
        let root = self.root;
        let node = self.nodes.get_mut(root);
        node.last_frame_touched = frame;
        node.layout_size = window_size;
        node.pixel_size = window_size;
        node.semantic_size = [
            SemanticSize::Pixel {
                px: window_size[0],
                strictness: 1.0,
            },
            SemanticSize::Pixel {
                px: window_size[1],
                strictness: 1.0,
            },
        ];
        node.child_layout_axis = AXIS_Y;
    }

    attr_stack!(push_font, pop_font, stack_font, u32);
    attr_stack!(push_sprite, pop_sprite, stack_sprite, u32);
    attr_stack!(push_child_axis, pop_child_axis, stack_child_axis, usize);
    attr_stack!(push_align_x, pop_align_x, stack_align_x, AlignX);
    attr_stack!(push_align_y, pop_align_y, stack_align_y, AlignY);
    attr_stack!(push_background, pop_background, stack_background, [f32; 4]);
    attr_stack!(
        push_border_color,
        pop_border_color,
        stack_border_color,
        [f32; 4]
    );
    attr_stack!(
        push_sprite_color,
        pop_sprite_color,
        stack_sprite_color,
        [f32; 4]
    );
    attr_stack!(push_gradient, pop_gradient, stack_gradient, [[f32; 4]; 4]);
    attr_stack!(push_border_size, pop_border_size, stack_border_size, f32);
    attr_stack!(
        push_edge_softness,
        pop_edge_softness,
        stack_edge_softness,
        f32
    );
    attr_stack!(
        push_corner_radius,
        pop_corner_radius,
        stack_corner_radius,
        f32
    );

    pub fn push_size(&mut self, axis: usize, size: SemanticSize) {
        self.stack_size[axis].push(size);
    }

    pub fn pop_size(&mut self, axis: usize) {
        self.stack_size[axis].pop();
        debug_assert!(!self.stack_size[axis].is_empty());
    }

    pub fn push_viewable(&mut self, axis: usize, interval: Interval) {
        self.stack_viewable[axis].push(interval);
    }

    pub fn pop_viewable(&mut self, axis: usize) {
        self.stack_viewable[axis].pop();
        debug_assert!(!self.stack_viewable[axis].is_empty());
    }

    pub fn push_floating(&mut self, axis: usize, at: f32) {
        self.stack_floating[axis].push(at);
    }

    pub fn pop_floating(&mut self, axis: usize) {
        self.stack_floating[axis].pop();
        debug_assert!(!self.stack_floating[axis].is_empty());
    }

    pub fn push_text_pad(&mut self, axis: usize, pad: f32) {
        self.stack_text_pad[axis].push(pad);
    }

    pub fn pop_text_pad(&mut self, axis: usize) {
        self.stack_text_pad[axis].pop();
        debug_assert!(!self.stack_text_pad[axis].is_empty());
    }

    pub fn push_parent(&mut self, node: u32) {
        self.stack_parent.push(node);
    }

    pub fn pop_parent(&mut self) {
        self.stack_parent.pop();
        debug_assert!(!self.stack_parent.is_empty(), "parent stack underflow");
    }

    /// Scope form of push_parent/pop_parent; the pop happens on every
    /// control path out of `body`.
    pub fn with_parent<R>(&mut self, node: u32, body: impl FnOnce(&mut Ui) -> R) -> R {
        self.push_parent(node);
        let result = body(self);
        self.pop_parent();
        result
    }

    fn lookup_cached(&self, key: u32, id: &str) -> Option<u32> {
        let mut at = self.node_map.first(key);
        while at != HASH_NULL {
            if self.nodes.is_allocated(at) && self.nodes.get(at).id == id {
                return Some(at);
            }
            at = self.node_map.next(at);
        }
        None
    }

    /// Create or refresh the keyed node for `formatted` under the current
    /// parent. The node's attributes are re-read from the stacks; its
    /// interaction state is preserved from the previous frame.
    pub fn node(&mut self, flags: NodeFlags, formatted: &str) -> u32 {
        let (display, identity) = match formatted.find("###") {
            Some(at) => (&formatted[..at], &formatted[at + 3..]),
            None => (formatted, formatted),
        };
        let key = fxhash::hash32(identity);
        let parent = *self.stack_parent.last().expect("parent stack");

        let index = match self.lookup_cached(key, identity) {
            Some(index) => {
                if self.nodes.get(index).last_frame_touched == self.frame {
                    warn!("duplicate ui node identity {:?} within a frame", identity);
                    return index;
                }
                // sibling order is creation order, every frame
                self.nodes.reattach(index, parent);
                index
            }
            None => {
                let index = match self.nodes.add(parent) {
                    Some(index) => index,
                    None => {
                        warn!("ui node pool exhausted, dropping {:?}", identity);
                        return self.root;
                    }
                };
                self.node_map.add(key, index);
                let node = self.nodes.get_mut(index);
                node.id = identity.to_owned();
                node.key = key;
                index
            }
        };
        self.refresh_node(index, parent, flags, display.to_owned());
        index
    }

    /// Anonymous structural node; never cached, never interactable.
    pub fn node_non_hashed(&mut self, flags: NodeFlags) -> u32 {
        let parent = *self.stack_parent.last().expect("parent stack");
        let index = match self.nodes.add(parent) {
            Some(index) => index,
            None => {
                warn!("ui node pool exhausted for non-hashed node");
                return self.root;
            }
        };
        {
            let node = self.nodes.get_mut(index);
            node.id = String::new();
            node.key = 0;
        }
        self.refresh_node(index, parent, flags | NodeFlags::NON_HASHED, String::new());
        index
    }

    fn refresh_node(&mut self, index: u32, parent: u32, flags: NodeFlags, display: String) {
        let frame = self.frame;
        let parent_depth = self.nodes.get(parent).depth;
        let parent_size = [
            self.nodes.get(parent).layout_size[AXIS_X],
            self.nodes.get(parent).layout_size[AXIS_Y],
        ];
        let parent_semantic = self.nodes.get(parent).semantic_size;

        let mut semantic = [
            *self.stack_size[AXIS_X].last().unwrap(),
            *self.stack_size[AXIS_Y].last().unwrap(),
        ];
        // UNIT sizes are percentages of the pushed viewable interval.
        for axis in [AXIS_X, AXIS_Y] {
            if let SemanticSize::Unit { low, high } = semantic[axis] {
                let viewable = self.stack_viewable[axis].last().unwrap();
                let pct = if viewable.length() > 0.0 {
                    (high - low) / viewable.length()
                } else {
                    0.0
                };
                semantic[axis] = SemanticSize::PercParent {
                    pct,
                    strictness: 0.0,
                };
            }
        }

        let font_index = *self.stack_font.last().unwrap();

        {
            let node = self.nodes.get_mut(index);
            node.flags = flags;
            node.last_frame_touched = frame;
            node.depth = parent_depth + 1;
            node.text = display;
            node.font = font_index;
            node.sprite = *self.stack_sprite.last().unwrap();
            node.child_layout_axis = *self.stack_child_axis.last().unwrap();
            node.semantic_size = semantic;
            node.text_align = (
                *self.stack_align_x.last().unwrap(),
                *self.stack_align_y.last().unwrap(),
            );
            node.text_pad = [
                *self.stack_text_pad[AXIS_X].last().unwrap(),
                *self.stack_text_pad[AXIS_Y].last().unwrap(),
            ];
            node.background_color = *self.stack_background.last().unwrap();
            node.border_color = *self.stack_border_color.last().unwrap();
            node.sprite_color = *self.stack_sprite_color.last().unwrap();
            node.gradient_color = *self.stack_gradient.last().unwrap();
            node.border_size = *self.stack_border_size.last().unwrap();
            node.edge_softness = *self.stack_edge_softness.last().unwrap();
            node.corner_radius = *self.stack_corner_radius.last().unwrap();
            node.floating_position = [
                *self.stack_floating[AXIS_X].last().unwrap(),
                *self.stack_floating[AXIS_Y].last().unwrap(),
            ];
            node.layout_size = [0.0, 0.0];
            node.layout_position = [0.0, 0.0];
            node.text_layout = None;
        }

        // Immediate size resolution; the rest waits for the layout passes.
        for axis in [AXIS_X, AXIS_Y] {
            match semantic[axis] {
                SemanticSize::Pixel { px, .. } => {
                    self.nodes.get_mut(index).layout_size[axis] = px;
                }
                SemanticSize::PercParent { pct, .. } => {
                    if matches!(parent_semantic[axis], SemanticSize::ChildSum { .. }) {
                        self.nodes
                            .get_mut(index)
                            .flags
                            .insert(NodeFlags::perc_postponed(axis));
                    } else {
                        self.nodes.get_mut(index).layout_size[axis] = pct * parent_size[axis];
                    }
                }
                _ => {}
            }
        }

        // Text layout: sized-by-text and overflow-allowed nodes lay out
        // now; width-constrained text waits for the final width.
        let node = self.nodes.get_mut(index);
        let wants_text = node.flags.contains(NodeFlags::DRAW_TEXT) && !node.text.is_empty();
        let sized_by_text = matches!(node.semantic_size[AXIS_X], SemanticSize::Text { .. })
            || matches!(node.semantic_size[AXIS_Y], SemanticSize::Text { .. });
        if wants_text || sized_by_text {
            if sized_by_text || node.flags.contains(NodeFlags::TEXT_ALLOW_OVERFLOW) {
                let font = &self.fonts[font_index as usize];
                let layout = layout_text(font, &node.text, f32::INFINITY);
                if matches!(node.semantic_size[AXIS_X], SemanticSize::Text { .. }) {
                    node.layout_size[AXIS_X] = layout.width + 2.0 * node.text_pad[AXIS_X];
                }
                if matches!(node.semantic_size[AXIS_Y], SemanticSize::Text { .. }) {
                    node.layout_size[AXIS_Y] =
                        layout.height(font) + 2.0 * node.text_pad[AXIS_Y];
                }
                node.text_layout = Some(layout);
            } else {
                node.flags.insert(NodeFlags::TEXT_LAYOUT_POSTPONED);
            }
        }

        if flags.contains(NodeFlags::FLOATING_X) || flags.contains(NodeFlags::FLOATING_Y) {
            self.floating_nodes.push(index);
        }
        self.node_count_frame += 1;
    }

    pub fn push_text_selection(&mut self, node: u32, low: u32, high: u32) {
        let color = self.visual.text_selection_color;
        self.selections.push(TextSelection {
            node,
            low,
            high,
            color,
        });
    }

    pub fn interaction(&self, node: u32) -> InterState {
        self.nodes.get(node).inter
    }

    pub fn input(&self) -> &InputSnapshot {
        &self.input
    }

    /// Resolve a stable identity to its cached node, if it survived the
    /// last frame.
    pub fn lookup(&self, identity: &str) -> Option<u32> {
        self.lookup_cached(fxhash::hash32(identity), identity)
    }

    pub fn focus_text(&mut self, node_key: u32, cursor: u32, mark: u32) {
        self.text_edit = Some(TextEditState {
            node_key,
            cursor,
            mark,
        });
    }

    pub fn clear_text_focus(&mut self) {
        self.text_edit = None;
    }

    pub fn text_edit(&self) -> Option<&TextEditState> {
        self.text_edit.as_ref()
    }

    pub fn text_edit_mut(&mut self) -> Option<&mut TextEditState> {
        self.text_edit.as_mut()
    }

    /// Key of the node hovered at the last completed frame.
    pub fn hovered_key(&self) -> u32 {
        self.persist.hovered_key
    }

    fn prune_untouched(&mut self) {
        let frame = self.frame;
        // gather stale subtree roots without descending into them
        let mut stale = Vec::new();
        let mut stack = vec![self.root];
        while let Some(at) = stack.pop() {
            if self.nodes.get(at).last_frame_touched != frame {
                stale.push(at);
                continue;
            }
            let mut child = self.nodes.links(at).first;
            while child != containers::HI_NULL_INDEX {
                stack.push(child);
                child = self.nodes.links(child).next;
            }
        }

        for root in stale {
            self.mem_frame.push_record();
            let mut keyed = Vec::new();
            for at in self.nodes.iter_df(&self.mem_frame, root) {
                let node = self.nodes.get(at);
                if node.key != 0 {
                    keyed.push((node.key, at));
                }
            }
            self.mem_frame.pop_record();
            for (key, at) in keyed {
                self.node_map.remove(key, at);
            }
            self.nodes.remove(&mut self.mem_frame, root);
        }
    }

    /// Finish the frame: prune, lay out, hit-test and bucket.
    pub fn frame_end(&mut self) {
        debug_assert_eq!(
            self.stack_parent.len(),
            1,
            "unbalanced parent push/pop during the frame"
        );

        self.prune_untouched();

        let order = layout::preorder(&self.nodes, self.root);
        layout::pass_childsum(&mut self.nodes, &order);
        layout::pass_final(
            &mut self.nodes,
            &order,
            self.root,
            self.window_size,
            &self.fonts,
        );
        self.update_interactions(&order);
        self.build_buckets(&order);

        self.node_count_prev_frame = self.node_count_frame;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ui() -> Ui {
        Ui::new(Vec::new(), Vec::new()).unwrap()
    }

    fn begin(ui: &mut Ui, size: [f32; 2]) {
        ui.frame_begin(size, &UiVisual::default(), InputSnapshot::default(), 0);
    }

    #[test]
    fn identity_split_on_triple_hash() {
        let mut ui = ui();
        begin(&mut ui, [800.0, 600.0]);
        let a = ui.node(NodeFlags::DRAW_TEXT, "Click me###button_1");
        assert_eq!(ui.get(a).id, "button_1");
        assert_eq!(ui.get(a).text, "Click me");

        let b = ui.node(NodeFlags::empty(), "plain");
        assert_eq!(ui.get(b).id, "plain");
        assert_eq!(ui.get(b).text, "plain");
        ui.frame_end();
    }

    #[test]
    fn cached_nodes_keep_their_slot_across_frames() {
        let mut ui = ui();
        begin(&mut ui, [800.0, 600.0]);
        let first = ui.node(NodeFlags::empty(), "###stable");
        ui.frame_end();

        begin(&mut ui, [800.0, 600.0]);
        let second = ui.node(NodeFlags::empty(), "###stable");
        ui.frame_end();
        assert_eq!(first, second);
    }

    #[test]
    fn untouched_nodes_are_pruned() {
        let mut ui = ui();
        begin(&mut ui, [800.0, 600.0]);
        ui.node(NodeFlags::empty(), "###a");
        ui.node(NodeFlags::empty(), "###b");
        ui.frame_end();
        assert_eq!(ui.node_count_prev_frame(), 2);

        begin(&mut ui, [800.0, 600.0]);
        ui.node(NodeFlags::empty(), "###a");
        ui.frame_end();
        assert_eq!(ui.node_count_prev_frame(), 1);

        // a new frame re-creating "b" gets a fresh (recycled) slot and no
        // stale state
        begin(&mut ui, [800.0, 600.0]);
        let b = ui.node(NodeFlags::empty(), "###b");
        assert_eq!(ui.get(b).last_frame_touched, ui.frame());
        ui.frame_end();
    }

    #[test]
    fn pixel_sizes_and_row_layout() {
        let mut ui = ui();
        begin(&mut ui, [800.0, 600.0]);
        ui.push_child_axis(AXIS_X);
        let row = ui.node(NodeFlags::empty(), "###row");
        ui.pop_child_axis();

        ui.with_parent(row, |ui| {
            for (i, px) in [100.0f32, 150.0, 50.0].iter().enumerate() {
                ui.push_size(
                    AXIS_X,
                    SemanticSize::Pixel {
                        px: *px,
                        strictness: 1.0,
                    },
                );
                ui.push_size(
                    AXIS_Y,
                    SemanticSize::Pixel {
                        px: 40.0,
                        strictness: 1.0,
                    },
                );
                ui.node(NodeFlags::DRAW_BACKGROUND, &format!("###cell_{}", i));
                ui.pop_size(AXIS_X);
                ui.pop_size(AXIS_Y);
            }
        });
        ui.frame_end();

        // children compact left to right
        let cell0 = ui.lookup("cell_0").unwrap();
        let cell1 = ui.lookup("cell_1").unwrap();
        let cell2 = ui.lookup("cell_2").unwrap();
        assert_eq!(ui.get(cell0).pixel_position[AXIS_X], 0.0);
        assert_eq!(ui.get(cell1).pixel_position[AXIS_X], 100.0);
        assert_eq!(ui.get(cell2).pixel_position[AXIS_X], 250.0);
        assert_eq!(ui.get(cell1).pixel_size[AXIS_X], 150.0);
    }

    #[test]
    fn childsum_wraps_children() {
        let mut ui = ui();
        begin(&mut ui, [800.0, 600.0]);
        ui.push_child_axis(AXIS_X);
        ui.push_size(AXIS_X, SemanticSize::ChildSum { strictness: 1.0 });
        ui.push_size(AXIS_Y, SemanticSize::ChildSum { strictness: 1.0 });
        let wrap = ui.node(NodeFlags::empty(), "###wrap");
        ui.pop_size(AXIS_X);
        ui.pop_size(AXIS_Y);
        ui.pop_child_axis();

        ui.with_parent(wrap, |ui| {
            for i in 0..3 {
                ui.push_size(
                    AXIS_X,
                    SemanticSize::Pixel {
                        px: 30.0,
                        strictness: 1.0,
                    },
                );
                ui.push_size(
                    AXIS_Y,
                    SemanticSize::Pixel {
                        px: 20.0,
                        strictness: 1.0,
                    },
                );
                ui.node(NodeFlags::empty(), &format!("###w_{}", i));
                ui.pop_size(AXIS_X);
                ui.pop_size(AXIS_Y);
            }
        });
        ui.frame_end();

        assert_eq!(ui.get(wrap).pixel_size[AXIS_X], 90.0);
        assert_eq!(ui.get(wrap).pixel_size[AXIS_Y], 20.0);
    }

    #[test]
    fn violation_clips_visible_interval() {
        let mut ui = ui();
        begin(&mut ui, [100.0, 100.0]);
        ui.push_child_axis(AXIS_X);
        ui.push_size(
            AXIS_X,
            SemanticSize::Pixel {
                px: 100.0,
                strictness: 1.0,
            },
        );
        ui.push_size(
            AXIS_Y,
            SemanticSize::Pixel {
                px: 50.0,
                strictness: 1.0,
            },
        );
        let row = ui.node(NodeFlags::empty(), "###row");
        ui.pop_size(AXIS_X);
        ui.pop_size(AXIS_Y);
        ui.pop_child_axis();

        ui.with_parent(row, |ui| {
            for i in 0..2 {
                // strict children wider than the parent: unsolvable
                ui.push_size(
                    AXIS_X,
                    SemanticSize::Pixel {
                        px: 80.0,
                        strictness: 1.0,
                    },
                );
                ui.push_size(
                    AXIS_Y,
                    SemanticSize::Pixel {
                        px: 50.0,
                        strictness: 1.0,
                    },
                );
                ui.node(NodeFlags::empty(), &format!("###wide_{}", i));
                ui.pop_size(AXIS_X);
                ui.pop_size(AXIS_Y);
            }
        });
        ui.frame_end();

        let second = ui.lookup("wide_1").unwrap();
        // the second child starts at 80 and is clipped at the parent edge
        assert_eq!(ui.get(second).pixel_position[AXIS_X], 80.0);
        assert_eq!(ui.get(second).pixel_visible[AXIS_X].high, 100.0);
        assert!(ui.get(second).pixel_visible[AXIS_X].length() < 80.0);
    }

    #[test]
    fn hover_and_click_activate_nodes() {
        let mut ui = ui();

        // frame 1: build a clickable node covering the window top
        let mut input = InputSnapshot::default();
        input.cursor_position = [50.0, 550.0];
        ui.frame_begin([800.0, 600.0], &UiVisual::default(), input, 1_000);
        ui.push_size(
            AXIS_Y,
            SemanticSize::Pixel {
                px: 100.0,
                strictness: 1.0,
            },
        );
        let button = ui.node(
            NodeFlags::INTER_HOVER | NodeFlags::INTER_LEFT_CLICK | NodeFlags::DRAW_BACKGROUND,
            "###hit",
        );
        ui.pop_size(AXIS_Y);
        ui.frame_end();
        assert!(ui.interaction(button).hovered);
        assert!(!ui.interaction(button).clicked);

        // frame 2: click it
        let mut input = InputSnapshot::default();
        input.cursor_position = [50.0, 550.0];
        input.button_clicked[MOUSE_LEFT] = true;
        input.button_pressed[MOUSE_LEFT] = true;
        ui.frame_begin([800.0, 600.0], &UiVisual::default(), input, 2_000);
        ui.push_size(
            AXIS_Y,
            SemanticSize::Pixel {
                px: 100.0,
                strictness: 1.0,
            },
        );
        let button = ui.node(
            NodeFlags::INTER_HOVER | NodeFlags::INTER_LEFT_CLICK | NodeFlags::DRAW_BACKGROUND,
            "###hit",
        );
        ui.pop_size(AXIS_Y);
        ui.frame_end();
        assert!(ui.interaction(button).clicked);
    }

    #[test]
    fn draw_buckets_group_by_depth_layer_texture() {
        let mut ui = ui();
        begin(&mut ui, [800.0, 600.0]);
        let panel = ui.node(NodeFlags::DRAW_BACKGROUND, "###panel");
        ui.with_parent(panel, |ui| {
            ui.node(NodeFlags::DRAW_BACKGROUND, "###inner_a");
            ui.node(NodeFlags::DRAW_BACKGROUND, "###inner_b");
            ui.node(NodeFlags::DRAW_TEXT, "hi###label");
        });
        ui.frame_end();

        // depth-1 visual, depth-2 visual (two nodes), depth-2 text
        assert_eq!(ui.buckets().len(), 3);
        let visual_depth2 = ui
            .buckets()
            .iter()
            .find(|b| ui_cmd_layer(b.cmd) == UI_LAYER_VISUAL && ui_cmd_depth(b.cmd) == 2)
            .unwrap();
        assert_eq!(visual_depth2.count, 2);

        let text = ui
            .buckets()
            .iter()
            .find(|b| ui_cmd_layer(b.cmd) == UI_LAYER_TEXT)
            .unwrap();
        assert_eq!(text.count, 2); // glyph count of "hi"

        // emission fills exactly count * stride bytes
        let mut bytes = vec![0u8; visual_depth2.count as usize * UI_SHARED_STRIDE];
        ui.write_bucket_instances(visual_depth2, &mut bytes);
    }
}
