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

use crate::{
    node::{InterState, NodeFlags},
    Ui,
};
use containers::HI_NULL_INDEX;

pub const MOUSE_BUTTON_COUNT: usize = 3;
pub const MOUSE_LEFT: usize = 0;
pub const MOUSE_RIGHT: usize = 1;
pub const MOUSE_MIDDLE: usize = 2;

/// Editing and navigation keys delivered alongside plain character input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    Left,
    Right,
    Home,
    End,
    Backspace,
    Delete,
    Enter,
    Escape,
    Tab,
}

#[derive(Clone, Copy, Debug)]
pub struct KeyPress {
    pub key: Key,
    pub shift: bool,
    pub ctrl: bool,
}

/// Everything the window layer read since the previous frame, sampled once.
#[derive(Clone, Debug, Default)]
pub struct InputSnapshot {
    /// Window coordinates, bottom-left origin.
    pub cursor_position: [f32; 2],
    pub cursor_delta: [f32; 2],
    pub button_clicked: [bool; MOUSE_BUTTON_COUNT],
    pub button_released: [bool; MOUSE_BUTTON_COUNT],
    pub button_pressed: [bool; MOUSE_BUTTON_COUNT],
    pub scroll_up_count: u32,
    pub scroll_down_count: u32,
    pub chars: Vec<char>,
    pub keys: Vec<KeyPress>,
}

/// Interaction state that survives between frames.
#[derive(Clone, Debug, Default)]
pub(crate) struct InterPersist {
    pub hovered_key: u32,
    pub active_key: u32,
    pub ns_last_press: [u64; MOUSE_BUTTON_COUNT],
    pub last_press_key: [u32; MOUSE_BUTTON_COUNT],
    pub drag_accum: [f32; 2],
}

impl Ui {
    /// Topmost interactable node under the cursor within `root`'s subtree,
    /// honoring SKIP_HOVER_SEARCH.
    fn hover_search(&self, root: u32) -> Option<u32> {
        let cursor = self.input.cursor_position;
        let mut best = None;
        let mut stack = vec![root];
        while let Some(at) = stack.pop() {
            let links = *self.nodes.links(at);
            if at != root && links.next != HI_NULL_INDEX {
                stack.push(links.next);
            }
            let node = self.nodes.get(at);
            if node.flags.contains(NodeFlags::SKIP_HOVER_SEARCH) {
                continue;
            }
            if links.first != HI_NULL_INDEX {
                stack.push(links.first);
            }
            if node.has_inter_flags() && node.rect_contains(cursor) {
                // later in draw order wins
                best = Some(at);
            }
        }
        best
    }

    fn hovered_node(&self) -> Option<u32> {
        // floating subtrees occlude the rest of the tree, latest pushed on
        // top
        for &floating in self.floating_nodes.iter().rev() {
            if !self.nodes.is_allocated(floating) {
                continue;
            }
            if self
                .nodes
                .get(floating)
                .rect_contains(self.input.cursor_position)
            {
                return self.hover_search(floating);
            }
        }
        self.hover_search(self.root)
    }

    /// Runs after layout so hit tests see this frame's rectangles.
    pub(crate) fn update_interactions(&mut self, order: &[u32]) {
        let hovered = self.hovered_node();
        let hovered_key = hovered.map(|at| self.nodes.get(at).key).unwrap_or(0);
        self.persist.hovered_key = hovered_key;

        let input = self.input.clone();
        let left_clicked = input.button_clicked[MOUSE_LEFT];
        let left_released = input.button_released[MOUSE_LEFT];
        let left_pressed = input.button_pressed[MOUSE_LEFT];

        let mut double_clicked = false;
        if left_clicked {
            let within = self
                .ns_now
                .saturating_sub(self.persist.ns_last_press[MOUSE_LEFT])
                < self.ns_double_click;
            double_clicked = within && self.persist.last_press_key[MOUSE_LEFT] == hovered_key;
            self.persist.ns_last_press[MOUSE_LEFT] = self.ns_now;
            self.persist.last_press_key[MOUSE_LEFT] = hovered_key;
            self.persist.active_key = hovered_key;
            self.persist.drag_accum = [0.0, 0.0];
        }
        if left_pressed && self.persist.active_key != 0 {
            self.persist.drag_accum[0] += input.cursor_delta[0];
            self.persist.drag_accum[1] += input.cursor_delta[1];
        }

        let scroll = input.scroll_up_count as i32 - input.scroll_down_count as i32;
        let active_key = self.persist.active_key;
        let drag_accum = self.persist.drag_accum;

        for &at in order.iter() {
            let node = self.nodes.get_mut(at);
            let key = node.key;
            let mut state = InterState::default();
            if key != 0 && node.flags.intersects(NodeFlags::INTER_MASK) {
                state.hovered = key == hovered_key;
                state.active = key == active_key && left_pressed;
                state.clicked = state.hovered
                    && left_clicked
                    && node.flags.contains(NodeFlags::INTER_LEFT_CLICK);
                state.double_clicked = state.hovered
                    && double_clicked
                    && node.flags.contains(NodeFlags::INTER_LEFT_DOUBLE_CLICK);
                state.released = key == active_key && left_released;
                if node.flags.contains(NodeFlags::INTER_DRAG) && key == active_key {
                    state.dragging = left_pressed;
                    state.drag_delta = drag_accum;
                }
                if node.flags.contains(NodeFlags::INTER_SCROLL) && state.hovered {
                    state.scrolled = scroll;
                }
            }
            node.inter = state;
        }

        if left_released {
            self.persist.active_key = 0;
            self.persist.drag_accum = [0.0, 0.0];
        }
    }
}
