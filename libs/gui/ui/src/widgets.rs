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

//! Thin widget state machines over the node primitives: buttons, virtual
//! lists, timelines, popups, text input and the command console.

use crate::{
    node::{InterState, NodeFlags, SemanticSize, AXIS_X, AXIS_Y},
    text::{apply_text_op, TextOp},
    Key, Ui,
};
use std::ops::Range;

impl Ui {
    /// Keyed button; returns last frame's interaction so callers can branch
    /// on `.clicked` immediately.
    pub fn button(&mut self, flags: NodeFlags, formatted: &str) -> InterState {
        let index = self.node(
            flags | NodeFlags::INTER_HOVER | NodeFlags::INTER_LEFT_CLICK,
            formatted,
        );
        self.interaction(index)
    }

    /// Fixed-size padding node along the parent's layout axis.
    pub fn pad_pixel(&mut self, pixels: f32) -> u32 {
        let parent = *self.stack_parent.last().expect("parent stack");
        let axis = self.get(parent).child_layout_axis;
        self.push_size(
            axis,
            SemanticSize::Pixel {
                px: pixels,
                strictness: 0.0,
            },
        );
        self.push_size(
            1 - axis,
            SemanticSize::Pixel {
                px: 0.0,
                strictness: 0.0,
            },
        );
        let index = self.node_non_hashed(NodeFlags::PAD);
        self.pop_size(axis);
        self.pop_size(1 - axis);
        index
    }

    /// Padding that absorbs whatever the siblings leave unused.
    pub fn pad_fill(&mut self) -> u32 {
        self.node_non_hashed(NodeFlags::PAD | NodeFlags::PAD_FILL)
    }
}

/// Scrollable fixed-entry list; only entries intersecting the visible
/// pixel interval are materialized by the caller.
#[derive(Clone, Debug)]
pub struct UiList {
    pub axis: usize,
    /// Viewport size along `axis`.
    pub axis_pixel_size: f32,
    pub entry_pixel_size: f32,
    /// Scroll offset in pixels from the first entry.
    pub scroll: f32,
}

impl UiList {
    pub fn new(axis: usize, axis_pixel_size: f32, entry_pixel_size: f32) -> Self {
        Self {
            axis,
            axis_pixel_size,
            entry_pixel_size,
            scroll: 0.0,
        }
    }

    /// Entry indices intersecting the viewport.
    pub fn visible_range(&self, entry_count: u32) -> Range<u32> {
        if self.entry_pixel_size <= 0.0 || entry_count == 0 {
            return 0..0;
        }
        let first = (self.scroll / self.entry_pixel_size).floor().max(0.0) as u32;
        let visible = (self.axis_pixel_size / self.entry_pixel_size).ceil() as u32 + 1;
        let first = first.min(entry_count.saturating_sub(1));
        first..entry_count.min(first + visible)
    }

    pub fn max_scroll(&self, entry_count: u32) -> f32 {
        (entry_count as f32 * self.entry_pixel_size - self.axis_pixel_size).max(0.0)
    }
}

pub struct ListFrame {
    pub container: u32,
    pub visible: Range<u32>,
}

/// Build the list container, apply scroll interaction, and report which
/// entries the caller should materialize this frame. Entries go inside
/// `with_parent(frame.container, ..)`, led by a `pad_pixel` of
/// `frame.visible.start * entry_pixel_size`.
pub fn list_begin(ui: &mut Ui, list: &mut UiList, id: &str, entry_count: u32) -> ListFrame {
    ui.push_size(
        list.axis,
        SemanticSize::Pixel {
            px: list.axis_pixel_size,
            strictness: 1.0,
        },
    );
    ui.push_child_axis(list.axis);
    let container = ui.node(
        NodeFlags::INTER_HOVER | NodeFlags::INTER_SCROLL | NodeFlags::DRAW_BACKGROUND,
        id,
    );
    ui.pop_child_axis();
    ui.pop_size(list.axis);

    let scrolled = ui.interaction(container).scrolled;
    if scrolled != 0 {
        list.scroll -= scrolled as f32 * list.entry_pixel_size;
        list.scroll = list.scroll.clamp(0.0, list.max_scroll(entry_count));
    }

    ListFrame {
        container,
        visible: list.visible_range(entry_count),
    }
}

/// Unit tick marks over a time interval, chosen so that roughly
/// `preferred_count` labeled ticks land inside `[start, end]`. The unit is
/// the usual 1/2/5 decade ladder, found by recursive refinement.
#[derive(Clone, Debug, Default)]
pub struct TimelineTicks {
    pub unit: f64,
    pub ticks: Vec<f64>,
}

pub fn timeline_ticks(start: f64, end: f64, preferred_count: u32) -> TimelineTicks {
    debug_assert!(end > start && preferred_count > 0);
    let span = end - start;
    let mut unit = 10f64.powf((span / preferred_count as f64).log10().ceil());

    // refine: subdivide decades by 2 and 5 while it brings the count closer
    let count_of = |unit: f64| (span / unit).floor();
    let mut best = unit;
    loop {
        let mut improved = false;
        for divisor in [2.0, 5.0, 10.0] {
            let candidate = unit / divisor;
            if candidate <= 0.0 {
                continue;
            }
            let now = (count_of(best) - preferred_count as f64).abs();
            let with = (count_of(candidate) - preferred_count as f64).abs();
            if with < now {
                best = candidate;
                improved = true;
            }
        }
        if !improved {
            break;
        }
        unit = best;
    }

    let mut ticks = Vec::new();
    let mut at = (start / best).ceil() * best;
    while at <= end {
        ticks.push(at);
        at += best;
    }
    TimelineTicks { unit: best, ticks }
}

/// Modal dialog state machine driven by its owning caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PopupState {
    #[default]
    Null,
    Running,
    /// User confirmed; the owner validates the result before completion.
    PendingVerification,
    Completed,
}

#[derive(Clone, Debug, Default)]
pub struct Popup {
    pub state: PopupState,
    pub title: String,
    pub accepted: bool,
}

impl Popup {
    pub fn open(&mut self, title: &str) {
        debug_assert_eq!(self.state, PopupState::Null);
        self.state = PopupState::Running;
        self.title = title.to_owned();
        self.accepted = false;
    }

    /// Owner verdict on a PendingVerification popup.
    pub fn verify(&mut self, accept: bool) {
        debug_assert_eq!(self.state, PopupState::PendingVerification);
        self.accepted = accept;
        self.state = if accept {
            PopupState::Completed
        } else {
            PopupState::Running
        };
    }

    /// Reset a finished (or abandoned) popup so it can be reopened.
    pub fn try_destroy(&mut self) -> bool {
        if self.state == PopupState::Completed || self.state == PopupState::Null {
            self.state = PopupState::Null;
            true
        } else {
            false
        }
    }
}

/// Run one frame of a text-input popup. Returns the input line's committed
/// content when the user accepts.
pub fn popup_text_input(
    ui: &mut Ui,
    popup: &mut Popup,
    line: &mut InputLine,
    prompt: &str,
) -> Option<String> {
    if popup.state != PopupState::Running {
        return None;
    }

    let window = ui.window_size();
    ui.push_floating(AXIS_X, window[0] / 2.0 - 160.0);
    ui.push_floating(AXIS_Y, window[1] / 2.0 - 60.0);
    ui.push_size(
        AXIS_X,
        SemanticSize::Pixel {
            px: 320.0,
            strictness: 1.0,
        },
    );
    ui.push_size(AXIS_Y, SemanticSize::ChildSum { strictness: 1.0 });
    let frame = ui.node(
        NodeFlags::FLOATING_X
            | NodeFlags::FLOATING_Y
            | NodeFlags::DRAW_BACKGROUND
            | NodeFlags::DRAW_BORDER,
        &format!("###popup_{}", popup.title),
    );
    ui.pop_size(AXIS_X);
    ui.pop_size(AXIS_Y);
    ui.pop_floating(AXIS_X);
    ui.pop_floating(AXIS_Y);

    let mut committed = None;
    ui.with_parent(frame, |ui| {
        ui.push_size(AXIS_Y, SemanticSize::Text { strictness: 1.0 });
        ui.node(
            NodeFlags::DRAW_TEXT | NodeFlags::TEXT_ALLOW_OVERFLOW,
            &format!("{}###popup_prompt_{}", prompt, popup.title),
        );
        ui.pop_size(AXIS_Y);

        committed = input_line(ui, line, &format!("popup_input_{}", popup.title));

        let ok = ui.button(
            NodeFlags::DRAW_TEXT | NodeFlags::DRAW_BACKGROUND | NodeFlags::DRAW_BORDER,
            &format!("Ok###popup_ok_{}", popup.title),
        );
        let cancel = ui.button(
            NodeFlags::DRAW_TEXT | NodeFlags::DRAW_BACKGROUND | NodeFlags::DRAW_BORDER,
            &format!("Cancel###popup_cancel_{}", popup.title),
        );
        if ok.clicked && committed.is_none() {
            committed = Some(line.content());
        }
        if cancel.clicked {
            popup.state = PopupState::Null;
            committed = None;
        }
    });

    if committed.is_some() {
        popup.state = PopupState::PendingVerification;
    }
    committed
}

/// Editable single-line text buffer.
#[derive(Clone, Debug, Default)]
pub struct InputLine {
    pub text: Vec<char>,
}

impl InputLine {
    pub fn with_content(content: &str) -> Self {
        Self {
            text: content.chars().collect(),
        }
    }

    pub fn content(&self) -> String {
        self.text.iter().collect()
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }
}

/// One frame of a focused-editable input node. Click to focus; printable
/// input and editing keys apply while focused; Enter commits and returns
/// the buffer contents.
pub fn input_line(ui: &mut Ui, line: &mut InputLine, id: &str) -> Option<String> {
    ui.push_size(AXIS_Y, SemanticSize::Text { strictness: 1.0 });
    let index = ui.node(
        NodeFlags::DRAW_TEXT
            | NodeFlags::TEXT_ALLOW_OVERFLOW
            | NodeFlags::DRAW_BACKGROUND
            | NodeFlags::DRAW_BORDER
            | NodeFlags::INTER_HOVER
            | NodeFlags::INTER_LEFT_CLICK,
        &format!("{}###{}", line.content(), id),
    );
    ui.pop_size(AXIS_Y);
    let key = ui.get(index).key;

    if ui.interaction(index).clicked {
        let end = line.text.len() as u32;
        ui.focus_text(key, end, end);
    }

    let focused = ui.text_edit().map(|edit| edit.node_key) == Some(key);
    if !focused {
        return None;
    }

    let mut committed = None;
    let chars: Vec<char> = ui.input().chars.clone();
    let keys = ui.input().keys.clone();

    let mut edit = ui.text_edit().cloned().expect("focused edit state");
    for ch in chars {
        if !ch.is_control() {
            let (low, high) = edit.selection();
            let op = TextOp {
                replace: ch.to_string(),
                low,
                high,
                cursor_new: low + 1,
                mark_new: low + 1,
                copy: None,
            };
            apply_text_op(&mut line.text, &mut edit, &op);
        }
    }
    for press in keys {
        let (low, high) = edit.selection();
        let len = line.text.len() as u32;
        match press.key {
            Key::Left => {
                let at = if low > 0 && low == high { low - 1 } else { low };
                edit.cursor = at;
                if !press.shift {
                    edit.mark = at;
                }
            }
            Key::Right => {
                let at = if high < len && low == high { high + 1 } else { high };
                edit.cursor = at;
                if !press.shift {
                    edit.mark = at;
                }
            }
            Key::Home => {
                edit.cursor = 0;
                if !press.shift {
                    edit.mark = 0;
                }
            }
            Key::End => {
                edit.cursor = len;
                if !press.shift {
                    edit.mark = len;
                }
            }
            Key::Backspace => {
                let (low, high) = if low == high && low > 0 {
                    (low - 1, high)
                } else {
                    (low, high)
                };
                let op = TextOp {
                    replace: String::new(),
                    low,
                    high,
                    cursor_new: low,
                    mark_new: low,
                    copy: None,
                };
                apply_text_op(&mut line.text, &mut edit, &op);
            }
            Key::Delete => {
                let (low, high) = if low == high && high < len {
                    (low, high + 1)
                } else {
                    (low, high)
                };
                let op = TextOp {
                    replace: String::new(),
                    low,
                    high,
                    cursor_new: low,
                    mark_new: low,
                    copy: None,
                };
                apply_text_op(&mut line.text, &mut edit, &op);
            }
            Key::Enter => {
                committed = Some(line.content());
            }
            Key::Escape => {
                ui.clear_text_focus();
            }
            Key::Tab => {}
        }
    }

    if ui.text_edit().is_some() {
        let (low, high) = edit.selection();
        ui.focus_text(key, edit.cursor, edit.mark);
        // selection highlight, or a caret-wide rect when empty
        ui.push_text_selection(index, low, high);
    }
    committed
}

/// Command console: history lines above an input line; committed lines are
/// returned for the command registry to dispatch.
#[derive(Clone, Debug, Default)]
pub struct Console {
    pub line: InputLine,
    pub history: Vec<String>,
    pub visible: bool,
}

pub fn console(ui: &mut Ui, state: &mut Console, id: &str) -> Option<String> {
    if !state.visible {
        return None;
    }
    ui.push_size(AXIS_Y, SemanticSize::ChildSum { strictness: 1.0 });
    let frame = ui.node(
        NodeFlags::DRAW_BACKGROUND | NodeFlags::DRAW_BORDER,
        &format!("###console_{}", id),
    );
    ui.pop_size(AXIS_Y);

    let mut committed = None;
    ui.with_parent(frame, |ui| {
        for (i, entry) in state.history.iter().enumerate().rev().take(8).rev() {
            ui.push_size(AXIS_Y, SemanticSize::Text { strictness: 1.0 });
            ui.node(
                NodeFlags::DRAW_TEXT | NodeFlags::TEXT_ALLOW_OVERFLOW,
                &format!("{}###console_{}_h{}", entry, id, i),
            );
            ui.pop_size(AXIS_Y);
        }
        committed = input_line(ui, &mut state.line, &format!("console_{}_input", id));
    });

    if let Some(commit) = committed.as_ref() {
        state.history.push(commit.clone());
        state.line.clear();
    }
    committed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InputSnapshot, KeyPress, UiVisual, MOUSE_LEFT};

    fn ui() -> Ui {
        Ui::new(Vec::new(), Vec::new()).unwrap()
    }

    #[test]
    fn list_materializes_only_visible_entries() {
        let list = UiList::new(AXIS_Y, 100.0, 20.0);
        // 100px viewport over 20px entries: 6 entries materialized
        assert_eq!(list.visible_range(50), 0..6);

        let mut scrolled = list.clone();
        scrolled.scroll = 200.0;
        assert_eq!(scrolled.visible_range(50), 10..16);

        // near the end the range clamps
        scrolled.scroll = scrolled.max_scroll(50);
        let range = scrolled.visible_range(50);
        assert_eq!(range.end, 50);
        assert!(range.start >= 44);

        assert_eq!(list.visible_range(3), 0..3);
        assert_eq!(list.visible_range(0), 0..0);
    }

    #[test]
    fn timeline_tick_count_tracks_preference() {
        for (start, end, preferred) in
            [(0.0, 10.0, 10u32), (0.33, 7.77, 5), (1_000.0, 64_000.0, 12)]
        {
            let ticks = timeline_ticks(start, end, preferred);
            assert!(!ticks.ticks.is_empty());
            let count = ticks.ticks.len() as f64;
            assert!(
                count >= preferred as f64 / 3.0 && count <= preferred as f64 * 3.0,
                "{} ticks for preference {}",
                count,
                preferred
            );
            for pair in ticks.ticks.windows(2) {
                assert!((pair[1] - pair[0] - ticks.unit).abs() < ticks.unit * 1e-6);
            }
        }
    }

    #[test]
    fn popup_state_machine_walks_the_protocol() {
        let mut popup = Popup::default();
        assert_eq!(popup.state, PopupState::Null);

        popup.open("New Project");
        assert_eq!(popup.state, PopupState::Running);
        assert!(!popup.try_destroy());

        popup.state = PopupState::PendingVerification;
        popup.verify(false);
        assert_eq!(popup.state, PopupState::Running);

        popup.state = PopupState::PendingVerification;
        popup.verify(true);
        assert_eq!(popup.state, PopupState::Completed);
        assert!(popup.accepted);
        assert!(popup.try_destroy());
        assert_eq!(popup.state, PopupState::Null);
    }

    #[test]
    fn input_line_edits_through_focus() {
        let mut ui = ui();
        let mut line = InputLine::with_content("Hello");

        // frame 1: click into the input to focus it
        let mut input = InputSnapshot::default();
        input.cursor_position = [10.0, 595.0];
        input.button_clicked[MOUSE_LEFT] = true;
        input.button_pressed[MOUSE_LEFT] = true;
        ui.frame_begin([800.0, 600.0], &UiVisual::default(), input, 1_000);
        input_line(&mut ui, &mut line, "field");
        ui.frame_end();

        // frame 2: now focused; type and commit
        let mut input = InputSnapshot::default();
        input.chars = vec!['!'];
        input.keys = vec![KeyPress {
            key: Key::Enter,
            shift: false,
            ctrl: false,
        }];
        ui.frame_begin([800.0, 600.0], &UiVisual::default(), input, 2_000);
        let committed = input_line(&mut ui, &mut line, "field");
        ui.frame_end();

        assert_eq!(committed.as_deref(), Some("Hello!"));
        assert_eq!(line.content(), "Hello!");
    }

    #[test]
    fn console_appends_history_on_commit() {
        let mut ui = ui();
        let mut state = Console {
            visible: true,
            ..Default::default()
        };
        state.line = InputLine::with_content("node_add box");

        // focus the console input by clicking it
        let mut input = InputSnapshot::default();
        input.cursor_position = [10.0, 595.0];
        input.button_clicked[MOUSE_LEFT] = true;
        input.button_pressed[MOUSE_LEFT] = true;
        ui.frame_begin([800.0, 600.0], &UiVisual::default(), input, 1_000);
        assert!(console(&mut ui, &mut state, "main").is_none());
        ui.frame_end();

        let mut input = InputSnapshot::default();
        input.keys = vec![KeyPress {
            key: Key::Enter,
            shift: false,
            ctrl: false,
        }];
        ui.frame_begin([800.0, 600.0], &UiVisual::default(), input, 2_000);
        let committed = console(&mut ui, &mut state, "main");
        ui.frame_end();

        assert_eq!(committed.as_deref(), Some("node_add box"));
        assert_eq!(state.history, vec!["node_add box".to_owned()]);
        assert!(state.line.text.is_empty());
    }
}
