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

//! Glyph tables, text layout and text editing primitives.
//!
//! Font rasterization happens upstream; a [Font] arrives here as pure data
//! (metrics plus a codepoint-indexed glyph table with atlas UV rectangles).

use fxhash::FxHashMap;

#[derive(Clone, Copy, Debug, Default)]
pub struct Glyph {
    pub advance: f32,
    /// Offset from the baseline pen position to the glyph box's top-left.
    pub bearing: [f32; 2],
    pub size: [f32; 2],
    /// Atlas rectangle, bottom-left and top-right.
    pub uv_bl: [f32; 2],
    pub uv_tr: [f32; 2],
}

#[derive(Clone, Debug, Default)]
pub struct Font {
    pub ascent: f32,
    pub descent: f32,
    pub linespace: f32,
    pub texture: u32,
    glyphs: FxHashMap<u32, Glyph>,
    fallback: Glyph,
}

impl Font {
    pub fn new(ascent: f32, descent: f32, linespace: f32, texture: u32) -> Self {
        Self {
            ascent,
            descent,
            linespace,
            texture,
            glyphs: FxHashMap::default(),
            fallback: Glyph::default(),
        }
    }

    pub fn insert_glyph(&mut self, codepoint: u32, glyph: Glyph) {
        if codepoint == ' ' as u32 {
            self.fallback = glyph;
        }
        self.glyphs.insert(codepoint, glyph);
    }

    pub fn glyph(&self, codepoint: u32) -> &Glyph {
        self.glyphs.get(&codepoint).unwrap_or(&self.fallback)
    }

    /// Fixed-advance test font covering printable ASCII. Stands in for a
    /// rasterized TTF wherever a real atlas is not loaded.
    pub fn fixed_advance(advance: f32, ascent: f32, descent: f32) -> Self {
        let mut font = Self::new(ascent, descent, ascent + descent + 2.0, 0);
        for codepoint in 0x20u32..0x7f {
            font.insert_glyph(
                codepoint,
                Glyph {
                    advance,
                    bearing: [0.0, ascent],
                    size: [advance, ascent + descent],
                    uv_bl: [0.0, 0.0],
                    uv_tr: [1.0, 1.0],
                },
            );
        }
        font
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PlacedGlyph {
    pub codepoint: u32,
    /// Pen offset from the line start.
    pub x: f32,
}

#[derive(Clone, Debug, Default)]
pub struct TextLine {
    pub glyphs: Vec<PlacedGlyph>,
    pub width: f32,
}

#[derive(Clone, Debug, Default)]
pub struct TextLayout {
    pub lines: Vec<TextLine>,
    pub width: f32,
}

impl TextLayout {
    pub fn line_count(&self) -> u32 {
        self.lines.len() as u32
    }

    pub fn glyph_count(&self) -> u32 {
        self.lines.iter().map(|line| line.glyphs.len() as u32).sum()
    }

    pub fn height(&self, font: &Font) -> f32 {
        self.lines.len() as f32 * font.linespace
    }
}

/// Lay `text` out against `font`, breaking at word boundaries so no line
/// exceeds `line_width`. Pass `f32::INFINITY` to disable breaking. A word
/// wider than the line is split mid-word rather than overflowing.
pub fn layout_text(font: &Font, text: &str, line_width: f32) -> TextLayout {
    let mut layout = TextLayout::default();
    let mut line = TextLine::default();
    let mut pen = 0.0f32;
    // start of the pending word, as (glyph index in line, pen offset)
    let mut word_start: Option<(usize, f32)> = None;

    let mut finish_line = |line: &mut TextLine, layout: &mut TextLayout, pen: &mut f32| {
        line.width = *pen;
        layout.width = layout.width.max(*pen);
        layout.lines.push(std::mem::take(line));
        *pen = 0.0;
    };

    for ch in text.chars() {
        if ch == '\n' {
            finish_line(&mut line, &mut layout, &mut pen);
            word_start = None;
            continue;
        }
        let codepoint = ch as u32;
        let advance = font.glyph(codepoint).advance;

        if ch.is_whitespace() {
            word_start = None;
        } else if word_start.is_none() {
            word_start = Some((line.glyphs.len(), pen));
        }

        if pen + advance > line_width && !line.glyphs.is_empty() {
            match word_start {
                Some((glyph_at, word_pen)) if glyph_at > 0 && !ch.is_whitespace() => {
                    // move the whole pending word to the next line
                    let moved: Vec<PlacedGlyph> = line.glyphs.split_off(glyph_at);
                    let carried = pen - word_pen;
                    pen = word_pen;
                    finish_line(&mut line, &mut layout, &mut pen);
                    for mut glyph in moved {
                        glyph.x -= word_pen;
                        line.glyphs.push(glyph);
                    }
                    pen = carried;
                    word_start = Some((0, 0.0));
                }
                _ => {
                    finish_line(&mut line, &mut layout, &mut pen);
                    word_start = if ch.is_whitespace() { None } else { Some((0, 0.0)) };
                }
            }
            if ch.is_whitespace() {
                // no leading whitespace after a forced break
                continue;
            }
        }

        line.glyphs.push(PlacedGlyph { codepoint, x: pen });
        pen += advance;
    }
    finish_line(&mut line, &mut layout, &mut pen);
    layout
}

/// Focused-text edit cursor: the selection is the interval between `cursor`
/// and `mark` (empty when equal).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TextEditState {
    /// Hashed key of the node owning the focused buffer.
    pub node_key: u32,
    pub cursor: u32,
    pub mark: u32,
}

impl TextEditState {
    pub fn selection(&self) -> (u32, u32) {
        (self.cursor.min(self.mark), self.cursor.max(self.mark))
    }
}

/// One atomic edit: replace `[low, high)` with `replace` (even when empty)
/// and move cursor and mark to the given positions.
#[derive(Clone, Debug, Default)]
pub struct TextOp {
    pub replace: String,
    pub low: u32,
    pub high: u32,
    pub cursor_new: u32,
    pub mark_new: u32,
    /// Contents to hand to the clipboard, when set.
    pub copy: Option<String>,
}

pub fn apply_text_op(text: &mut Vec<char>, state: &mut TextEditState, op: &TextOp) {
    let low = (op.low as usize).min(text.len());
    let high = (op.high as usize).clamp(low, text.len());
    text.splice(low..high, op.replace.chars());
    state.cursor = (op.cursor_new as usize).min(text.len()) as u32;
    state.mark = (op.mark_new as usize).min(text.len()) as u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn font() -> Font {
        Font::fixed_advance(10.0, 8.0, 2.0)
    }

    #[test]
    fn single_line_unbounded() {
        let layout = layout_text(&font(), "hello", f32::INFINITY);
        assert_eq!(layout.line_count(), 1);
        assert_eq!(layout.glyph_count(), 5);
        assert_relative_eq!(layout.width, 50.0);
        assert_relative_eq!(layout.lines[0].glyphs[3].x, 30.0);
    }

    #[test]
    fn breaks_at_word_boundary() {
        // "abc def" at 45px: "abc " fits, "def" would end at 70 -> wraps
        let layout = layout_text(&font(), "abc def", 45.0);
        assert_eq!(layout.line_count(), 2);
        // the break keeps the trailing space on the first line
        assert_eq!(layout.lines[0].glyphs.len(), 4);
        assert_eq!(layout.lines[1].glyphs.len(), 3);
        // the moved word restarts at the line origin
        assert_relative_eq!(layout.lines[1].glyphs[0].x, 0.0);
    }

    #[test]
    fn splits_oversized_word() {
        let layout = layout_text(&font(), "abcdefgh", 35.0);
        assert!(layout.line_count() >= 2);
        assert!(layout
            .lines
            .iter()
            .all(|line| line.width <= 35.0 + f32::EPSILON));
    }

    #[test]
    fn explicit_newlines_are_respected() {
        let layout = layout_text(&font(), "ab\ncd\n", f32::INFINITY);
        assert_eq!(layout.line_count(), 3);
        assert_eq!(layout.lines[2].glyphs.len(), 0);
    }

    #[test]
    fn text_op_replaces_selection() {
        let mut text: Vec<char> = "Hello".chars().collect();
        let mut state = TextEditState {
            node_key: 1,
            cursor: 2,
            mark: 4,
        };
        let op = TextOp {
            replace: "XY".to_owned(),
            low: 2,
            high: 4,
            cursor_new: 4,
            mark_new: 4,
            copy: None,
        };
        apply_text_op(&mut text, &mut state, &op);
        let result: String = text.iter().collect();
        assert_eq!(result, "HeXYo");
        assert_eq!(state.cursor, 4);
        assert_eq!(state.mark, 4);
    }

    #[test]
    fn text_op_empty_replacement_deletes() {
        let mut text: Vec<char> = "abcdef".chars().collect();
        let mut state = TextEditState::default();
        let op = TextOp {
            replace: String::new(),
            low: 1,
            high: 4,
            cursor_new: 1,
            mark_new: 1,
            copy: None,
        };
        apply_text_op(&mut text, &mut state, &op);
        assert_eq!(text.iter().collect::<String>(), "aef");
    }

    #[test]
    fn text_op_clamps_out_of_range() {
        let mut text: Vec<char> = "ab".chars().collect();
        let mut state = TextEditState::default();
        let op = TextOp {
            replace: "Z".to_owned(),
            low: 5,
            high: 9,
            cursor_new: 99,
            mark_new: 99,
            copy: None,
        };
        apply_text_op(&mut text, &mut state, &op);
        assert_eq!(text.iter().collect::<String>(), "abZ");
        assert_eq!(state.cursor, 3);
    }
}
