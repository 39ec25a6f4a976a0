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

//! Autolayout: immediate sizes resolve at node creation; everything else
//! runs in two deterministic passes at frame end. The post-order pass
//! aggregates CHILDSUM sizes bottom-up; the final top-down pass resolves
//! postponed percentages, solves size violations, compacts child positions
//! and produces window-absolute rectangles with visibility clipping.

use crate::{
    node::{Interval, NodeFlags, SemanticSize, UiNode, AXIS_X, AXIS_Y},
    text::{layout_text, Font},
};
use containers::{HierarchyIndex, HI_NULL_INDEX};

const EPS: f32 = 1e-3;

/// Children of `parent`, skipping none; plain link walk.
fn children(nodes: &HierarchyIndex<UiNode>, parent: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let mut at = nodes.links(parent).first;
    while at != HI_NULL_INDEX {
        out.push(at);
        at = nodes.links(at).next;
    }
    out
}

/// Preorder node list from `root`; parents precede children, siblings in
/// insertion order.
pub(crate) fn preorder(nodes: &HierarchyIndex<UiNode>, root: u32) -> Vec<u32> {
    let mut order = Vec::with_capacity(nodes.count() as usize);
    let mut stack = vec![root];
    while let Some(at) = stack.pop() {
        order.push(at);
        let links = *nodes.links(at);
        if at != root && links.next != HI_NULL_INDEX {
            stack.push(links.next);
        }
        if links.first != HI_NULL_INDEX {
            stack.push(links.first);
        }
    }
    order
}

/// Bottom-up pass: CHILDSUM aggregation (sum along the node's layout axis,
/// max across it) and TEXT sizes whose layout resolved at creation.
pub(crate) fn pass_childsum(nodes: &mut HierarchyIndex<UiNode>, order: &[u32]) {
    for &at in order.iter().rev() {
        let child_list = children(nodes, at);
        for axis in [AXIS_X, AXIS_Y] {
            if !matches!(
                nodes.get(at).semantic_size[axis],
                SemanticSize::ChildSum { .. }
            ) {
                continue;
            }
            let layout_axis = nodes.get(at).child_layout_axis;
            let mut sum = 0.0f32;
            let mut max = 0.0f32;
            for &child in child_list.iter() {
                let node = nodes.get(child);
                if node.flags.contains(NodeFlags::floating(axis)) {
                    continue;
                }
                sum += node.layout_size[axis];
                max = max.max(node.layout_size[axis]);
            }
            nodes.get_mut(at).layout_size[axis] = if axis == layout_axis { sum } else { max };
        }
    }
}

/// Shrink `sizes` toward the per-child floor `strictness * original` until
/// the sum fits `capacity` or no shrinkable budget remains. Returns the
/// residual overflow.
fn solve_violation(
    sizes: &mut [f32],
    original: &[f32],
    strictness: &[f32],
    frozen: &[bool],
    capacity: f32,
) -> f32 {
    let mut violation: f32 = sizes.iter().sum::<f32>() - capacity;
    if violation <= EPS {
        return 0.0;
    }

    let rounds = frozen.iter().filter(|&&f| !f).count();
    for _ in 0..rounds {
        if violation <= EPS {
            break;
        }
        let mut budget = 0.0f32;
        for i in 0..sizes.len() {
            if frozen[i] {
                continue;
            }
            budget += (sizes[i] - strictness[i] * original[i]).max(0.0);
        }
        if budget <= EPS {
            break;
        }
        let scale = (violation / budget).min(1.0);
        for i in 0..sizes.len() {
            if frozen[i] {
                continue;
            }
            let shrink = (sizes[i] - strictness[i] * original[i]).max(0.0) * scale;
            sizes[i] -= shrink;
            violation -= shrink;
        }
    }
    violation.max(0.0)
}

/// Top-down pass over a laid-out frame: postponed sizes, violation solving,
/// child compaction and window-absolute rectangles.
pub(crate) fn pass_final(
    nodes: &mut HierarchyIndex<UiNode>,
    order: &[u32],
    root: u32,
    window_size: [f32; 2],
    fonts: &[Font],
) {
    {
        let node = nodes.get_mut(root);
        node.layout_size = window_size;
        node.pixel_size = window_size;
        node.pixel_position = [0.0, 0.0];
        node.pixel_visible = [
            Interval::new(0.0, window_size[0]),
            Interval::new(0.0, window_size[1]),
        ];
    }

    for &at in order.iter() {
        let child_list = children(nodes, at);
        if child_list.is_empty() {
            continue;
        }
        let parent_size = nodes.get(at).pixel_size;
        let parent_position = nodes.get(at).pixel_position;
        let parent_visible = nodes.get(at).pixel_visible;
        let layout_axis = nodes.get(at).child_layout_axis;

        // Resolve what had to wait for the parent's final size.
        for &child in child_list.iter() {
            for axis in [AXIS_X, AXIS_Y] {
                let node = nodes.get_mut(child);
                if node.flags.contains(NodeFlags::perc_postponed(axis)) {
                    if let SemanticSize::PercParent { pct, .. } = node.semantic_size[axis] {
                        node.layout_size[axis] = pct * parent_size[axis];
                    }
                    node.flags.remove(NodeFlags::perc_postponed(axis));
                }
            }

            let node = nodes.get_mut(child);
            if node.flags.contains(NodeFlags::TEXT_LAYOUT_POSTPONED) {
                node.flags.remove(NodeFlags::TEXT_LAYOUT_POSTPONED);
                let width = (node.layout_size[AXIS_X] - 2.0 * node.text_pad[AXIS_X]).max(0.0);
                let font = &fonts[node.font as usize];
                let layout = layout_text(font, &node.text, width);
                if let SemanticSize::Text { .. } = node.semantic_size[AXIS_Y] {
                    node.layout_size[AXIS_Y] =
                        layout.height(font) + 2.0 * node.text_pad[AXIS_Y];
                }
                node.text_layout = Some(layout);
            }
        }

        // Violation solving along the layout axis, floating children exempt.
        let solved: Vec<u32> = child_list
            .iter()
            .copied()
            .filter(|&c| {
                !nodes
                    .get(c)
                    .flags
                    .contains(NodeFlags::floating(layout_axis))
            })
            .collect();

        // PAD_FILL children absorb leftover space before any shrinking.
        let mut fixed_total = 0.0f32;
        let mut fill_count = 0u32;
        for &child in solved.iter() {
            let node = nodes.get(child);
            if node.flags.contains(NodeFlags::PAD_FILL) {
                fill_count += 1;
            } else {
                fixed_total += node.layout_size[layout_axis];
            }
        }
        if fill_count > 0 {
            let fill = ((parent_size[layout_axis] - fixed_total) / fill_count as f32).max(0.0);
            for &child in solved.iter() {
                if nodes.get(child).flags.contains(NodeFlags::PAD_FILL) {
                    nodes.get_mut(child).layout_size[layout_axis] = fill;
                }
            }
        }

        let mut sizes: Vec<f32> = solved
            .iter()
            .map(|&c| nodes.get(c).layout_size[layout_axis])
            .collect();
        let original = sizes.clone();
        let strictness: Vec<f32> = solved
            .iter()
            .map(|&c| nodes.get(c).semantic_size[layout_axis].strictness())
            .collect();
        let frozen: Vec<bool> = solved
            .iter()
            .map(|&c| {
                nodes
                    .get(c)
                    .flags
                    .contains(NodeFlags::allow_violation(layout_axis))
            })
            .collect();
        solve_violation(
            &mut sizes,
            &original,
            &strictness,
            &frozen,
            parent_size[layout_axis],
        );
        for (i, &child) in solved.iter().enumerate() {
            nodes.get_mut(child).layout_size[layout_axis] = sizes[i];
        }

        // Compact along the layout axis; X runs left to right, Y top down.
        let mut cursor = 0.0f32;
        for &child in solved.iter() {
            let size = nodes.get(child).layout_size[layout_axis];
            let node = nodes.get_mut(child);
            if !node.flags.contains(NodeFlags::fixed(layout_axis)) {
                node.layout_position[layout_axis] = if layout_axis == AXIS_X {
                    cursor
                } else {
                    parent_size[AXIS_Y] - cursor - size
                };
            }
            cursor += size;
        }
        // Cross-axis: left/top aligned.
        let cross = 1 - layout_axis;
        for &child in solved.iter() {
            let size = nodes.get(child).layout_size[cross];
            let node = nodes.get_mut(child);
            if !node.flags.contains(NodeFlags::fixed(cross))
                && !node.flags.contains(NodeFlags::floating(cross))
            {
                node.layout_position[cross] = if cross == AXIS_X {
                    0.0
                } else {
                    parent_size[AXIS_Y] - size
                };
            }
        }

        // Window-absolute placement and clipping.
        for &child in child_list.iter() {
            let node = nodes.get_mut(child);
            node.pixel_size = node.layout_size;
            for axis in [AXIS_X, AXIS_Y] {
                node.pixel_position[axis] = if node.flags.contains(NodeFlags::floating(axis)) {
                    node.floating_position[axis]
                } else if node.flags.contains(NodeFlags::fixed(axis)) {
                    parent_position[axis] + node.floating_position[axis]
                } else {
                    parent_position[axis] + node.layout_position[axis]
                };
                let rect = Interval::new(
                    node.pixel_position[axis],
                    node.pixel_position[axis] + node.pixel_size[axis],
                );
                node.pixel_visible[axis] = rect.intersect(&parent_visible[axis]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_shrinks_proportionally_to_slack() {
        // two children of 60 in a parent of 100; strictness 0.5 each:
        // each can give up to 30, need 20 total -> 10 each
        let mut sizes = vec![60.0, 60.0];
        let original = sizes.clone();
        let residual = solve_violation(
            &mut sizes,
            &original,
            &[0.5, 0.5],
            &[false, false],
            100.0,
        );
        assert!(residual.abs() < 1e-2);
        assert!((sizes[0] - 50.0).abs() < 1e-2);
        assert!((sizes[1] - 50.0).abs() < 1e-2);
    }

    #[test]
    fn strict_children_are_never_shrunk_below_floor() {
        let mut sizes = vec![80.0, 40.0];
        let original = sizes.clone();
        // first child fully strict: all shrinking falls on the second
        let residual = solve_violation(
            &mut sizes,
            &original,
            &[1.0, 0.0],
            &[false, false],
            100.0,
        );
        assert!(residual.abs() < 1e-2);
        assert!((sizes[0] - 80.0).abs() < 1e-2);
        assert!((sizes[1] - 20.0).abs() < 1e-2);
    }

    #[test]
    fn unsolvable_violation_reports_residual() {
        let mut sizes = vec![80.0, 60.0];
        let original = sizes.clone();
        let residual = solve_violation(
            &mut sizes,
            &original,
            &[1.0, 1.0],
            &[false, false],
            100.0,
        );
        assert!((residual - 40.0).abs() < 1e-2);
    }

    #[test]
    fn violating_children_are_exempt() {
        let mut sizes = vec![70.0, 50.0];
        let original = sizes.clone();
        let residual = solve_violation(
            &mut sizes,
            &original,
            &[0.0, 0.0],
            &[true, false],
            100.0,
        );
        assert!(residual.abs() < 1e-2);
        assert!((sizes[0] - 70.0).abs() < 1e-2);
        assert!((sizes[1] - 30.0).abs() < 1e-2);
    }
}
