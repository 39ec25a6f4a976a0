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

//! Editor command registry: names, arity and dispatch targets for console
//! lines.

use fxhash::FxHashMap;
use log::warn;

/// Every console-invocable editor operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    NodeAdd,
    NodeRemove,
    NodeSetPosition,
    NodeSetRbPrefab,
    NodeSetProxy3d,
    CollisionShapeRemove,
    CollisionBoxAdd,
    CollisionSphereAdd,
    CollisionCapsuleAdd,
    RbPrefabAdd,
    RbPrefabRemove,
    RenderMeshAdd,
    RenderMeshRemove,
    Compile,
    Run,
    Pause,
    Stop,
}

#[derive(Clone, Copy, Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub arg_count: u32,
    pub command: Command,
}

pub struct CommandRegistry {
    specs: Vec<CommandSpec>,
    by_name: FxHashMap<&'static str, u32>,
}

impl CommandRegistry {
    pub fn with_builtin_commands() -> Self {
        let mut registry = Self {
            specs: Vec::new(),
            by_name: FxHashMap::default(),
        };
        for (name, arg_count, command) in [
            ("led_node_add", 1, Command::NodeAdd),
            ("led_node_remove", 1, Command::NodeRemove),
            ("led_node_set_position", 4, Command::NodeSetPosition),
            ("led_node_set_rb_prefab", 2, Command::NodeSetRbPrefab),
            ("led_node_set_proxy3d", 7, Command::NodeSetProxy3d),
            ("collision_shape_remove", 1, Command::CollisionShapeRemove),
            ("collision_box_add", 4, Command::CollisionBoxAdd),
            ("collision_sphere_add", 2, Command::CollisionSphereAdd),
            ("collision_capsule_add", 3, Command::CollisionCapsuleAdd),
            ("rb_prefab_add", 6, Command::RbPrefabAdd),
            ("rb_prefab_remove", 1, Command::RbPrefabRemove),
            ("render_mesh_add", 2, Command::RenderMeshAdd),
            ("render_mesh_remove", 1, Command::RenderMeshRemove),
            ("led_compile", 0, Command::Compile),
            ("led_run", 0, Command::Run),
            ("led_pause", 0, Command::Pause),
            ("led_stop", 0, Command::Stop),
        ] {
            registry.register(name, arg_count, command);
        }
        registry
    }

    pub fn register(&mut self, name: &'static str, arg_count: u32, command: Command) {
        debug_assert!(!self.by_name.contains_key(name));
        self.by_name.insert(name, self.specs.len() as u32);
        self.specs.push(CommandSpec {
            name,
            arg_count,
            command,
        });
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Tokenize a console line and resolve it to a command plus argument
    /// tokens; unknown names and arity mismatches are logged and dropped.
    pub fn parse<'a>(&self, line: &'a str) -> Option<(Command, Vec<&'a str>)> {
        let mut tokens = line.split_whitespace();
        let name = tokens.next()?;
        let args: Vec<&str> = tokens.collect();

        let spec = match self.by_name.get(name) {
            Some(&index) => &self.specs[index as usize],
            None => {
                warn!("unknown command {:?}", name);
                return None;
            }
        };
        if args.len() != spec.arg_count as usize {
            warn!(
                "{} expects {} argument(s), got {}",
                spec.name,
                spec.arg_count,
                args.len()
            );
            return None;
        }
        Some((spec.command, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_resolves_known_commands() {
        let registry = CommandRegistry::with_builtin_commands();
        let (command, args) = registry.parse("collision_sphere_add ball 2.0").unwrap();
        assert_eq!(command, Command::CollisionSphereAdd);
        assert_eq!(args, vec!["ball", "2.0"]);
    }

    #[test]
    fn parse_rejects_unknown_and_bad_arity() {
        let registry = CommandRegistry::with_builtin_commands();
        assert!(registry.parse("frobnicate 1").is_none());
        assert!(registry.parse("led_node_add").is_none());
        assert!(registry.parse("").is_none());
    }
}
