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

//! String-interned, reference-counted object table.
//!
//! Maps a UTF-8 identifier to a pooled payload slot with a `u32` reference
//! count. Slot 0 is the permanently-allocated stub: every failed lookup and
//! every rejected operation resolves to it, so callers can treat the
//! returned index uniformly and only branch on `!= STUB` where it matters.

use containers::{ChainMap, Pool, HASH_NULL};
use log::warn;

/// Reserved error/miss slot.
pub const STUB_INDEX: u32 = 0;

/// Identifiers above this byte length are rejected with the stub.
pub const ID_BYTES_MAX: usize = 256;

#[derive(Default)]
struct Entry<T> {
    id: String,
    references: u32,
    value: T,
}

pub struct NameDb<T> {
    map: ChainMap,
    pool: Pool<Entry<T>>,
}

impl<T: Default> NameDb<T> {
    pub fn new(bucket_count: u32, capacity: u32, growable: bool) -> Self {
        let mut db = Self {
            map: ChainMap::new(bucket_count, capacity, growable),
            pool: Pool::new(capacity, growable),
        };
        // Seed the stub under the empty identifier.
        let stub = db.pool.reserve().expect("namedb stub slot");
        debug_assert_eq!(stub, STUB_INDEX);
        db.map.add(fxhash::hash32(""), stub);
        db
    }

    pub fn count(&self) -> u32 {
        // the stub never counts as a live entry
        self.pool.count() - 1
    }

    fn validate(id: &str) -> bool {
        if id.is_empty() {
            warn!("rejecting empty identifier");
            return false;
        }
        if id.len() > ID_BYTES_MAX {
            warn!("rejecting identifier of {} bytes", id.len());
            return false;
        }
        true
    }

    /// Insert `id` with a default payload. Returns the stub on invalid
    /// input, on collision with an existing entry and on pool exhaustion.
    pub fn add(&mut self, id: &str) -> u32 {
        if !Self::validate(id) {
            return STUB_INDEX;
        }
        if self.lookup(id) != STUB_INDEX {
            warn!("identifier collision on {:?}", id);
            return STUB_INDEX;
        }
        let index = match self.pool.reserve() {
            Some(index) => index,
            None => {
                warn!("name database full, dropping {:?}", id);
                return STUB_INDEX;
            }
        };
        if !self.map.add(fxhash::hash32(id), index) {
            self.pool.remove(index);
            warn!("name database chain full, dropping {:?}", id);
            return STUB_INDEX;
        }
        let entry = self.pool.get_mut(index);
        entry.id = id.to_owned();
        entry.references = 0;
        index
    }

    /// Resolve `id` to its slot, or the stub when absent. Collisions within
    /// a chain are resolved by byte equality on the identifier.
    pub fn lookup(&self, id: &str) -> u32 {
        let mut at = self.map.first(fxhash::hash32(id));
        while at != HASH_NULL {
            if self.pool.get(at).id == id {
                return at;
            }
            at = self.map.next(at);
        }
        STUB_INDEX
    }

    /// Lookup that bumps the reference count on a hit.
    pub fn reference(&mut self, id: &str) -> u32 {
        let index = self.lookup(id);
        if index != STUB_INDEX {
            self.pool.get_mut(index).references += 1;
        }
        index
    }

    pub fn dereference(&mut self, handle: u32) {
        if handle == STUB_INDEX {
            return;
        }
        let entry = self.pool.get_mut(handle);
        debug_assert!(entry.references > 0);
        if entry.references == 0 {
            warn!("dereference of unreferenced entry {:?}", entry.id);
            return;
        }
        entry.references -= 1;
    }

    pub fn references(&self, handle: u32) -> u32 {
        self.pool.get(handle).references
    }

    /// Whether `handle` names a live, non-stub entry.
    pub fn is_live(&self, handle: u32) -> bool {
        handle != STUB_INDEX && self.pool.is_allocated(handle)
    }

    /// Remove `id`. Entries still referenced are kept (logged no-op).
    pub fn remove(&mut self, id: &str) {
        let index = self.lookup(id);
        if index == STUB_INDEX {
            return;
        }
        let entry = self.pool.get(index);
        if entry.references != 0 {
            warn!(
                "not removing {:?}: {} reference(s) outstanding",
                id, entry.references
            );
            return;
        }
        self.map.remove(fxhash::hash32(id), index);
        self.pool.remove(index);
    }

    pub fn id_of(&self, handle: u32) -> &str {
        &self.pool.get(handle).id
    }

    pub fn get(&self, handle: u32) -> &T {
        &self.pool.get(handle).value
    }

    pub fn get_mut(&mut self, handle: u32) -> &mut T {
        &mut self.pool.get_mut(handle).value
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str, &T)> {
        self.pool
            .iter_allocated()
            .filter(|(index, _)| *index != STUB_INDEX)
            .map(|(index, entry)| (index, entry.id.as_str(), &entry.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_lookup_round_trip() {
        let mut db: NameDb<u32> = NameDb::new(64, 64, false);
        let ball = db.add("ball");
        assert_ne!(ball, STUB_INDEX);
        *db.get_mut(ball) = 7;

        assert_eq!(db.lookup("ball"), ball);
        assert_eq!(db.id_of(ball), "ball");
        assert_eq!(*db.get(ball), 7);
        assert_eq!(db.lookup("wall"), STUB_INDEX);
    }

    #[test]
    fn duplicate_add_returns_stub() {
        let mut db: NameDb<u32> = NameDb::new(64, 64, false);
        assert_ne!(db.add("crate"), STUB_INDEX);
        assert_eq!(db.add("crate"), STUB_INDEX);
        assert_eq!(db.count(), 1);
    }

    #[test]
    fn invalid_identifiers_are_rejected() {
        let mut db: NameDb<u32> = NameDb::new(64, 64, false);
        assert_eq!(db.add(""), STUB_INDEX);
        let long = "x".repeat(ID_BYTES_MAX + 1);
        assert_eq!(db.add(&long), STUB_INDEX);
        assert_eq!(db.count(), 0);
    }

    #[test]
    fn reference_blocks_removal() {
        let mut db: NameDb<u32> = NameDb::new(64, 64, false);
        let handle = db.add("mesh/cube");
        assert_eq!(db.reference("mesh/cube"), handle);
        assert_eq!(db.references(handle), 1);

        db.remove("mesh/cube");
        assert_eq!(db.lookup("mesh/cube"), handle);

        db.dereference(handle);
        db.remove("mesh/cube");
        assert_eq!(db.lookup("mesh/cube"), STUB_INDEX);
    }

    #[test]
    fn removed_ids_can_be_reinserted() {
        let mut db: NameDb<u32> = NameDb::new(64, 64, false);
        let first = db.add("node");
        db.remove("node");
        let second = db.add("node");
        assert_eq!(first, second);
    }
}
