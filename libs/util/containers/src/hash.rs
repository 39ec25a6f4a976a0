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

pub const HASH_NULL: u32 = u32::MAX;

/// Open bucket table chaining `u32` values.
///
/// Values double as chain storage indices, so a value may be present under
/// at most one key at a time and must stay below the (growable) chain
/// length. Buckets may mix values of distinct keys that share
/// `hash % bucket_count`; callers iterate with [ChainMap::first] /
/// [ChainMap::next] and compare payloads themselves. Duplicates under one
/// key are allowed.
pub struct ChainMap {
    buckets: Vec<u32>,
    chain: Vec<u32>,
    count: u32,
    growable: bool,
}

impl ChainMap {
    pub fn new(bucket_count: u32, value_capacity: u32, growable: bool) -> Self {
        assert!(bucket_count > 0);
        Self {
            buckets: vec![HASH_NULL; bucket_count as usize],
            chain: vec![HASH_NULL; value_capacity as usize],
            count: 0,
            growable,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    fn bucket(&self, key: u32) -> usize {
        (key % self.buckets.len() as u32) as usize
    }

    fn ensure_capacity(&mut self, value: u32) -> bool {
        if (value as usize) < self.chain.len() {
            return true;
        }
        if !self.growable {
            return false;
        }
        let mut len = self.chain.len().max(1);
        while len <= value as usize {
            len *= 2;
        }
        self.chain.resize(len, HASH_NULL);
        true
    }

    /// Chain `value` under `key`. Returns false when the chain table cannot
    /// hold the value.
    pub fn add(&mut self, key: u32, value: u32) -> bool {
        debug_assert_ne!(value, HASH_NULL);
        if !self.ensure_capacity(value) {
            return false;
        }
        let bucket = self.bucket(key);
        self.chain[value as usize] = self.buckets[bucket];
        self.buckets[bucket] = value;
        self.count += 1;
        true
    }

    /// Unlink `value` from the chain of `key`. Returns false when the value
    /// was not present under that key.
    pub fn remove(&mut self, key: u32, value: u32) -> bool {
        let bucket = self.bucket(key);
        let mut at = self.buckets[bucket];
        if at == value {
            self.buckets[bucket] = self.chain[value as usize];
            self.chain[value as usize] = HASH_NULL;
            self.count -= 1;
            return true;
        }
        while at != HASH_NULL {
            let next = self.chain[at as usize];
            if next == value {
                self.chain[at as usize] = self.chain[value as usize];
                self.chain[value as usize] = HASH_NULL;
                self.count -= 1;
                return true;
            }
            at = next;
        }
        false
    }

    /// First value chained under `key`'s bucket, or HASH_NULL.
    pub fn first(&self, key: u32) -> u32 {
        self.buckets[self.bucket(key)]
    }

    /// Value chained after `value`, or HASH_NULL.
    pub fn next(&self, value: u32) -> u32 {
        self.chain[value as usize]
    }

    pub fn flush(&mut self) {
        self.buckets.fill(HASH_NULL);
        self.chain.fill(HASH_NULL);
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_of(map: &ChainMap, key: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut at = map.first(key);
        while at != HASH_NULL {
            out.push(at);
            at = map.next(at);
        }
        out
    }

    #[test]
    fn add_first_next_walks_chain() {
        let mut map = ChainMap::new(16, 64, false);
        assert!(map.add(3, 10));
        assert!(map.add(3, 11));
        assert!(map.add(3, 12));
        // LIFO chain ordering
        assert_eq!(chain_of(&map, 3), vec![12, 11, 10]);
        assert_eq!(map.count(), 3);
    }

    #[test]
    fn colliding_keys_share_a_bucket() {
        let mut map = ChainMap::new(8, 64, false);
        map.add(1, 20);
        map.add(9, 21); // 9 % 8 == 1
        let chain = chain_of(&map, 1);
        assert!(chain.contains(&20) && chain.contains(&21));
    }

    #[test]
    fn remove_unlinks_middle_and_head() {
        let mut map = ChainMap::new(4, 64, false);
        map.add(2, 30);
        map.add(2, 31);
        map.add(2, 32);

        assert!(map.remove(2, 31));
        assert_eq!(chain_of(&map, 2), vec![32, 30]);
        assert!(map.remove(2, 32));
        assert_eq!(chain_of(&map, 2), vec![30]);
        assert!(!map.remove(2, 99));
        assert_eq!(map.count(), 1);
    }

    #[test]
    fn growable_chain_accepts_large_values() {
        let mut map = ChainMap::new(4, 4, true);
        assert!(map.add(0, 1000));
        assert_eq!(map.first(0), 1000);

        let mut fixed = ChainMap::new(4, 4, false);
        assert!(!fixed.add(0, 1000));
    }
}
