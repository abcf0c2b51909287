//! The runtime table: an open-addressed hash part with a split dense
//! array part.
//!
//! Hash keys are string handles compared by identity first, then by
//! `(hash, length, bytes)`. Number keys that do not fit the dense array are
//! canonicalized by the VM into sigil-prefixed string keys (`\x1F n <dec>`),
//! which keeps this structure homogeneous.

use crate::heap::{Arena, StringId};
use crate::object::StrObject;
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Debug, Clone, Copy, Default)]
enum Slot {
    #[default]
    Empty,
    Tombstone,
    Full {
        key: StringId,
        hash: u32,
        value: Value,
    },
}

/// Hash + array container.
#[derive(Debug, Default)]
pub struct Table {
    /// Live entries plus tombstones; drives the load factor.
    count: usize,
    /// Live entries only.
    live: usize,
    slots: Vec<Slot>,
    /// Dense part; `array[i]` holds index `i + 1`. Length is capacity.
    array: Vec<Value>,
    /// 1-based highest non-nil array index.
    array_max: usize,
}

impl Table {
    pub fn new() -> Self {
        Table::default()
    }

    /// Number of live hash entries.
    pub fn live_entries(&self) -> usize {
        self.live
    }

    /// 1-based highest non-nil index of the dense part.
    pub fn array_max(&self) -> usize {
        self.array_max
    }

    /// Number of non-nil values in the dense part.
    pub fn array_len(&self) -> usize {
        self.array.iter().filter(|v| !v.is_nil()).count()
    }

    fn probe(&self, strings: &Arena<StrObject>, key: StringId, hash: u32) -> usize {
        debug_assert!(!self.slots.is_empty());
        let key_str = strings.get(key.0);
        let mut index = hash as usize % self.slots.len();
        let mut tombstone = None;
        loop {
            match self.slots[index] {
                Slot::Empty => return tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Slot::Full {
                    key: entry_key,
                    hash: entry_hash,
                    ..
                } => {
                    if entry_key == key {
                        return index;
                    }
                    if entry_hash == hash {
                        let entry_str = strings.get(entry_key.0);
                        if entry_str.len() == key_str.len() && entry_str.chars == key_str.chars {
                            return index;
                        }
                    }
                }
            }
            index = (index + 1) % self.slots.len();
        }
    }

    fn grow(&mut self, strings: &Arena<StrObject>) {
        let new_capacity = if self.slots.len() < 8 {
            8
        } else {
            self.slots.len() * 2
        };
        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; new_capacity]);
        self.count = 0;
        self.live = 0;
        for slot in old {
            if let Slot::Full { key, hash, value } = slot {
                let index = self.probe(strings, key, hash);
                self.slots[index] = Slot::Full { key, hash, value };
                self.count += 1;
                self.live += 1;
            }
        }
    }

    /// Looks up a string key.
    pub fn get(&self, strings: &Arena<StrObject>, key: StringId) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let hash = strings.get(key.0).hash;
        match self.slots[self.probe(strings, key, hash)] {
            Slot::Full { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Inserts or overwrites a string key. Returns true for a new key.
    pub fn set(&mut self, strings: &Arena<StrObject>, key: StringId, value: Value) -> bool {
        if (self.count + 1) as f64 > self.slots.len() as f64 * MAX_LOAD {
            self.grow(strings);
        }
        let hash = strings.get(key.0).hash;
        let index = self.probe(strings, key, hash);
        let is_new = !matches!(self.slots[index], Slot::Full { .. });
        if is_new {
            // A reclaimed tombstone was already counted toward the load.
            if matches!(self.slots[index], Slot::Empty) {
                self.count += 1;
            }
            self.live += 1;
        }
        self.slots[index] = Slot::Full { key, hash, value };
        is_new
    }

    /// Removes a string key, leaving a tombstone. Returns true if present.
    pub fn delete(&mut self, strings: &Arena<StrObject>, key: StringId) -> bool {
        if self.count == 0 {
            return false;
        }
        let hash = strings.get(key.0).hash;
        let index = self.probe(strings, key, hash);
        if matches!(self.slots[index], Slot::Full { .. }) {
            self.slots[index] = Slot::Tombstone;
            self.live -= 1;
            true
        } else {
            false
        }
    }

    /// Copies every hash entry of `other` into `self`.
    pub fn extend_from(&mut self, strings: &Arena<StrObject>, other: &Table) {
        for (key, value) in other.iter_hash() {
            self.set(strings, key, value);
        }
    }

    /// Reads the dense part. Returns `None` for nil or out-of-range.
    pub fn get_array(&self, index: i64) -> Option<Value> {
        if index < 1 {
            return None;
        }
        let raw = (index - 1) as usize;
        match self.array.get(raw) {
            Some(v) if !v.is_nil() => Some(*v),
            _ => None,
        }
    }

    /// Writes the dense part. Returns false when the index must go to the
    /// hash part instead (too sparse or non-positive).
    pub fn set_array(&mut self, index: i64, value: Value) -> bool {
        if index < 1 {
            return false;
        }
        let index = index as usize;
        let raw = index - 1;
        if index > self.array_max + 1 && index > self.array.len() {
            return false;
        }
        if raw >= self.array.len() {
            let mut new_capacity = if self.array.is_empty() { 8 } else { self.array.len() * 2 };
            while raw >= new_capacity {
                new_capacity *= 2;
            }
            self.array.resize(new_capacity, Value::Nil);
        }
        self.array[raw] = value;
        if !value.is_nil() {
            if index > self.array_max {
                self.array_max = index;
            }
        } else if index == self.array_max {
            let mut new_max = self.array_max - 1;
            while new_max >= 1 && self.array[new_max - 1].is_nil() {
                new_max -= 1;
            }
            self.array_max = new_max;
        }
        true
    }

    /// Dense-prefix length: the count of leading non-nil entries starting
    /// at index 1.
    pub fn sequence_len(&self) -> usize {
        let mut len = 0;
        while self.get_array(len as i64 + 1).is_some() {
            len += 1;
        }
        len
    }

    /// Iterates live hash entries in slot order.
    pub fn iter_hash(&self) -> impl Iterator<Item = (StringId, Value)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Full { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    /// Slot index of a key, for resumable iteration.
    pub fn slot_of(&self, strings: &Arena<StrObject>, key: StringId) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        let hash = strings.get(key.0).hash;
        let index = self.probe(strings, key, hash);
        match self.slots[index] {
            Slot::Full { .. } => Some(index),
            _ => None,
        }
    }

    /// First live hash entry at or after `start` (slot order).
    pub fn entry_at_or_after(&self, start: usize) -> Option<(StringId, Value)> {
        self.slots[start.min(self.slots.len())..]
            .iter()
            .find_map(|slot| match slot {
                Slot::Full { key, value, .. } => Some((*key, *value)),
                _ => None,
            })
    }

    /// Raw dense-part view, nils included, for marking and printing.
    pub fn array_slots(&self) -> &[Value] {
        &self.array
    }
}

/// FNV-1a over a byte string; the hash every table key carries.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Canonical hash-key text for a numeric key: the sigil prefix `\x1F n`
/// followed by the normalized decimal form (`-0.0` collapses to `0`).
pub fn number_key_text(mut n: f64) -> String {
    if n == 0.0 {
        n = 0.0;
    }
    format!("\u{1F}n{}", crate::value::number_to_string(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn intern(heap: &mut Heap, s: &str) -> StringId {
        heap.alloc_string(s.to_string())
    }

    #[test]
    fn set_get_round_trip() {
        let mut heap = Heap::new();
        let key = intern(&mut heap, "answer");
        let mut table = Table::new();
        assert!(table.set(heap.strings(), key, Value::Number(42.0)));
        assert_eq!(table.get(heap.strings(), key), Some(Value::Number(42.0)));
        assert!(!table.set(heap.strings(), key, Value::Number(7.0)));
        assert_eq!(table.get(heap.strings(), key), Some(Value::Number(7.0)));
    }

    #[test]
    fn distinct_handles_same_content_collide() {
        let mut heap = Heap::new();
        let a = intern(&mut heap, "k");
        let b = intern(&mut heap, "k");
        assert_ne!(a, b);
        let mut table = Table::new();
        table.set(heap.strings(), a, Value::Bool(true));
        assert_eq!(table.get(heap.strings(), b), Some(Value::Bool(true)));
    }

    #[test]
    fn delete_leaves_reusable_tombstone() {
        let mut heap = Heap::new();
        let key = intern(&mut heap, "gone");
        let mut table = Table::new();
        table.set(heap.strings(), key, Value::Nil);
        assert!(table.delete(heap.strings(), key));
        assert!(!table.delete(heap.strings(), key));
        assert_eq!(table.get(heap.strings(), key), None);
        assert!(table.set(heap.strings(), key, Value::Bool(false)));
        assert_eq!(table.live_entries(), 1);
    }

    #[test]
    fn survives_growth() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let keys: Vec<StringId> = (0..64)
            .map(|i| intern(&mut heap, &format!("key{i}")))
            .collect();
        for (i, &key) in keys.iter().enumerate() {
            table.set(heap.strings(), key, Value::Number(i as f64));
        }
        for (i, &key) in keys.iter().enumerate() {
            assert_eq!(table.get(heap.strings(), key), Some(Value::Number(i as f64)));
        }
        assert_eq!(table.live_entries(), 64);
    }

    #[test]
    fn array_accepts_append_and_in_range_only() {
        let mut table = Table::new();
        assert!(table.set_array(1, Value::Number(10.0)));
        assert!(table.set_array(2, Value::Number(20.0)));
        assert!(table.set_array(1, Value::Number(11.0)));
        // Sparse write beyond capacity is rejected.
        assert!(!table.set_array(100, Value::Number(1.0)));
        assert!(!table.set_array(0, Value::Nil));
        assert_eq!(table.array_max(), 2);
        assert_eq!(table.get_array(1), Some(Value::Number(11.0)));
        assert_eq!(table.get_array(3), None);
    }

    #[test]
    fn nil_write_shrinks_array_max() {
        let mut table = Table::new();
        for i in 1..=4 {
            table.set_array(i, Value::Number(i as f64));
        }
        table.set_array(3, Value::Nil);
        assert_eq!(table.array_max(), 4);
        table.set_array(4, Value::Nil);
        // Trailing nil at the old max walks down past interior nils.
        assert_eq!(table.array_max(), 2);
    }

    #[test]
    fn number_keys_canonicalize() {
        assert_eq!(number_key_text(0.0), number_key_text(-0.0));
        assert_eq!(number_key_text(3.0), "\u{1F}n3");
        assert_eq!(number_key_text(2.5), "\u{1F}n2.5");
    }

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(hash_bytes(b""), 2166136261);
        assert_eq!(hash_bytes(b"a"), 0xe40c292c);
        assert_eq!(hash_bytes(b"foobar"), 0xbf9cf968);
    }
}
