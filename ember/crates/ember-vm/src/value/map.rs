//! Open-addressing hash table for Ember maps and sets.
//!
//! Linear probing with tombstones. The table grows when the load factor
//! (live entries plus tombstones) exceeds 3/4; growth rehashes live
//! entries only, so tombstones are reclaimed on resize. Capacity is
//! always a power of two so the hash can be masked down to an index.
//!
//! Keys are compared with [`Value::key_eq`] and hashed with the hash the
//! caller supplies - the VM precomputes value hashes before probing so
//! the table itself never needs heap access.

use crate::value::Value;

/// Initial capacity for a non-empty table.
const INITIAL_CAPACITY: usize = 8;

/// Maximum load factor numerator/denominator (3/4).
const LOAD_NUM: usize = 3;
const LOAD_DEN: usize = 4;

#[derive(Clone, Debug)]
enum Bucket {
    Empty,
    /// A deleted entry; probing continues past it, inserts may reuse it.
    Tombstone,
    Occupied {
        hash: u64,
        key: Value,
        value: Value,
    },
}

/// An open-addressing map from values to values.
#[derive(Clone, Debug, Default)]
pub struct ValueMap {
    buckets: Vec<Bucket>,
    /// Live entries.
    len: usize,
    /// Occupied plus tombstone buckets.
    filled: usize,
}

impl ValueMap {
    /// Creates an empty map (no allocation until first insert).
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the map has no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts or replaces; returns the previous value if the key was
    /// present.
    pub fn insert(&mut self, hash: u64, key: Value, value: Value) -> Option<Value> {
        if self.filled + 1 > self.buckets.len() * LOAD_NUM / LOAD_DEN {
            self.grow();
        }

        let index = self.probe(hash, &key);
        match &mut self.buckets[index] {
            bucket @ Bucket::Empty => {
                *bucket = Bucket::Occupied { hash, key, value };
                self.len += 1;
                self.filled += 1;
                None
            }
            bucket @ Bucket::Tombstone => {
                *bucket = Bucket::Occupied { hash, key, value };
                self.len += 1;
                None
            }
            Bucket::Occupied { value: existing, .. } => {
                Some(std::mem::replace(existing, value))
            }
        }
    }

    /// Looks up a key.
    pub fn get(&self, hash: u64, key: &Value) -> Option<&Value> {
        if self.buckets.is_empty() {
            return None;
        }
        let index = self.find(hash, key)?;
        match &self.buckets[index] {
            Bucket::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Removes a key; returns its value if it was present.
    pub fn delete(&mut self, hash: u64, key: &Value) -> Option<Value> {
        if self.buckets.is_empty() {
            return None;
        }
        let index = self.find(hash, key)?;
        let bucket = std::mem::replace(&mut self.buckets[index], Bucket::Tombstone);
        match bucket {
            Bucket::Occupied { value, .. } => {
                self.len -= 1;
                Some(value)
            }
            other => {
                // find() only returns occupied buckets.
                self.buckets[index] = other;
                None
            }
        }
    }

    /// Whether the key is present.
    pub fn contains(&self, hash: u64, key: &Value) -> bool {
        self.get(hash, key).is_some()
    }

    /// Removes all entries, keeping the allocation.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            *bucket = Bucket::Empty;
        }
        self.len = 0;
        self.filled = 0;
    }

    /// Iterates live entries in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.buckets.iter().filter_map(|bucket| match bucket {
            Bucket::Occupied { key, value, .. } => Some((key, value)),
            _ => None,
        })
    }

    /// Iterates live entries with their stored hashes (used by resize
    /// and set operations).
    pub fn iter_hashed(&self) -> impl Iterator<Item = (u64, &Value, &Value)> {
        self.buckets.iter().filter_map(|bucket| match bucket {
            Bucket::Occupied { hash, key, value } => Some((*hash, key, value)),
            _ => None,
        })
    }

    /// Index of the bucket holding `key`, if present.
    fn find(&self, hash: u64, key: &Value) -> Option<usize> {
        let mask = self.buckets.len() - 1;
        let mut index = (hash as usize) & mask;
        loop {
            match &self.buckets[index] {
                Bucket::Empty => return None,
                Bucket::Tombstone => {}
                Bucket::Occupied {
                    hash: h, key: k, ..
                } => {
                    if *h == hash && k.key_eq(key) {
                        return Some(index);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Index where `key` lives or should be inserted (first tombstone on
    /// the probe path is reused when the key is absent).
    fn probe(&self, hash: u64, key: &Value) -> usize {
        let mask = self.buckets.len() - 1;
        let mut index = (hash as usize) & mask;
        let mut first_tombstone = None;
        loop {
            match &self.buckets[index] {
                Bucket::Empty => return first_tombstone.unwrap_or(index),
                Bucket::Tombstone => {
                    first_tombstone.get_or_insert(index);
                }
                Bucket::Occupied {
                    hash: h, key: k, ..
                } => {
                    if *h == hash && k.key_eq(key) {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.buckets.is_empty() {
            INITIAL_CAPACITY
        } else {
            self.buckets.len() * 2
        };
        let old = std::mem::replace(
            &mut self.buckets,
            vec![Bucket::Empty; new_capacity],
        );
        self.len = 0;
        self.filled = 0;
        for bucket in old {
            if let Bucket::Occupied { hash, key, value } = bucket {
                self.insert(hash, key, value);
            }
        }
    }
}

/// An open-addressing set of values, backed by [`ValueMap`] with nil
/// payloads.
#[derive(Clone, Debug, Default)]
pub struct ValueSet {
    map: ValueMap,
}

impl ValueSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of members.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the set has no members.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Adds a member; returns `true` if it was newly inserted.
    pub fn add(&mut self, hash: u64, value: Value) -> bool {
        self.map.insert(hash, value, Value::Nil).is_none()
    }

    /// Whether the value is a member.
    pub fn contains(&self, hash: u64, value: &Value) -> bool {
        self.map.contains(hash, value)
    }

    /// Removes a member; returns `true` if it was present.
    pub fn delete(&mut self, hash: u64, value: &Value) -> bool {
        self.map.delete(hash, value).is_some()
    }

    /// Removes all members.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Iterates members with their hashes.
    pub fn iter_hashed(&self) -> impl Iterator<Item = (u64, &Value)> {
        self.map.iter_hashed().map(|(hash, key, _)| (hash, key))
    }

    /// Members present in both sets.
    pub fn intersection(&self, other: &ValueSet) -> ValueSet {
        let mut out = ValueSet::new();
        for (hash, member) in self.iter_hashed() {
            if other.contains(hash, member) {
                out.add(hash, member.clone());
            }
        }
        out
    }

    /// Members of either set.
    pub fn union(&self, other: &ValueSet) -> ValueSet {
        let mut out = ValueSet::new();
        for (hash, member) in self.iter_hashed() {
            out.add(hash, member.clone());
        }
        for (hash, member) in other.iter_hashed() {
            out.add(hash, member.clone());
        }
        out
    }

    /// Members of `self` not in `other`.
    pub fn difference(&self, other: &ValueSet) -> ValueSet {
        let mut out = ValueSet::new();
        for (hash, member) in self.iter_hashed() {
            if !other.contains(hash, member) {
                out.add(hash, member.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Value {
        Value::Number(n)
    }

    /// A stand-in for the VM's polymorphic hash, good enough for
    /// number-keyed tests.
    fn h(n: f64) -> u64 {
        ember_util::mix_64(n.to_bits())
    }

    #[test]
    fn test_insert_then_get() {
        let mut map = ValueMap::new();
        map.insert(h(1.0), num(1.0), num(10.0));
        map.insert(h(2.0), num(2.0), num(20.0));
        assert!(matches!(map.get(h(1.0), &num(1.0)), Some(Value::Number(v)) if *v == 10.0));
        assert!(matches!(map.get(h(2.0), &num(2.0)), Some(Value::Number(v)) if *v == 20.0));
        assert!(map.get(h(3.0), &num(3.0)).is_none());
    }

    #[test]
    fn test_insert_replaces() {
        let mut map = ValueMap::new();
        assert!(map.insert(h(1.0), num(1.0), num(10.0)).is_none());
        let old = map.insert(h(1.0), num(1.0), num(11.0));
        assert!(matches!(old, Some(Value::Number(v)) if v == 10.0));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_delete_then_get_is_none() {
        let mut map = ValueMap::new();
        map.insert(h(1.0), num(1.0), num(10.0));
        assert!(map.delete(h(1.0), &num(1.0)).is_some());
        assert!(map.get(h(1.0), &num(1.0)).is_none());
        assert_eq!(map.len(), 0);
        // Deleting again is a no-op.
        assert!(map.delete(h(1.0), &num(1.0)).is_none());
    }

    #[test]
    fn test_len_across_mixed_operations() {
        let mut map = ValueMap::new();
        for i in 0..100 {
            map.insert(h(i as f64), num(i as f64), num(0.0));
        }
        for i in 0..50 {
            map.delete(h(i as f64), &num(i as f64));
        }
        for i in 25..75 {
            map.insert(h(i as f64), num(i as f64), num(1.0));
        }
        // 50..100 survived the deletes (50), plus 25..50 re-inserted (25).
        assert_eq!(map.len(), 75);
        for i in 25..100 {
            assert!(map.get(h(i as f64), &num(i as f64)).is_some(), "missing {i}");
        }
        for i in 0..25 {
            assert!(map.get(h(i as f64), &num(i as f64)).is_none());
        }
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut map = ValueMap::new();
        for i in 0..1000 {
            map.insert(h(i as f64), num(i as f64), num((i * 2) as f64));
        }
        assert_eq!(map.len(), 1000);
        for i in 0..1000 {
            let got = map.get(h(i as f64), &num(i as f64)).unwrap();
            assert!(matches!(got, Value::Number(v) if *v == (i * 2) as f64));
        }
    }

    #[test]
    fn test_nan_key_round_trips() {
        let mut map = ValueMap::new();
        let nan_hash = 0x5eed;
        map.insert(nan_hash, num(f64::NAN), num(1.0));
        assert!(map.get(nan_hash, &num(f64::NAN)).is_some());
    }

    #[test]
    fn test_clear() {
        let mut map = ValueMap::new();
        map.insert(h(1.0), num(1.0), num(1.0));
        map.clear();
        assert!(map.is_empty());
        assert!(map.get(h(1.0), &num(1.0)).is_none());
    }

    #[test]
    fn test_set_operations() {
        let mut a = ValueSet::new();
        let mut b = ValueSet::new();
        for i in 0..6 {
            a.add(h(i as f64), num(i as f64));
        }
        for i in 3..9 {
            b.add(h(i as f64), num(i as f64));
        }

        let union = a.union(&b);
        let intersection = a.intersection(&b);
        let difference = a.difference(&b);

        assert_eq!(union.len(), 9);
        assert_eq!(intersection.len(), 3);
        assert_eq!(difference.len(), 3);
        assert!(intersection.contains(h(4.0), &num(4.0)));
        assert!(difference.contains(h(1.0), &num(1.0)));
        assert!(!difference.contains(h(4.0), &num(4.0)));
    }
}
