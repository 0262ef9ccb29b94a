//! Hybrid array+hash table for Lua.

use crate::string::StringId;
use crate::value::{LuaValue, NativeId};
use indexmap::IndexMap;

/// A normalized key in the hash part of a table.
///
/// Float keys with an exact integer value are normalized to `Integer`, so
/// `t[2]` and `t[2.0]` hit the same slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    Integer(i64),
    Str(StringId),
    /// Non-integral float key, hashed by bit pattern.
    Float(u64),
    Boolean(bool),
    /// Identity keys for reference values.
    Table(u32),
    Function(u32),
    Native(u32),
}

/// A Lua table: array part for the dense 1..n prefix plus a hash part.
pub struct Table {
    /// Array part (array[0] corresponds to key 1).
    array: Vec<LuaValue>,
    /// Hash part, insertion-order preserving so `next` is stable.
    hash: IndexMap<TableKey, LuaValue>,
    /// Metatable, if any.
    pub metatable: Option<crate::gc::GcIdx<Table>>,
}

impl Table {
    pub fn new(array_hint: usize, hash_hint: usize) -> Self {
        Table {
            array: Vec::with_capacity(array_hint),
            hash: IndexMap::with_capacity(hash_hint),
            metatable: None,
        }
    }

    /// Raw get by value key. Nil for absent keys.
    pub fn raw_get(&self, key: LuaValue) -> LuaValue {
        if let Some(i) = normalize_int_key(key) {
            return self.raw_geti(i);
        }
        match value_to_key(key) {
            Some(k) => self.hash.get(&k).copied().unwrap_or(LuaValue::Nil),
            None => LuaValue::Nil,
        }
    }

    /// Raw set by value key. Nil keys and NaN keys are rejected.
    pub fn raw_set(&mut self, key: LuaValue, value: LuaValue) -> Result<(), &'static str> {
        if key.is_nil() {
            return Err("table index is nil");
        }
        if let LuaValue::Float(f) = key {
            if f.is_nan() {
                return Err("table index is NaN");
            }
        }
        if let Some(i) = normalize_int_key(key) {
            self.raw_seti(i, value);
            return Ok(());
        }
        let k = value_to_key(key).expect("non-nil non-NaN key");
        if value.is_nil() {
            // Keep a tombstone when the key existed so `next` stays valid
            // for a traversal that deletes the current key.
            if self.hash.contains_key(&k) {
                self.hash.insert(k, LuaValue::Nil);
            }
        } else {
            self.hash.insert(k, value);
        }
        Ok(())
    }

    /// Fast integer-keyed get (1-indexed array part, hash fallback).
    pub fn raw_geti(&self, key: i64) -> LuaValue {
        if key >= 1 && (key as usize) <= self.array.len() {
            self.array[(key - 1) as usize]
        } else {
            self.hash
                .get(&TableKey::Integer(key))
                .copied()
                .unwrap_or(LuaValue::Nil)
        }
    }

    /// Fast integer-keyed set.
    pub fn raw_seti(&mut self, key: i64, value: LuaValue) {
        if key >= 1 {
            let idx = (key - 1) as usize;
            if idx < self.array.len() {
                self.array[idx] = value;
                if value.is_nil() {
                    self.trim_array();
                }
                return;
            }
            if idx == self.array.len() {
                if value.is_nil() {
                    return;
                }
                self.array.push(value);
                self.migrate_hash_to_array();
                return;
            }
        }
        let k = TableKey::Integer(key);
        if value.is_nil() {
            if self.hash.contains_key(&k) {
                self.hash.insert(k, LuaValue::Nil);
            }
        } else {
            self.hash.insert(k, value);
        }
    }

    /// Fast string-keyed get.
    pub fn raw_get_str(&self, key: StringId) -> LuaValue {
        self.hash
            .get(&TableKey::Str(key))
            .copied()
            .unwrap_or(LuaValue::Nil)
    }

    /// Fast string-keyed set.
    pub fn raw_set_str(&mut self, key: StringId, value: LuaValue) {
        let k = TableKey::Str(key);
        if value.is_nil() {
            if self.hash.contains_key(&k) {
                self.hash.insert(k, LuaValue::Nil);
            }
        } else {
            self.hash.insert(k, value);
        }
    }

    /// The `#` border: largest n with t[n] non-nil and t[n+1] nil,
    /// found by binary search over the array part.
    pub fn length(&self) -> i64 {
        if self.array.is_empty() {
            return 0;
        }
        if !self.array.last().unwrap().is_nil() {
            return self.array.len() as i64;
        }
        let mut lo = 0usize;
        let mut hi = self.array.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.array[mid].is_nil() {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo as i64
    }

    /// Iteration step: the pair after `key`, or None at the end.
    /// Err(()) means the key was never in the table.
    #[allow(clippy::result_unit_err)]
    pub fn next(&self, key: LuaValue) -> Result<Option<(LuaValue, LuaValue)>, ()> {
        if key.is_nil() {
            for (i, v) in self.array.iter().enumerate() {
                if !v.is_nil() {
                    return Ok(Some((LuaValue::Integer((i + 1) as i64), *v)));
                }
            }
            return Ok(self.first_hash_pair(0));
        }
        if let Some(i) = normalize_int_key(key) {
            if i >= 1 && (i as usize) <= self.array.len() {
                for j in (i as usize)..self.array.len() {
                    if !self.array[j].is_nil() {
                        return Ok(Some((LuaValue::Integer((j + 1) as i64), self.array[j])));
                    }
                }
                return Ok(self.first_hash_pair(0));
            }
        }
        let k = match value_to_key(key) {
            Some(k) => k,
            None => return Err(()),
        };
        match self.hash.get_index_of(&k) {
            Some(pos) => Ok(self.first_hash_pair(pos + 1)),
            None => Err(()),
        }
    }

    /// First live (non-tombstone) hash pair at or after `from`.
    fn first_hash_pair(&self, from: usize) -> Option<(LuaValue, LuaValue)> {
        for (&k, &v) in self.hash.iter().skip(from) {
            if !v.is_nil() {
                return Some((key_to_value(k), v));
            }
        }
        None
    }

    /// Move hash entries that became contiguous with the array into it.
    fn migrate_hash_to_array(&mut self) {
        loop {
            let next_idx = self.array.len() as i64 + 1;
            match self.hash.shift_remove(&TableKey::Integer(next_idx)) {
                Some(v) if !v.is_nil() => self.array.push(v),
                _ => break,
            }
        }
    }

    fn trim_array(&mut self) {
        while self.array.last().is_some_and(|v| v.is_nil()) {
            self.array.pop();
        }
    }

    /// Array values, for GC traversal.
    pub fn array_values(&self) -> &[LuaValue] {
        &self.array
    }

    /// Hash entries, for GC traversal.
    pub fn hash_entries(&self) -> impl Iterator<Item = (&TableKey, &LuaValue)> {
        self.hash.iter()
    }

    /// Approximate entry count, for allocation accounting.
    pub fn approx_len(&self) -> usize {
        self.array.len() + self.hash.len()
    }
}

fn normalize_int_key(key: LuaValue) -> Option<i64> {
    match key {
        LuaValue::Integer(i) => Some(i),
        LuaValue::Float(f) => {
            if f.floor() == f && f >= -(2f64.powi(63)) && f < 2f64.powi(63) {
                Some(f as i64)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn value_to_key(v: LuaValue) -> Option<TableKey> {
    match v {
        LuaValue::Nil => None,
        LuaValue::Boolean(b) => Some(TableKey::Boolean(b)),
        LuaValue::Integer(i) => Some(TableKey::Integer(i)),
        LuaValue::Float(f) => {
            if f.is_nan() {
                None
            } else if let Some(i) = normalize_int_key(v) {
                Some(TableKey::Integer(i))
            } else {
                Some(TableKey::Float(f.to_bits()))
            }
        }
        LuaValue::Str(id) => Some(TableKey::Str(id)),
        LuaValue::Table(idx) => Some(TableKey::Table(idx.index())),
        LuaValue::Function(idx) => Some(TableKey::Function(idx.index())),
        LuaValue::Native(id) => Some(TableKey::Native(id.0)),
    }
}

fn key_to_value(k: TableKey) -> LuaValue {
    match k {
        TableKey::Integer(i) => LuaValue::Integer(i),
        TableKey::Str(id) => LuaValue::Str(id),
        TableKey::Float(bits) => LuaValue::Float(f64::from_bits(bits)),
        TableKey::Boolean(b) => LuaValue::Boolean(b),
        TableKey::Table(i) => LuaValue::Table(crate::gc::GcIdx::from_raw(i)),
        TableKey::Function(i) => LuaValue::Function(crate::gc::GcIdx::from_raw(i)),
        TableKey::Native(i) => LuaValue::Native(NativeId(i)),
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "table(array={}, hash={})",
            self.array.len(),
            self.hash.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_append_and_get() {
        let mut t = Table::new(0, 0);
        t.raw_seti(1, LuaValue::Integer(10));
        t.raw_seti(2, LuaValue::Integer(20));
        t.raw_seti(3, LuaValue::Integer(30));
        assert_eq!(t.raw_geti(2), LuaValue::Integer(20));
        assert_eq!(t.length(), 3);
    }

    #[test]
    fn test_hash_then_migrate() {
        let mut t = Table::new(0, 0);
        // Insert out of order: 3 lands in hash, then 1 and 2 pull it in.
        t.raw_seti(3, LuaValue::Integer(30));
        assert_eq!(t.length(), 0);
        t.raw_seti(1, LuaValue::Integer(10));
        t.raw_seti(2, LuaValue::Integer(20));
        assert_eq!(t.length(), 3);
        assert_eq!(t.raw_geti(3), LuaValue::Integer(30));
    }

    #[test]
    fn test_set_nil_deletes() {
        let mut t = Table::new(0, 0);
        let mut s = crate::string::StringInterner::new();
        let k = s.intern(b"key");
        t.raw_set_str(k, LuaValue::Integer(1));
        t.raw_set_str(k, LuaValue::Nil);
        assert!(t.raw_get_str(k).is_nil());
    }

    #[test]
    fn test_nil_key_rejected() {
        let mut t = Table::new(0, 0);
        assert!(t.raw_set(LuaValue::Nil, LuaValue::Integer(1)).is_err());
    }

    #[test]
    fn test_nan_key_rejected() {
        let mut t = Table::new(0, 0);
        assert!(t
            .raw_set(LuaValue::Float(f64::NAN), LuaValue::Integer(1))
            .is_err());
    }

    #[test]
    fn test_float_key_normalizes_to_int() {
        let mut t = Table::new(0, 0);
        t.raw_set(LuaValue::Float(2.0), LuaValue::Integer(42)).unwrap();
        assert_eq!(t.raw_get(LuaValue::Integer(2)), LuaValue::Integer(42));
        assert_eq!(t.raw_get(LuaValue::Float(2.0)), LuaValue::Integer(42));
    }

    #[test]
    fn test_length_border_after_hole() {
        let mut t = Table::new(0, 0);
        for i in 1..=5 {
            t.raw_seti(i, LuaValue::Integer(i));
        }
        t.raw_seti(5, LuaValue::Nil);
        t.raw_seti(4, LuaValue::Nil);
        assert_eq!(t.length(), 3);
    }

    #[test]
    fn test_next_walks_array_then_hash() {
        let mut t = Table::new(0, 0);
        let mut s = crate::string::StringInterner::new();
        t.raw_seti(1, LuaValue::Integer(10));
        t.raw_seti(2, LuaValue::Integer(20));
        let k = s.intern(b"x");
        t.raw_set_str(k, LuaValue::Integer(99));

        let mut seen = Vec::new();
        let mut key = LuaValue::Nil;
        while let Ok(Some((k, v))) = t.next(key) {
            seen.push(v);
            key = k;
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], LuaValue::Integer(10));
        assert_eq!(seen[1], LuaValue::Integer(20));
        assert_eq!(seen[2], LuaValue::Integer(99));
    }

    #[test]
    fn test_next_invalid_key() {
        let t = Table::new(0, 0);
        assert!(t.next(LuaValue::Integer(42)).is_err());
    }

    #[test]
    fn test_next_survives_delete_of_current() {
        let mut t = Table::new(0, 0);
        let mut s = crate::string::StringInterner::new();
        let a = s.intern(b"a");
        let b = s.intern(b"b");
        t.raw_set_str(a, LuaValue::Integer(1));
        t.raw_set_str(b, LuaValue::Integer(2));
        // Delete the first key mid-traversal; the tombstone keeps `next` valid.
        let (k1, _) = t.next(LuaValue::Nil).unwrap().unwrap();
        t.raw_set(k1, LuaValue::Nil).unwrap();
        let (_, v2) = t.next(k1).unwrap().unwrap();
        assert_eq!(v2, LuaValue::Integer(2));
    }

    #[test]
    fn test_negative_and_zero_keys_in_hash() {
        let mut t = Table::new(0, 0);
        t.raw_seti(0, LuaValue::Integer(100));
        t.raw_seti(-5, LuaValue::Integer(200));
        assert_eq!(t.raw_geti(0), LuaValue::Integer(100));
        assert_eq!(t.raw_geti(-5), LuaValue::Integer(200));
        assert_eq!(t.length(), 0);
    }
}
