//! Index descent and ordered traversal.
//!
//! Traversal state is a caller-owned stack of `(block, index)` pairs; nodes
//! hold no parent pointers. The cursor is lazy and forward-only and holds
//! no lock between `next` calls.

use std::cmp::Ordering;
use std::fs::File;

use crate::date::parse_to_jdn;
use crate::error::Result;

use super::{
    compare_key8, compare_keys, key8_from_f64, key8_of, normalize_key, NdxFile, NDX_MAX_DEPTH,
};

/// Which comparator drives a descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyOrder {
    /// Normalised byte-wise character comparison.
    Char,
    /// High-to-low byte comparison of stored 8-byte doubles.
    Number,
}

/// In-order cursor positioned by a descent to the first entry ≥ a target.
pub struct NdxCursor<'idx> {
    index: &'idx NdxFile,
    file: File,
    stack: Vec<(u32, usize)>,
}

impl<'idx> NdxCursor<'idx> {
    fn descend_first_ge(index: &'idx NdxFile, target: &[u8], order: KeyOrder) -> Result<Self> {
        let mut cursor = NdxCursor {
            index,
            file: index.open_file()?,
            stack: Vec::new(),
        };
        let key_len = index.header().key_len;
        let target8 = key8_of(target);

        let at_or_after = |key: &[u8]| match order {
            KeyOrder::Char => compare_keys(key, target, key_len) != Ordering::Less,
            KeyOrder::Number => compare_key8(&key8_of(key), &target8) != Ordering::Less,
        };

        let mut block = index.header().root_block;
        while block > 0 && cursor.stack.len() < NDX_MAX_DEPTH {
            let Some(node) = index.read_node(&mut cursor.file, block)? else {
                break;
            };
            if node.is_leaf() {
                let idx = node
                    .keys
                    .iter()
                    .position(|k| at_or_after(k))
                    .unwrap_or(node.num_keys);
                cursor.stack.push((block, idx));
                break;
            }
            // Internal node: descend into the first child whose separator
            // key is ≥ the target, or into last_child.
            let mut next_block = node.last_child;
            let mut next_idx = node.num_keys;
            for (i, key) in node.keys.iter().enumerate() {
                if at_or_after(key) {
                    next_block = node.childs[i];
                    next_idx = i;
                    break;
                }
            }
            cursor.stack.push((block, next_idx));
            block = next_block;
        }
        Ok(cursor)
    }

    /// Next `(key, record number)` in key order, or `None` when exhausted.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, u32)>> {
        while let Some(&(block, idx)) = self.stack.last() {
            let Some(node) = self.index.read_node(&mut self.file, block)? else {
                break;
            };
            if node.is_leaf() && idx < node.num_keys {
                let out = (node.keys[idx].clone(), node.recnos[idx]);
                let top = self.stack.len() - 1;
                self.stack[top].1 = idx + 1;
                return Ok(Some(out));
            }
            // Leaf exhausted, or the cursor stopped on an internal node:
            // unwind to the nearest ancestor with a further child.
            self.stack.pop();
            self.advance_to_successor()?;
        }
        Ok(None)
    }

    fn advance_to_successor(&mut self) -> Result<()> {
        while let Some(&(block, child_pos)) = self.stack.last() {
            let Some(node) = self.index.read_node(&mut self.file, block)? else {
                break;
            };
            if child_pos < node.num_keys {
                let next_pos = child_pos + 1;
                let next_block = if next_pos < node.num_keys {
                    node.childs[next_pos]
                } else {
                    node.last_child
                };
                let top = self.stack.len() - 1;
                self.stack[top].1 = next_pos;
                return self.descend_leftmost(next_block);
            }
            self.stack.pop();
        }
        Ok(())
    }

    fn descend_leftmost(&mut self, start_block: u32) -> Result<()> {
        let mut block = start_block;
        while block > 0 && self.stack.len() < NDX_MAX_DEPTH {
            let Some(node) = self.index.read_node(&mut self.file, block)? else {
                break;
            };
            self.stack.push((block, 0));
            if node.is_leaf() {
                break;
            }
            block = node.childs.first().copied().unwrap_or(node.last_child);
        }
        Ok(())
    }
}

/// Prefix form of a key: NULs mapped to spaces, truncated, not padded.
fn normalize_prefix(text: &[u8], key_len: usize) -> Vec<u8> {
    text.iter()
        .take(key_len)
        .map(|&b| if b == 0 { b' ' } else { b })
        .collect()
}

impl NdxFile {
    /// Cursor over all entries, starting at the first key ≥ `key`.
    pub fn cursor_from(&self, key: &str) -> Result<NdxCursor<'_>> {
        let target = normalize_key(key.as_bytes(), self.header().key_len);
        NdxCursor::descend_first_ge(self, &target, KeyOrder::Char)
    }

    /// Record numbers of every entry whose key equals `key` after
    /// normalisation. Equal-key entries come back in leaf order.
    pub fn find_exact(&self, key: &str) -> Result<Vec<u32>> {
        let key_len = self.header().key_len;
        let target = normalize_key(key.as_bytes(), key_len);
        let mut cursor = NdxCursor::descend_first_ge(self, &target, KeyOrder::Char)?;
        let mut results = Vec::new();
        while let Some((key_out, recno)) = cursor.next()? {
            if compare_keys(&key_out, &target, key_len) != Ordering::Equal {
                break;
            }
            if recno != 0 {
                results.push(recno);
            }
        }
        Ok(results)
    }

    /// Record numbers of every entry whose normalised key begins with
    /// `prefix`. An empty prefix matches nothing.
    pub fn find_prefix(&self, prefix: &str) -> Result<Vec<u32>> {
        let key_len = self.header().key_len;
        let prefix_norm = normalize_prefix(prefix.as_bytes(), key_len);
        if prefix_norm.is_empty() {
            return Ok(Vec::new());
        }
        let target = normalize_key(&prefix_norm, key_len);
        let mut cursor = NdxCursor::descend_first_ge(self, &target, KeyOrder::Char)?;
        let mut results = Vec::new();
        while let Some((key_out, recno)) = cursor.next()? {
            if !normalize_prefix(&key_out, key_len).starts_with(&prefix_norm) {
                break;
            }
            if recno != 0 {
                results.push(recno);
            }
        }
        Ok(results)
    }

    /// Record numbers of every entry whose stored double equals `value`.
    pub fn find_number_exact(&self, value: f64) -> Result<Vec<u32>> {
        if self.header().key_len < 8 {
            return Ok(Vec::new()); // not a numeric index
        }
        let target = key8_from_f64(value);
        let mut cursor = NdxCursor::descend_first_ge(self, &target, KeyOrder::Number)?;
        let mut results = Vec::new();
        while let Some((key_out, recno)) = cursor.next()? {
            if compare_key8(&key8_of(&key_out), &target) != Ordering::Equal {
                break;
            }
            if recno != 0 {
                results.push(recno);
            }
        }
        Ok(results)
    }

    /// Record numbers of every entry with a stored double in
    /// `[min, max]`. A reversed range yields an empty result.
    pub fn find_number_range(&self, min: f64, max: f64) -> Result<Vec<u32>> {
        if self.header().key_len < 8 || min > max {
            return Ok(Vec::new());
        }
        let lo = key8_from_f64(min);
        let hi = key8_from_f64(max);
        let mut cursor = NdxCursor::descend_first_ge(self, &lo, KeyOrder::Number)?;
        let mut results = Vec::new();
        while let Some((key_out, recno)) = cursor.next()? {
            if compare_key8(&key8_of(&key_out), &hi) == Ordering::Greater {
                break;
            }
            if recno != 0 {
                results.push(recno);
            }
        }
        Ok(results)
    }

    /// Exact date lookup; accepts `YYYY-MM-DD` or `YYYYMMDD`. A malformed
    /// date yields an empty result.
    pub fn find_date_exact(&self, date: &str) -> Result<Vec<u32>> {
        match parse_to_jdn(date) {
            Some(jdn) => self.find_number_exact(jdn as f64),
            None => Ok(Vec::new()),
        }
    }

    /// Inclusive date range lookup over Julian Day Numbers.
    pub fn find_date_range(&self, start: &str, end: &str) -> Result<Vec<u32>> {
        match (parse_to_jdn(start), parse_to_jdn(end)) {
            (Some(a), Some(b)) => self.find_number_range(a as f64, b as f64),
            _ => Ok(Vec::new()),
        }
    }
}
