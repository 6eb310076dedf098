//! `.NDX` B-tree index files.
//!
//! An index file is a 512-byte block grid. Block 0 is the header; every
//! other block is a node holding up to `keys_max` groups of
//! `[u32 child][u32 recno][key bytes][pad]` plus a trailing last-child
//! pointer. A node is a leaf iff every child pointer is zero; only leaves
//! carry record numbers.

mod build;
mod search;

pub use self::build::create_index;
pub use self::search::NdxCursor;

use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Block size shared with the memo file grid.
pub const NDX_BLOCK_SIZE: usize = 512;
/// Longest supported key, matching the header expression cap.
pub const NDX_MAX_KEY_LEN: usize = 80;
/// Upper bound on keys per node accepted at build time.
pub const NDX_MAX_KEYS: usize = 64;
/// B-tree descent bound. Real-world NDX trees are a handful of levels deep;
/// anything past this is a corrupt or cyclic file.
pub(crate) const NDX_MAX_DEPTH: usize = 20;

/// Parsed index header: root and eof block numbers, the layout triple and
/// the index expression.
#[derive(Debug, Clone)]
pub struct NdxHeader {
    pub root_block: u32,
    pub eof_block: u32,
    pub key_len: usize,
    pub keys_max: usize,
    pub group_len: usize,
    pub expr: String,
}

/// Sanity predicate shared by both header dialects.
fn valid_layout(key_len: usize, keys_max: usize, group_len: usize) -> bool {
    key_len > 0
        && key_len <= 255
        && keys_max > 0
        && keys_max <= 255
        && group_len >= key_len + 8
        && 4 + keys_max * group_len + 4 <= NDX_BLOCK_SIZE
}

impl NdxHeader {
    /// Autodetect the header dialect and parse it.
    ///
    /// v1 (dBase III) stores 16-bit root/eof blocks at 0 and 4 with the
    /// layout triple at 6/8/10 and the expression from 16; v2 (dBase IV+)
    /// stores 32-bit blocks at the same offsets with the triple at 12/14/18
    /// and the expression from 24. When both layouts pass the sanity check,
    /// v1 wins, matching the historical reader.
    pub(crate) fn parse(buf: &[u8; NDX_BLOCK_SIZE]) -> Result<NdxHeader> {
        let word = |at: usize| u16::from_le_bytes([buf[at], buf[at + 1]]) as usize;
        let long = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

        let v1 = (word(6), word(8), word(10));
        let v2 = (word(12), word(14), word(18));

        let (root_block, eof_block, (key_len, keys_max, group_len), expr_off) =
            if valid_layout(v1.0, v1.1, v1.2) {
                (word(0) as u32, word(4) as u32, v1, 16)
            } else if valid_layout(v2.0, v2.1, v2.2) {
                (long(0), long(4), v2, 24)
            } else {
                return Err(Error::CorruptIndex("no valid header layout"));
            };

        let expr_bytes: Vec<u8> = buf[expr_off..]
            .iter()
            .copied()
            .take(NDX_MAX_KEY_LEN)
            .take_while(|&b| b != 0)
            .collect();

        Ok(NdxHeader {
            root_block,
            eof_block,
            key_len,
            keys_max,
            group_len,
            expr: String::from_utf8_lossy(&expr_bytes).into_owned(),
        })
    }
}

/// One parsed B-tree node.
#[derive(Debug, Clone)]
pub struct NdxNode {
    pub num_keys: usize,
    pub keys: Vec<Vec<u8>>,
    pub childs: Vec<u32>,
    pub recnos: Vec<u32>,
    pub last_child: u32,
}

impl NdxNode {
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.last_child == 0 && self.childs.iter().all(|&c| c == 0)
    }

    /// Parse a node. A key count beyond `keys_max` is clamped, not fatal.
    pub(crate) fn parse(buf: &[u8; NDX_BLOCK_SIZE], header: &NdxHeader) -> NdxNode {
        let num_keys = (u16::from_le_bytes([buf[0], buf[1]]) as usize).min(header.keys_max);
        let mut node = NdxNode {
            num_keys,
            keys: Vec::with_capacity(num_keys),
            childs: Vec::with_capacity(num_keys),
            recnos: Vec::with_capacity(num_keys),
            last_child: 0,
        };
        for i in 0..num_keys {
            let at = 4 + i * header.group_len;
            node.childs
                .push(u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]));
            node.recnos.push(u32::from_le_bytes([
                buf[at + 4],
                buf[at + 5],
                buf[at + 6],
                buf[at + 7],
            ]));
            node.keys.push(buf[at + 8..at + 8 + header.key_len].to_vec());
        }
        let at = 4 + num_keys * header.group_len;
        node.last_child = u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        node
    }
}

/// An index opened for lookup. The header is parsed once; node reads open
/// the file per search call.
#[derive(Debug, Clone)]
pub struct NdxFile {
    path: PathBuf,
    header: NdxHeader,
}

impl NdxFile {
    pub fn open(path: &Path) -> Result<NdxFile> {
        let mut file = File::open(path).map_err(|e| Error::from_open(e, path))?;
        let mut buf = [0u8; NDX_BLOCK_SIZE];
        file.read_exact(&mut buf)
            .map_err(|_| Error::CorruptIndex("header block truncated"))?;
        Ok(NdxFile {
            path: path.to_path_buf(),
            header: NdxHeader::parse(&buf)?,
        })
    }

    #[must_use]
    pub fn header(&self) -> &NdxHeader {
        &self.header
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn open_file(&self) -> Result<File> {
        File::open(&self.path).map_err(|e| Error::from_open(e, &self.path))
    }

    /// Read and parse node `block`. `None` past the end of the file.
    pub(crate) fn read_node(&self, file: &mut File, block: u32) -> Result<Option<NdxNode>> {
        file.seek(SeekFrom::Start(block as u64 * NDX_BLOCK_SIZE as u64))?;
        let mut buf = [0u8; NDX_BLOCK_SIZE];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                return Ok(None);
            }
            filled += n;
        }
        Ok(Some(NdxNode::parse(&buf, &self.header)))
    }

    /// Peek at the first `count` entries in key order, as
    /// `(record number, cleaned key)` pairs. Diagnostic helper.
    pub fn first_entries(&self, count: usize) -> Result<Vec<(u32, String)>> {
        if self.header.root_block == 0 {
            return Ok(Vec::new());
        }
        let mut file = self.open_file()?;
        let mut block = self.header.root_block;
        let mut depth = 0;
        let mut node = match self.read_node(&mut file, block)? {
            Some(n) => n,
            None => return Ok(Vec::new()),
        };
        while block > 0 && !node.is_leaf() && depth < NDX_MAX_DEPTH {
            block = node.childs.first().copied().unwrap_or(node.last_child);
            node = match self.read_node(&mut file, block)? {
                Some(n) => n,
                None => return Ok(Vec::new()),
            };
            depth += 1;
        }
        Ok(node
            .recnos
            .iter()
            .zip(&node.keys)
            .take(count)
            .map(|(&recno, key)| (recno, clean_key(key)))
            .collect())
    }
}

/// Normalise a character key: truncate to `key_len`, map NULs to spaces,
/// right-pad with spaces.
#[must_use]
pub fn normalize_key(key: &[u8], key_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(key_len);
    for &b in key.iter().take(key_len) {
        out.push(if b == 0 { b' ' } else { b });
    }
    out.resize(key_len, b' ');
    out
}

/// Key bytes as display text: NULs to spaces, trailing whitespace dropped.
#[must_use]
pub fn clean_key(key: &[u8]) -> String {
    let mapped: Vec<u8> = key.iter().map(|&b| if b == 0 { b' ' } else { b }).collect();
    String::from_utf8_lossy(&mapped).trim_end().to_string()
}

/// Byte-wise comparison of two normalised character keys.
#[must_use]
pub fn compare_keys(a: &[u8], b: &[u8], key_len: usize) -> Ordering {
    normalize_key(a, key_len).cmp(&normalize_key(b, key_len))
}

/// Compare two stored 8-byte doubles from the high byte down.
///
/// Valid for non-negative IEEE-754 little-endian doubles, which covers
/// record numbers and Julian Day Numbers; negative keys are out of the
/// supported domain.
#[must_use]
pub fn compare_key8(a: &[u8; 8], b: &[u8; 8]) -> Ordering {
    for i in (0..8).rev() {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

/// Encode a numeric key as the stored little-endian double.
#[must_use]
pub fn key8_from_f64(value: f64) -> [u8; 8] {
    value.to_le_bytes()
}

/// First 8 bytes of stored key material, zero-padded.
#[must_use]
pub fn key8_of(key: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (o, &b) in out.iter_mut().zip(key.iter()) {
        *o = b;
    }
    out
}
