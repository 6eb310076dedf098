//! Bottom-up bulk construction of an index from a table column.
//!
//! Keys from every live row are gathered, sorted, packed into leaves from
//! block 1 upward, then parent levels are built until a single root
//! remains. The header is written last, so a crash mid-build leaves a file
//! that fails the header sanity check instead of a half tree.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::date::dbf_date_to_jdn;
use crate::error::{Error, Result};
use crate::table::{FieldType, TableFile};

use super::{key8_from_f64, normalize_key, NDX_BLOCK_SIZE, NDX_MAX_KEYS, NDX_MAX_KEY_LEN};

struct Entry {
    key: Vec<u8>,
    recno: u32,
}

struct LevelNode {
    block: u32,
    max_key: Vec<u8>,
}

/// Build an `.NDX` over `field_name` of `table`, writing it to `output`.
///
/// Character columns key on their normalised bytes at the declared field
/// width; numeric and date columns key on an 8-byte double (dates through
/// their Julian Day Number). Tombstoned rows are skipped. Any other column
/// type is rejected.
pub fn create_index(table: &mut TableFile, field_name: &str, output: &Path) -> Result<()> {
    let field = table
        .header()
        .field_index(field_name)
        .map(|i| table.header().fields[i].clone())
        .ok_or_else(|| Error::Schema(format!("no field named {field_name}")))?;

    let key_len = match field.ftype {
        FieldType::Character => field.length as usize,
        FieldType::Numeric | FieldType::Date => 8,
        other => {
            return Err(Error::Schema(format!(
                "cannot index field {} of type {other:?}",
                field.name
            )));
        }
    };
    if key_len == 0 || key_len > NDX_MAX_KEY_LEN {
        return Err(Error::Schema(format!(
            "key length {key_len} outside 1..={NDX_MAX_KEY_LEN}"
        )));
    }

    let group_len = (key_len + 8).next_multiple_of(4);
    let keys_max = (NDX_BLOCK_SIZE - 8) / group_len;
    if keys_max == 0 || keys_max > NDX_MAX_KEYS {
        return Err(Error::Schema(format!(
            "{keys_max} keys per node outside 1..={NDX_MAX_KEYS}"
        )));
    }

    let mut entries = Vec::new();
    for row_index in 0..table.row_count() {
        let Some(row) = table.read_row_at(row_index)? else {
            break;
        };
        if row.is_deleted() {
            continue;
        }
        let text = row.field_trimmed(&field);
        let key = match field.ftype {
            FieldType::Character => normalize_key(text.as_bytes(), key_len),
            FieldType::Date => {
                let jdn = dbf_date_to_jdn(&text);
                if jdn > 0 {
                    key8_from_f64(jdn as f64).to_vec()
                } else {
                    vec![0u8; key_len]
                }
            }
            _ => match numeric_key(&text) {
                Some(k) => k.to_vec(),
                None => vec![0u8; key_len],
            },
        };
        entries.push(Entry {
            key,
            recno: row_index + 1,
        });
    }

    // Numeric keys sort by value; the stable sort keeps equal-key records
    // in insertion order at leaf level.
    if key_len == 8 && field.ftype != FieldType::Character {
        entries.sort_by(|a, b| {
            let av = f64::from_le_bytes(super::key8_of(&a.key));
            let bv = f64::from_le_bytes(super::key8_of(&b.key));
            av.partial_cmp(&bv).unwrap_or(std::cmp::Ordering::Equal)
        });
    } else {
        entries.sort_by(|a, b| a.key.cmp(&b.key));
    }
    debug!(
        "indexing {} entries from {} ({} keys/node)",
        entries.len(),
        field.name,
        keys_max
    );

    let mut file = File::create(output)?;
    let expr = field.name.to_lowercase();

    if entries.is_empty() {
        write_header(&mut file, 0, 1, key_len, keys_max, group_len, &expr)?;
        file.flush()?;
        return Ok(());
    }

    // Leaves first, packed sequentially from block 1.
    let mut block = 1u32;
    let mut level: Vec<LevelNode> = Vec::new();
    for chunk in entries.chunks(keys_max) {
        let keys: Vec<&[u8]> = chunk.iter().map(|e| e.key.as_slice()).collect();
        let recnos: Vec<u32> = chunk.iter().map(|e| e.recno).collect();
        let childs = vec![0u32; chunk.len()];
        write_node(&mut file, block, &keys, &childs, &recnos, 0, group_len)?;
        level.push(LevelNode {
            block,
            max_key: chunk[chunk.len() - 1].key.clone(),
        });
        block += 1;
    }

    // Parent levels, bottom-up: each parent takes up to keys_max + 1
    // children, keyed by the maximum key of every child but the last.
    let mut levels = 1;
    while level.len() > 1 {
        let mut next: Vec<LevelNode> = Vec::new();
        for chunk in level.chunks(keys_max + 1) {
            let keys: Vec<&[u8]> = chunk[..chunk.len() - 1]
                .iter()
                .map(|n| n.max_key.as_slice())
                .collect();
            let childs: Vec<u32> = chunk[..chunk.len() - 1].iter().map(|n| n.block).collect();
            let recnos = vec![0u32; keys.len()];
            let last_child = chunk[chunk.len() - 1].block;
            write_node(&mut file, block, &keys, &childs, &recnos, last_child, group_len)?;
            next.push(LevelNode {
                block,
                max_key: chunk[chunk.len() - 1].max_key.clone(),
            });
            block += 1;
        }
        level = next;
        levels += 1;
    }

    debug!("index tree has {levels} levels, root block {}", level[0].block);
    write_header(&mut file, level[0].block, block, key_len, keys_max, group_len, &expr)?;
    file.flush()?;
    Ok(())
}

fn numeric_key(text: &str) -> Option<[u8; 8]> {
    if text.is_empty() {
        return Some(key8_from_f64(0.0));
    }
    text.parse::<f64>().ok().map(key8_from_f64)
}

fn write_node(
    file: &mut File,
    block: u32,
    keys: &[&[u8]],
    childs: &[u32],
    recnos: &[u32],
    last_child: u32,
    group_len: usize,
) -> Result<()> {
    let mut buf = [0u8; NDX_BLOCK_SIZE];
    buf[0..2].copy_from_slice(&(keys.len() as u16).to_le_bytes());
    let mut at = 4;
    for ((key, &child), &recno) in keys.iter().zip(childs).zip(recnos) {
        buf[at..at + 4].copy_from_slice(&child.to_le_bytes());
        buf[at + 4..at + 8].copy_from_slice(&recno.to_le_bytes());
        buf[at + 8..at + 8 + key.len()].copy_from_slice(key);
        at += group_len;
    }
    buf[at..at + 4].copy_from_slice(&last_child.to_le_bytes());

    file.seek(SeekFrom::Start(block as u64 * NDX_BLOCK_SIZE as u64))?;
    file.write_all(&buf)?;
    Ok(())
}

/// v2-dialect header: 32-bit root and eof blocks, the layout triple at
/// 12/14/18, expression from 24.
fn write_header(
    file: &mut File,
    root_block: u32,
    eof_block: u32,
    key_len: usize,
    keys_max: usize,
    group_len: usize,
    expr: &str,
) -> Result<()> {
    let mut buf = [0u8; NDX_BLOCK_SIZE];
    buf[0..4].copy_from_slice(&root_block.to_le_bytes());
    buf[4..8].copy_from_slice(&eof_block.to_le_bytes());
    buf[12..14].copy_from_slice(&(key_len as u16).to_le_bytes());
    buf[14..16].copy_from_slice(&(keys_max as u16).to_le_bytes());
    buf[18..20].copy_from_slice(&(group_len as u16).to_le_bytes());
    let expr_bytes = expr.as_bytes();
    let n = expr_bytes.len().min(NDX_MAX_KEY_LEN);
    buf[24..24 + n].copy_from_slice(&expr_bytes[..n]);

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    Ok(())
}
