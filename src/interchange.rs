//! Pipe-delimited text interchange and live-row compaction.
//!
//! `.TXT` carries the schema and the live rows: line 1 is the `|`-joined
//! field names, line 2 the `|`-joined field specs (`C(30)`, `N(10,2)`),
//! then one line per live row of trimmed values. `.MEM` carries one memo
//! per line as `row|field|type|block|HEX`, where `row` counts live rows
//! only. Compaction rewrites a table+memo pair with tombstoned rows
//! dropped and memo blocks re-packed sequentially.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};
use crate::memo::MemoFile;
use crate::table::{family_path, FieldDef, FieldDescriptor, FieldType, TableFile, Version};

/// Field spec text of one descriptor: `C(30)` or `N(10,2)`.
#[must_use]
pub fn build_field_spec(field: &FieldDescriptor) -> String {
    if field.decimals > 0 {
        format!(
            "{}({},{})",
            field.ftype.tag() as char,
            field.length,
            field.decimals
        )
    } else {
        format!("{}({})", field.ftype.tag() as char, field.length)
    }
}

/// Parse a field spec, falling back to `C(1)` for anything malformed.
#[must_use]
pub fn parse_field_spec(spec: &str) -> (FieldType, u8, u8) {
    const FALLBACK: (FieldType, u8, u8) = (FieldType::Character, 1, 0);
    let s = spec.trim();
    if s.len() < 3 {
        return FALLBACK;
    }
    let Ok(ftype) = FieldType::try_from(s.as_bytes()[0].to_ascii_uppercase()) else {
        return FALLBACK;
    };
    let (Some(open), Some(close)) = (s.find('('), s.find(')')) else {
        return FALLBACK;
    };
    if close <= open + 1 {
        return FALLBACK;
    }
    let content = &s[open + 1..close];
    let (length, decimals) = match content.split_once(',') {
        Some((len, dec)) => match (len.trim().parse(), dec.trim().parse()) {
            (Ok(l), Ok(d)) => (l, d),
            _ => return FALLBACK,
        },
        None => match content.trim().parse() {
            Ok(l) => (l, 0u8),
            Err(_) => return FALLBACK,
        },
    };
    if length == 0 {
        return FALLBACK;
    }
    (ftype, length, decimals)
}

/// Export schema and live rows to `BASE.TXT`. Tombstoned rows are skipped
/// and field values are trimmed.
pub fn export_text(base: &Path) -> Result<()> {
    let mut table = TableFile::open(base)?;
    let txt = family_path(base, "TXT");
    let mut out = BufWriter::new(File::create(&txt)?);

    let fields = table.header().fields.clone();
    let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    writeln!(out, "{}", names.join("|"))?;
    let specs: Vec<String> = fields.iter().map(build_field_spec).collect();
    writeln!(out, "{}", specs.join("|"))?;

    let mut exported = 0u32;
    for index in 0..table.row_count() {
        let Some(row) = table.read_row_at(index)? else {
            break;
        };
        if row.is_deleted() {
            continue;
        }
        let values: Vec<String> = fields.iter().map(|f| row.field_trimmed(f)).collect();
        writeln!(out, "{}", values.join("|"))?;
        exported += 1;
    }
    out.flush()?;
    debug!("exported {exported} row(s) to {}", txt.display());
    Ok(())
}

/// Import `BASE.TXT` into a fresh table. Field names are truncated to 11
/// bytes, the header is stamped with today's date, and a memo companion is
/// created iff an `M` field exists; the table is dBase III otherwise.
pub fn import_text(base: &Path) -> Result<()> {
    let txt = family_path(base, "TXT");
    let reader = BufReader::new(File::open(&txt).map_err(|e| Error::from_open(e, &txt))?);
    let mut lines = Vec::new();
    for line in reader.lines() {
        lines.push(line?);
    }
    if lines.len() < 2 {
        return Err(Error::InvalidArgument(
            "text file needs a name line and a spec line".into(),
        ));
    }

    let names: Vec<&str> = lines[0].split('|').map(str::trim).collect();
    let specs: Vec<&str> = lines[1].split('|').map(str::trim).collect();
    if names.len() != specs.len() {
        return Err(Error::InvalidArgument(format!(
            "{} field names but {} specs",
            names.len(),
            specs.len()
        )));
    }

    let schema: Vec<FieldDef> = names
        .iter()
        .zip(&specs)
        .map(|(name, spec)| {
            let mut name = name.to_string();
            while name.len() > 11 {
                name.pop();
            }
            let (ftype, length, decimals) = parse_field_spec(spec);
            FieldDef {
                name,
                ftype,
                length,
                decimals,
            }
        })
        .collect();

    let has_memo = schema.iter().any(|f| f.ftype == FieldType::Memo);
    let mut table = if has_memo {
        TableFile::create(base, &schema)?
    } else {
        TableFile::create_dbase3(base, &schema)?
    };

    for line in &lines[2..] {
        if line.trim().is_empty() {
            continue;
        }
        let values: Vec<&str> = line.split('|').map(str::trim).collect();
        table.append_row(&values)?;
    }
    debug!("imported {} row(s) into {}", table.row_count(), base.display());
    Ok(())
}

/// Export every memo of every live row to `BASE.MEM` as
/// `row|field|type|block|HEX`, with `row` counted over live rows.
pub fn export_memos(base: &Path) -> Result<()> {
    let mut table = TableFile::open(base)?;
    let memo = MemoFile::open(base);
    let mem = family_path(base, "MEM");
    let mut out = BufWriter::new(File::create(&mem)?);

    let memo_fields: Vec<(usize, FieldDescriptor)> = table
        .header()
        .fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.ftype == FieldType::Memo)
        .map(|(i, f)| (i, f.clone()))
        .collect();

    let mut live_index = 0u32;
    for index in 0..table.row_count() {
        let Some(row) = table.read_row_at(index)? else {
            break;
        };
        if row.is_deleted() {
            continue;
        }
        for (fi, field) in &memo_fields {
            let block = row.memo_block(field);
            if block == 0 {
                continue;
            }
            let info = memo.info(block)?;
            if info.memo_type == 0 {
                continue;
            }
            let (_, payload) = memo.read(block, info.length)?;
            writeln!(
                out,
                "{live_index}|{fi}|{}|{block}|{}",
                info.memo_type,
                hex::encode_upper(&payload)
            )?;
        }
        live_index += 1;
    }
    out.flush()?;
    Ok(())
}

/// Import `BASE.MEM`, writing each payload into the memo file and pointing
/// the owning row's field at the block it landed in. With `preserve_blocks`
/// the original block numbers are kept; otherwise blocks are newly
/// allocated. Malformed lines are skipped.
pub fn import_memos(base: &Path, preserve_blocks: bool) -> Result<()> {
    let mem = family_path(base, "MEM");
    let reader = BufReader::new(File::open(&mem).map_err(|e| Error::from_open(e, &mem))?);
    let mut table = TableFile::open(base)?;
    let memo = MemoFile::open(base);

    // The .MEM row index counts live rows; map it back to physical rows.
    let mut live_rows = Vec::new();
    for index in 0..table.row_count() {
        let Some(row) = table.read_row_at(index)? else {
            break;
        };
        if !row.is_deleted() {
            live_rows.push(index);
        }
    }

    for line in reader.lines() {
        let line = line?;
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() < 5 {
            continue;
        }
        let (Ok(live_idx), Ok(field_idx), Ok(memo_type), Ok(block)) = (
            parts[0].parse::<usize>(),
            parts[1].parse::<usize>(),
            parts[2].parse::<u32>(),
            parts[3].parse::<u32>(),
        ) else {
            continue;
        };
        let Ok(payload) = hex::decode(parts[4]) else {
            continue;
        };
        let Some(&row_index) = live_rows.get(live_idx) else {
            continue;
        };
        let Some(field) = table.header().fields.get(field_idx).cloned() else {
            continue;
        };

        let new_block = if preserve_blocks {
            memo.write_at(block, memo_type, &payload)?
        } else {
            memo.append(memo_type, &payload)?
        };

        if let Some(mut row) = table.read_row_at(row_index)? {
            row.set_field(&field, &new_block.to_string());
            table.write_row(row_index, &row)?;
        }
    }
    Ok(())
}

/// Rewrite `input` as `output`, dropping tombstoned rows and re-packing
/// memo payloads into sequential blocks. The result has record count equal
/// to the live count and no holes in the memo file.
pub fn compact(input: &Path, output: &Path) -> Result<()> {
    let mut source = TableFile::open(input)?;
    let schema: Vec<FieldDef> = source
        .header()
        .fields
        .iter()
        .map(|f| FieldDef {
            name: f.name.clone(),
            ftype: f.ftype,
            length: f.length,
            decimals: f.decimals,
        })
        .collect();

    let source_version = source.header().version;
    let language_driver = source.language_driver();
    let mut target = if source_version == Version::DBase3 {
        TableFile::create_dbase3(output, &schema)?
    } else {
        TableFile::create(output, &schema)?
    };
    if source_version != Version::DBase3 {
        target.set_language_driver(language_driver)?;
    }

    let source_memo = MemoFile::open(input);
    let target_memo = MemoFile::open(output);
    let fields = source.header().fields.clone();

    let mut copied = 0u32;
    for index in 0..source.row_count() {
        let Some(row) = source.read_row_at(index)? else {
            break;
        };
        if row.is_deleted() {
            continue;
        }
        let mut values = Vec::with_capacity(fields.len());
        for field in &fields {
            if field.ftype == FieldType::Memo {
                let block = row.memo_block(field);
                let mut rewritten = String::from("0");
                if block > 0 {
                    let info = source_memo.info(block)?;
                    if info.memo_type > 0 {
                        let (_, payload) = source_memo.read(block, info.length)?;
                        let new_block = target_memo.append(info.memo_type, &payload)?;
                        rewritten = new_block.to_string();
                    }
                }
                values.push(rewritten);
            } else {
                values.push(row.field_trimmed(field));
            }
        }
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        target.append_row(&refs)?;
        copied += 1;
    }
    debug!(
        "compacted {} of {} row(s) into {}",
        copied,
        source.row_count(),
        output.display()
    );
    Ok(())
}
