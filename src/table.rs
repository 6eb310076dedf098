//! `.DBF` table codec: header, field descriptors and fixed-length records.
//!
//! The table file starts with a 32-byte primary header, one 32-byte
//! descriptor per field, a `0x0D` terminator, then `record_count` records of
//! `record_size` bytes each and an optional trailing `0x1A`. Byte 0 of every
//! record is the delete flag (`' '` live, `'*'` tombstoned); the remaining
//! bytes are fixed-width ASCII field slices.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use crate::error::{Error, Result};
use crate::memo::MemoFile;

/// Hard cap on the number of field descriptors.
pub const MAX_FIELDS: usize = 64;
/// Hard cap on the record size (delete flag included).
pub const MAX_RECORD_SIZE: usize = 4096;

pub const LANG_US: u8 = 0x01;
pub const LANG_WESTERN_EUROPE: u8 = 0x02;
pub const LANG_JAPAN: u8 = 0x7B;

const FIELD_TERMINATOR: u8 = 0x0D;
const EOF_MARKER: u8 = 0x1A;

/// dBase version byte. 0x03 tables never carry table flags or a language
/// driver; 0x04 vs 0x05 tracks the presence of a memo field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    DBase3 = 0x03,
    DBase4 = 0x04,
    DBase4Memo = 0x05,
}

bitflags! {
    /// dBase IV table-flags byte (header byte 28). Always zero on 0x03.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TableFlags: u8 {
        const PRODUCTION_MDX = 0x01;
        const SQL_TABLE = 0x02;
        const HAS_MEMO = 0x04;
    }
}

/// Field type tag, stored as its ASCII code at descriptor byte 11.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum FieldType {
    Character = b'C',
    Numeric = b'N',
    Logical = b'L',
    Date = b'D',
    Memo = b'M',
}

impl FieldType {
    #[must_use]
    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// One field in a schema description, before offsets are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub ftype: FieldType,
    pub length: u8,
    pub decimals: u8,
}

impl FieldDef {
    pub fn new(name: &str, ftype: FieldType, length: u8, decimals: u8) -> Self {
        Self {
            name: name.to_string(),
            ftype,
            length,
            decimals,
        }
    }

    pub fn character(name: &str, length: u8) -> Self {
        Self::new(name, FieldType::Character, length, 0)
    }

    pub fn numeric(name: &str, length: u8, decimals: u8) -> Self {
        Self::new(name, FieldType::Numeric, length, decimals)
    }

    pub fn logical(name: &str) -> Self {
        Self::new(name, FieldType::Logical, 1, 0)
    }

    pub fn date(name: &str) -> Self {
        Self::new(name, FieldType::Date, 8, 0)
    }

    /// Memo fields hold a 10-digit ASCII block number into the `.DBT`.
    pub fn memo(name: &str) -> Self {
        Self::new(name, FieldType::Memo, 10, 0)
    }
}

/// A field descriptor with its computed 1-based record offset.
/// Offset 0 is reserved for the delete flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub ftype: FieldType,
    pub length: u8,
    pub decimals: u8,
    pub offset: usize,
}

/// Parsed `.DBF` primary header plus field list.
#[derive(Debug, Clone)]
pub struct TableHeader {
    pub version: Version,
    /// Last-modified date as (year since 1900, month, day).
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub record_count: u32,
    pub header_size: u16,
    pub record_size: u16,
    pub flags: TableFlags,
    pub language_driver: u8,
    pub fields: Vec<FieldDescriptor>,
}

impl TableHeader {
    /// Case-insensitive field lookup.
    #[must_use]
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn has_memo(&self) -> bool {
        self.fields.iter().any(|f| f.ftype == FieldType::Memo)
    }

    /// Assign field offsets in declaration order and recompute the record
    /// size. The stored record size is untrusted; some third-party writers
    /// leave it stale after schema edits.
    fn recompute_offsets(&mut self) {
        let mut offset = 1;
        for field in &mut self.fields {
            field.offset = offset;
            offset += field.length as usize;
        }
        self.record_size = offset as u16;
    }

    fn parse(file: &mut File) -> Result<TableHeader> {
        let mut buf = [0u8; 32];
        file.read_exact(&mut buf)
            .map_err(|_| Error::CorruptTable("header shorter than 32 bytes"))?;

        let version = Version::try_from(buf[0])
            .map_err(|_| Error::CorruptTable("unrecognised version byte"))?;
        let mut header = TableHeader {
            version,
            year: buf[1],
            month: buf[2],
            day: buf[3],
            record_count: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            header_size: u16::from_le_bytes([buf[8], buf[9]]),
            record_size: u16::from_le_bytes([buf[10], buf[11]]),
            flags: TableFlags::from_bits_retain(buf[28]),
            language_driver: buf[29],
            fields: Vec::new(),
        };

        while header.fields.len() < MAX_FIELDS {
            let mut peek = [0u8; 1];
            match file.read(&mut peek)? {
                0 => break,
                _ if peek[0] == FIELD_TERMINATOR => break,
                _ => {}
            }
            let mut desc = [0u8; 32];
            desc[0] = peek[0];
            file.read_exact(&mut desc[1..])
                .map_err(|_| Error::CorruptTable("truncated field descriptor"))?;

            let name_len = desc[..11].iter().position(|&b| b == 0).unwrap_or(11);
            let name = String::from_utf8_lossy(&desc[..name_len]).into_owned();
            let ftype = FieldType::try_from(desc[11])
                .map_err(|_| Error::CorruptTable("unknown field type tag"))?;
            if desc[16] == 0 {
                return Err(Error::CorruptTable("zero-length field"));
            }
            header.fields.push(FieldDescriptor {
                name,
                ftype,
                length: desc[16],
                decimals: desc[17],
                offset: 0,
            });
        }

        header.recompute_offsets();
        if header.record_size as usize > MAX_RECORD_SIZE {
            return Err(Error::CorruptTable("record size out of range"));
        }
        Ok(header)
    }

    fn emit(&self, file: &mut File) -> Result<()> {
        let mut buf = [0u8; 32];
        buf[0] = self.version as u8;
        buf[1] = self.year;
        buf[2] = self.month;
        buf[3] = self.day;
        buf[4..8].copy_from_slice(&self.record_count.to_le_bytes());
        buf[8..10].copy_from_slice(&self.header_size.to_le_bytes());
        buf[10..12].copy_from_slice(&self.record_size.to_le_bytes());
        buf[28] = self.flags.bits();
        buf[29] = self.language_driver;
        file.write_all(&buf)?;

        for field in &self.fields {
            let mut desc = [0u8; 32];
            let name = field.name.as_bytes();
            let n = name.len().min(11);
            desc[..n].copy_from_slice(&name[..n]);
            desc[11] = field.ftype.tag();
            desc[16] = field.length;
            desc[17] = field.decimals;
            file.write_all(&desc)?;
        }
        file.write_all(&[FIELD_TERMINATOR, EOF_MARKER])?;
        Ok(())
    }
}

/// One record, owned as its raw on-disk bytes. Field views borrow slices
/// through the table's descriptors, so no padding round-trip happens until
/// a caller asks for text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    data: Vec<u8>,
}

impl Row {
    /// A fresh live row of `record_size` space bytes.
    #[must_use]
    pub fn blank(record_size: usize) -> Self {
        Self {
            data: vec![b' '; record_size],
        }
    }

    #[must_use]
    pub fn delete_flag(&self) -> u8 {
        self.data.first().copied().unwrap_or(b' ')
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.delete_flag() == b'*'
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Raw padded bytes of one field.
    #[must_use]
    pub fn field_bytes(&self, field: &FieldDescriptor) -> &[u8] {
        let start = field.offset.min(self.data.len());
        let end = (field.offset + field.length as usize).min(self.data.len());
        &self.data[start..end]
    }

    /// Field contents as text, padding included.
    #[must_use]
    pub fn field_text(&self, field: &FieldDescriptor) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.field_bytes(field))
    }

    /// Field contents with surrounding whitespace removed.
    #[must_use]
    pub fn field_trimmed(&self, field: &FieldDescriptor) -> String {
        self.field_text(field).trim().to_string()
    }

    /// Overwrite one field, truncating or right-space-padding `value` to the
    /// declared length.
    pub fn set_field(&mut self, field: &FieldDescriptor, value: &str) {
        let start = field.offset.min(self.data.len());
        let end = (field.offset + field.length as usize).min(self.data.len());
        let slice = &mut self.data[start..end];
        let bytes = value.as_bytes();
        for (i, out) in slice.iter_mut().enumerate() {
            *out = bytes.get(i).copied().unwrap_or(b' ');
        }
    }

    /// Memo block number held by a memo field; `'0'` or blank means none.
    #[must_use]
    pub fn memo_block(&self, field: &FieldDescriptor) -> u32 {
        self.field_trimmed(field).parse().unwrap_or(0)
    }
}

/// An open `.DBF` table. The handle exclusively owns the file between open
/// and drop; the cached header is the source of truth for record count and
/// date until the next write.
#[derive(Debug)]
pub struct TableFile {
    file: File,
    path: PathBuf,
    header: TableHeader,
}

impl TableFile {
    /// Create a table from a schema description. The version byte is
    /// derived from the schema: any memo field makes it 0x05, otherwise
    /// 0x04, and a companion `.DBT` is created alongside memo-bearing
    /// tables. The header is stamped with today's date.
    pub fn create(base: &Path, schema: &[FieldDef]) -> Result<TableFile> {
        Self::create_with_version(base, schema, None)
    }

    /// Create a dBase III table: version byte 0x03, table flags and
    /// language driver both zero.
    pub fn create_dbase3(base: &Path, schema: &[FieldDef]) -> Result<TableFile> {
        Self::create_with_version(base, schema, Some(Version::DBase3))
    }

    fn create_with_version(
        base: &Path,
        schema: &[FieldDef],
        forced: Option<Version>,
    ) -> Result<TableFile> {
        if schema.len() > MAX_FIELDS {
            return Err(Error::Schema(format!(
                "schema has {} fields, maximum is {MAX_FIELDS}",
                schema.len()
            )));
        }

        let has_memo = schema.iter().any(|f| f.ftype == FieldType::Memo);
        let version = forced.unwrap_or(if has_memo {
            Version::DBase4Memo
        } else {
            Version::DBase4
        });
        let language_driver = if version == Version::DBase3 { 0 } else { LANG_US };

        use chrono::Datelike;
        let today = chrono::Local::now().date_naive();
        let mut header = TableHeader {
            version,
            year: (today.year() - 1900).clamp(0, 255) as u8,
            month: today.month() as u8,
            day: today.day() as u8,
            record_count: 0,
            header_size: (32 + 32 * schema.len() + 1) as u16,
            record_size: 0,
            flags: TableFlags::empty(),
            language_driver,
            fields: schema
                .iter()
                .map(|f| {
                    let mut name = f.name.clone();
                    while name.len() > 11 {
                        name.pop();
                    }
                    FieldDescriptor {
                        name,
                        ftype: f.ftype,
                        length: f.length,
                        decimals: f.decimals,
                        offset: 0,
                    }
                })
                .collect(),
        };
        for field in &header.fields {
            if field.length == 0 {
                return Err(Error::Schema(format!("field {} has zero length", field.name)));
            }
        }
        header.recompute_offsets();
        if header.record_size as usize > MAX_RECORD_SIZE {
            return Err(Error::Schema(format!(
                "record size {} exceeds {MAX_RECORD_SIZE}",
                header.record_size
            )));
        }

        let path = family_path(base, "DBF");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        header.emit(&mut file)?;
        file.flush()?;

        if has_memo {
            MemoFile::create(base)?;
        }

        Ok(TableFile { file, path, header })
    }

    /// Open an existing table read/write.
    pub fn open(base: &Path) -> Result<TableFile> {
        let path = family_path(base, "DBF");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::from_open(e, &path))?;
        let header = TableHeader::parse(&mut file)?;
        Ok(TableFile { file, path, header })
    }

    #[must_use]
    pub fn header(&self) -> &TableHeader {
        &self.header
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn row_count(&self) -> u32 {
        self.header.record_count
    }

    fn row_position(&self, index: u32) -> u64 {
        self.header.header_size as u64 + index as u64 * self.header.record_size as u64
    }

    /// Position the file at row `index` (0-based).
    pub fn seek_to_row(&mut self, index: u32) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.row_position(index)))?;
        Ok(())
    }

    /// Read one record at the current position. Returns `None` past the end
    /// of the file; callers compare against [`TableFile::row_count`].
    pub fn read_row(&mut self) -> Result<Option<Row>> {
        let mut data = vec![0u8; self.header.record_size as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = self.file.read(&mut data[filled..])?;
            if n == 0 {
                return Ok(None);
            }
            filled += n;
        }
        Ok(Some(Row { data }))
    }

    /// Seek to row `index` and read it.
    pub fn read_row_at(&mut self, index: u32) -> Result<Option<Row>> {
        self.seek_to_row(index)?;
        self.read_row()
    }

    fn build_row(&self, values: &[&str]) -> Row {
        let mut row = Row::blank(self.header.record_size as usize);
        for (field, value) in self.header.fields.iter().zip(
            values
                .iter()
                .copied()
                .chain(std::iter::repeat("")),
        ) {
            row.set_field(field, value);
        }
        row
    }

    /// Append a live row built from `values` (one per field, padded or
    /// truncated to the field length), then bump the persisted record count
    /// and rewrite the trailing `0x1A`.
    pub fn append_row(&mut self, values: &[&str]) -> Result<()> {
        let row = self.build_row(values);

        let mut end = self.file.seek(SeekFrom::End(0))?;
        if end > 0 {
            let mut last = [0u8; 1];
            self.file.seek(SeekFrom::Start(end - 1))?;
            self.file.read_exact(&mut last)?;
            if last[0] == EOF_MARKER {
                end -= 1;
            }
        }
        self.file.seek(SeekFrom::Start(end))?;
        self.file.write_all(row.as_bytes())?;
        let after = end + self.header.record_size as u64;

        self.header.record_count += 1;
        self.file.seek(SeekFrom::Start(4))?;
        self.file.write_all(&self.header.record_count.to_le_bytes())?;

        self.file.seek(SeekFrom::Start(after))?;
        self.file.write_all(&[EOF_MARKER])?;
        self.file.flush()?;
        Ok(())
    }

    /// Overwrite row `index` with a live row built from `values`. The record
    /// count is unchanged.
    pub fn write_row_values(&mut self, index: u32, values: &[&str]) -> Result<()> {
        let row = self.build_row(values);
        self.write_row(index, &row)
    }

    /// Overwrite row `index` with raw row bytes, delete flag included.
    pub fn write_row(&mut self, index: u32, row: &Row) -> Result<()> {
        if row.as_bytes().len() != self.header.record_size as usize {
            return Err(Error::InvalidArgument(format!(
                "row is {} bytes, record size is {}",
                row.as_bytes().len(),
                self.header.record_size
            )));
        }
        self.seek_to_row(index)?;
        self.file.write_all(row.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }

    /// Flip the delete flag of row `index`. The record count is unchanged;
    /// tombstoned rows keep their bytes until compaction.
    pub fn set_row_deleted(&mut self, index: u32, deleted: bool) -> Result<()> {
        self.seek_to_row(index)?;
        let flag = if deleted { b'*' } else { b' ' };
        self.file.write_all(&[flag])?;
        self.file.flush()?;
        Ok(())
    }

    /// Last-modified date as (year since 1900, month, day).
    #[must_use]
    pub fn last_modified(&self) -> (u8, u8, u8) {
        (self.header.year, self.header.month, self.header.day)
    }

    pub fn set_last_modified(&mut self, year: u8, month: u8, day: u8) -> Result<()> {
        self.header.year = year;
        self.header.month = month;
        self.header.day = day;
        self.file.seek(SeekFrom::Start(1))?;
        self.file.write_all(&[year, month, day])?;
        self.file.flush()?;
        Ok(())
    }

    #[must_use]
    pub fn language_driver(&self) -> u8 {
        self.header.language_driver
    }

    /// Set the language driver byte. dBase III tables never carry one, so a
    /// non-zero id on a 0x03 table is refused.
    pub fn set_language_driver(&mut self, id: u8) -> Result<()> {
        if self.header.version == Version::DBase3 && id != 0 {
            return Err(Error::InvalidArgument(
                "dBase III tables carry no language driver".into(),
            ));
        }
        self.header.language_driver = id;
        self.file.seek(SeekFrom::Start(29))?;
        self.file.write_all(&[id])?;
        self.file.flush()?;
        Ok(())
    }

    /// Reset every memo field of every row to `'0'` (no memo), preserving
    /// delete flags.
    pub fn clear_memo_fields(&mut self) -> Result<()> {
        let memo_fields: Vec<FieldDescriptor> = self
            .header
            .fields
            .iter()
            .filter(|f| f.ftype == FieldType::Memo)
            .cloned()
            .collect();
        if memo_fields.is_empty() {
            return Ok(());
        }
        for index in 0..self.row_count() {
            let Some(mut row) = self.read_row_at(index)? else {
                break;
            };
            for field in &memo_fields {
                row.set_field(field, "0");
            }
            self.write_row(index, &row)?;
        }
        Ok(())
    }
}

const FAMILY_EXTS: [&str; 5] = ["DBF", "DBT", "TXT", "MEM", "NDX"];

/// Resolve a file of the table family next to `base`: an existing family
/// extension is replaced, anything else is kept as the stem.
pub(crate) fn family_path(base: &Path, ext: &str) -> PathBuf {
    let stem = match base.extension().and_then(|e| e.to_str()) {
        Some(e) if FAMILY_EXTS.iter().any(|x| x.eq_ignore_ascii_case(e)) => {
            base.with_extension("")
        }
        _ => base.to_path_buf(),
    };
    let mut os = stem.into_os_string();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}
