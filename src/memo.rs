//! `.DBT` memo codec: variable-length payloads on a 512-byte block grid.
//!
//! Block 0 is the header: next-free block as u32 LE at offset 0, block size
//! as u16 LE at offset 4. Payload blocks use one of two framings, keyed to
//! the companion table's version byte:
//!
//! - dBase III: payload bytes from the block boundary, `0x1A` terminator,
//!   zero padding. Length is recovered by scanning for the terminator.
//! - dBase IV/V: u32 LE type, u32 LE length, payload, `0x1A`, zero padding.
//!
//! The free-block pointer is updated after the payload lands, so a crash
//! mid-write can leak blocks but never aliases an existing memo.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::table::family_path;

/// Block grid unit shared by `.DBT` and `.NDX`.
pub const MEMO_BLOCK_SIZE: usize = 512;

/// Memo type tag for text payloads.
pub const MEMO_TYPE_TEXT: u32 = 1;
/// Memo type tag for binary payloads.
pub const MEMO_TYPE_BINARY: u32 = 2;

/// Upper bound on the terminator scan for dBase III memos.
const DBASE3_SCAN_CAP: usize = 1 << 20;

const EOF_MARKER: u8 = 0x1A;

/// Memo framing, resolved from the companion `.DBF` version byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoDialect {
    /// Bare payload, terminator-delimited.
    DBase3,
    /// 8-byte type+length header before the payload.
    DBase4,
}

/// Type and payload length of a stored memo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoInfo {
    pub memo_type: u32,
    pub length: usize,
}

/// Handle on a `.DBT` file. The file itself is opened per operation; the
/// handle only carries the resolved path and framing.
#[derive(Debug, Clone)]
pub struct MemoFile {
    path: PathBuf,
    dialect: MemoDialect,
}

impl MemoFile {
    /// Write a fresh memo file: a single header block with the next-free
    /// pointer at 1 and the block size recorded.
    pub fn create(base: &Path) -> Result<()> {
        let path = family_path(base, "DBT");
        let mut file = File::create(&path)?;
        let mut block = [0u8; MEMO_BLOCK_SIZE];
        block[0..4].copy_from_slice(&1u32.to_le_bytes());
        block[4..6].copy_from_slice(&(MEMO_BLOCK_SIZE as u16).to_le_bytes());
        file.write_all(&block)?;
        file.flush()?;
        Ok(())
    }

    /// Resolve the memo file next to `base`. The framing follows the
    /// companion `.DBF` version byte; with no companion present the IV+
    /// framing is assumed.
    pub fn open(base: &Path) -> MemoFile {
        let dbf = family_path(base, "DBF");
        let dialect = match read_version_byte(&dbf) {
            Some(0x03) => MemoDialect::DBase3,
            _ => MemoDialect::DBase4,
        };
        MemoFile {
            path: family_path(base, "DBT"),
            dialect,
        }
    }

    #[must_use]
    pub fn dialect(&self) -> MemoDialect {
        self.dialect
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn framing_overhead(&self) -> usize {
        match self.dialect {
            MemoDialect::DBase3 => 1, // terminator only
            MemoDialect::DBase4 => 9, // 8-byte header + terminator
        }
    }

    fn payload_origin(&self, block: u32) -> u64 {
        let base = block as u64 * MEMO_BLOCK_SIZE as u64;
        match self.dialect {
            MemoDialect::DBase3 => base,
            MemoDialect::DBase4 => base + 8,
        }
    }

    /// Append a memo at the next free block and advance the free pointer by
    /// `ceil(total / 512)`. Returns the block number. The file is created
    /// on first write if missing.
    pub fn append(&self, memo_type: u32, data: &[u8]) -> Result<u32> {
        let mut file = self.open_rw()?;
        let next_free = read_next_free(&mut file)?.max(1);
        self.write_body(&mut file, next_free, memo_type, data)?;
        let blocks = blocks_needed(data.len() + self.framing_overhead());
        write_next_free(&mut file, next_free + blocks)?;
        file.flush()?;
        Ok(next_free)
    }

    /// Write a memo at a caller-chosen block, extending the free pointer
    /// only when the new end passes it. Block 0 is the header and is
    /// refused.
    pub fn write_at(&self, block: u32, memo_type: u32, data: &[u8]) -> Result<u32> {
        if block == 0 {
            return Err(Error::InvalidArgument(
                "memo block 0 is the file header".into(),
            ));
        }
        let mut file = self.open_rw()?;
        self.write_body(&mut file, block, memo_type, data)?;
        let end = block + blocks_needed(data.len() + self.framing_overhead());
        if end > read_next_free(&mut file)? {
            write_next_free(&mut file, end)?;
        }
        file.flush()?;
        Ok(block)
    }

    fn write_body(&self, file: &mut File, block: u32, memo_type: u32, data: &[u8]) -> Result<()> {
        file.seek(SeekFrom::Start(block as u64 * MEMO_BLOCK_SIZE as u64))?;
        match self.dialect {
            MemoDialect::DBase3 => {
                file.write_all(data)?;
                file.write_all(&[EOF_MARKER])?;
            }
            MemoDialect::DBase4 => {
                file.write_all(&memo_type.to_le_bytes())?;
                file.write_all(&(data.len() as u32).to_le_bytes())?;
                file.write_all(data)?;
                file.write_all(&[EOF_MARKER])?;
            }
        }
        let total = data.len() + self.framing_overhead();
        let padding = blocks_needed(total) as usize * MEMO_BLOCK_SIZE - total;
        if padding > 0 {
            file.write_all(&vec![0u8; padding])?;
        }
        Ok(())
    }

    /// Type and length of the memo at `block`. Invalid blocks, blocks
    /// beyond the end of the file and truncated IV+ headers all report
    /// type 0 rather than failing.
    pub fn info(&self, block: u32) -> Result<MemoInfo> {
        const NONE: MemoInfo = MemoInfo {
            memo_type: 0,
            length: 0,
        };
        if block == 0 {
            return Ok(NONE);
        }
        let Some(mut file) = self.open_ro()? else {
            return Ok(NONE);
        };
        let start = block as u64 * MEMO_BLOCK_SIZE as u64;
        let file_size = file.seek(SeekFrom::End(0))?;
        if file_size <= start {
            return Ok(NONE);
        }
        file.seek(SeekFrom::Start(start))?;

        match self.dialect {
            MemoDialect::DBase3 => {
                // No header: the length is the distance to the terminator.
                // Truncated memos report the remaining bytes.
                let cap = ((file_size - start) as usize).min(DBASE3_SCAN_CAP);
                let mut data = vec![0u8; cap];
                file.read_exact(&mut data)?;
                let length = data
                    .iter()
                    .position(|&b| b == EOF_MARKER)
                    .unwrap_or(data.len());
                Ok(MemoInfo {
                    memo_type: MEMO_TYPE_TEXT,
                    length,
                })
            }
            MemoDialect::DBase4 => {
                let mut head = [0u8; 8];
                if read_up_to(&mut file, &mut head)? < 8 {
                    return Ok(NONE);
                }
                Ok(MemoInfo {
                    memo_type: u32::from_le_bytes([head[0], head[1], head[2], head[3]]),
                    length: u32::from_le_bytes([head[4], head[5], head[6], head[7]]) as usize,
                })
            }
        }
    }

    /// Read up to `max` payload bytes from `block`, clamped to the stored
    /// length. Returns `(memo_type, bytes)`; invalid blocks read as
    /// `(0, empty)`.
    pub fn read(&self, block: u32, max: usize) -> Result<(u32, Vec<u8>)> {
        let info = self.info(block)?;
        if info.memo_type == 0 {
            return Ok((0, Vec::new()));
        }
        let Some(mut file) = self.open_ro()? else {
            return Ok((0, Vec::new()));
        };
        file.seek(SeekFrom::Start(self.payload_origin(block)))?;
        let mut data = vec![0u8; max.min(info.length)];
        let got = read_up_to(&mut file, &mut data)?;
        data.truncate(got);
        Ok((info.memo_type, data))
    }

    /// Read a chunk at `offset` within the payload. `None` marks an invalid
    /// block or request; an offset at or past the payload end yields an
    /// empty chunk.
    pub fn read_chunk(&self, block: u32, offset: usize, size: usize) -> Result<Option<Vec<u8>>> {
        if block == 0 || size == 0 {
            return Ok(None);
        }
        let info = self.info(block)?;
        if info.memo_type == 0 {
            return Ok(None);
        }
        if offset >= info.length {
            return Ok(Some(Vec::new()));
        }
        let Some(mut file) = self.open_ro()? else {
            return Ok(None);
        };
        file.seek(SeekFrom::Start(self.payload_origin(block) + offset as u64))?;
        let mut data = vec![0u8; size.min(info.length - offset)];
        let got = read_up_to(&mut file, &mut data)?;
        data.truncate(got);
        Ok(Some(data))
    }

    /// Read a whole memo as text. Non-text bytes are replaced lossily.
    pub fn read_text(&self, block: u32) -> Result<(u32, String)> {
        let info = self.info(block)?;
        let (memo_type, data) = self.read(block, info.length)?;
        Ok((memo_type, String::from_utf8_lossy(&data).into_owned()))
    }

    fn open_rw(&self) -> Result<File> {
        if !self.path.exists() {
            Self::create(&self.path)?;
        }
        Ok(OpenOptions::new().read(true).write(true).open(&self.path)?)
    }

    fn open_ro(&self) -> Result<Option<File>> {
        match File::open(&self.path) {
            Ok(f) => Ok(Some(f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn blocks_needed(total_bytes: usize) -> u32 {
    total_bytes.div_ceil(MEMO_BLOCK_SIZE) as u32
}

fn read_next_free(file: &mut File) -> Result<u32> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_next_free(file: &mut File, value: u32) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn read_version_byte(dbf: &Path) -> Option<u8> {
    let mut buf = [0u8; 1];
    let mut file = File::open(dbf).ok()?;
    file.read_exact(&mut buf).ok()?;
    Some(buf[0])
}

#[test]
fn test_blocks_needed() {
    assert_eq!(1, blocks_needed(1));
    assert_eq!(1, blocks_needed(512));
    assert_eq!(2, blocks_needed(513));
    // 8-byte header + 1200 payload + terminator
    assert_eq!(3, blocks_needed(1209));
}
