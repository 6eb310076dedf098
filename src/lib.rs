//! dBase III/IV/V file family engine in Rust
//!
//! Byte-exact read/write support for the legacy on-disk file family:
//! `.DBF` tables, `.DBT` memo sidecars and `.NDX` B-tree indexes, plus an
//! in-memory query accelerator that composes index lookups with bit-packed
//! heap scans.

/// Dense bitset over record numbers
pub mod bitmap;
/// Julian Day Number conversion
pub mod date;
/// Error taxonomy
pub mod error;
/// Packed heap-map projections
pub mod heap;
/// Text interchange and compaction
pub mod interchange;
/// `.DBT` memo codec
pub mod memo;
/// `.NDX` B-tree index files
pub mod ndx;
/// Multi-group bitmap queries
pub mod query;
/// `.DBF` table codec
pub mod table;

pub use self::bitmap::Bitmap;
pub use self::error::{Error, Result};
pub use self::heap::{HeapFieldSpec, HeapMap, HeapSource, HeapType, MAX_HEAP_RECORDS};
pub use self::memo::{MemoDialect, MemoFile};
pub use self::ndx::{create_index, NdxCursor, NdxFile};
pub use self::query::{Filter, FilterGroup, MatchMode, Predicate, Query};
pub use self::table::{FieldDef, FieldType, Row, TableFile, Version};
