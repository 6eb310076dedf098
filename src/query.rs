//! Multi-group bitmap filtering over one table.
//!
//! A query is up to four filter groups ANDed together; each group is up to
//! eight filters combined by its match mode (ANY = OR, ALL = AND). String
//! predicates run through an associated `.NDX` index, everything else
//! through a packed heap map covering exactly the referenced columns. Each
//! group narrows the candidate set for the next, with an early exit once
//! nothing remains.
//!
//! Tables larger than the heap-map capacity are processed in record-range
//! segments; every segment builds a fresh heap map, runs the whole group
//! pipeline, and the per-segment results are unioned. Peak memory stays
//! bounded by one segment's footprint.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::debug;

use crate::bitmap::Bitmap;
use crate::date::gregorian_to_jdn;
use crate::error::{Error, Result};
use crate::heap::{
    compute_layout, HeapFieldSpec, HeapMap, HeapSource, HEAP_RECORD_SIZES, MAX_HEAP_RECORDS,
};
use crate::ndx::NdxFile;
use crate::table::{FieldType, TableFile};

/// Most filters one group may hold.
pub const MAX_FILTERS_PER_GROUP: usize = 8;
/// Most groups one query may hold.
pub const MAX_GROUPS: usize = 4;

/// A single predicate over one bound field.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Equal(i64),
    NotEqual(i64),
    LessThan(i64),
    LessEqual(i64),
    GreaterThan(i64),
    GreaterEqual(i64),
    /// Inclusive on both ends.
    Between(i64, i64),
    In(Vec<i64>),
    /// Prefix match through an NDX index.
    Like(String),
    /// Exact string match through an NDX index.
    Exact(String),
    /// Bit `n` (0-based) is set.
    BitSet(u8),
    /// Bit `n` is clear.
    BitClear(u8),
    /// Every bit of the mask is set.
    BitMaskAll(u8),
    /// At least one bit of the mask is set.
    BitMaskAny(u8),
}

impl Predicate {
    #[must_use]
    pub fn uses_index(&self) -> bool {
        matches!(self, Predicate::Like(_) | Predicate::Exact(_))
    }

    fn matches(&self, value: i64) -> bool {
        match self {
            Predicate::Equal(v) => value == *v,
            Predicate::NotEqual(v) => value != *v,
            Predicate::LessThan(v) => value < *v,
            Predicate::LessEqual(v) => value <= *v,
            Predicate::GreaterThan(v) => value > *v,
            Predicate::GreaterEqual(v) => value >= *v,
            Predicate::Between(lo, hi) => *lo <= value && value <= *hi,
            Predicate::In(set) => set.contains(&value),
            Predicate::BitSet(bit) => value & (1i64 << bit) != 0,
            Predicate::BitClear(bit) => value & (1i64 << bit) == 0,
            Predicate::BitMaskAll(mask) => value & *mask as i64 == *mask as i64,
            Predicate::BitMaskAny(mask) => value & *mask as i64 != 0,
            Predicate::Like(_) | Predicate::Exact(_) => false,
        }
    }
}

/// A predicate bound to a field, plus the index file for string predicates.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub predicate: Predicate,
    pub index: Option<PathBuf>,
}

impl Filter {
    fn heap(field: &str, predicate: Predicate) -> Self {
        Self {
            field: field.to_string(),
            predicate,
            index: None,
        }
    }

    pub fn equal(field: &str, value: i64) -> Self {
        Self::heap(field, Predicate::Equal(value))
    }

    pub fn not_equal(field: &str, value: i64) -> Self {
        Self::heap(field, Predicate::NotEqual(value))
    }

    pub fn less_than(field: &str, value: i64) -> Self {
        Self::heap(field, Predicate::LessThan(value))
    }

    pub fn less_equal(field: &str, value: i64) -> Self {
        Self::heap(field, Predicate::LessEqual(value))
    }

    pub fn greater_than(field: &str, value: i64) -> Self {
        Self::heap(field, Predicate::GreaterThan(value))
    }

    pub fn greater_equal(field: &str, value: i64) -> Self {
        Self::heap(field, Predicate::GreaterEqual(value))
    }

    pub fn between(field: &str, min: i64, max: i64) -> Self {
        Self::heap(field, Predicate::Between(min, max))
    }

    pub fn in_list(field: &str, values: Vec<i64>) -> Self {
        Self::heap(field, Predicate::In(values))
    }

    /// Prefix match resolved through `index`.
    pub fn like(field: &str, prefix: &str, index: &Path) -> Self {
        Self {
            field: field.to_string(),
            predicate: Predicate::Like(prefix.to_string()),
            index: Some(index.to_path_buf()),
        }
    }

    /// Exact string match resolved through `index`.
    pub fn exact(field: &str, value: &str, index: &Path) -> Self {
        Self {
            field: field.to_string(),
            predicate: Predicate::Exact(value.to_string()),
            index: Some(index.to_path_buf()),
        }
    }

    /// Date columns are heap-packed as Julian Day Numbers, so date filters
    /// compare JDN integers.
    pub fn date_equal(field: &str, year: i32, month: u32, day: u32) -> Self {
        Self::heap(field, Predicate::Equal(gregorian_to_jdn(year, month, day)))
    }

    pub fn date_between(
        field: &str,
        start: (i32, u32, u32),
        end: (i32, u32, u32),
    ) -> Self {
        Self::heap(
            field,
            Predicate::Between(
                gregorian_to_jdn(start.0, start.1, start.2),
                gregorian_to_jdn(end.0, end.1, end.2),
            ),
        )
    }

    pub fn date_after(field: &str, year: i32, month: u32, day: u32) -> Self {
        Self::heap(
            field,
            Predicate::GreaterThan(gregorian_to_jdn(year, month, day)),
        )
    }

    pub fn date_before(field: &str, year: i32, month: u32, day: u32) -> Self {
        Self::heap(field, Predicate::LessThan(gregorian_to_jdn(year, month, day)))
    }

    /// Every date within one calendar year.
    pub fn date_year(field: &str, year: i32) -> Self {
        Self::date_between(field, (year, 1, 1), (year, 12, 31))
    }

    pub fn logical_true(field: &str) -> Self {
        Self::heap(field, Predicate::Equal(1))
    }

    pub fn logical_false(field: &str) -> Self {
        Self::heap(field, Predicate::Equal(0))
    }

    pub fn bit_set(field: &str, bit: u8) -> Self {
        Self::heap(field, Predicate::BitSet(bit))
    }

    pub fn bit_clear(field: &str, bit: u8) -> Self {
        Self::heap(field, Predicate::BitClear(bit))
    }

    pub fn bit_mask_all(field: &str, mask: u8) -> Self {
        Self::heap(field, Predicate::BitMaskAll(mask))
    }

    pub fn bit_mask_any(field: &str, mask: u8) -> Self {
        Self::heap(field, Predicate::BitMaskAny(mask))
    }
}

/// How filters combine within one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// OR: any filter may match.
    Any,
    /// AND: every filter must match.
    All,
}

/// Up to [`MAX_FILTERS_PER_GROUP`] filters under one match mode.
#[derive(Debug, Clone)]
pub struct FilterGroup {
    mode: MatchMode,
    filters: Vec<Filter>,
}

impl FilterGroup {
    #[must_use]
    pub fn new(mode: MatchMode) -> Self {
        Self {
            mode,
            filters: Vec::new(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    #[must_use]
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn push(&mut self, filter: Filter) -> Result<&mut Self> {
        if self.filters.len() >= MAX_FILTERS_PER_GROUP {
            return Err(Error::InvalidArgument(format!(
                "a group holds at most {MAX_FILTERS_PER_GROUP} filters"
            )));
        }
        self.filters.push(filter);
        Ok(self)
    }

    /// Builder form of [`FilterGroup::push`].
    pub fn with(mut self, filter: Filter) -> Result<Self> {
        self.push(filter)?;
        Ok(self)
    }
}

/// A query over one table: groups ANDed in order.
#[derive(Debug)]
pub struct Query {
    base: PathBuf,
    groups: Vec<FilterGroup>,
    segment_capacity: usize,
}

impl Query {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            groups: Vec::new(),
            segment_capacity: MAX_HEAP_RECORDS,
        }
    }

    /// Override the per-segment record capacity (tests drive this down to
    /// force segmentation on small tables).
    #[must_use]
    pub fn segment_capacity(mut self, capacity: usize) -> Self {
        self.segment_capacity = capacity.max(1);
        self
    }

    pub fn add_group(&mut self, group: FilterGroup) -> Result<&mut Self> {
        if self.groups.len() >= MAX_GROUPS {
            return Err(Error::InvalidArgument(format!(
                "a query holds at most {MAX_GROUPS} groups"
            )));
        }
        self.groups.push(group);
        Ok(self)
    }

    /// Run the query; the result is the ascending list of matching record
    /// numbers (1-based).
    pub fn execute(&self) -> Result<Vec<u32>> {
        if self.groups.is_empty() {
            return Ok(Vec::new());
        }
        let mut table = TableFile::open(&self.base)?;
        let rec_count = table.row_count() as usize;
        debug!(
            "query: {} group(s) over {} records",
            self.groups.len(),
            rec_count
        );

        let plan = HeapPlan::new(&table, &self.groups)?;
        let index_results = self.run_index_lookups()?;

        let mut matches = Bitmap::new(rec_count);
        let mut start = 0usize;
        while start < rec_count {
            let end = (start + self.segment_capacity).min(rec_count);
            let heap = plan.build_segment(&mut table, start, end)?;
            let segment = self.eval_segment(&plan, heap.as_ref(), &index_results, start, end, rec_count);
            matches.union_with(&segment);
            debug!(
                "segment {start}..{end}: {} match(es), {} total",
                segment.popcount(),
                matches.popcount()
            );
            start = end;
        }
        Ok(matches.iter().map(|i| i as u32 + 1).collect())
    }

    /// NDX lookups are segment-independent; run each string filter once.
    fn run_index_lookups(&self) -> Result<Vec<Vec<Option<Vec<u32>>>>> {
        let mut all = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            let mut per_filter = Vec::with_capacity(group.filters.len());
            for filter in &group.filters {
                if !filter.predicate.uses_index() {
                    per_filter.push(None);
                    continue;
                }
                let Some(path) = &filter.index else {
                    return Err(Error::MissingIndex(PathBuf::from(&filter.field)));
                };
                let ndx = match NdxFile::open(path) {
                    Ok(ndx) => ndx,
                    Err(Error::NotFound(p)) => return Err(Error::MissingIndex(p)),
                    Err(e) => return Err(e),
                };
                let recnos = match &filter.predicate {
                    Predicate::Like(prefix) => ndx.find_prefix(prefix)?,
                    Predicate::Exact(value) => ndx.find_exact(value)?,
                    _ => Vec::new(),
                };
                debug!(
                    "index {} over {}: {} candidate(s)",
                    path.display(),
                    filter.field,
                    recnos.len()
                );
                per_filter.push(Some(recnos));
            }
            all.push(per_filter);
        }
        Ok(all)
    }

    fn eval_segment(
        &self,
        plan: &HeapPlan,
        heap: Option<&HeapMap>,
        index_results: &[Vec<Option<Vec<u32>>>],
        start: usize,
        end: usize,
        rec_count: usize,
    ) -> Bitmap {
        // A group without filters is a no-op, as if it were never added.
        let active: Vec<(usize, &FilterGroup)> = self
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| !g.filters.is_empty())
            .collect();

        let mut matches = Bitmap::new(rec_count);
        match active.first() {
            None => {
                matches.set_range(start..end);
                return matches;
            }
            Some((_, first)) if first.mode == MatchMode::All => {
                matches.set_range(start..end);
            }
            Some(_) => {}
        }

        for (pos, &(gi, group)) in active.iter().enumerate() {
            // The first group runs against the whole segment; later groups
            // treat the survivors as their candidate set.
            let mut candidates = Bitmap::new(rec_count);
            if pos == 0 {
                candidates.set_range(start..end);
            } else {
                candidates = matches.clone();
                if group.mode == MatchMode::Any {
                    matches.clear_all();
                }
            }

            // Index-backed filters: intersect the precomputed record
            // numbers with the candidate set.
            let mut temp = Bitmap::new(rec_count);
            for slot in &index_results[gi] {
                let Some(recnos) = slot else {
                    continue;
                };
                temp.clear_all();
                for &recno in recnos {
                    let bit = recno as usize - 1;
                    if bit >= start && bit < end && candidates.test(bit) {
                        temp.set(bit);
                    }
                }
                match group.mode {
                    MatchMode::Any => matches.union_with(&temp),
                    MatchMode::All => matches.intersect_with(&temp),
                }
            }

            // Heap-backed filters scan the candidate set only.
            let heap_filters: Vec<&Filter> = group
                .filters
                .iter()
                .filter(|f| !f.predicate.uses_index())
                .collect();
            match group.mode {
                MatchMode::Any => {
                    for filter in &heap_filters {
                        temp.clear_all();
                        for bit in candidates.iter() {
                            if self.heap_match(plan, heap, filter, bit, start) {
                                temp.set(bit);
                            }
                        }
                        matches.union_with(&temp);
                    }
                }
                MatchMode::All => {
                    if !heap_filters.is_empty() {
                        let current: Vec<usize> = matches.iter().collect();
                        for bit in current {
                            let pass = heap_filters
                                .iter()
                                .all(|f| self.heap_match(plan, heap, f, bit, start));
                            if !pass {
                                matches.clear(bit);
                            }
                        }
                    }
                }
            }

            if pos > 0 && group.mode == MatchMode::Any {
                matches.intersect_with(&candidates);
            }
            if matches.is_empty() {
                break;
            }
        }
        matches
    }

    /// Resolve one heap-backed filter for the record at `bit`. A field the
    /// schema does not carry (or cannot be heap-packed) never matches.
    fn heap_match(
        &self,
        plan: &HeapPlan,
        heap: Option<&HeapMap>,
        filter: &Filter,
        bit: usize,
        start: usize,
    ) -> bool {
        let (Some(heap), Some(pos)) = (heap, plan.position(&filter.field)) else {
            return false;
        };
        filter.predicate.matches(heap.value(bit - start, pos))
    }
}

/// The heap columns a query needs, laid out once and rebuilt per segment.
struct HeapPlan {
    specs: Vec<HeapFieldSpec>,
    record_size: usize,
    positions: HashMap<String, usize>,
}

impl HeapPlan {
    fn new(table: &TableFile, groups: &[FilterGroup]) -> Result<HeapPlan> {
        let header = table.header();
        let mut specs = Vec::new();
        let mut positions = HashMap::new();
        let mut flag_count = 0u32;

        for group in groups {
            for filter in &group.filters {
                if filter.predicate.uses_index() {
                    continue;
                }
                let key = filter.field.to_uppercase();
                if positions.contains_key(&key) {
                    continue;
                }
                let Some(fi) = header.field_index(&filter.field) else {
                    continue; // unknown field: the filter never matches
                };
                let spec = match header.fields[fi].ftype {
                    FieldType::Numeric => HeapFieldSpec::longint(HeapSource::Column(fi)),
                    FieldType::Date => HeapFieldSpec::jdn(HeapSource::Column(fi)),
                    FieldType::Logical => {
                        let mask = 1u8 << (flag_count % 8);
                        flag_count += 1;
                        HeapFieldSpec::bitflag(HeapSource::Column(fi), mask)
                    }
                    // character and memo columns have no packed form
                    FieldType::Character | FieldType::Memo => continue,
                };
                positions.insert(key, specs.len());
                specs.push(spec);
            }
        }

        if specs.is_empty() {
            return Ok(HeapPlan {
                specs,
                record_size: HEAP_RECORD_SIZES[0],
                positions,
            });
        }

        // Smallest record size the layout fits; rejection is total.
        for record_size in HEAP_RECORD_SIZES {
            let mut probe = specs.clone();
            if compute_layout(&mut probe, record_size).is_ok() {
                debug!(
                    "heap plan: {} column(s) in {record_size}-byte records",
                    specs.len()
                );
                return Ok(HeapPlan {
                    specs,
                    record_size,
                    positions,
                });
            }
        }
        Err(Error::HeapOverflow(
            HEAP_RECORD_SIZES[HEAP_RECORD_SIZES.len() - 1],
        ))
    }

    fn position(&self, field: &str) -> Option<usize> {
        self.positions.get(&field.to_uppercase()).copied()
    }

    fn build_segment(
        &self,
        table: &mut TableFile,
        start: usize,
        end: usize,
    ) -> Result<Option<HeapMap>> {
        if self.specs.is_empty() {
            return Ok(None);
        }
        let map = HeapMap::build(
            table,
            self.specs.clone(),
            self.record_size,
            start as u32,
            end - start,
        )?;
        Ok(Some(map))
    }
}
