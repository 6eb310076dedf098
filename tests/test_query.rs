use std::path::PathBuf;

use dbasekit::ndx::create_index;
use dbasekit::query::{Filter, FilterGroup, MatchMode, Query};
use dbasekit::table::{FieldDef, TableFile};
use dbasekit::Error;
use tempfile::TempDir;

fn base(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

fn games_schema() -> Vec<FieldDef> {
    vec![
        FieldDef::character("TITLE", 20),
        FieldDef::numeric("YEAR", 5, 0),
        FieldDef::numeric("MAXPLAY", 3, 0),
        FieldDef::date("ADDED"),
        FieldDef::logical("ACTIVE"),
        FieldDef::numeric("FLAGS", 3, 0),
    ]
}

/// Recnos:        1              2             3            4          5                6
/// TITLE          Kings Quest    Queen Raid    King Kong    Pitfall    Queens Gambit    Zork
/// YEAR           1984           1984          1985         1982       1985             1984
/// MAXPLAY        2              1             4            1          2                2
/// ADDED          19840601       19850115      19900101     19820601   19850301         19840601
/// ACTIVE         T              F             T            T          F                F
/// FLAGS          1              2             3            8          10               4
fn build_games(dir: &TempDir) -> (PathBuf, PathBuf) {
    let games = base(dir, "GAMES");
    let mut table = TableFile::create_dbase3(&games, &games_schema()).unwrap();
    let rows: [[&str; 6]; 6] = [
        ["Kings Quest", "1984", "2", "19840601", "T", "1"],
        ["Queen Raid", "1984", "1", "19850115", "F", "2"],
        ["King Kong", "1985", "4", "19900101", "T", "3"],
        ["Pitfall", "1982", "1", "19820601", "T", "8"],
        ["Queens Gambit", "1985", "2", "19850301", "F", "10"],
        ["Zork", "1984", "2", "19840601", "F", "4"],
    ];
    for row in &rows {
        table.append_row(row).unwrap();
    }
    let title_ndx = dir.path().join("TITLE.NDX");
    create_index(&mut table, "TITLE", &title_ndx).unwrap();
    (games, title_ndx)
}

#[test]
fn test_single_all_group() {
    let dir = TempDir::new().unwrap();
    let (games, _) = build_games(&dir);
    let mut query = Query::new(&games);
    query
        .add_group(
            FilterGroup::new(MatchMode::All)
                .with(Filter::equal("YEAR", 1984))
                .unwrap()
                .with(Filter::equal("MAXPLAY", 2))
                .unwrap(),
        )
        .unwrap();
    assert_eq!(vec![1, 6], query.execute().unwrap());
}

#[test]
fn test_single_any_group() {
    let dir = TempDir::new().unwrap();
    let (games, _) = build_games(&dir);
    let mut query = Query::new(&games);
    query
        .add_group(
            FilterGroup::new(MatchMode::Any)
                .with(Filter::equal("YEAR", 1982))
                .unwrap()
                .with(Filter::equal("MAXPLAY", 4))
                .unwrap(),
        )
        .unwrap();
    assert_eq!(vec![3, 4], query.execute().unwrap());
}

#[test]
fn test_multi_group_query() {
    let dir = TempDir::new().unwrap();
    let (games, title_ndx) = build_games(&dir);

    // (title LIKE King% OR title LIKE Queen%)
    // AND (year = 1984 OR year = 1985)
    // AND (maxplay >= 2)
    let mut query = Query::new(&games);
    query
        .add_group(
            FilterGroup::new(MatchMode::Any)
                .with(Filter::like("TITLE", "King", &title_ndx))
                .unwrap()
                .with(Filter::like("TITLE", "Queen", &title_ndx))
                .unwrap(),
        )
        .unwrap()
        .add_group(
            FilterGroup::new(MatchMode::Any)
                .with(Filter::equal("YEAR", 1984))
                .unwrap()
                .with(Filter::equal("YEAR", 1985))
                .unwrap(),
        )
        .unwrap()
        .add_group(
            FilterGroup::new(MatchMode::All)
                .with(Filter::greater_equal("MAXPLAY", 2))
                .unwrap(),
        )
        .unwrap();
    assert_eq!(vec![1, 3, 5], query.execute().unwrap());
}

#[test]
fn test_exact_string_filter() {
    let dir = TempDir::new().unwrap();
    let (games, title_ndx) = build_games(&dir);

    let mut query = Query::new(&games);
    query
        .add_group(
            FilterGroup::new(MatchMode::Any)
                .with(Filter::exact("TITLE", "Zork", &title_ndx))
                .unwrap()
                .with(Filter::exact("TITLE", "Pitfall", &title_ndx))
                .unwrap(),
        )
        .unwrap();
    assert_eq!(vec![4, 6], query.execute().unwrap());

    // an indexed filter and a heap filter inside one ALL group
    let mut query = Query::new(&games);
    query
        .add_group(
            FilterGroup::new(MatchMode::All)
                .with(Filter::like("TITLE", "Queen", &title_ndx))
                .unwrap()
                .with(Filter::equal("YEAR", 1985))
                .unwrap(),
        )
        .unwrap();
    assert_eq!(vec![5], query.execute().unwrap());
}

#[test]
fn test_group_order_does_not_matter() {
    let dir = TempDir::new().unwrap();
    let (games, _) = build_games(&dir);

    let year_group = || {
        FilterGroup::new(MatchMode::All)
            .with(Filter::between("YEAR", 1983, 1985))
            .unwrap()
    };
    let play_group = || {
        FilterGroup::new(MatchMode::All)
            .with(Filter::greater_than("MAXPLAY", 1))
            .unwrap()
    };

    let mut forward = Query::new(&games);
    forward.add_group(year_group()).unwrap();
    forward.add_group(play_group()).unwrap();
    let mut backward = Query::new(&games);
    backward.add_group(play_group()).unwrap();
    backward.add_group(year_group()).unwrap();

    let expect = vec![1, 3, 5, 6];
    assert_eq!(expect, forward.execute().unwrap());
    assert_eq!(expect, backward.execute().unwrap());
}

#[test]
fn test_date_and_logical_filters() {
    let dir = TempDir::new().unwrap();
    let (games, _) = build_games(&dir);

    let mut query = Query::new(&games);
    query
        .add_group(
            FilterGroup::new(MatchMode::All)
                .with(Filter::date_between("ADDED", (1984, 1, 1), (1984, 12, 31)))
                .unwrap(),
        )
        .unwrap();
    assert_eq!(vec![1, 6], query.execute().unwrap());

    let mut query = Query::new(&games);
    query
        .add_group(
            FilterGroup::new(MatchMode::All)
                .with(Filter::logical_true("ACTIVE"))
                .unwrap()
                .with(Filter::equal("YEAR", 1984))
                .unwrap(),
        )
        .unwrap();
    assert_eq!(vec![1], query.execute().unwrap());

    let mut query = Query::new(&games);
    query
        .add_group(
            FilterGroup::new(MatchMode::All)
                .with(Filter::logical_false("ACTIVE"))
                .unwrap()
                .with(Filter::date_year("ADDED", 1985))
                .unwrap(),
        )
        .unwrap();
    assert_eq!(vec![2, 5], query.execute().unwrap());
}

#[test]
fn test_bit_filters() {
    let dir = TempDir::new().unwrap();
    let (games, _) = build_games(&dir);

    let run = |filter: Filter| {
        let mut query = Query::new(&games);
        query
            .add_group(FilterGroup::new(MatchMode::All).with(filter).unwrap())
            .unwrap();
        query.execute().unwrap()
    };

    assert_eq!(vec![2, 3, 5], run(Filter::bit_set("FLAGS", 1)));
    assert_eq!(vec![2, 4, 5, 6], run(Filter::bit_clear("FLAGS", 0)));
    assert_eq!(vec![5], run(Filter::bit_mask_all("FLAGS", 0b1010)));
    assert_eq!(vec![2, 3, 4, 5], run(Filter::bit_mask_any("FLAGS", 0b1010)));
}

#[test]
fn test_in_list_and_not_equal() {
    let dir = TempDir::new().unwrap();
    let (games, _) = build_games(&dir);

    let mut query = Query::new(&games);
    query
        .add_group(
            FilterGroup::new(MatchMode::All)
                .with(Filter::in_list("YEAR", vec![1982, 1985]))
                .unwrap(),
        )
        .unwrap();
    assert_eq!(vec![3, 4, 5], query.execute().unwrap());

    let mut query = Query::new(&games);
    query
        .add_group(
            FilterGroup::new(MatchMode::All)
                .with(Filter::not_equal("YEAR", 1984))
                .unwrap(),
        )
        .unwrap();
    assert_eq!(vec![3, 4, 5], query.execute().unwrap());
}

#[test]
fn test_missing_field_behaviour() {
    let dir = TempDir::new().unwrap();
    let (games, _) = build_games(&dir);

    // ALL: an unknown field excludes everything
    let mut query = Query::new(&games);
    query
        .add_group(
            FilterGroup::new(MatchMode::All)
                .with(Filter::equal("NOSUCH", 1))
                .unwrap()
                .with(Filter::equal("YEAR", 1984))
                .unwrap(),
        )
        .unwrap();
    assert!(query.execute().unwrap().is_empty());

    // ANY: an unknown field contributes nothing
    let mut query = Query::new(&games);
    query
        .add_group(
            FilterGroup::new(MatchMode::Any)
                .with(Filter::equal("NOSUCH", 1))
                .unwrap()
                .with(Filter::equal("YEAR", 1984))
                .unwrap(),
        )
        .unwrap();
    assert_eq!(vec![1, 2, 6], query.execute().unwrap());
}

#[test]
fn test_missing_index_fails() {
    let dir = TempDir::new().unwrap();
    let (games, _) = build_games(&dir);
    let mut query = Query::new(&games);
    query
        .add_group(
            FilterGroup::new(MatchMode::Any)
                .with(Filter::like("TITLE", "King", &dir.path().join("GONE.NDX")))
                .unwrap(),
        )
        .unwrap();
    assert!(matches!(query.execute(), Err(Error::MissingIndex(_))));
}

#[test]
fn test_heap_overflow_is_reported() {
    let dir = TempDir::new().unwrap();
    let wide = base(&dir, "WIDE");
    // ten numeric columns cannot fit a 32-byte packed record
    let schema: Vec<FieldDef> = (0..10)
        .map(|i| FieldDef::numeric(&format!("N{i}"), 5, 0))
        .collect();
    let mut table = TableFile::create_dbase3(&wide, &schema).unwrap();
    table
        .append_row(&["1", "2", "3", "4", "5", "6", "7", "8", "9", "10"])
        .unwrap();
    drop(table);

    let mut query = Query::new(&wide);
    let mut g1 = FilterGroup::new(MatchMode::All);
    let mut g2 = FilterGroup::new(MatchMode::All);
    for i in 0..5 {
        g1.push(Filter::equal(&format!("N{i}"), 0)).unwrap();
        g2.push(Filter::equal(&format!("N{}", i + 5), 0)).unwrap();
    }
    query.add_group(g1).unwrap();
    query.add_group(g2).unwrap();
    assert!(matches!(query.execute(), Err(Error::HeapOverflow(32))));
}

#[test]
fn test_empty_query_and_empty_table() {
    let dir = TempDir::new().unwrap();
    let (games, _) = build_games(&dir);
    assert!(Query::new(&games).execute().unwrap().is_empty());

    let empty = base(&dir, "EMPTY");
    drop(TableFile::create_dbase3(&empty, &games_schema()).unwrap());
    let mut query = Query::new(&empty);
    query
        .add_group(
            FilterGroup::new(MatchMode::All)
                .with(Filter::equal("YEAR", 1984))
                .unwrap(),
        )
        .unwrap();
    assert!(query.execute().unwrap().is_empty());
}

/// A table larger than the segment capacity must produce the same result
/// as a single-segment scan, with the heap map bounded per segment.
#[test]
fn test_segmented_scan_matches_single_segment() {
    let dir = TempDir::new().unwrap();
    let big = base(&dir, "BIG");
    let schema = vec![
        FieldDef::character("NAME", 12),
        FieldDef::numeric("YEAR", 5, 0),
        FieldDef::logical("ACTIVE"),
    ];
    let mut table = TableFile::create_dbase3(&big, &schema).unwrap();
    for i in 0..2000u32 {
        let year = if i % 3 == 0 { "1995" } else { "1996" };
        let active = if i % 2 == 0 { "T" } else { "F" };
        table
            .append_row(&[&format!("ROW{i:05}"), year, active])
            .unwrap();
    }
    let ndx = dir.path().join("BIGNAME.NDX");
    create_index(&mut table, "NAME", &ndx).unwrap();
    drop(table);

    let build = |capacity: Option<usize>| {
        let mut query = match capacity {
            Some(c) => Query::new(&big).segment_capacity(c),
            None => Query::new(&big),
        };
        query
            .add_group(
                FilterGroup::new(MatchMode::All)
                    .with(Filter::equal("YEAR", 1995))
                    .unwrap()
                    .with(Filter::logical_true("ACTIVE"))
                    .unwrap(),
            )
            .unwrap()
            .add_group(
                FilterGroup::new(MatchMode::Any)
                    .with(Filter::like("NAME", "ROW0", &ndx))
                    .unwrap()
                    .with(Filter::like("NAME", "ROW1", &ndx))
                    .unwrap(),
            )
            .unwrap();
        query.execute().unwrap()
    };

    // year divisible by 3 and even row: i % 6 == 0, names ROW0xxxx/ROW1xxxx
    let expect: Vec<u32> = (0..2000u32)
        .filter(|i| i % 6 == 0 && *i < 2000)
        .map(|i| i + 1)
        .collect();

    let single = build(None);
    assert_eq!(expect, single);
    // 450-record segments force five passes over the same table
    let segmented = build(Some(450));
    assert_eq!(single, segmented);
    // an odd capacity leaves a short tail segment
    let tiny = build(Some(157));
    assert_eq!(single, tiny);
}
