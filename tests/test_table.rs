use std::fs;
use std::path::PathBuf;

use dbasekit::table::{FieldDef, FieldType, TableFile, Version, LANG_JAPAN};
use dbasekit::Error;
use tempfile::TempDir;

fn base(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

fn id_name_schema() -> Vec<FieldDef> {
    vec![FieldDef::numeric("ID", 5, 0), FieldDef::character("NAME", 30)]
}

#[test]
fn test_empty_table_round_trip() {
    let dir = TempDir::new().unwrap();
    let games = base(&dir, "EMPTY");
    drop(TableFile::create_dbase3(&games, &id_name_schema()).unwrap());

    let table = TableFile::open(&games).unwrap();
    let header = table.header();
    assert_eq!(Version::DBase3, header.version);
    assert_eq!(0, table.language_driver());
    assert_eq!(0, table.row_count());
    assert_eq!(97, header.header_size); // 32 + 32 * 2 + 1
    assert_eq!(36, header.record_size); // 1 + 5 + 30

    assert_eq!("ID", header.fields[0].name);
    assert_eq!(FieldType::Numeric, header.fields[0].ftype);
    assert_eq!(5, header.fields[0].length);
    assert_eq!(0, header.fields[0].decimals);
    assert_eq!(1, header.fields[0].offset);

    assert_eq!("NAME", header.fields[1].name);
    assert_eq!(FieldType::Character, header.fields[1].ftype);
    assert_eq!(30, header.fields[1].length);
    assert_eq!(6, header.fields[1].offset);
}

#[test]
fn test_header_bytes_on_disk() {
    let dir = TempDir::new().unwrap();
    let games = base(&dir, "BYTES");
    drop(TableFile::create_dbase3(&games, &id_name_schema()).unwrap());

    let bytes = fs::read(dir.path().join("BYTES.DBF")).unwrap();
    assert_eq!(98, bytes.len());
    assert_eq!(0x03, bytes[0]);
    assert_eq!(0, bytes[28]);
    assert_eq!(0, bytes[29]);

    // first descriptor: null-padded name, ASCII type tag, length, decimals
    assert_eq!(b"ID", &bytes[32..34]);
    assert_eq!(0, bytes[34]);
    assert_eq!(b'N', bytes[43]);
    assert_eq!(5, bytes[48]);
    assert_eq!(0, bytes[49]);
    assert_eq!(b'C', bytes[64 + 11]);
    assert_eq!(30, bytes[64 + 16]);

    // exactly one terminator, then the EOF marker
    assert_eq!(0x0D, bytes[96]);
    assert_eq!(0x1A, bytes[97]);
}

#[test]
fn test_dbase4_defaults_and_memo_promotion() {
    let dir = TempDir::new().unwrap();

    let plain = base(&dir, "PLAIN");
    drop(TableFile::create(&plain, &id_name_schema()).unwrap());
    let bytes = fs::read(dir.path().join("PLAIN.DBF")).unwrap();
    assert_eq!(0x04, bytes[0]);
    assert_eq!(1, bytes[29]); // US language driver by default
    assert!(!dir.path().join("PLAIN.DBT").exists());

    let mut schema = id_name_schema();
    schema.push(FieldDef::memo("NOTES"));
    let noted = base(&dir, "NOTED");
    drop(TableFile::create(&noted, &schema).unwrap());
    let table = TableFile::open(&noted).unwrap();
    assert_eq!(Version::DBase4Memo, table.header().version);
    assert!(table.header().has_memo());
    assert!(dir.path().join("NOTED.DBT").exists());
}

#[test]
fn test_append_then_read() {
    let dir = TempDir::new().unwrap();
    let games = base(&dir, "ROWS");
    let mut table = TableFile::create_dbase3(&games, &id_name_schema()).unwrap();

    table.append_row(&["42", "Kings Quest"]).unwrap();
    table.append_row(&["7", "Zork"]).unwrap();
    assert_eq!(2, table.row_count());

    let header = table.header().clone();
    let row = table.read_row_at(0).unwrap().unwrap();
    assert_eq!(b' ', row.delete_flag());
    assert_eq!(b"42   ", row.field_bytes(&header.fields[0]));
    assert_eq!("42", row.field_trimmed(&header.fields[0]));
    assert_eq!("Kings Quest", row.field_trimmed(&header.fields[1]));

    let row = table.read_row_at(1).unwrap().unwrap();
    assert_eq!("Zork", row.field_trimmed(&header.fields[1]));

    // past the end: empty, not an error
    assert!(table.read_row_at(2).unwrap().is_none());

    // the persisted count survives a reopen, and the file still ends in 0x1A
    drop(table);
    let table = TableFile::open(&games).unwrap();
    assert_eq!(2, table.row_count());
    let bytes = fs::read(dir.path().join("ROWS.DBF")).unwrap();
    assert_eq!(0x1A, *bytes.last().unwrap());
    assert_eq!(97 + 2 * 36 + 1, bytes.len());
}

#[test]
fn test_value_truncation() {
    let dir = TempDir::new().unwrap();
    let games = base(&dir, "TRUNC");
    let mut table = TableFile::create_dbase3(&games, &id_name_schema()).unwrap();
    table
        .append_row(&["1234567", "a name that runs well past thirty characters"])
        .unwrap();
    let header = table.header().clone();
    let row = table.read_row_at(0).unwrap().unwrap();
    assert_eq!("12345", row.field_trimmed(&header.fields[0]));
    assert_eq!(30, row.field_bytes(&header.fields[1]).len());
}

#[test]
fn test_delete_flag_round_trip() {
    let dir = TempDir::new().unwrap();
    let games = base(&dir, "DELS");
    let mut table = TableFile::create_dbase3(&games, &id_name_schema()).unwrap();
    table.append_row(&["1", "first"]).unwrap();
    table.append_row(&["2", "second"]).unwrap();

    table.set_row_deleted(0, true).unwrap();
    assert!(table.read_row_at(0).unwrap().unwrap().is_deleted());
    assert!(!table.read_row_at(1).unwrap().unwrap().is_deleted());
    assert_eq!(2, table.row_count());

    table.set_row_deleted(0, false).unwrap();
    assert!(!table.read_row_at(0).unwrap().unwrap().is_deleted());
}

#[test]
fn test_overwrite_row() {
    let dir = TempDir::new().unwrap();
    let games = base(&dir, "OVER");
    let mut table = TableFile::create_dbase3(&games, &id_name_schema()).unwrap();
    table.append_row(&["1", "before"]).unwrap();
    table.write_row_values(0, &["9", "after"]).unwrap();

    let header = table.header().clone();
    let row = table.read_row_at(0).unwrap().unwrap();
    assert_eq!("9", row.field_trimmed(&header.fields[0]));
    assert_eq!("after", row.field_trimmed(&header.fields[1]));
    assert_eq!(1, table.row_count());
}

#[test]
fn test_date_and_language_accessors() {
    let dir = TempDir::new().unwrap();
    let iii = base(&dir, "DATE3");
    let mut table = TableFile::create_dbase3(&iii, &id_name_schema()).unwrap();
    table.set_last_modified(84, 6, 1).unwrap();
    drop(table);
    let table = TableFile::open(&iii).unwrap();
    assert_eq!((84, 6, 1), table.last_modified());

    // dBase III refuses a non-zero language driver
    let mut table = TableFile::open(&iii).unwrap();
    assert!(matches!(
        table.set_language_driver(LANG_JAPAN),
        Err(Error::InvalidArgument(_))
    ));
    table.set_language_driver(0).unwrap();

    let iv = base(&dir, "DATE4");
    let mut table = TableFile::create(&iv, &id_name_schema()).unwrap();
    table.set_language_driver(LANG_JAPAN).unwrap();
    drop(table);
    let table = TableFile::open(&iv).unwrap();
    assert_eq!(LANG_JAPAN, table.language_driver());
}

#[test]
fn test_open_failures() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        TableFile::open(&base(&dir, "MISSING")),
        Err(Error::NotFound(_))
    ));

    let short = dir.path().join("SHORT.DBF");
    fs::write(&short, [0x03, 0, 0]).unwrap();
    assert!(matches!(
        TableFile::open(&short),
        Err(Error::CorruptTable(_))
    ));

    let mut bad_version = vec![0u8; 98];
    bad_version[0] = 0x07;
    let bad = dir.path().join("BADVER.DBF");
    fs::write(&bad, &bad_version).unwrap();
    assert!(matches!(
        TableFile::open(&bad),
        Err(Error::CorruptTable(_))
    ));

    // header claims fields, but the descriptor block is cut short
    let mut truncated = vec![0u8; 40];
    truncated[0] = 0x03;
    truncated[32] = b'I';
    let trunc = dir.path().join("TRUNC.DBF");
    fs::write(&trunc, &truncated).unwrap();
    assert!(matches!(
        TableFile::open(&trunc),
        Err(Error::CorruptTable(_))
    ));
}

#[test]
fn test_schema_limits() {
    let dir = TempDir::new().unwrap();
    let too_many: Vec<FieldDef> = (0..65)
        .map(|i| FieldDef::character(&format!("F{i}"), 1))
        .collect();
    assert!(matches!(
        TableFile::create_dbase3(&base(&dir, "MANY"), &too_many),
        Err(Error::Schema(_))
    ));

    let too_wide: Vec<FieldDef> = (0..17)
        .map(|i| FieldDef::character(&format!("F{i}"), 255))
        .collect();
    assert!(matches!(
        TableFile::create_dbase3(&base(&dir, "WIDE"), &too_wide),
        Err(Error::Schema(_))
    ));

    // 64 narrow fields are fine
    let at_cap: Vec<FieldDef> = (0..64)
        .map(|i| FieldDef::character(&format!("F{i}"), 2))
        .collect();
    let table = TableFile::create_dbase3(&base(&dir, "CAP"), &at_cap).unwrap();
    assert_eq!(64, table.header().fields.len());
    assert_eq!(129, table.header().record_size);
}

#[test]
fn test_clear_memo_fields() {
    let dir = TempDir::new().unwrap();
    let games = base(&dir, "CLEAR");
    let schema = vec![FieldDef::character("NAME", 10), FieldDef::memo("NOTES")];
    let mut table = TableFile::create(&games, &schema).unwrap();
    table.append_row(&["a", "5"]).unwrap();
    table.append_row(&["b", "12"]).unwrap();
    table.set_row_deleted(1, true).unwrap();

    table.clear_memo_fields().unwrap();
    let header = table.header().clone();
    let row = table.read_row_at(0).unwrap().unwrap();
    assert_eq!(0, row.memo_block(&header.fields[1]));
    let row = table.read_row_at(1).unwrap().unwrap();
    assert_eq!(0, row.memo_block(&header.fields[1]));
    assert!(row.is_deleted()); // the tombstone survives the sweep
}
