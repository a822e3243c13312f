//! Basic usage example for BloomDatabase
//!
//! This example opens a redb-backed database in a temporary directory,
//! applies an add chunk, a sub chunk and an AddDel, and checks URLs after
//! each step.
//!
//! To run this example:
//! ```bash
//! cargo run --example basic_usage
//! ```

use safebrowsing_chunk::{
    string_to_ranges, SbChunk, SbChunkDelete, SbEntry, SubPrefix, MALWARE_LIST,
};
use safebrowsing_db::{BloomDatabase, Database, DatabaseConfig, RedbStore};
use safebrowsing_hash::prefix_for;
use safebrowsing_url::host_key;
use tempfile::tempdir;

const URLS: &[&str] = &[
    "http://evil.example/",
    "http://bad.example/download.exe",
    "http://bad.example/index.html",
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let temp_dir = tempdir()?;
    let db_path = temp_dir.path().join("Safe Browsing.redb");
    println!("Creating database at: {}", db_path.display());

    let mut db = BloomDatabase::open_redb(DatabaseConfig {
        path: Some(db_path.clone()),
        synchronous: true,
        ..DatabaseConfig::default()
    })?;

    db.update_started()?;
    db.insert_chunks(
        MALWARE_LIST,
        vec![
            SbChunk::new(1, true)
                .with_host(host_key("evil.example"), SbEntry::add_prefixes(0, 0, Vec::new())),
            SbChunk::new(2, true).with_host(
                host_key("bad.example"),
                SbEntry::add_prefixes(0, 0, vec![prefix_for("bad.example/download.exe")]),
            ),
        ],
    )?;
    db.update_finished(true)?;
    report("After add chunks 1 and 2", &mut db);

    db.update_started()?;
    db.insert_chunks(
        MALWARE_LIST,
        vec![SbChunk::new(1, false).with_host(
            host_key("bad.example"),
            SbEntry::sub_prefixes(
                0,
                2,
                vec![SubPrefix {
                    add_chunk: 2,
                    prefix: prefix_for("bad.example/download.exe"),
                }],
            ),
        )],
    )?;
    db.delete_chunks(vec![SbChunkDelete {
        list_name: MALWARE_LIST.to_string(),
        is_sub_del: false,
        chunk_del: string_to_ranges("1")?,
    }])?;
    db.update_finished(true)?;
    report("After sub chunk 1 and AddDel 1", &mut db);

    if let Some(filter_path) = db.filter_path() {
        println!("Bloom filter file: {}", filter_path.display());
    }
    if let Ok(default_path) = RedbStore::default_path() {
        println!("Default system path would be: {}", default_path.display());
    }

    Ok(())
}

fn report(title: &str, db: &mut impl Database) {
    println!("\n{title}");
    for list in db.get_lists_info().unwrap_or_default() {
        println!("  {};a:{}:s:{}", list.name, list.adds, list.subs);
    }
    for url in URLS {
        let check = db.contains_url(url);
        println!("  {url}: listed={} {:?}", check.is_listed(), check.matching_list);
    }
    println!("  {}", db.stats());
}
