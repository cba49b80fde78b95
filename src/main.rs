//! ARCHIVIST - Interactive Shell
//! Drives a local store and its backup, restore and bulk-load operations.
//!
//! Usage: `archivist [data_dir]` (defaults to `./data`).

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

use archivist::backup::{backup, BackupOptions};
use archivist::config::Config;
use archivist::engine::{RangeStore, Store};
use archivist::load::{load, LoadOptions};
use archivist::restore::{restore, RestoreOptions};
use archivist::types::pretty_key;

const DATASET: &str = "default";

fn print_help() {
    println!("  Commands:");
    println!("    put <key> <value>             - Store a key-value pair");
    println!("    get <key>                     - Retrieve a value by key");
    println!("    del <key>                     - Delete a key");
    println!("    scan                          - List all key-value pairs");
    println!("    split <key>                   - Start a new range at <key>");
    println!("    ranges                        - List ranges and their timestamp spans");
    println!("    load <file> <dir>             - Bulk-load a statement file into <dir>");
    println!("    backup <dir> [from <base>]    - Full (or incremental) backup into <dir>");
    println!("    restore <dir> [<dir>...]      - Restore a backup chain, full backup first");
    println!("    info                          - Show store statistics");
    println!("    exit                          - Shutdown");
    println!();
}

fn main() {
    env_logger::init();

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║           ARCHIVIST Backup Engine         ║");
    println!("  ║     Backup / Restore / Bulk Load v1.0.0   ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();
    print_help();

    let data_dir = std::env::args().nth(1).unwrap_or_else(|| "./data".to_string());
    let config = Config::new(data_dir);
    let store = match Store::open(config.clone()) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("[ERROR] Failed to open store: {}", err);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("archivist> ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("[ERROR] {}", e);
                break;
            }
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0].to_lowercase().as_str() {
            "set" | "put" => {
                if parts.len() < 3 {
                    println!("  Usage: put <key> <value>");
                    continue;
                }
                let key = parts[1].as_bytes().to_vec();
                let value = parts[2..].join(" ").into_bytes();
                match store.put(key, value) {
                    Ok(ts) => println!("  OK @ {}", ts),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "get" => {
                if parts.len() < 2 {
                    println!("  Usage: get <key>");
                    continue;
                }
                match store.get(parts[1].as_bytes()) {
                    Ok(Some(value)) => match String::from_utf8(value) {
                        Ok(s) => println!("  \"{}\"", s),
                        Err(_) => println!("  <binary data>"),
                    },
                    Ok(None) => println!("  (nil)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "del" | "delete" => {
                if parts.len() < 2 {
                    println!("  Usage: del <key>");
                    continue;
                }
                match store.delete(parts[1].as_bytes().to_vec()) {
                    Ok(ts) => println!("  OK (deleted @ {})", ts),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "scan" | "list" => match store.scan() {
                Ok(entries) if entries.is_empty() => println!("  (empty)"),
                Ok(entries) => {
                    for (key, value) in &entries {
                        println!("  {} -> {}", pretty_key(key), String::from_utf8_lossy(value));
                    }
                    println!("  ({} entries)", entries.len());
                }
                Err(e) => println!("  ERROR: {}", e),
            },
            "split" => {
                if parts.len() < 2 {
                    println!("  Usage: split <key>");
                    continue;
                }
                match store.split_at(parts[1].as_bytes()) {
                    Ok(id) => println!("  OK (range {})", id),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "ranges" => match store.ranges() {
                Ok(ranges) => {
                    for range in ranges {
                        let summary = store
                            .timestamp_summary(range.id)
                            .ok()
                            .flatten()
                            .map(|s| format!("[{}, {}]", s.min, s.max))
                            .unwrap_or_else(|| "(never written)".to_string());
                        println!("  {} {} {}", range.id, range.span, summary);
                    }
                }
                Err(e) => println!("  ERROR: {}", e),
            },
            "load" => {
                if parts.len() < 3 {
                    println!("  Usage: load <file> <dir>");
                    continue;
                }
                let file = match File::open(parts[1]) {
                    Ok(f) => f,
                    Err(e) => {
                        println!("  ERROR: {}", e);
                        continue;
                    }
                };
                let options = LoadOptions::new(DATASET, parts[2], std::env::temp_dir());
                match load(BufReader::new(file), store.clock(), &config, &options) {
                    Ok(outcome) => println!(
                        "  OK ({} rows, {} bytes @ {}) -> {:?}",
                        outcome.rows, outcome.total_size, outcome.timestamp, outcome.manifest_path
                    ),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "backup" => {
                let mut options = match parts.get(1) {
                    Some(dir) => BackupOptions::new(DATASET, *dir),
                    None => {
                        println!("  Usage: backup <dir> [from <base>]");
                        continue;
                    }
                };
                if parts.len() >= 4 && parts[2].eq_ignore_ascii_case("from") {
                    options = options.incremental_from(parts[3]);
                }
                match backup(&store, &config, &options) {
                    Ok(outcome) => println!(
                        "  OK ({} bytes, {} ranges skipped) -> {:?}",
                        outcome.total_size, outcome.metrics.ranges_skipped, outcome.manifest_path
                    ),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "restore" => {
                if parts.len() < 2 {
                    println!("  Usage: restore <dir> [<dir>...]");
                    continue;
                }
                let chain: Vec<PathBuf> = parts[1..].iter().map(PathBuf::from).collect();
                match restore(&store, &config, &chain, &RestoreOptions::new()) {
                    Ok(outcome) => println!(
                        "  OK ({} files added, {} already present, up to {})",
                        outcome.files_added, outcome.files_skipped, outcome.end
                    ),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "info" | "stats" => {
                match store.len() {
                    Ok(n) => println!("  Entries:       {}", n),
                    Err(e) => println!("  ERROR: {}", e),
                }
                println!("  Ranges:        {}", store.range_count());
                println!("  MemTable size: {} bytes", store.memtable_size());
                println!("  Clock:         {}", store.clock().peek());
                println!("{}", store.metrics().report());
            }
            "help" => print_help(),
            "exit" | "quit" | "q" => {
                println!("  Shutting down ARCHIVIST...");
                break;
            }
            _ => {
                println!("  Unknown command: '{}'. Type 'help' for commands.", parts[0]);
            }
        }
    }
}
