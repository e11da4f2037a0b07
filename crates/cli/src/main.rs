//! # CLI - UndertowKV Interactive Shell
//!
//! A REPL-style command-line interface for the UndertowKV storage engine.
//! Reads commands from stdin, executes them against the store, and prints
//! results to stdout. Designed for both interactive use and scripted testing
//! (pipe commands via stdin).
//!
//! ## Commands
//!
//! ```text
//! add <k> <v>      Insert a key-value pair (alias: set)
//! search <k>       Look up a key (alias: get; prints value or "(nil)")
//! update <k> <v>   Update a key (same as set)
//! delete <k>       Delete a key (writes a tombstone)
//! stats            Print engine internals
//! help             Show this summary
//! version          Print the release version
//! exit             Shut down gracefully (alias: quit)
//! ```
//!
//! ## Configuration
//!
//! All settings are controlled via environment variables:
//!
//! ```text
//! UNDERTOW_DATA_DIR        data directory              (default: "data")
//! UNDERTOW_MEMTABLE_BYTES  memtable rotation threshold (default: 300)
//! UNDERTOW_WAL_SYNC        fsync every WAL append      (default: "true")
//! ```
//!
//! Exits 0 on a clean shutdown, 1 when startup or shutdown fails.

use anyhow::Result;
use engine::Store;
use std::io::{self, BufRead, Write};

/// Reads a configuration value from the environment, falling back to
/// `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn print_help() {
    println!("Commands: add <k> <v> | set <k> <v> | search <k> | get <k>");
    println!("          update <k> <v> | delete <k> | stats | help | version | exit");
}

fn run() -> Result<()> {
    let data_dir = env_or("UNDERTOW_DATA_DIR", "data");
    let memtable_bytes: u64 = env_or("UNDERTOW_MEMTABLE_BYTES", "300")
        .parse()
        .unwrap_or(engine::DEFAULT_MEMTABLE_BYTES);
    let wal_sync: bool = env_or("UNDERTOW_WAL_SYNC", "true").parse().unwrap_or(true);

    let store = Store::open(&data_dir, memtable_bytes, wal_sync)?;

    println!(
        "UndertowKV started (data_dir={}, memtable={}B, wal_sync={})",
        data_dir, memtable_bytes, wal_sync
    );
    print_help();
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();

    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        if let Some(cmd) = parts.next() {
            match cmd.to_lowercase().as_str() {
                "add" | "set" => {
                    if let Some(k) = parts.next() {
                        let v: String = parts.collect::<Vec<&str>>().join(" ");
                        if v.is_empty() {
                            println!("ERR usage: add <key> <value>");
                        } else {
                            match store.set(k.as_bytes(), v.as_bytes()) {
                                Ok(()) => println!("OK"),
                                Err(e) => println!("ERR add failed: {}", e),
                            }
                        }
                    } else {
                        println!("ERR usage: add <key> <value>");
                    }
                }
                "search" | "get" => {
                    if let Some(k) = parts.next() {
                        match store.get(k.as_bytes()) {
                            Ok(Some(v)) => println!("{}", String::from_utf8_lossy(&v)),
                            Ok(None) => println!("(nil)"),
                            Err(e) => println!("ERR search failed: {}", e),
                        }
                    } else {
                        println!("ERR usage: search <key>");
                    }
                }
                "update" => {
                    if let Some(k) = parts.next() {
                        let v: String = parts.collect::<Vec<&str>>().join(" ");
                        if v.is_empty() {
                            println!("ERR usage: update <key> <value>");
                        } else {
                            match store.update(k.as_bytes(), v.as_bytes()) {
                                Ok(()) => println!("OK"),
                                Err(e) => println!("ERR update failed: {}", e),
                            }
                        }
                    } else {
                        println!("ERR usage: update <key> <value>");
                    }
                }
                "delete" | "del" => {
                    if let Some(k) = parts.next() {
                        match store.delete(k.as_bytes()) {
                            Ok(()) => println!("OK"),
                            Err(e) => println!("ERR delete failed: {}", e),
                        }
                    } else {
                        println!("ERR usage: delete <key>");
                    }
                }
                "stats" => {
                    println!("{:?}", store);
                }
                "help" => print_help(),
                "version" => println!("UndertowKV {}", env!("CARGO_PKG_VERSION")),
                "exit" | "quit" => {
                    println!("bye");
                    break;
                }
                other => {
                    println!("unknown command: {}", other);
                }
            }
        }

        print!("> ");
        io::stdout().flush().ok();
    }

    store.close()?;
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::WARN)
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("ERR {}", e);
        std::process::exit(1);
    }
}
