//! Record commands.

use std::path::Path;
use strata_core::{Options, Strata};

/// Runs the insert command.
pub fn insert(
    path: &Path,
    options: Options,
    records: &[String],
    balance: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let tree = Strata::open(path, options)?;
    let mut replaced = 0;
    for record in records {
        if tree.insert(record.as_bytes())? {
            replaced += 1;
        }
    }
    println!(
        "Inserted {} records ({replaced} replaced)",
        records.len() - replaced
    );
    if balance {
        tree.balance()?;
    }
    tree.close()?;
    Ok(())
}

/// Runs the remove command.
pub fn remove(
    path: &Path,
    options: Options,
    keys: &[String],
    balance: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let tree = Strata::open(path, options)?;
    let mut removed = 0;
    for key in keys {
        if tree.remove(key.as_bytes())? {
            removed += 1;
        } else {
            println!("No record with key {key:?}");
        }
    }
    println!("Removed {removed} records");
    if balance {
        tree.balance()?;
    }
    tree.close()?;
    Ok(())
}

/// Runs the get command.
pub fn get(path: &Path, options: Options, key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let tree = Strata::open(path, options)?;
    let record = tree.get(key.as_bytes())?;
    tree.close()?;
    match record {
        Some(record) => {
            println!("{}", String::from_utf8_lossy(&record));
            Ok(())
        }
        None => Err(format!("no record with key {key:?}").into()),
    }
}

/// Runs the dump command.
pub fn dump(path: &Path, options: Options) -> Result<(), Box<dyn std::error::Error>> {
    let tree = Strata::open(path, options)?;
    let mut cursor = tree.leftmost()?;
    let mut count = 0;
    loop {
        for record in cursor.records()? {
            println!("{}", String::from_utf8_lossy(&record));
            count += 1;
        }
        if !cursor.next()? {
            break;
        }
    }
    drop(cursor);
    eprintln!("{count} records");
    tree.close()?;
    Ok(())
}
