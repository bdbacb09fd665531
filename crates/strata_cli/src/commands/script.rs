//! Script command implementation.
//!
//! A script drives a fresh tree one line at a time:
//!
//! ```text
//! +a        insert "a"
//! +a-e      insert "a" through "e"
//! -c        remove "c"
//! ~         balance
//! !         print the tree outline
//! >out.json write the tree as JSON
//! # ...     comment
//! ```
//!
//! Ranges count over the alphabet `abcdefghiklmnopqrstuvwxyz` (no `j`), so
//! `+y-ab` inserts `y`, `z`, `aa` and `ab`.

use super::tree::print_report;
use super::vivify::{outline, Node};
use std::fs;
use std::path::{Path, PathBuf};
use strata_core::{Options, Strata};
use thiserror::Error;

const ALPHABET: &[u8] = b"abcdefghiklmnopqrstuvwxyz";

/// A parsed script line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Insert each key as a record.
    Add(Vec<String>),
    /// Remove each key.
    Remove(Vec<String>),
    /// Balance the tree.
    Balance,
    /// Print the tree outline.
    Vivify,
    /// Write the tree as JSON to a file.
    Stringify(PathBuf),
}

/// Script parse errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    /// A line could not be parsed.
    #[error("line {line}: {message}")]
    Parse {
        /// One-based line number.
        line: usize,
        /// What was wrong.
        message: String,
    },
}

fn digit(letter: u8) -> Option<usize> {
    ALPHABET.iter().position(|&a| a == letter)
}

/// Returns the key after `key` in alphabet order, carrying like a counter.
#[must_use]
pub fn increment(key: &str) -> String {
    let mut digits: Vec<usize> = key.bytes().filter_map(digit).collect();
    let mut i = digits.len();
    let carried = loop {
        if i == 0 {
            break true;
        }
        i -= 1;
        digits[i] += 1;
        if digits[i] < ALPHABET.len() {
            break false;
        }
        digits[i] = 0;
    };
    if carried {
        digits.insert(0, 0);
    }
    digits.iter().map(|&d| char::from(ALPHABET[d])).collect()
}

/// Expands `first-last` into every key between them, inclusive.
///
/// # Errors
///
/// Returns a message if `last` is never reached from `first`.
pub fn expand(first: &str, last: &str) -> Result<Vec<String>, String> {
    let mut keys = vec![first.to_string()];
    let mut current = first.to_string();
    while current != last {
        current = increment(&current);
        if current.len() > last.len() {
            return Err(format!("range {first}-{last} is empty"));
        }
        keys.push(current.clone());
    }
    Ok(keys)
}

fn parse_keys(spec: &str) -> Result<Vec<String>, String> {
    let (first, last) = spec.split_once('-').unwrap_or((spec, spec));
    for key in [first, last] {
        if key.is_empty() {
            return Err("missing key".to_string());
        }
        if let Some(bad) = key.bytes().find(|&b| digit(b).is_none()) {
            return Err(format!("invalid key letter {:?}", char::from(bad)));
        }
    }
    expand(first, last)
}

/// Parses a script.
///
/// # Errors
///
/// Returns the first line that cannot be parsed.
pub fn parse(text: &str) -> Result<Vec<Action>, ScriptError> {
    let mut actions = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim_end();
        let fail = |message: String| ScriptError::Parse {
            line: index + 1,
            message,
        };
        let Some(command) = line.chars().next() else {
            continue;
        };
        let rest = &line[command.len_utf8()..];
        let action = match command {
            '#' => continue,
            '+' => Action::Add(parse_keys(rest).map_err(fail)?),
            '-' => Action::Remove(parse_keys(rest).map_err(fail)?),
            '~' => Action::Balance,
            '!' => Action::Vivify,
            '>' if !rest.trim().is_empty() => Action::Stringify(PathBuf::from(rest.trim())),
            other => return Err(fail(format!("unknown command {other:?}"))),
        };
        actions.push(action);
    }
    Ok(actions)
}

/// Runs parsed actions against a tree.
///
/// # Errors
///
/// Returns the first tree or I/O error.
pub fn execute(tree: &Strata, actions: &[Action]) -> Result<(), Box<dyn std::error::Error>> {
    for action in actions {
        match action {
            Action::Add(keys) => {
                for key in keys {
                    if tree.insert(key.as_bytes())? {
                        return Err(format!("duplicate key {key:?}").into());
                    }
                }
            }
            Action::Remove(keys) => {
                for key in keys {
                    tree.remove(key.as_bytes())?;
                }
            }
            Action::Balance => print_report(&tree.balance()?),
            Action::Vivify => print!("{}", outline(&tree.vivify()?)),
            Action::Stringify(file) => {
                let json = serde_json::to_string_pretty(&Node::from(&tree.vivify()?))?;
                fs::write(file, json + "\n")?;
            }
        }
    }
    Ok(())
}

/// Runs the script command against a new tree in `path`.
pub fn run(path: &Path, options: Options, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let actions = parse(&fs::read_to_string(file)?)?;
    let tree = Strata::create(path, options)?;
    execute(&tree, &actions)?;
    tree.close()?;
    Ok(())
}
