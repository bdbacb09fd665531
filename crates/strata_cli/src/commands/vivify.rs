//! Vivify command implementation.

use serde::Serialize;
use std::fmt::Write;
use std::path::Path;
use strata_core::{Options, Strata, Vivified};

/// A page in the JSON rendering.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Node {
    /// A branch page.
    Branch {
        /// Page address.
        address: u64,
        /// Children with their pivots.
        children: Vec<Edge>,
    },
    /// A leaf page.
    Leaf {
        /// Page address.
        address: u64,
        /// Ghost count.
        ghosts: usize,
        /// Live records.
        records: Vec<String>,
        /// Right sibling.
        #[serde(skip_serializing_if = "Option::is_none")]
        right: Option<u64>,
    },
}

/// A branch entry in the JSON rendering.
#[derive(Debug, Serialize)]
pub struct Edge {
    /// Pivot, absent for the first child.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pivot: Option<String>,
    /// The child page.
    pub page: Node,
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

impl From<&Vivified> for Node {
    fn from(vivified: &Vivified) -> Self {
        match vivified {
            Vivified::Branch { address, children } => Self::Branch {
                address: address.as_u64(),
                children: children
                    .iter()
                    .map(|(pivot, child)| Edge {
                        pivot: pivot.as_deref().map(text),
                        page: child.into(),
                    })
                    .collect(),
            },
            Vivified::Leaf {
                address,
                ghosts,
                records,
                right,
            } => Self::Leaf {
                address: address.as_u64(),
                ghosts: *ghosts,
                records: records.iter().map(|r| text(r)).collect(),
                right: right.map(|r| r.as_u64()),
            },
        }
    }
}

/// Renders the tree as an indented outline.
///
/// Each branch entry prints its pivot (`<` for the first child); leaves
/// print their live records after an arrow.
#[must_use]
pub fn outline(vivified: &Vivified) -> String {
    let mut out = String::new();
    if let Vivified::Branch { children, .. } = vivified {
        outline_into(&mut out, children, 0);
    }
    out
}

fn outline_into(out: &mut String, children: &[(Option<Vec<u8>>, Vivified)], depth: usize) {
    let padding = "   ".repeat(depth);
    for (pivot, child) in children {
        let key = pivot.as_deref().map_or_else(|| "<".to_string(), text);
        match child {
            Vivified::Leaf { records, .. } => {
                let records: Vec<String> = records.iter().map(|r| text(r)).collect();
                let _ = writeln!(out, "{padding}{key:<2} -> {}", records.join(", "));
            }
            Vivified::Branch { children, .. } => {
                let _ = writeln!(out, "{padding}{key}");
                outline_into(out, children, depth + 1);
            }
        }
    }
}

/// Runs the vivify command.
pub fn run(path: &Path, options: Options, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let tree = Strata::open(path, options)?;
    let vivified = tree.vivify()?;
    tree.close()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&Node::from(&vivified))?);
    } else {
        print!("{}", outline(&vivified));
    }
    Ok(())
}
