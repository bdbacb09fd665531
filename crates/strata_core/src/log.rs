//! Page log entries and replay.
//!
//! Every line of a page file carries one [`LogEntry`]. The encoding is a tag
//! byte followed by little-endian fields; records and pivots are
//! length-prefixed.
//!
//! | tag | entry              | body                                          |
//! |-----|--------------------|-----------------------------------------------|
//! | 1   | leaf checkpoint    | right (8), ghosts (8), count (8), records     |
//! | 2   | branch checkpoint  | count (8), children                           |
//! | 3   | insert             | index (8), record                             |
//! | 4   | delete             | index (8)                                     |
//! | 5   | right              | right (8)                                     |
//!
//! A right address of 0 means the right edge of the tree; address 0 is the
//! root branch and can never be a right sibling. A child is its address (8),
//! a presence byte, and the pivot when present.

use crate::error::{CoreError, CoreResult};
use crate::page::{Child, Extract, Page};
use crate::types::Address;
use tracing::warn;

/// Type of log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryTag {
    /// Leaf snapshot.
    LeafCheckpoint = 1,
    /// Branch snapshot.
    BranchCheckpoint = 2,
    /// Record insertion.
    Insert = 3,
    /// Record deletion.
    Delete = 4,
    /// Right sibling update.
    Right = 5,
}

impl EntryTag {
    /// Converts a byte to an entry tag.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::LeafCheckpoint),
            2 => Some(Self::BranchCheckpoint),
            3 => Some(Self::Insert),
            4 => Some(Self::Delete),
            5 => Some(Self::Right),
            _ => None,
        }
    }

    /// Converts the tag to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A page snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkpoint {
    /// Snapshot of a leaf.
    Leaf {
        /// Right sibling.
        right: Option<Address>,
        /// Number of leading ghosts among `records`.
        ghosts: usize,
        /// Records in key order, ghosts first.
        records: Vec<Vec<u8>>,
    },
    /// Snapshot of a branch.
    Branch {
        /// Children in key order.
        children: Vec<Child>,
    },
}

/// One entry of a page log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// Replaces the page wholesale.
    Checkpoint(Checkpoint),
    /// Inserts a record at an index.
    Insert {
        /// Position of the new record.
        index: usize,
        /// The record.
        record: Vec<u8>,
    },
    /// Deletes the record at an index.
    Delete {
        /// Position of the deleted record.
        index: usize,
    },
    /// Sets the right sibling.
    Right(Option<Address>),
}

/// Result of decoding one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A known entry.
    Entry(LogEntry),
    /// An entry with a tag this version does not know.
    Unknown(u8),
}

impl LogEntry {
    /// Returns the tag of this entry.
    #[must_use]
    pub fn tag(&self) -> EntryTag {
        match self {
            Self::Checkpoint(Checkpoint::Leaf { .. }) => EntryTag::LeafCheckpoint,
            Self::Checkpoint(Checkpoint::Branch { .. }) => EntryTag::BranchCheckpoint,
            Self::Insert { .. } => EntryTag::Insert,
            Self::Delete { .. } => EntryTag::Delete,
            Self::Right(_) => EntryTag::Right,
        }
    }

    /// Serializes the entry.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.tag().as_byte()];

        match self {
            Self::Checkpoint(Checkpoint::Leaf {
                right,
                ghosts,
                records,
            }) => {
                put_address(&mut buf, *right);
                put_usize(&mut buf, *ghosts);
                put_usize(&mut buf, records.len());
                for record in records {
                    put_bytes(&mut buf, record);
                }
            }

            Self::Checkpoint(Checkpoint::Branch { children }) => {
                put_usize(&mut buf, children.len());
                for child in children {
                    buf.extend_from_slice(&child.address.as_u64().to_le_bytes());
                    // pivot: 1 byte flag + optional length-prefixed key
                    if let Some(pivot) = &child.pivot {
                        buf.push(1);
                        put_bytes(&mut buf, pivot);
                    } else {
                        buf.push(0);
                    }
                }
            }

            Self::Insert { index, record } => {
                put_usize(&mut buf, *index);
                put_bytes(&mut buf, record);
            }

            Self::Delete { index } => {
                put_usize(&mut buf, *index);
            }

            Self::Right(right) => {
                put_address(&mut buf, *right);
            }
        }

        buf
    }

    /// Deserializes an entry.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if a known entry is malformed.
    pub fn decode(payload: &[u8]) -> Result<Decoded, String> {
        let Some((&tag, body)) = payload.split_first() else {
            return Err("empty entry".to_string());
        };
        let Some(tag) = EntryTag::from_byte(tag) else {
            return Ok(Decoded::Unknown(tag));
        };

        let mut reader = Reader::new(body);
        let entry = match tag {
            EntryTag::LeafCheckpoint => {
                let right = reader.address()?;
                let ghosts = reader.usize()?;
                let count = reader.usize()?;
                let mut records = Vec::with_capacity(count.min(body.len()));
                for _ in 0..count {
                    records.push(reader.bytes()?);
                }
                Self::Checkpoint(Checkpoint::Leaf {
                    right,
                    ghosts,
                    records,
                })
            }

            EntryTag::BranchCheckpoint => {
                let count = reader.usize()?;
                let mut children = Vec::with_capacity(count.min(body.len()));
                for _ in 0..count {
                    let address = Address(reader.u64()?);
                    let pivot = match reader.u8()? {
                        0 => None,
                        1 => Some(reader.bytes()?),
                        flag => return Err(format!("invalid pivot flag {flag}")),
                    };
                    children.push(Child { pivot, address });
                }
                Self::Checkpoint(Checkpoint::Branch { children })
            }

            EntryTag::Insert => {
                let index = reader.usize()?;
                let record = reader.bytes()?;
                Self::Insert { index, record }
            }

            EntryTag::Delete => Self::Delete {
                index: reader.usize()?,
            },

            EntryTag::Right => Self::Right(reader.address()?),
        };

        if !reader.is_empty() {
            return Err(format!(
                "trailing bytes in {tag:?} entry: {} unread",
                reader.remaining()
            ));
        }
        Ok(Decoded::Entry(entry))
    }
}

fn put_usize(buf: &mut Vec<u8>, value: usize) {
    buf.extend_from_slice(&(value as u64).to_le_bytes());
}

fn put_address(buf: &mut Vec<u8>, address: Option<Address>) {
    buf.extend_from_slice(&address.map_or(0, Address::as_u64).to_le_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_usize(buf, bytes.len());
    buf.extend_from_slice(bytes);
}

struct Reader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, cursor: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], String> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| "unexpected end of entry".to_string())?;
        let slice = &self.bytes[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64, String> {
        let bytes: [u8; 8] = self
            .take(8)?
            .try_into()
            .map_err(|_| "invalid u64".to_string())?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn usize(&mut self) -> Result<usize, String> {
        let value = self.u64()?;
        usize::try_from(value).map_err(|_| format!("length {value} out of range"))
    }

    fn address(&mut self) -> Result<Option<Address>, String> {
        Ok(Some(self.u64()?).filter(|&raw| raw != 0).map(Address))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, String> {
        let len = self.usize()?;
        Ok(self.take(len)?.to_vec())
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

/// Rebuilds a page by folding its log entries, in order, into an empty page.
///
/// Unknown entry kinds are skipped.
///
/// # Errors
///
/// Returns a replay error for a malformed or structurally invalid entry.
pub fn replay(address: Address, lines: &[Vec<u8>], extract: Extract<'_>) -> CoreResult<Page> {
    lines
        .iter()
        .try_fold(Page::empty(address.kind()), |mut page, line| {
            match LogEntry::decode(line).map_err(|message| CoreError::replay(address, message))? {
                Decoded::Entry(entry) => page.apply(address, entry, extract)?,
                Decoded::Unknown(tag) => {
                    warn!(%address, tag, "skipping unknown log entry");
                }
            }
            Ok(page)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Leaf;
    use proptest::prelude::*;

    fn identity(record: &[u8]) -> Vec<u8> {
        record.to_vec()
    }

    fn entry(bytes: &[u8]) -> LogEntry {
        match LogEntry::decode(bytes).unwrap() {
            Decoded::Entry(entry) => entry,
            Decoded::Unknown(tag) => panic!("unknown tag {tag}"),
        }
    }

    fn leaf_records(page: &Page) -> Vec<&[u8]> {
        page.as_leaf()
            .unwrap()
            .live()
            .iter()
            .map(|item| item.record.as_slice())
            .collect()
    }

    #[test]
    fn tag_roundtrip() {
        for tag in [
            EntryTag::LeafCheckpoint,
            EntryTag::BranchCheckpoint,
            EntryTag::Insert,
            EntryTag::Delete,
            EntryTag::Right,
        ] {
            assert_eq!(EntryTag::from_byte(tag.as_byte()), Some(tag));
        }
        assert_eq!(EntryTag::from_byte(0), None);
    }

    #[test]
    fn branch_checkpoint_keeps_pivots() {
        let original = LogEntry::Checkpoint(Checkpoint::Branch {
            children: vec![
                Child {
                    pivot: None,
                    address: Address(1),
                },
                Child {
                    pivot: Some(b"m".to_vec()),
                    address: Address(3),
                },
            ],
        });
        assert_eq!(entry(&original.encode()), original);
    }

    #[test]
    fn right_zero_is_edge() {
        let encoded = LogEntry::Right(None).encode();
        assert_eq!(encoded, [5, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(entry(&encoded), LogEntry::Right(None));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let encoded = LogEntry::Insert {
            index: 0,
            record: b"abc".to_vec(),
        }
        .encode();
        let err = LogEntry::decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert_eq!(err, "unexpected end of entry");
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut encoded = LogEntry::Delete { index: 2 }.encode();
        encoded.push(0);
        let err = LogEntry::decode(&encoded).unwrap_err();
        assert!(err.contains("trailing bytes"));
    }

    #[test]
    fn replay_folds_in_order() {
        let lines: Vec<Vec<u8>> = vec![
            LogEntry::Checkpoint(Checkpoint::Leaf {
                right: None,
                ghosts: 0,
                records: vec![b"a".to_vec(), b"c".to_vec(), b"d".to_vec()],
            })
            .encode(),
            LogEntry::Insert {
                index: 1,
                record: b"b".to_vec(),
            }
            .encode(),
            LogEntry::Delete { index: 3 }.encode(),
            LogEntry::Right(Some(Address(5))).encode(),
        ];

        let page = replay(Address::LEFTMOST, &lines, &identity).unwrap();
        assert_eq!(leaf_records(&page), vec![&b"a"[..], b"b", b"c"]);
        assert_eq!(page.as_leaf().unwrap().right, Some(Address(5)));
    }

    #[test]
    fn checkpoint_resets_the_fold() {
        let lines: Vec<Vec<u8>> = vec![
            LogEntry::Insert {
                index: 0,
                record: b"old".to_vec(),
            }
            .encode(),
            LogEntry::Checkpoint(Checkpoint::Leaf {
                right: None,
                ghosts: 1,
                records: vec![b"g".to_vec(), b"h".to_vec()],
            })
            .encode(),
        ];

        let page = replay(Address(3), &lines, &identity).unwrap();
        let leaf = page.as_leaf().unwrap();
        assert_eq!(leaf.ghosts, 1);
        assert_eq!(leaf_records(&page), vec![&b"h"[..]]);
    }

    #[test]
    fn replay_skips_unknown_entries() {
        let lines = vec![
            vec![0xEE, 1, 2, 3],
            LogEntry::Insert {
                index: 0,
                record: b"a".to_vec(),
            }
            .encode(),
        ];

        let page = replay(Address::LEFTMOST, &lines, &identity).unwrap();
        assert_eq!(leaf_records(&page), vec![&b"a"[..]]);
    }

    #[test]
    fn replay_fails_on_out_of_range_delete() {
        let lines = vec![LogEntry::Delete { index: 0 }.encode()];

        let err = replay(Address(3), &lines, &identity).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Replay {
                address: Address(3),
                ..
            }
        ));
    }

    #[test]
    fn replay_is_deterministic() {
        let lines: Vec<Vec<u8>> = (0..20u8)
            .map(|i| {
                LogEntry::Insert {
                    index: 0,
                    record: vec![b'z' - i],
                }
                .encode()
            })
            .collect();

        let first = replay(Address::LEFTMOST, &lines, &identity).unwrap();
        let second = replay(Address::LEFTMOST, &lines, &identity).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_leaf().map(Leaf::live_len), Some(20));
    }

    fn deletes_at_the_boundary(address: Address, n: usize, k: usize) -> Leaf {
        let mut lines: Vec<Vec<u8>> = (0..n)
            .map(|i| {
                LogEntry::Insert {
                    index: i,
                    record: format!("r{i:02}").into_bytes(),
                }
                .encode()
            })
            .collect();
        let leftmost = address == Address::LEFTMOST;
        lines.extend((0..k).map(|i| {
            LogEntry::Delete {
                index: if leftmost { 0 } else { i },
            }
            .encode()
        }));
        replay(address, &lines, &identity)
            .unwrap()
            .as_leaf()
            .cloned()
            .unwrap()
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = LogEntry::decode(&bytes);
        }

        #[test]
        fn boundary_deletes_grow_the_ghost_run(
            (n, k) in (1usize..20).prop_flat_map(|n| (Just(n), 0..=n))
        ) {
            let leaf = deletes_at_the_boundary(Address(3), n, k);
            prop_assert_eq!(leaf.ghosts, k);
            prop_assert_eq!(leaf.live_len(), n - k);

            let leftmost = deletes_at_the_boundary(Address::LEFTMOST, n, k);
            prop_assert_eq!(leftmost.ghosts, 0);
            prop_assert_eq!(leftmost.live_len(), n - k);
        }
    }
}
