//! Core type definitions for Strata.

use std::fmt;

/// Address of a page.
///
/// Addresses are allocated monotonically and never reused. Branch pages
/// have even addresses and leaf pages odd ones, so the kind of a page is
/// known before it is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub u64);

impl Address {
    /// The root branch.
    pub const ROOT: Self = Self(0);

    /// The left-most leaf. It is never retired.
    pub const LEFTMOST: Self = Self(1);

    /// Returns the raw address value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` for leaf addresses.
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        self.0 % 2 == 1
    }

    /// Returns `true` for branch addresses.
    #[must_use]
    pub const fn is_branch(self) -> bool {
        !self.is_leaf()
    }

    /// Returns the kind of page at this address.
    #[must_use]
    pub const fn kind(self) -> PageKind {
        if self.is_leaf() {
            PageKind::Leaf
        } else {
            PageKind::Branch
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two kinds of page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    /// Holds records.
    Leaf,
    /// Holds pivots and child addresses.
    Branch,
}
