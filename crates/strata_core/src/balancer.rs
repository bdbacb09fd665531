//! Structural maintenance.
//!
//! Cursors only ever change leaf content. The balancer reshapes the tree
//! afterwards, working from the set of leaves changed since the last run:
//!
//! 1. Exorcise: drop the ghosts of a leaf and raise its routing pivot to
//!    the new first key.
//! 2. Split a leaf past its thresholds into near-equal pieces, never
//!    separating equal keys.
//! 3. Merge a leaf with a sibling under the same parent when the two fit
//!    in one leaf.
//! 4. Split oversized branches, merge undersized sibling branches, and
//!    drain or fill the root, until nothing changes.
//!
//! A balance holds the structure lock exclusively, so no descent is in
//! flight, and takes page locks top-down then left to right. Every step
//! gathers the pages it rewrites and retires in one [`Batch`], so a crash
//! leaves either the whole step on disk or none of it.

use crate::error::{CoreError, CoreResult};
use crate::lock::{LockMode, PageGuard};
use crate::page::{Branch, Child, Item, Leaf, Page};
use crate::sheaf::Batch;
use crate::tree::Strata;
use crate::types::{Address, PageKind};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// What a balance did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceReport {
    /// Leaves split.
    pub splits: usize,
    /// Leaf pairs merged.
    pub merges: usize,
    /// Leaves whose ghosts were dropped.
    pub exorcisms: usize,
    /// Branches split.
    pub branch_splits: usize,
    /// Branch pairs merged.
    pub branch_merges: usize,
    /// Times the root was split into new children.
    pub root_drains: usize,
    /// Times the root absorbed its only child.
    pub root_fills: usize,
    /// Leaves over a threshold whose records all share one key.
    pub unsplittable: usize,
}

impl BalanceReport {
    /// Number of structural changes made.
    #[must_use]
    pub fn changes(&self) -> usize {
        self.splits
            + self.merges
            + self.exorcisms
            + self.branch_splits
            + self.branch_merges
            + self.root_drains
            + self.root_fills
    }

    /// Returns `true` if the balance changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes() == 0
    }
}

enum BranchStep {
    Split(Address),
    Merge { left: Address, right: Address },
    Fill(Address),
}

pub(crate) struct Balancer<'a> {
    tree: &'a Strata,
    parents: HashMap<Address, Address>,
    work: BTreeSet<Address>,
    report: BalanceReport,
}

impl<'a> Balancer<'a> {
    pub(crate) fn new(tree: &'a Strata) -> Self {
        Self {
            tree,
            parents: HashMap::new(),
            work: BTreeSet::new(),
            report: BalanceReport::default(),
        }
    }

    pub(crate) fn run(mut self) -> CoreResult<BalanceReport> {
        self.parents = self.map_parents()?;

        self.work = self.tree.sheaf.take_dirty();
        debug!(leaves = self.work.len(), "balancing");

        // branch merges bring leaves from different parents together, so
        // the leaf pass runs again until no new neighbours appear
        loop {
            self.balance_leaves()?;
            while let Some(step) = self.next_branch_step()? {
                match step {
                    BranchStep::Split(address) => self.split_branch(address)?,
                    BranchStep::Merge { left, right } => self.merge_branches(left, right)?,
                    BranchStep::Fill(child) => self.fill_root(child)?,
                }
            }
            if self.work.is_empty() {
                break;
            }
        }

        let report = self.report;
        info!(
            splits = report.splits,
            merges = report.merges,
            exorcisms = report.exorcisms,
            branch_splits = report.branch_splits,
            branch_merges = report.branch_merges,
            root_drains = report.root_drains,
            root_fills = report.root_fills,
            unsplittable = report.unsplittable,
            "balanced"
        );
        Ok(report)
    }

    fn lock(&self, addresses: &[Address]) -> Vec<PageGuard<'a>> {
        let tree = self.tree;
        addresses
            .iter()
            .map(|&address| tree.locks.acquire(address, LockMode::Exclusive))
            .collect()
    }

    fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        self.tree.options().compare(a, b) == Ordering::Equal
    }

    fn leaf(&self, address: Address) -> CoreResult<Leaf> {
        let page = self.tree.sheaf.load(address)?;
        let page = page.read();
        page.as_leaf()
            .cloned()
            .ok_or_else(|| CoreError::invalid_format(format!("page {address} is not a leaf")))
    }

    fn branch(&self, address: Address) -> CoreResult<Branch> {
        let page = self.tree.sheaf.load(address)?;
        let page = page.read();
        page.as_branch()
            .cloned()
            .ok_or_else(|| CoreError::invalid_format(format!("page {address} is not a branch")))
    }

    fn parent(&self, address: Address) -> CoreResult<Address> {
        self.parents
            .get(&address)
            .copied()
            .ok_or_else(|| CoreError::invalid_format(format!("page {address} has no parent")))
    }

    fn position(branch: &Branch, parent: Address, child: Address) -> CoreResult<usize> {
        branch.position(child).ok_or_else(|| {
            CoreError::invalid_format(format!("branch {parent} does not reference {child}"))
        })
    }

    fn map_parents(&self) -> CoreResult<HashMap<Address, Address>> {
        let mut parents = HashMap::new();
        let mut stack = vec![Address::ROOT];
        while let Some(address) = stack.pop() {
            for child in self.branch(address)?.children {
                parents.insert(child.address, address);
                if child.address.is_branch() {
                    stack.push(child.address);
                }
            }
        }
        Ok(parents)
    }

    fn balance_leaves(&mut self) -> CoreResult<()> {
        while let Some(address) = self.work.pop_first() {
            if !self.parents.contains_key(&address) {
                continue;
            }
            if let Err(e) = self.balance_leaf(address) {
                self.tree.sheaf.mark_dirty(address);
                for pending in std::mem::take(&mut self.work) {
                    self.tree.sheaf.mark_dirty(pending);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn balance_leaf(&mut self, address: Address) -> CoreResult<()> {
        if self.exorcise(address)? {
            self.report.exorcisms += 1;
        }

        let parent = self.parent(address)?;
        let guards = self.lock(&[parent, address]);
        let leaf = self.leaf(address)?;
        let options = self.tree.options();
        if options.leaf_overflows(leaf.live_len(), leaf.live_heft()) {
            match self.split_points(&leaf) {
                Some(points) => {
                    let pieces = self.split_leaf(parent, address, leaf, &points)?;
                    self.report.splits += 1;
                    self.work.insert(address);
                    self.work.extend(pieces);
                }
                None => {
                    warn!(%address, records = leaf.live_len(), "leaf cannot be split");
                    self.report.unsplittable += 1;
                }
            }
            return Ok(());
        }
        drop(guards);

        if let Some(survivor) = self.merge_leaf(address)? {
            self.report.merges += 1;
            self.work.insert(survivor);
        }
        Ok(())
    }

    /// Branch and index of the pivot that routes to `address`.
    fn routing_pivot(&self, address: Address) -> CoreResult<(Address, usize)> {
        let mut child = address;
        loop {
            let parent = self.parent(child)?;
            let index = Self::position(&self.branch(parent)?, parent, child)?;
            if index > 0 {
                return Ok((parent, index));
            }
            if parent == Address::ROOT {
                return Err(CoreError::invalid_format(format!(
                    "leaf {address} is left-most but is not page {}",
                    Address::LEFTMOST
                )));
            }
            child = parent;
        }
    }

    fn exorcise(&mut self, address: Address) -> CoreResult<bool> {
        if address == Address::LEFTMOST {
            return Ok(false);
        }
        let (ancestor, index) = self.routing_pivot(address)?;
        let _guards = self.lock(&[ancestor, address]);

        let mut leaf = self.leaf(address)?;
        if leaf.ghosts == 0 || (leaf.ghosts == 1 && leaf.items.len() == 1) {
            return Ok(false);
        }

        if leaf.live_len() == 0 {
            // an empty leaf keeps one ghost as its anchor
            leaf.items.truncate(1);
            leaf.ghosts = 1;
            self.tree.sheaf.checkpoint(address, Page::Leaf(leaf))?;
            debug!(%address, "trimmed ghosts of empty leaf");
            return Ok(true);
        }

        leaf.items.drain(..leaf.ghosts);
        leaf.ghosts = 0;
        let mut branch = self.branch(ancestor)?;
        branch.children[index].pivot = Some(leaf.items[0].key.clone());

        let mut batch = Batch::new();
        batch.checkpoint(address, Page::Leaf(leaf));
        batch.checkpoint(ancestor, Page::Branch(branch));
        self.tree.sheaf.commit(batch)?;
        debug!(%address, %ancestor, "exorcised leaf");
        Ok(true)
    }

    /// Split boundaries within the live items, or `None` if every boundary
    /// would separate equal keys.
    fn split_points(&self, leaf: &Leaf) -> Option<Vec<usize>> {
        let live = leaf.live();
        let n = live.len();
        if n < 2 {
            return None;
        }
        let pieces = n.div_ceil(self.tree.options().leaf_size).clamp(2, n);
        let splits_equal = |p: usize| self.equal(&live[p - 1].key, &live[p].key);

        let mut points: Vec<usize> = Vec::new();
        for i in 1..pieces {
            let ideal = i * n / pieces;
            let forward = (ideal..n).find(|&p| p > 0 && !splits_equal(p));
            let backward = (1..=ideal).rev().find(|&p| !splits_equal(p));
            let Some(point) = forward.or(backward) else {
                continue;
            };
            if points.last().is_none_or(|&last| point > last) {
                points.push(point);
            }
        }
        (!points.is_empty()).then_some(points)
    }

    fn split_leaf(
        &mut self,
        parent: Address,
        address: Address,
        mut leaf: Leaf,
        points: &[usize],
    ) -> CoreResult<Vec<Address>> {
        let tree = self.tree;
        let sheaf = &tree.sheaf;
        let mut live = leaf.items.split_off(leaf.ghosts);

        let mut pieces: Vec<Vec<Item>> = Vec::with_capacity(points.len());
        for &point in points.iter().rev() {
            pieces.push(live.split_off(point));
        }
        pieces.reverse();
        let addresses: Vec<Address> = pieces
            .iter()
            .map(|_| sheaf.allocate(PageKind::Leaf))
            .collect();

        let mut batch = Batch::new();
        let mut right = leaf.right;
        for (piece, &new) in pieces.iter().zip(&addresses).rev() {
            let page = Leaf {
                items: piece.clone(),
                ghosts: 0,
                right,
            };
            batch.checkpoint(new, Page::Leaf(page));
            right = Some(new);
        }

        let mut branch = self.branch(parent)?;
        let at = Self::position(&branch, parent, address)?;
        for (offset, (piece, &new)) in pieces.iter().zip(&addresses).enumerate() {
            branch.children.insert(
                at + 1 + offset,
                Child {
                    pivot: Some(piece[0].key.clone()),
                    address: new,
                },
            );
        }
        batch.checkpoint(parent, Page::Branch(branch));

        leaf.items.extend(live);
        leaf.right = right;
        batch.checkpoint(address, Page::Leaf(leaf));
        sheaf.commit(batch)?;

        for &new in &addresses {
            self.parents.insert(new, parent);
        }
        debug!(%address, pieces = addresses.len() + 1, "split leaf");
        Ok(addresses)
    }

    fn merge_leaf(&mut self, address: Address) -> CoreResult<Option<Address>> {
        let parent = self.parent(address)?;
        let branch = self.branch(parent)?;
        let at = Self::position(&branch, parent, address)?;

        let mut pairs = Vec::with_capacity(2);
        if let Some(right) = branch.children.get(at + 1) {
            pairs.push((address, right.address, at + 1));
        }
        if at > 0 {
            pairs.push((branch.children[at - 1].address, address, at));
        }

        for (left, right, right_index) in pairs {
            let _guards = self.lock(&[parent, left, right]);
            let left_leaf = self.leaf(left)?;
            let right_leaf = self.leaf(right)?;
            let count = left_leaf.live_len() + right_leaf.live_len();
            let heft = left_leaf.live_heft() + right_leaf.live_heft();
            if !self.tree.options().leaf_fits(count, heft) {
                continue;
            }
            self.merge_pair(parent, branch, (left, left_leaf), (right, right_leaf), right_index)?;
            return Ok(Some(left));
        }
        Ok(None)
    }

    fn merge_pair(
        &mut self,
        parent: Address,
        mut branch: Branch,
        (left, mut left_leaf): (Address, Leaf),
        (right, mut right_leaf): (Address, Leaf),
        right_index: usize,
    ) -> CoreResult<()> {
        left_leaf
            .items
            .extend(right_leaf.items.split_off(right_leaf.ghosts));
        left_leaf.right = right_leaf.right;
        branch.children.remove(right_index);

        let mut batch = Batch::new();
        batch.checkpoint(left, Page::Leaf(left_leaf));
        batch.checkpoint(parent, Page::Branch(branch));
        batch.retire(right);
        self.tree.sheaf.commit(batch)?;
        self.parents.remove(&right);
        debug!(%left, %right, "merged leaves");
        Ok(())
    }

    fn depth(&self, address: Address) -> usize {
        let mut depth = 0;
        let mut current = address;
        while let Some(&parent) = self.parents.get(&current) {
            depth += 1;
            current = parent;
        }
        depth
    }

    /// The next branch change, deepest first.
    fn next_branch_step(&self) -> CoreResult<Option<BranchStep>> {
        let branch_size = self.tree.options().branch_size;
        let mut branches: Vec<Address> = self
            .parents
            .keys()
            .copied()
            .filter(|address| address.is_branch())
            .chain(std::iter::once(Address::ROOT))
            .collect();
        branches.sort_by_key(|&address| (std::cmp::Reverse(self.depth(address)), address));

        for &address in &branches {
            if self.branch(address)?.children.len() > branch_size {
                return Ok(Some(BranchStep::Split(address)));
            }
        }

        for &address in &branches {
            let branch = self.branch(address)?;
            for pair in branch.children.windows(2) {
                let (left, right) = (pair[0].address, pair[1].address);
                if left.is_leaf() {
                    break;
                }
                let combined =
                    self.branch(left)?.children.len() + self.branch(right)?.children.len();
                if combined <= branch_size {
                    return Ok(Some(BranchStep::Merge { left, right }));
                }
            }
        }

        let root = self.branch(Address::ROOT)?;
        if let [only] = root.children.as_slice() {
            if only.address.is_branch() {
                return Ok(Some(BranchStep::Fill(only.address)));
            }
        }
        Ok(None)
    }

    fn split_branch(&mut self, address: Address) -> CoreResult<()> {
        let parent = if address == Address::ROOT {
            None
        } else {
            Some(self.parent(address)?)
        };
        let _guards = match parent {
            Some(parent) => self.lock(&[parent, address]),
            None => self.lock(&[address]),
        };

        let mut branch = self.branch(address)?;
        let n = branch.children.len();
        let pieces = n.div_ceil(self.tree.options().branch_size).max(2);
        let mut groups: Vec<Vec<Child>> = Vec::with_capacity(pieces);
        for i in (1..pieces).rev() {
            groups.push(branch.children.split_off(i * n / pieces));
        }
        groups.push(branch.children);
        groups.reverse();

        // each group's first pivot becomes its separator in the parent
        let separated: Vec<(Option<Vec<u8>>, Vec<Child>)> = groups
            .into_iter()
            .map(|mut group| (group[0].pivot.take(), group))
            .collect();

        let mut batch = Batch::new();
        match parent {
            Some(parent) => self.split_child_branch(&mut batch, parent, address, separated)?,
            None => self.drain_root(&mut batch, separated),
        }
        self.tree.sheaf.commit(batch)?;
        debug!(%address, children = n, "split branch");
        Ok(())
    }

    fn write_branches(
        &mut self,
        batch: &mut Batch,
        parent: Address,
        groups: Vec<(Option<Vec<u8>>, Vec<Child>)>,
    ) -> Vec<Child> {
        let mut written = Vec::with_capacity(groups.len());
        for (separator, group) in groups {
            let new = self.tree.sheaf.allocate(PageKind::Branch);
            for child in &group {
                self.parents.insert(child.address, new);
            }
            batch.checkpoint(new, Page::Branch(Branch { children: group }));
            self.parents.insert(new, parent);
            written.push(Child {
                pivot: separator,
                address: new,
            });
        }
        written
    }

    fn drain_root(&mut self, batch: &mut Batch, groups: Vec<(Option<Vec<u8>>, Vec<Child>)>) {
        let children = self.write_branches(batch, Address::ROOT, groups);
        batch.checkpoint(Address::ROOT, Page::Branch(Branch { children }));
        self.report.root_drains += 1;
    }

    fn split_child_branch(
        &mut self,
        batch: &mut Batch,
        parent: Address,
        address: Address,
        mut groups: Vec<(Option<Vec<u8>>, Vec<Child>)>,
    ) -> CoreResult<()> {
        let (_, first) = groups.remove(0);
        let inserted = self.write_branches(batch, parent, groups);

        let mut parent_branch = self.branch(parent)?;
        let at = Self::position(&parent_branch, parent, address)?;
        for (offset, child) in inserted.into_iter().enumerate() {
            parent_branch.children.insert(at + 1 + offset, child);
        }
        batch.checkpoint(parent, Page::Branch(parent_branch));
        batch.checkpoint(address, Page::Branch(Branch { children: first }));
        self.report.branch_splits += 1;
        Ok(())
    }

    fn merge_branches(&mut self, left: Address, right: Address) -> CoreResult<()> {
        let parent = self.parent(left)?;
        let _guards = self.lock(&[parent, left, right]);

        let mut parent_branch = self.branch(parent)?;
        let right_index = Self::position(&parent_branch, parent, right)?;
        let separator = parent_branch.children[right_index].pivot.clone();

        let mut merged = self.branch(left)?;
        let mut absorbed = self.branch(right)?.children;
        if let Some(head) = absorbed.first_mut() {
            head.pivot = separator;
        }
        for child in &absorbed {
            self.parents.insert(child.address, left);
        }
        if let Some(first) = absorbed.first().filter(|child| child.address.is_leaf()) {
            // now a leaf neighbour of the last child of `left`
            self.work.insert(first.address);
        }
        merged.children.extend(absorbed);
        parent_branch.children.remove(right_index);

        let mut batch = Batch::new();
        batch.checkpoint(left, Page::Branch(merged));
        batch.checkpoint(parent, Page::Branch(parent_branch));
        batch.retire(right);
        self.tree.sheaf.commit(batch)?;
        self.parents.remove(&right);
        self.report.branch_merges += 1;
        debug!(%left, %right, "merged branches");
        Ok(())
    }

    fn fill_root(&mut self, child: Address) -> CoreResult<()> {
        let _guards = self.lock(&[Address::ROOT, child]);

        let branch = self.branch(child)?;
        let grandchildren: Vec<Address> = branch.children.iter().map(|c| c.address).collect();

        let mut batch = Batch::new();
        batch.checkpoint(Address::ROOT, Page::Branch(branch));
        batch.retire(child);
        self.tree.sheaf.commit(batch)?;

        for grandchild in grandchildren {
            self.parents.insert(grandchild, Address::ROOT);
        }
        self.parents.remove(&child);
        self.report.root_fills += 1;
        debug!(%child, "filled root");
        Ok(())
    }
}
