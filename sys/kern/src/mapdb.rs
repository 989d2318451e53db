// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The mapping database.
//!
//! Every physical frame that has been handed on from its owner to another
//! address space gets a *mapping tree*. The root of the tree is the owner's
//! page-table entry for the frame. Each other node is a mapping derived from
//! its parent by `map`. Unmapping a node therefore knows exactly which
//! mappings were derived from it, and can take those away too.
//!
//! Frames that were never passed on have no tree at all: the root is created
//! lazily from the owner's page-table entry when the first child shows up, and
//! dropped again when the last child goes away.
//!
//! Nodes live in a fixed-capacity arena and refer to each other by handle:
//!
//! - `parent` points one level up, and is `None` only for roots;
//! - `children` is an intrusive list threaded through the children's
//!   `siblings` links;
//! - `depth` is 0 for roots and one more than the parent's otherwise.
//!
//! A node never covers more physical memory than its parent, and never holds
//! rights its parent lacks. `MapDb::check` verifies all of this.
//!
//! The page tables of the affected address spaces are kept in step through
//! `AddressSpaceOps`: every node owns exactly one page-table entry. Roots are
//! the exception only in that removing the *bookkeeping* for a root leaves the
//! owner's entry alone.

use core::fmt;

use abi::Rights;
use kerncore::{Adapter, Arena, Handle, Links, List};

use crate::fail::{self, OrDie};
use crate::space::{AddressSpaceOps, SpaceHandle, SpaceTable, Translation};
use crate::startup::{MAX_MAPPINGS, PAGE_SHIFT, PHYS_FRAMES, SUPERPAGE_SHIFT};

pub type NodeHandle = Handle<Node>;

/// Deepest a mapping tree may grow. Mappings beyond this are refused.
pub const MAX_DEPTH: u8 = 252;

/// Reasons the database can refuse a mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MapDbError {
    /// No node storage left.
    NoMemory,
    /// The receiving space already maps this memory somewhere else, or the
    /// mapping would make a space its own ancestor.
    Conflict,
    /// The tree would grow deeper than `MAX_DEPTH`.
    TooDeep,
    /// The mapping space holds no (or too small a) mapping of the frame.
    NoParent,
    /// Size or alignment not supported by the page tables.
    BadRegion,
}

/// One mapping of a (super)page into one address space.
#[derive(Debug)]
pub struct Node {
    phys: u32,
    size_log2: u8,
    space: SpaceHandle,
    virt: u32,
    rights: Rights,
    depth: u8,
    parent: Option<NodeHandle>,
    children: List<Node, Siblings>,
    siblings: Links<Node>,
}

impl Node {
    pub fn phys(&self) -> u32 {
        self.phys
    }

    pub fn size_log2(&self) -> u8 {
        self.size_log2
    }

    pub fn size(&self) -> u64 {
        1 << self.size_log2
    }

    pub fn space(&self) -> SpaceHandle {
        self.space
    }

    pub fn virt(&self) -> u32 {
        self.virt
    }

    pub fn rights(&self) -> Rights {
        self.rights
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn parent(&self) -> Option<NodeHandle> {
        self.parent
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    fn phys_end(&self) -> u64 {
        u64::from(self.phys) + self.size()
    }

    fn covers_phys(&self, phys: u32) -> bool {
        let p = u64::from(phys);
        p >= u64::from(self.phys) && p < self.phys_end()
    }

    fn overlaps_phys(&self, phys: u32, size_log2: u8) -> bool {
        let start = u64::from(phys);
        let end = start + (1u64 << size_log2);
        start < self.phys_end() && u64::from(self.phys) < end
    }
}

/// List adapter for a node's place among its siblings.
pub struct Siblings;

impl Adapter<Node> for Siblings {
    fn links(item: &Node) -> &Links<Node> {
        &item.siblings
    }

    fn links_mut(item: &mut Node) -> &mut Links<Node> {
        &mut item.siblings
    }
}

type ChildList = List<Node, Siblings>;

/// A request to derive a new mapping from an existing one.
#[derive(Copy, Clone, Debug)]
pub struct MapRequest {
    /// Physical address of the first byte being mapped.
    pub phys: u32,
    pub parent_space: SpaceHandle,
    /// Where `phys` appears in the parent space.
    pub parent_virt: u32,
    pub child_space: SpaceHandle,
    /// Where `phys` will appear in the child space.
    pub child_virt: u32,
    pub size_log2: u8,
    pub rights: Rights,
}

impl MapRequest {
    fn size(&self) -> u64 {
        1 << self.size_log2
    }
}

/// Outcome of validating a `MapRequest`, before anything has changed.
#[derive(Copy, Clone, Debug)]
enum Prepared {
    /// The exact mapping exists already; only its rights grow.
    Upgrade(NodeHandle, Rights),
    /// A new node hangs off an existing one.
    Child {
        parent: NodeHandle,
        depth: u8,
        rights: Rights,
    },
    /// A new node hangs off a root that must first be made from the parent's
    /// page-table entry.
    ChildOfNewRoot { root: Translation, rights: Rights },
}

impl Prepared {
    fn nodes_needed(&self) -> usize {
        match self {
            Prepared::Upgrade(..) => 0,
            Prepared::Child { .. } => 1,
            Prepared::ChildOfNewRoot { .. } => 2,
        }
    }
}

/// A broken tree invariant, as reported by `MapDb::check`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Violation {
    pub node: NodeHandle,
    pub problem: &'static str,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mapping {:?}: {}", self.node, self.problem)
    }
}

pub struct MapDb {
    nodes: Arena<Node, MAX_MAPPINGS>,
    /// Tree roots, by the root's first frame number.
    roots: [Option<NodeHandle>; PHYS_FRAMES],
}

impl Default for MapDb {
    fn default() -> Self {
        Self::new()
    }
}

fn frame_of(phys: u32) -> usize {
    (phys >> PAGE_SHIFT) as usize
}

fn is_supported_size(size_log2: u8) -> bool {
    size_log2 == PAGE_SHIFT || size_log2 == SUPERPAGE_SHIFT
}

fn is_aligned(addr: u32, size_log2: u8) -> bool {
    u64::from(addr) % (1u64 << size_log2) == 0
}

impl MapDb {
    pub fn new() -> Self {
        Self {
            nodes: Arena::new(),
            roots: [None; PHYS_FRAMES],
        }
    }

    pub fn node(&self, h: NodeHandle) -> Option<&Node> {
        self.nodes.get(h)
    }

    /// Number of nodes in use, roots included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn free_slots(&self) -> usize {
        self.nodes.free_slots()
    }

    /// Children of `h`, oldest first.
    pub fn children(&self, h: NodeHandle) -> impl Iterator<Item = NodeHandle> + '_ {
        let kids = self.nodes.get(h).map(|n| n.children).unwrap_or_default();
        kids.iter(&self.nodes)
    }

    /// All nodes owned by `space`, in no particular order.
    pub fn nodes_of(
        &self,
        space: SpaceHandle,
    ) -> impl Iterator<Item = NodeHandle> + '_ {
        self.nodes
            .iter()
            .filter(move |(_, n)| n.space == space)
            .map(|(h, _)| h)
    }

    /// Finds the root of the tree covering `phys`, if that frame has one.
    pub fn tree_for(&self, phys: u32) -> Option<NodeHandle> {
        let covering = |frame: usize| {
            let r = self.roots.get(frame).copied().flatten()?;
            self.nodes[r].covers_phys(phys).then_some(r)
        };
        covering(frame_of(phys)).or_else(|| {
            let sp = phys & !((1u32 << SUPERPAGE_SHIFT) - 1);
            covering(frame_of(sp))
        })
    }

    /// Walks the subtree under `top` in pre-order, starting at `top`.
    pub fn subtree(&self, top: NodeHandle) -> Subtree<'_> {
        Subtree {
            db: self,
            top,
            next: self.nodes.contains(top).then_some(top),
        }
    }

    fn preorder_next(
        &self,
        top: NodeHandle,
        cur: NodeHandle,
    ) -> Option<NodeHandle> {
        if let Some(c) = self.nodes[cur].children.front() {
            return Some(c);
        }
        let mut n = cur;
        loop {
            if n == top {
                return None;
            }
            if let Some(s) = ChildList::next(&self.nodes, n) {
                return Some(s);
            }
            n = self.nodes[n].parent.or_die("mapping tree lost a parent");
        }
    }

    /// Finds the node through which `space` maps `phys` at `virt`.
    pub fn lookup(
        &self,
        phys: u32,
        space: SpaceHandle,
        virt: u32,
    ) -> Option<NodeHandle> {
        let root = self.tree_for(phys)?;
        self.subtree(root).find(|&h| {
            let n = &self.nodes[h];
            n.space == space
                && n.covers_phys(phys)
                && virt >= n.virt
                && u64::from(virt - n.virt) < n.size()
                && (virt - n.virt) >> PAGE_SHIFT
                    == (phys - n.phys) >> PAGE_SHIFT
        })
    }

    /// The node of `space` in the tree under `root` that overlaps the given
    /// physical range, if any. Within one tree a space holds each byte at
    /// most once, so there is at most one such node per byte.
    fn overlapping_in_tree(
        &self,
        root: NodeHandle,
        space: SpaceHandle,
        phys: u32,
        size_log2: u8,
        except: Option<NodeHandle>,
    ) -> Option<NodeHandle> {
        self.subtree(root).find(|&h| {
            let n = &self.nodes[h];
            Some(h) != except
                && n.space == space
                && n.overlaps_phys(phys, size_log2)
        })
    }

    fn prepare(
        &self,
        spaces: &SpaceTable,
        req: &MapRequest,
    ) -> Result<Prepared, MapDbError> {
        if !is_supported_size(req.size_log2)
            || !is_aligned(req.phys, req.size_log2)
            || !is_aligned(req.parent_virt, req.size_log2)
            || !is_aligned(req.child_virt, req.size_log2)
        {
            return Err(MapDbError::BadRegion);
        }

        let parent_space =
            spaces.get(req.parent_space).ok_or(MapDbError::NoParent)?;
        let child_space =
            spaces.get(req.child_space).ok_or(MapDbError::Conflict)?;

        let pte = parent_space
            .page_table()
            .lookup(req.parent_virt)
            .ok_or(MapDbError::NoParent)?;
        if pte.phys_for(req.parent_virt) != req.phys
            || u64::from(req.parent_virt) + req.size() > pte.end()
        {
            return Err(MapDbError::NoParent);
        }
        let rights = req.rights & pte.rights;

        let prepared = match self.tree_for(req.phys) {
            None => {
                if req.child_space == req.parent_space {
                    return Err(MapDbError::Conflict);
                }
                if frame_of(pte.phys) >= PHYS_FRAMES {
                    return Err(MapDbError::NoParent);
                }
                Prepared::ChildOfNewRoot { root: pte, rights }
            }
            Some(root) => {
                let parent = self
                    .lookup(req.phys, req.parent_space, req.parent_virt)
                    .ok_or(MapDbError::NoParent)?;
                let pn = &self.nodes[parent];
                if u64::from(req.phys) + req.size() > pn.phys_end() {
                    return Err(MapDbError::NoParent);
                }
                let rights = rights & pn.rights;

                // The child already holding any of this memory in the tree
                // covers both a second mapping and a cycle (an ancestor of
                // the parent overlaps the parent's range).
                if let Some(existing) = self.overlapping_in_tree(
                    root,
                    req.child_space,
                    req.phys,
                    req.size_log2,
                    None,
                ) {
                    let en = &self.nodes[existing];
                    if en.parent == Some(parent)
                        && en.virt == req.child_virt
                        && en.phys == req.phys
                        && en.size_log2 == req.size_log2
                    {
                        return Ok(Prepared::Upgrade(existing, rights));
                    }
                    return Err(MapDbError::Conflict);
                }

                if pn.depth >= MAX_DEPTH {
                    return Err(MapDbError::TooDeep);
                }
                Prepared::Child {
                    parent,
                    depth: pn.depth + 1,
                    rights,
                }
            }
        };

        let end = u64::from(req.child_virt) + req.size();
        if child_space
            .page_table()
            .next_mapping(req.child_virt, end)
            .is_some()
        {
            return Err(MapDbError::Conflict);
        }
        if self.nodes.free_slots() < prepared.nodes_needed() {
            return Err(MapDbError::NoMemory);
        }
        Ok(prepared)
    }

    /// Checks whether `insert(req)` would succeed, without changing anything.
    /// On success, returns the number of nodes the insertion would consume.
    pub fn check_insert(
        &self,
        spaces: &SpaceTable,
        req: &MapRequest,
    ) -> Result<usize, MapDbError> {
        self.prepare(spaces, req).map(|p| p.nodes_needed())
    }

    /// Derives a new mapping, entering it in the child's page table.
    ///
    /// On error nothing has changed.
    pub fn insert(
        &mut self,
        spaces: &mut SpaceTable,
        req: MapRequest,
    ) -> Result<NodeHandle, MapDbError> {
        let (parent, depth, rights) = match self.prepare(spaces, &req)? {
            Prepared::Upgrade(h, rights) => {
                let node = &mut self.nodes[h];
                let grown = node.rights | rights;
                if grown != node.rights {
                    node.rights = grown;
                    spaces[node.space]
                        .page_table_mut()
                        .protect(node.virt, grown)
                        .or_die("upgraded mapping has no page-table entry");
                }
                log::trace!("mapdb: upgraded {h:?} to {grown:?}");
                return Ok(h);
            }
            Prepared::Child {
                parent,
                depth,
                rights,
            } => (parent, depth, rights),
            Prepared::ChildOfNewRoot { root, rights } => {
                (self.make_root(req.parent_space, root), 1, rights)
            }
        };

        spaces[req.child_space]
            .page_table_mut()
            .map(req.child_virt, req.phys, req.size_log2, rights)
            .or_die("checked mapping refused by page table");
        let h = self
            .nodes
            .insert(Node {
                phys: req.phys,
                size_log2: req.size_log2,
                space: req.child_space,
                virt: req.child_virt,
                rights,
                depth,
                parent: Some(parent),
                children: List::new(),
                siblings: Links::new(),
            })
            .or_die("mapping storage ran out after check");
        self.link_child(parent, h);
        log::trace!(
            "mapdb: {h:?} maps {:#x} at {:#x} depth {depth}",
            req.phys,
            req.child_virt
        );
        Ok(h)
    }

    fn make_root(&mut self, owner: SpaceHandle, pte: Translation) -> NodeHandle {
        let h = self
            .nodes
            .insert(Node {
                phys: pte.phys,
                size_log2: pte.size_log2,
                space: owner,
                virt: pte.virt,
                rights: pte.rights,
                depth: 0,
                parent: None,
                children: List::new(),
                siblings: Links::new(),
            })
            .or_die("mapping storage ran out after check");
        self.roots[frame_of(pte.phys)] = Some(h);
        h
    }

    fn link_child(&mut self, parent: NodeHandle, child: NodeHandle) {
        let mut kids = self.nodes[parent].children;
        kids.push_back(&mut self.nodes, child);
        self.nodes[parent].children = kids;
    }

    fn unlink_child(&mut self, parent: NodeHandle, child: NodeHandle) {
        let mut kids = self.nodes[parent].children;
        if !kids.remove(&mut self.nodes, child) {
            fail::die("mapping missing from its parent's child list");
        }
        self.nodes[parent].children = kids;
    }

    /// Frees a childless node along with its page-table entry.
    fn remove_leaf(&mut self, spaces: &mut SpaceTable, h: NodeHandle) {
        let (space, virt, size_log2, parent, phys) = {
            let n = &self.nodes[h];
            (n.space, n.virt, n.size_log2, n.parent, n.phys)
        };
        spaces
            .get_mut(space)
            .or_die("mapping owned by a dead space")
            .page_table_mut()
            .unmap(virt, size_log2)
            .or_die("mapping has no page-table entry");
        match parent {
            Some(p) => self.unlink_child(p, h),
            None => self.roots[frame_of(phys)] = None,
        }
        self.nodes.remove(h);
        log::trace!("mapdb: removed {h:?} at {virt:#x}");
    }

    /// Drops the bookkeeping for a root that no longer has children. The
    /// owner's page-table entry is untouched.
    fn collapse_if_bare(&mut self, h: NodeHandle) {
        match self.nodes.get(h) {
            Some(n) if n.parent.is_none() && n.children.is_empty() => {
                self.roots[frame_of(n.phys)] = None;
                self.nodes.remove(h);
            }
            _ => (),
        }
    }

    /// Removes `top` and everything derived from it, leaves first. Every step
    /// leaves a well-formed tree behind.
    fn remove_subtree(&mut self, spaces: &mut SpaceTable, top: NodeHandle) {
        let mut cur = top;
        loop {
            if let Some(c) = self.nodes[cur].children.front() {
                cur = c;
                continue;
            }
            let up = self.nodes[cur].parent;
            self.remove_leaf(spaces, cur);
            if cur == top {
                break;
            }
            cur = up.or_die("mapping tree lost a parent");
        }
    }

    /// Removes `h`, handing its children to its parent.
    fn splice_out(&mut self, spaces: &mut SpaceTable, h: NodeHandle) {
        let p = self.nodes[h].parent.or_die("splicing out a root");
        while let Some(c) = self.nodes[h].children.front() {
            self.unlink_child(h, c);
            let mut kids = self.nodes[p].children;
            kids.insert_before(&mut self.nodes, h, c);
            self.nodes[p].children = kids;
            self.nodes[c].parent = Some(p);

            let mut cur = Some(c);
            while let Some(n) = cur {
                self.nodes[n].depth -= 1;
                cur = self.preorder_next(c, n);
            }
        }
        self.remove_leaf(spaces, h);
    }

    fn check_live(&self, h: NodeHandle) -> bool {
        if self.nodes.contains(h) {
            return true;
        }
        if cfg!(debug_assertions) {
            fail::die(format_args!("stale mapping handle {h:?}"));
        }
        false
    }

    /// Removes the mapping `h`.
    ///
    /// With `recursive`, everything derived from `h` goes too. Without it,
    /// `h`'s children move up to take its place, one level shallower. A root
    /// has nowhere to hand its children, so it is always removed recursively.
    pub fn unmap(
        &mut self,
        spaces: &mut SpaceTable,
        h: NodeHandle,
        recursive: bool,
    ) {
        if !self.check_live(h) {
            return;
        }
        let parent = self.nodes[h].parent;
        match parent {
            Some(_) if !recursive => self.splice_out(spaces, h),
            _ => self.remove_subtree(spaces, h),
        }
        if let Some(p) = parent {
            self.collapse_if_bare(p);
        }
    }

    /// Removes what was derived from `h`, leaving `h` itself in place.
    /// Without `recursive`, grandchildren move up to become children of `h`.
    pub fn revoke(
        &mut self,
        spaces: &mut SpaceTable,
        h: NodeHandle,
        recursive: bool,
    ) {
        if !self.check_live(h) {
            return;
        }
        let mut next = self.nodes[h].children.front();
        while let Some(c) = next {
            // Spliced grandchildren land before `after`, so they are skipped.
            let after = ChildList::next(&self.nodes, c);
            if recursive {
                self.remove_subtree(spaces, c);
            } else {
                self.splice_out(spaces, c);
            }
            next = after;
        }
        self.collapse_if_bare(h);
    }

    /// Removes every mapping owned by `space`, each with everything derived
    /// from it. Calling this again is harmless.
    pub fn flush(&mut self, spaces: &mut SpaceTable, space: SpaceHandle) {
        loop {
            let Some(h) = self.nodes_of(space).next() else {
                break;
            };
            self.unmap(spaces, h, true);
        }
    }

    /// Takes `rights` away from every mapping derived from `h`, and from `h`
    /// itself if `include_self`.
    pub fn downgrade(
        &mut self,
        spaces: &mut SpaceTable,
        h: NodeHandle,
        rights: Rights,
        include_self: bool,
    ) {
        if !self.check_live(h) {
            return;
        }
        let mut cur = if include_self {
            Some(h)
        } else {
            self.preorder_next(h, h)
        };
        while let Some(n) = cur {
            let node = &mut self.nodes[n];
            let reduced = node.rights - rights;
            if reduced != node.rights {
                node.rights = reduced;
                spaces
                    .get_mut(node.space)
                    .or_die("mapping owned by a dead space")
                    .page_table_mut()
                    .protect(node.virt, reduced)
                    .or_die("mapping has no page-table entry");
            }
            cur = self.preorder_next(h, n);
        }
    }

    /// Moves mapping `h` to `new_space` at `new_virt`. The node keeps its
    /// place in the tree, and so everything derived from it.
    pub fn grant(
        &mut self,
        spaces: &mut SpaceTable,
        h: NodeHandle,
        new_space: SpaceHandle,
        new_virt: u32,
    ) -> Result<(), MapDbError> {
        if !self.check_live(h) {
            return Err(MapDbError::NoParent);
        }
        let (old_space, old_virt, phys, size_log2, rights) = {
            let n = &self.nodes[h];
            (n.space, n.virt, n.phys, n.size_log2, n.rights)
        };
        if !is_aligned(new_virt, size_log2) {
            return Err(MapDbError::BadRegion);
        }
        let root = self.root_of(h);
        if self
            .overlapping_in_tree(root, new_space, phys, size_log2, Some(h))
            .is_some()
        {
            return Err(MapDbError::Conflict);
        }
        let target = spaces.get(new_space).ok_or(MapDbError::Conflict)?;
        let end = u64::from(new_virt) + (1u64 << size_log2);
        if target.page_table().next_mapping(new_virt, end).is_some() {
            return Err(MapDbError::Conflict);
        }

        spaces[old_space]
            .page_table_mut()
            .unmap(old_virt, size_log2)
            .or_die("granted mapping has no page-table entry");
        spaces[new_space]
            .page_table_mut()
            .map(new_virt, phys, size_log2, rights)
            .or_die("checked grant refused by page table");
        let n = &mut self.nodes[h];
        n.space = new_space;
        n.virt = new_virt;
        log::trace!("mapdb: granted {h:?} to {new_virt:#x}");
        Ok(())
    }

    /// Climbs from `h` to the root of its tree.
    pub fn root_of(&self, h: NodeHandle) -> NodeHandle {
        let mut cur = h;
        while let Some(p) = self.nodes[cur].parent {
            cur = p;
        }
        cur
    }

    /// Verifies the structural invariants of every tree.
    pub fn check(&self) -> Result<(), Violation> {
        let bad = |node, problem| Err(Violation { node, problem });

        for (h, n) in self.nodes.iter() {
            if n.depth > MAX_DEPTH {
                return bad(h, "deeper than the limit");
            }
            match n.parent {
                None => {
                    if n.depth != 0 {
                        return bad(h, "root with non-zero depth");
                    }
                    if self.roots.get(frame_of(n.phys)).copied().flatten()
                        != Some(h)
                    {
                        return bad(h, "root missing from the root table");
                    }
                    if n.children.is_empty() {
                        return bad(h, "root left without children");
                    }
                }
                Some(p) => {
                    let Some(pn) = self.nodes.get(p) else {
                        return bad(h, "parent is stale");
                    };
                    if n.depth != pn.depth + 1 {
                        return bad(h, "depth is not parent depth plus one");
                    }
                    if n.size_log2 > pn.size_log2
                        || u64::from(n.phys) < u64::from(pn.phys)
                        || n.phys_end() > pn.phys_end()
                    {
                        return bad(h, "not contained in parent");
                    }
                    if !pn.rights.contains(n.rights) {
                        return bad(h, "rights exceed parent's");
                    }
                    if !pn.children.iter(&self.nodes).any(|c| c == h) {
                        return bad(h, "missing from parent's child list");
                    }
                }
            }
            for c in n.children.iter(&self.nodes) {
                if self.nodes[c].parent != Some(h) {
                    return bad(c, "child list and parent link disagree");
                }
            }
        }
        for r in self.roots.iter().flatten() {
            match self.nodes.get(*r) {
                Some(n) if n.parent.is_none() => (),
                _ => return bad(*r, "root table entry is not a live root"),
            }
        }
        Ok(())
    }
}

/// Pre-order walk of one subtree; see `MapDb::subtree`.
pub struct Subtree<'a> {
    db: &'a MapDb,
    top: NodeHandle,
    next: Option<NodeHandle>,
}

impl Iterator for Subtree<'_> {
    type Item = NodeHandle;

    fn next(&mut self) -> Option<NodeHandle> {
        let h = self.next?;
        self.next = self.db.preorder_next(self.top, h);
        Some(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{Space, SpaceTable};
    use abi::{Generation, SpaceId};
    use proptest::prelude::*;

    const PAGE: u32 = 1 << PAGE_SHIFT;
    const SUPER: u32 = 1 << SUPERPAGE_SHIFT;

    struct World {
        spaces: SpaceTable,
        db: MapDb,
        s: Vec<SpaceHandle>,
    }

    /// Space 0 owns the first superpage of memory, identity mapped as one
    /// superpage, plus the first page of the second superpage as a page.
    fn world(n: usize) -> Box<World> {
        let mut spaces = SpaceTable::new();
        let s: Vec<_> = (0..n)
            .map(|i| {
                spaces
                    .insert(Space::new(
                        SpaceId::for_index_and_gen(i, Generation::ZERO),
                        None,
                    ))
                    .unwrap()
            })
            .collect();
        spaces[s[0]]
            .page_table_mut()
            .map(0, 0, SUPERPAGE_SHIFT, Rights::RWX)
            .unwrap();
        spaces[s[0]]
            .page_table_mut()
            .map(SUPER, SUPER, PAGE_SHIFT, Rights::RW)
            .unwrap();
        Box::new(World {
            spaces,
            db: MapDb::new(),
            s,
        })
    }

    impl World {
        fn map(
            &mut self,
            phys: u32,
            from: usize,
            from_virt: u32,
            to: usize,
            to_virt: u32,
            rights: Rights,
        ) -> Result<NodeHandle, MapDbError> {
            let req = MapRequest {
                phys,
                parent_space: self.s[from],
                parent_virt: from_virt,
                child_space: self.s[to],
                child_virt: to_virt,
                size_log2: PAGE_SHIFT,
                rights,
            };
            let r = self.db.insert(&mut self.spaces, req);
            self.db.check().unwrap();
            r
        }

        fn pte(&self, space: usize, virt: u32) -> Option<Translation> {
            self.spaces[self.s[space]].page_table().lookup(virt)
        }
    }

    #[test]
    fn first_child_creates_root_lazily() {
        let mut w = world(2);
        assert!(w.db.tree_for(0x5000).is_none());
        let b = w.map(0x5000, 0, 0x5000, 1, 0x10_0000, Rights::RW).unwrap();
        let root = w.db.tree_for(0x5000).expect("tree should exist now");
        assert_eq!(w.db.node(root).unwrap().size_log2(), SUPERPAGE_SHIFT);
        assert_eq!(w.db.node(b).unwrap().depth(), 1);
        assert_eq!(w.db.node(b).unwrap().parent(), Some(root));
        let pte = w.pte(1, 0x10_0123).unwrap();
        assert_eq!(pte.phys_for(0x10_0123), 0x5123);
        assert_eq!(pte.rights, Rights::RW);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "stale mapping handle")]
    fn unmapping_a_removed_node_is_fatal() {
        let mut w = world(2);
        let b = w.map(0x6000, 0, 0x6000, 1, 0x6000, Rights::RW).unwrap();
        w.db.unmap(&mut w.spaces, b, true);
        assert!(w.db.node(b).is_none());
        w.db.unmap(&mut w.spaces, b, true);
    }

    #[test]
    fn chain_and_non_recursive_unmap_reparents() {
        let mut w = world(3);
        let b = w.map(0x7000, 0, 0x7000, 1, 0x20_0000, Rights::RW).unwrap();
        let c = w.map(0x7000, 1, 0x20_0000, 2, 0x30_0000, Rights::READ).unwrap();
        let root = w.db.tree_for(0x7000).unwrap();
        assert_eq!(w.db.node(c).unwrap().depth(), 2);

        w.db.unmap(&mut w.spaces, b, false);
        w.db.check().unwrap();

        let cn = w.db.node(c).expect("C must survive a non-recursive unmap");
        assert_eq!(cn.depth(), 1, "C moves up one level");
        assert_eq!(cn.parent(), Some(root), "C now hangs off A's root");
        assert_eq!(cn.rights(), Rights::READ, "C keeps its rights");
        assert!(w.pte(1, 0x20_0000).is_none());
        assert!(w.pte(2, 0x30_0000).is_some());
    }

    #[test]
    fn recursive_unmap_takes_all_descendants() {
        let mut w = world(4);
        let b = w.map(0x3000, 0, 0x3000, 1, 0x3000, Rights::RW).unwrap();
        let c = w.map(0x3000, 1, 0x3000, 2, 0x4000, Rights::RW).unwrap();
        let d = w.map(0x3000, 2, 0x4000, 3, 0x5000, Rights::RW).unwrap();

        w.db.unmap(&mut w.spaces, b, true);
        w.db.check().unwrap();
        for h in [b, c, d] {
            assert!(w.db.node(h).is_none(), "{h:?} should be gone");
        }
        assert!(w.db.lookup(0x3000, w.s[2], 0x4000).is_none());
        assert!(w.pte(2, 0x4000).is_none());
        assert!(w.pte(3, 0x5000).is_none());
        assert!(w.db.is_empty(), "bare root should have collapsed");
        assert!(w.pte(0, 0x3000).is_some(), "owner keeps its memory");
    }

    #[test]
    fn second_mapping_of_the_same_frame_conflicts() {
        let mut w = world(3);
        w.map(0x9000, 0, 0x9000, 1, 0x1000, Rights::RW).unwrap();
        assert_eq!(
            w.map(0x9000, 0, 0x9000, 1, 0x2000, Rights::RW),
            Err(MapDbError::Conflict)
        );
        // Mapping back into an ancestor would form a cycle.
        w.map(0x9000, 1, 0x1000, 2, 0x1000, Rights::RW).unwrap();
        assert_eq!(
            w.map(0x9000, 2, 0x1000, 0, 0x40_0000, Rights::RW),
            Err(MapDbError::Conflict)
        );
    }

    #[test]
    fn remapping_the_same_thing_upgrades_rights() {
        let mut w = world(2);
        let a = w.map(0x9000, 0, 0x9000, 1, 0x1000, Rights::READ).unwrap();
        let b = w.map(0x9000, 0, 0x9000, 1, 0x1000, Rights::RW).unwrap();
        assert_eq!(a, b);
        assert_eq!(w.db.node(a).unwrap().rights(), Rights::RW);
        assert_eq!(w.pte(1, 0x1000).unwrap().rights, Rights::RW);
    }

    #[test]
    fn child_rights_are_clipped_to_parent() {
        let mut w = world(3);
        w.map(SUPER, 0, SUPER, 1, 0x1000, Rights::RWX).unwrap();
        assert_eq!(
            w.pte(1, 0x1000).unwrap().rights,
            Rights::RW,
            "space 0 only holds this page read-write"
        );
    }

    #[test]
    fn flush_is_idempotent() {
        let mut w = world(3);
        w.map(0x1000, 0, 0x1000, 1, 0x1000, Rights::RW).unwrap();
        w.map(0x2000, 0, 0x2000, 1, 0x2000, Rights::RW).unwrap();
        w.map(0x1000, 1, 0x1000, 2, 0x1000, Rights::RW).unwrap();
        let space = w.s[1];
        w.db.flush(&mut w.spaces, space);
        w.db.check().unwrap();
        assert_eq!(w.db.nodes_of(space).count(), 0);
        assert!(w.pte(2, 0x1000).is_none());
        let before = w.db.len();
        w.db.flush(&mut w.spaces, space);
        assert_eq!(w.db.len(), before);
        assert!(w.db.is_empty());
    }

    #[test]
    fn grant_moves_node_in_place() {
        let mut w = world(4);
        let b = w.map(0x6000, 0, 0x6000, 1, 0x6000, Rights::RW).unwrap();
        let c = w.map(0x6000, 1, 0x6000, 2, 0x6000, Rights::RW).unwrap();
        let new_space = w.s[3];
        w.db.grant(&mut w.spaces, b, new_space, 0x8000).unwrap();
        w.db.check().unwrap();
        let bn = w.db.node(b).unwrap();
        assert_eq!((bn.space(), bn.virt(), bn.depth()), (new_space, 0x8000, 1));
        assert!(w.pte(1, 0x6000).is_none());
        assert_eq!(w.pte(3, 0x8000).unwrap().phys, 0x6000);
        assert_eq!(w.db.node(c).unwrap().parent(), Some(b));

        // Granting into a space that holds part of the tree is refused.
        assert_eq!(
            w.db.grant(&mut w.spaces, b, w.s[2], 0x9000),
            Err(MapDbError::Conflict)
        );
    }

    #[test]
    fn revoke_and_downgrade_leave_the_node_itself() {
        let mut w = world(4);
        let b = w.map(0x6000, 0, 0x6000, 1, 0x6000, Rights::RW).unwrap();
        let c = w.map(0x6000, 1, 0x6000, 2, 0x6000, Rights::RW).unwrap();
        let d = w.map(0x6000, 2, 0x6000, 3, 0x6000, Rights::RW).unwrap();

        w.db.downgrade(&mut w.spaces, b, Rights::WRITE, false);
        w.db.check().unwrap();
        assert_eq!(w.db.node(b).unwrap().rights(), Rights::RW);
        assert_eq!(w.db.node(d).unwrap().rights(), Rights::READ);
        assert_eq!(w.pte(2, 0x6000).unwrap().rights, Rights::READ);

        w.db.revoke(&mut w.spaces, b, false);
        w.db.check().unwrap();
        assert!(w.db.node(c).is_none());
        assert_eq!(w.db.node(d).unwrap().parent(), Some(b));
        assert_eq!(w.db.node(d).unwrap().depth(), 2);
    }

    #[test]
    fn exhaustion_leaves_everything_untouched() {
        let mut w = world(2);
        let (from, to) = (w.s[0], w.s[1]);
        let mut phys = 0;
        let err = loop {
            let req = MapRequest {
                phys,
                parent_space: from,
                parent_virt: phys,
                child_space: to,
                child_virt: 0x100_0000 + phys,
                size_log2: PAGE_SHIFT,
                rights: Rights::RW,
            };
            match w.db.insert(&mut w.spaces, req) {
                Ok(_) => phys += PAGE,
                Err(e) => break e,
            }
        };
        assert_eq!(err, MapDbError::NoMemory);
        assert_eq!(w.db.free_slots(), 0);
        assert!(w.pte(1, 0x100_0000 + phys).is_none(), "refused mapping left a PTE");
        w.db.check().unwrap();
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut w = world(3);
        let b = w.map(0x1000, 0, 0x1000, 1, 0x1000, Rights::RW).unwrap();
        w.db.nodes[b].depth = MAX_DEPTH;
        let req = MapRequest {
            phys: 0x1000,
            parent_space: w.s[1],
            parent_virt: 0x1000,
            child_space: w.s[2],
            child_virt: 0x1000,
            size_log2: PAGE_SHIFT,
            rights: Rights::RW,
        };
        assert_eq!(w.db.insert(&mut w.spaces, req), Err(MapDbError::TooDeep));
        assert!(w.pte(2, 0x1000).is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Map { from: usize, to: usize, frame: u32 },
        Unmap { pick: usize, recursive: bool },
        Revoke { pick: usize },
        Flush { space: usize },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0usize..5, 0usize..5, 0u32..4)
                .prop_map(|(from, to, frame)| Op::Map { from, to, frame }),
            2 => (0usize..64, any::<bool>())
                .prop_map(|(pick, recursive)| Op::Unmap { pick, recursive }),
            1 => (0usize..64).prop_map(|pick| Op::Revoke { pick }),
            1 => (1usize..5).prop_map(|space| Op::Flush { space }),
        ]
    }

    proptest! {
        #[test]
        fn trees_stay_well_formed(ops in proptest::collection::vec(op(), 1..80)) {
            let mut w = world(5);
            for op in ops {
                match op {
                    Op::Map { from, to, frame } => {
                        let phys = frame * PAGE;
                        // Each space maps frame N at a per-space virtual
                        // address, if it holds it at all.
                        let virt_in = |s: usize| {
                            if s == 0 { phys } else { 0x1000_0000 * s as u32 + phys }
                        };
                        let _ = w.db.insert(&mut w.spaces, MapRequest {
                            phys,
                            parent_space: w.s[from],
                            parent_virt: virt_in(from),
                            child_space: w.s[to],
                            child_virt: virt_in(to),
                            size_log2: PAGE_SHIFT,
                            rights: Rights::RW,
                        });
                    }
                    Op::Unmap { pick, recursive } => {
                        let live: Vec<_> = w.db.nodes.handles().collect();
                        if !live.is_empty() {
                            let h = live[pick % live.len()];
                            w.db.unmap(&mut w.spaces, h, recursive);
                        }
                    }
                    Op::Revoke { pick } => {
                        let live: Vec<_> = w.db.nodes.handles().collect();
                        if !live.is_empty() {
                            let h = live[pick % live.len()];
                            w.db.revoke(&mut w.spaces, h, false);
                        }
                    }
                    Op::Flush { space } => {
                        let s = w.s[space];
                        w.db.flush(&mut w.spaces, s);
                    }
                }
                prop_assert_eq!(w.db.check(), Ok(()));
                // Every non-root node has a matching page-table entry.
                for (_, n) in w.db.nodes.iter() {
                    let pte = w.spaces[n.space()].page_table().lookup(n.virt());
                    prop_assert!(pte.is_some());
                }
            }
        }
    }
}
