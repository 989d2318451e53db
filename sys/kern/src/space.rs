// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Address spaces, and moving flexpages between them.

use abi::{Fpage, Generation, Rights, SpaceId, UnmapFlags};
use kerncore::{Arena, Handle};

use crate::arch::PageTable;
use crate::fail::OrDie;
use crate::mapdb::{MapDb, MapDbError, MapRequest, NodeHandle, MAX_DEPTH};
use crate::startup::{MAX_SPACES, PAGE_SHIFT, SUPERPAGE_SHIFT};

pub type SpaceHandle = Handle<Space>;
pub type SpaceTable = Arena<Space, MAX_SPACES>;

/// One page-table entry, as reported by `AddressSpaceOps`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Translation {
    pub virt: u32,
    pub phys: u32,
    pub size_log2: u8,
    pub rights: Rights,
}

impl Translation {
    pub fn size(&self) -> u64 {
        1 << self.size_log2
    }

    /// First virtual address past the mapping.
    pub fn end(&self) -> u64 {
        u64::from(self.virt) + self.size()
    }

    /// Physical address behind `virt`, which must lie inside the mapping.
    pub fn phys_for(&self, virt: u32) -> u32 {
        self.phys + (virt - self.virt)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageTableError {
    /// Size other than a page or a superpage.
    BadSize,
    /// Virtual or physical address not aligned to the size.
    Misaligned,
    /// Something else is already mapped there.
    Occupied,
    /// Nothing mapped there.
    NotMapped,
}

/// Operations the kernel needs from a page table.
///
/// Entries are either pages or superpages, and never overlap. The kernel
/// keeps this invariant itself; implementations only have to report
/// violations rather than resolve them.
pub trait AddressSpaceOps {
    /// Enters a mapping of `1 << size_log2` bytes. Mapping the exact same
    /// frame again at the same place just replaces the rights.
    fn map(
        &mut self,
        virt: u32,
        phys: u32,
        size_log2: u8,
        rights: Rights,
    ) -> Result<(), PageTableError>;

    /// Removes the entry that starts at `virt` with the given size.
    fn unmap(
        &mut self,
        virt: u32,
        size_log2: u8,
    ) -> Result<Translation, PageTableError>;

    /// Changes the rights of the entry covering `virt`.
    fn protect(&mut self, virt: u32, rights: Rights)
        -> Result<(), PageTableError>;

    /// Finds the entry covering `virt`.
    fn lookup(&self, virt: u32) -> Option<Translation>;

    /// Finds the lowest entry overlapping `[from, end)`.
    fn next_mapping(&self, from: u32, end: u64) -> Option<Translation>;
}

#[derive(Debug)]
pub struct Space {
    id: SpaceId,
    /// The space that created this one, and may manage it.
    chief: Option<SpaceHandle>,
    page_table: PageTable,
    threads: usize,
}

impl Space {
    pub fn new(id: SpaceId, chief: Option<SpaceHandle>) -> Self {
        Self {
            id,
            chief,
            page_table: PageTable::default(),
            threads: 0,
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: SpaceId) {
        self.id = id;
    }

    pub fn chief(&self) -> Option<SpaceHandle> {
        self.chief
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    pub fn thread_count(&self) -> usize {
        self.threads
    }

    pub(crate) fn add_thread(&mut self) {
        self.threads += 1;
    }

    pub(crate) fn remove_thread(&mut self) {
        self.threads = self.threads.saturating_sub(1);
    }
}

/// The externally visible name for the space in slot `h`.
pub fn id_for(h: SpaceHandle) -> SpaceId {
    // Generations wrap within the bits the ID has room for.
    let gen = (h.generation() & SpaceId::GENERATION_MASK) as u8;
    SpaceId::for_index_and_gen(h.index(), Generation::from(gen))
}

/// Turns an externally supplied ID back into a handle, if it still names a
/// live space.
pub fn resolve(spaces: &SpaceTable, id: SpaceId) -> Option<SpaceHandle> {
    let h = spaces.handle_at(id.index())?;
    (spaces[h].id == id).then_some(h)
}

/// One piece of a flexpage transfer: a page or superpage that is moved as a
/// single page-table entry.
#[derive(Copy, Clone, Debug)]
struct Chunk {
    src_virt: u32,
    dst_virt: u32,
    phys: u32,
    size_log2: u8,
    rights: Rights,
}

impl Chunk {
    fn size(&self) -> u64 {
        1 << self.size_log2
    }

    fn dst_end(&self) -> u64 {
        u64::from(self.dst_virt) + self.size()
    }
}

/// Placement of a send flexpage inside a receive window.
#[derive(Copy, Clone, Debug)]
struct Placement {
    src_base: u64,
    dst_base: u64,
    size_log2: u8,
}

impl Placement {
    /// The smaller of the two flexpages wins. Within the larger one, the hot
    /// spot picks which aligned piece of that size takes part.
    fn new(send: Fpage, hot_spot: u32, window: Fpage) -> Self {
        let size_log2 = send.size_log2().min(window.size_log2());
        let size = 1u64 << size_log2;
        let hot = u64::from(hot_spot);
        Self {
            src_base: u64::from(send.base())
                + (hot & (send.size() - 1) & !(size - 1)),
            dst_base: u64::from(window.base())
                + (hot & (window.size() - 1) & !(size - 1)),
            size_log2,
        }
    }

    fn src_end(&self) -> u64 {
        self.src_base + (1u64 << self.size_log2)
    }

    fn to_dst(&self, src: u64) -> u32 {
        (src - self.src_base + self.dst_base) as u32
    }

    /// Finds the first chunk of mapped source memory at or after `cursor`.
    fn next_chunk(&self, src: &PageTable, cursor: u64) -> Option<Chunk> {
        if cursor >= self.src_end() {
            return None;
        }
        let t = src.next_mapping(cursor as u32, self.src_end())?;
        let start = u64::from(t.virt).max(cursor);
        let stop = t.end().min(self.src_end());
        let dst = self.to_dst(start);
        let whole = t.size_log2 == SUPERPAGE_SHIFT
            && start == u64::from(t.virt)
            && stop == t.end()
            && u64::from(dst) % t.size() == 0;
        let size_log2 = if whole { SUPERPAGE_SHIFT } else { PAGE_SHIFT };
        Some(Chunk {
            src_virt: start as u32,
            dst_virt: dst,
            phys: t.phys_for(start as u32),
            size_log2,
            rights: t.rights,
        })
    }

    fn chunks<'a>(
        &'a self,
        src: &'a PageTable,
    ) -> impl Iterator<Item = Chunk> + Clone + 'a {
        let mut cursor = self.src_base;
        core::iter::from_fn(move || {
            let c = self.next_chunk(src, cursor)?;
            cursor = u64::from(c.src_virt) + c.size();
            Some(c)
        })
    }
}

/// Checks that a chunk can go to `to`, given the chunks moved before it.
///
/// Anything `to` holds in the chunk's mapping tree must lie inside the window
/// and must be cleared away by the time the chunk lands, that is, overlap the
/// destination of this chunk or an earlier one. No earlier chunk may carry
/// the same memory, and `to` must not be an ancestor of the source (which
/// would make it its own descendant).
///
/// Returns the number of nodes the chunk may need.
fn vet_chunk(
    mapdb: &MapDb,
    from: SpaceHandle,
    to: SpaceHandle,
    chunk: &Chunk,
    earlier: impl Iterator<Item = Chunk> + Clone,
    window: (u64, u64),
) -> Result<usize, MapDbError> {
    let chunk_end = u64::from(chunk.phys) + chunk.size();
    let same_memory = |c: &Chunk| {
        u64::from(c.phys) < chunk_end
            && u64::from(chunk.phys) < u64::from(c.phys) + c.size()
    };
    if earlier.clone().any(|c| same_memory(&c)) {
        return Err(MapDbError::Conflict);
    }

    let Some(root) = mapdb.tree_for(chunk.phys) else {
        // No tree: only the owner (`from`) maps this frame. A root and a
        // child will be needed.
        return Ok(2);
    };
    let src = mapdb
        .lookup(chunk.phys, from, chunk.src_virt)
        .or_die("mapped frame with a tree but no node");

    let mut ancestors = Some(src);
    while let Some(a) = ancestors {
        if mapdb.node(a).map(|n| n.space()) == Some(to) {
            return Err(MapDbError::Conflict);
        }
        ancestors = mapdb.node(a).and_then(|n| n.parent());
    }

    for h in mapdb.subtree(root) {
        let Some(n) = mapdb.node(h) else { continue };
        let overlaps = u64::from(n.phys()) < chunk_end
            && u64::from(chunk.phys) < u64::from(n.phys()) + n.size();
        if n.space() != to || !overlaps {
            continue;
        }
        let start = u64::from(n.virt());
        let end = start + n.size();
        let cleared = core::iter::once(*chunk)
            .chain(earlier.clone())
            .any(|c| start < c.dst_end() && u64::from(c.dst_virt) < end);
        if start < window.0 || end > window.1 || !cleared {
            return Err(MapDbError::Conflict);
        }
    }

    let depth = mapdb.node(src).map_or(0, |n| n.depth());
    if depth >= MAX_DEPTH {
        return Err(MapDbError::TooDeep);
    }
    Ok(1)
}

/// Removes whatever `space` has mapped in `[virt, end)`, whole mappings at a
/// time, along with everything derived from those mappings.
fn clear_range(
    spaces: &mut SpaceTable,
    mapdb: &mut MapDb,
    space: SpaceHandle,
    virt: u32,
    end: u64,
) {
    while let Some(t) = spaces[space].page_table().next_mapping(virt, end) {
        match node_for(mapdb, space, &t) {
            Some(node) => mapdb.unmap(spaces, node, true),
            None => {
                spaces[space]
                    .page_table_mut()
                    .unmap(t.virt, t.size_log2)
                    .or_die("page table lost an entry it just reported");
            }
        }
    }
}

fn node_for(
    mapdb: &MapDb,
    space: SpaceHandle,
    t: &Translation,
) -> Option<NodeHandle> {
    mapdb.tree_for(t.phys)?;
    mapdb.lookup(t.phys, space, t.virt)
}

/// Moves one chunk by grant: the source mapping itself changes hands.
fn grant_chunk(
    spaces: &mut SpaceTable,
    mapdb: &mut MapDb,
    from: SpaceHandle,
    to: SpaceHandle,
    chunk: &Chunk,
    rights: Rights,
) -> Result<bool, MapDbError> {
    let Some(t) = spaces[from].page_table().lookup(chunk.src_virt) else {
        return Ok(false);
    };
    let exact = t.virt == chunk.src_virt && t.size_log2 == chunk.size_log2;
    if !exact {
        // Only part of a larger mapping; that part is mapped instead.
        return Ok(false);
    }
    match node_for(mapdb, from, &t) {
        Some(node) => {
            mapdb.grant(spaces, node, to, chunk.dst_virt)?;
            let lost = t.rights - rights;
            if !lost.is_empty() {
                mapdb.downgrade(spaces, node, lost, true);
            }
        }
        None => {
            spaces[from]
                .page_table_mut()
                .unmap(t.virt, t.size_log2)
                .or_die("page table lost an entry it just reported");
            spaces[to]
                .page_table_mut()
                .map(chunk.dst_virt, t.phys, t.size_log2, t.rights & rights)
                .or_die("cleared window refused a mapping");
        }
    }
    Ok(true)
}

/// Maps (or grants) the part of `send` in `from` selected by `hot_spot` into
/// `window` in `to`.
///
/// Whatever `to` already had mapped where the new mappings land is unmapped
/// first. Unmapped parts of the send flexpage are skipped. The whole transfer
/// is checked before anything changes, so on error no mapping has moved.
///
/// Returns the received flexpage, as seen from `to`.
pub fn map_fpage(
    spaces: &mut SpaceTable,
    mapdb: &mut MapDb,
    from: SpaceHandle,
    send: Fpage,
    hot_spot: u32,
    to: SpaceHandle,
    window: Fpage,
) -> Result<Fpage, MapDbError> {
    if from == to || !spaces.contains(from) || !spaces.contains(to) {
        return Err(MapDbError::Conflict);
    }
    let place = Placement::new(send, hot_spot, window);
    let dst_window = (place.dst_base, place.dst_base + (1 << place.size_log2));

    let src = spaces[from].page_table();
    let mut needed = 0;
    for (i, chunk) in place.chunks(src).enumerate() {
        let earlier = place.chunks(src).take(i);
        needed += vet_chunk(mapdb, from, to, &chunk, earlier, dst_window)?;
    }
    if needed > mapdb.free_slots() {
        return Err(MapDbError::NoMemory);
    }

    let mut cursor = place.src_base;
    let mut moved = 0usize;
    while let Some(chunk) = place.next_chunk(spaces[from].page_table(), cursor)
    {
        cursor = u64::from(chunk.src_virt) + chunk.size();
        clear_range(spaces, mapdb, to, chunk.dst_virt, chunk.dst_end());

        // Clearing may have taken away a source derived from something the
        // receiver held; such chunks are skipped.
        let Some(t) = spaces[from].page_table().lookup(chunk.src_virt) else {
            continue;
        };
        if send.is_grant()
            && grant_chunk(spaces, mapdb, from, to, &chunk, send.rights())?
        {
            moved += 1;
            continue;
        }
        mapdb.insert(
            spaces,
            MapRequest {
                phys: t.phys_for(chunk.src_virt),
                parent_space: from,
                parent_virt: chunk.src_virt,
                child_space: to,
                child_virt: chunk.dst_virt,
                size_log2: chunk.size_log2,
                rights: send.rights() & chunk.rights,
            },
        )?;
        moved += 1;
    }
    log::debug!(
        "space: moved {moved} chunk(s) of {send:?} to {:#x}",
        place.dst_base
    );

    let received = Fpage::new(place.dst_base as u32, place.size_log2, send.rights());
    Ok(if send.is_grant() {
        received.granted()
    } else {
        received
    })
}

/// Takes memory back from whatever was derived from `fpage` in `space`.
///
/// Acts on every mapping overlapping the flexpage, as a whole:
///
/// - with `DOWNGRADE`, the flexpage's rights are taken away from derived
///   mappings (and from `space`'s own, with `SELF`);
/// - otherwise derived mappings are removed, and with `SELF` so is `space`'s
///   own.
///
/// `RECURSIVE` decides whether mappings derived from the removed ones go
/// too, or move up a level.
///
/// Returns the number of mappings acted on.
pub fn unmap_fpage(
    spaces: &mut SpaceTable,
    mapdb: &mut MapDb,
    space: SpaceHandle,
    fpage: Fpage,
    flags: UnmapFlags,
) -> usize {
    let recursive = flags.contains(UnmapFlags::RECURSIVE);
    let include_self = flags.contains(UnmapFlags::SELF);
    let end = fpage.end();
    let mut cursor = u64::from(fpage.base());
    let mut count = 0;

    while cursor < end {
        let Some(t) = spaces[space].page_table().next_mapping(cursor as u32, end)
        else {
            break;
        };
        cursor = t.end();
        count += 1;
        let node = node_for(mapdb, space, &t);

        if flags.contains(UnmapFlags::DOWNGRADE) {
            match node {
                Some(n) => {
                    mapdb.downgrade(spaces, n, fpage.rights(), include_self)
                }
                None if include_self => {
                    spaces[space]
                        .page_table_mut()
                        .protect(t.virt, t.rights - fpage.rights())
                        .or_die("page table lost an entry it just reported");
                }
                None => (),
            }
        } else if include_self {
            match node {
                Some(n) => mapdb.unmap(spaces, n, recursive),
                None => {
                    spaces[space]
                        .page_table_mut()
                        .unmap(t.virt, t.size_log2)
                        .or_die("page table lost an entry it just reported");
                }
            }
        } else if let Some(n) = node {
            mapdb.revoke(spaces, n, recursive);
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u32 = 1 << PAGE_SHIFT;
    const SUPER: u32 = 1 << SUPERPAGE_SHIFT;

    struct World {
        spaces: SpaceTable,
        db: MapDb,
        a: SpaceHandle,
        b: SpaceHandle,
        c: SpaceHandle,
    }

    fn world() -> Box<World> {
        let mut spaces = SpaceTable::new();
        let mut mk = |chief| {
            let h = spaces
                .insert(Space::new(SpaceId(0), chief))
                .unwrap();
            spaces[h].set_id(id_for(h));
            h
        };
        let a = mk(None);
        let b = mk(Some(a));
        let c = mk(Some(a));
        spaces[a]
            .page_table_mut()
            .map(0, 0, SUPERPAGE_SHIFT, Rights::RWX)
            .unwrap();
        Box::new(World {
            spaces,
            db: MapDb::new(),
            a,
            b,
            c,
        })
    }

    impl World {
        fn map(
            &mut self,
            from: SpaceHandle,
            send: Fpage,
            hot: u32,
            to: SpaceHandle,
            window: Fpage,
        ) -> Result<Fpage, MapDbError> {
            let r = map_fpage(
                &mut self.spaces,
                &mut self.db,
                from,
                send,
                hot,
                to,
                window,
            );
            self.db.check().unwrap();
            r
        }

        fn at(&self, s: SpaceHandle, virt: u32) -> Option<u32> {
            self.spaces[s]
                .page_table()
                .lookup(virt)
                .map(|t| t.phys_for(virt))
        }
    }

    #[test]
    fn ids_round_trip_through_resolve() {
        let w = world();
        assert_eq!(resolve(&w.spaces, w.spaces[w.b].id()), Some(w.b));
        assert_eq!(resolve(&w.spaces, SpaceId(0xff)), None);
    }

    #[test]
    fn smaller_window_picks_piece_by_hot_spot() {
        let mut w = world();
        let send = Fpage::new(0, 16, Rights::RW);
        let window = Fpage::new(0x80_0000, PAGE_SHIFT, Rights::empty());
        let got = w.map(w.a, send, 0x3000, w.b, window).unwrap();
        assert_eq!(got.base(), 0x80_0000);
        assert_eq!(got.size_log2(), PAGE_SHIFT);
        assert_eq!(w.at(w.b, 0x80_0004), Some(0x3004));
    }

    #[test]
    fn larger_window_places_by_hot_spot() {
        let mut w = world();
        let send = Fpage::new(0x5000, PAGE_SHIFT, Rights::READ);
        let window = Fpage::new(0x80_0000, 16, Rights::empty());
        let got = w.map(w.a, send, 0x2000, w.b, window).unwrap();
        assert_eq!(got.base(), 0x80_2000);
        assert_eq!(w.at(w.b, 0x80_2000), Some(0x5000));
        assert_eq!(w.at(w.b, 0x80_0000), None);
    }

    #[test]
    fn whole_aligned_superpage_moves_as_one() {
        let mut w = world();
        let send = Fpage::new(0, SUPERPAGE_SHIFT, Rights::RW);
        let window = Fpage::new(SUPER, SUPERPAGE_SHIFT, Rights::empty());
        w.map(w.a, send, 0, w.b, window).unwrap();
        let t = w.spaces[w.b].page_table().lookup(SUPER).unwrap();
        assert_eq!(t.size_log2, SUPERPAGE_SHIFT);
        assert_eq!(w.db.len(), 2);
    }

    #[test]
    fn unmapped_source_pages_are_skipped() {
        let mut w = world();
        let send = Fpage::new(0x2000, PAGE_SHIFT, Rights::RW);
        w.map(w.a, send, 0, w.b, Fpage::new(0x2000, PAGE_SHIFT, Rights::empty()))
            .unwrap();
        // B holds only one of these four pages.
        let send = Fpage::new(0, 14, Rights::RW);
        let window = Fpage::new(0x40_0000, 14, Rights::empty());
        w.map(w.b, send, 0, w.c, window).unwrap();
        assert_eq!(w.at(w.c, 0x40_2000), Some(0x2000));
        assert_eq!(w.at(w.c, 0x40_0000), None);
        assert_eq!(w.at(w.c, 0x40_1000), None);
    }

    #[test]
    fn overmapping_replaces_old_contents() {
        let mut w = world();
        let window = Fpage::new(0x40_0000, PAGE_SHIFT, Rights::empty());
        w.map(w.a, Fpage::new(0x1000, PAGE_SHIFT, Rights::RW), 0, w.b, window)
            .unwrap();
        w.map(w.b, Fpage::new(0x40_0000, PAGE_SHIFT, Rights::RW), 0, w.c, window)
            .unwrap();
        w.map(w.a, Fpage::new(0x7000, PAGE_SHIFT, Rights::RW), 0, w.b, window)
            .unwrap();
        assert_eq!(w.at(w.b, 0x40_0000), Some(0x7000));
        assert_eq!(w.at(w.c, 0x40_0000), None, "C's copy came from B's old page");
    }

    #[test]
    fn mapping_back_to_an_ancestor_is_refused() {
        let mut w = world();
        let window = Fpage::new(0x40_0000, PAGE_SHIFT, Rights::empty());
        w.map(w.a, Fpage::new(0x1000, PAGE_SHIFT, Rights::RW), 0, w.b, window)
            .unwrap();
        let before = w.db.len();
        let back = Fpage::new(0x40_0000, PAGE_SHIFT, Rights::RW);
        assert_eq!(
            w.map(w.b, back, 0, w.a, Fpage::new(0x1000, PAGE_SHIFT, Rights::empty())),
            Err(MapDbError::Conflict)
        );
        assert_eq!(w.db.len(), before);
        assert_eq!(w.at(w.a, 0x1000), Some(0x1000));
    }

    #[test]
    fn refused_transfer_moves_nothing() {
        let mut w = world();
        let base = 0x80_0000;
        w.map(
            w.a,
            Fpage::new(0x1000, PAGE_SHIFT, Rights::RW),
            0,
            w.b,
            Fpage::new(base + 0x5000, PAGE_SHIFT, Rights::empty()),
        )
        .unwrap();
        let before = w.db.len();

        // Page 0x1000 would land at base + 0x1000, but B's copy of it sits
        // further up the window, past where it gets cleared in time.
        let send = Fpage::new(0, 16, Rights::RW);
        let window = Fpage::new(base, 16, Rights::empty());
        assert_eq!(
            w.map(w.a, send, 0, w.b, window),
            Err(MapDbError::Conflict)
        );
        assert_eq!(w.at(w.b, base), None, "no chunk may be committed");
        assert_eq!(w.at(w.b, base + 0x5000), Some(0x1000));
        assert_eq!(w.db.len(), before);
    }

    #[test]
    fn copy_inside_the_landing_range_is_replaced() {
        let mut w = world();
        let base = 0x80_0000;
        w.map(
            w.a,
            Fpage::new(0x5000, PAGE_SHIFT, Rights::RW),
            0,
            w.b,
            Fpage::new(base + 0x1000, PAGE_SHIFT, Rights::empty()),
        )
        .unwrap();

        let send = Fpage::new(0, 16, Rights::RW);
        let window = Fpage::new(base, 16, Rights::empty());
        w.map(w.a, send, 0, w.b, window).unwrap();
        assert_eq!(w.at(w.b, base + 0x1000), Some(0x1000));
        assert_eq!(w.at(w.b, base + 0x5000), Some(0x5000));
        assert_eq!(w.at(w.b, base + 0xf000), Some(0xf000));
    }

    #[test]
    fn grant_moves_and_leaves_nothing_behind() {
        let mut w = world();
        let window = Fpage::new(0x40_0000, PAGE_SHIFT, Rights::empty());
        w.map(w.a, Fpage::new(0x1000, PAGE_SHIFT, Rights::RW), 0, w.b, window)
            .unwrap();
        let send = Fpage::new(0x40_0000, PAGE_SHIFT, Rights::READ).granted();
        let got = w
            .map(w.b, send, 0, w.c, Fpage::new(0x9000, PAGE_SHIFT, Rights::empty()))
            .unwrap();
        assert!(got.is_grant());
        assert_eq!(w.at(w.b, 0x40_0000), None);
        assert_eq!(w.at(w.c, 0x9000), Some(0x1000));
        let t = w.spaces[w.c].page_table().lookup(0x9000).unwrap();
        assert_eq!(t.rights, Rights::READ);
    }

    #[test]
    fn unmap_flavours() {
        let mut w = world();
        let window = Fpage::new(0x40_0000, PAGE_SHIFT, Rights::empty());
        w.map(w.a, Fpage::new(0x1000, PAGE_SHIFT, Rights::RW), 0, w.b, window)
            .unwrap();
        w.map(w.b, Fpage::new(0x40_0000, PAGE_SHIFT, Rights::RW), 0, w.c, window)
            .unwrap();

        // Downgrade what A handed out, leaving A alone.
        let fp = Fpage::new(0x1000, PAGE_SHIFT, Rights::WRITE);
        let n = unmap_fpage(&mut w.spaces, &mut w.db, w.a, fp, UnmapFlags::DOWNGRADE);
        assert_eq!(n, 1);
        w.db.check().unwrap();
        let rights = |w: &World, s: SpaceHandle| w.spaces[s].page_table().lookup(0x40_0000).unwrap().rights;
        assert_eq!(rights(&w, w.b), Rights::READ);
        assert_eq!(rights(&w, w.c), Rights::READ);

        // B drops its own copy, C's moves up under A.
        let fp = Fpage::new(0x40_0000, PAGE_SHIFT, Rights::RWX);
        unmap_fpage(&mut w.spaces, &mut w.db, w.b, fp, UnmapFlags::SELF);
        w.db.check().unwrap();
        assert_eq!(w.at(w.b, 0x40_0000), None);
        assert_eq!(w.at(w.c, 0x40_0000), Some(0x1000));

        // A revokes everything derived from its page.
        let fp = Fpage::new(0, 16, Rights::RWX);
        unmap_fpage(&mut w.spaces, &mut w.db, w.a, fp, UnmapFlags::RECURSIVE);
        w.db.check().unwrap();
        assert_eq!(w.at(w.c, 0x40_0000), None);
        assert_eq!(w.at(w.a, 0x1000), Some(0x1000));
        assert!(w.db.is_empty());
    }
}
