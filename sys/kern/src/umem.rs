// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for safely interacting with untrusted/unprivileged/user memory.
//!
//! User memory is never touched through a user address directly. Every access
//! is translated through the owning space's page table into simulated
//! physical memory, one page at a time.

use abi::{FaultInfo, FaultSource, Rights, UsageError};

use crate::arch::PhysMemory;
use crate::err::InteractFault;
use crate::space::{AddressSpaceOps, Space, SpaceHandle, SpaceTable};
use crate::startup::{PAGE_SHIFT, STRING_BUFFER_LEN};

/// A (user, untrusted, unprivileged) byte slice.
///
/// A `USlice` is passed into the kernel by a thread, and is intended to refer
/// to memory that thread controls -- for instance, as a place where the kernel
/// can deposit a message to that thread. However, the `USlice` type itself
/// simply represents an _allegation_ from the thread that a section of address
/// space is suitable; it does _not_ demonstrate that the thread has access to
/// that memory.
///
/// Having a `USlice` tells you that the section does not wrap around the end
/// of the address space. To learn whether it is actually mapped, ask
/// `check_access`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct USlice {
    base_address: u32,
    length: u32,
}

impl USlice {
    /// Constructs a `USlice` given a base address and length passed from
    /// untrusted code.
    ///
    /// This will only succeed if such a slice would not run past the top of
    /// the address space. It may end exactly at the top.
    pub fn from_raw(base_address: u32, length: u32) -> Result<Self, UsageError> {
        // NOTE: the property checked here is critical for the correctness of
        // this type. Think carefully before loosening it, or adding a second
        // way to construct a USlice.
        if u64::from(base_address) + u64::from(length) > 1 << 32 {
            return Err(UsageError::InvalidSlice);
        }
        Ok(Self {
            base_address,
            length,
        })
    }

    pub fn empty() -> Self {
        Self {
            base_address: 0,
            length: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn base_addr(&self) -> u32 {
        self.base_address
    }

    /// One past the final byte, as a `u64` since it may be `1 << 32`.
    pub fn end_addr(&self) -> u64 {
        u64::from(self.base_address) + u64::from(self.length)
    }

    /// The first `n` bytes of this slice (or all of it, if shorter).
    pub fn prefix(&self, n: usize) -> Self {
        Self {
            base_address: self.base_address,
            length: self.length.min(u32::try_from(n).unwrap_or(u32::MAX)),
        }
    }

    /// Adjusts `a` and `b` to have the same length, which is the shorter of
    /// the two.
    ///
    /// Returns the new common length.
    pub fn shorten_to_match(a: &mut Self, b: &mut Self) -> usize {
        let n = u32::min(a.length, b.length);
        a.length = n;
        b.length = n;
        n as usize
    }
}

fn access_fault(address: u64) -> FaultInfo {
    FaultInfo::MemoryAccess {
        address: Some(address as u32),
        source: FaultSource::Kernel,
    }
}

/// Checks that every byte of `slice` is mapped in `space` with at least
/// `rights`. Empty slices always pass.
pub fn check_access(
    space: &Space,
    slice: &USlice,
    rights: Rights,
) -> Result<(), FaultInfo> {
    let mut addr = u64::from(slice.base_addr());
    while addr < slice.end_addr() {
        match space.page_table().lookup(addr as u32) {
            Some(t) if t.rights.contains(rights) => addr = t.end(),
            _ => return Err(access_fault(addr)),
        }
    }
    Ok(())
}

/// Translates `virt` in `space` to a physical address, also returning how many
/// bytes remain before the next page boundary.
fn translate(space: &Space, virt: u64, rights: Rights) -> Option<(u32, usize)> {
    let t = space.page_table().lookup(virt as u32)?;
    if !t.rights.contains(rights) {
        return None;
    }
    let page = 1u64 << PAGE_SHIFT;
    let to_boundary = page - (virt & (page - 1));
    Some((t.phys_for(virt as u32), to_boundary as usize))
}

/// Copies bytes from `from_slice` in space `from` into `to_slice` in space
/// `to`, checking memory access before doing so.
///
/// The actual number of bytes copied will be `min(from_slice.length,
/// to_slice.length)`, and will be returned.
///
/// If `from_slice` or `to_slice` refers to memory that the respective space
/// can't read or write (respectively), no bytes are copied, and this returns
/// an `InteractFault` indicating which side(s) messed this up. Note that it's
/// entirely possible for _both_ sides to have messed this up.
///
/// The copy goes through a bounce buffer of `STRING_BUFFER_LEN` bytes, one
/// fragment at a time. No fragment crosses a page boundary on either side.
pub fn safe_copy(
    spaces: &SpaceTable,
    phys: &mut PhysMemory,
    from: SpaceHandle,
    mut from_slice: USlice,
    to: SpaceHandle,
    mut to_slice: USlice,
) -> Result<usize, InteractFault> {
    let copy_len = USlice::shorten_to_match(&mut from_slice, &mut to_slice);
    if copy_len == 0 {
        return Ok(0);
    }

    let (src, dst) = (&spaces[from], &spaces[to]);
    let src_ok = check_access(src, &from_slice, Rights::READ);
    let dst_ok = check_access(dst, &to_slice, Rights::WRITE);
    if src_ok.is_err() || dst_ok.is_err() {
        return Err(InteractFault {
            src: src_ok.err(),
            dst: dst_ok.err(),
        });
    }

    let mut bounce = [0u8; STRING_BUFFER_LEN];
    let mut done = 0usize;
    while done < copy_len {
        let s = u64::from(from_slice.base_addr()) + done as u64;
        let d = u64::from(to_slice.base_addr()) + done as u64;
        let (sp, s_room) = translate(src, s, Rights::READ)
            .ok_or_else(|| InteractFault::in_src(access_fault(s)))?;
        let (dp, d_room) = translate(dst, d, Rights::WRITE)
            .ok_or_else(|| InteractFault::in_dst(access_fault(d)))?;
        let n = (copy_len - done).min(s_room).min(d_room).min(bounce.len());

        let chunk = &mut bounce[..n];
        chunk.copy_from_slice(
            phys.slice(sp, n)
                .ok_or_else(|| InteractFault::in_src(access_fault(s)))?,
        );
        phys.slice_mut(dp, n)
            .ok_or_else(|| InteractFault::in_dst(access_fault(d)))?
            .copy_from_slice(chunk);
        done += n;
    }
    Ok(copy_len)
}

/// Reads `buf.len()` bytes at `addr` in `space`, as that space's own
/// program would see them.
pub fn copy_from_user(
    space: &Space,
    phys: &PhysMemory,
    addr: u32,
    buf: &mut [u8],
) -> Result<(), FaultInfo> {
    let mut done = 0;
    while done < buf.len() {
        let v = u64::from(addr) + done as u64;
        let (p, room) =
            translate(space, v, Rights::READ).ok_or(access_fault(v))?;
        let n = (buf.len() - done).min(room);
        let src = phys.slice(p, n).ok_or(access_fault(v))?;
        buf[done..done + n].copy_from_slice(src);
        done += n;
    }
    Ok(())
}

/// Writes `data` at `addr` in `space`, as that space's own program would.
pub fn copy_to_user(
    space: &Space,
    phys: &mut PhysMemory,
    addr: u32,
    data: &[u8],
) -> Result<(), FaultInfo> {
    let mut done = 0;
    while done < data.len() {
        let v = u64::from(addr) + done as u64;
        let (p, room) =
            translate(space, v, Rights::WRITE).ok_or(access_fault(v))?;
        let n = (data.len() - done).min(room);
        phys.slice_mut(p, n)
            .ok_or(access_fault(v))?
            .copy_from_slice(&data[done..done + n]);
        done += n;
    }
    Ok(())
}
