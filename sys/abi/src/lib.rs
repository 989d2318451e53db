// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and applications.
//!
//! Everything in here crosses the user/kernel boundary in a register, so each
//! type is a packed `u32` (or smaller) with explicit accessors rather than a
//! Rust struct with a layout.

#![no_std]

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Names a particular incarnation of an address space.
///
/// A `SpaceId` combines the space's task number (its slot in the kernel's
/// space table) with a generation number that is bumped every time the slot
/// is reused. Talking to a space with an outdated generation fails as if the
/// space did not exist.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct SpaceId(pub u16);

impl SpaceId {
    /// Number of bits used for the task number. The rest is generation.
    pub const INDEX_BITS: u32 = 8;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// Mask applied to generation numbers before they are packed.
    pub const GENERATION_MASK: u16 = (1 << (16 - Self::INDEX_BITS)) - 1;

    /// Fabricates a `SpaceId` for a known task number and generation.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        SpaceId(
            (index as u16 & Self::INDEX_MASK)
                | (gen.0 as u16 & Self::GENERATION_MASK) << Self::INDEX_BITS,
        )
    }

    /// Extracts the task number.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u8)
    }
}

/// Names a particular incarnation of a thread.
///
/// A `ThreadId` is the owning space's `SpaceId` in the top half, and a local
/// part in the bottom half. The local part is the thread's index in the
/// kernel's thread table (`INDEX_BITS` wide) with a generation above it.
///
/// The all-ones `ThreadId` is `NIL`, which can never name a live thread
/// because the thread table is always smaller than the index space.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct ThreadId(pub u32);

impl ThreadId {
    /// The "nobody" thread.
    pub const NIL: Self = Self(!0);

    /// Number of bits in the local part used for the thread table index.
    pub const INDEX_BITS: u32 = 10;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u32 = (1 << Self::INDEX_BITS) - 1;

    /// Mask applied to generation numbers before they are packed.
    pub const GENERATION_MASK: u32 = (1 << (16 - Self::INDEX_BITS)) - 1;

    /// Fabricates a `ThreadId` from its parts.
    pub const fn new(space: SpaceId, index: usize, gen: Generation) -> Self {
        ThreadId(
            (space.0 as u32) << 16
                | (gen.0 as u32 & Self::GENERATION_MASK) << Self::INDEX_BITS
                | (index as u32 & Self::INDEX_MASK),
        )
    }

    /// Extracts the thread table index.
    pub fn index(&self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }

    /// Extracts the generation part of the local id.
    pub fn generation(&self) -> Generation {
        Generation(((self.0 >> Self::INDEX_BITS) & Self::GENERATION_MASK) as u8)
    }

    /// Extracts the owning space.
    pub fn space(&self) -> SpaceId {
        SpaceId((self.0 >> 16) as u16)
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }
}

const_assert!(ThreadId::INDEX_BITS < 16);
const_assert!(SpaceId::INDEX_BITS < 16);

/// Type used to track generation numbers.
///
/// The kernel keeps wider generation counters internally; only the low bits
/// that fit the relevant ID make it across the ABI.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Generation(u8);

impl Generation {
    pub const ZERO: Self = Self(0);
}

impl From<u8> for Generation {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

impl From<Generation> for u8 {
    fn from(g: Generation) -> Self {
        g.0
    }
}

/// Indicates priority of a thread.
///
/// Priorities range over the full `u8`. Numerically *higher* priorities are
/// more important and preempt lower ones, so 255 is the most likely to be
/// scheduled.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// so that comparisons have to say which way they mean it.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// The most important priority.
    pub const MAX: Self = Self(u8::MAX);

    /// Number of distinct priority levels.
    pub const LEVELS: usize = 256;

    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }

    /// Checks whether a thread holding `mcp` as its maximum controlled
    /// priority may hand out `self`.
    pub fn is_within(self, mcp: Self) -> bool {
        self.0 <= mcp.0
    }
}

impl TryFrom<u32> for Priority {
    type Error = UsageError;

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        u8::try_from(x)
            .map(Priority)
            .map_err(|_| UsageError::BadPriority)
    }
}

bitflags::bitflags! {
    /// Access rights carried by a flexpage or held by a mapping.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    #[repr(transparent)]
    pub struct Rights: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;

        const RW = Self::READ.bits() | Self::WRITE.bits();
        const RWX = Self::RW.bits() | Self::EXEC.bits();
    }
}

/// A flexpage: a power-of-two sized, naturally aligned region of a virtual
/// address space, plus rights and a grant flag.
///
/// Layout:
///
/// - bit 0: grant (transfer instead of map)
/// - bits 1..=3: `Rights`
/// - bits 4..=9: log2 of the size in bytes
/// - bits 12..=31: base address, in units of 4 KiB
///
/// The all-zero word is the nil flexpage.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Fpage(pub u32);

impl Fpage {
    pub const NIL: Self = Self(0);

    const GRANT_BIT: u32 = 1 << 0;
    const RIGHTS_SHIFT: u32 = 1;
    const RIGHTS_MASK: u32 = 0b111 << Self::RIGHTS_SHIFT;
    const SIZE_SHIFT: u32 = 4;
    const SIZE_MASK: u32 = 0x3f << Self::SIZE_SHIFT;
    const BASE_MASK: u32 = 0xffff_f000;

    /// Largest size a flexpage can describe: the whole 32-bit space.
    pub const MAX_SIZE_LOG2: u8 = 32;

    /// Smallest base granule the encoding can express.
    pub const MIN_SIZE_LOG2: u8 = 12;

    pub const fn new(base: u32, size_log2: u8, rights: Rights) -> Self {
        Self(
            (base & Self::BASE_MASK)
                | ((size_log2 as u32) << Self::SIZE_SHIFT) & Self::SIZE_MASK
                | ((rights.bits() as u32) << Self::RIGHTS_SHIFT)
                    & Self::RIGHTS_MASK,
        )
    }

    /// The flexpage covering an entire address space.
    pub const fn complete(rights: Rights) -> Self {
        Self::new(0, Self::MAX_SIZE_LOG2, rights)
    }

    /// Returns a copy of `self` marked for granting.
    pub const fn granted(self) -> Self {
        Self(self.0 | Self::GRANT_BIT)
    }

    pub fn base(self) -> u32 {
        self.0 & Self::BASE_MASK
    }

    pub fn size_log2(self) -> u8 {
        ((self.0 & Self::SIZE_MASK) >> Self::SIZE_SHIFT) as u8
    }

    /// Size in bytes. This is a `u64` because the complete flexpage is 2^32
    /// bytes long.
    pub fn size(self) -> u64 {
        1 << self.size_log2()
    }

    /// One past the last byte, again as a `u64`.
    pub fn end(self) -> u64 {
        u64::from(self.base()) + self.size()
    }

    pub fn rights(self) -> Rights {
        Rights::from_bits_truncate(
            ((self.0 & Self::RIGHTS_MASK) >> Self::RIGHTS_SHIFT) as u8,
        )
    }

    pub fn is_grant(self) -> bool {
        self.0 & Self::GRANT_BIT != 0
    }

    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }

    /// Checks whether the flexpage is well formed for a kernel whose
    /// smallest page is `1 << page_shift` bytes.
    pub fn validate(self, page_shift: u8) -> Result<Self, UsageError> {
        let log2 = self.size_log2();
        if log2 < page_shift.max(Self::MIN_SIZE_LOG2)
            || log2 > Self::MAX_SIZE_LOG2
        {
            return Err(UsageError::InvalidFpage);
        }
        if u64::from(self.base()) % self.size() != 0 {
            return Err(UsageError::InvalidFpage);
        }
        Ok(self)
    }
}

/// A decoded timeout for one IPC phase.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimeoutValue {
    /// Wait as long as it takes.
    Never,
    /// Don't wait at all.
    Zero,
    /// Wait this many microseconds.
    Micros(u64),
}

impl TimeoutValue {
    /// Packs this value into an exponent/mantissa pair, rounding up to the
    /// next representable value if needed.
    fn encode(self) -> (u8, u8) {
        match self {
            TimeoutValue::Never => (0, 0),
            TimeoutValue::Zero => (0, 1),
            TimeoutValue::Micros(0) => (0, 1),
            TimeoutValue::Micros(us) => {
                for exp in (1..=15u8).rev() {
                    let unit = 1u64 << (2 * u32::from(15 - exp));
                    let man = us.div_ceil(unit);
                    if man <= 0xff {
                        return (man as u8, exp);
                    }
                }
                // Saturate at the longest finite timeout.
                (0xff, 1)
            }
        }
    }

    fn decode(man: u8, exp: u8) -> Self {
        if exp == 0 {
            TimeoutValue::Never
        } else if man == 0 {
            TimeoutValue::Zero
        } else {
            TimeoutValue::Micros(
                u64::from(man) << (2 * u32::from(15 - exp)),
            )
        }
    }
}

/// The IPC timeout pair, in the L4 exponent/mantissa encoding.
///
/// - bits 0..=3: receive exponent
/// - bits 4..=7: send exponent
/// - bits 16..=23: send mantissa
/// - bits 24..=31: receive mantissa
///
/// An exponent of zero means "never time out". Otherwise the timeout is
/// `mantissa * 4^(15 - exponent)` microseconds, and a zero mantissa means
/// "time out immediately".
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Timeout(pub u32);

impl Timeout {
    /// Both phases wait forever.
    pub const NEVER: Self = Self(0);
    /// Both phases give up immediately.
    pub const ZERO: Self = Self(0x11);

    pub fn new(send: TimeoutValue, receive: TimeoutValue) -> Self {
        let (sman, sexp) = send.encode();
        let (rman, rexp) = receive.encode();
        Self(
            u32::from(rexp & 0xf)
                | u32::from(sexp & 0xf) << 4
                | u32::from(sman) << 16
                | u32::from(rman) << 24,
        )
    }

    pub fn send(self) -> TimeoutValue {
        TimeoutValue::decode((self.0 >> 16) as u8, ((self.0 >> 4) & 0xf) as u8)
    }

    pub fn receive(self) -> TimeoutValue {
        TimeoutValue::decode((self.0 >> 24) as u8, (self.0 & 0xf) as u8)
    }
}

/// Outcome of an IPC, as seen by one side.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum IpcStatus {
    Ok,
    /// The partner does not exist (or stopped existing while we waited).
    NotExistent,
    Timeout,
    /// The phase was canceled from outside.
    Canceled,
    /// A flexpage could not be mapped.
    MapFailed,
    /// The partner went away in the middle of a handshake.
    Aborted,
    /// The receive buffer was smaller than the string. The prefix was
    /// delivered.
    MessageCut,
}

/// Which half of an IPC a status refers to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum IpcPhase {
    Send,
    Receive,
}

/// Message dope: the status word returned in `ret0` by the IPC syscall.
///
/// - bit 1: a flexpage was received
/// - bits 4..=7: error code; zero is success, and odd codes are send-phase
///   errors
/// - bits 8..=12: number of strings received
/// - bits 13..=18: number of words received
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct MsgDope(pub u32);

impl MsgDope {
    const FPAGE_BIT: u32 = 1 << 1;
    const ERROR_SHIFT: u32 = 4;
    const ERROR_MASK: u32 = 0xf << Self::ERROR_SHIFT;
    const STRINGS_SHIFT: u32 = 8;
    const STRINGS_MASK: u32 = 0x1f << Self::STRINGS_SHIFT;
    const WORDS_SHIFT: u32 = 13;
    const WORDS_MASK: u32 = 0x3f << Self::WORDS_SHIFT;

    pub const OK: Self = Self(0);

    /// Builds the dope for a failed (or cut) IPC.
    pub fn error(status: IpcStatus, phase: IpcPhase) -> Self {
        let code: u32 = match (status, phase) {
            (IpcStatus::Ok, _) => 0x0,
            (IpcStatus::NotExistent, IpcPhase::Receive) => 0x8,
            (IpcStatus::NotExistent, IpcPhase::Send) => 0x1,
            (IpcStatus::Timeout, IpcPhase::Receive) => 0x2,
            (IpcStatus::Timeout, IpcPhase::Send) => 0x3,
            (IpcStatus::Canceled, IpcPhase::Receive) => 0x4,
            (IpcStatus::Canceled, IpcPhase::Send) => 0x5,
            (IpcStatus::MapFailed, IpcPhase::Receive) => 0x6,
            (IpcStatus::MapFailed, IpcPhase::Send) => 0x7,
            (IpcStatus::Aborted, IpcPhase::Receive) => 0xc,
            (IpcStatus::Aborted, IpcPhase::Send) => 0xd,
            (IpcStatus::MessageCut, IpcPhase::Receive) => 0xe,
            (IpcStatus::MessageCut, IpcPhase::Send) => 0xf,
        };
        Self(code << Self::ERROR_SHIFT)
    }

    /// The raw error byte, as L4 documents it (`0x10`..`0xf0`).
    pub fn error_code(self) -> u8 {
        (self.0 & Self::ERROR_MASK) as u8
    }

    pub fn status(self) -> IpcStatus {
        match self.error_code() >> Self::ERROR_SHIFT {
            0x0 => IpcStatus::Ok,
            0x1 | 0x8 => IpcStatus::NotExistent,
            0x2 | 0x3 => IpcStatus::Timeout,
            0x4 | 0x5 => IpcStatus::Canceled,
            0x6 | 0x7 => IpcStatus::MapFailed,
            0xc | 0xd => IpcStatus::Aborted,
            0xe | 0xf => IpcStatus::MessageCut,
            // 0x9..=0xb are unassigned and never produced by the kernel.
            _ => IpcStatus::Aborted,
        }
    }

    /// Phase the error happened in, or `None` on success.
    pub fn phase(self) -> Option<IpcPhase> {
        match self.error_code() {
            0 => None,
            c if c & 0x10 != 0 => Some(IpcPhase::Send),
            _ => Some(IpcPhase::Receive),
        }
    }

    pub fn with_fpage(self) -> Self {
        Self(self.0 | Self::FPAGE_BIT)
    }

    pub fn fpage_received(self) -> bool {
        self.0 & Self::FPAGE_BIT != 0
    }

    pub fn with_words(self, n: usize) -> Self {
        Self(
            (self.0 & !Self::WORDS_MASK)
                | ((n as u32) << Self::WORDS_SHIFT) & Self::WORDS_MASK,
        )
    }

    pub fn words(self) -> usize {
        ((self.0 & Self::WORDS_MASK) >> Self::WORDS_SHIFT) as usize
    }

    pub fn with_strings(self, n: usize) -> Self {
        Self(
            (self.0 & !Self::STRINGS_MASK)
                | ((n as u32) << Self::STRINGS_SHIFT) & Self::STRINGS_MASK,
        )
    }

    pub fn strings(self) -> usize {
        ((self.0 & Self::STRINGS_MASK) >> Self::STRINGS_SHIFT) as usize
    }
}

/// Value of a send or receive descriptor argument meaning "skip this phase".
pub const NIL_DESCRIPTOR: u32 = !0;

/// Number of untyped words carried in registers by every message.
pub const MESSAGE_WORDS: usize = 3;

bitflags::bitflags! {
    /// Send descriptor bits.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct SendFlags: u32 {
        /// Words 0 and 1 carry a hot spot and a flexpage to map or grant.
        const MAP = 1 << 0;
        /// A string is attached (arg8/arg9).
        const STRING = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Receive descriptor bits.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct RecvFlags: u32 {
        /// Accept a message from anyone rather than from `dest`.
        const OPEN = 1 << 0;
        /// arg7 is a receive window for flexpages.
        const MAP_WINDOW = 1 << 1;
        /// A string buffer is offered (arg10/arg11).
        const STRING = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Options to the unmap syscall.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct UnmapFlags: u32 {
        /// Remove the caller's own mapping, not just those derived from it.
        const SELF = 1 << 0;
        /// Remove descendants of every removed mapping too. Without this,
        /// descendants are re-parented one level up.
        const RECURSIVE = 1 << 1;
        /// Take away write access instead of unmapping.
        const DOWNGRADE = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Thread scheduling and IPC state. States combine.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct ThreadState: u32 {
        /// Eligible to run.
        const READY = 1 << 0;
        /// Blocked for any sender (open receive).
        const WAITING = 1 << 1;
        /// Blocked for a specific partner (closed receive).
        const RECEIVING = 1 << 2;
        /// Blocked sending to a specific partner.
        const POLLING = 1 << 3;
        /// Part of a multi-phase IPC (a call awaiting its reply).
        const IPC_IN_PROGRESS = 1 << 4;
        const SEND_IN_PROGRESS = 1 << 5;
        /// Receive handshake incomplete.
        const BUSY = 1 << 6;
        /// Someone asked this thread to abort whatever it is waiting for.
        const CANCEL = 1 << 7;
        const DEAD = 1 << 8;
        /// Stopped by a fault; see the thread's recorded `FaultInfo`.
        const FAULTED = 1 << 9;

        const IPC_SENDING = Self::SEND_IN_PROGRESS.bits() | Self::POLLING.bits();
        const IPC_RECEIVING =
            Self::WAITING.bits() | Self::RECEIVING.bits() | Self::BUSY.bits();
        const BLOCKED =
            Self::WAITING.bits() | Self::RECEIVING.bits() | Self::POLLING.bits();
    }
}

impl ThreadState {
    /// The empty state: a thread table slot with nobody in it.
    pub const INVALID: Self = Self::empty();
}

/// Status codes returned in `ret0` by the non-IPC syscalls.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ResponseCode {
    Ok = 0,
    /// A named thread or space does not exist.
    NotExistent = 1,
    /// The caller may not operate on the named object.
    NoPermission = 2,
    /// A kernel table is full.
    NoMemory = 3,
    /// The request is well formed but makes no sense in the current state.
    Invalid = 4,
    /// A mapping could not be established.
    MapFailed = 5,
}

impl From<ResponseCode> for u32 {
    fn from(c: ResponseCode) -> Self {
        c as u32
    }
}

impl TryFrom<u32> for ResponseCode {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Ok),
            1 => Ok(Self::NotExistent),
            2 => Ok(Self::NoPermission),
            3 => Ok(Self::NoMemory),
            4 => Ok(Self::Invalid),
            5 => Ok(Self::MapFailed),
            _ => Err(()),
        }
    }
}

/// A record describing a fault taken by a thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultInfo {
    /// The thread asked the kernel to touch memory it can't access.
    MemoryAccess {
        /// Problematic address, if known.
        address: Option<u32>,
        /// Origin of the fault.
        source: FaultSource,
    },
    /// Arguments passed to a syscall were invalid.
    SyscallUsage(UsageError),
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

/// A kernel-defined fault, arising from how a user thread behaved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum UsageError {
    /// A program used an undefined syscall number.
    BadSyscallNumber,
    /// A program specified a slice as a syscall argument, but the slice would
    /// wrap around the end of the address space.
    InvalidSlice,
    /// A flexpage is misaligned or has an impossible size.
    InvalidFpage,
    /// A send or receive descriptor has unknown bits set, or combines phases
    /// in a way the kernel doesn't support.
    InvalidDescriptor,
    /// A priority argument doesn't fit in a `u8`.
    BadPriority,
}

/// Origin of a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultSource {
    /// User code did something that was intercepted by the processor.
    User,
    /// User code asked the kernel to do something bad on its behalf.
    Kernel,
}

/// Enumeration of syscall numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    Ipc = 0,
    Map = 1,
    Unmap = 2,
    CreateThread = 3,
    DestroyThread = 4,
    SetPriority = 5,
    Yield = 6,
    ThreadSwitch = 7,
    CreateSpace = 8,
    DestroySpace = 9,
    Cancel = 10,
    ThreadInfo = 11,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't depend on `num-traits` and this
/// seems okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Ipc),
            1 => Ok(Self::Map),
            2 => Ok(Self::Unmap),
            3 => Ok(Self::CreateThread),
            4 => Ok(Self::DestroyThread),
            5 => Ok(Self::SetPriority),
            6 => Ok(Self::Yield),
            7 => Ok(Self::ThreadSwitch),
            8 => Ok(Self::CreateSpace),
            9 => Ok(Self::DestroySpace),
            10 => Ok(Self::Cancel),
            11 => Ok(Self::ThreadInfo),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_packs_space_and_local_parts() {
        let space = SpaceId::for_index_and_gen(3, Generation::from(7));
        let id = ThreadId::new(space, 0x155, Generation::from(0x2a));
        assert_eq!(id.space(), space);
        assert_eq!(id.index(), 0x155);
        assert_eq!(id.generation(), Generation::from(0x2a));
        assert!(!id.is_nil());
        assert_eq!(ThreadId::NIL.index(), ThreadId::INDEX_MASK as usize);
    }

    #[test]
    fn generations_are_truncated_to_their_field() {
        let id = ThreadId::new(SpaceId(0), 1, Generation::from(0xff));
        assert_eq!(
            u8::from(id.generation()),
            ThreadId::GENERATION_MASK as u8,
            "generation should be masked, not spill into the space id"
        );
        assert_eq!(id.space(), SpaceId(0));
    }

    #[test]
    fn timeout_decoding_follows_exponent_rules() {
        assert_eq!(Timeout::NEVER.send(), TimeoutValue::Never);
        assert_eq!(Timeout::NEVER.receive(), TimeoutValue::Never);
        assert_eq!(Timeout::ZERO.send(), TimeoutValue::Zero);
        assert_eq!(Timeout::ZERO.receive(), TimeoutValue::Zero);

        // man=1, exp=14 for send: 1 * 4^1 = 4us. Receive stays infinite.
        let t = Timeout(0x0001_00e0);
        assert_eq!(t.send(), TimeoutValue::Micros(4));
        assert_eq!(t.receive(), TimeoutValue::Never);
    }

    #[test]
    fn timeout_encoding_rounds_up() {
        let t = Timeout::new(TimeoutValue::Micros(1000), TimeoutValue::Zero);
        assert_eq!(t.receive(), TimeoutValue::Zero);
        match t.send() {
            TimeoutValue::Micros(us) => assert!(
                (1000..1000 + 1000 / 64 + 4).contains(&us),
                "1000us should encode to something slightly larger, got {us}"
            ),
            other => panic!("expected finite send timeout, got {other:?}"),
        }
        let exact = Timeout::new(TimeoutValue::Micros(200), TimeoutValue::Never);
        assert_eq!(exact.send(), TimeoutValue::Micros(200));
    }

    #[test]
    fn fpage_fields_round_trip() {
        let f = Fpage::new(0x0040_0000, 22, Rights::RW).granted();
        assert_eq!(f.base(), 0x0040_0000);
        assert_eq!(f.size_log2(), 22);
        assert_eq!(f.rights(), Rights::RW);
        assert!(f.is_grant());
        assert_eq!(f.validate(12), Ok(f));
    }

    #[test]
    fn fpage_validation_rejects_misalignment_and_tiny_sizes() {
        assert_eq!(
            Fpage::new(0x1000, 13, Rights::READ).validate(12),
            Err(UsageError::InvalidFpage),
            "8 KiB flexpage at a 4 KiB boundary is misaligned"
        );
        assert_eq!(
            Fpage::new(0, 11, Rights::READ).validate(12),
            Err(UsageError::InvalidFpage),
        );
        assert!(Fpage::complete(Rights::RWX).validate(12).is_ok());
        assert_eq!(Fpage::complete(Rights::RWX).end(), 1 << 32);
    }

    #[test]
    fn dope_codes_match_l4_values() {
        let cases = [
            (IpcStatus::NotExistent, IpcPhase::Send, 0x10),
            (IpcStatus::NotExistent, IpcPhase::Receive, 0x80),
            (IpcStatus::Timeout, IpcPhase::Receive, 0x20),
            (IpcStatus::Timeout, IpcPhase::Send, 0x30),
            (IpcStatus::Canceled, IpcPhase::Receive, 0x40),
            (IpcStatus::Canceled, IpcPhase::Send, 0x50),
            (IpcStatus::MapFailed, IpcPhase::Receive, 0x60),
            (IpcStatus::MapFailed, IpcPhase::Send, 0x70),
            (IpcStatus::Aborted, IpcPhase::Receive, 0xc0),
            (IpcStatus::Aborted, IpcPhase::Send, 0xd0),
            (IpcStatus::MessageCut, IpcPhase::Receive, 0xe0),
            (IpcStatus::MessageCut, IpcPhase::Send, 0xf0),
        ];
        for (status, phase, code) in cases {
            let d = MsgDope::error(status, phase).with_words(3);
            assert_eq!(d.error_code(), code, "{status:?}/{phase:?}");
            assert_eq!(d.status(), status);
            assert_eq!(d.phase(), Some(phase));
            assert_eq!(d.words(), 3);
        }
        assert_eq!(MsgDope::OK.status(), IpcStatus::Ok);
        assert_eq!(MsgDope::OK.phase(), None);
    }
}
