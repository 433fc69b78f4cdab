//! Trace record types shared between the instrumentation layer and pmcheck.
//!
//! The [`RawTraceEntry`] struct matches the producer's C `trace_entry_t`
//! on x86-64 exactly (56 bytes).  Higher-level [`TraceEvent`] keeps only the
//! fields that are meaningful for each kind of operation.

use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════
//  Identifiers
// ═══════════════════════════════════════════════════════════════════════

/// Half-open address range `[base, base + size)` in the 64-bit space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressRange {
    pub base: u64,
    pub size: u64,
}

impl AddressRange {
    pub const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    /// Range covering `[start, end)`.
    pub fn from_bounds(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self {
            base: start,
            size: end - start,
        }
    }

    /// One past the last byte.  Saturates at the top of the address space.
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether the two ranges share at least one byte.
    pub fn intersects(&self, other: &AddressRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.base < other.end() && other.base < self.end()
    }

    /// Whether `other` lies entirely inside `self`.
    pub fn contains_range(&self, other: &AddressRange) -> bool {
        other.base >= self.base && other.end() <= self.end()
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.base, self.end())
    }
}

/// Thread id as reported by the instrumentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Which half of a failure-point iteration an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// The original run, up to the simulated crash.
    PreFailure,
    /// The recovery run against the crashed image.
    PostFailure,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreFailure => f.write_str("pre-failure"),
            Self::PostFailure => f.write_str("post-failure"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Raw record (matches the producer struct exactly)
// ═══════════════════════════════════════════════════════════════════════

/// Size of one record on the wire.
pub const RAW_ENTRY_SIZE: usize = 56;

/// Raw 56-byte record as written by the instrumentation layer.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x00    4     kind
/// 0x04    1     is_return
/// 0x05    3     (padding)
/// 0x08    4     thread_id
/// 0x0C    4     (padding)
/// 0x10    8     src_addr
/// 0x18    8     dst_addr
/// 0x20    8     size
/// 0x28    8     instr_ptr
/// 0x30    4     non_temporal
/// 0x34    4     (padding)
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawTraceEntry {
    pub kind: u32,
    pub is_return: u8,
    pub _pad0: [u8; 3],
    pub thread_id: i32,
    pub _pad1: u32,
    pub src_addr: u64,
    pub dst_addr: u64,
    pub size: u64,
    pub instr_ptr: u64,
    pub non_temporal: i32,
    pub _pad2: u32,
}

const _: () = assert!(std::mem::size_of::<RawTraceEntry>() == RAW_ENTRY_SIZE);

impl RawTraceEntry {
    /// Decode one record from native-endian bytes.
    pub fn from_bytes(buf: &[u8; RAW_ENTRY_SIZE]) -> Self {
        let u32_at = |off: usize| u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap_or_default());
        let i32_at = |off: usize| i32::from_ne_bytes(buf[off..off + 4].try_into().unwrap_or_default());
        let u64_at = |off: usize| u64::from_ne_bytes(buf[off..off + 8].try_into().unwrap_or_default());
        Self {
            kind: u32_at(0x00),
            is_return: buf[0x04],
            _pad0: [0; 3],
            thread_id: i32_at(0x08),
            _pad1: 0,
            src_addr: u64_at(0x10),
            dst_addr: u64_at(0x18),
            size: u64_at(0x20),
            instr_ptr: u64_at(0x28),
            non_temporal: i32_at(0x30),
            _pad2: 0,
        }
    }

    /// Encode to the on-wire layout (padding zeroed).
    pub fn to_bytes(&self) -> [u8; RAW_ENTRY_SIZE] {
        let mut buf = [0u8; RAW_ENTRY_SIZE];
        buf[0x00..0x04].copy_from_slice(&self.kind.to_ne_bytes());
        buf[0x04] = self.is_return;
        buf[0x08..0x0C].copy_from_slice(&self.thread_id.to_ne_bytes());
        buf[0x10..0x18].copy_from_slice(&self.src_addr.to_ne_bytes());
        buf[0x18..0x20].copy_from_slice(&self.dst_addr.to_ne_bytes());
        buf[0x20..0x28].copy_from_slice(&self.size.to_ne_bytes());
        buf[0x28..0x30].copy_from_slice(&self.instr_ptr.to_ne_bytes());
        buf[0x30..0x34].copy_from_slice(&self.non_temporal.to_ne_bytes());
        buf
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Wire discriminants (must match the producer)
// ═══════════════════════════════════════════════════════════════════════

/// Record kinds in the producer's numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum WireKind {
    Invalid = 0,
    TraceBegin = 1,
    TraceEnd = 2,
    TestingEnd = 3,
    Read = 4,
    Write = 5,
    Clwb = 6,
    Sfence = 7,
    MapFile = 8,
    Unmap = 9,
    PmAddrAdd = 10,
    PmAddrRemove = 11,
    TxBegin = 12,
    TxEnd = 13,
    TxAddrAdd = 14,
    TxAlloc = 15,
    InternalCall = 16,
    InternalReturn = 17,
    AddCommitVar = 18,
    DetectionSkipBegin = 19,
    DetectionSkipEnd = 20,
}

impl WireKind {
    const ALL: [WireKind; 21] = [
        Self::Invalid,
        Self::TraceBegin,
        Self::TraceEnd,
        Self::TestingEnd,
        Self::Read,
        Self::Write,
        Self::Clwb,
        Self::Sfence,
        Self::MapFile,
        Self::Unmap,
        Self::PmAddrAdd,
        Self::PmAddrRemove,
        Self::TxBegin,
        Self::TxEnd,
        Self::TxAddrAdd,
        Self::TxAlloc,
        Self::InternalCall,
        Self::InternalReturn,
        Self::AddCommitVar,
        Self::DetectionSkipBegin,
        Self::DetectionSkipEnd,
    ];

    /// Convert a `u32` discriminant to a [`WireKind`], if valid.
    pub fn from_u32(v: u32) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    /// Name of the producer-side operation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::TraceBegin => "trace_begin",
            Self::TraceEnd => "trace_end",
            Self::TestingEnd => "testing_end",
            Self::Read => "read",
            Self::Write => "write",
            Self::Clwb => "clwb",
            Self::Sfence => "sfence",
            Self::MapFile => "pmem_map_file",
            Self::Unmap => "pmem_unmap",
            Self::PmAddrAdd => "pm_addr_add",
            Self::PmAddrRemove => "pm_addr_remove",
            Self::TxBegin => "tx_begin",
            Self::TxEnd => "tx_end",
            Self::TxAddrAdd => "tx_addr_add",
            Self::TxAlloc => "tx_alloc",
            Self::InternalCall => "internal_call",
            Self::InternalReturn => "internal_ret",
            Self::AddCommitVar => "add_commit_var",
            Self::DetectionSkipBegin => "detection_skip_begin",
            Self::DetectionSkipEnd => "detection_skip_end",
        }
    }
}

impl fmt::Display for WireKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Typed event (parsed from RawTraceEntry)
// ═══════════════════════════════════════════════════════════════════════

/// A decoded trace event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Position of the record in its stream (0-based).
    pub seq: u64,
    /// Thread that performed the operation.
    pub tid: ThreadId,
    /// Instruction pointer of the operation (or call site).
    pub ip: u64,
    pub kind: EventKind,
}

/// Operation payload, carrying only the fields meaningful for the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    TraceBegin,
    /// The pre-failure run reached a failure point and is paused.
    TraceEnd,
    /// No further failure points (pre-failure) / recovery done (post-failure).
    TestingEnd,
    Read { range: AddressRange },
    Write { range: AddressRange, non_temporal: bool },
    /// Cache-line writeback (clwb/clflushopt).
    Flush { range: AddressRange },
    /// Store fence draining pending writebacks.
    Drain,
    Allocate { range: AddressRange },
    Deallocate { range: AddressRange },
    TxBegin,
    TxEnd,
    /// Range logged into the current transaction before modification.
    TxAddrAdd { range: AddressRange },
    /// Range allocated inside the current transaction.
    TxAlloc { range: AddressRange },
    InternalCallEnter,
    InternalCallExit,
    AddCommitVar { range: AddressRange },
    DetectionSkipBegin,
    DetectionSkipEnd,
}

impl EventKind {
    /// Short name used in logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TraceBegin => "trace_begin",
            Self::TraceEnd => "trace_end",
            Self::TestingEnd => "testing_end",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Flush { .. } => "flush",
            Self::Drain => "drain",
            Self::Allocate { .. } => "allocate",
            Self::Deallocate { .. } => "deallocate",
            Self::TxBegin => "tx_begin",
            Self::TxEnd => "tx_end",
            Self::TxAddrAdd { .. } => "tx_addr_add",
            Self::TxAlloc { .. } => "tx_alloc",
            Self::InternalCallEnter => "internal_call",
            Self::InternalCallExit => "internal_ret",
            Self::AddCommitVar { .. } => "add_commit_var",
            Self::DetectionSkipBegin => "detection_skip_begin",
            Self::DetectionSkipEnd => "detection_skip_end",
        }
    }

    /// Address range the operation touches, if it has one.
    pub fn range(&self) -> Option<AddressRange> {
        match *self {
            Self::Read { range }
            | Self::Write { range, .. }
            | Self::Flush { range }
            | Self::Allocate { range }
            | Self::Deallocate { range }
            | Self::TxAddrAdd { range }
            | Self::TxAlloc { range }
            | Self::AddCommitVar { range } => Some(range),
            _ => None,
        }
    }
}

impl TraceEvent {
    /// Parse a [`RawTraceEntry`] into a typed event.
    ///
    /// Returns `Ok(None)` for records that carry no information for the
    /// checker: return-instances of everything except `pmem_map_file`, and
    /// the call-instance of `pmem_map_file` (its address is only known on
    /// return).
    pub fn from_raw(raw: &RawTraceEntry, seq: u64) -> Result<Option<Self>, ProtocolError> {
        let wire = WireKind::from_u32(raw.kind).ok_or(ProtocolError::UnknownKind {
            kind: raw.kind,
            index: seq,
        })?;
        if wire == WireKind::Invalid {
            return Err(ProtocolError::InvalidRecord { index: seq });
        }
        let tid = u32::try_from(raw.thread_id).map_err(|_| ProtocolError::BadThreadId {
            tid: raw.thread_id,
            index: seq,
        })?;

        let is_return = raw.is_return != 0;
        if is_return != (wire == WireKind::MapFile) {
            return Ok(None);
        }

        let src = AddressRange::new(raw.src_addr, raw.size);
        let dst = AddressRange::new(raw.dst_addr, raw.size);
        let kind = match wire {
            WireKind::Invalid => unreachable!("rejected above"),
            WireKind::TraceBegin => EventKind::TraceBegin,
            WireKind::TraceEnd => EventKind::TraceEnd,
            WireKind::TestingEnd => EventKind::TestingEnd,
            WireKind::Read => EventKind::Read { range: src },
            WireKind::Write => EventKind::Write {
                range: dst,
                non_temporal: raw.non_temporal != 0,
            },
            WireKind::Clwb => EventKind::Flush { range: src },
            WireKind::Sfence => EventKind::Drain,
            WireKind::MapFile | WireKind::PmAddrAdd => EventKind::Allocate { range: dst },
            WireKind::Unmap | WireKind::PmAddrRemove => EventKind::Deallocate { range: src },
            WireKind::TxBegin => EventKind::TxBegin,
            WireKind::TxEnd => EventKind::TxEnd,
            WireKind::TxAddrAdd => EventKind::TxAddrAdd { range: dst },
            WireKind::TxAlloc => EventKind::TxAlloc { range: dst },
            WireKind::InternalCall => EventKind::InternalCallEnter,
            WireKind::InternalReturn => EventKind::InternalCallExit,
            WireKind::AddCommitVar => EventKind::AddCommitVar { range: src },
            WireKind::DetectionSkipBegin => EventKind::DetectionSkipBegin,
            WireKind::DetectionSkipEnd => EventKind::DetectionSkipEnd,
        };

        Ok(Some(TraceEvent {
            seq,
            tid: ThreadId(tid),
            ip: raw.instr_ptr,
            kind,
        }))
    }

    /// Encode back into a wire record.  Used by recorders and tests that
    /// play the producer's role.  Thread ids above `i32::MAX` have no wire
    /// form.
    pub fn to_raw(&self) -> Result<RawTraceEntry, ProtocolError> {
        let thread_id = i32::try_from(self.tid.0).map_err(|_| ProtocolError::UnencodableThreadId {
            tid: self.tid.0,
            index: self.seq,
        })?;
        let mut raw = RawTraceEntry {
            thread_id,
            instr_ptr: self.ip,
            ..Default::default()
        };
        let (wire, src, dst) = match self.kind {
            EventKind::TraceBegin => (WireKind::TraceBegin, None, None),
            EventKind::TraceEnd => (WireKind::TraceEnd, None, None),
            EventKind::TestingEnd => (WireKind::TestingEnd, None, None),
            EventKind::Read { range } => (WireKind::Read, Some(range), None),
            EventKind::Write { range, non_temporal } => {
                raw.non_temporal = i32::from(non_temporal);
                (WireKind::Write, None, Some(range))
            }
            EventKind::Flush { range } => (WireKind::Clwb, Some(range), None),
            EventKind::Drain => (WireKind::Sfence, None, None),
            EventKind::Allocate { range } => (WireKind::PmAddrAdd, None, Some(range)),
            EventKind::Deallocate { range } => (WireKind::PmAddrRemove, Some(range), None),
            EventKind::TxBegin => (WireKind::TxBegin, None, None),
            EventKind::TxEnd => (WireKind::TxEnd, None, None),
            EventKind::TxAddrAdd { range } => (WireKind::TxAddrAdd, None, Some(range)),
            EventKind::TxAlloc { range } => (WireKind::TxAlloc, None, Some(range)),
            EventKind::InternalCallEnter => (WireKind::InternalCall, None, None),
            EventKind::InternalCallExit => (WireKind::InternalReturn, None, None),
            EventKind::AddCommitVar { range } => (WireKind::AddCommitVar, Some(range), None),
            EventKind::DetectionSkipBegin => (WireKind::DetectionSkipBegin, None, None),
            EventKind::DetectionSkipEnd => (WireKind::DetectionSkipEnd, None, None),
        };
        raw.kind = wire as u32;
        if let Some(r) = src {
            raw.src_addr = r.base;
            raw.size = r.size;
        }
        if let Some(r) = dst {
            raw.dst_addr = r.base;
            raw.size = r.size;
        }
        Ok(raw)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Display
// ═══════════════════════════════════════════════════════════════════════

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:>8}] {} ip={:#x} {:<20}", self.seq, self.tid, self.ip, self.kind.name())?;
        match self.kind {
            EventKind::Write {
                range,
                non_temporal: true,
            } => write!(f, " {} (non-temporal)", range),
            _ => match self.kind.range() {
                Some(range) => write!(f, " {}", range),
                None => Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(kind: WireKind) -> RawTraceEntry {
        RawTraceEntry {
            kind: kind as u32,
            thread_id: 3,
            instr_ptr: 0x4000,
            ..Default::default()
        }
    }

    #[test]
    fn raw_entry_size() {
        assert_eq!(std::mem::size_of::<RawTraceEntry>(), RAW_ENTRY_SIZE);
    }

    #[test]
    fn wire_kind_discriminants() {
        for v in 0..=20 {
            assert_eq!(WireKind::from_u32(v).unwrap() as u32, v);
        }
        assert!(WireKind::from_u32(21).is_none());
    }

    #[test]
    fn write_uses_destination_address() {
        let mut r = raw(WireKind::Write);
        r.src_addr = 0xdead;
        r.dst_addr = 0x1000;
        r.size = 8;
        r.non_temporal = 1;
        let ev = TraceEvent::from_raw(&r, 7).unwrap().unwrap();
        assert_eq!(ev.seq, 7);
        assert_eq!(ev.tid, ThreadId(3));
        assert_eq!(
            ev.kind,
            EventKind::Write {
                range: AddressRange::new(0x1000, 8),
                non_temporal: true
            }
        );
    }

    #[test]
    fn read_and_flush_use_source_address() {
        let mut r = raw(WireKind::Clwb);
        r.src_addr = 0x2000;
        r.dst_addr = 0xdead;
        r.size = 64;
        let ev = TraceEvent::from_raw(&r, 0).unwrap().unwrap();
        assert_eq!(ev.kind, EventKind::Flush { range: AddressRange::new(0x2000, 64) });
    }

    #[test]
    fn map_file_only_meaningful_on_return() {
        let mut r = raw(WireKind::MapFile);
        r.dst_addr = 0x1_0000;
        r.size = 0x1000;
        assert_eq!(TraceEvent::from_raw(&r, 0).unwrap(), None);

        r.is_return = 1;
        let ev = TraceEvent::from_raw(&r, 1).unwrap().unwrap();
        assert_eq!(ev.kind, EventKind::Allocate { range: AddressRange::new(0x1_0000, 0x1000) });
    }

    #[test]
    fn return_instances_of_other_kinds_are_ignored() {
        let mut r = raw(WireKind::TxBegin);
        r.is_return = 1;
        assert_eq!(TraceEvent::from_raw(&r, 0).unwrap(), None);
    }

    #[test]
    fn invalid_and_unknown_kinds_are_errors() {
        assert_eq!(
            TraceEvent::from_raw(&raw(WireKind::Invalid), 4),
            Err(ProtocolError::InvalidRecord { index: 4 })
        );
        let mut r = raw(WireKind::Read);
        r.kind = 99;
        assert_eq!(
            TraceEvent::from_raw(&r, 5),
            Err(ProtocolError::UnknownKind { kind: 99, index: 5 })
        );
    }

    #[test]
    fn encode_decode_preserves_event() {
        let ev = TraceEvent {
            seq: 12,
            tid: ThreadId(1),
            ip: 0x4242,
            kind: EventKind::TxAddrAdd { range: AddressRange::new(0x1000, 32) },
        };
        let bytes = ev.to_raw().unwrap().to_bytes();
        let back = TraceEvent::from_raw(&RawTraceEntry::from_bytes(&bytes), 12)
            .unwrap()
            .unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn thread_id_beyond_wire_range_is_rejected() {
        let mut ev = TraceEvent {
            seq: 3,
            tid: ThreadId(u32::MAX),
            ip: 0x4242,
            kind: EventKind::Drain,
        };
        assert_eq!(
            ev.to_raw(),
            Err(ProtocolError::UnencodableThreadId { tid: u32::MAX, index: 3 })
        );
        ev.tid = ThreadId(i32::MAX as u32);
        assert_eq!(ev.to_raw().map(|raw| raw.thread_id), Ok(i32::MAX));
    }

    #[test]
    fn range_overlap_and_containment() {
        let a = AddressRange::new(0x1000, 0x100);
        let b = AddressRange::new(0x10f0, 0x20);
        assert!(a.intersects(&b));
        assert!(!a.contains_range(&b));
        assert!(a.contains_range(&AddressRange::new(0x1010, 0x10)));
        assert!(!a.intersects(&AddressRange::new(0x1100, 8)));
    }
}
