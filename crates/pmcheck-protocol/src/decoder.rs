//! Incremental decoding of a raw record stream.
//!
//! Reads from a pipe return whatever bytes are available, which need not
//! end on a record boundary.  [`RecordDecoder`] buffers the tail of a
//! partial record until the next chunk completes it.

use crate::events::{RawTraceEntry, TraceEvent, RAW_ENTRY_SIZE};
use crate::ProtocolError;

/// Streaming decoder for one trace channel.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    pending: Vec<u8>,
    next_index: u64,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode every complete record in `pending ++ chunk`.
    ///
    /// Records that carry no information (see [`TraceEvent::from_raw`]) are
    /// consumed but produce no event.  Stops at the first malformed record.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<TraceEvent>, ProtocolError> {
        self.pending.extend_from_slice(chunk);
        let complete = self.pending.len() / RAW_ENTRY_SIZE * RAW_ENTRY_SIZE;

        let mut events = Vec::with_capacity(complete / RAW_ENTRY_SIZE);
        for record in self.pending[..complete].chunks_exact(RAW_ENTRY_SIZE) {
            let mut buf = [0u8; RAW_ENTRY_SIZE];
            buf.copy_from_slice(record);
            let raw = RawTraceEntry::from_bytes(&buf);
            let index = self.next_index;
            self.next_index += 1;
            if let Some(ev) = TraceEvent::from_raw(&raw, index)? {
                events.push(ev);
            }
        }
        self.pending.drain(..complete);
        Ok(events)
    }

    /// Number of records consumed so far (including ignored ones).
    pub fn records_seen(&self) -> u64 {
        self.next_index
    }

    /// Bytes of an incomplete record still buffered.
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    /// Check that the stream ended on a record boundary.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        match self.pending.len() {
            0 => Ok(()),
            n => Err(ProtocolError::Truncated(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AddressRange, EventKind, ThreadId};

    fn event(seq: u64, kind: EventKind) -> TraceEvent {
        TraceEvent {
            seq,
            tid: ThreadId(0),
            ip: 0x400000 + seq,
            kind,
        }
    }

    fn encode(events: &[TraceEvent]) -> Vec<u8> {
        events.iter().flat_map(|e| e.to_raw().unwrap().to_bytes()).collect()
    }

    #[test]
    fn decodes_records_split_across_chunks() {
        let events = vec![
            event(0, EventKind::TraceBegin),
            event(1, EventKind::Write { range: AddressRange::new(0x1000, 8), non_temporal: false }),
            event(2, EventKind::Drain),
        ];
        let bytes = encode(&events);

        let mut dec = RecordDecoder::new();
        let mut out = dec.feed(&bytes[..30]).unwrap();
        assert!(out.is_empty());
        assert_eq!(dec.pending_bytes(), 30);
        out.extend(dec.feed(&bytes[30..100]).unwrap());
        out.extend(dec.feed(&bytes[100..]).unwrap());

        assert_eq!(out, events);
        assert_eq!(dec.records_seen(), 3);
        assert!(dec.finish().is_ok());
    }

    #[test]
    fn ignored_records_still_advance_the_index() {
        let mut ret = event(0, EventKind::TxBegin).to_raw().unwrap();
        ret.is_return = 1;
        let mut bytes = ret.to_bytes().to_vec();
        bytes.extend(event(1, EventKind::TxEnd).to_raw().unwrap().to_bytes());

        let mut dec = RecordDecoder::new();
        let out = dec.feed(&bytes).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].seq, 1);
        assert_eq!(out[0].kind, EventKind::TxEnd);
    }

    #[test]
    fn invalid_record_is_fatal() {
        let bytes = [0u8; RAW_ENTRY_SIZE];
        let mut dec = RecordDecoder::new();
        assert_eq!(dec.feed(&bytes), Err(ProtocolError::InvalidRecord { index: 0 }));
    }

    #[test]
    fn trailing_partial_record_reported_on_finish() {
        let mut dec = RecordDecoder::new();
        dec.feed(&[1, 0, 0]).unwrap();
        assert_eq!(dec.finish(), Err(ProtocolError::Truncated(3)));
    }
}
