//! Outstanding request bookkeeping
//!
//! Every command sent to the server is registered here under its sequence
//! number until its (possibly multi-part) response has fully arrived. The
//! read loop appends parts as they come in and completes the transmission
//! once all parts are present; the keepalive ticker evicts entries that were
//! never answered.
//!
//! Locking discipline: the map sits behind a single `std::sync::RwLock`.
//! Lookups share the read lock, every mutation takes the write lock, and no
//! guard is ever held across an `.await`.

use crate::error::TableError;
use crate::sink::SharedSink;
use std::collections::HashMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// One request awaiting its response
pub struct Transmission {
    pub sequence: u8,
    pub issued_at: Instant,
    /// Where the assembled response goes; `None` for fire-and-forget
    pub sink: Option<SharedSink>,
    /// Parts indexed by position, sized when the first part arrives
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl Transmission {
    pub fn new(sequence: u8, sink: Option<SharedSink>) -> Self {
        Self {
            sequence,
            issued_at: Instant::now(),
            sink,
            parts: Vec::new(),
            received: 0,
        }
    }

    /// Total parts announced by the server, once any part has arrived.
    pub fn expected_parts(&self) -> Option<u8> {
        if self.parts.is_empty() {
            None
        } else {
            Some(self.parts.len() as u8)
        }
    }

    pub fn received_parts(&self) -> usize {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        !self.parts.is_empty() && self.received == self.parts.len()
    }

    /// Concatenation of all received parts in index order.
    pub fn assembled(&self) -> Vec<u8> {
        self.parts.iter().flatten().flatten().copied().collect()
    }

    fn insert_part(&mut self, total: u8, index: u8, bytes: &[u8]) -> Result<bool, TableError> {
        if total == 0 || index >= total {
            return Err(TableError::IndexOutOfRange {
                sequence: self.sequence,
                index,
                total,
            });
        }

        if self.parts.is_empty() {
            self.parts = vec![None; total as usize];
        } else if self.parts.len() != total as usize {
            return Err(TableError::PartMismatch {
                sequence: self.sequence,
                expected: self.parts.len() as u8,
                got: total,
            });
        }

        let slot = &mut self.parts[index as usize];
        // Duplicates are kept as first received
        if slot.is_none() {
            *slot = Some(bytes.to_vec());
            self.received += 1;
        }

        Ok(self.is_complete())
    }
}

impl fmt::Debug for Transmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transmission")
            .field("sequence", &self.sequence)
            .field("issued_at", &self.issued_at)
            .field("has_sink", &self.sink.is_some())
            .field("expected_parts", &self.expected_parts())
            .field("received_parts", &self.received)
            .finish()
    }
}

/// Concurrent map from sequence number to outstanding [`Transmission`]
#[derive(Default)]
pub struct TransmissionTable {
    entries: RwLock<HashMap<u8, Transmission>>,
}

impl TransmissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<u8, Transmission>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<u8, Transmission>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a new outstanding request.
    ///
    /// Fails with [`TableError::Collision`] if the sequence is still in use;
    /// the existing entry is left untouched.
    pub fn register(&self, sequence: u8, sink: Option<SharedSink>) -> Result<(), TableError> {
        let mut entries = self.write();
        if entries.contains_key(&sequence) {
            return Err(TableError::Collision(sequence));
        }
        entries.insert(sequence, Transmission::new(sequence, sink));
        Ok(())
    }

    /// Stores one response part and reports whether all parts have arrived.
    ///
    /// Parts are placed by `index`, so arrival order does not matter. A
    /// single-part response is `total = 1, index = 0`.
    pub fn append_part(
        &self,
        sequence: u8,
        total: u8,
        index: u8,
        bytes: &[u8],
    ) -> Result<bool, TableError> {
        let mut entries = self.write();
        let transmission = entries
            .get_mut(&sequence)
            .ok_or(TableError::Unknown(sequence))?;
        transmission.insert_part(total, index, bytes)
    }

    /// Removes and returns a transmission whose response is complete.
    ///
    /// Returns `None` if the sequence is unknown or still missing parts.
    pub fn complete(&self, sequence: u8) -> Option<Transmission> {
        let mut entries = self.write();
        match entries.get(&sequence) {
            Some(transmission) if transmission.is_complete() => entries.remove(&sequence),
            _ => None,
        }
    }

    /// Drops a transmission without delivering it.
    pub fn evict(&self, sequence: u8) -> bool {
        self.write().remove(&sequence).is_some()
    }

    /// Evicts every transmission issued more than `max_age` ago and returns
    /// their sequence numbers.
    pub fn evict_stale(&self, max_age: Duration) -> Vec<u8> {
        let mut evicted = Vec::new();
        self.write().retain(|&sequence, transmission| {
            let stale = transmission.issued_at.elapsed() > max_age;
            if stale {
                evicted.push(sequence);
            }
            !stale
        });
        evicted.sort_unstable();
        evicted
    }

    /// Evicts everything, returning how many entries were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.write();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn contains(&self, sequence: u8) -> bool {
        self.read().contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::shared;
    use std::sync::Arc;
    use std::thread;
    use tokio::sync::mpsc;

    #[test]
    fn test_register_and_collision() {
        let table = TransmissionTable::new();
        assert!(table.register(1, None).is_ok());
        assert_eq!(table.register(1, None), Err(TableError::Collision(1)));
        assert_eq!(table.len(), 1);
        assert!(table.contains(1));
        assert!(!table.contains(2));
    }

    #[test]
    fn test_single_part_completion() {
        let table = TransmissionTable::new();
        table.register(5, None).unwrap();

        assert_eq!(table.append_part(5, 1, 0, b"ok"), Ok(true));
        let transmission = table.complete(5).unwrap();
        assert_eq!(transmission.assembled(), b"ok");
        assert_eq!(transmission.expected_parts(), Some(1));
        assert!(table.is_empty());
    }

    #[test]
    fn test_reverse_order_reassembly() {
        let table = TransmissionTable::new();
        table.register(9, None).unwrap();

        assert_eq!(table.append_part(9, 3, 2, b"EF"), Ok(false));
        assert!(table.complete(9).is_none());
        assert_eq!(table.append_part(9, 3, 1, b"CD"), Ok(false));
        assert_eq!(table.append_part(9, 3, 0, b"AB"), Ok(true));

        let transmission = table.complete(9).unwrap();
        assert_eq!(transmission.assembled(), b"ABCDEF");
        assert_eq!(transmission.received_parts(), 3);
    }

    #[test]
    fn test_shuffled_order_reassembly() {
        let table = TransmissionTable::new();
        table.register(3, None).unwrap();

        assert_eq!(table.append_part(3, 3, 1, b"CD"), Ok(false));
        assert_eq!(table.append_part(3, 3, 0, b"AB"), Ok(false));
        assert_eq!(table.append_part(3, 3, 2, b"EF"), Ok(true));
        assert_eq!(table.complete(3).unwrap().assembled(), b"ABCDEF");
    }

    #[test]
    fn test_duplicate_part_is_ignored() {
        let table = TransmissionTable::new();
        table.register(1, None).unwrap();

        assert_eq!(table.append_part(1, 2, 0, b"first"), Ok(false));
        assert_eq!(table.append_part(1, 2, 0, b"again"), Ok(false));
        assert_eq!(table.append_part(1, 2, 1, b"-second"), Ok(true));
        assert_eq!(table.complete(1).unwrap().assembled(), b"first-second");
    }

    #[test]
    fn test_part_mismatch_and_range() {
        let table = TransmissionTable::new();
        table.register(2, None).unwrap();

        table.append_part(2, 3, 0, b"a").unwrap();
        assert_eq!(
            table.append_part(2, 4, 1, b"b"),
            Err(TableError::PartMismatch {
                sequence: 2,
                expected: 3,
                got: 4
            })
        );
        assert!(matches!(
            table.append_part(2, 3, 3, b"c"),
            Err(TableError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_unknown_sequence() {
        let table = TransmissionTable::new();
        assert_eq!(
            table.append_part(77, 1, 0, b"late"),
            Err(TableError::Unknown(77))
        );
        assert!(table.complete(77).is_none());
        assert!(!table.evict(77));
    }

    #[test]
    fn test_evict_keeps_sink_unused() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let table = TransmissionTable::new();
        table.register(4, Some(shared(tx))).unwrap();

        assert!(table.evict(4));
        assert!(table.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_evict_stale() {
        let table = TransmissionTable::new();
        table.register(1, None).unwrap();
        table.register(2, None).unwrap();

        thread::sleep(Duration::from_millis(30));
        table.register(3, None).unwrap();

        let evicted = table.evict_stale(Duration::from_millis(20));
        assert_eq!(evicted, vec![1, 2]);
        assert!(table.contains(3));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_clear() {
        let table = TransmissionTable::new();
        for sequence in 0..10 {
            table.register(sequence, None).unwrap();
        }
        assert_eq!(table.clear(), 10);
        assert!(table.is_empty());
    }

    #[test]
    fn test_full_sequence_space() {
        let table = TransmissionTable::new();
        for sequence in 0..=u8::MAX {
            table.register(sequence, None).unwrap();
        }
        assert_eq!(table.len(), 256);
        assert_eq!(table.register(0, None), Err(TableError::Collision(0)));
    }

    #[test]
    fn test_concurrent_register_and_complete() {
        let table = Arc::new(TransmissionTable::new());
        let mut handles = Vec::new();

        for worker in 0..4u8 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                for i in 0..64u8 {
                    let sequence = worker * 64 + i;
                    table.register(sequence, None).unwrap();
                    assert_eq!(table.append_part(sequence, 1, 0, &[sequence]), Ok(true));
                    let done = table.complete(sequence).unwrap();
                    assert_eq!(done.assembled(), vec![sequence]);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(table.is_empty());
    }
}
