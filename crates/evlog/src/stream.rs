//! Bounded stream iteration.
//!
//! [`EventStream`] iterates one read stream; [`JoinEventStream`] merges
//! several write streams back into global insertion order. Both are lazy:
//! documents are read as the iterator advances, and the range is fixed at
//! construction - documents appended afterwards are not included.
//!
//! Bounds are built with consuming combinators into an immutable
//! descriptor; the cursor is only materialised on the first `next()` call.
//! Revisions are 1-based; negative revisions count from the end (`-1` is
//! the head).

use evlog_storage::IndexEntry;
use evlog_types::EventEnvelope;
use serde_json::Value;

use crate::error::StoreError;
use crate::storage::Storage;

/// Iteration bounds, kept unresolved until materialisation.
#[derive(Debug, Clone, Copy)]
struct Bounds {
    min: i64,
    max: i64,
    backwards: bool,
}

impl Bounds {
    fn full() -> Self {
        Self {
            min: 1,
            max: -1,
            backwards: false,
        }
    }

    /// Resolves against a head captured at construction. Returns the
    /// inclusive entry-number range, or `None` when it is empty.
    fn resolve(&self, head: u64) -> Option<(u64, u64)> {
        if head == 0 {
            return None;
        }
        let length = head as i64;
        let normalize = |bound: i64| {
            if bound < 0 {
                length + bound + 1
            } else {
                bound
            }
        };
        let lo = normalize(self.min).max(1);
        let hi = normalize(self.max).min(length);
        (lo <= hi).then_some((lo as u64, hi as u64))
    }
}

#[derive(Clone, Copy)]
enum Cursor {
    Unresolved,
    Active { next: u64, lo: u64, hi: u64 },
    Done,
}

/// A lazy, bounded iterator over one read stream.
///
/// Built by [`EventStore::event_stream`](crate::EventStore::event_stream);
/// combinators narrow the range before iteration begins.
///
/// # Example
///
/// ```ignore
/// let last_two: Vec<_> = store.event_stream("orders")?.last(2).events()?;
/// let backwards: Vec<_> = store.event_stream("orders")?.backwards().events()?;
/// ```
pub struct EventStream<'a> {
    storage: &'a mut Storage,
    stream: String,
    /// Index length captured at construction; later appends are invisible.
    head: u64,
    bounds: Bounds,
    cursor: Cursor,
}

impl<'a> EventStream<'a> {
    pub(crate) fn new(storage: &'a mut Storage, stream: &str) -> Result<Self, StoreError> {
        let head = storage
            .indexes
            .get(stream)
            .ok_or_else(|| StoreError::UnknownStream(stream.to_string()))?
            .len();
        Ok(Self {
            storage,
            stream: stream.to_string(),
            head,
            bounds: Bounds::full(),
            cursor: Cursor::Unresolved,
        })
    }

    /// The read stream this iterates.
    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    fn assert_unresolved(&self) {
        assert!(
            matches!(self.cursor, Cursor::Unresolved),
            "stream bounds cannot change after iteration has begun"
        );
    }

    /// Starts at the first revision.
    pub fn from_start(mut self) -> Self {
        self.assert_unresolved();
        self.bounds.min = 1;
        self
    }

    /// Starts at the head revision.
    pub fn from_end(mut self) -> Self {
        self.assert_unresolved();
        self.bounds.min = -1;
        self
    }

    /// Ends at the first revision.
    pub fn to_start(mut self) -> Self {
        self.assert_unresolved();
        self.bounds.max = 1;
        self
    }

    /// Ends at the head revision.
    pub fn to_end(mut self) -> Self {
        self.assert_unresolved();
        self.bounds.max = -1;
        self
    }

    /// Starts at `revision`; negative values count from the end.
    pub fn from(mut self, revision: i64) -> Self {
        self.assert_unresolved();
        self.bounds.min = revision;
        self
    }

    /// Ends at `revision` inclusive; negative values count from the end.
    pub fn until(mut self, revision: i64) -> Self {
        self.assert_unresolved();
        self.bounds.max = revision;
        self
    }

    /// Keeps at most the first `count` revisions of the range.
    pub fn first(mut self, count: u64) -> Self {
        self.assert_unresolved();
        self.bounds.min = 1;
        self.bounds.max = count as i64;
        self
    }

    /// Keeps at most the last `count` revisions of the range.
    pub fn last(mut self, count: u64) -> Self {
        self.assert_unresolved();
        self.bounds.min = -(count as i64);
        self.bounds.max = -1;
        self
    }

    /// Iterates in revision order (the default).
    pub fn forwards(mut self) -> Self {
        self.assert_unresolved();
        self.bounds.backwards = false;
        self
    }

    /// Iterates from the newest bounded revision to the oldest.
    pub fn backwards(mut self) -> Self {
        self.assert_unresolved();
        self.bounds.backwards = true;
        self
    }

    /// Rewinds the iterator to the current bounds.
    pub fn reset(&mut self) {
        self.cursor = Cursor::Unresolved;
    }

    /// Materialises the remaining event payloads in iteration order.
    pub fn events(&mut self) -> Result<Vec<Value>, StoreError> {
        let mut events = Vec::new();
        for envelope in self.by_ref() {
            events.push(envelope?.payload);
        }
        Ok(events)
    }

    /// Materialises the remaining envelopes in iteration order.
    pub fn envelopes(&mut self) -> Result<Vec<EventEnvelope>, StoreError> {
        self.by_ref().collect()
    }

    fn entry_at(&mut self, n: u64) -> Result<IndexEntry, StoreError> {
        let index = self
            .storage
            .indexes
            .get_mut(&self.stream)
            .expect("stream checked at construction");
        Ok(index.get(n)?.expect("entry within bounds"))
    }
}

impl Iterator for EventStream<'_> {
    type Item = Result<EventEnvelope, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Cursor::Unresolved = self.cursor {
            self.cursor = match self.bounds.resolve(self.head) {
                Some((lo, hi)) => Cursor::Active {
                    next: if self.bounds.backwards { hi } else { lo },
                    lo,
                    hi,
                },
                None => Cursor::Done,
            };
        }
        let Cursor::Active { next, lo, hi } = self.cursor else {
            return None;
        };

        let result = match self.entry_at(next) {
            Ok(entry) => self.storage.read_entry(&entry),
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.cursor = Cursor::Done;
            return Some(result);
        }

        let exhausted = if self.bounds.backwards {
            next == lo
        } else {
            next == hi
        };
        self.cursor = if exhausted {
            Cursor::Done
        } else if self.bounds.backwards {
            Cursor::Active { next: next - 1, lo, hi }
        } else {
            Cursor::Active { next: next + 1, lo, hi }
        };

        Some(result)
    }
}

/// Per-stream cursor of a join.
struct StreamCursor {
    stream: String,
    next: u64,
    lo: u64,
    hi: u64,
    done: bool,
}

enum JoinCursor {
    Unresolved,
    Active(Vec<StreamCursor>),
    Done,
}

/// Merges several write streams, preserving global insertion order.
///
/// The merge runs over the per-stream secondary indexes keyed on the global
/// sequence number, so interleaved commits come back exactly as committed.
/// Bounds apply per underlying stream.
pub struct JoinEventStream<'a> {
    storage: &'a mut Storage,
    /// `(stream, head)` pairs captured at construction.
    streams: Vec<(String, u64)>,
    bounds: Bounds,
    cursor: JoinCursor,
}

impl<'a> JoinEventStream<'a> {
    pub(crate) fn new(storage: &'a mut Storage, streams: &[&str]) -> Result<Self, StoreError> {
        if streams.is_empty() {
            return Err(StoreError::InvalidArgument(
                "a join requires at least one stream".to_string(),
            ));
        }
        let mut captured = Vec::with_capacity(streams.len());
        for stream in streams {
            let head = storage
                .indexes
                .get(*stream)
                .ok_or_else(|| StoreError::UnknownStream((*stream).to_string()))?
                .len();
            captured.push(((*stream).to_string(), head));
        }
        Ok(Self {
            storage,
            streams: captured,
            bounds: Bounds::full(),
            cursor: JoinCursor::Unresolved,
        })
    }

    fn assert_unresolved(&self) {
        assert!(
            matches!(self.cursor, JoinCursor::Unresolved),
            "stream bounds cannot change after iteration has begun"
        );
    }

    /// Starts each stream at `revision`; negative values count from its end.
    pub fn from(mut self, revision: i64) -> Self {
        self.assert_unresolved();
        self.bounds.min = revision;
        self
    }

    /// Ends each stream at `revision` inclusive.
    pub fn until(mut self, revision: i64) -> Self {
        self.assert_unresolved();
        self.bounds.max = revision;
        self
    }

    /// Keeps at most the first `count` revisions of each stream.
    pub fn first(mut self, count: u64) -> Self {
        self.assert_unresolved();
        self.bounds.min = 1;
        self.bounds.max = count as i64;
        self
    }

    /// Keeps at most the last `count` revisions of each stream.
    pub fn last(mut self, count: u64) -> Self {
        self.assert_unresolved();
        self.bounds.min = -(count as i64);
        self.bounds.max = -1;
        self
    }

    /// Merges in global sequence order (the default).
    pub fn forwards(mut self) -> Self {
        self.assert_unresolved();
        self.bounds.backwards = false;
        self
    }

    /// Merges from the newest document to the oldest.
    pub fn backwards(mut self) -> Self {
        self.assert_unresolved();
        self.bounds.backwards = true;
        self
    }

    /// Rewinds the iterator to the current bounds.
    pub fn reset(&mut self) {
        self.cursor = JoinCursor::Unresolved;
    }

    /// Materialises the remaining event payloads in merge order.
    pub fn events(&mut self) -> Result<Vec<Value>, StoreError> {
        let mut events = Vec::new();
        for envelope in self.by_ref() {
            events.push(envelope?.payload);
        }
        Ok(events)
    }

    /// Peeks the sequence number a stream cursor currently points at.
    fn key_at(storage: &mut Storage, cursor: &StreamCursor) -> Result<u64, StoreError> {
        let index = storage
            .indexes
            .get_mut(&cursor.stream)
            .expect("stream checked at construction");
        Ok(index.get(cursor.next)?.expect("entry within bounds").number)
    }
}

impl Iterator for JoinEventStream<'_> {
    type Item = Result<EventEnvelope, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        // Take ownership of the cursor state; it is put back on success, so
        // any early return leaves the join exhausted.
        let mut cursors = match std::mem::replace(&mut self.cursor, JoinCursor::Done) {
            JoinCursor::Done => return None,
            JoinCursor::Active(cursors) => cursors,
            JoinCursor::Unresolved => {
                let backwards = self.bounds.backwards;
                let cursors: Vec<StreamCursor> = self
                    .streams
                    .iter()
                    .filter_map(|(stream, head)| {
                        self.bounds.resolve(*head).map(|(lo, hi)| StreamCursor {
                            stream: stream.clone(),
                            next: if backwards { hi } else { lo },
                            lo,
                            hi,
                            done: false,
                        })
                    })
                    .collect();
                if cursors.is_empty() {
                    return None;
                }
                cursors
            }
        };

        // Pick the live cursor with the smallest (or, backwards, largest)
        // global sequence number.
        let mut best: Option<(usize, u64)> = None;
        for (i, cursor) in cursors.iter().enumerate() {
            if cursor.done {
                continue;
            }
            let key = match Self::key_at(self.storage, cursor) {
                Ok(key) => key,
                Err(e) => return Some(Err(e)),
            };
            let better = match best {
                None => true,
                Some((_, best_key)) => {
                    if self.bounds.backwards {
                        key > best_key
                    } else {
                        key < best_key
                    }
                }
            };
            if better {
                best = Some((i, key));
            }
        }
        let Some((winner, _)) = best else {
            return None;
        };

        let cursor = &mut cursors[winner];
        let n = cursor.next;
        if self.bounds.backwards {
            if n == cursor.lo {
                cursor.done = true;
            } else {
                cursor.next = n - 1;
            }
        } else if n == cursor.hi {
            cursor.done = true;
        } else {
            cursor.next = n + 1;
        }
        let stream = cursor.stream.clone();

        let entry = {
            let index = self
                .storage
                .indexes
                .get_mut(&stream)
                .expect("stream checked at construction");
            match index.get(n) {
                Ok(entry) => entry.expect("entry within bounds"),
                Err(e) => return Some(Err(e.into())),
            }
        };
        match self.storage.read_entry(&entry) {
            Ok(envelope) => {
                self.cursor = JoinCursor::Active(cursors);
                Some(Ok(envelope))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
