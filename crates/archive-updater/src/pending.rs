//! Sorted, disjoint time ranges awaiting recomputation.
//!
//! Every entry owns the intents reserving its range. Entries may additionally be
//! queued as ready; the ready queue is FIFO over the order entries were marked,
//! independent of their position in the list.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

#[derive(Debug)]
pub struct Pending<I> {
    id: u64,
    pub start: i64,
    pub end: i64,
    pub intents: Vec<I>,
    /// Key into the ready queue while queued.
    ready: Option<u64>,
}

impl<I> Pending<I> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bounds(&self) -> (i64, i64) {
        (self.start, self.end)
    }

    fn intersects(&self, start: i64, end: i64) -> bool {
        self.start < end && start < self.end
    }
}

/// What [`PendingList::replace`] took out of the list.
#[derive(Debug)]
pub struct Replaced<I> {
    pub id: u64,
    /// Intents of the absorbed entries, now superseded by the new entry's.
    pub superseded: Vec<I>,
    /// Whether the new entry inherited a ready marking.
    pub ready: bool,
}

#[derive(Debug)]
pub struct PendingList<I> {
    entries: Vec<Pending<I>>,
    /// Ready order: marking sequence number to entry id.
    ready: BTreeMap<u64, u64>,
    /// Entry id to start bound, for binary search into `entries`.
    starts: HashMap<u64, i64>,
    next_id: u64,
    next_ready: u64,
}

impl<I> Default for PendingList<I> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            ready: BTreeMap::new(),
            starts: HashMap::new(),
            next_id: 0,
            next_ready: 0,
        }
    }
}

impl<I> PendingList<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pending<I>> {
        self.entries.iter()
    }

    pub fn ranges(&self) -> Vec<(i64, i64)> {
        self.entries.iter().map(Pending::bounds).collect()
    }

    pub fn is_ready(&self, id: u64) -> bool {
        self.index_of(id)
            .is_some_and(|index| self.entries[index].ready.is_some())
    }

    /// Ranges of the ready entries in the order they will run.
    pub fn ready_ranges(&self) -> Vec<(i64, i64)> {
        self.ready
            .values()
            .filter_map(|id| self.index_of(*id))
            .map(|index| self.entries[index].bounds())
            .collect()
    }

    /// Indices of the entries overlapping or touching `[start, end)`.
    pub fn touching(&self, start: i64, end: i64) -> Range<usize> {
        let first = self.entries.partition_point(|entry| entry.end < start);
        let mut last = first;
        while last < self.entries.len() && self.entries[last].start <= end {
            last += 1;
        }
        first..last
    }

    /// The union of `[start, end)` with the entries in `run`.
    pub fn merged_bounds(&self, run: Range<usize>, start: i64, end: i64) -> (i64, i64) {
        let entries = &self.entries[run];
        match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => (first.start.min(start), last.end.max(end)),
            _ => (start, end),
        }
    }

    /// Whether a single existing entry already covers `[start, end)`.
    pub fn covering(&self, start: i64, end: i64) -> Option<u64> {
        let index = self.entries.partition_point(|entry| entry.end < end);
        self.entries
            .get(index)
            .filter(|entry| entry.start <= start && end <= entry.end)
            .map(|entry| entry.id)
    }

    /// The list's ranges as they would be after replacing `run` with `[start, end)`.
    pub fn ranges_with(&self, run: Range<usize>, start: i64, end: i64) -> Vec<(i64, i64)> {
        let mut ranges = Vec::with_capacity(self.entries.len() + 1);
        ranges.extend(self.entries[..run.start].iter().map(Pending::bounds));
        ranges.push((start, end));
        ranges.extend(self.entries[run.end..].iter().map(Pending::bounds));
        ranges
    }

    /// Swaps the entries in `run` for one entry spanning `[start, end)`.
    ///
    /// `run` must come from [`PendingList::touching`] and `[start, end)` must cover
    /// it, so the list stays sorted and disjoint. If any absorbed entry was ready,
    /// the new entry takes the earliest of their places in the ready queue.
    pub fn replace(&mut self, run: Range<usize>, start: i64, end: i64, intents: Vec<I>) -> Replaced<I> {
        debug_assert!(start <= end);
        let index = run.start;
        let absorbed: Vec<Pending<I>> = self.entries.drain(run).collect();

        self.next_id += 1;
        let id = self.next_id;
        let mut slot = None;
        for entry in &absorbed {
            self.starts.remove(&entry.id);
            if let Some(key) = entry.ready {
                self.ready.remove(&key);
                slot = Some(slot.map_or(key, |earliest: u64| earliest.min(key)));
            }
        }
        if let Some(key) = slot {
            self.ready.insert(key, id);
        }

        self.starts.insert(id, start);
        self.entries.insert(
            index,
            Pending {
                id,
                start,
                end,
                intents,
                ready: slot,
            },
        );
        Replaced {
            id,
            superseded: absorbed.into_iter().flat_map(|entry| entry.intents).collect(),
            ready: slot.is_some(),
        }
    }

    /// Queues the entry at the back of the ready queue unless it is already queued.
    pub fn mark_ready(&mut self, id: u64) -> bool {
        let Some(index) = self.index_of(id) else {
            return false;
        };
        let entry = &mut self.entries[index];
        if entry.ready.is_some() {
            return false;
        }
        self.next_ready += 1;
        entry.ready = Some(self.next_ready);
        self.ready.insert(self.next_ready, id);
        true
    }

    /// Marks every entry intersecting `[start, end)` ready, in list order.
    /// Returns how many were newly queued.
    pub fn mark_intersecting_ready(&mut self, start: i64, end: i64) -> usize {
        let first = self.entries.partition_point(|entry| entry.end <= start);
        let ids: Vec<u64> = self.entries[first..]
            .iter()
            .take_while(|entry| entry.start < end)
            .filter(|entry| entry.intersects(start, end))
            .map(|entry| entry.id)
            .collect();
        ids.into_iter().filter(|id| self.mark_ready(*id)).count()
    }

    /// Removes and returns the entry that was marked ready first.
    pub fn pop_ready(&mut self) -> Option<Pending<I>> {
        while let Some((_, id)) = self.ready.pop_first() {
            if let Some(index) = self.index_of(id) {
                self.starts.remove(&id);
                let mut entry = self.entries.remove(index);
                entry.ready = None;
                return Some(entry);
            }
        }
        None
    }

    /// Detaches every entry's intents, leaving the ranges and ready queue in place.
    pub fn take_intents(&mut self) -> Vec<I> {
        self.entries
            .iter_mut()
            .flat_map(|entry| std::mem::take(&mut entry.intents))
            .collect()
    }

    fn index_of(&self, id: u64) -> Option<usize> {
        let start = *self.starts.get(&id)?;
        self.entries
            .binary_search_by_key(&start, |entry| entry.start)
            .ok()
            .filter(|index| self.entries[*index].id == id)
    }
}
