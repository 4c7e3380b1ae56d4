use std::collections::HashSet;

use chrono::{DateTime, Utc};

use super::ids::TurnId;
use super::types::Turn;

/// Outcome of merging a batch of turns into the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeReport {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Time-ordered, duplicate-free log of the turns in the active session.
///
/// Ordering is ascending by timestamp. Appended turns land after every turn with the same
/// timestamp; prepended history lands before them. Nothing here performs I/O.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageLog {
    turns: Vec<Turn>,
    ids: HashSet<TurnId>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a log from an arbitrary sequence, keeping the first occurrence of each id.
    pub fn from_turns(turns: impl IntoIterator<Item = Turn>) -> Self {
        let mut log = Self::new();
        log.replace(turns);
        log
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn contains(&self, id: &TurnId) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &TurnId) -> Option<&Turn> {
        if !self.contains(id) {
            return None;
        }
        self.turns.iter().find(|turn| &turn.id == id)
    }

    pub fn oldest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.turns.first().map(|turn| turn.timestamp)
    }

    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.turns.last().map(|turn| turn.timestamp)
    }

    /// Inserts one turn at its timestamp position and returns its index.
    ///
    /// Returns `None` without touching the log when the id is already present.
    pub fn append(&mut self, turn: Turn) -> Option<usize> {
        if self.ids.contains(&turn.id) {
            return None;
        }

        let index = self
            .turns
            .partition_point(|existing| existing.timestamp <= turn.timestamp);
        self.ids.insert(turn.id.clone());
        self.turns.insert(index, turn);
        Some(index)
    }

    /// Merges a batch of older turns, skipping ids that are already loaded.
    pub fn prepend_batch(&mut self, batch: impl IntoIterator<Item = Turn>) -> MergeReport {
        let mut report = MergeReport::default();
        let mut fresh = Vec::new();

        for turn in batch {
            if self.ids.contains(&turn.id) {
                report.duplicates += 1;
                continue;
            }
            self.ids.insert(turn.id.clone());
            fresh.push(turn);
        }

        if fresh.is_empty() {
            return report;
        }

        report.inserted = fresh.len();
        // Stable sort keeps server order for equal timestamps.
        fresh.sort_by_key(|turn| turn.timestamp);

        let existing = std::mem::take(&mut self.turns);
        let mut merged = Vec::with_capacity(existing.len() + fresh.len());
        let mut fresh = fresh.into_iter().peekable();
        let mut existing = existing.into_iter().peekable();

        loop {
            let take_fresh = match (fresh.peek(), existing.peek()) {
                (Some(incoming), Some(current)) => incoming.timestamp <= current.timestamp,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };

            let next = if take_fresh {
                fresh.next()
            } else {
                existing.next()
            };
            merged.extend(next);
        }

        self.turns = merged;
        report
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.ids.clear();
    }

    /// Replaces the whole log, re-establishing ordering and id uniqueness.
    pub fn replace(&mut self, turns: impl IntoIterator<Item = Turn>) -> MergeReport {
        self.clear();

        let mut report = MergeReport::default();
        for turn in turns {
            if self.ids.insert(turn.id.clone()) {
                self.turns.push(turn);
                report.inserted += 1;
            } else {
                report.duplicates += 1;
            }
        }

        self.turns.sort_by_key(|turn| turn.timestamp);
        report
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::types::Role;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn turn(id: &str, seconds: i64) -> Turn {
        Turn::new(TurnId::parse(id).unwrap(), Role::User, id, at(seconds))
    }

    fn ids(log: &MessageLog) -> Vec<&str> {
        log.turns().iter().map(|turn| turn.id.as_str()).collect()
    }

    #[test]
    fn append_keeps_insertion_order_for_equal_timestamps() {
        let mut log = MessageLog::new();
        log.append(turn("a", 10));
        log.append(turn("b", 10));
        log.append(turn("c", 5));

        assert_eq!(ids(&log), ["c", "a", "b"]);
    }

    #[test]
    fn append_rejects_duplicate_ids() {
        let mut log = MessageLog::new();
        assert_eq!(log.append(turn("a", 1)), Some(0));
        assert_eq!(log.append(turn("a", 2)), None);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn prepend_batch_skips_overlapping_ids_and_stays_ascending() {
        let mut log = MessageLog::from_turns([turn("d", 40), turn("e", 50)]);

        let report = log.prepend_batch([turn("b", 20), turn("c", 30), turn("d", 40)]);

        assert_eq!(report, MergeReport { inserted: 2, duplicates: 1 });
        assert_eq!(ids(&log), ["b", "c", "d", "e"]);
        assert!(
            log.turns()
                .windows(2)
                .all(|pair| pair[0].timestamp <= pair[1].timestamp)
        );
    }

    #[test]
    fn prepend_batch_interleaves_out_of_window_turns() {
        let mut log = MessageLog::from_turns([turn("x", 10), turn("z", 30)]);

        log.prepend_batch([turn("y", 20), turn("w", 10)]);

        assert_eq!(ids(&log), ["w", "x", "y", "z"]);
    }

    #[test]
    fn replace_dedupes_and_sorts() {
        let log = MessageLog::from_turns([turn("b", 2), turn("a", 1), turn("b", 3)]);

        assert_eq!(ids(&log), ["a", "b"]);
        assert_eq!(log.get(&TurnId::parse("b").unwrap()).unwrap().timestamp, at(2));
    }

    #[test]
    fn clear_forgets_ids() {
        let mut log = MessageLog::from_turns([turn("a", 1)]);
        log.clear();

        assert!(log.is_empty());
        assert_eq!(log.append(turn("a", 1)), Some(0));
    }
}
