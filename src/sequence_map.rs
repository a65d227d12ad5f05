use std::collections::BTreeMap;

use crate::revision::RemoteSequenceId;

struct Entry {
    remote: RemoteSequenceId,
    removed: bool,
}

/// Tracks in-flight remote sequences and emits the highest safe checkpoint
/// (spec §4.1, C1).
///
/// Downloads complete out of order, but the checkpoint only ever advances
/// across a *contiguous* prefix of removed sequences: `checkpoint` equals the
/// `remoteSequenceID` of the highest sequence `S` such that every sequence
/// `<= S` has been removed. This guarantees a crash-restart from `checkpoint`
/// never skips a revision, at worst it replays already-inserted ones.
#[derive(Default)]
pub struct SequenceMap {
    next: u64,
    entries: BTreeMap<u64, Entry>,
    /// Highest contiguously-removed remote id seen so far.
    checkpoint: Option<RemoteSequenceId>,
    /// Most recent `addValue`, used as the checkpoint fallback before
    /// anything has ever been removed.
    last_added: Option<RemoteSequenceId>,
}

impl SequenceMap {
    pub fn new() -> Self {
        Self {
            next: 1,
            entries: BTreeMap::new(),
            checkpoint: None,
            last_added: None,
        }
    }

    /// Assign the next dense integer sequence to `remote_id`.
    pub fn add_value(&mut self, remote_id: RemoteSequenceId) -> u64 {
        let seq = self.next;
        self.next += 1;
        self.last_added = Some(remote_id.clone());
        self.entries.insert(
            seq,
            Entry {
                remote: remote_id,
                removed: false,
            },
        );
        seq
    }

    /// Remove a sequence, then advance `checkpoint` across any now-contiguous
    /// prefix of removed entries, pruning them (spec §4.1).
    pub fn remove_sequence(&mut self, seq: u64) {
        if let Some(entry) = self.entries.get_mut(&seq) {
            entry.removed = true;
        }
        while let Some((&front_seq, entry)) = self.entries.iter().next() {
            if !entry.removed {
                break;
            }
            self.checkpoint = Some(entry.remote.clone());
            self.entries.remove(&front_seq);
        }
    }

    /// Highest remote id such that every smaller sequence has been removed.
    /// Falls back to the last `addValue`d remote id while the map is still
    /// empty and nothing has ever been removed (spec §4.1).
    pub fn checkpointed_value(&self) -> Option<RemoteSequenceId> {
        self.checkpoint.clone().or_else(|| self.last_added.clone())
    }

    /// On start, if `last_sequence` is non-empty, add it and immediately
    /// remove it so `checkpointed_value() == last_sequence` (spec §4.1
    /// "Priming").
    pub fn prime(&mut self, last_sequence: Option<RemoteSequenceId>) {
        if let Some(remote_id) = last_sequence {
            let seq = self.add_value(remote_id);
            self.remove_sequence(seq);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priming_makes_checkpoint_equal_last_sequence() {
        let mut map = SequenceMap::new();
        map.prime(Some("42".into()));
        assert_eq!(map.checkpointed_value(), Some("42".into()));
        assert!(map.is_empty());
    }

    #[test]
    fn empty_map_returns_last_added() {
        let mut map = SequenceMap::new();
        let seq = map.add_value("10".into());
        map.remove_sequence(seq);
        assert_eq!(map.checkpointed_value(), Some("10".into()));
    }

    #[test]
    fn out_of_order_removal_only_advances_contiguous_prefix() {
        let mut map = SequenceMap::new();
        let s1 = map.add_value("1".into());
        let s2 = map.add_value("2".into());
        let s3 = map.add_value("3".into());

        // complete s2 and s3 first; checkpoint must not move past s1
        map.remove_sequence(s2);
        map.remove_sequence(s3);
        assert_eq!(map.checkpointed_value(), None);
        assert_eq!(map.len(), 3);

        // completing s1 unblocks the whole contiguous run
        map.remove_sequence(s1);
        assert_eq!(map.checkpointed_value(), Some("3".into()));
        assert!(map.is_empty());
    }

    #[test]
    fn blocked_sequence_pins_checkpoint_behind_it() {
        let mut map = SequenceMap::new();
        let s1 = map.add_value("1".into());
        let _s2 = map.add_value("2".into());
        let s3 = map.add_value("3".into());

        map.remove_sequence(s1);
        map.remove_sequence(s3);
        // s2 never removed (e.g. upstream protocol error) -> checkpoint stuck at s1
        assert_eq!(map.checkpointed_value(), Some("1".into()));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn removing_unknown_sequence_is_a_no_op() {
        let mut map = SequenceMap::new();
        map.remove_sequence(999);
        assert_eq!(map.checkpointed_value(), None);
    }
}
