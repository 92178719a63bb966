//! Volatile runtime queue of pending/running station intervals. The queue is
//! deliberately not persisted; a reboot drops in-flight runs.

use crate::station::MAX_NUM_STATIONS;

/// One pending or running interval. `start_time == 0` means not yet
/// scheduled; `duration == 0` marks the entry for removal on the next
/// time-keeping pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub sid: usize,
    /// 1-based user program id, or `MANUAL_PROGRAM_ID`/`TEST_PROGRAM_ID`.
    pub program_id: u8,
    pub start_time: i64,
    pub duration: i64,
}

impl QueueEntry {
    pub fn stop_time(&self) -> i64 {
        self.start_time + self.duration
    }
}

/// Returned when the bounded queue cannot take another entry; the caller
/// drops the run and continues.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueFull;

pub struct RuntimeQueue {
    entries: Vec<QueueEntry>,
    /// Queue index currently owning each station, if any.
    pub station_qid: [Option<usize>; MAX_NUM_STATIONS],
    /// Latest stop time across queued sequential stations; chains the next
    /// sequential assignment.
    pub last_seq_stop_time: i64,
}

impl RuntimeQueue {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(MAX_NUM_STATIONS),
            station_qid: [None; MAX_NUM_STATIONS],
            last_seq_stop_time: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, qid: usize) -> Option<&QueueEntry> {
        self.entries.get(qid)
    }

    pub fn get_mut(&mut self, qid: usize) -> Option<&mut QueueEntry> {
        self.entries.get_mut(qid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut QueueEntry> {
        self.entries.iter_mut()
    }

    /// The entry currently owning a station.
    pub fn owner(&self, sid: usize) -> Option<&QueueEntry> {
        self.station_qid[sid].and_then(|qid| self.entries.get(qid))
    }

    pub fn enqueue(&mut self, entry: QueueEntry) -> Result<(), QueueFull> {
        if self.entries.len() >= MAX_NUM_STATIONS {
            return Err(QueueFull);
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Remove by index. The last entry backfills the hole, so removal may
    /// reorder; iterate high-index-first when removing several.
    pub fn dequeue(&mut self, qid: usize) {
        if qid < self.entries.len() {
            self.entries.swap_remove(qid);
        }
    }

    /// Drop every entry that is marked for removal or has run to completion.
    pub fn clean(&mut self, now: i64) {
        for qid in (0..self.entries.len()).rev() {
            let q = self.entries[qid];
            if q.duration == 0 || now >= q.stop_time() {
                self.dequeue(qid);
            }
        }
    }

    /// Recompute `station_qid`: for each station, the youngest entry with the
    /// smallest start time wins.
    pub fn assign_owners(&mut self) {
        self.station_qid = [None; MAX_NUM_STATIONS];
        for (qid, q) in self.entries.iter().enumerate() {
            if let Some(current) = self.station_qid[q.sid] {
                if self.entries[current].start_time < q.start_time {
                    continue;
                }
            }
            self.station_qid[q.sid] = Some(qid);
        }
    }

    /// Zero every duration so the next time-keeping pass turns stations off
    /// through the logging path.
    pub fn mark_all_for_removal(&mut self) {
        for q in &mut self.entries {
            q.duration = 0;
        }
    }

    /// Clear entries, ownership, and the sequential chain point.
    pub fn reset_runtime(&mut self) {
        self.entries.clear();
        self.station_qid = [None; MAX_NUM_STATIONS];
        self.last_seq_stop_time = 0;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
