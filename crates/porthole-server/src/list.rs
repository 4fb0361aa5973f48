//! The sorted room list and the window delta-op algebra.
//!
//! Rooms are totally ordered by descending latest-activity NID, with the
//! room ID as an ascending tie-break so the order is deterministic. When a
//! room's latest NID advances it moves toward the front, and the engine
//! emits the smallest op sequence that carries the client's cached window
//! to the new order.

use std::collections::BTreeSet;

use porthole_shared::protocol::{Op, SliceRange};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomListEntry {
    pub room_id: String,
    pub latest_nid: i64,
}

fn order(a: &RoomListEntry, b: &RoomListEntry) -> std::cmp::Ordering {
    b.latest_nid
        .cmp(&a.latest_nid)
        .then_with(|| a.room_id.cmp(&b.room_id))
}

/// A room's movement within the list: `from` is `None` when the room was
/// not previously in the list at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub from: Option<usize>,
    pub to: usize,
}

#[derive(Debug, Default)]
pub struct SortedRooms {
    entries: Vec<RoomListEntry>,
}

impl SortedRooms {
    pub fn new(rooms: Vec<(String, i64)>) -> Self {
        let mut entries: Vec<RoomListEntry> = rooms
            .into_iter()
            .map(|(room_id, latest_nid)| RoomListEntry { room_id, latest_nid })
            .collect();
        entries.sort_by(order);
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RoomListEntry> {
        self.entries.get(index)
    }

    pub fn index_of(&self, room_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.room_id == room_id)
    }

    /// Room IDs at the (clamped) inclusive index range.
    pub fn room_ids_in(&self, lo: usize, hi: usize) -> Vec<String> {
        if lo >= self.entries.len() {
            return Vec::new();
        }
        let hi = hi.min(self.entries.len() - 1);
        self.entries[lo..=hi].iter().map(|e| e.room_id.clone()).collect()
    }

    /// Record new activity in a room. Returns the movement, or `None` if
    /// the cue was stale (the room already had a newer event).
    pub fn bump(&mut self, room_id: &str, nid: i64) -> Option<Move> {
        let from = self.index_of(room_id);
        if let Some(idx) = from {
            if self.entries[idx].latest_nid >= nid {
                return None;
            }
            self.entries.remove(idx);
        }
        let entry = RoomListEntry {
            room_id: room_id.to_string(),
            latest_nid: nid,
        };
        let to = self
            .entries
            .partition_point(|e| order(e, &entry) == std::cmp::Ordering::Less);
        self.entries.insert(to, entry);
        Some(Move { from, to })
    }
}

/// Ops produced by one computation, plus the rooms whose payloads the
/// response must carry.
#[derive(Debug, Default)]
pub struct OpsResult {
    pub ops: Vec<Op>,
    pub payload_rooms: Vec<String>,
    /// Rooms the client was told to forget via INVALIDATE.
    pub invalidated_rooms: Vec<String>,
}

/// The canonical bump algorithm: ops for one movement against one set of
/// window ranges. Indices in the emitted ops are absolute list indices.
pub fn ops_for_move(
    ranges: &[SliceRange],
    list: &SortedRooms,
    mv: &Move,
    room_id: &str,
) -> OpsResult {
    let mut out = OpsResult::default();
    if list.is_empty() {
        return out;
    }
    for range in ranges {
        let lo = range[0] as usize;
        if lo >= list.len() {
            continue;
        }
        let hi = (range[1] as usize).min(list.len() - 1);

        let to = mv.to;
        let to_in = to >= lo && to <= hi;
        let from_in = mv.from.map(|f| f >= lo && f <= hi).unwrap_or(false);

        if from_in && to_in {
            if mv.from == Some(to) {
                out.ops.push(Op::Update {
                    index: to as i64,
                    room_id: room_id.to_string(),
                });
            } else {
                out.ops.push(Op::Delete {
                    index: mv.from.unwrap() as i64,
                });
                out.ops.push(Op::Insert {
                    index: to as i64,
                    room_id: room_id.to_string(),
                });
            }
            out.payload_rooms.push(room_id.to_string());
        } else if to_in {
            // Entered the window from outside. Only delete at the right
            // edge if the window was full before the move, i.e. an entry
            // actually falls off.
            let was_full = match mv.from {
                Some(_) => true,
                None => list.len() >= 2 && list.len() - 2 >= hi,
            };
            if was_full {
                out.ops.push(Op::Delete { index: hi as i64 });
            }
            out.ops.push(Op::Insert {
                index: to as i64,
                room_id: room_id.to_string(),
            });
            out.payload_rooms.push(room_id.to_string());
        } else if from_in {
            // Left the window upward; the entry above the window's top
            // edge shifted down into it.
            out.ops.push(Op::Delete {
                index: mv.from.unwrap() as i64,
            });
            let shifted = &list.get(lo).expect("lo < len").room_id;
            out.ops.push(Op::Insert {
                index: lo as i64,
                room_id: shifted.clone(),
            });
            out.payload_rooms.push(shifted.clone());
        } else if to < lo && mv.from.map(|f| f > hi).unwrap_or(true) {
            // Crossed over the window entirely: everything shifts right.
            out.ops.push(Op::Delete { index: hi as i64 });
            let shifted = &list.get(lo).expect("lo < len").room_id;
            out.ops.push(Op::Insert {
                index: lo as i64,
                room_id: shifted.clone(),
            });
            out.payload_rooms.push(shifted.clone());
        }
        // otherwise wholly outside the window: nothing to do
    }
    out
}

/// Ops for a change of window coverage: INVALIDATE for indices no longer
/// covered, SYNC for newly covered indices. On the first request the old
/// coverage is empty, so this degenerates to a full SYNC.
pub fn ops_for_coverage(
    old_ranges: &[SliceRange],
    new_ranges: &[SliceRange],
    list: &SortedRooms,
) -> OpsResult {
    let mut out = OpsResult::default();
    let old = covered_indices(old_ranges, list.len());
    let new = covered_indices(new_ranges, list.len());

    for range in contiguous(old.difference(&new).copied()) {
        out.invalidated_rooms
            .extend(list.room_ids_in(range[0] as usize, range[1] as usize));
        out.ops.push(Op::Invalidate { range });
    }
    for range in contiguous(new.difference(&old).copied()) {
        let room_ids = list.room_ids_in(range[0] as usize, range[1] as usize);
        out.payload_rooms.extend(room_ids.clone());
        out.ops.push(Op::Sync { range, room_ids });
    }
    out
}

fn covered_indices(ranges: &[SliceRange], len: usize) -> BTreeSet<i64> {
    let mut set = BTreeSet::new();
    if len == 0 {
        return set;
    }
    for range in ranges {
        let lo = range[0];
        let hi = range[1].min(len as i64 - 1);
        for i in lo..=hi {
            set.insert(i);
        }
    }
    set
}

fn contiguous(indices: impl Iterator<Item = i64>) -> Vec<SliceRange> {
    let mut ranges: Vec<SliceRange> = Vec::new();
    for i in indices {
        match ranges.last_mut() {
            Some(last) if last[1] + 1 == i => last[1] = i,
            _ => ranges.push([i, i]),
        }
    }
    ranges
}
