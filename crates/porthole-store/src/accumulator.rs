//! Folding upstream state and timeline batches into the store.
//!
//! This is the high-level storage API the server talks to: the two fold
//! entry points (`initialise`, `accumulate`) run inside one write
//! transaction each and are idempotent under upstream redelivery, plus the
//! read-side queries the connection engine consumes.

use std::collections::HashMap;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Event, NewEvent};
use crate::{events, membership, snapshots};

/// Outcome of [`Database::initialise`].
#[derive(Debug, Default)]
pub struct InitialiseResult {
    /// False if the room already had a current snapshot (duplicate
    /// first-sync) and nothing was written.
    pub added: bool,
    /// The genuinely-new events, in input order, with their NIDs.
    pub new_events: Vec<Event>,
}

/// Outcome of [`Database::accumulate`].
#[derive(Debug, Default)]
pub struct AccumulateResult {
    /// The genuinely-new events, in input order, with their NIDs.
    pub new_events: Vec<Event>,
}

impl AccumulateResult {
    pub fn num_new(&self) -> usize {
        self.new_events.len()
    }
}

impl Database {
    /// Fold in the state block upstream sends when it reports a room for
    /// the first time. If the room already has a current snapshot this is
    /// a no-op returning `added: false`.
    ///
    /// An empty state block still marks the room as known (an empty
    /// snapshot), so a subsequent [`Database::accumulate`] will succeed.
    pub fn initialise(&mut self, room_id: &str, state: &[serde_json::Value]) -> Result<InitialiseResult> {
        let parsed = events::parse_events(room_id, state)?;
        let txn = self.conn_mut().transaction()?;

        if snapshots::current_snapshot_id(&txn, room_id)?.is_some() {
            txn.commit()?;
            return Ok(InitialiseResult::default());
        }

        let res = events::insert_parsed(&txn, &parsed)?;
        let snapshot_id = snapshots::create_snapshot(&txn, room_id, &res.nids)?;
        snapshots::set_current_snapshot(&txn, room_id, snapshot_id)?;

        append_membership_changes(&txn, room_id, &parsed, &res)?;

        let new_events = materialise_new(&parsed, &res);
        txn.commit()?;

        tracing::info!(room_id = %room_id, num_state = state.len(), "initialised room");
        Ok(InitialiseResult { added: true, new_events })
    }

    /// Fold in a timeline batch. New state events clobber their
    /// `(type, state_key)` slot in the current snapshot, last one wins
    /// within the batch; if the state changed, a new snapshot is written
    /// and the room repointed at it.
    ///
    /// A batch whose events are all already present is a valid no-op
    /// (network retry). A batch for a room without a current snapshot
    /// fails with [`StoreError::RoomNotInitialised`] and rolls back.
    pub fn accumulate(&mut self, room_id: &str, timeline: &[serde_json::Value]) -> Result<AccumulateResult> {
        if timeline.is_empty() {
            return Ok(AccumulateResult::default());
        }
        let parsed = events::parse_events(room_id, timeline)?;
        let txn = self.conn_mut().transaction()?;

        let res = events::insert_parsed(&txn, &parsed)?;
        if res.num_new() == 0 {
            txn.commit()?;
            return Ok(AccumulateResult::default());
        }

        let Some(current) = snapshots::current_snapshot_id(&txn, room_id)? else {
            // Dropping the transaction rolls the inserts back; the caller
            // must not advance its upstream cursor.
            return Err(StoreError::RoomNotInitialised(room_id.to_string()));
        };

        // Load the current state and index it by slot.
        let member_nids = snapshots::snapshot_event_nids(&txn, current)?;
        let member_events = events::select_by_nids(&txn, &member_nids)?;
        let mut slots: HashMap<(String, String), i64> = member_events
            .iter()
            .filter_map(|e| {
                e.state_key
                    .clone()
                    .map(|sk| ((e.event_type.clone(), sk), e.nid))
            })
            .collect();

        let mut changed = false;
        for (i, ev) in parsed.iter().enumerate() {
            let Some(state_key) = &ev.state_key else {
                continue;
            };
            let slot = (ev.event_type.clone(), state_key.clone());
            match slots.insert(slot, res.nids[i]) {
                Some(old) if old == res.nids[i] => {}
                _ => changed = true,
            }
        }

        if changed {
            let mut nids: Vec<i64> = slots.into_values().collect();
            nids.sort_unstable();
            let snapshot_id = snapshots::create_snapshot(&txn, room_id, &nids)?;
            snapshots::set_current_snapshot(&txn, room_id, snapshot_id)?;
        }

        append_membership_changes(&txn, room_id, &parsed, &res)?;

        let new_events = materialise_new(&parsed, &res);
        txn.commit()?;

        tracing::debug!(room_id = %room_id, num_new = new_events.len(), "accumulated events");
        Ok(AccumulateResult { new_events })
    }

    // ─── Read-side queries ───

    /// See [`events::delta`].
    pub fn delta(&self, room_id: &str, from_excl: i64, limit: usize) -> Result<(Vec<Event>, i64)> {
        events::delta(self.conn(), room_id, from_excl, limit)
    }

    /// See [`events::latest_in_room`].
    pub fn latest_events_in_room(&self, room_id: &str, limit: usize) -> Result<Vec<Event>> {
        events::latest_in_room(self.conn(), room_id, limit)
    }

    /// See [`snapshots::all_joined_members`].
    pub fn all_joined_members(&self) -> Result<HashMap<String, Vec<String>>> {
        snapshots::all_joined_members(self.conn())
    }

    /// See [`snapshots::joined_rooms_for_user`].
    pub fn joined_rooms_for_user(&self, user_id: &str) -> Result<Vec<(String, i64)>> {
        snapshots::joined_rooms_for_user(self.conn(), user_id)
    }

    /// See [`snapshots::room_state_event`].
    pub fn room_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Event>> {
        snapshots::room_state_event(self.conn(), room_id, event_type, state_key)
    }

    /// See [`membership::memberships_between`].
    pub fn memberships_between(
        &self,
        start_excl: i64,
        end_incl: i64,
        target: &str,
    ) -> Result<Vec<i64>> {
        membership::memberships_between(self.conn(), start_excl, end_incl, target)
    }

    /// See [`snapshots::gc_unreferenced`].
    pub fn gc_unreferenced_snapshots(&self) -> Result<usize> {
        snapshots::gc_unreferenced(self.conn())
    }
}

/// Log a membership row for every genuinely-new member event whose
/// membership actually changed (a profile-only update, join to join, is
/// not a transition).
fn append_membership_changes(
    conn: &rusqlite::Connection,
    room_id: &str,
    parsed: &[NewEvent],
    res: &events::InsertResult,
) -> Result<()> {
    for (i, ev) in parsed.iter().enumerate() {
        if !res.new[i] {
            continue;
        }
        let (Some(target), Some(membership)) = (&ev.state_key, &ev.membership) else {
            continue;
        };
        if ev.prev_membership.as_deref() == Some(membership.as_str()) {
            continue;
        }
        membership::append_membership(conn, res.nids[i], room_id, target, membership)?;
    }
    Ok(())
}

fn materialise_new(parsed: &[NewEvent], res: &events::InsertResult) -> Vec<Event> {
    parsed
        .iter()
        .enumerate()
        .filter(|(i, _)| res.new[*i])
        .map(|(i, ev)| Event {
            nid: res.nids[i],
            event_id: ev.event_id.clone(),
            room_id: ev.room_id.clone(),
            event_type: ev.event_type.clone(),
            state_key: ev.state_key.clone(),
            sender: ev.sender.clone(),
            membership: ev.membership.clone(),
            json: ev.json.clone(),
        })
        .collect()
}
