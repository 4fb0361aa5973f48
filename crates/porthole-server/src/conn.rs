//! Per-session connection state machine.
//!
//! A [`Conn`] owns the client's sorted room list, its sticky list
//! parameters, the position counter and the single-retry replay copy.
//! At most one request is processed at a time per connection: the state
//! mutex serializes them, and a newer request supersedes an inflight one
//! by bumping the generation counter before taking the mutex.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use porthole_shared::protocol::{Op, Request, RequestList, Response, ResponseList, Room, SliceRange};
use porthole_shared::ConnId;
use porthole_store::Database;

use crate::error::ServerError;
use crate::list::{ops_for_coverage, ops_for_move, SortedRooms};

pub type SharedStore = Arc<Mutex<Database>>;

/// The cue fanned out by the notifier: "room R has a new event at NID n".
/// The connection fetches details on its own.
#[derive(Debug, Clone)]
pub struct RoomUpdate {
    pub room_id: String,
    pub nid: i64,
}

#[derive(Debug, Default)]
struct Pending {
    updates: VecDeque<RoomUpdate>,
    generation: u64,
}

#[derive(Debug, Clone, Default)]
struct ListParams {
    ranges: Vec<SliceRange>,
    timeline_limit: i64,
    filters: Option<serde_json::Value>,
}

#[derive(Default)]
struct ConnState {
    last_pos: i64,
    cached: Option<Response>,
    rooms: Option<SortedRooms>,
    lists: Vec<ListParams>,
    /// Rooms delivered at least once on this connection; governs the
    /// per-room `initial` flag.
    loaded: HashSet<String>,
}

pub struct Conn {
    pub conn_id: ConnId,
    pub user_id: String,
    store: SharedStore,
    long_poll_timeout: Duration,
    notify: Notify,
    pending: StdMutex<Pending>,
    state: Mutex<ConnState>,
    last_active: StdMutex<std::time::Instant>,
}

impl Conn {
    pub fn new(
        conn_id: ConnId,
        user_id: impl Into<String>,
        store: SharedStore,
        long_poll_timeout: Duration,
    ) -> Self {
        Self {
            conn_id,
            user_id: user_id.into(),
            store,
            long_poll_timeout,
            notify: Notify::new(),
            pending: StdMutex::new(Pending::default()),
            state: Mutex::new(ConnState::default()),
            last_active: StdMutex::new(std::time::Instant::now()),
        }
    }

    /// Called by the notifier. Never blocks.
    pub fn push_update(&self, update: RoomUpdate) {
        self.pending.lock().unwrap().updates.push_back(update);
        self.notify.notify_one();
    }

    /// Time since the last request touched this connection.
    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().unwrap().elapsed()
    }

    /// Process one client request. Returns the next response, a replay of
    /// the previous one (single retry), or an error for anything else.
    pub async fn on_incoming_request(
        &self,
        pos: i64,
        req: &Request,
    ) -> Result<Response, ServerError> {
        // Supersede any inflight request before queueing on the state
        // mutex: it observes the bumped generation when it next wakes.
        let my_gen = {
            let mut pending = self.pending.lock().unwrap();
            pending.generation += 1;
            pending.generation
        };
        self.notify.notify_one();

        let mut state = self.state.lock().await;
        *self.last_active.lock().unwrap() = std::time::Instant::now();
        if self.pending.lock().unwrap().generation != my_gen {
            return Err(ServerError::Superseded);
        }

        if pos + 1 == state.last_pos {
            // The client did not receive the previous response: replay it.
            return state.cached.clone().ok_or(ServerError::ExpiredPos);
        }
        if pos != state.last_pos {
            return Err(ServerError::ExpiredPos);
        }

        // Sticky-merge the request into the connection's list params,
        // remembering the previous window coverage for the diff below.
        let old_ranges: Vec<Vec<SliceRange>> = {
            let mut old: Vec<Vec<SliceRange>> =
                state.lists.iter().map(|l| l.ranges.clone()).collect();
            merge_lists(&mut state.lists, &req.lists);
            old.resize(state.lists.len(), Vec::new());
            old
        };

        if state.rooms.is_none() {
            let store = self.store.lock().await;
            state.rooms = Some(SortedRooms::new(
                store.joined_rooms_for_user(&self.user_id)?,
            ));
        }

        let mut per_list_ops: Vec<Vec<Op>> = vec![Vec::new(); state.lists.len()];
        // room -> timeline limit to fetch (max across lists)
        let mut needed: HashMap<String, usize> = HashMap::new();

        {
            let st = &mut *state;
            let rooms = st.rooms.as_mut().unwrap();
            for (i, params) in st.lists.iter().enumerate() {
                let res = ops_for_coverage(&old_ranges[i], &params.ranges, rooms);
                for room_id in res.invalidated_rooms {
                    st.loaded.remove(&room_id);
                }
                for room_id in res.payload_rooms {
                    note_payload(&mut needed, room_id, params.timeline_limit);
                }
                per_list_ops[i] = res.ops;
            }
        }

        // Long-poll: drain update cues until there is something to say or
        // the timeout passes. A freshly covered window (SYNC ops above)
        // responds immediately.
        let deadline = Instant::now() + self.long_poll_timeout;
        loop {
            let updates = {
                let mut pending = self.pending.lock().unwrap();
                if pending.generation != my_gen {
                    return Err(ServerError::Superseded);
                }
                std::mem::take(&mut pending.updates)
            };
            {
                let st = &mut *state;
                let rooms = st.rooms.as_mut().unwrap();
                for update in updates {
                    let Some(mv) = rooms.bump(&update.room_id, update.nid) else {
                        continue;
                    };
                    for (i, params) in st.lists.iter().enumerate() {
                        let res = ops_for_move(&params.ranges, rooms, &mv, &update.room_id);
                        for room_id in res.payload_rooms {
                            note_payload(&mut needed, room_id, params.timeline_limit);
                        }
                        per_list_ops[i].extend(res.ops);
                    }
                }
            }
            if per_list_ops.iter().any(|ops| !ops.is_empty()) {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        // Assemble payloads under a single store guard so the whole
        // response observes one consistent view.
        let mut rooms_payload = BTreeMap::new();
        {
            let store = self.store.lock().await;
            for (room_id, limit) in &needed {
                let initial = state.loaded.insert(room_id.clone());
                let mut timeline = Vec::new();
                for ev in store.latest_events_in_room(room_id, *limit)? {
                    timeline.push(ev.raw()?);
                }
                let name = match store.room_state_event(room_id, "m.room.name", "")? {
                    Some(ev) => ev
                        .raw()?
                        .pointer("/content/name")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    None => None,
                };
                rooms_payload.insert(room_id.clone(), Room { initial, name, timeline });
            }
        }

        state.last_pos += 1;
        let count = state.rooms.as_ref().unwrap().len();
        let response = Response {
            pos: state.last_pos,
            lists: per_list_ops
                .into_iter()
                .map(|ops| ResponseList { count, ops })
                .collect(),
            rooms: rooms_payload,
        };
        state.cached = Some(response.clone());
        Ok(response)
    }
}

fn merge_lists(lists: &mut Vec<ListParams>, req: &[RequestList]) {
    for (i, rl) in req.iter().enumerate() {
        if i >= lists.len() {
            lists.push(ListParams::default());
        }
        let params = &mut lists[i];
        if let Some(ranges) = &rl.ranges {
            params.ranges = ranges.clone();
        }
        if let Some(limit) = rl.timeline_limit {
            params.timeline_limit = limit;
        }
        if let Some(filters) = &rl.filters {
            params.filters = Some(filters.clone());
        }
    }
}

fn note_payload(needed: &mut HashMap<String, usize>, room_id: String, timeline_limit: i64) {
    let limit = timeline_limit.max(0) as usize;
    needed
        .entry(room_id)
        .and_modify(|l| *l = (*l).max(limit))
        .or_insert(limit);
}
