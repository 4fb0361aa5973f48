//! In-memory fanout from the accumulator to connections.
//!
//! The notifier keeps two indices rebuilt at startup from the store: which
//! users are joined to which room, and which connections belong to which
//! user. It owns the connections; idle eviction here is the sole lifecycle
//! authority, and connections hold no owning reference back.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use porthole_shared::ConnId;
use porthole_store::Event;

use crate::conn::{Conn, RoomUpdate, SharedStore};

#[derive(Default)]
struct Inner {
    room_to_users: HashMap<String, HashSet<String>>,
    user_to_conns: HashMap<String, HashSet<ConnId>>,
    conns: HashMap<ConnId, Arc<Conn>>,
}

pub struct Notifier {
    store: SharedStore,
    long_poll_timeout: Duration,
    inner: Mutex<Inner>,
}

impl Notifier {
    pub fn new(store: SharedStore, long_poll_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            long_poll_timeout,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Seed the joined-users index, typically from
    /// `Database::all_joined_members` at startup.
    pub fn load_joined_users(&self, joined: HashMap<String, Vec<String>>) {
        let mut inner = self.inner.lock().unwrap();
        for (room_id, users) in joined {
            inner
                .room_to_users
                .entry(room_id)
                .or_default()
                .extend(users);
        }
    }

    /// Fan a new event out to every connection of every user joined to the
    /// room. Membership events mutate the joined index first, so a user
    /// hears about their own join and stops hearing anything after their
    /// leave.
    pub fn on_new_event(&self, ev: &Event) {
        let mut inner = self.inner.lock().unwrap();

        if ev.event_type == "m.room.member" {
            if let (Some(target), Some(membership)) = (&ev.state_key, &ev.membership) {
                match membership.as_str() {
                    "join" => {
                        inner
                            .room_to_users
                            .entry(ev.room_id.clone())
                            .or_default()
                            .insert(target.clone());
                    }
                    "leave" | "ban" => {
                        if let Some(users) = inner.room_to_users.get_mut(&ev.room_id) {
                            users.remove(target);
                            if users.is_empty() {
                                inner.room_to_users.remove(&ev.room_id);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        let Some(users) = inner.room_to_users.get(&ev.room_id) else {
            return;
        };
        for user_id in users {
            let Some(conn_ids) = inner.user_to_conns.get(user_id) else {
                continue;
            };
            for conn_id in conn_ids {
                if let Some(conn) = inner.conns.get(conn_id) {
                    conn.push_update(RoomUpdate {
                        room_id: ev.room_id.clone(),
                        nid: ev.nid,
                    });
                }
            }
        }
    }

    /// Atomic lookup-or-create. Returns the connection and whether it was
    /// newly created.
    pub fn get_or_create_conn(&self, conn_id: ConnId, user_id: &str) -> (Arc<Conn>, bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(conn) = inner.conns.get(&conn_id) {
            return (conn.clone(), false);
        }
        let conn = Arc::new(Conn::new(
            conn_id.clone(),
            user_id,
            self.store.clone(),
            self.long_poll_timeout,
        ));
        inner.conns.insert(conn_id.clone(), conn.clone());
        inner
            .user_to_conns
            .entry(user_id.to_string())
            .or_default()
            .insert(conn_id);
        (conn, true)
    }

    pub fn conn(&self, conn_id: &ConnId) -> Option<Arc<Conn>> {
        self.inner.lock().unwrap().conns.get(conn_id).cloned()
    }

    pub fn conn_count(&self) -> usize {
        self.inner.lock().unwrap().conns.len()
    }

    /// Drop connections idle for longer than `max_idle`. Their sessions
    /// are expired; the next request on one fails with a 400.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let stale: Vec<ConnId> = inner
            .conns
            .iter()
            .filter(|(_, conn)| conn.idle_for() > max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        for conn_id in &stale {
            if let Some(conn) = inner.conns.remove(conn_id) {
                if let Some(set) = inner.user_to_conns.get_mut(&conn.user_id) {
                    set.remove(conn_id);
                    if set.is_empty() {
                        inner.user_to_conns.remove(&conn.user_id);
                    }
                }
                tracing::info!(conn_id = %conn_id, "evicted idle connection");
            }
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use porthole_shared::protocol::{Request, RequestList};
    use porthole_store::Database;
    use tokio::sync::Mutex as TokioMutex;

    fn member_event(nid: i64, room_id: &str, target: &str, membership: &str) -> Event {
        Event {
            nid,
            event_id: format!("$m{nid}"),
            room_id: room_id.to_string(),
            event_type: "m.room.member".to_string(),
            state_key: Some(target.to_string()),
            sender: target.to_string(),
            membership: Some(membership.to_string()),
            json: "{}".to_string(),
        }
    }

    fn message_event(nid: i64, room_id: &str) -> Event {
        Event {
            nid,
            event_id: format!("$e{nid}"),
            room_id: room_id.to_string(),
            event_type: "m.room.message".to_string(),
            state_key: None,
            sender: "@me:hs".to_string(),
            membership: None,
            json: "{}".to_string(),
        }
    }

    fn test_notifier() -> (tempfile::TempDir, Arc<Notifier>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        let store = Arc::new(TokioMutex::new(db));
        (dir, Notifier::new(store, Duration::from_millis(20)))
    }

    /// Drive the connection once so a queued cue surfaces (or not) as ops.
    async fn poll_once(conn: &Conn, pos: i64) -> porthole_shared::Response {
        conn.on_incoming_request(
            pos,
            &Request {
                lists: vec![RequestList {
                    ranges: Some(vec![[0, 10]]),
                    timeline_limit: Some(0),
                    filters: None,
                }],
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let (_dir, notifier) = test_notifier();
        let conn_id = ConnId::new("DEV", "s1");
        let (first, created) = notifier.get_or_create_conn(conn_id.clone(), "@me:hs");
        assert!(created);
        let (second, created) = notifier.get_or_create_conn(conn_id.clone(), "@me:hs");
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(notifier.conn(&conn_id).is_some());
        assert!(notifier.conn(&ConnId::new("DEV", "other")).is_none());
    }

    #[tokio::test]
    async fn events_fan_out_to_joined_users_only() {
        let (_dir, notifier) = test_notifier();
        notifier.load_joined_users(HashMap::from([(
            "!a:hs".to_string(),
            vec!["@me:hs".to_string()],
        )]));
        let (conn, _) = notifier.get_or_create_conn(ConnId::new("DEV", "s1"), "@me:hs");
        let (other, _) = notifier.get_or_create_conn(ConnId::new("DEV2", "s1"), "@other:hs");

        // empty initial windows
        let me_pos = poll_once(&conn, 0).await.pos;
        let other_pos = poll_once(&other, 0).await.pos;

        notifier.on_new_event(&message_event(1, "!a:hs"));

        // @me's connection hears about the room (it is new to its list)
        let resp = poll_once(&conn, me_pos).await;
        assert!(!resp.lists[0].ops.is_empty());

        // @other is not joined: its poll just times out
        let resp = poll_once(&other, other_pos).await;
        assert!(resp.lists[0].ops.is_empty());
    }

    #[tokio::test]
    async fn membership_mutates_the_index_before_fanout() {
        let (_dir, notifier) = test_notifier();
        let (conn, _) = notifier.get_or_create_conn(ConnId::new("DEV", "s1"), "@me:hs");
        let pos = poll_once(&conn, 0).await.pos;

        // the join itself is delivered to the joining user
        notifier.on_new_event(&member_event(1, "!a:hs", "@me:hs", "join"));
        let resp = poll_once(&conn, pos).await;
        assert!(!resp.lists[0].ops.is_empty());

        // after leaving, nothing in that room reaches the user
        notifier.on_new_event(&member_event(2, "!a:hs", "@me:hs", "leave"));
        let pos = resp.pos;
        let resp = poll_once(&conn, pos).await;
        // the leave event mutated the index first, so not even the leave
        // event itself is fanned out
        assert!(resp.lists[0].ops.is_empty());

        notifier.on_new_event(&message_event(3, "!a:hs"));
        let resp = poll_once(&conn, resp.pos).await;
        assert!(resp.lists[0].ops.is_empty());
    }

    #[tokio::test]
    async fn idle_connections_are_evicted() {
        let (_dir, notifier) = test_notifier();
        let conn_id = ConnId::new("DEV", "s1");
        notifier.get_or_create_conn(conn_id.clone(), "@me:hs");
        assert_eq!(notifier.conn_count(), 1);

        assert_eq!(notifier.evict_idle(Duration::from_secs(60)), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(notifier.evict_idle(Duration::ZERO), 1);
        assert_eq!(notifier.conn_count(), 0);
        assert!(notifier.conn(&conn_id).is_none());
    }
}
