//! SQLite implementation of the chat store traits.

use crate::auth;
use crate::db::DbPool;
use chat_core::model::{
    now_millis, JoinOutcome, Member, Message, OrderKey, Participant, RecordStatus, Room, UserIdentity,
};
use chat_core::{MessageStore, RoomStore, SessionStore, StoreError, StoreResult, UserStore};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

pub struct SqliteStore {
    pool: DbPool,
    secret: Vec<u8>,
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn status_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<RecordStatus> {
    let text: String = row.get(idx)?;
    RecordStatus::parse(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("unknown status {text}").into())
    })
}

const USER_COLS: &str = "u.id, u.nickname, u.is_online, u.last_seen_at";

fn user_row(row: &Row<'_>) -> rusqlite::Result<UserIdentity> {
    Ok(UserIdentity {
        id: uuid_at(row, 0)?,
        nickname: row.get(1)?,
        is_online: row.get::<_, i64>(2)? != 0,
        last_seen_at: row.get(3)?,
    })
}

const ROOM_COLS: &str = "r.id, r.name, r.creator_id, r.created_at, r.status";

fn room_row(row: &Row<'_>) -> rusqlite::Result<Room> {
    Ok(Room {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        creator_id: uuid_at(row, 2)?,
        created_at: row.get(3)?,
        status: status_at(row, 4)?,
    })
}

const MESSAGE_COLS: &str =
    "m.id, m.room_id, m.sender_id, u.nickname, m.content, m.created_at, m.updated_at, m.is_edited, m.status";
const MESSAGE_FROM: &str = "FROM messages m JOIN users u ON u.id = m.sender_id";

fn message_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_at(row, 0)?,
        room_id: uuid_at(row, 1)?,
        sender_id: uuid_at(row, 2)?,
        sender_nickname: row.get(3)?,
        content: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        is_edited: row.get::<_, i64>(7)? != 0,
        status: status_at(row, 8)?,
    })
}

impl SqliteStore {
    pub fn new(pool: DbPool, secret: Vec<u8>) -> Self {
        Self { pool, secret }
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> StoreResult<T> {
        let mut conn = self.pool.get().map_err(StoreError::backend)?;
        f(&mut conn).map_err(|e| match e {
            rusqlite::Error::FromSqlConversionFailure(..) => StoreError::Corrupt(e.to_string()),
            other => StoreError::backend(other),
        })
    }

    /// Look up a user by nickname, creating it on first login.
    pub fn find_or_create_user(&self, nickname: &str) -> StoreResult<UserIdentity> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO users (id, nickname, created_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(nickname) DO NOTHING",
                params![Uuid::new_v4().to_string(), nickname, now_millis()],
            )?;
            c.query_row(
                &format!("SELECT {USER_COLS} FROM users u WHERE u.nickname = ?1"),
                [nickname],
                user_row,
            )
        })
    }

    /// Replace (or clear) the session token of a user.
    pub fn set_session_token(&self, user_id: &Uuid, token: Option<&str>) -> StoreResult<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE users SET session_token = ?2 WHERE id = ?1",
                params![user_id.to_string(), token],
            )?;
            Ok(())
        })
    }
}

impl SessionStore for SqliteStore {
    fn validate_token(&self, token: &str) -> StoreResult<Option<UserIdentity>> {
        let Some(user_id) = auth::verify_jwt(&self.secret, token)
            .ok()
            .and_then(|claims| claims.user_id())
        else {
            return Ok(None);
        };
        self.with_conn(|c| {
            c.query_row(
                &format!("SELECT {USER_COLS} FROM users u WHERE u.id = ?1 AND u.session_token = ?2"),
                params![user_id.to_string(), token],
                user_row,
            )
            .optional()
        })
    }
}

impl UserStore for SqliteStore {
    fn find_user(&self, id: &Uuid) -> StoreResult<Option<UserIdentity>> {
        self.with_conn(|c| {
            c.query_row(
                &format!("SELECT {USER_COLS} FROM users u WHERE u.id = ?1"),
                [id.to_string()],
                user_row,
            )
            .optional()
        })
    }

    fn set_online(&self, id: &Uuid, online: bool, last_seen_at: Option<i64>) -> StoreResult<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE users SET is_online = ?2, last_seen_at = COALESCE(?3, last_seen_at) WHERE id = ?1",
                params![id.to_string(), online as i64, last_seen_at],
            )?;
            Ok(())
        })
    }
}

impl RoomStore for SqliteStore {
    fn insert_room(&self, room: &Room) -> StoreResult<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO rooms (id, name, creator_id, created_at, status) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    room.id.to_string(),
                    room.name,
                    room.creator_id.to_string(),
                    room.created_at,
                    room.status.as_str()
                ],
            )?;
            Ok(())
        })
    }

    fn find_room(&self, id: &Uuid) -> StoreResult<Option<Room>> {
        self.with_conn(|c| {
            c.query_row(
                &format!("SELECT {ROOM_COLS} FROM rooms r WHERE r.id = ?1"),
                [id.to_string()],
                room_row,
            )
            .optional()
        })
    }

    fn soft_delete_room(&self, id: &Uuid, at: i64) -> StoreResult<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE rooms SET status = 'deleted', deleted_at = ?2 WHERE id = ?1",
                params![id.to_string(), at],
            )?;
            Ok(())
        })
    }

    fn list_rooms(&self) -> StoreResult<Vec<(Room, u32)>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {ROOM_COLS}, \
                   (SELECT COUNT(*) FROM room_participants p WHERE p.room_id = r.id AND p.left_at IS NULL) \
                 FROM rooms r WHERE r.status = 'active' ORDER BY r.created_at DESC, r.id DESC"
            ))?;
            let rows = stmt.query_map([], |row| Ok((room_row(row)?, row.get::<_, u32>(5)?)))?;
            rows.collect()
        })
    }

    fn find_participant(&self, room_id: &Uuid, user_id: &Uuid) -> StoreResult<Option<Participant>> {
        self.with_conn(|c| {
            c.query_row(
                "SELECT joined_at, left_at FROM room_participants WHERE room_id = ?1 AND user_id = ?2",
                params![room_id.to_string(), user_id.to_string()],
                |row| {
                    Ok(Participant {
                        room_id: *room_id,
                        user_id: *user_id,
                        joined_at: row.get(0)?,
                        left_at: row.get(1)?,
                    })
                },
            )
            .optional()
        })
    }

    fn join_participant(&self, room_id: &Uuid, user_id: &Uuid, at: i64) -> StoreResult<JoinOutcome> {
        self.with_conn(|c| {
            let tx = c.transaction()?;
            let existing: Option<Option<i64>> = tx
                .query_row(
                    "SELECT left_at FROM room_participants WHERE room_id = ?1 AND user_id = ?2",
                    params![room_id.to_string(), user_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let outcome = match existing {
                Some(None) => JoinOutcome::AlreadyActive,
                Some(Some(_)) => {
                    tx.execute(
                        "UPDATE room_participants SET left_at = NULL, joined_at = ?3 \
                         WHERE room_id = ?1 AND user_id = ?2",
                        params![room_id.to_string(), user_id.to_string(), at],
                    )?;
                    JoinOutcome::Rejoined
                }
                None => {
                    tx.execute(
                        "INSERT INTO room_participants (room_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                        params![room_id.to_string(), user_id.to_string(), at],
                    )?;
                    JoinOutcome::Joined
                }
            };
            tx.commit()?;
            Ok(outcome)
        })
    }

    fn leave_participant(&self, room_id: &Uuid, user_id: &Uuid, at: i64) -> StoreResult<bool> {
        self.with_conn(|c| {
            let changed = c.execute(
                "UPDATE room_participants SET left_at = ?3 \
                 WHERE room_id = ?1 AND user_id = ?2 AND left_at IS NULL",
                params![room_id.to_string(), user_id.to_string(), at],
            )?;
            Ok(changed == 1)
        })
    }

    fn list_members(&self, room_id: &Uuid) -> StoreResult<Vec<Member>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {USER_COLS}, p.joined_at FROM room_participants p \
                 JOIN users u ON u.id = p.user_id \
                 WHERE p.room_id = ?1 AND p.left_at IS NULL ORDER BY p.joined_at"
            ))?;
            let rows = stmt.query_map([room_id.to_string()], |row| {
                Ok(Member {
                    user: user_row(row)?,
                    joined_at: row.get(4)?,
                })
            })?;
            rows.collect()
        })
    }

    fn list_user_rooms(&self, user_id: &Uuid) -> StoreResult<Vec<Room>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {ROOM_COLS} FROM rooms r \
                 JOIN room_participants p ON p.room_id = r.id \
                 WHERE p.user_id = ?1 AND p.left_at IS NULL AND r.status = 'active' \
                 ORDER BY r.created_at DESC"
            ))?;
            let rows = stmt.query_map([user_id.to_string()], room_row)?;
            rows.collect()
        })
    }
}

impl MessageStore for SqliteStore {
    fn insert_message(&self, msg: &Message) -> StoreResult<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO messages (id, room_id, sender_id, content, created_at, updated_at, is_edited, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    msg.id.to_string(),
                    msg.room_id.to_string(),
                    msg.sender_id.to_string(),
                    msg.content,
                    msg.created_at,
                    msg.updated_at,
                    msg.is_edited as i64,
                    msg.status.as_str()
                ],
            )?;
            Ok(())
        })
    }

    fn find_message(&self, id: &Uuid) -> StoreResult<Option<Message>> {
        self.with_conn(|c| {
            c.query_row(
                &format!("SELECT {MESSAGE_COLS} {MESSAGE_FROM} WHERE m.id = ?1"),
                [id.to_string()],
                message_row,
            )
            .optional()
        })
    }

    fn update_message(&self, msg: &Message) -> StoreResult<()> {
        let changed = self.with_conn(|c| {
            c.execute(
                "UPDATE messages SET content = ?2, updated_at = ?3, is_edited = ?4, status = ?5 WHERE id = ?1",
                params![
                    msg.id.to_string(),
                    msg.content,
                    msg.updated_at,
                    msg.is_edited as i64,
                    msg.status.as_str()
                ],
            )
        })?;
        if changed == 0 {
            return Err(StoreError::Backend(format!("unknown message {}", msg.id)));
        }
        Ok(())
    }

    fn newest_in_room(&self, room_id: &Uuid) -> StoreResult<Option<OrderKey>> {
        self.with_conn(|c| {
            c.query_row(
                "SELECT created_at, id FROM messages WHERE room_id = ?1 \
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                [room_id.to_string()],
                |row| {
                    Ok(OrderKey {
                        created_at: row.get(0)?,
                        id: uuid_at(row, 1)?,
                    })
                },
            )
            .optional()
        })
    }

    fn latest_active_by_sender(&self, room_id: &Uuid, sender_id: &Uuid) -> StoreResult<Option<Message>> {
        self.with_conn(|c| {
            c.query_row(
                &format!(
                    "SELECT {MESSAGE_COLS} {MESSAGE_FROM} \
                     WHERE m.room_id = ?1 AND m.sender_id = ?2 AND m.status = 'active' \
                     ORDER BY m.created_at DESC, m.id DESC LIMIT 1"
                ),
                params![room_id.to_string(), sender_id.to_string()],
                message_row,
            )
            .optional()
        })
    }

    fn has_newer_from_others(&self, room_id: &Uuid, sender_id: &Uuid, after: OrderKey) -> StoreResult<bool> {
        self.with_conn(|c| {
            c.query_row(
                "SELECT EXISTS (SELECT 1 FROM messages \
                   WHERE room_id = ?1 AND sender_id != ?2 AND status = 'active' \
                   AND (created_at > ?3 OR (created_at = ?3 AND id > ?4)))",
                params![room_id.to_string(), sender_id.to_string(), after.created_at, after.id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n != 0)
        })
    }

    fn page(&self, room_id: &Uuid, before: Option<OrderKey>, take: usize) -> StoreResult<Vec<Message>> {
        let (before_at, before_id) = match before {
            Some(k) => (Some(k.created_at), Some(k.id.to_string())),
            None => (None, None),
        };
        self.with_conn(|c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {MESSAGE_COLS} {MESSAGE_FROM} \
                 WHERE m.room_id = ?1 AND m.status = 'active' \
                 AND (?2 IS NULL OR m.created_at < ?2 OR (m.created_at = ?2 AND m.id < ?3)) \
                 ORDER BY m.created_at DESC, m.id DESC LIMIT ?4"
            ))?;
            let rows = stmt.query_map(
                params![room_id.to_string(), before_at, before_id, take as i64],
                message_row,
            )?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_pool;

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_pool(dir.path().join("chat.db")).unwrap();
        (dir, SqliteStore::new(pool, b"test-secret".to_vec()))
    }

    fn room(creator: Uuid) -> Room {
        Room {
            id: Uuid::new_v4(),
            name: "general".into(),
            creator_id: creator,
            created_at: now_millis(),
            status: RecordStatus::Active,
        }
    }

    fn message(room_id: Uuid, sender_id: Uuid, created_at: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            room_id,
            sender_id,
            sender_nickname: String::new(),
            content: "hi".into(),
            created_at,
            updated_at: created_at,
            is_edited: false,
            status: RecordStatus::Active,
        }
    }

    #[test]
    fn login_is_find_or_create() {
        let (_dir, s) = store();
        let a = s.find_or_create_user("ann").unwrap();
        assert_eq!(s.find_or_create_user("ann").unwrap().id, a.id);
        assert_ne!(s.find_or_create_user("bob").unwrap().id, a.id);
    }

    #[test]
    fn session_token_must_match_stored() {
        let (_dir, s) = store();
        let a = s.find_or_create_user("ann").unwrap();
        let token = auth::issue_jwt(s.secret(), a.id, "ann", time::Duration::hours(1)).unwrap();
        assert_eq!(s.validate_token(&token).unwrap(), None);
        s.set_session_token(&a.id, Some(&token)).unwrap();
        assert_eq!(s.validate_token(&token).unwrap().map(|u| u.id), Some(a.id));
        s.set_session_token(&a.id, None).unwrap();
        assert_eq!(s.validate_token(&token).unwrap(), None);
        assert_eq!(s.validate_token("garbage").unwrap(), None);
    }

    #[test]
    fn presence_columns_update() {
        let (_dir, s) = store();
        let a = s.find_or_create_user("ann").unwrap();
        s.set_online(&a.id, true, None).unwrap();
        assert!(s.find_user(&a.id).unwrap().unwrap().is_online);
        s.set_online(&a.id, false, Some(42)).unwrap();
        let stored = s.find_user(&a.id).unwrap().unwrap();
        assert!(!stored.is_online);
        assert_eq!(stored.last_seen_at, Some(42));
    }

    #[test]
    fn membership_keeps_a_single_row() {
        let (_dir, s) = store();
        let a = s.find_or_create_user("ann").unwrap();
        let r = room(a.id);
        s.insert_room(&r).unwrap();
        assert_eq!(s.join_participant(&r.id, &a.id, 1).unwrap(), JoinOutcome::Joined);
        assert_eq!(s.join_participant(&r.id, &a.id, 2).unwrap(), JoinOutcome::AlreadyActive);
        assert!(s.leave_participant(&r.id, &a.id, 3).unwrap());
        assert!(!s.leave_participant(&r.id, &a.id, 4).unwrap());
        assert!(s.list_user_rooms(&a.id).unwrap().is_empty());
        assert_eq!(s.join_participant(&r.id, &a.id, 5).unwrap(), JoinOutcome::Rejoined);
        let p = s.find_participant(&r.id, &a.id).unwrap().unwrap();
        assert_eq!((p.joined_at, p.left_at), (5, None));
        assert_eq!(s.list_rooms().unwrap(), vec![(r.clone(), 1)]);
        assert_eq!(s.list_members(&r.id).unwrap().len(), 1);

        s.soft_delete_room(&r.id, 6).unwrap();
        assert!(s.list_rooms().unwrap().is_empty());
        assert_eq!(
            s.find_room(&r.id).unwrap().unwrap().status,
            RecordStatus::Deleted
        );
    }

    #[test]
    fn ordering_queries_follow_keys() {
        let (_dir, s) = store();
        let a = s.find_or_create_user("ann").unwrap();
        let b = s.find_or_create_user("bob").unwrap();
        let r = room(a.id);
        s.insert_room(&r).unwrap();

        let m1 = message(r.id, a.id, 10);
        let mut m2 = message(r.id, b.id, 20);
        let m3 = message(r.id, a.id, 20);
        for m in [&m1, &m2, &m3] {
            s.insert_message(m).unwrap();
        }
        let newest = s.newest_in_room(&r.id).unwrap().unwrap();
        assert_eq!(newest, m2.key().max(m3.key()));
        assert_eq!(s.latest_active_by_sender(&r.id, &a.id).unwrap().unwrap().id, m3.id);
        assert_eq!(s.find_message(&m1.id).unwrap().unwrap().sender_nickname, "ann");
        assert!(s.has_newer_from_others(&r.id, &a.id, m1.key()).unwrap());

        let first = s.page(&r.id, None, 2).unwrap();
        let mut expected = vec![m1.clone(), m2.clone(), m3.clone()];
        expected.sort_by(|x, y| y.key().cmp(&x.key()));
        assert_eq!(
            first.iter().map(|m| m.id).collect::<Vec<_>>(),
            expected[..2].iter().map(|m| m.id).collect::<Vec<_>>()
        );
        let rest = s.page(&r.id, Some(first[1].key()), 2).unwrap();
        assert_eq!(rest.iter().map(|m| m.id).collect::<Vec<_>>(), vec![expected[2].id]);

        m2.status = RecordStatus::Deleted;
        s.update_message(&m2).unwrap();
        assert!(!s.has_newer_from_others(&r.id, &a.id, m1.key()).unwrap());
        assert_eq!(s.page(&r.id, None, 10).unwrap().len(), 2);
        // deleted rows still pin the newest key
        assert_eq!(s.newest_in_room(&r.id).unwrap().unwrap(), newest);
    }
}
