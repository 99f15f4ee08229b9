use rusqlite::{params, Connection, OptionalExtension};

use sketchmate_shared::{User, UserId, UserUpdate};

use crate::database::{from_json, not_found, parse_timestamp, to_json, Database};
use crate::error::{Result, StoreError};

const SELECT_USER: &str = "SELECT id, name, img, mates, mate_requests_sent,
            mate_requests_received, subscriptions, inbox, created_at
     FROM users WHERE id = ?1";

impl Database {
    pub fn insert_user(&self, user: &User) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO users (id, name, img, mates, mate_requests_sent,
                                mate_requests_received, subscriptions, inbox, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                user.id.as_str(),
                user.name,
                user.img,
                to_json(&user.mates)?,
                to_json(&user.mate_requests_sent)?,
                to_json(&user.mate_requests_received)?,
                to_json(&user.subscriptions)?,
                to_json(&user.inbox)?,
                user.created_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_user(&self, id: &UserId) -> Result<User> {
        self.conn()
            .query_row(SELECT_USER, params![id.as_str()], row_to_user)
            .map_err(not_found)
    }

    pub fn find_user(&self, id: &UserId) -> Result<Option<User>> {
        Ok(self
            .conn()
            .query_row(SELECT_USER, params![id.as_str()], row_to_user)
            .optional()?)
    }

    /// Apply `updates` to one user record inside a transaction and return the
    /// resulting document.
    pub fn update_user(&mut self, id: &UserId, updates: &[UserUpdate]) -> Result<User> {
        let tx = self.conn_mut().transaction()?;

        let mut user = tx
            .query_row(SELECT_USER, params![id.as_str()], row_to_user)
            .map_err(not_found)?;
        user.apply_all(updates);
        write_user(&tx, &user)?;

        tx.commit()?;
        Ok(user)
    }
}

fn write_user(conn: &Connection, user: &User) -> Result<()> {
    conn.execute(
        "UPDATE users SET name = ?2, img = ?3, mates = ?4, mate_requests_sent = ?5,
                          mate_requests_received = ?6, subscriptions = ?7, inbox = ?8
         WHERE id = ?1",
        params![
            user.id.as_str(),
            user.name,
            user.img,
            to_json(&user.mates)?,
            to_json(&user.mate_requests_sent)?,
            to_json(&user.mate_requests_received)?,
            to_json(&user.subscriptions)?,
            to_json(&user.inbox)?,
        ],
    )?;
    Ok(())
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let mates: String = row.get(3)?;
    let sent: String = row.get(4)?;
    let received: String = row.get(5)?;
    let subscriptions: String = row.get(6)?;
    let inbox: String = row.get(7)?;
    let created_at: String = row.get(8)?;

    Ok(User {
        id: UserId(id),
        name: row.get(1)?,
        img: row.get(2)?,
        mates: from_json(3, &mates)?,
        mate_requests_sent: from_json(4, &sent)?,
        mate_requests_received: from_json(5, &received)?,
        subscriptions: from_json(6, &subscriptions)?,
        inbox: from_json(7, &inbox)?,
        created_at: parse_timestamp(8, &created_at)?,
    })
}
