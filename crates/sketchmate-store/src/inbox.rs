use rusqlite::{params, Connection, OptionalExtension};

use sketchmate_shared::{InboxId, InboxItem, InboxUpdate, UserId};

use crate::database::{from_json, not_found, parse_timestamp, to_json, Database};
use crate::error::Result;

const SELECT_ITEM: &str = "SELECT id, sender, drawing, image, thumbnail, aspect_ratio, followers,
            original_followers, seen_by, comments_seen_by, comments, date
     FROM inbox_items WHERE id = ?1";

impl Database {
    pub fn insert_inbox_item(&self, item: &InboxItem) -> Result<()> {
        self.conn().execute(
            "INSERT INTO inbox_items (id, sender, drawing, image, thumbnail, aspect_ratio,
                                      followers, original_followers, seen_by,
                                      comments_seen_by, comments, date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                item.id.to_string(),
                item.sender.as_str(),
                item.drawing,
                item.image,
                item.thumbnail,
                item.aspect_ratio,
                to_json(&item.followers)?,
                to_json(&item.original_followers)?,
                to_json(&item.seen_by)?,
                to_json(&item.comments_seen_by)?,
                to_json(&item.comments)?,
                item.date.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_inbox_item(&self, id: InboxId) -> Result<InboxItem> {
        self.conn()
            .query_row(SELECT_ITEM, params![id.to_string()], row_to_item)
            .map_err(not_found)
    }

    pub fn find_inbox_item(&self, id: InboxId) -> Result<Option<InboxItem>> {
        Ok(self
            .conn()
            .query_row(SELECT_ITEM, params![id.to_string()], row_to_item)
            .optional()?)
    }

    /// Apply `updates` to one inbox item inside a transaction and return the
    /// resulting document.
    pub fn update_inbox_item(&mut self, id: InboxId, updates: &[InboxUpdate]) -> Result<InboxItem> {
        let tx = self.conn_mut().transaction()?;

        let mut item = tx
            .query_row(SELECT_ITEM, params![id.to_string()], row_to_item)
            .map_err(not_found)?;
        for update in updates {
            item.apply(update);
        }
        write_item(&tx, &item)?;

        tx.commit()?;
        Ok(item)
    }

    pub fn delete_inbox_item(&self, id: InboxId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM inbox_items WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

fn write_item(conn: &Connection, item: &InboxItem) -> Result<()> {
    conn.execute(
        "UPDATE inbox_items SET followers = ?2, seen_by = ?3, comments_seen_by = ?4,
                                comments = ?5
         WHERE id = ?1",
        params![
            item.id.to_string(),
            to_json(&item.followers)?,
            to_json(&item.seen_by)?,
            to_json(&item.comments_seen_by)?,
            to_json(&item.comments)?,
        ],
    )?;
    Ok(())
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<InboxItem> {
    let id: String = row.get(0)?;
    let sender: String = row.get(1)?;
    let followers: String = row.get(6)?;
    let original_followers: String = row.get(7)?;
    let seen_by: String = row.get(8)?;
    let comments_seen_by: String = row.get(9)?;
    let comments: String = row.get(10)?;
    let date: String = row.get(11)?;

    let id = id.parse::<InboxId>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(InboxItem {
        id,
        sender: UserId(sender),
        drawing: row.get(2)?,
        image: row.get(3)?,
        thumbnail: row.get(4)?,
        aspect_ratio: row.get(5)?,
        followers: from_json(6, &followers)?,
        original_followers: from_json(7, &original_followers)?,
        seen_by: from_json(8, &seen_by)?,
        comments_seen_by: from_json(9, &comments_seen_by)?,
        comments: from_json(10, &comments)?,
        date: parse_timestamp(11, &date)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreError;
    use chrono::Utc;
    use sketchmate_shared::Comment;

    fn item(sender: &str, followers: &[&str]) -> InboxItem {
        let followers: Vec<UserId> = followers.iter().map(|f| UserId::from(*f)).collect();
        InboxItem {
            id: InboxId::new(),
            sender: UserId::from(sender),
            drawing: "https://blobs/d".into(),
            image: "https://blobs/i".into(),
            thumbnail: "https://blobs/t".into(),
            aspect_ratio: 0.75,
            followers: followers.clone(),
            original_followers: followers,
            seen_by: vec![UserId::from(sender)],
            comments_seen_by: vec![UserId::from(sender)],
            comments: Vec::new(),
            date: Utc::now(),
        }
    }

    #[test]
    fn insert_get_delete() {
        let db = Database::open_in_memory().unwrap();
        let it = item("a", &["a", "b"]);
        db.insert_inbox_item(&it).unwrap();

        let loaded = db.get_inbox_item(it.id).unwrap();
        assert_eq!(loaded.followers, it.followers);
        assert_eq!(loaded.aspect_ratio, 0.75);

        assert!(db.delete_inbox_item(it.id).unwrap());
        assert!(!db.delete_inbox_item(it.id).unwrap());
        assert!(matches!(
            db.get_inbox_item(it.id),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn update_keeps_original_followers() {
        let mut db = Database::open_in_memory().unwrap();
        let it = item("a", &["a", "b"]);
        db.insert_inbox_item(&it).unwrap();

        let comment = Comment::new(UserId::from("b"), "wow");
        let updated = db
            .update_inbox_item(
                it.id,
                &[
                    InboxUpdate::PullFollower(UserId::from("a")),
                    InboxUpdate::PushComment(comment.clone()),
                ],
            )
            .unwrap();
        assert_eq!(updated.followers, vec![UserId::from("b")]);

        let loaded = db.get_inbox_item(it.id).unwrap();
        assert_eq!(loaded.original_followers.len(), 2);
        assert_eq!(loaded.comments[0].id, comment.id);
        assert_eq!(loaded.comments_seen_by, vec![UserId::from("b")]);
    }
}
