//! Persistence collaborator used by the realtime core.
//!
//! The core only depends on the [`Persistence`] trait; [`SqlitePersistence`]
//! is the production backend over `sketchmate-store`. Each user or inbox
//! update is atomic on its own document, while operations spanning two users
//! are not wrapped in a common transaction.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use sketchmate_shared::{InboxId, InboxItem, InboxUpdate, User, UserId, UserUpdate};
use sketchmate_store::{Database, StoreError};

use crate::error::ServerError;

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn find_user(&self, id: &UserId) -> Result<Option<User>, ServerError>;

    async fn create_user(&self, user: User) -> Result<User, ServerError>;

    /// Apply updates atomically and return the updated record.
    /// Fails with [`ServerError::UserNotFound`] when the record is missing.
    async fn update_user(&self, id: &UserId, updates: Vec<UserUpdate>) -> Result<User, ServerError>;

    async fn create_inbox_item(&self, item: InboxItem) -> Result<InboxItem, ServerError>;

    async fn find_inbox_item(&self, id: InboxId) -> Result<Option<InboxItem>, ServerError>;

    /// Fails with [`ServerError::InboxItemNotFound`] when the item is missing.
    async fn update_inbox_item(
        &self,
        id: InboxId,
        updates: Vec<InboxUpdate>,
    ) -> Result<InboxItem, ServerError>;

    /// Returns false if there was nothing to delete.
    async fn delete_inbox_item(&self, id: InboxId) -> Result<bool, ServerError>;

    /// Like [`Persistence::find_user`] but a missing record is an error.
    async fn get_user(&self, id: &UserId) -> Result<User, ServerError> {
        self.find_user(id)
            .await?
            .ok_or_else(|| ServerError::UserNotFound(id.clone()))
    }
}

/// SQLite backend. Queries run on the blocking pool behind one connection.
#[derive(Clone)]
pub struct SqlitePersistence {
    db: Arc<Mutex<Database>>,
}

impl SqlitePersistence {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    async fn with_db<T, F>(&self, op: F) -> Result<T, ServerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> Result<T, ServerError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db
                .lock()
                .map_err(|_| ServerError::Internal("database lock poisoned".to_string()))?;
            op(&mut *guard)
        })
        .await
        .map_err(|e| ServerError::Internal(format!("database task failed: {e}")))?
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn find_user(&self, id: &UserId) -> Result<Option<User>, ServerError> {
        let id = id.clone();
        self.with_db(move |db| Ok(db.find_user(&id)?)).await
    }

    async fn create_user(&self, user: User) -> Result<User, ServerError> {
        self.with_db(move |db| {
            db.insert_user(&user)?;
            Ok(user)
        })
        .await
    }

    async fn update_user(&self, id: &UserId, updates: Vec<UserUpdate>) -> Result<User, ServerError> {
        let id = id.clone();
        self.with_db(move |db| match db.update_user(&id, &updates) {
            Ok(user) => Ok(user),
            Err(StoreError::NotFound) => Err(ServerError::UserNotFound(id)),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn create_inbox_item(&self, item: InboxItem) -> Result<InboxItem, ServerError> {
        self.with_db(move |db| {
            db.insert_inbox_item(&item)?;
            Ok(item)
        })
        .await
    }

    async fn find_inbox_item(&self, id: InboxId) -> Result<Option<InboxItem>, ServerError> {
        self.with_db(move |db| Ok(db.find_inbox_item(id)?)).await
    }

    async fn update_inbox_item(
        &self,
        id: InboxId,
        updates: Vec<InboxUpdate>,
    ) -> Result<InboxItem, ServerError> {
        self.with_db(move |db| match db.update_inbox_item(id, &updates) {
            Ok(item) => Ok(item),
            Err(StoreError::NotFound) => Err(ServerError::InboxItemNotFound(id)),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn delete_inbox_item(&self, id: InboxId) -> Result<bool, ServerError> {
        self.with_db(move |db| Ok(db.delete_inbox_item(id)?)).await
    }
}
