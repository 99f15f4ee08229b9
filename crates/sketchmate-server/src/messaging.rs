//! Inbox pipeline: materializing reassembled sends, comments, removal and
//! seen tracking.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use sketchmate_shared::{Comment, InboxId, InboxItem, InboxUpdate, UserId, UserUpdate};

use crate::blob_store::BlobStorage;
use crate::error::ServerError;
use crate::persistence::Persistence;
use crate::thumbnail::make_thumbnail_async;
use crate::transfer::AssembledSend;

/// Result of removing an item from one user's inbox.
#[derive(Debug, Clone)]
pub struct Removal {
    pub item: InboxItem,
    /// True when the user was the last follower and the item is gone.
    pub deleted: bool,
}

pub struct InboxService {
    store: Arc<dyn Persistence>,
    blobs: Arc<dyn BlobStorage>,
    thumbnail_size: u32,
}

impl InboxService {
    pub fn new(store: Arc<dyn Persistence>, blobs: Arc<dyn BlobStorage>, thumbnail_size: u32) -> Self {
        Self {
            store,
            blobs,
            thumbnail_size,
        }
    }

    /// Upload the assets of `send`, persist the inbox item and link it into
    /// every follower's inbox. On failure nothing of this message is left
    /// behind except blobs whose deletion failed.
    pub async fn store_message(&self, send: AssembledSend) -> Result<InboxItem, ServerError> {
        let AssembledSend { envelope, image } = send;
        self.store.get_user(&envelope.sender).await?;

        let mut followers: Vec<UserId> = Vec::with_capacity(envelope.followers.len() + 1);
        for id in envelope.followers.iter().chain(std::iter::once(&envelope.sender)) {
            if !followers.contains(id) {
                followers.push(id.clone());
            }
        }

        let mut uploaded = Vec::with_capacity(3);
        let result = self
            .materialize(
                &mut uploaded,
                envelope.sender.clone(),
                envelope.drawing.into_bytes(),
                image,
                envelope.aspect_ratio,
                followers,
            )
            .await;

        match result {
            Ok(item) => {
                info!(
                    inbox = %item.id,
                    sender = %item.sender,
                    followers = item.followers.len(),
                    "Stored drawing"
                );
                Ok(item)
            }
            Err(e) => {
                warn!(sender = %envelope.sender, error = %e, "Send failed, cleaning up");
                self.delete_blobs(uploaded.iter().map(String::as_str)).await;
                Err(e)
            }
        }
    }

    async fn materialize(
        &self,
        uploaded: &mut Vec<String>,
        sender: UserId,
        drawing: Vec<u8>,
        image: Vec<u8>,
        aspect_ratio: f64,
        followers: Vec<UserId>,
    ) -> Result<InboxItem, ServerError> {
        let thumbnail = make_thumbnail_async(image.clone(), self.thumbnail_size).await?;

        let drawing = self.upload(uploaded, drawing).await?;
        let image = self.upload(uploaded, image).await?;
        let thumbnail = self.upload(uploaded, thumbnail).await?;

        let item = InboxItem {
            id: InboxId::new(),
            sender: sender.clone(),
            drawing,
            image,
            thumbnail,
            aspect_ratio,
            original_followers: followers.clone(),
            followers,
            seen_by: vec![sender.clone()],
            comments_seen_by: vec![sender],
            comments: Vec::new(),
            date: Utc::now(),
        };
        let item = self.store.create_inbox_item(item).await?;

        if let Err(e) = self.link_followers(&item).await {
            if let Err(cleanup) = self.store.delete_inbox_item(item.id).await {
                warn!(inbox = %item.id, error = %cleanup, "Cannot delete half-linked inbox item");
            }
            return Err(e);
        }
        Ok(item)
    }

    async fn upload(&self, uploaded: &mut Vec<String>, data: Vec<u8>) -> Result<String, ServerError> {
        let url = self.blobs.upload(data).await?;
        uploaded.push(url.clone());
        Ok(url)
    }

    async fn link_followers(&self, item: &InboxItem) -> Result<(), ServerError> {
        for follower in &item.followers {
            match self
                .store
                .update_user(follower, vec![UserUpdate::PushInbox(item.id)])
                .await
            {
                Ok(_) => {}
                Err(ServerError::UserNotFound(_)) => {
                    debug!(inbox = %item.id, follower = %follower, "Skipping unknown follower");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Append a comment. The returned item carries the audience used for
    /// fan-out (`original_followers`).
    pub async fn comment(
        &self,
        inbox_id: InboxId,
        sender: &UserId,
        message: &str,
    ) -> Result<(InboxItem, Comment), ServerError> {
        let comment = Comment::new(sender.clone(), message);
        let item = self
            .store
            .update_inbox_item(inbox_id, vec![InboxUpdate::PushComment(comment.clone())])
            .await?;
        debug!(inbox = %inbox_id, sender = %sender, "Comment stored");
        Ok((item, comment))
    }

    pub async fn remove_from_inbox(
        &self,
        inbox_id: InboxId,
        user_id: &UserId,
    ) -> Result<Removal, ServerError> {
        let item = self
            .store
            .update_inbox_item(inbox_id, vec![InboxUpdate::PullFollower(user_id.clone())])
            .await?;

        match self
            .store
            .update_user(user_id, vec![UserUpdate::PullInbox(inbox_id)])
            .await
        {
            Ok(_) | Err(ServerError::UserNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if !item.is_orphaned() {
            return Ok(Removal {
                item,
                deleted: false,
            });
        }

        let deleted = self.store.delete_inbox_item(inbox_id).await?;
        self.delete_blobs(item.asset_urls()).await;
        info!(inbox = %inbox_id, "Inbox item deleted with its blobs");
        Ok(Removal { item, deleted })
    }

    pub async fn mark_seen(&self, inbox_id: InboxId, user_id: &UserId) -> Result<InboxItem, ServerError> {
        self.store
            .update_inbox_item(inbox_id, vec![InboxUpdate::MarkSeen(user_id.clone())])
            .await
    }

    async fn delete_blobs<'a>(&self, urls: impl IntoIterator<Item = &'a str>) {
        for url in urls {
            if let Err(e) = self.blobs.delete(url).await {
                warn!(url, error = %e, "Blob cleanup failed");
            }
        }
    }
}
