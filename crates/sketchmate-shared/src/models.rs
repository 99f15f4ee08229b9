//! Persisted documents and the update vocabulary applied to them.
//!
//! Storage backends never patch fields ad hoc: every mutation is expressed as
//! a [`UserUpdate`] or [`InboxUpdate`] and applied through [`User::apply`] /
//! [`InboxItem::apply`], so set semantics (no duplicate request ids, unique
//! subscription fingerprints) hold regardless of the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{InboxId, Platform, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// Denormalized projection of another user, stored in a user's mate list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mate {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub name: String,
    pub img: String,
}

/// One push delivery target (device/installation) of a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationSubscription {
    pub token: String,
    pub platform: Platform,
    /// Uniqueness key of the subscription within a user record.
    pub fingerprint: String,
    pub model: String,
    pub os: String,
    /// Entries with `logged_in == false` are kept but never sent to.
    pub logged_in: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub name: String,
    pub img: String,
    pub mates: Vec<Mate>,
    pub mate_requests_sent: Vec<UserId>,
    pub mate_requests_received: Vec<UserId>,
    pub subscriptions: Vec<NotificationSubscription>,
    pub inbox: Vec<InboxId>,
    pub created_at: DateTime<Utc>,
}

/// A single mutation of a [`User`] document.
#[derive(Debug, Clone, PartialEq)]
pub enum UserUpdate {
    /// Append a mate projection. Callers check for an existing entry first.
    AddMate(Mate),
    /// Drop every mate entry referencing the id. No-op when absent.
    RemoveMate(UserId),
    /// Drop the id from both request sets.
    ClearMateRequests(UserId),
    AddSentRequest(UserId),
    AddReceivedRequest(UserId),
    RemoveSentRequest(UserId),
    RemoveReceivedRequest(UserId),
    SetName(String),
    SetImg(String),
    SetMateName { mate: UserId, name: String },
    SetMateImg { mate: UserId, img: String },
    PushInbox(InboxId),
    PullInbox(InboxId),
    /// Insert, replacing any subscription with the same fingerprint.
    UpsertSubscription(NotificationSubscription),
    RemoveSubscription { fingerprint: String },
    SetSubscriptionLoggedIn { fingerprint: String, logged_in: bool },
}

impl User {
    pub fn new(id: UserId, name: impl Into<String>, img: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            img: img.into(),
            mates: Vec::new(),
            mate_requests_sent: Vec::new(),
            mate_requests_received: Vec::new(),
            subscriptions: Vec::new(),
            inbox: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// The projection other users store for this user.
    pub fn projection(&self) -> Mate {
        Mate {
            id: self.id.clone(),
            name: self.name.clone(),
            img: self.img.clone(),
        }
    }

    pub fn has_mate(&self, other: &UserId) -> bool {
        self.mates.iter().any(|m| &m.id == other)
    }

    /// Subscriptions that may currently receive pushes.
    pub fn live_subscriptions(&self) -> Vec<NotificationSubscription> {
        self.subscriptions
            .iter()
            .filter(|s| s.logged_in)
            .cloned()
            .collect()
    }

    pub fn apply(&mut self, update: &UserUpdate) {
        match update {
            UserUpdate::AddMate(mate) => self.mates.push(mate.clone()),
            UserUpdate::RemoveMate(id) => self.mates.retain(|m| &m.id != id),
            UserUpdate::ClearMateRequests(id) => {
                self.mate_requests_sent.retain(|r| r != id);
                self.mate_requests_received.retain(|r| r != id);
            }
            UserUpdate::AddSentRequest(id) => add_to_set(&mut self.mate_requests_sent, id),
            UserUpdate::AddReceivedRequest(id) => {
                add_to_set(&mut self.mate_requests_received, id)
            }
            UserUpdate::RemoveSentRequest(id) => self.mate_requests_sent.retain(|r| r != id),
            UserUpdate::RemoveReceivedRequest(id) => {
                self.mate_requests_received.retain(|r| r != id)
            }
            UserUpdate::SetName(name) => self.name = name.clone(),
            UserUpdate::SetImg(img) => self.img = img.clone(),
            UserUpdate::SetMateName { mate, name } => {
                for m in self.mates.iter_mut().filter(|m| &m.id == mate) {
                    m.name = name.clone();
                }
            }
            UserUpdate::SetMateImg { mate, img } => {
                for m in self.mates.iter_mut().filter(|m| &m.id == mate) {
                    m.img = img.clone();
                }
            }
            UserUpdate::PushInbox(id) => self.inbox.push(*id),
            UserUpdate::PullInbox(id) => self.inbox.retain(|i| i != id),
            UserUpdate::UpsertSubscription(sub) => {
                self.subscriptions
                    .retain(|s| s.fingerprint != sub.fingerprint);
                self.subscriptions.push(sub.clone());
                self.subscriptions
                    .sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
            }
            UserUpdate::RemoveSubscription { fingerprint } => {
                self.subscriptions.retain(|s| &s.fingerprint != fingerprint)
            }
            UserUpdate::SetSubscriptionLoggedIn {
                fingerprint,
                logged_in,
            } => {
                for s in self
                    .subscriptions
                    .iter_mut()
                    .filter(|s| &s.fingerprint == fingerprint)
                {
                    s.logged_in = *logged_in;
                }
            }
        }
    }

    pub fn apply_all(&mut self, updates: &[UserUpdate]) {
        for update in updates {
            self.apply(update);
        }
    }
}

fn add_to_set<T: PartialEq + Clone>(set: &mut Vec<T>, value: &T) {
    if !set.contains(value) {
        set.push(value.clone());
    }
}

// ---------------------------------------------------------------------------
// Inbox item
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comment {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub sender: UserId,
    pub message: String,
    pub date: DateTime<Utc>,
}

impl Comment {
    pub fn new(sender: UserId, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            message: message.into(),
            date: Utc::now(),
        }
    }
}

/// A persisted drawing and its audience.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboxItem {
    #[serde(rename = "_id")]
    pub id: InboxId,
    pub sender: UserId,
    /// Blob URL of the vector drawing data.
    pub drawing: String,
    /// Blob URL of the full-size raster image.
    pub image: String,
    /// Blob URL of the thumbnail.
    pub thumbnail: String,
    pub aspect_ratio: f64,
    /// Recipients still holding the item in their inbox.
    pub followers: Vec<UserId>,
    /// Audience at creation time. Never modified.
    pub original_followers: Vec<UserId>,
    pub seen_by: Vec<UserId>,
    pub comments_seen_by: Vec<UserId>,
    pub comments: Vec<Comment>,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboxUpdate {
    PullFollower(UserId),
    /// Add the user to `seen_by` and `comments_seen_by`.
    MarkSeen(UserId),
    /// Append a comment; only its sender has seen the thread afterwards.
    PushComment(Comment),
}

impl InboxItem {
    /// True once every recipient dismissed the item; it and its blobs may go.
    pub fn is_orphaned(&self) -> bool {
        self.followers.is_empty()
    }

    /// Blob URLs owned by this item.
    pub fn asset_urls(&self) -> [&str; 3] {
        [&self.drawing, &self.image, &self.thumbnail]
    }

    pub fn apply(&mut self, update: &InboxUpdate) {
        match update {
            InboxUpdate::PullFollower(id) => self.followers.retain(|f| f != id),
            InboxUpdate::MarkSeen(id) => {
                add_to_set(&mut self.seen_by, id);
                add_to_set(&mut self.comments_seen_by, id);
            }
            InboxUpdate::PushComment(comment) => {
                self.comments_seen_by = vec![comment.sender.clone()];
                self.comments.push(comment.clone());
            }
        }
    }
}
