//! Push payload catalogue.

use std::collections::BTreeMap;

use serde::Serialize;

use sketchmate_shared::constants::{
    NOTIFICATION_TYPE_COMMENT, NOTIFICATION_TYPE_FRIEND_REQUEST,
    NOTIFICATION_TYPE_FRIEND_REQUEST_UPDATE, NOTIFICATION_TYPE_MATCH, NOTIFICATION_TYPE_MESSAGE,
    NOTIFICATION_TYPE_UNMATCH,
};
use sketchmate_shared::{InboxId, UserId};

/// Visible part of a push.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Alert {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// A push message independent of the provider wire format. A payload
/// without an alert is delivered as data-only.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PushPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
    pub data: BTreeMap<String, String>,
}

impl PushPayload {
    fn new(kind: &str, title: String, body: &str) -> Self {
        let mut data = BTreeMap::new();
        data.insert("type".to_string(), kind.to_string());
        Self {
            alert: Some(Alert {
                title,
                body: body.to_string(),
                image: None,
            }),
            data,
        }
    }

    fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.data.insert(key.to_string(), value.to_string());
        self
    }

    /// Data-only copy of this payload.
    pub fn silent(&self) -> Self {
        Self {
            alert: None,
            data: self.data.clone(),
        }
    }

    pub fn is_silent(&self) -> bool {
        self.alert.is_none()
    }

    pub fn kind(&self) -> Option<&str> {
        self.data.get("type").map(String::as_str)
    }
}

pub fn match_notification(mate_name: &str) -> PushPayload {
    PushPayload::new(
        NOTIFICATION_TYPE_MATCH,
        format!("You are matched to {mate_name}"),
        "Start drawing now!",
    )
}

pub fn unmatch_notification(mate_name: &str, mate_id: &UserId, unmatcher: &UserId) -> PushPayload {
    PushPayload::new(
        NOTIFICATION_TYPE_UNMATCH,
        format!("{mate_name} unmatched you"),
        "Connect to a new mate",
    )
    .with("mate_id", mate_id)
    .with("unmatcher", unmatcher)
}

pub fn drawing_notification(
    sender: &UserId,
    sender_name: &str,
    image_url: &str,
    inbox_id: InboxId,
) -> PushPayload {
    let mut payload = PushPayload::new(
        NOTIFICATION_TYPE_MESSAGE,
        format!("{sender_name} sent you a drawing"),
        "Tap to view",
    )
    .with("inbox_id", inbox_id)
    .with("image_url", image_url)
    .with("mate_id", sender);
    if let Some(alert) = payload.alert.as_mut() {
        alert.image = Some(image_url.to_string());
    }
    payload
}

pub fn comment_notification(commenter_name: &str, inbox_id: InboxId) -> PushPayload {
    PushPayload::new(
        NOTIFICATION_TYPE_COMMENT,
        format!("{commenter_name} commented on a drawing"),
        "Tap to view",
    )
    .with("inbox_id", inbox_id)
}

pub fn mate_request_notification(sender_name: &str, sender: &UserId) -> PushPayload {
    PushPayload::new(
        NOTIFICATION_TYPE_FRIEND_REQUEST,
        format!("{sender_name} sent you a friend request"),
        "Tap to view",
    )
    .with("sender", sender)
}

/// Data-only state sync after a request was cancelled or refused.
pub fn mate_request_update(action: &str, sender: &UserId, receiver: &UserId) -> PushPayload {
    let mut data = BTreeMap::new();
    data.insert("type".to_string(), NOTIFICATION_TYPE_FRIEND_REQUEST_UPDATE.to_string());
    data.insert("action".to_string(), action.to_string());
    data.insert("sender".to_string(), sender.to_string());
    data.insert("receiver".to_string(), receiver.to_string());
    PushPayload { alert: None, data }
}
