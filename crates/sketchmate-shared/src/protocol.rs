//! Realtime wire protocol.
//!
//! Text frames carry JSON `{ "event": ..., "payload": ... }` objects in both
//! directions. Binary frames carry transfer chunks: one [`FrameType`] byte
//! followed by the chunk body.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::models::{Comment, InboxItem, Mate, NotificationSubscription};
use crate::types::{FrameType, InboxId, UserId};

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Text events a client may send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload")]
pub enum ClientEvent {
    #[serde(rename = "login")]
    Login(LoginRequest),
    #[serde(rename = "match")]
    Match(MatchRequest),
    #[serde(rename = "unmatch")]
    Unmatch(UnmatchRequest),
    #[serde(rename = "send.text_end")]
    SendTextEnd,
    #[serde(rename = "send.img_end")]
    SendImgEnd,
    #[serde(rename = "comment")]
    Comment(CommentRequest),
    #[serde(rename = "mate_request.send")]
    MateRequestSend(MateRequest),
    #[serde(rename = "mate_request.cancel")]
    MateRequestCancel(MateRequest),
    #[serde(rename = "mate_request.refuse")]
    MateRequestRefuse(MateRequest),
    #[serde(rename = "inbox.remove")]
    InboxRemove(InboxRequest),
    #[serde(rename = "inbox.seen")]
    InboxSeen(InboxRequest),
    #[serde(rename = "subscription.register")]
    SubscriptionRegister(SubscribeRequest),
    #[serde(rename = "subscription.unregister")]
    SubscriptionUnregister(UnsubscribeRequest),
    #[serde(rename = "subscription.logged_in")]
    SubscriptionLoggedIn(LoggedInRequest),
    #[serde(rename = "profile.rename")]
    ProfileRename(RenameRequest),
    #[serde(rename = "profile.avatar")]
    ProfileAvatar(AvatarRequest),
}

impl ClientEvent {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Outbound event name used when answering this request.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Login(_) => "login",
            ClientEvent::Match(_) => "match",
            ClientEvent::Unmatch(_) => "unmatch",
            ClientEvent::SendTextEnd | ClientEvent::SendImgEnd => "send",
            ClientEvent::Comment(_) => "comment",
            ClientEvent::MateRequestSend(_) => "mate_request.send",
            ClientEvent::MateRequestCancel(_) => "mate_request.cancel",
            ClientEvent::MateRequestRefuse(_) => "mate_request.refuse",
            ClientEvent::InboxRemove(_) => "inbox.remove",
            ClientEvent::InboxSeen(_) => "inbox.seen",
            ClientEvent::SubscriptionRegister(_)
            | ClientEvent::SubscriptionUnregister(_)
            | ClientEvent::SubscriptionLoggedIn(_) => "subscription",
            ClientEvent::ProfileRename(_) | ClientEvent::ProfileAvatar(_) => "profile",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginRequest {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchRequest {
    pub user_id: UserId,
    pub mate_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnmatchRequest {
    pub user_id: UserId,
    pub mate_id: UserId,
    /// Display name of the user unmatching, used in the push text.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentRequest {
    pub inbox_id: InboxId,
    pub sender: UserId,
    /// Display name of the commenter, used in the push text.
    pub name: String,
    pub message: String,
}

/// `sender` is always the user issuing the event. For a refusal that is the
/// user who originally received the request; `receiver` is its original sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MateRequest {
    pub sender: UserId,
    pub receiver: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboxRequest {
    pub inbox_id: InboxId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub user_id: UserId,
    pub subscription: NotificationSubscription,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsubscribeRequest {
    pub user_id: UserId,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggedInRequest {
    pub user_id: UserId,
    pub fingerprint: String,
    pub logged_in: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenameRequest {
    pub user_id: UserId,
    pub name: String,
}

/// `img` is the URL of an already uploaded avatar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AvatarRequest {
    pub user_id: UserId,
    pub img: String,
}

/// Decompressed contents of the text stream of a send transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendEnvelope {
    #[serde(alias = "_id")]
    pub sender: UserId,
    /// Display name of the sender, used in the push text.
    pub name: String,
    pub followers: Vec<UserId>,
    /// Serialized vector drawing, stored verbatim as a blob.
    pub drawing: String,
    pub aspect_ratio: f64,
}

/// Split a binary frame into its type and chunk body.
pub fn parse_chunk_frame(data: &[u8]) -> Result<(FrameType, &[u8]), ProtocolError> {
    let (&tag, body) = data.split_first().ok_or(ProtocolError::EmptyFrame)?;
    let frame_type = FrameType::from_byte(tag).ok_or(ProtocolError::UnknownFrameType(tag))?;
    Ok((frame_type, body))
}

pub fn encode_chunk_frame(frame_type: FrameType, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 1);
    frame.push(frame_type as u8);
    frame.extend_from_slice(body);
    frame
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Error shape of every failed reply: `{ "error": message }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub error: String,
}

/// Either a success payload or an [`ErrorBody`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Reply<T> {
    Err(ErrorBody),
    Ok(T),
}

impl<T> Reply<T> {
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Err(ErrorBody {
            error: message.into(),
        })
    }

    /// Error text of a failed reply.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Reply::Err(body) => Some(&body.error),
            Reply::Ok(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnmatchPayload {
    pub user_id: UserId,
    pub mate_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentPayload {
    pub inbox_item_id: InboxId,
    pub comment: Comment,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MateRequestPayload {
    pub sender: UserId,
    pub receiver: UserId,
    /// Projection of the requesting user, included on `mate_request.send`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Mate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboxRemovedPayload {
    pub inbox_id: InboxId,
    /// True when this removal emptied the audience and the item was deleted.
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboxSeenPayload {
    pub inbox_id: InboxId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionPayload {
    pub fingerprint: String,
}

/// Events the server emits to a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "login")]
    Login(Reply<UserId>),
    /// Carries the projection of the other party.
    #[serde(rename = "match")]
    Match(Reply<Mate>),
    #[serde(rename = "unmatch")]
    Unmatch(Reply<UnmatchPayload>),
    #[serde(rename = "send")]
    Send(Reply<InboxItem>),
    #[serde(rename = "comment")]
    Comment(Reply<CommentPayload>),
    #[serde(rename = "mate_request.send")]
    MateRequestSend(Reply<MateRequestPayload>),
    #[serde(rename = "mate_request.cancel")]
    MateRequestCancel(Reply<MateRequestPayload>),
    #[serde(rename = "mate_request.refuse")]
    MateRequestRefuse(Reply<MateRequestPayload>),
    #[serde(rename = "inbox.remove")]
    InboxRemove(Reply<InboxRemovedPayload>),
    #[serde(rename = "inbox.seen")]
    InboxSeen(Reply<InboxSeenPayload>),
    #[serde(rename = "subscription")]
    Subscription(Reply<SubscriptionPayload>),
    /// Updated projection of a user, sent to the user and their online mates.
    #[serde(rename = "profile")]
    Profile(Reply<Mate>),
    /// Traffic that could not be attributed to any request.
    #[serde(rename = "error")]
    Error(ErrorBody),
}

impl ServerEvent {
    /// The failed variant of the reply to an event named `name`.
    pub fn failure(name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match name {
            "login" => ServerEvent::Login(Reply::error(message)),
            "match" => ServerEvent::Match(Reply::error(message)),
            "unmatch" => ServerEvent::Unmatch(Reply::error(message)),
            "send" => ServerEvent::Send(Reply::error(message)),
            "comment" => ServerEvent::Comment(Reply::error(message)),
            "mate_request.send" => ServerEvent::MateRequestSend(Reply::error(message)),
            "mate_request.cancel" => ServerEvent::MateRequestCancel(Reply::error(message)),
            "mate_request.refuse" => ServerEvent::MateRequestRefuse(Reply::error(message)),
            "inbox.remove" => ServerEvent::InboxRemove(Reply::error(message)),
            "inbox.seen" => ServerEvent::InboxSeen(Reply::error(message)),
            "subscription" => ServerEvent::Subscription(Reply::error(message)),
            "profile" => ServerEvent::Profile(Reply::error(message)),
            _ => ServerEvent::Error(ErrorBody { error: message }),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
