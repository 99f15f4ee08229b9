//! Connection-event boundary.
//!
//! Every inbound frame of a connection goes through [`Gateway`]. Domain
//! errors never escape: they become the `{ "error": ... }` variant of the
//! reply to the originating connection. Replies are always emitted before
//! any fan-out. Push fallbacks for offline users start only after the state
//! change has been persisted, and run detached from the connection so a slow
//! provider never holds up the next frame.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use sketchmate_shared::protocol::{
    parse_chunk_frame, ClientEvent, CommentPayload, ErrorBody, InboxRemovedPayload,
    InboxSeenPayload, MateRequest, MateRequestPayload, Reply, ServerEvent, SubscriptionPayload,
    UnmatchPayload,
};
use sketchmate_shared::{
    FrameType, NotificationSubscription, ProtocolError, User, UserId, UserUpdate,
};

use crate::blob_store::BlobStorage;
use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::error::ServerError;
use crate::matching::MatchCoordinator;
use crate::messaging::InboxService;
use crate::notify::payload::{self, PushPayload};
use crate::notify::{Notifier, PushTasks, PushTransport};
use crate::persistence::Persistence;
use crate::session::{ConnectionHandle, ConnectionId, SessionRegistry};
use crate::transfer::TransferTable;

const DEFAULT_USER_NAME: &str = "Anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushKind {
    Visible,
    Silent,
    Dual,
}

/// Push delivery for users the dispatcher found offline. Every call returns
/// immediately; the work runs on [`PushTasks`].
#[derive(Clone)]
struct PushFallback {
    store: Arc<dyn Persistence>,
    notifier: Notifier,
    tasks: PushTasks,
}

impl PushFallback {
    fn to_ids(&self, user_ids: Vec<UserId>, push: PushPayload, kind: PushKind) {
        if user_ids.is_empty() {
            return;
        }
        let this = self.clone();
        self.tasks.spawn(async move {
            let loads = join_all(user_ids.iter().map(|id| this.store.find_user(id))).await;
            let mut targets = Vec::new();
            for (user_id, loaded) in user_ids.iter().zip(loads) {
                match loaded {
                    Ok(Some(user)) => targets.extend(user.live_subscriptions()),
                    Ok(None) => debug!(user = %user_id, "No record for push target"),
                    Err(e) => warn!(user = %user_id, error = %e, "Cannot load push target"),
                }
            }
            this.deliver(targets, push, kind).await;
        });
    }

    fn to_user(&self, user: &User, push: PushPayload, kind: PushKind) {
        let targets = user.live_subscriptions();
        if targets.is_empty() {
            debug!(user = %user.id, "Offline without live subscriptions");
            return;
        }
        let this = self.clone();
        self.tasks
            .spawn(async move { this.deliver(targets, push, kind).await });
    }

    async fn deliver(
        &self,
        targets: Vec<NotificationSubscription>,
        push: PushPayload,
        kind: PushKind,
    ) {
        if targets.is_empty() {
            return;
        }
        match kind {
            PushKind::Visible => {
                self.notifier.notify(&targets, &push).await;
            }
            PushKind::Silent => {
                self.notifier.notify_silent(&targets, &push).await;
            }
            PushKind::Dual => {
                let dual = self.notifier.notify_dual(&targets, &push).await;
                if let Err(e) = dual.silent.await {
                    warn!(error = %e, "Silent push task failed");
                }
            }
        }
    }
}

pub struct Gateway {
    sessions: SessionRegistry,
    transfers: TransferTable,
    dispatcher: Dispatcher,
    matcher: MatchCoordinator,
    inbox: InboxService,
    pushes: PushFallback,
    store: Arc<dyn Persistence>,
}

impl Gateway {
    pub fn new(
        config: &ServerConfig,
        store: Arc<dyn Persistence>,
        blobs: Arc<dyn BlobStorage>,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        let sessions = SessionRegistry::new();
        Self {
            transfers: TransferTable::new(config.max_transfer_size),
            dispatcher: Dispatcher::new(sessions.clone()),
            matcher: MatchCoordinator::new(store.clone()),
            inbox: InboxService::new(store.clone(), blobs, config.thumbnail_size),
            pushes: PushFallback {
                store: store.clone(),
                notifier: Notifier::new(transport, config.silent_push_delay),
                tasks: PushTasks::default(),
            },
            sessions,
            store,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn transfers(&self) -> &TransferTable {
        &self.transfers
    }

    /// Push deliveries started but not yet finished.
    pub fn pending_pushes(&self) -> usize {
        self.pushes.tasks.pending()
    }

    /// Wait until every detached push delivery has finished.
    pub async fn flush_pushes(&self) {
        self.pushes.tasks.wait_idle().await;
    }

    pub async fn handle_text(&self, conn: &ConnectionHandle, text: &str) {
        match ClientEvent::from_json(text) {
            Ok(event) => self.handle_event(conn, event).await,
            Err(e) => reject_frame(conn, e),
        }
    }

    pub async fn handle_binary(&self, conn: &ConnectionHandle, data: &[u8]) {
        let (stream, chunk) = match parse_chunk_frame(data) {
            Ok(parts) => parts,
            Err(e) => return reject_frame(conn, e),
        };
        if let Err(e) = self.transfers.append(conn.id(), stream, chunk).await {
            reply(conn, ServerEvent::failure("send", e.client_message()));
        }
    }

    pub async fn handle_event(&self, conn: &ConnectionHandle, event: ClientEvent) {
        let name = event.name();
        if let Err(e) = self.process(conn, event).await {
            match &e {
                ServerError::Persistence(_) | ServerError::BlobStorage(_) | ServerError::Internal(_) => {
                    warn!(connection = %conn.id(), event = name, error = %e, "Event failed");
                }
                _ => debug!(connection = %conn.id(), event = name, error = %e, "Event rejected"),
            }
            reply(conn, ServerEvent::failure(name, e.client_message()));
        }
    }

    /// Forget everything tied to the connection.
    pub async fn disconnect(&self, conn: ConnectionId) {
        self.transfers.discard(conn).await;
        self.sessions.deregister(conn).await;
    }

    async fn process(&self, conn: &ConnectionHandle, event: ClientEvent) -> Result<(), ServerError> {
        match event {
            ClientEvent::Login(req) => {
                self.ensure_user(&req.user_id).await?;
                self.sessions.register(req.user_id.clone(), conn.clone()).await;
                reply(conn, ServerEvent::Login(Reply::Ok(req.user_id)));
            }

            ClientEvent::Match(req) => {
                let outcome = self.matcher.match_users(&req.user_id, &req.mate_id).await?;
                reply(conn, ServerEvent::Match(Reply::Ok(outcome.mate.projection())));

                let event = ServerEvent::Match(Reply::Ok(outcome.user.projection()));
                if !self.dispatcher.deliver_to_user(&req.mate_id, &event).await {
                    let push = payload::match_notification(&outcome.user.name);
                    self.pushes.to_user(&outcome.mate, push, PushKind::Visible);
                }
            }

            ClientEvent::Unmatch(req) => {
                let outcome = self.matcher.unmatch(&req.user_id, &req.mate_id).await?;
                let event = ServerEvent::Unmatch(Reply::Ok(UnmatchPayload {
                    user_id: req.user_id.clone(),
                    mate_id: req.mate_id.clone(),
                }));
                reply(conn, event.clone());

                // Nothing changed for the other side.
                if !outcome.removed {
                    return Ok(());
                }
                if !self.dispatcher.deliver_to_user(&req.mate_id, &event).await {
                    let push = payload::unmatch_notification(&req.name, &req.user_id, &req.user_id);
                    self.pushes.to_ids(vec![req.mate_id], push, PushKind::Visible);
                }
            }

            ClientEvent::SendTextEnd => self.complete_transfer(conn, FrameType::TextChunk).await?,
            ClientEvent::SendImgEnd => self.complete_transfer(conn, FrameType::ImageChunk).await?,

            ClientEvent::Comment(req) => {
                let (item, comment) = self
                    .inbox
                    .comment(req.inbox_id, &req.sender, &req.message)
                    .await?;
                let event = ServerEvent::Comment(Reply::Ok(CommentPayload {
                    inbox_item_id: item.id,
                    comment,
                }));
                reply(conn, event.clone());

                let report = self
                    .dispatcher
                    .deliver_to_followers(&item.original_followers, &event, &req.sender)
                    .await;
                let push = payload::comment_notification(&req.name, item.id);
                self.pushes.to_ids(report.offline, push, PushKind::Visible);
            }

            ClientEvent::MateRequestSend(req) => {
                let outcome = self.matcher.send_mate_request(&req.sender, &req.receiver).await?;
                let event = ServerEvent::MateRequestSend(Reply::Ok(MateRequestPayload {
                    sender: req.sender.clone(),
                    receiver: req.receiver.clone(),
                    profile: Some(outcome.issuer.projection()),
                }));
                reply(conn, event.clone());

                if !self.dispatcher.deliver_to_user(&req.receiver, &event).await {
                    let push = payload::mate_request_notification(&outcome.issuer.name, &req.sender);
                    self.pushes.to_user(&outcome.counterpart, push, PushKind::Visible);
                }
            }

            ClientEvent::MateRequestCancel(req) => {
                let outcome = self
                    .matcher
                    .cancel_mate_request(&req.sender, &req.receiver)
                    .await?;
                let event = ServerEvent::MateRequestCancel(Reply::Ok(request_payload(&req)));
                self.sync_request(conn, event, "cancel", &req, &outcome.counterpart)
                    .await;
            }

            ClientEvent::MateRequestRefuse(req) => {
                let outcome = self
                    .matcher
                    .refuse_mate_request(&req.sender, &req.receiver)
                    .await?;
                let event = ServerEvent::MateRequestRefuse(Reply::Ok(request_payload(&req)));
                self.sync_request(conn, event, "refuse", &req, &outcome.counterpart)
                    .await;
            }

            ClientEvent::InboxRemove(req) => {
                let removal = self.inbox.remove_from_inbox(req.inbox_id, &req.user_id).await?;
                reply(
                    conn,
                    ServerEvent::InboxRemove(Reply::Ok(InboxRemovedPayload {
                        inbox_id: req.inbox_id,
                        deleted: removal.deleted,
                    })),
                );
            }

            ClientEvent::InboxSeen(req) => {
                let item = self.inbox.mark_seen(req.inbox_id, &req.user_id).await?;
                let event = ServerEvent::InboxSeen(Reply::Ok(InboxSeenPayload {
                    inbox_id: req.inbox_id,
                    user_id: req.user_id.clone(),
                }));
                reply(conn, event.clone());
                // Read receipt for the author, live only.
                if item.sender != req.user_id {
                    self.dispatcher.deliver_to_user(&item.sender, &event).await;
                }
            }

            ClientEvent::SubscriptionRegister(req) => {
                let fingerprint = req.subscription.fingerprint.clone();
                self.store
                    .update_user(
                        &req.user_id,
                        vec![UserUpdate::UpsertSubscription(req.subscription)],
                    )
                    .await?;
                reply(conn, subscription_reply(fingerprint));
            }

            ClientEvent::SubscriptionUnregister(req) => {
                self.store
                    .update_user(
                        &req.user_id,
                        vec![UserUpdate::RemoveSubscription {
                            fingerprint: req.fingerprint.clone(),
                        }],
                    )
                    .await?;
                reply(conn, subscription_reply(req.fingerprint));
            }

            ClientEvent::SubscriptionLoggedIn(req) => {
                self.store
                    .update_user(
                        &req.user_id,
                        vec![UserUpdate::SetSubscriptionLoggedIn {
                            fingerprint: req.fingerprint.clone(),
                            logged_in: req.logged_in,
                        }],
                    )
                    .await?;
                reply(conn, subscription_reply(req.fingerprint));
            }

            ClientEvent::ProfileRename(req) => {
                let outcome = self.matcher.rename(&req.user_id, &req.name).await?;
                self.broadcast_profile(conn, &outcome.user, &outcome.refreshed)
                    .await;
            }

            ClientEvent::ProfileAvatar(req) => {
                let outcome = self.matcher.change_avatar(&req.user_id, &req.img).await?;
                self.broadcast_profile(conn, &outcome.user, &outcome.refreshed)
                    .await;
            }
        }
        Ok(())
    }

    /// Load the user, creating a blank record on first login.
    async fn ensure_user(&self, user_id: &UserId) -> Result<User, ServerError> {
        if let Some(user) = self.store.find_user(user_id).await? {
            return Ok(user);
        }
        match self
            .store
            .create_user(User::new(user_id.clone(), DEFAULT_USER_NAME, ""))
            .await
        {
            Ok(user) => Ok(user),
            // Lost a race with another device of the same user.
            Err(e) => self.store.find_user(user_id).await?.ok_or(e),
        }
    }

    async fn complete_transfer(
        &self,
        conn: &ConnectionHandle,
        stream: FrameType,
    ) -> Result<(), ServerError> {
        let Some(send) = self.transfers.complete(conn.id(), stream).await? else {
            return Ok(());
        };

        let sender_name = send.envelope.name.clone();
        let item = self.inbox.store_message(send).await?;
        let event = ServerEvent::Send(Reply::Ok(item.clone()));
        reply(conn, event.clone());

        let report = self
            .dispatcher
            .deliver_to_followers(&item.followers, &event, &item.sender)
            .await;
        let push = payload::drawing_notification(&item.sender, &sender_name, &item.image, item.id);
        self.pushes.to_ids(report.offline, push, PushKind::Dual);
        Ok(())
    }

    async fn sync_request(
        &self,
        conn: &ConnectionHandle,
        event: ServerEvent,
        action: &str,
        req: &MateRequest,
        counterpart: &User,
    ) {
        reply(conn, event.clone());
        if !self.dispatcher.deliver_to_user(&req.receiver, &event).await {
            let push = payload::mate_request_update(action, &req.sender, &req.receiver);
            self.pushes.to_user(counterpart, push, PushKind::Silent);
        }
    }

    async fn broadcast_profile(&self, conn: &ConnectionHandle, user: &User, mates: &[UserId]) {
        let event = ServerEvent::Profile(Reply::Ok(user.projection()));
        reply(conn, event.clone());
        self.dispatcher
            .deliver_to_followers(mates, &event, &user.id)
            .await;
    }
}

fn reply(conn: &ConnectionHandle, event: ServerEvent) {
    if !conn.emit(event) {
        debug!(connection = %conn.id(), "Reply dropped, connection closed");
    }
}

/// Answer a frame that could not be decoded at all.
fn reject_frame(conn: &ConnectionHandle, e: ProtocolError) {
    let err = ServerError::from(e);
    debug!(connection = %conn.id(), error = %err, "Malformed frame");
    reply(
        conn,
        ServerEvent::Error(ErrorBody {
            error: err.client_message(),
        }),
    );
}

fn request_payload(req: &MateRequest) -> MateRequestPayload {
    MateRequestPayload {
        sender: req.sender.clone(),
        receiver: req.receiver.clone(),
        profile: None,
    }
}

fn subscription_reply(fingerprint: String) -> ServerEvent {
    ServerEvent::Subscription(Reply::Ok(SubscriptionPayload { fingerprint }))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::blob_store::BlobStore;
    use crate::notify::testing::RecordingTransport;
    use crate::persistence::SqlitePersistence;
    use crate::session::ConnectionHandle;
    use sketchmate_shared::protocol::{
        AvatarRequest, CommentRequest, InboxRequest, LoggedInRequest, LoginRequest, MatchRequest,
        RenameRequest, SubscribeRequest, UnmatchRequest, UnsubscribeRequest,
    };
    use sketchmate_shared::{InboxId, InboxItem, NotificationSubscription, Platform};
    use sketchmate_store::Database;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    type Device = (ConnectionHandle, UnboundedReceiver<ServerEvent>);

    struct Harness {
        gateway: Gateway,
        store: Arc<dyn Persistence>,
        pushes: Arc<RecordingTransport>,
        _dir: TempDir,
    }

    async fn harness() -> Harness {
        harness_with(RecordingTransport::default()).await
    }

    async fn harness_with(transport: RecordingTransport) -> Harness {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            silent_push_delay: Duration::from_millis(10),
            ..ServerConfig::default()
        };
        let blobs = BlobStore::new(dir.path().to_path_buf(), config.max_blob_size, "http://t")
            .await
            .unwrap();
        let store: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::new(Database::open_in_memory().unwrap()));
        let pushes = Arc::new(transport);
        Harness {
            gateway: Gateway::new(&config, store.clone(), Arc::new(blobs), pushes.clone()),
            store,
            pushes,
            _dir: dir,
        }
    }

    fn id(s: &str) -> UserId {
        UserId::from(s)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn subscription(token: &str) -> NotificationSubscription {
        NotificationSubscription {
            token: token.into(),
            platform: Platform::Android,
            fingerprint: format!("fp-{token}"),
            model: "Pixel".into(),
            os: "14".into(),
            logged_in: true,
        }
    }

    async fn login(h: &Harness, user: &str) -> Device {
        let (conn, mut rx) = ConnectionHandle::channel();
        h.gateway
            .handle_event(&conn, ClientEvent::Login(LoginRequest { user_id: id(user) }))
            .await;
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::Login(Reply::Ok(id(user))));
        (conn, rx)
    }

    async fn subscribe(h: &Harness, user: &str, token: &str) {
        h.store
            .update_user(&id(user), vec![UserUpdate::UpsertSubscription(subscription(token))])
            .await
            .unwrap();
    }

    /// A known user with one live subscription and no open connection.
    async fn offline(h: &Harness, user: &str, token: &str) {
        let (conn, _rx) = login(h, user).await;
        h.gateway.disconnect(conn.id()).await;
        subscribe(h, user, token).await;
    }

    async fn send_event(h: &Harness, device: &Device, event: ClientEvent) {
        h.gateway.handle_event(&device.0, event).await;
    }

    async fn drawing(h: &Harness, sender: &str, followers: &[&str]) -> InboxItem {
        let followers: Vec<UserId> = followers.iter().map(|f| id(f)).collect();
        h.store
            .create_inbox_item(InboxItem {
                id: InboxId::new(),
                sender: id(sender),
                drawing: "http://t/blob/drawing".into(),
                image: "http://t/blob/image".into(),
                thumbnail: "http://t/blob/thumb".into(),
                aspect_ratio: 1.0,
                followers: followers.clone(),
                original_followers: followers,
                seen_by: vec![id(sender)],
                comments_seen_by: Vec::new(),
                comments: Vec::new(),
                date: chrono::Utc::now(),
            })
            .await
            .unwrap()
    }

    fn comment(item: &InboxItem, sender: &str) -> ClientEvent {
        ClientEvent::Comment(CommentRequest {
            inbox_id: item.id,
            sender: id(sender),
            name: sender.to_uppercase(),
            message: "nice".into(),
        })
    }

    fn mate_request(sender: &str, receiver: &str) -> MateRequest {
        MateRequest {
            sender: id(sender),
            receiver: id(receiver),
        }
    }

    fn unmatch(user: &str, mate: &str) -> ClientEvent {
        ClientEvent::Unmatch(UnmatchRequest {
            user_id: id(user),
            mate_id: id(mate),
            name: user.to_uppercase(),
        })
    }

    #[tokio::test]
    async fn login_creates_user_and_registers_session() {
        let h = harness().await;
        let _a = login(&h, "a").await;
        let user = h.store.get_user(&id("a")).await.unwrap();
        assert_eq!(user.name, DEFAULT_USER_NAME);
        assert_eq!(h.gateway.sessions().online_users().await, 1);
    }

    #[tokio::test]
    async fn self_match_is_reported_to_sender() {
        let h = harness().await;
        let mut a = login(&h, "a").await;
        send_event(
            &h,
            &a,
            ClientEvent::Match(MatchRequest {
                user_id: id("a"),
                mate_id: id("a"),
            }),
        )
        .await;
        assert_eq!(
            a.1.try_recv().unwrap(),
            ServerEvent::failure("match", "Cannot match to oneself")
        );
    }

    #[tokio::test]
    async fn unmatch_push_goes_to_offline_mate() {
        let h = harness().await;
        let mut a = login(&h, "a").await;
        let (b_conn, _b_rx) = login(&h, "b").await;
        send_event(
            &h,
            &a,
            ClientEvent::Match(MatchRequest {
                user_id: id("a"),
                mate_id: id("b"),
            }),
        )
        .await;
        h.gateway.disconnect(b_conn.id()).await;
        subscribe(&h, "b", "tok-b").await;
        drain(&mut a.1);

        send_event(&h, &a, unmatch("a", "b")).await;
        h.gateway.flush_pushes().await;

        assert!(matches!(
            a.1.try_recv().unwrap(),
            ServerEvent::Unmatch(Reply::Ok(_))
        ));
        let sent = h.pushes.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "tok-b");
        assert_eq!(sent[0].1.kind(), Some("unmatch"));
    }

    #[tokio::test]
    async fn unmatch_without_relation_notifies_nobody() {
        let h = harness().await;
        let mut a = login(&h, "a").await;
        let mut b = login(&h, "b").await;
        subscribe(&h, "b", "tok-b").await;

        send_event(&h, &a, unmatch("a", "b")).await;
        h.gateway.disconnect(b.0.id()).await;
        send_event(&h, &a, unmatch("a", "b")).await;
        h.gateway.flush_pushes().await;

        assert_eq!(drain(&mut a.1).len(), 2, "caller still gets both replies");
        assert!(drain(&mut b.1).is_empty());
        assert!(h.pushes.sent().is_empty());
    }

    #[tokio::test]
    async fn garbage_frames_yield_error_events() {
        let h = harness().await;
        let (conn, mut rx) = ConnectionHandle::channel();
        h.gateway.handle_text(&conn, "{not json").await;
        h.gateway.handle_binary(&conn, &[]).await;
        h.gateway.handle_binary(&conn, &[0x09, 1, 2]).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        for event in events {
            match event {
                ServerEvent::Error(body) => assert!(body.error.starts_with("Protocol error")),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn disconnect_discards_transfer_and_session() {
        let h = harness().await;
        let (conn, _rx) = login(&h, "a").await;
        h.gateway.handle_binary(&conn, &[0x01, 7, 7, 7]).await;
        assert_eq!(h.gateway.transfers().in_flight().await, 1);

        h.gateway.disconnect(conn.id()).await;
        assert_eq!(h.gateway.transfers().in_flight().await, 0);
        assert!(h.gateway.sessions().live_connections(&id("a")).await.is_empty());
    }

    #[tokio::test]
    async fn slow_push_provider_does_not_hold_the_connection() {
        let h = harness_with(RecordingTransport {
            latency: Duration::from_secs(10),
            ..Default::default()
        })
        .await;
        let mut a = login(&h, "a").await;
        for (user, token) in [("b", "tok-b"), ("c", "tok-c"), ("d", "tok-d")] {
            offline(&h, user, token).await;
        }
        let item = drawing(&h, "a", &["a", "b", "c", "d"]).await;

        tokio::time::timeout(Duration::from_secs(2), send_event(&h, &a, comment(&item, "a")))
            .await
            .expect("event handling must not wait for the push provider");

        assert!(matches!(
            a.1.try_recv().unwrap(),
            ServerEvent::Comment(Reply::Ok(_))
        ));
        assert_eq!(h.gateway.pending_pushes(), 1);
        assert!(h.pushes.sent().is_empty());
    }

    #[tokio::test]
    async fn offline_followers_are_pushed_concurrently() {
        let h = harness_with(RecordingTransport {
            latency: Duration::from_millis(400),
            ..Default::default()
        })
        .await;
        let a = login(&h, "a").await;
        for (user, token) in [("b", "tok-b"), ("c", "tok-c"), ("d", "tok-d")] {
            offline(&h, user, token).await;
        }
        let item = drawing(&h, "a", &["a", "b", "c", "d"]).await;

        let started = Instant::now();
        send_event(&h, &a, comment(&item, "a")).await;
        h.gateway.flush_pushes().await;

        assert!(started.elapsed() < Duration::from_millis(1_000));
        let mut tokens: Vec<_> = h.pushes.sent().into_iter().map(|(t, _)| t).collect();
        tokens.sort();
        assert_eq!(tokens, vec!["tok-b", "tok-c", "tok-d"]);
        assert_eq!(h.gateway.pending_pushes(), 0);
    }

    #[tokio::test]
    async fn mate_request_reaches_receiver_live_or_by_push() {
        let h = harness().await;
        let mut a = login(&h, "a").await;
        let mut b = login(&h, "b").await;
        offline(&h, "c", "tok-c").await;

        send_event(&h, &a, ClientEvent::MateRequestSend(mate_request("a", "b"))).await;
        match b.1.try_recv().unwrap() {
            ServerEvent::MateRequestSend(Reply::Ok(payload)) => {
                assert_eq!(payload.sender, id("a"));
                assert_eq!(payload.profile.unwrap().id, id("a"));
            }
            other => panic!("unexpected {other:?}"),
        }

        send_event(&h, &a, ClientEvent::MateRequestSend(mate_request("a", "c"))).await;
        h.gateway.flush_pushes().await;

        assert_eq!(drain(&mut a.1).len(), 2);
        let sent = h.pushes.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "tok-c");
        assert_eq!(sent[0].1.kind(), Some("friend_request"));
        assert!(!sent[0].1.is_silent());
        assert_eq!(sent[0].1.data["sender"], "a");
    }

    #[tokio::test]
    async fn cancelled_request_syncs_offline_receiver_silently() {
        let h = harness().await;
        let a = login(&h, "a").await;
        offline(&h, "b", "tok-b").await;
        send_event(&h, &a, ClientEvent::MateRequestSend(mate_request("a", "b"))).await;
        h.gateway.flush_pushes().await;

        send_event(&h, &a, ClientEvent::MateRequestCancel(mate_request("a", "b"))).await;
        h.gateway.flush_pushes().await;

        let sent = h.pushes.sent();
        assert_eq!(sent.len(), 2);
        let update = &sent[1];
        assert_eq!(update.0, "tok-b");
        assert!(update.1.is_silent());
        assert_eq!(update.1.kind(), Some("friend_request_update"));
        assert_eq!(update.1.data["action"], "cancel");
        assert!(h
            .store
            .get_user(&id("b"))
            .await
            .unwrap()
            .mate_requests_received
            .is_empty());
    }

    #[tokio::test]
    async fn refusal_is_routed_to_original_requester() {
        let h = harness().await;
        let mut a = login(&h, "a").await;
        let b = login(&h, "b").await;
        subscribe(&h, "a", "tok-a").await;

        send_event(&h, &a, ClientEvent::MateRequestSend(mate_request("a", "b"))).await;
        drain(&mut a.1);

        // Online requester: live state sync.
        send_event(&h, &b, ClientEvent::MateRequestRefuse(mate_request("b", "a"))).await;
        match a.1.try_recv().unwrap() {
            ServerEvent::MateRequestRefuse(Reply::Ok(payload)) => {
                assert_eq!(payload.sender, id("b"));
                assert_eq!(payload.receiver, id("a"));
            }
            other => panic!("unexpected {other:?}"),
        }

        // Offline requester: silent push to its devices.
        send_event(&h, &a, ClientEvent::MateRequestSend(mate_request("a", "b"))).await;
        h.gateway.disconnect(a.0.id()).await;
        send_event(&h, &b, ClientEvent::MateRequestRefuse(mate_request("b", "a"))).await;
        h.gateway.flush_pushes().await;

        let sent = h.pushes.sent();
        let refusal = sent.last().unwrap();
        assert_eq!(refusal.0, "tok-a");
        assert!(refusal.1.is_silent());
        assert_eq!(refusal.1.data["action"], "refuse");
        assert!(h
            .store
            .get_user(&id("a"))
            .await
            .unwrap()
            .mate_requests_sent
            .is_empty());
    }

    #[tokio::test]
    async fn profile_changes_reach_online_mates_only() {
        let h = harness().await;
        let mut a = login(&h, "a").await;
        let mut b = login(&h, "b").await;
        let mut c = login(&h, "c").await;
        send_event(
            &h,
            &a,
            ClientEvent::Match(MatchRequest {
                user_id: id("a"),
                mate_id: id("b"),
            }),
        )
        .await;
        drain(&mut a.1);
        drain(&mut b.1);

        send_event(
            &h,
            &a,
            ClientEvent::ProfileRename(RenameRequest {
                user_id: id("a"),
                name: "Ada".into(),
            }),
        )
        .await;
        send_event(
            &h,
            &a,
            ClientEvent::ProfileAvatar(AvatarRequest {
                user_id: id("a"),
                img: "http://t/blob/avatar".into(),
            }),
        )
        .await;

        let echoes = drain(&mut a.1);
        assert_eq!(echoes.len(), 2);
        let received = drain(&mut b.1);
        assert_eq!(received, echoes);
        match &received[1] {
            ServerEvent::Profile(Reply::Ok(mate)) => {
                assert_eq!(mate.name, "Ada");
                assert_eq!(mate.img, "http://t/blob/avatar");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(drain(&mut c.1).is_empty());

        let b_rec = h.store.get_user(&id("b")).await.unwrap();
        assert_eq!(b_rec.mates[0].name, "Ada");
        assert!(h.pushes.sent().is_empty());
    }

    #[tokio::test]
    async fn subscription_events_maintain_devices() {
        let h = harness().await;
        let mut a = login(&h, "a").await;

        send_event(
            &h,
            &a,
            ClientEvent::SubscriptionRegister(SubscribeRequest {
                user_id: id("a"),
                subscription: subscription("tok-1"),
            }),
        )
        .await;
        send_event(
            &h,
            &a,
            ClientEvent::SubscriptionRegister(SubscribeRequest {
                user_id: id("a"),
                subscription: subscription("tok-2"),
            }),
        )
        .await;
        send_event(
            &h,
            &a,
            ClientEvent::SubscriptionLoggedIn(LoggedInRequest {
                user_id: id("a"),
                fingerprint: "fp-tok-1".into(),
                logged_in: false,
            }),
        )
        .await;

        let user = h.store.get_user(&id("a")).await.unwrap();
        assert_eq!(user.subscriptions.len(), 2);
        let live: Vec<_> = user.live_subscriptions().into_iter().map(|s| s.token).collect();
        assert_eq!(live, vec!["tok-2"]);

        send_event(
            &h,
            &a,
            ClientEvent::SubscriptionUnregister(UnsubscribeRequest {
                user_id: id("a"),
                fingerprint: "fp-tok-2".into(),
            }),
        )
        .await;
        let user = h.store.get_user(&id("a")).await.unwrap();
        assert_eq!(user.subscriptions.len(), 1);
        assert_eq!(user.subscriptions[0].fingerprint, "fp-tok-1");

        let replies = drain(&mut a.1);
        assert_eq!(replies.len(), 4);
        assert_eq!(replies[3], subscription_reply("fp-tok-2".into()));
    }

    #[tokio::test]
    async fn subscription_for_unknown_user_is_an_error() {
        let h = harness().await;
        let mut a = login(&h, "a").await;
        send_event(
            &h,
            &a,
            ClientEvent::SubscriptionUnregister(UnsubscribeRequest {
                user_id: id("ghost"),
                fingerprint: "fp".into(),
            }),
        )
        .await;
        match a.1.try_recv().unwrap() {
            ServerEvent::Subscription(reply) => {
                assert_eq!(reply.error_message(), Some("User not found: ghost"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_receipt_goes_to_author_only() {
        let h = harness().await;
        let mut a = login(&h, "a").await;
        let mut b = login(&h, "b").await;
        let mut c = login(&h, "c").await;
        let item = drawing(&h, "a", &["a", "b", "c"]).await;

        send_event(
            &h,
            &b,
            ClientEvent::InboxSeen(InboxRequest {
                inbox_id: item.id,
                user_id: id("b"),
            }),
        )
        .await;

        let receipt = ServerEvent::InboxSeen(Reply::Ok(InboxSeenPayload {
            inbox_id: item.id,
            user_id: id("b"),
        }));
        assert_eq!(drain(&mut b.1), vec![receipt.clone()]);
        assert_eq!(drain(&mut a.1), vec![receipt]);
        assert!(drain(&mut c.1).is_empty());

        // The author marking its own item sends nothing extra.
        send_event(
            &h,
            &a,
            ClientEvent::InboxSeen(InboxRequest {
                inbox_id: item.id,
                user_id: id("a"),
            }),
        )
        .await;
        assert_eq!(drain(&mut a.1).len(), 1);

        let stored = h.store.find_inbox_item(item.id).await.unwrap().unwrap();
        assert!(stored.seen_by.contains(&id("b")));
        assert!(h.pushes.sent().is_empty());
    }
}
