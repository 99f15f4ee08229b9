//! Fan-out Dispatcher: live delivery only. Callers decide what to do about
//! the users it reports as offline.

use tracing::{debug, warn};

use sketchmate_shared::protocol::ServerEvent;
use sketchmate_shared::UserId;

use crate::session::SessionRegistry;

/// Outcome of a fan-out, partitioned by whether the user had a live device.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: Vec<UserId>,
    pub offline: Vec<UserId>,
}

#[derive(Clone)]
pub struct Dispatcher {
    sessions: SessionRegistry,
}

impl Dispatcher {
    pub fn new(sessions: SessionRegistry) -> Self {
        Self { sessions }
    }

    /// Emit to every live connection of `user_id`. False exactly when
    /// [`SessionRegistry::live_connections`] is empty, or when every listed
    /// writer exited before the emit; those connections are deregistered.
    pub async fn deliver_to_user(&self, user_id: &UserId, event: &ServerEvent) -> bool {
        let connections = self.sessions.live_connections(user_id).await;
        let mut delivered = false;
        for connection in &connections {
            if connection.emit(event.clone()) {
                delivered = true;
            } else {
                warn!(user = %user_id, connection = %connection.id(), "Emit to closed connection");
                self.sessions.deregister(connection.id()).await;
            }
        }
        debug!(user = %user_id, devices = connections.len(), delivered, "Delivered event");
        delivered
    }

    /// [`Dispatcher::deliver_to_user`] for each member of `audience` other
    /// than `exclude`. Duplicate ids are delivered once.
    pub async fn deliver_to_followers(
        &self,
        audience: &[UserId],
        event: &ServerEvent,
        exclude: &UserId,
    ) -> FanoutReport {
        let mut report = FanoutReport::default();
        for user_id in audience {
            if user_id == exclude
                || report.delivered.contains(user_id)
                || report.offline.contains(user_id)
            {
                continue;
            }
            if self.deliver_to_user(user_id, event).await {
                report.delivered.push(user_id.clone());
            } else {
                report.offline.push(user_id.clone());
            }
        }
        report
    }
}
