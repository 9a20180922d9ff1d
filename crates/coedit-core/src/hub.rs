//! Live presence fan-out
//!
//! Subscribers are registered per `(resource, user)` and receive
//! [`PresenceEvent`]s. Delivery is best effort: a sink that fails to accept
//! a message is dropped as if its transport disconnected, and everyone else
//! still gets the message.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::models::{HeartbeatAck, PresenceEvent, ResourceId, UserId};
use crate::presence::PresenceCache;

/// Default period of the reconciliation broadcast
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Outbound half of a subscriber's transport
///
/// `send` must not block; it either queues the event or reports the
/// connection as gone.
pub trait PresenceSink: Send + Sync {
    fn send(&self, event: &PresenceEvent) -> Result<()>;
}

impl PresenceSink for mpsc::UnboundedSender<PresenceEvent> {
    fn send(&self, event: &PresenceEvent) -> Result<()> {
        mpsc::UnboundedSender::send(self, event.clone())
            .map_err(|_| Error::ConnectionLost("subscriber channel closed".into()))
    }
}

/// Identifies one registration, so a stale transport cannot remove its
/// replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Clone)]
struct Subscriber {
    connection: ConnectionId,
    sink: Arc<dyn PresenceSink>,
}

/// Snapshot of hub occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Resources with at least one subscriber
    pub resources: usize,
    /// Live subscriber connections
    pub connections: usize,
}

/// Registry of live subscribers and presence broadcaster
pub struct PresenceHub {
    presence: PresenceCache,
    subscribers: DashMap<ResourceId, HashMap<UserId, Subscriber>>,
    next_connection: AtomicU64,
}

impl PresenceHub {
    pub fn new(presence: PresenceCache) -> Self {
        Self {
            presence,
            subscribers: DashMap::new(),
            next_connection: AtomicU64::new(1),
        }
    }

    pub const fn presence(&self) -> &PresenceCache {
        &self.presence
    }

    /// Register `sink` for `user` on `resource`
    ///
    /// The newcomer gets the current snapshot, the other subscribers get
    /// `user_joined`, and the user's activity is recorded. An existing
    /// registration of the same pair is replaced.
    pub async fn subscribe(
        &self,
        resource: &ResourceId,
        user: &UserId,
        sink: Arc<dyn PresenceSink>,
    ) -> Result<ConnectionId> {
        let snapshot = self.presence.list_active(resource).await?;

        let connection = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let replaced = self
            .subscribers
            .entry(*resource)
            .or_default()
            .insert(
                user.clone(),
                Subscriber {
                    connection,
                    sink: sink.clone(),
                },
            )
            .is_some();
        if replaced {
            tracing::debug!(resource = %resource, user = %user, %connection, "Replaced existing subscription");
        }

        let welcome = PresenceEvent::PresenceUpdate {
            resource_id: *resource,
            active_users: snapshot,
        };
        if let Err(e) = sink.send(&welcome) {
            self.deregister(resource, user, Some(connection));
            return Err(e);
        }

        let joined = PresenceEvent::UserJoined {
            resource_id: *resource,
            user_id: user.clone(),
        };
        self.deliver(resource, joined, Some(user)).await;

        if let Err(e) = self.presence.record_activity(resource, user).await {
            tracing::warn!(resource = %resource, user = %user, error = %e, "Could not record activity on subscribe");
        }

        tracing::info!(resource = %resource, user = %user, %connection, "Subscribed");
        Ok(connection)
    }

    /// Explicit leave: deregister, mark inactive, broadcast `user_left`
    ///
    /// Returns whether the user had a live subscription. Peers are told about
    /// the leave even when presence could not be cleared; that error is
    /// returned afterwards.
    pub async fn unsubscribe(&self, resource: &ResourceId, user: &UserId) -> Result<bool> {
        let removed = self.deregister(resource, user, None);
        let released = self.presence.mark_inactive(resource, user).await;
        if let Err(e) = &released {
            tracing::warn!(resource = %resource, user = %user, error = %e, "Could not mark unsubscribed user inactive");
        }
        if removed {
            self.announce_left(resource, user).await;
            tracing::info!(resource = %resource, user = %user, "Unsubscribed");
        }
        released.map(|()| removed)
    }

    /// Transport-level drop of `connection`
    ///
    /// Ignored when the pair has since re-subscribed on a newer connection.
    pub async fn disconnect(&self, resource: &ResourceId, user: &UserId, connection: ConnectionId) {
        if !self.deregister(resource, user, Some(connection)) {
            return;
        }
        tracing::info!(resource = %resource, user = %user, %connection, "Connection lost");
        if let Err(e) = self.presence.mark_inactive(resource, user).await {
            tracing::warn!(resource = %resource, user = %user, error = %e, "Could not mark disconnected user inactive");
        }
        self.announce_left(resource, user).await;
    }

    /// Client liveness signal; refreshes activity without broadcasting
    pub async fn heartbeat(&self, resource: &ResourceId, user: &UserId) -> Result<HeartbeatAck> {
        let at = self.presence.record_activity(resource, user).await?;
        Ok(HeartbeatAck {
            resource_id: *resource,
            user_id: user.clone(),
            at,
        })
    }

    /// Tell viewers that an update was accepted
    pub async fn notify_updated(
        &self,
        resource: &ResourceId,
        user: &UserId,
        version: u64,
        fields: Vec<String>,
    ) {
        let event = PresenceEvent::ResourceUpdated {
            resource_id: *resource,
            user_id: user.clone(),
            version,
            fields,
        };
        self.deliver(resource, event, Some(user)).await;
    }

    /// Push a fresh snapshot to every subscribed resource
    ///
    /// Returns the number of resources broadcast to.
    pub async fn reconcile_once(&self) -> usize {
        let resources: Vec<ResourceId> = self.subscribers.iter().map(|e| *e.key()).collect();

        let mut broadcast = 0;
        for resource in resources {
            let active_users = match self.presence.list_active(&resource).await {
                Ok(users) => users,
                Err(e) => {
                    tracing::warn!(resource = %resource, error = %e, "Skipping presence reconciliation");
                    continue;
                }
            };
            let event = PresenceEvent::PresenceUpdate {
                resource_id: resource,
                active_users,
            };
            self.deliver(&resource, event, None).await;
            broadcast += 1;
        }
        broadcast
    }

    /// Run [`reconcile_once`](Self::reconcile_once) every `period` until
    /// `shutdown` is cancelled
    pub fn spawn_reconciler(
        self: &Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> ReconcilerHandle {
        let hub = Arc::clone(self);
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let resources = hub.reconcile_once().await;
                        tracing::trace!(resources, "Presence reconciliation tick");
                    }
                }
            }
            tracing::debug!("Presence reconciler stopped");
        });

        tracing::debug!(?period, "Presence reconciler started");
        ReconcilerHandle { shutdown, handle }
    }

    /// Current occupancy
    pub fn stats(&self) -> HubStats {
        let mut stats = HubStats {
            resources: 0,
            connections: 0,
        };
        for entry in &self.subscribers {
            stats.resources += 1;
            stats.connections += entry.value().len();
        }
        stats
    }

    /// Users subscribed to `resource`, sorted
    pub fn subscribers_of(&self, resource: &ResourceId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .subscribers
            .get(resource)
            .map(|subs| subs.keys().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Remove the pair, only if it is still `connection` when one is given.
    /// Drops the resource entry once it has no subscribers.
    fn deregister(
        &self,
        resource: &ResourceId,
        user: &UserId,
        connection: Option<ConnectionId>,
    ) -> bool {
        let removed = self.subscribers.get_mut(resource).is_some_and(|mut subs| {
            let matches = subs
                .get(user)
                .is_some_and(|sub| connection.is_none_or(|id| id == sub.connection));
            matches && subs.remove(user).is_some()
        });
        self.subscribers.remove_if(resource, |_, subs| subs.is_empty());
        removed
    }

    async fn announce_left(&self, resource: &ResourceId, user: &UserId) {
        let left = PresenceEvent::UserLeft {
            resource_id: *resource,
            user_id: user.clone(),
        };
        self.deliver(resource, left, None).await;
    }

    /// Send `event` to every subscriber of `resource` except `skip`
    ///
    /// Subscribers whose sink fails are removed and announced as left, which
    /// may in turn expose more dead sinks; the worklist runs until no send
    /// fails.
    async fn deliver(&self, resource: &ResourceId, event: PresenceEvent, skip: Option<&UserId>) {
        let mut pending = vec![(event, skip.cloned())];

        while let Some((event, skip)) = pending.pop() {
            for (user, connection) in self.send_all(resource, &event, skip.as_ref()) {
                if !self.deregister(resource, &user, Some(connection)) {
                    continue;
                }
                tracing::info!(resource = %resource, user = %user, %connection, "Dropping subscriber after failed send");
                if let Err(e) = self.presence.mark_inactive(resource, &user).await {
                    tracing::warn!(resource = %resource, user = %user, error = %e, "Could not mark dropped subscriber inactive");
                }
                pending.push((
                    PresenceEvent::UserLeft {
                        resource_id: *resource,
                        user_id: user,
                    },
                    None,
                ));
            }
        }
    }

    /// Returns the subscribers whose send failed
    fn send_all(
        &self,
        resource: &ResourceId,
        event: &PresenceEvent,
        skip: Option<&UserId>,
    ) -> Vec<(UserId, ConnectionId)> {
        // Clone targets out so no map guard is held while sending
        let targets: Vec<(UserId, Subscriber)> = self
            .subscribers
            .get(resource)
            .map(|subs| {
                subs.iter()
                    .filter(|(user, _)| Some(*user) != skip)
                    .map(|(user, sub)| (user.clone(), sub.clone()))
                    .collect()
            })
            .unwrap_or_default();

        targets
            .into_iter()
            .filter_map(|(user, sub)| match sub.sink.send(event) {
                Ok(()) => None,
                Err(e) => {
                    tracing::debug!(resource = %resource, user = %user, error = %e, "Presence send failed");
                    Some((user, sub.connection))
                }
            })
            .collect()
    }
}

/// Running reconciliation task
pub struct ReconcilerHandle {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Cancel the task and wait for it to finish
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Presence reconciler ended abnormally");
        }
    }

}
