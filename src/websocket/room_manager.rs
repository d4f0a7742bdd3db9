use crate::types::ServerEvent;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// A connected socket and the accounts it follows.
pub struct ClientSubscription {
    /// User ids whose account events this client receives.
    pub users: HashSet<String>,
    /// Channel to send messages to the client.
    pub tx: mpsc::UnboundedSender<String>,
}

/// Routes account events to the sockets subscribed to each user.
pub struct RoomManager {
    /// Client subscriptions keyed by client ID.
    pub clients: DashMap<Uuid, ClientSubscription>,
    /// User rooms: user id -> set of client IDs.
    rooms: DashMap<String, HashSet<Uuid>>,
}

impl RoomManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new client.
    pub fn register(&self, tx: mpsc::UnboundedSender<String>) -> Uuid {
        let client_id = Uuid::new_v4();
        self.clients.insert(
            client_id,
            ClientSubscription {
                users: HashSet::new(),
                tx,
            },
        );
        client_id
    }

    /// Unregister a client and remove it from every room.
    pub fn unregister(&self, client_id: Uuid) {
        if let Some((_, subscription)) = self.clients.remove(&client_id) {
            for user in subscription.users {
                self.leave_room(&user, client_id);
            }
        }
    }

    /// Follow a user's account. Returns false if already subscribed or the
    /// client is unknown.
    pub fn subscribe(&self, client_id: Uuid, user_id: &str) -> bool {
        let Some(mut client) = self.clients.get_mut(&client_id) else {
            return false;
        };
        if !client.users.insert(user_id.to_string()) {
            return false;
        }
        drop(client);

        self.rooms
            .entry(user_id.to_string())
            .or_default()
            .insert(client_id);
        debug!("Client {} joined room {}", client_id, user_id);
        true
    }

    pub fn unsubscribe(&self, client_id: Uuid, user_id: &str) -> bool {
        let removed = self
            .clients
            .get_mut(&client_id)
            .map(|mut c| c.users.remove(user_id))
            .unwrap_or(false);
        if removed {
            self.leave_room(user_id, client_id);
        }
        removed
    }

    fn leave_room(&self, user_id: &str, client_id: Uuid) {
        let empty = match self.rooms.get_mut(user_id) {
            Some(mut room) => {
                room.remove(&client_id);
                room.is_empty()
            }
            None => false,
        };
        if empty {
            self.rooms.remove_if(user_id, |_, room| room.is_empty());
        }
    }

    /// Senders for every client following `user_id`.
    pub fn get_subscribers(&self, user_id: &str) -> Vec<mpsc::UnboundedSender<String>> {
        let client_ids: Vec<Uuid> = self
            .rooms
            .get(user_id)
            .map(|room| room.iter().copied().collect())
            .unwrap_or_default();

        client_ids
            .iter()
            .filter_map(|id| self.clients.get(id).map(|c| c.tx.clone()))
            .collect()
    }

    /// Push an event to everyone following `user_id`. Returns the number of
    /// sockets reached.
    pub fn send_to_user(&self, user_id: &str, event: &ServerEvent) -> usize {
        let Some(json) = event.encode() else {
            return 0;
        };
        self.get_subscribers(user_id)
            .into_iter()
            .filter(|tx| tx.send(json.clone()).is_ok())
            .count()
    }

    /// Push an event to one client.
    pub fn send_to_client(&self, client_id: Uuid, event: &ServerEvent) {
        if let (Some(client), Some(json)) = (self.clients.get(&client_id), event.encode()) {
            let _ = client.tx.send(json);
        }
    }

    /// Users with at least one subscribed socket.
    pub fn subscribed_users(&self) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|r| !r.is_empty())
            .map(|r| r.key().clone())
            .collect()
    }

    /// Get the number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.iter().filter(|r| !r.is_empty()).count()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self {
            clients: DashMap::new(),
            rooms: DashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_reach_only_followers() {
        let manager = RoomManager::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = manager.register(tx_a);
        let b = manager.register(tx_b);

        assert!(manager.subscribe(a, "alice"));
        assert!(!manager.subscribe(a, "alice"));
        assert!(manager.subscribe(b, "bob"));

        let event = ServerEvent::Error {
            error: "ping".to_string(),
        };
        assert_eq!(manager.send_to_user("alice", &event), 1);

        assert!(rx_a.try_recv().unwrap().contains("\"type\":\"error\""));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_unregister_empties_rooms() {
        let manager = RoomManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = manager.register(tx);
        manager.subscribe(id, "alice");
        assert_eq!(manager.subscribed_users(), vec!["alice".to_string()]);

        manager.unregister(id);
        assert!(manager.subscribed_users().is_empty());
        assert_eq!(manager.client_count(), 0);
        assert_eq!(manager.room_count(), 0);
    }
}
