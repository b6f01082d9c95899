//! Connection registry and routing rules for the relay.
//!
//! Controllers fan in, robots fan out. Every connection is represented by the
//! sending half of its outbound slot; a robot whose slot is gone is dropped
//! from the set on the next broadcast.
//!
//! The slot holds one message. A connection whose writer falls behind only
//! ever sees the newest command, never a backlog of stale ones.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::protocol::{PING, PONG};

pub type ConnectionId = u64;

pub const CONTROLLER_PATH: &str = "/ws/controller";
pub const ROBOT_PATH: &str = "/ws/robot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Controller,
    Robot,
}

impl Role {
    pub fn from_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            CONTROLLER_PATH => Some(Self::Controller),
            ROBOT_PATH => Some(Self::Robot),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Robot => "robot",
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Self::Controller => CONTROLLER_PATH,
            Self::Robot => ROBOT_PATH,
        }
    }
}

/// What the broker did with one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Pong,
    Broadcast { delivered: usize, dropped: usize },
    /// Robot-originated text; accepted and not forwarded.
    Telemetry,
    UnknownSender,
}

pub type Outbound = watch::Sender<Option<String>>;
pub type OutboundReceiver = watch::Receiver<Option<String>>;

/// Single-slot outbound queue for one connection. Writing replaces whatever
/// the writer has not picked up yet.
pub fn outbound() -> (Outbound, OutboundReceiver) {
    watch::channel(None)
}

/// Wait for the next message in the slot. `None` once the sender is gone.
pub async fn next_outbound(rx: &mut OutboundReceiver) -> Option<String> {
    loop {
        rx.changed().await.ok()?;
        if let Some(text) = rx.borrow_and_update().clone() {
            return Some(text);
        }
    }
}

#[derive(Debug, Default)]
pub struct RelayBroker {
    controllers: HashMap<ConnectionId, Outbound>,
    robots: HashMap<ConnectionId, Outbound>,
    next_id: ConnectionId,
}

pub type SharedBroker = Arc<Mutex<RelayBroker>>;

/// Lock a shared broker, recovering the registry if a holder panicked.
pub fn lock(broker: &SharedBroker) -> MutexGuard<'_, RelayBroker> {
    match broker.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl RelayBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedBroker {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Register a connection and hand back its identity.
    pub fn add(&mut self, role: Role, outbound: Outbound) -> ConnectionId {
        self.next_id += 1;
        let id = self.next_id;
        self.set_for(role).insert(id, outbound);
        info!(
            "{} {id} connected (controllers={}, robots={})",
            role.label(),
            self.controllers.len(),
            self.robots.len()
        );
        self.publish_gauges();
        id
    }

    /// Remove `id` from whichever set holds it. Removing twice is harmless.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Role> {
        let role = if self.controllers.remove(&id).is_some() {
            Role::Controller
        } else if self.robots.remove(&id).is_some() {
            Role::Robot
        } else {
            return None;
        };
        info!(
            "{} {id} disconnected (controllers={}, robots={})",
            role.label(),
            self.controllers.len(),
            self.robots.len()
        );
        self.publish_gauges();
        Some(role)
    }

    pub fn role_of(&self, id: ConnectionId) -> Option<Role> {
        if self.controllers.contains_key(&id) {
            Some(Role::Controller)
        } else if self.robots.contains_key(&id) {
            Some(Role::Robot)
        } else {
            None
        }
    }

    pub fn handle_message(&mut self, from: ConnectionId, text: &str) -> Dispatch {
        match self.role_of(from) {
            Some(Role::Controller) if text == PING => {
                metrics::counter!("relay_pings_total").increment(1);
                let unreachable = self
                    .controllers
                    .get(&from)
                    .is_some_and(|sender| sender.send(Some(PONG.to_owned())).is_err());
                if unreachable {
                    self.remove(from);
                }
                Dispatch::Pong
            }
            Some(Role::Controller) => {
                let (delivered, dropped) = self.broadcast_to_robots(text);
                debug!("controller {from} -> {delivered} robot(s): {text}");
                Dispatch::Broadcast { delivered, dropped }
            }
            Some(Role::Robot) => {
                debug!("robot {from} telemetry: {text}");
                Dispatch::Telemetry
            }
            None => Dispatch::UnknownSender,
        }
    }

    /// Deliver `text` verbatim to every robot, dropping any that can no longer receive.
    pub fn broadcast_to_robots(&mut self, text: &str) -> (usize, usize) {
        if self.robots.is_empty() {
            warn!("no robots connected to receive command");
            return (0, 0);
        }

        let mut failed = Vec::new();
        for (id, sender) in &self.robots {
            if sender.send(Some(text.to_owned())).is_err() {
                failed.push(*id);
            }
        }
        for id in &failed {
            warn!("robot {id} unreachable, dropping");
            self.remove(*id);
        }

        let delivered = self.robots.len();
        metrics::counter!("relay_messages_broadcast_total").increment(1);
        if !failed.is_empty() {
            metrics::counter!("relay_robot_drops_total").increment(failed.len() as u64);
        }
        (delivered, failed.len())
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    pub fn robot_count(&self) -> usize {
        self.robots.len()
    }

    fn set_for(&mut self, role: Role) -> &mut HashMap<ConnectionId, Outbound> {
        match role {
            Role::Controller => &mut self.controllers,
            Role::Robot => &mut self.robots,
        }
    }

    fn publish_gauges(&self) {
        metrics::gauge!("relay_connections", "role" => "controller").set(self.controllers.len() as f64);
        metrics::gauge!("relay_connections", "role" => "robot").set(self.robots.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(broker: &mut RelayBroker, role: Role) -> (ConnectionId, OutboundReceiver) {
        let (tx, rx) = outbound();
        (broker.add(role, tx), rx)
    }

    /// Newest unread message, if any.
    fn take(rx: &mut OutboundReceiver) -> Option<String> {
        if rx.has_changed().unwrap_or(false) {
            rx.borrow_and_update().clone()
        } else {
            None
        }
    }

    #[test]
    fn controller_messages_reach_every_robot_and_no_controller() {
        let mut broker = RelayBroker::new();
        let (c1, mut c1_rx) = join(&mut broker, Role::Controller);
        let (_c2, mut c2_rx) = join(&mut broker, Role::Controller);
        let (_r1, mut r1_rx) = join(&mut broker, Role::Robot);
        let (_r2, mut r2_rx) = join(&mut broker, Role::Robot);

        let dispatch = broker.handle_message(c1, "V:0.500,-0.250");
        assert_eq!(dispatch, Dispatch::Broadcast { delivered: 2, dropped: 0 });
        assert_eq!(take(&mut r1_rx).as_deref(), Some("V:0.500,-0.250"));
        assert_eq!(take(&mut r2_rx).as_deref(), Some("V:0.500,-0.250"));
        assert_eq!(take(&mut c1_rx), None);
        assert_eq!(take(&mut c2_rx), None);
    }

    #[test]
    fn ping_gets_one_pong_and_is_not_broadcast() {
        let mut broker = RelayBroker::new();
        let (c1, mut c1_rx) = join(&mut broker, Role::Controller);
        let (_r1, mut r1_rx) = join(&mut broker, Role::Robot);

        assert_eq!(broker.handle_message(c1, "ping"), Dispatch::Pong);
        assert_eq!(take(&mut c1_rx).as_deref(), Some("pong"));
        assert_eq!(take(&mut c1_rx), None);
        assert_eq!(take(&mut r1_rx), None);
    }

    #[test]
    fn unreachable_robots_are_dropped() {
        let mut broker = RelayBroker::new();
        let (c1, _c1_rx) = join(&mut broker, Role::Controller);
        let (_r1, r1_rx) = join(&mut broker, Role::Robot);
        let (_r2, mut r2_rx) = join(&mut broker, Role::Robot);
        drop(r1_rx);

        let dispatch = broker.handle_message(c1, "V:1.000,0.000");
        assert_eq!(dispatch, Dispatch::Broadcast { delivered: 1, dropped: 1 });
        assert_eq!(broker.robot_count(), 1);
        assert_eq!(take(&mut r2_rx).as_deref(), Some("V:1.000,0.000"));
    }

    #[test]
    fn slow_robots_only_see_the_newest_command() {
        let mut broker = RelayBroker::new();
        let (c1, _c1_rx) = join(&mut broker, Role::Controller);
        let (_r1, mut r1_rx) = join(&mut broker, Role::Robot);

        for i in 0..1000 {
            broker.handle_message(c1, &format!("V:{i}.000,0.000"));
        }
        assert_eq!(broker.robot_count(), 1);
        assert_eq!(take(&mut r1_rx).as_deref(), Some("V:999.000,0.000"));
        assert_eq!(take(&mut r1_rx), None);

        broker.handle_message(c1, "V:0.000,0.000");
        assert_eq!(take(&mut r1_rx).as_deref(), Some("V:0.000,0.000"));
    }

    #[tokio::test]
    async fn writer_drains_the_slot_until_the_sender_is_gone() {
        let (tx, mut rx) = outbound();
        tx.send(Some("V:0.100,0.000".to_owned())).unwrap();
        assert_eq!(next_outbound(&mut rx).await.as_deref(), Some("V:0.100,0.000"));

        tx.send(Some("V:0.200,0.000".to_owned())).unwrap();
        drop(tx);
        assert_eq!(next_outbound(&mut rx).await.as_deref(), Some("V:0.200,0.000"));
        assert_eq!(next_outbound(&mut rx).await, None);
    }

    #[test]
    fn robot_messages_are_not_forwarded() {
        let mut broker = RelayBroker::new();
        let (_c1, mut c1_rx) = join(&mut broker, Role::Controller);
        let (r1, _r1_rx) = join(&mut broker, Role::Robot);
        let (_r2, mut r2_rx) = join(&mut broker, Role::Robot);

        assert_eq!(broker.handle_message(r1, "battery=87"), Dispatch::Telemetry);
        assert_eq!(broker.handle_message(r1, "ping"), Dispatch::Telemetry);
        assert_eq!(take(&mut c1_rx), None);
        assert_eq!(take(&mut r2_rx), None);
        assert_eq!(broker.handle_message(999, "V:0,0"), Dispatch::UnknownSender);
    }

    #[test]
    fn removal_is_idempotent() {
        let mut broker = RelayBroker::new();
        let (c1, _c1_rx) = join(&mut broker, Role::Controller);
        let (r1, _r1_rx) = join(&mut broker, Role::Robot);

        assert_eq!(broker.remove(r1), Some(Role::Robot));
        assert_eq!(broker.remove(r1), None);
        assert_eq!(broker.remove(c1), Some(Role::Controller));
        assert_eq!(broker.controller_count() + broker.robot_count(), 0);
    }

    #[test]
    fn roles_follow_request_paths() {
        assert_eq!(Role::from_path("/ws/controller"), Some(Role::Controller));
        assert_eq!(Role::from_path("/ws/robot/"), Some(Role::Robot));
        assert_eq!(Role::from_path("/ws"), None);
    }
}
