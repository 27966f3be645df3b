//! Room (§4.C) and Room Registry (§4.B).
//!
//! A room is driven by a single `tokio::spawn`ed task that owns the
//! participants map, the admin reference, and the CRDT document, draining
//! a bounded `mpsc` queue of `RoomCommand`s in receive order. No other
//! task ever touches that state directly, so none of it needs a lock —
//! the queue itself is the serialisation point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::Config;
use crate::protocol::{BinaryFrame, ClientSummary, OutboundControl};
use crate::sync::CrdtDocument;

pub type ClientId = u64;

/// Frame handed to a session's write task (§4.D "outbound serialisation").
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    Binary(Vec<u8>),
    Text(String),
    Close { code: u16, reason: String },
}

impl OutboundEvent {
    pub fn control(msg: &OutboundControl) -> Self {
        OutboundEvent::Text(serde_json::to_string(msg).expect("control message always serializes"))
    }
}

/// What a join attempt claims about itself (§3 "Participant record").
#[derive(Debug, Clone)]
pub struct JoinClaim {
    pub client_id: ClientId,
    pub username: String,
    pub admin_claim: bool,
    pub outbound: mpsc::Sender<OutboundEvent>,
}

/// Result of an admission attempt (§4.C).
#[derive(Debug)]
pub enum JoinOutcome {
    Admitted { is_admin: bool, snapshot: Vec<u8> },
    Full,
    Duplicate,
}

#[derive(Debug)]
pub(crate) enum RoomCommand {
    Join {
        claim: JoinClaim,
        reply: oneshot::Sender<JoinOutcome>,
    },
    ClientJoinedNotice {
        client_id: ClientId,
        username: String,
    },
    Leave {
        client_id: ClientId,
    },
    EndRoom {
        client_id: ClientId,
    },
    Binary {
        client_id: ClientId,
        frame: BinaryFrame,
    },
}

struct Participant {
    username: String,
    outbound: mpsc::Sender<OutboundEvent>,
    #[allow(dead_code)]
    joined_at: DateTime<Utc>,
}

/// A handle callers use to submit commands to a running room's executor.
#[derive(Clone)]
pub struct RoomHandle {
    name: String,
    tx: mpsc::Sender<RoomCommand>,
    participant_count: Arc<AtomicUsize>,
}

impl RoomHandle {
    /// Spawns the room's executor task and returns a handle to it.
    ///
    /// `on_empty` is invoked by the executor once the room has no
    /// participants left, so the caller (the Registry) can remove its
    /// entry — mirroring §4.B's `release(name)`.
    pub(crate) fn spawn<F>(name: String, config: &Config, on_empty: F) -> Self
    where
        F: FnOnce(&str) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(config.room_queue_depth);
        let capacity = config.capacity;
        let max_doc_size = config.max_doc_size;
        let room_name = name.clone();
        let participant_count = Arc::new(AtomicUsize::new(0));
        let participant_count_for_task = Arc::clone(&participant_count);

        tokio::spawn(async move {
            let mut room = Room {
                name: room_name.clone(),
                capacity,
                max_doc_size,
                document: CrdtDocument::new(),
                participants: IndexMap::new(),
                admin: None,
                participant_count: participant_count_for_task,
            };
            room.run(rx).await;
            on_empty(&room_name);
        });

        Self { name, tx, participant_count }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current participant count, for diagnostics only (§4.B supplemental
    /// snapshot operation) — never consulted for admission decisions.
    pub fn participant_count(&self) -> usize {
        self.participant_count.load(Ordering::Relaxed)
    }

    /// Attempts to join this room. Suspends until the room's executor has
    /// processed the admission (the room is the serialisation point).
    pub async fn join(&self, claim: JoinClaim) -> Option<JoinOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(RoomCommand::Join { claim, reply: reply_tx }).await.ok()?;
        reply_rx.await.ok()
    }

    pub async fn client_joined_notice(&self, client_id: ClientId, username: String) {
        let _ = self
            .tx
            .send(RoomCommand::ClientJoinedNotice { client_id, username })
            .await;
    }

    pub async fn leave(&self, client_id: ClientId) {
        let _ = self.tx.send(RoomCommand::Leave { client_id }).await;
    }

    pub async fn end_room(&self, client_id: ClientId) {
        let _ = self.tx.send(RoomCommand::EndRoom { client_id }).await;
    }

    pub async fn binary(&self, client_id: ClientId, frame: BinaryFrame) {
        let _ = self.tx.send(RoomCommand::Binary { client_id, frame }).await;
    }
}

struct Room {
    name: String,
    capacity: usize,
    max_doc_size: usize,
    document: CrdtDocument,
    participants: IndexMap<ClientId, Participant>,
    admin: Option<ClientId>,
    participant_count: Arc<AtomicUsize>,
}

impl Room {
    fn sync_participant_count(&self) {
        self.participant_count.store(self.participants.len(), Ordering::Relaxed);
    }
}

impl Room {
    async fn run(&mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                RoomCommand::Join { claim, reply } => {
                    let outcome = self.handle_join(claim).await;
                    let _ = reply.send(outcome);
                }
                RoomCommand::ClientJoinedNotice { client_id, username } => {
                    self.handle_client_joined_notice(client_id, username).await;
                }
                RoomCommand::Leave { client_id } => {
                    self.handle_leave(client_id).await;
                }
                RoomCommand::EndRoom { client_id } => {
                    self.handle_end_room(client_id).await;
                }
                RoomCommand::Binary { client_id, frame } => {
                    self.handle_binary(client_id, frame).await;
                }
            }

            if self.participants.is_empty() {
                info!("room '{}' is empty, tearing down", self.name);
                break;
            }
        }
    }

    async fn handle_join(&mut self, claim: JoinClaim) -> JoinOutcome {
        if self.participants.len() >= self.capacity {
            warn!("room '{}' rejected clientId {} (full)", self.name, claim.client_id);
            return JoinOutcome::Full;
        }
        if self.participants.contains_key(&claim.client_id) {
            warn!(
                "room '{}' rejected clientId {} (duplicate)",
                self.name, claim.client_id
            );
            return JoinOutcome::Duplicate;
        }

        let is_admin = if claim.admin_claim && self.admin.is_none() {
            self.admin = Some(claim.client_id);
            true
        } else {
            false
        };

        self.participants.insert(
            claim.client_id,
            Participant {
                username: claim.username.clone(),
                outbound: claim.outbound.clone(),
                joined_at: Utc::now(),
            },
        );
        self.sync_participant_count();

        info!(
            "room '{}': clientId {} ({}) joined as {}, {} participant(s)",
            self.name,
            claim.client_id,
            claim.username,
            if is_admin { "admin" } else { "member" },
            self.participants.len()
        );

        self.broadcast_roster(claim.client_id, &claim.outbound).await;

        let snapshot = self.document.export_snapshot();
        JoinOutcome::Admitted { is_admin, snapshot }
    }

    async fn handle_client_joined_notice(&mut self, client_id: ClientId, username: String) {
        let Some(participant) = self.participants.get(&client_id) else {
            debug!(
                "room '{}': client-joined notice for unknown clientId {}, ignoring",
                self.name, client_id
            );
            return;
        };
        // Use the roster's own username, not the (unauthenticated) claim.
        let username = if participant.username.is_empty() {
            username
        } else {
            participant.username.clone()
        };

        let notice = OutboundControl::ClientJoined {
            client_id,
            username: username.clone(),
            message: format!("{username} joined the room"),
        };
        self.broadcast_control(client_id, &notice).await;
    }

    async fn handle_leave(&mut self, client_id: ClientId) {
        let Some(participant) = self.participants.shift_remove(&client_id) else {
            // Second `client-left` / departure after the fact: no-op (§8).
            return;
        };
        self.sync_participant_count();

        if self.admin == Some(client_id) {
            self.admin = None;
        }

        info!(
            "room '{}': clientId {} ({}) left, {} participant(s) remaining",
            self.name,
            client_id,
            participant.username,
            self.participants.len()
        );

        let notice = OutboundControl::ClientLeft {
            client_id,
            username: participant.username.clone(),
            message: format!("{} left the room", participant.username),
        };
        self.broadcast_control(client_id, &notice).await;
    }

    async fn handle_end_room(&mut self, client_id: ClientId) {
        if self.admin != Some(client_id) {
            warn!(
                "room '{}': clientId {} attempted end-room without admin rights, ignoring",
                self.name, client_id
            );
            return;
        }

        let admin_username = self
            .participants
            .get(&client_id)
            .map(|p| p.username.clone())
            .unwrap_or_default();
        info!("room '{}': admin {} closed the room", self.name, admin_username);

        let notice = OutboundControl::RoomEnded {
            message: format!("Room has been closed by the admin {admin_username}"),
        };
        let text = serde_json::to_string(&notice).expect("control message always serializes");

        for (other_id, participant) in self.participants.iter() {
            if *other_id != client_id && participant.outbound.try_send(OutboundEvent::Text(text.clone())).is_err() {
                warn!(
                    "room '{}': dropped room-ended frame for clientId {} (queue full or closed)",
                    self.name, other_id
                );
            }
            if participant
                .outbound
                .try_send(OutboundEvent::Close {
                    code: 1000,
                    reason: "room ended".into(),
                })
                .is_err()
            {
                warn!(
                    "room '{}': dropped close event for clientId {} (queue full or closed)",
                    self.name, other_id
                );
            }
        }

        self.participants.clear();
        self.sync_participant_count();
        self.admin = None;
    }

    async fn handle_binary(&mut self, client_id: ClientId, frame: BinaryFrame) {
        if !self.participants.contains_key(&client_id) {
            return;
        }

        match frame {
            BinaryFrame::Sync(update) => match self.document.ingest(&update, self.max_doc_size) {
                Ok(true) => {
                    self.broadcast_binary(client_id, &BinaryFrame::Sync(update)).await;
                }
                Ok(false) => {
                    debug!("room '{}': duplicate update from clientId {}", self.name, client_id);
                }
                Err(err) => {
                    warn!("room '{}': update from clientId {} rejected: {}", self.name, client_id, err);
                    if let Some(participant) = self.participants.get(&client_id) {
                        let rejection = OutboundControl::UpdateRejected {
                            message: err.to_string(),
                        };
                        if participant.outbound.try_send(OutboundEvent::control(&rejection)).is_err() {
                            warn!(
                                "room '{}': dropped update-rejected diagnostic for clientId {} (queue full or closed)",
                                self.name, client_id
                            );
                        }
                    }
                }
            },
            BinaryFrame::Awareness(payload) => {
                self.broadcast_binary(client_id, &BinaryFrame::Awareness(payload)).await;
            }
        }
    }

    /// Sends the post-admission roster to every other participant, and to
    /// the newly joined one directly — both receive one `client-update` at
    /// B's join (§8 Scenario 1: "received at B's join" / "on B's
    /// admission").
    async fn broadcast_roster(&self, joined_client_id: ClientId, joined_outbound: &mpsc::Sender<OutboundEvent>) {
        let roster: Vec<ClientSummary> = self
            .participants
            .iter()
            .map(|(id, p)| ClientSummary {
                client_id: *id,
                username: p.username.clone(),
            })
            .collect();
        let update = OutboundControl::ClientUpdate {
            connected_clients: roster,
        };
        self.broadcast_control(joined_client_id, &update).await;

        if joined_outbound.try_send(OutboundEvent::control(&update)).is_err() {
            warn!(
                "room '{}': dropped own client-update for clientId {} (queue full or closed)",
                self.name, joined_client_id
            );
        }
    }

    async fn broadcast_control(&self, exclude: ClientId, msg: &OutboundControl) {
        let event = OutboundEvent::control(msg);
        for (id, participant) in self.participants.iter() {
            if *id == exclude {
                continue;
            }
            if participant.outbound.try_send(event.clone()).is_err() {
                warn!(
                    "room '{}': dropped control frame for clientId {} (queue full or closed)",
                    self.name, id
                );
            }
        }
    }

    async fn broadcast_binary(&self, exclude: ClientId, frame: &BinaryFrame) {
        let event = OutboundEvent::Binary(frame.encode());
        for (id, participant) in self.participants.iter() {
            if *id == exclude {
                continue;
            }
            if participant.outbound.try_send(event.clone()).is_err() {
                debug!(
                    "room '{}': dropped binary frame for clientId {} (queue full or closed)",
                    self.name, id
                );
            }
        }
    }
}

/// Internal correlation id for a connection, independent of the
/// client-supplied (untrusted) `clientId` — used only for log lines.
pub fn new_session_log_id() -> Uuid {
    Uuid::new_v4()
}

/// Outcome of `Registry::acquire_for_join` (§4.B).
pub enum AcquireOutcome {
    Acquired(RoomHandle),
    BudgetExceeded(usize),
}

/// Process-wide room directory (§4.B).
///
/// `acquire_for_join` retries if it wins a race against a room's own
/// teardown: a room that just emptied itself removes its entry via
/// `release` from inside its own executor task after `run` returns, so a
/// caller can observe a stale entry for a room that is mid-teardown and
/// will never accept another `Join` (its `mpsc::Receiver` already dropped).
/// Detecting that (the bounded `send` in `RoomHandle::join` fails because
/// the channel is closed) and retrying the whole acquire is what keeps
/// admission race-free without a lock held across the spawn.
pub struct Registry {
    rooms: std::sync::Mutex<HashMap<String, RoomHandle>>,
    max_rooms: usize,
}

impl Registry {
    pub fn new(max_rooms: usize) -> Self {
        Self {
            rooms: std::sync::Mutex::new(HashMap::new()),
            max_rooms,
        }
    }

    /// Gets the existing room named `name`, or creates and spawns a new
    /// one, enforcing the process-wide room-count budget on creation.
    ///
    /// If the returned handle's room is mid-teardown (its executor has
    /// already exited but not yet called `release`), a subsequent `join`
    /// on it fails because its command channel is closed. Callers detect
    /// that (`RoomHandle::join` returns `None`) and call this again to get
    /// a fresh handle — the dead entry will have been released by then,
    /// or is about to be, in which case this races cleanly with `release`
    /// under the same lock.
    pub fn acquire_for_join(self: &std::sync::Arc<Self>, name: &str, config: &Config) -> AcquireOutcome {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(handle) = rooms.get(name) {
            return AcquireOutcome::Acquired(handle.clone());
        }
        if rooms.len() >= self.max_rooms {
            return AcquireOutcome::BudgetExceeded(self.max_rooms);
        }

        let registry = std::sync::Arc::clone(self);
        let room_name = name.to_string();
        let handle = RoomHandle::spawn(room_name.clone(), config, move |empty_name| {
            registry.release(empty_name);
        });
        rooms.insert(name.to_string(), handle.clone());
        AcquireOutcome::Acquired(handle)
    }

    /// Removes a room's entry. Called by a room's own executor once its
    /// participant map has gone empty (see `RoomHandle::spawn`'s `on_empty`).
    pub fn release(&self, name: &str) {
        let mut rooms = self.rooms.lock().unwrap();
        rooms.remove(name);
    }

    /// Number of currently live rooms, for structured logging/diagnostics
    /// (§4.B supplemental snapshot operation).
    pub fn room_count(&self) -> usize {
        self.rooms.lock().unwrap().len()
    }

    /// Read-only per-room participant-count snapshot, for periodic
    /// diagnostic logging (§4.B supplemental). Never consulted for
    /// admission decisions — those go through `acquire_for_join`/`join`.
    pub fn snapshot(&self) -> Vec<(String, usize)> {
        self.rooms
            .lock()
            .unwrap()
            .iter()
            .map(|(name, handle)| (name.clone(), handle.participant_count()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::from_map(&std::collections::HashMap::new())
    }

    async fn make_claim(client_id: ClientId, username: &str, admin_claim: bool) -> (JoinClaim, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (
            JoinClaim {
                client_id,
                username: username.to_string(),
                admin_claim,
                outbound: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn first_admin_claim_wins_second_is_demoted() {
        let config = test_config();
        let handle = RoomHandle::spawn("r1".into(), &config, |_| {});

        let (claim_a, _rx_a) = make_claim(1, "A", true).await;
        let outcome_a = handle.join(claim_a).await.unwrap();
        assert!(matches!(outcome_a, JoinOutcome::Admitted { is_admin: true, .. }));

        let (claim_b, _rx_b) = make_claim(2, "B", true).await;
        let outcome_b = handle.join(claim_b).await.unwrap();
        assert!(matches!(outcome_b, JoinOutcome::Admitted { is_admin: false, .. }));
    }

    #[tokio::test]
    async fn rejects_at_capacity() {
        let mut config = test_config();
        config.capacity = 1;
        let handle = RoomHandle::spawn("r2".into(), &config, |_| {});

        let (claim_a, _rx_a) = make_claim(1, "A", false).await;
        assert!(matches!(
            handle.join(claim_a).await.unwrap(),
            JoinOutcome::Admitted { .. }
        ));

        let (claim_b, _rx_b) = make_claim(2, "B", false).await;
        assert!(matches!(handle.join(claim_b).await.unwrap(), JoinOutcome::Full));
    }

    #[tokio::test]
    async fn rejects_duplicate_client_id() {
        let config = test_config();
        let handle = RoomHandle::spawn("r3".into(), &config, |_| {});

        let (claim_a, _rx_a) = make_claim(1, "A", false).await;
        handle.join(claim_a).await.unwrap();

        let (claim_a2, _rx_a2) = make_claim(1, "A-again", false).await;
        assert!(matches!(
            handle.join(claim_a2).await.unwrap(),
            JoinOutcome::Duplicate
        ));
    }

    #[tokio::test]
    async fn departure_clears_admin_and_broadcasts_to_remaining() {
        let config = test_config();
        let handle = RoomHandle::spawn("r4".into(), &config, |_| {});

        let (claim_a, _rx_a) = make_claim(1, "A", true).await;
        handle.join(claim_a).await.unwrap();
        let (claim_b, mut rx_b) = make_claim(2, "B", false).await;
        handle.join(claim_b).await.unwrap();

        // Drain B's client-update received at its own join.
        let _ = rx_b.recv().await;

        handle.leave(1).await;

        let event = rx_b.recv().await.unwrap();
        match event {
            OutboundEvent::Text(text) => assert!(text.contains("client-left")),
            other => panic!("expected client-left text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_leave_is_a_no_op() {
        let config = test_config();
        let (tx_empty, _rx_empty) = tokio::sync::oneshot::channel::<()>();
        drop(tx_empty);
        let handle = RoomHandle::spawn("r5".into(), &config, |_| {});

        let (claim_a, _rx_a) = make_claim(1, "A", false).await;
        handle.join(claim_a).await.unwrap();
        handle.leave(1).await;
        // Room is now empty and its executor has exited; a second leave
        // must not panic or hang.
        handle.leave(1).await;
    }

    #[tokio::test]
    async fn non_admin_end_room_is_ignored() {
        let config = test_config();
        let handle = RoomHandle::spawn("r6".into(), &config, |_| {});

        let (claim_a, mut rx_a) = make_claim(1, "A", true).await;
        handle.join(claim_a).await.unwrap();
        let (claim_b, mut rx_b) = make_claim(2, "B", false).await;
        handle.join(claim_b).await.unwrap();
        let _ = rx_a.recv().await; // A's client-update for B joining
        let _ = rx_b.recv().await; // B's own client-update received at its join

        handle.end_room(2).await;

        // Give the executor a moment to process (no-op) before asserting
        // no close event arrived for either participant.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn admin_end_room_closes_everyone() {
        let config = test_config();
        let handle = RoomHandle::spawn("r7".into(), &config, |_| {});

        let (claim_a, mut rx_a) = make_claim(1, "A", true).await;
        handle.join(claim_a).await.unwrap();
        let (claim_b, mut rx_b) = make_claim(2, "B", false).await;
        handle.join(claim_b).await.unwrap();
        let _ = rx_a.recv().await; // A's client-update for B joining
        let _ = rx_b.recv().await; // B's own client-update received at its join

        handle.end_room(1).await;

        // B gets the room-ended text then a close.
        let first = rx_b.recv().await.unwrap();
        assert!(matches!(first, OutboundEvent::Text(t) if t.contains("room-ended")));
        let second = rx_b.recv().await.unwrap();
        assert!(matches!(second, OutboundEvent::Close { .. }));

        // A (the admin) only gets the close, not its own room-ended text.
        let only = rx_a.recv().await.unwrap();
        assert!(matches!(only, OutboundEvent::Close { .. }));
    }

    #[tokio::test]
    async fn on_empty_callback_fires_once_last_participant_leaves() {
        let config = test_config();
        let (done_tx, done_rx) = oneshot::channel();
        let done_tx = std::sync::Mutex::new(Some(done_tx));
        let handle = RoomHandle::spawn("r8".into(), &config, move |_| {
            if let Some(tx) = done_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        });

        let (claim_a, _rx_a) = make_claim(1, "A", false).await;
        handle.join(claim_a).await.unwrap();
        handle.leave(1).await;

        tokio::time::timeout(std::time::Duration::from_secs(1), done_rx)
            .await
            .expect("on_empty callback should fire")
            .unwrap();
    }

    #[tokio::test]
    async fn registry_reuses_existing_room_by_name() {
        let registry = std::sync::Arc::new(Registry::new(10));
        let config = test_config();

        let first = match registry.acquire_for_join("alpha", &config) {
            AcquireOutcome::Acquired(handle) => handle,
            AcquireOutcome::BudgetExceeded(_) => panic!("unexpected budget rejection"),
        };
        let second = match registry.acquire_for_join("alpha", &config) {
            AcquireOutcome::Acquired(handle) => handle,
            AcquireOutcome::BudgetExceeded(_) => panic!("unexpected budget rejection"),
        };
        assert_eq!(first.name(), second.name());
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn registry_enforces_room_budget() {
        let registry = std::sync::Arc::new(Registry::new(1));
        let config = test_config();

        assert!(matches!(
            registry.acquire_for_join("alpha", &config),
            AcquireOutcome::Acquired(_)
        ));
        assert!(matches!(
            registry.acquire_for_join("beta", &config),
            AcquireOutcome::BudgetExceeded(1)
        ));
    }

    #[tokio::test]
    async fn registry_releases_room_once_empty() {
        let registry = std::sync::Arc::new(Registry::new(10));
        let config = test_config();

        let handle = match registry.acquire_for_join("gamma", &config) {
            AcquireOutcome::Acquired(handle) => handle,
            AcquireOutcome::BudgetExceeded(_) => panic!("unexpected budget rejection"),
        };
        let (claim_a, _rx_a) = make_claim(1, "A", false).await;
        handle.join(claim_a).await.unwrap();
        handle.leave(1).await;

        // Give the room's executor a moment to exit and call release.
        for _ in 0..50 {
            if registry.room_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(registry.room_count(), 0);
    }
}
