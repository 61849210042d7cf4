//! WebSocket gateway with doc-room routing of applied ops.
//!
//! Architecture:
//! ```text
//! Client A ──┐  applyUpdate        ┌──────────────────┐
//!             ├──────────────────► │ DocumentUpdater  │ ── RocksVersionedStore
//! Client B ──┘                     │ (OTSequencer)    │
//!                                  └────────┬─────────┘
//!                                           │ applied-ops
//!                                           ▼
//!                                       EventBus
//!                                           │ filtered by DocRooms
//!                          ┌────────────────┼────────────────┐
//!                          ▼                ▼                ▼
//!                       Client A         Client B         Client C
//! ```
//!
//! A connection may join several docs. When the last connection leaves a doc
//! the doc is flushed and evicted from the cache. If that flush fails the doc
//! stays loaded and dirty until the maintenance task manages to flush it.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 3 & 8

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{DocRooms, UpdaterEvent};
use crate::collaborators::VersionedStore;
use crate::config::UpdaterConfig;
use crate::manager::{Collaborators, DocumentUpdater};
use crate::memory::{MemoryArchive, MemoryHistory, MemoryStore};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::storage::{RocksVersionedStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB path for the versioned store (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// How often expired op-log entries are purged
    pub purge_interval: Duration,
    pub updater: UpdaterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3003".to_string(),
            storage_path: None,
            purge_interval: Duration::from_secs(60),
            updater: UpdaterConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub applied_updates: u64,
    pub rejected_updates: u64,
}

/// Per-connection routing state.
#[derive(Debug, Default)]
pub struct ConnectionState {
    pub conn_id: Uuid,
    /// doc_id → project_id for every joined doc
    joined: HashMap<Uuid, Uuid>,
    /// `meta.source` values this connection submitted with
    sources: HashSet<String>,
}

impl ConnectionState {
    pub fn new(conn_id: Uuid) -> Self {
        Self {
            conn_id,
            ..Self::default()
        }
    }

    pub fn has_joined(&self, doc_id: Uuid) -> bool {
        self.joined.contains_key(&doc_id)
    }

    /// Events for joined docs, minus the connection's own applied ops (it got an ack).
    fn wants(&self, event: &UpdaterEvent) -> bool {
        if !self.has_joined(event.doc_id()) {
            return false;
        }
        match event {
            UpdaterEvent::AppliedOps { op: Some(op), .. } => !op
                .meta
                .source
                .as_ref()
                .is_some_and(|s| self.sources.contains(s)),
            _ => true,
        }
    }
}

/// The updater gateway.
pub struct UpdaterServer {
    config: ServerConfig,
    updater: Arc<DocumentUpdater>,
    rooms: Arc<DocRooms>,
    stats: Arc<RwLock<ServerStats>>,
}

impl UpdaterServer {
    pub fn new(config: ServerConfig, collaborators: Collaborators) -> Self {
        let updater = Arc::new(DocumentUpdater::new(config.updater.clone(), collaborators));
        Self {
            config,
            updater,
            rooms: Arc::new(DocRooms::new()),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Build a server backed by RocksDB (or memory when no path is set).
    ///
    /// Archive and history services are process-local.
    pub fn open(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn VersionedStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksVersionedStore::open(store_config)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        let history = Arc::new(MemoryHistory::new());
        let collaborators = Collaborators {
            store,
            archive: Arc::new(MemoryArchive::new()),
            doc_history: history.clone(),
            project_history: history,
        };
        Ok(Self::new(config, collaborators))
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Updater gateway listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let updater = self.updater.clone();
            let rooms = self.rooms.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, updater, rooms, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Every `purge_interval`: purge expired op-log entries and retry
    /// eviction of docs no connection has joined.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let updater = self.updater.clone();
        let rooms = self.rooms.clone();
        let period = self.config.purge_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let purged = updater.op_log().purge_expired().await;
                if purged > 0 {
                    log::debug!("Purged {purged} expired op-log entries");
                }
                Self::evict_unwatched(&updater, &rooms).await;
            }
        })
    }

    /// Flush and evict cached docs without a room; returns how many were evicted.
    ///
    /// A doc whose flush fails stays loaded and is tried again next round.
    pub async fn evict_unwatched(updater: &DocumentUpdater, rooms: &DocRooms) -> usize {
        let watched: HashSet<Uuid> = rooms.active_documents().await.into_iter().collect();
        let mut evicted = 0;
        for project_id in updater.cache().project_ids().await {
            for doc_id in updater.doc_ids_in_project(project_id).await {
                if watched.contains(&doc_id) {
                    continue;
                }
                match updater.delete_doc(project_id, doc_id, false).await {
                    Ok(()) => evicted += 1,
                    Err(e) => log::warn!("Doc {doc_id} still unflushed, keeping it loaded: {e}"),
                }
            }
        }
        if evicted > 0 {
            log::info!("Evicted {evicted} docs with no connections");
        }
        evicted
    }

    /// Flush every loaded doc before the process exits.
    pub async fn shutdown(&self) {
        if let Err(e) = self.updater.flush_all().await {
            log::error!("Flush on shutdown failed: {e}");
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        updater: Arc<DocumentUpdater>,
        rooms: Arc<DocRooms>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let mut state = ConnectionState::new(Uuid::new_v4());
        let mut events = updater.subscribe_applied_ops();
        log::info!("WebSocket connection {} established from {addr}", state.conn_id);

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += text.len() as u64;
                                }
                                let reply = match ClientMessage::decode(text.as_str()) {
                                    Ok(client_msg) => {
                                        Self::handle_message(&updater, &rooms, &stats, &mut state, client_msg).await
                                    }
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        ServerMessage::Error { status: 400, message: e.to_string() }
                                    }
                                };
                                ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    event = events.recv() => {
                        match event {
                            Ok(event) if state.wants(&event) => {
                                let msg = ServerMessage::Event { event: (*event).clone() };
                                ws_sender.send(Message::Text(msg.encode()?.into())).await?;
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {} lagged by {n} events", state.conn_id);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        // Cleanup: leave every joined room
        let joined: Vec<(Uuid, Uuid)> = state.joined.drain().collect();
        for (doc_id, project_id) in joined {
            Self::leave(&updater, &rooms, state.conn_id, project_id, doc_id).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms.room_count().await;
        }

        result
    }

    /// Dispatch one client message; returns the reply for the sender.
    pub async fn handle_message(
        updater: &DocumentUpdater,
        rooms: &DocRooms,
        stats: &RwLock<ServerStats>,
        state: &mut ConnectionState,
        msg: ClientMessage,
    ) -> ServerMessage {
        match msg {
            ClientMessage::JoinDoc {
                project_id,
                doc_id,
                from_version,
            } => match updater
                .get_doc_and_recent_ops(project_id, doc_id, from_version)
                .await
            {
                Ok((doc, ops)) => {
                    let members = rooms.join(doc_id, state.conn_id).await;
                    state.joined.insert(doc_id, project_id);
                    stats.write().await.active_rooms = rooms.room_count().await;
                    log::info!("Connection {} joined doc {doc_id} ({members} members)", state.conn_id);
                    ServerMessage::Joined { doc_id, doc, ops }
                }
                Err(e) => {
                    log::warn!("Join of doc {doc_id} failed: {e}");
                    ServerMessage::error(&e)
                }
            },

            ClientMessage::ApplyUpdate {
                project_id,
                doc_id,
                mut update,
            } => {
                let source = update
                    .meta
                    .source
                    .get_or_insert_with(|| state.conn_id.to_string())
                    .clone();
                state.sources.insert(source);

                match updater.send_update(project_id, doc_id, update).await {
                    Ok(applied) => {
                        stats.write().await.applied_updates += 1;
                        ServerMessage::Ack {
                            doc_id,
                            version: applied.version,
                            dup: applied.dup,
                        }
                    }
                    Err(e) => {
                        stats.write().await.rejected_updates += 1;
                        log::debug!("Update to doc {doc_id} rejected: {e}");
                        ServerMessage::error(&e)
                    }
                }
            }

            ClientMessage::LeaveDoc { project_id, doc_id } => {
                if state.joined.remove(&doc_id).is_some() {
                    Self::leave(updater, rooms, state.conn_id, project_id, doc_id).await;
                    stats.write().await.active_rooms = rooms.room_count().await;
                }
                ServerMessage::Left { doc_id }
            }

            ClientMessage::Ping => ServerMessage::Pong,
        }
    }

    async fn leave(updater: &DocumentUpdater, rooms: &DocRooms, conn_id: Uuid, project_id: Uuid, doc_id: Uuid) {
        if rooms.leave(doc_id, conn_id).await > 0 {
            return;
        }
        log::info!("Last connection left doc {doc_id}, flushing and evicting");
        // A failed flush keeps the doc cached and dirty for the maintenance task
        if let Err(e) = updater.delete_doc(project_id, doc_id, false).await {
            log::error!("Failed to flush doc {doc_id} on last leave, keeping it loaded: {e}");
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn updater(&self) -> &Arc<DocumentUpdater> {
        &self.updater
    }

    pub fn rooms(&self) -> &Arc<DocRooms> {
        &self.rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CollaboratorError;
    use crate::ot::Component;
    use crate::update::Update;

    struct Fixture {
        server: UpdaterServer,
        store: Arc<MemoryStore>,
        project_id: Uuid,
        doc_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let history = Arc::new(MemoryHistory::new());
        let (project_id, doc_id) = (Uuid::new_v4(), Uuid::new_v4());
        store.seed(project_id, doc_id, &["hello world"], 0).await;

        let config = ServerConfig {
            updater: UpdaterConfig::for_testing(),
            ..ServerConfig::default()
        };
        let server = UpdaterServer::new(
            config,
            Collaborators {
                store: store.clone(),
                archive: Arc::new(MemoryArchive::new()),
                doc_history: history.clone(),
                project_history: history,
            },
        );
        Fixture {
            server,
            store,
            project_id,
            doc_id,
        }
    }

    async fn send(fx: &Fixture, state: &mut ConnectionState, msg: ClientMessage) -> ServerMessage {
        UpdaterServer::handle_message(&fx.server.updater, &fx.server.rooms, &fx.server.stats, state, msg).await
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:3003");
        assert!(config.storage_path.is_none());
        assert_eq!(config.purge_interval, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_open_in_memory_and_with_storage() {
        let server = UpdaterServer::open(ServerConfig::default()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:3003");

        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        assert!(UpdaterServer::open(config).is_ok());
    }

    #[tokio::test]
    async fn test_join_apply_ack() {
        let fx = fixture().await;
        let mut conn = ConnectionState::new(Uuid::new_v4());

        let joined = send(
            &fx,
            &mut conn,
            ClientMessage::JoinDoc {
                project_id: fx.project_id,
                doc_id: fx.doc_id,
                from_version: None,
            },
        )
        .await;
        assert!(matches!(joined, ServerMessage::Joined { ref ops, .. } if ops.is_empty()));
        assert!(conn.has_joined(fx.doc_id));
        assert_eq!(fx.server.rooms.room_count().await, 1);

        let ack = send(
            &fx,
            &mut conn,
            ClientMessage::ApplyUpdate {
                project_id: fx.project_id,
                doc_id: fx.doc_id,
                update: Update::new(vec![Component::insert(5, ",")], 0),
            },
        )
        .await;
        assert_eq!(
            ack,
            ServerMessage::Ack {
                doc_id: fx.doc_id,
                version: 1,
                dup: false
            }
        );
        assert_eq!(fx.server.stats().await.applied_updates, 1);
    }

    #[tokio::test]
    async fn test_rejected_update_replies_with_status() {
        let fx = fixture().await;
        let mut conn = ConnectionState::new(Uuid::new_v4());
        let reply = send(
            &fx,
            &mut conn,
            ClientMessage::ApplyUpdate {
                project_id: fx.project_id,
                doc_id: fx.doc_id,
                update: Update::new(vec![Component::insert(0, "x")], 7),
            },
        )
        .await;
        assert!(matches!(reply, ServerMessage::Error { status: 500, .. }));
        assert_eq!(fx.server.stats().await.rejected_updates, 1);
    }

    #[tokio::test]
    async fn test_own_ops_not_echoed() {
        let fx = fixture().await;
        let mut alice = ConnectionState::new(Uuid::new_v4());
        let mut bob = ConnectionState::new(Uuid::new_v4());
        for conn in [&mut alice, &mut bob] {
            send(
                &fx,
                conn,
                ClientMessage::JoinDoc {
                    project_id: fx.project_id,
                    doc_id: fx.doc_id,
                    from_version: None,
                },
            )
            .await;
        }

        let mut rx = fx.server.updater.subscribe_applied_ops();
        send(
            &fx,
            &mut alice,
            ClientMessage::ApplyUpdate {
                project_id: fx.project_id,
                doc_id: fx.doc_id,
                update: Update::new(vec![Component::insert(0, "A")], 0),
            },
        )
        .await;

        let event = rx.recv().await.unwrap();
        assert!(!alice.wants(&event));
        assert!(bob.wants(&event));
        assert!(!ConnectionState::new(Uuid::new_v4()).wants(&event));
    }

    #[tokio::test]
    async fn test_last_leave_flushes_and_evicts() {
        let fx = fixture().await;
        let mut alice = ConnectionState::new(Uuid::new_v4());
        let mut bob = ConnectionState::new(Uuid::new_v4());
        let join = ClientMessage::JoinDoc {
            project_id: fx.project_id,
            doc_id: fx.doc_id,
            from_version: None,
        };
        send(&fx, &mut alice, join.clone()).await;
        send(&fx, &mut bob, join).await;
        send(
            &fx,
            &mut alice,
            ClientMessage::ApplyUpdate {
                project_id: fx.project_id,
                doc_id: fx.doc_id,
                update: Update::new(vec![Component::insert(0, ">")], 0),
            },
        )
        .await;

        let leave = ClientMessage::LeaveDoc {
            project_id: fx.project_id,
            doc_id: fx.doc_id,
        };
        send(&fx, &mut alice, leave.clone()).await;
        assert!(fx.server.updater.cache().is_loaded(fx.doc_id).await);
        assert_eq!(fx.store.set_calls(), 0);

        send(&fx, &mut bob, leave).await;
        assert!(!fx.server.updater.cache().is_loaded(fx.doc_id).await);
        assert_eq!(fx.store.set_calls(), 1);
        let stored = fx.store.document(fx.project_id, fx.doc_id).await.unwrap();
        assert_eq!(stored.lines, Some(vec![">hello world".to_string()]));
        assert_eq!(fx.server.stats().await.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_last_leave_with_store_down_keeps_doc() {
        let fx = fixture().await;
        let mut conn = ConnectionState::new(Uuid::new_v4());
        send(
            &fx,
            &mut conn,
            ClientMessage::JoinDoc {
                project_id: fx.project_id,
                doc_id: fx.doc_id,
                from_version: None,
            },
        )
        .await;
        let ack = send(
            &fx,
            &mut conn,
            ClientMessage::ApplyUpdate {
                project_id: fx.project_id,
                doc_id: fx.doc_id,
                update: Update::new(vec![Component::insert(0, "EDIT ")], 0),
            },
        )
        .await;
        assert!(matches!(ack, ServerMessage::Ack { version: 1, .. }));

        // Every attempt of the flush fails
        for _ in 0..3 {
            fx.store
                .fail_next_set(CollaboratorError::Unavailable("store down".into()));
        }
        send(
            &fx,
            &mut conn,
            ClientMessage::LeaveDoc {
                project_id: fx.project_id,
                doc_id: fx.doc_id,
            },
        )
        .await;

        assert!(fx.server.updater.cache().is_loaded(fx.doc_id).await);
        let doc = fx.server.updater.get_doc(fx.project_id, fx.doc_id).await.unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.lines, vec!["EDIT hello world".to_string()]);
        assert!(doc.unflushed_since.is_some());
        assert_eq!(fx.store.document(fx.project_id, fx.doc_id).await.unwrap().version, 0);

        // Store is back: maintenance flushes and evicts the unwatched doc
        let evicted = UpdaterServer::evict_unwatched(&fx.server.updater, &fx.server.rooms).await;
        assert_eq!(evicted, 1);
        assert!(!fx.server.updater.cache().is_loaded(fx.doc_id).await);
        let stored = fx.store.document(fx.project_id, fx.doc_id).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.lines, Some(vec!["EDIT hello world".to_string()]));
    }

    #[tokio::test]
    async fn test_evict_unwatched_skips_joined_docs() {
        let fx = fixture().await;
        let mut conn = ConnectionState::new(Uuid::new_v4());
        send(
            &fx,
            &mut conn,
            ClientMessage::JoinDoc {
                project_id: fx.project_id,
                doc_id: fx.doc_id,
                from_version: None,
            },
        )
        .await;
        let evicted = UpdaterServer::evict_unwatched(&fx.server.updater, &fx.server.rooms).await;
        assert_eq!(evicted, 0);
        assert!(fx.server.updater.cache().is_loaded(fx.doc_id).await);
    }

    #[tokio::test]
    async fn test_ping() {
        let fx = fixture().await;
        let mut conn = ConnectionState::new(Uuid::new_v4());
        assert_eq!(send(&fx, &mut conn, ClientMessage::Ping).await, ServerMessage::Pong);
    }
}
