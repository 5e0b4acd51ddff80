//! Shared server state.
//!
//! Every user-observable transition happens while holding the world lock;
//! CPU-heavy work runs on the blocking pool against data cloned or moved
//! out of it. Lock order when more than one is needed: open-file entry
//! mutex, then the world (compilation database), then a merged index.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};

use cppls::command::CompilationDatabase;
use cppls::config::Config;
use cppls::frontend::FrontEnd;

use crate::indexer::{IndexStore, ProjectIndexer};
use crate::plugin::PluginRegistry;
use crate::proto::PositionEncoding;
use crate::scheduler::OpenFiles;
use crate::transport::{Message, Request, RequestId};

/// Lifecycle phase of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for `initialize`.
    Uninitialized,
    /// `initialize` answered, waiting for `initialized`.
    Initializing,
    /// Normal operation.
    Ready,
    /// `shutdown` received; only `exit` is meaningful now.
    ShutDown,
}

pub struct World {
    pub phase: Phase,
    pub workspace: PathBuf,
    pub config: Config,
    pub encoding: PositionEncoding,
    pub db: CompilationDatabase,
    pub open_files: OpenFiles,
    pub frontend: Arc<dyn FrontEnd>,
}

impl World {
    pub fn new(frontend: Arc<dyn FrontEnd>) -> Self {
        Self {
            phase: Phase::Uninitialized,
            workspace: PathBuf::new(),
            config: Config::default(),
            encoding: PositionEncoding::default(),
            db: CompilationDatabase::new(),
            open_files: OpenFiles::new(8),
            frontend,
        }
    }
}

pub struct ServerCtx {
    pub world: Mutex<World>,
    pub store: IndexStore,
    pub indexer: ProjectIndexer,
    pub plugins: PluginRegistry,
    outgoing: mpsc::UnboundedSender<Message>,
    next_request_id: AtomicI64,
    /// Server -> client requests awaiting a response, by id.
    outstanding: std::sync::Mutex<std::collections::HashMap<RequestId, String>>,
    shutdown_requested: AtomicBool,
    exit_tx: watch::Sender<bool>,
}

impl ServerCtx {
    pub fn new(frontend: Arc<dyn FrontEnd>, outgoing: mpsc::UnboundedSender<Message>) -> Arc<Self> {
        Arc::new(Self {
            world: Mutex::new(World::new(frontend)),
            store: IndexStore::new(),
            indexer: ProjectIndexer::new(),
            plugins: PluginRegistry::new(),
            outgoing,
            next_request_id: AtomicI64::new(1),
            outstanding: std::sync::Mutex::new(std::collections::HashMap::new()),
            shutdown_requested: AtomicBool::new(false),
            exit_tx: watch::channel(false).0,
        })
    }

    /// Queue an outbound message; ordering follows completion order.
    pub fn send(&self, message: Message) {
        if self.outgoing.send(message).is_err() {
            tracing::warn!("client connection closed, dropping outbound message");
        }
    }

    /// Send a server -> client request with a fresh monotonic id.
    pub fn send_request(&self, method: &str, params: serde_json::Value) -> RequestId {
        let id = RequestId::Number(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        self.outstanding.lock().unwrap().insert(id.clone(), method.to_owned());
        self.send(Message::Request(Request { id: id.clone(), method: method.to_owned(), params }));
        id
    }

    /// Match a client response to an outstanding request; returns the
    /// method it answered, if known.
    pub fn complete_request(&self, id: &RequestId) -> Option<String> {
        self.outstanding.lock().unwrap().remove(id)
    }

    pub fn send_notification(&self, method: &str, params: serde_json::Value) {
        self.send(Message::Notification(crate::transport::Notification {
            method: method.to_owned(),
            params,
        }));
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Stop the loop. The signal is level-triggered: subscribers see it
    /// even if they subscribe between the send and their next poll.
    pub fn trigger_exit(&self) {
        // send_replace updates the value even with no live receivers.
        self.exit_tx.send_replace(true);
    }

    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exit_tx.subscribe()
    }
}
