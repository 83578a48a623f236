//! Shared application state

use crate::auth::SecretIssuer;
use crate::config::ServerConfig;
use crate::entities::{Run, Thread};
use dashmap::DashMap;
use std::sync::Arc;
use xpert_checkpoint::{CheckpointSaver, InMemoryCheckpointSaver};
use xpert_core::{
    AbortHandle, ChatModel, CompiledGraph, ExecutionLedger, InMemoryLedger, InMemoryStore,
    InterruptManager, Store, Xpert,
};

/// Process-wide state shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub secrets: Arc<SecretIssuer>,

    /// Registered assistants by id
    pub assistants: Arc<DashMap<String, Xpert>>,
    /// Compiled graphs by assistant id
    pub graphs: Arc<DashMap<String, Arc<CompiledGraph>>>,
    pub threads: Arc<DashMap<String, Thread>>,
    pub runs: Arc<DashMap<String, Run>>,
    /// Abort handles of in-flight runs, by run id
    pub abort_handles: Arc<DashMap<String, AbortHandle>>,

    pub checkpointer: Arc<dyn CheckpointSaver>,
    pub ledger: Arc<dyn ExecutionLedger>,
    pub store: Arc<dyn Store>,
    pub interrupts: Arc<InterruptManager>,
    pub model: Arc<dyn ChatModel>,
}

impl AppState {
    /// State with in-memory backends
    pub fn new(config: ServerConfig, model: Arc<dyn ChatModel>) -> Self {
        let secrets = Arc::new(SecretIssuer::new(&config.session_secret));
        Self {
            config: Arc::new(config),
            secrets,
            assistants: Arc::new(DashMap::new()),
            graphs: Arc::new(DashMap::new()),
            threads: Arc::new(DashMap::new()),
            runs: Arc::new(DashMap::new()),
            abort_handles: Arc::new(DashMap::new()),
            checkpointer: Arc::new(InMemoryCheckpointSaver::new()),
            ledger: Arc::new(InMemoryLedger::new()),
            store: Arc::new(InMemoryStore::new()),
            interrupts: Arc::new(InterruptManager::new()),
            model,
        }
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn CheckpointSaver>) -> Self {
        self.checkpointer = checkpointer;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn ExecutionLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Register an assistant and its compiled graph
    pub fn register_assistant(&self, xpert: Xpert, graph: Arc<CompiledGraph>) {
        self.graphs.insert(xpert.id.clone(), graph);
        self.assistants.insert(xpert.id.clone(), xpert);
    }
}
