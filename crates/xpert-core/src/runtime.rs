//! Run-scoped context and cancellation
//!
//! [`RunContext`] bundles everything a node, tool or middleware may need at
//! execution time: thread and run identity, the event bus, the abort
//! signal, the store, the ledger and the resume slot an interrupted hook
//! reads its resume payload from. All durable state lives in channels; the
//! context carries identity and plumbing only, so a resumed run re-hydrates
//! exactly from its checkpoint.

use crate::ledger::{ExecutionLedger, InMemoryLedger};
use crate::store::Store;
use crate::stream::EventBus;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Sender half of a cancellation signal
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    /// Trip the signal. Idempotent.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiver half of a cancellation signal, propagated through
/// `runtime.signal` to every in-flight model and tool call.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the signal is tripped. Returns immediately if it
    /// already was.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // Sender dropped without aborting means the run owner is gone; treat
        // as an abort so waiters do not hang.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Signal that never fires; for detached helpers and tests
    pub fn never() -> Self {
        static NEVER: std::sync::OnceLock<watch::Receiver<bool>> = std::sync::OnceLock::new();
        let rx = NEVER
            .get_or_init(|| {
                let (tx, rx) = watch::channel(false);
                // Keep the sender alive for the process lifetime so the
                // channel never reports closure.
                std::mem::forget(tx);
                rx
            })
            .clone();
        Self { rx }
    }
}

/// Create a linked abort handle/signal pair
pub fn abort_channel() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

/// Per-run execution context shared with nodes, tools and middlewares
#[derive(Clone)]
pub struct RunContext {
    pub thread_id: String,
    pub run_id: String,
    /// Checkpoint namespace this run writes under; dotted for sub-agents
    pub checkpoint_ns: String,
    /// Agent key currently executing, when inside an agent scope
    pub agent_key: Option<String>,
    /// Environment passed through to tools
    pub env: HashMap<String, String>,
    /// Language for localized error messages
    pub language: String,
    pub events: EventBus,
    pub signal: AbortSignal,
    pub store: Option<Arc<dyn Store>>,
    pub ledger: Arc<dyn ExecutionLedger>,
    /// Resume payload for the hook that raised the pending interrupt;
    /// consumed exactly once via [`RunContext::take_resume`]
    resume: Arc<Mutex<Option<Value>>>,
}

impl RunContext {
    pub fn new(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            checkpoint_ns: String::new(),
            agent_key: None,
            env: HashMap::new(),
            language: "en".to_string(),
            events: EventBus::sink(),
            signal: AbortSignal::never(),
            store: None,
            ledger: Arc::new(InMemoryLedger::new()),
            resume: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn ExecutionLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Context for a sub-agent scope: child namespace, the sub-agent's key
    pub fn child_scope(&self, segment: &str, agent_key: impl Into<String>) -> Self {
        let mut child = self.clone();
        child.checkpoint_ns = if self.checkpoint_ns.is_empty() {
            segment.to_string()
        } else {
            format!("{}.{}", self.checkpoint_ns, segment)
        };
        child.agent_key = Some(agent_key.into());
        child
    }

    pub fn for_agent(&self, agent_key: impl Into<String>) -> Self {
        let mut scoped = self.clone();
        scoped.agent_key = Some(agent_key.into());
        scoped
    }

    /// Stage a resume payload for the hook that raised the interrupt
    pub fn set_resume(&self, value: Value) {
        let mut slot = self
            .resume
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(value);
    }

    /// Take the staged resume payload, consuming it
    pub fn take_resume(&self) -> Option<Value> {
        let mut slot = self
            .resume
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.take()
    }

    /// Peek without consuming; used by hooks that only need to know whether
    /// a resume is in flight
    pub fn has_resume(&self) -> bool {
        self.resume
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("thread_id", &self.thread_id)
            .field("run_id", &self.run_id)
            .field("checkpoint_ns", &self.checkpoint_ns)
            .field("agent_key", &self.agent_key)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}
