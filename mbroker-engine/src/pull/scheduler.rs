//! Periodic and on-demand reconciliation.

use mbroker_core::{BackendError, ResourceKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use super::{ReconcileReport, ReconciliationEngine, ScopeKey};

/// Kinds covered by a periodic pass, parents before the kinds that
/// reference them.
pub const RECONCILE_ORDER: [ResourceKind; 10] = [
    ResourceKind::Network,
    ResourceKind::Subnet,
    ResourceKind::SecurityGroup,
    ResourceKind::FloatingIp,
    ResourceKind::Port,
    ResourceKind::Router,
    ResourceKind::ServerGroup,
    ResourceKind::Instance,
    ResourceKind::Volume,
    ResourceKind::Snapshot,
];

type ReconcileReply = oneshot::Sender<Result<ReconcileReport, BackendError>>;

enum Command {
    Register(ScopeKey),
    Unregister(String),
    Reconcile {
        scope: ScopeKey,
        kind: ResourceKind,
        reply: Option<ReconcileReply>,
    },
}

/// Cheap handle for talking to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Include `scope` in every periodic pass.
    pub async fn register_scope(&self, scope: ScopeKey) {
        let _ = self.tx.send(Command::Register(scope)).await;
    }

    pub async fn unregister_scope(&self, scope: &str) {
        let _ = self.tx.send(Command::Unregister(scope.to_string())).await;
    }

    /// Queue a reconciliation of one kind in one scope without waiting.
    pub async fn schedule_reconciliation(&self, scope: ScopeKey, kind: ResourceKind) {
        let command = Command::Reconcile {
            scope,
            kind,
            reply: None,
        };
        if self.tx.send(command).await.is_err() {
            warn!(kind = %kind, "Reconciliation scheduler stopped, request dropped");
        }
    }

    /// Reconcile one kind in one scope and wait for the report.
    pub async fn reconcile_now(
        &self,
        scope: ScopeKey,
        kind: ResourceKind,
    ) -> Result<ReconcileReport, BackendError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Reconcile {
            scope,
            kind,
            reply: Some(reply),
        };
        let stopped = || BackendError::unavailable("reconciliation scheduler stopped");
        self.tx.send(command).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }
}

pub struct ReconciliationScheduler {
    engine: Arc<ReconciliationEngine>,
    period: Duration,
    scopes: BTreeMap<String, ScopeKey>,
    rx: mpsc::Receiver<Command>,
}

impl ReconciliationScheduler {
    pub fn new(engine: Arc<ReconciliationEngine>, period: Duration) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(64);
        let scheduler = Self {
            engine,
            period,
            scopes: BTreeMap::new(),
            rx,
        };
        (scheduler, SchedulerHandle { tx })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until every handle is dropped. The first pass starts
    /// immediately.
    pub async fn run(mut self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period = ?self.period, "Reconciliation scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_pass().await;
                    debug!(?report, "Periodic reconciliation finished");
                }
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        info!("Reconciliation scheduler stopping");
                        break;
                    };
                    self.handle(command).await;
                }
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Register(scope) => {
                debug!(scope = %scope.scope, "Scope registered for reconciliation");
                self.scopes.insert(scope.scope.clone(), scope);
            }
            Command::Unregister(scope) => {
                self.scopes.remove(&scope);
            }
            Command::Reconcile { scope, kind, reply } => {
                let result = self.engine.reconcile(kind, std::slice::from_ref(&scope)).await;
                if let Err(e) = &result {
                    warn!(kind = %kind, scope = %scope.scope, error = %e, "On-demand reconciliation failed");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }

    /// One pass over every registered scope, kind by kind.
    pub async fn run_pass(&self) -> ReconcileReport {
        let mut total = ReconcileReport::default();
        if self.scopes.is_empty() {
            return total;
        }
        let scopes: Vec<ScopeKey> = self.scopes.values().cloned().collect();
        for kind in RECONCILE_ORDER {
            match self.engine.reconcile(kind, &scopes).await {
                Ok(report) => total.merge(&report),
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Listing failed, kind skipped this pass");
                    total.failed += 1;
                }
            }
        }
        total
    }
}
