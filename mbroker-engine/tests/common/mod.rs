#![allow(dead_code)]

use mbroker_core::{
    BrokerAuditLogger, BrokerConfig, Event, EventSink, MemoryStore, NetworkSpec, QuotaLedger,
    ResourceRecord, ResourceSpec, ResourceState, ResourceStore, TenantSpec,
};
use mbroker_engine::Executor;
use mbroker_engine::test_util::MockBackend;
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct Harness {
    pub backend: Arc<MockBackend>,
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<QuotaLedger>,
    pub audit: Arc<BrokerAuditLogger>,
    pub events: broadcast::Receiver<Event>,
    pub executor: Executor,
}

pub fn config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.poll.interval_secs = 1;
    config.poll.timeout_secs = 20;
    config.poll.instance_timeout_secs = 30;
    config.poll.deletion_timeout_secs = 20;
    config
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(config: BrokerConfig) -> Harness {
    let backend = Arc::new(MockBackend::new());
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(QuotaLedger::new());
    let audit = Arc::new(BrokerAuditLogger::new_recording());
    let sink = EventSink::new(audit.clone());
    let events = sink.subscribe();
    let executor = Executor::new(
        backend.clone(),
        store.clone(),
        ledger.clone(),
        sink,
        Arc::new(config),
    );
    Harness {
        backend,
        store,
        ledger,
        audit,
        events,
        executor,
    }
}

impl Harness {
    pub async fn get(&self, id: &str) -> Option<ResourceRecord> {
        self.store.get(id).await.unwrap()
    }

    pub async fn state(&self, id: &str) -> Option<ResourceState> {
        self.get(id).await.map(|r| r.state)
    }

    /// Events emitted so far.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Insert a record that already exists remotely.
    pub async fn existing(&self, mut record: ResourceRecord, backend_id: &str) -> ResourceRecord {
        record.state = ResourceState::Ok;
        record.backend_id = Some(backend_id.to_string());
        self.store.insert(record).await.unwrap()
    }
}

pub fn tenant(name: &str) -> ResourceRecord {
    ResourceRecord::new(
        "project-1",
        name,
        ResourceSpec::Tenant(TenantSpec {
            user_username: format!("{}-user", name),
            ..Default::default()
        }),
    )
}

pub fn network(scope: &str, name: &str) -> ResourceRecord {
    ResourceRecord::new(scope, name, ResourceSpec::Network(NetworkSpec::default()))
}
