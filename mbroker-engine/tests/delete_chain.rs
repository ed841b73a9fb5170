mod common;

use common::{harness, network, tenant};
use mbroker_core::{
    Event, InstanceSpec, QuotaScope, ResourceKind, ResourceRecord, ResourceSpec, ResourceState,
    ResourceStore, SubnetSpec, VolumeSpec,
};
use mbroker_engine::{BackendMethod, CreateOptions, DeleteOptions};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_delete_of_remotely_missing_resource_succeeds() {
    let mut h = harness();
    let net = h.existing(network("t1", "gone"), "net-gone").await;
    h.backend.remove_remote("net-gone");

    let outcome = h
        .executor
        .request_delete(&net.id, DeleteOptions::default())
        .await
        .unwrap()
        .wait()
        .await;
    assert!(outcome.is_ok(), "{:?}", outcome.result);
    assert!(h.get(&net.id).await.is_none());

    let events = h.drain_events();
    assert!(matches!(events.first(), Some(Event::DeletionScheduled(_))));
    assert!(matches!(events.last(), Some(Event::Deleted(r)) if r.id == net.id));
}

#[tokio::test(start_paused = true)]
async fn test_delete_without_backend_id_skips_backend() {
    let h = harness();
    let mut record = network("t1", "never-created");
    record.state = ResourceState::Erred;
    let record = h.store.insert(record).await.unwrap();

    let outcome = h
        .executor
        .request_delete(&record.id, DeleteOptions::default())
        .await
        .unwrap()
        .wait()
        .await;
    assert!(outcome.is_ok());
    assert!(h.get(&record.id).await.is_none());
    assert!(h.backend.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_delete_removes_children_first() {
    let h = harness();
    let net = h.existing(network("t1", "net"), "net-1").await;
    let subnet = h
        .existing(
            ResourceRecord::new("t1", "sub", ResourceSpec::Subnet(SubnetSpec::default()))
                .with_parent(net.id.clone()),
            "subnet-1",
        )
        .await;

    let outcome = h
        .executor
        .request_delete(&net.id, DeleteOptions::default())
        .await
        .unwrap()
        .wait()
        .await;
    assert!(outcome.is_ok(), "{:?}", outcome.result);

    assert_eq!(
        h.backend.call_names(),
        vec!["delete_subnet", "pull_subnet", "delete_network", "pull_network"]
    );
    assert!(h.get(&subnet.id).await.is_none());
    assert!(h.get(&net.id).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_second_delete_request_is_rejected() {
    let h = harness();
    let net = h.existing(network("t1", "net"), "net-1").await;
    h.backend
        .delay(BackendMethod::Delete(ResourceKind::Network), Duration::from_secs(5));

    let first = h
        .executor
        .request_delete(&net.id, DeleteOptions::default())
        .await
        .unwrap();
    let second = h
        .executor
        .request_delete(&net.id, DeleteOptions::default())
        .await;
    assert!(matches!(second, Err(mbroker_core::CoreError::InvalidTransition(_))));
    assert!(first.wait().await.is_ok());
}

async fn instance_with_volumes(h: &common::Harness) -> (ResourceRecord, ResourceRecord, ResourceRecord) {
    let instance = h
        .existing(
            ResourceRecord::new(
                "t1",
                "vm",
                ResourceSpec::Instance(InstanceSpec {
                    cores: 2,
                    ram_mb: 2048,
                    ..Default::default()
                }),
            ),
            "vm-1",
        )
        .await;
    let system = h
        .existing(
            ResourceRecord::new(
                "t1",
                "vm-system",
                ResourceSpec::Volume(VolumeSpec {
                    size_mb: 10240,
                    bootable: true,
                    ..Default::default()
                }),
            )
            .with_parent(instance.id.clone()),
            "vol-system",
        )
        .await;
    let data = h
        .existing(
            ResourceRecord::new(
                "t1",
                "vm-data",
                ResourceSpec::Volume(VolumeSpec {
                    size_mb: 2048,
                    ..Default::default()
                }),
            )
            .with_parent(instance.id.clone()),
            "vol-data",
        )
        .await;
    (instance, system, data)
}

#[tokio::test(start_paused = true)]
async fn test_instance_delete_can_keep_data_volumes() {
    let h = harness();
    let (instance, system, data) = instance_with_volumes(&h).await;

    let options = DeleteOptions {
        delete_volumes: false,
        release_floating_ips: false,
    };
    let outcome = h
        .executor
        .request_delete(&instance.id, options)
        .await
        .unwrap()
        .wait()
        .await;
    assert!(outcome.is_ok(), "{:?}", outcome.result);

    let names = h.backend.call_names();
    assert_eq!(names[0], "detach_volume");
    assert!(names.contains(&"delete_instance".to_string()));
    assert_eq!(h.backend.calls_of(BackendMethod::Delete(ResourceKind::Volume)).len(), 1);

    assert!(h.get(&instance.id).await.is_none());
    assert!(h.get(&system.id).await.is_none());
    let data = h.get(&data.id).await.unwrap();
    assert_eq!(data.parent_id, None);
    assert_eq!(data.state, ResourceState::Ok);
}

#[tokio::test(start_paused = true)]
async fn test_instance_delete_removes_all_volumes_by_default() {
    let h = harness();
    let (instance, system, data) = instance_with_volumes(&h).await;

    let outcome = h
        .executor
        .request_delete(&instance.id, DeleteOptions::default())
        .await
        .unwrap()
        .wait()
        .await;
    assert!(outcome.is_ok(), "{:?}", outcome.result);

    assert!(h.backend.calls_of(BackendMethod::DetachVolume).is_empty());
    assert_eq!(h.backend.calls_of(BackendMethod::Delete(ResourceKind::Volume)).len(), 2);
    assert!(h.get(&system.id).await.is_none());
    assert!(h.get(&data.id).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_tenant_delete_cleans_scope_in_dependency_order() {
    let h = harness();
    let record = tenant("acme");
    let id = record.id.clone();
    h.executor
        .request_create(record, CreateOptions::default())
        .await
        .unwrap()
        .wait()
        .await;
    let calls_before = h.backend.calls().len();

    let outcome = h
        .executor
        .request_delete(&id, DeleteOptions::default())
        .await
        .unwrap()
        .wait()
        .await;
    assert!(outcome.is_ok(), "{:?}", outcome.result);

    let names: Vec<String> = h.backend.call_names().split_off(calls_before);
    assert_eq!(
        names,
        vec![
            "delete_subnet",
            "pull_subnet",
            "delete_network",
            "pull_network",
            "delete_tenant",
            "pull_tenant",
        ]
    );
    assert!(h.get(&id).await.is_none());
    assert!(h.store.list(ResourceKind::Network, &id).await.unwrap().is_empty());

    let scope = QuotaScope::tenant(id.clone());
    assert_eq!(h.ledger.usage(&scope, "network_count").await, 0);
    assert_eq!(h.ledger.usage(&scope, "subnet_count").await, 0);
}
