mod common;

use common::{config, harness, harness_with, network, tenant};
use mbroker_core::{
    BackendError, CoreError, DefaultSecurityGroup, Event, FloatingIpSpec, InstanceSpec,
    QuotaScope, RemoteResource, ResourceKind, ResourceRecord, ResourceSpec, ResourceState,
    ResourceStore, SecurityGroupRule,
};
use mbroker_engine::{BackendMethod, ChainError, CreateOptions};

#[tokio::test(start_paused = true)]
async fn test_tenant_create_runs_six_backend_calls() {
    let h = harness();
    let record = tenant("acme");
    let id = record.id.clone();

    let outcome = h
        .executor
        .request_create(record, CreateOptions::default())
        .await
        .unwrap()
        .wait()
        .await;
    assert!(outcome.is_ok(), "{:?}", outcome.result);

    assert_eq!(
        h.backend.call_names(),
        vec![
            "create_tenant",
            "add_admin_user_to_tenant",
            "create_tenant_user",
            "create_network",
            "create_subnet",
            "push_tenant_quotas",
        ]
    );
    assert!(h.backend.list_calls().is_empty());

    let tenant = h.get(&id).await.unwrap();
    assert_eq!(tenant.state, ResourceState::Ok);
    assert!(tenant.backend_id.is_some());

    let networks = h.store.list(ResourceKind::Network, &id).await.unwrap();
    assert_eq!(networks.len(), 1);
    assert_eq!(networks[0].name, "acme-int-net");
    assert_eq!(networks[0].state, ResourceState::Ok);

    let subnets = h.store.list(ResourceKind::Subnet, &id).await.unwrap();
    assert_eq!(subnets.len(), 1);
    assert_eq!(subnets[0].parent_id.as_deref(), Some(networks[0].id.as_str()));
    assert_eq!(subnets[0].state, ResourceState::Ok);

    // the subnet is created inside the network that was just created
    let subnet_call = &h.backend.calls_of(BackendMethod::Create(ResourceKind::Subnet))[0];
    assert_eq!(
        subnet_call.args["parent_backend_id"].as_str(),
        networks[0].backend_id.as_deref()
    );

    let scope = QuotaScope::tenant(id.clone());
    assert_eq!(h.ledger.usage(&scope, "network_count").await, 1);
    assert_eq!(h.ledger.usage(&scope, "subnet_count").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_tenant_create_with_external_network_and_groups() {
    let mut config = config();
    config.external_network_id = Some("ext-net".into());
    config.default_security_groups = vec![DefaultSecurityGroup {
        name: "ssh".into(),
        description: "ssh access".into(),
        rules: vec![SecurityGroupRule {
            direction: "ingress".into(),
            ethertype: "IPv4".into(),
            protocol: Some("tcp".into()),
            from_port: Some(22),
            to_port: Some(22),
            ..Default::default()
        }],
    }];
    let h = harness_with(config);

    // the first create call hands out this id
    h.backend.put_remote(
        RemoteResource::new(
            "fip-remote",
            "",
            ResourceSpec::FloatingIp(FloatingIpSpec {
                address: Some("203.0.113.7".into()),
                backend_network_id: "ext-net".into(),
                port_backend_id: None,
            }),
        )
        .with_scope("tenant-1"),
    );

    let record = tenant("acme");
    let id = record.id.clone();
    let options = CreateOptions {
        pull_security_groups: true,
        ..Default::default()
    };
    let outcome = h
        .executor
        .request_create(record, options)
        .await
        .unwrap()
        .wait()
        .await;
    assert!(outcome.is_ok(), "{:?}", outcome.result);

    let names = h.backend.call_names();
    assert_eq!(&names[5..], [
        "push_tenant_quotas",
        "connect_tenant_to_external_network",
        "create_security_group",
        "set_security_group_rules",
    ]);
    assert_eq!(
        h.backend.calls_of(BackendMethod::ConnectTenantToExternalNetwork)[0].args["external_network_id"],
        "ext-net"
    );
    let lists: Vec<ResourceKind> = h.backend.list_calls().into_iter().map(|(k, _)| k).collect();
    assert_eq!(lists, vec![ResourceKind::FloatingIp, ResourceKind::SecurityGroup]);

    let fips = h.store.list(ResourceKind::FloatingIp, &id).await.unwrap();
    assert_eq!(fips.len(), 1);
    assert_eq!(fips[0].state, ResourceState::Ok);

    let groups = h.store.list(ResourceKind::SecurityGroup, &id).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].name, "ssh");
    assert_eq!(groups[0].state, ResourceState::Ok);
}

#[tokio::test(start_paused = true)]
async fn test_failed_tenant_create_leaves_no_orphans() {
    let mut h = harness();
    h.backend.fail(
        BackendMethod::Create(ResourceKind::Subnet),
        BackendError::other("subnet quota exhausted"),
    );
    let record = tenant("acme");
    let id = record.id.clone();

    let outcome = h
        .executor
        .request_create(record, CreateOptions::default())
        .await
        .unwrap()
        .wait()
        .await;
    assert!(matches!(outcome.result, Err(ChainError::Backend { .. })));

    let tenant = h.get(&id).await.unwrap();
    assert_eq!(tenant.state, ResourceState::Erred);
    assert!(
        tenant
            .error_message
            .as_deref()
            .unwrap()
            .contains("subnet quota exhausted")
    );

    // created remotely, so kept and flagged
    let networks = h.store.list(ResourceKind::Network, &id).await.unwrap();
    assert_eq!(networks.len(), 1);
    assert_eq!(networks[0].state, ResourceState::Erred);
    assert!(networks[0].backend_id.is_some());

    // never reached the backend, so dropped
    assert!(h.store.list(ResourceKind::Subnet, &id).await.unwrap().is_empty());

    let scope = QuotaScope::tenant(id.clone());
    assert_eq!(h.ledger.usage(&scope, "network_count").await, 1);
    assert_eq!(h.ledger.usage(&scope, "subnet_count").await, 0);

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(e, Event::Erred { resource, .. } if resource.id == id)));
    assert!(!events.iter().any(|e| matches!(e, Event::Created(_))));
}

#[tokio::test(start_paused = true)]
async fn test_quota_rejection_happens_before_anything_is_scheduled() {
    let h = harness();
    let record = tenant("acme");
    let id = record.id.clone();
    h.ledger
        .set_limit(&QuotaScope::tenant(id.clone()), "subnet_count", Some(0))
        .await;

    let result = h
        .executor
        .request_create(record, CreateOptions::default())
        .await;
    assert!(matches!(result, Err(mbroker_core::CoreError::QuotaExceeded(_))));

    assert!(h.get(&id).await.is_none());
    assert!(h.backend.calls().is_empty());
    assert_eq!(
        h.ledger
            .usage(&QuotaScope::tenant(id.clone()), "network_count")
            .await,
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_project_and_customer_limits_cover_tenant_resources() {
    let mut config = config();
    config
        .project_customers
        .insert("project-1".into(), "customer-1".into());
    let h = harness_with(config);
    let record = tenant("acme");
    let id = record.id.clone();
    let outcome = h
        .executor
        .request_create(record, CreateOptions::default())
        .await
        .unwrap()
        .wait()
        .await;
    assert!(outcome.is_ok(), "{:?}", outcome.result);

    // the tenant's network and subnet count against the project
    let project = QuotaScope::project("project-1");
    h.ledger.set_limit(&project, "cores", Some(2)).await;
    let vm = ResourceRecord::new(
        id.clone(),
        "vm",
        ResourceSpec::Instance(InstanceSpec {
            cores: 8,
            ram_mb: 1024,
            ..Default::default()
        }),
    );
    let vm_id = vm.id.clone();
    let result = h.executor.request_create(vm, CreateOptions::default()).await;
    let Err(CoreError::QuotaExceeded(e)) = result else {
        panic!("8 cores accepted in a project limited to 2");
    };
    assert_eq!(e.scope, project);
    assert_eq!(e.name, "cores");
    assert!(h.get(&vm_id).await.is_none());
    assert_eq!(h.ledger.usage(&QuotaScope::tenant(id.clone()), "cores").await, 0);
    assert_eq!(h.ledger.usage(&project, "cores").await, 0);

    h.ledger
        .set_limit(&QuotaScope::customer("customer-1"), "network_count", Some(0))
        .await;
    let result = h
        .executor
        .request_create(network(&id, "extra"), CreateOptions::default())
        .await;
    let Err(CoreError::QuotaExceeded(e)) = result else {
        panic!("network accepted over the customer limit");
    };
    assert_eq!(e.scope, QuotaScope::customer("customer-1"));
}

#[tokio::test(start_paused = true)]
async fn test_holds_are_confirmed_when_chain_settles() {
    let h = harness();
    let record = tenant("acme");
    let id = record.id.clone();
    h.executor
        .request_create(record, CreateOptions::default())
        .await
        .unwrap()
        .wait()
        .await;

    let scope = QuotaScope::tenant(id.clone());
    let quota = h.ledger.get(&scope, "network_count").await.unwrap();
    assert_eq!((quota.usage, quota.held), (1, 0));

    // a backend report after the chain is taken verbatim
    h.ledger.pull_usage(&scope, "network_count", 1).await;
    assert_eq!(h.ledger.usage(&scope, "network_count").await, 1);
}
