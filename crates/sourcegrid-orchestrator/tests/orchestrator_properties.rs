//! End-to-end behaviour of the orchestrator against an in-memory fleet.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sourcegrid_dispatch::{DispatchConfig, InMemoryWorkers, Verb};
use sourcegrid_lifecycle::{Action, InstanceReport, LifecycleConfig, OutcomeError};
use sourcegrid_orchestrator::{
    Orchestrator, OrchestratorConfig, OrchestratorError, StaticCatalog, UpdateOptions,
};
use sourcegrid_rollout::RollingConfig;
use sourcegrid_state::{
    ConnectorDefinition, ConnectorType, DefinitionId, InstanceKey, InstanceState, ReportedState,
    ResourceLimits, StateStore, WorkerInstanceStatus, WorkerNode,
};
use sourcegrid_status::StatusConfig;

struct Cluster {
    orch: Orchestrator,
    workers: Arc<InMemoryWorkers>,
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        dispatch: DispatchConfig {
            call_timeout: Duration::from_millis(100),
            max_idempotent_retries: 1,
            max_start_retries: 0,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            ..DispatchConfig::default()
        },
        lifecycle: LifecycleConfig::default(),
        status: StatusConfig {
            aggregation_deadline: Duration::from_millis(500),
        },
        rollout: RollingConfig {
            batch_size: 1,
            max_unavailable_fraction: 1.0,
            health_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(10),
        },
    }
}

fn catalog() -> StaticCatalog {
    StaticCatalog::new(vec![
        ConnectorType {
            name: "gen".to_string(),
            description: "synthetic records".to_string(),
            source_class: Some("org.example.GenSource".to_string()),
            sink_class: None,
            archive: None,
        },
        ConnectorType {
            name: "jdbc-sink".to_string(),
            description: "writes rows".to_string(),
            source_class: None,
            sink_class: Some("org.example.JdbcSink".to_string()),
            archive: None,
        },
    ])
}

fn cluster(nodes: &[&str]) -> Cluster {
    let workers = Arc::new(InMemoryWorkers::new());
    for id in nodes {
        workers.add_node(WorkerNode::new(
            id,
            "127.0.0.1",
            7000,
            ResourceLimits::new(16.0, 64 << 30, 1 << 40),
        ));
    }
    let orch = Orchestrator::new(
        StateStore::open_in_memory().unwrap(),
        workers.clone(),
        workers.clone(),
        Arc::new(catalog()),
        config(),
    );
    Cluster { orch, workers }
}

fn id(name: &str) -> DefinitionId {
    DefinitionId::new("t1", "ns1", name)
}

fn definition(name: &str, parallelism: u32) -> ConnectorDefinition {
    ConnectorDefinition::new(
        id(name),
        "org.example.GenSource",
        "builtin://gen",
        "persistent://t1/ns1/out",
        parallelism,
    )
}

impl Cluster {
    async fn register(&self, def: &ConnectorDefinition) {
        self.orch.register(&def.id, def.clone(), None).await.unwrap();
    }

    fn placement(&self, id: &DefinitionId) -> BTreeMap<u32, String> {
        self.orch
            .store()
            .list_instances(id)
            .unwrap()
            .into_iter()
            .map(|r| (r.ordinal, r.node_id.unwrap_or_default()))
            .collect()
    }

    fn states(&self, id: &DefinitionId) -> Vec<InstanceState> {
        self.orch
            .store()
            .list_instances(id)
            .unwrap()
            .into_iter()
            .map(|r| r.state)
            .collect()
    }
}

// ── Definitions ──────────────────────────────────────────────────

#[tokio::test]
async fn register_then_get_info_returns_definition_at_version_one() {
    let c = cluster(&["node-a"]);
    let def = definition("src1", 1);
    c.register(&def).await;

    let info = c.orch.get_info(&def.id).unwrap();
    let mut expected = def.clone();
    expected.version = 1;
    expected.created_at = info.created_at;
    expected.updated_at = info.updated_at;
    assert_eq!(info, expected);
}

#[tokio::test]
async fn duplicate_and_invalid_registrations_rejected() {
    let c = cluster(&["node-a"]);
    let def = definition("src1", 1);
    c.register(&def).await;

    let err = c.orch.register(&def.id, def.clone(), None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyExists(_)));

    let mut bad = definition("src2", 1);
    bad.parallelism = 0;
    let err = c.orch.register(&bad.id.clone(), bad, None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidConfig(_)));

    let mismatched = definition("src3", 1);
    let err = c.orch.register(&id("other"), mismatched, None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidConfig(_)));

    let mut sink = definition("src4", 1);
    sink.implementation.class_name = None;
    sink.implementation.archive = Some("builtin://jdbc-sink".to_string());
    let err = c.orch.register(&sink.id.clone(), sink, None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidConfig(_)));

    // Nothing was stored for the rejected ones.
    assert_eq!(c.orch.list("t1", "ns1").unwrap(), vec!["src1".to_string()]);
}

#[tokio::test]
async fn builtin_package_fills_missing_class() {
    let c = cluster(&["node-a"]);
    let mut def = definition("src1", 1);
    def.implementation.class_name = None;
    c.orch
        .register(&def.id, def.clone(), Some("builtin://gen"))
        .await
        .unwrap();
    let info = c.orch.get_info(&def.id).unwrap();
    assert_eq!(info.implementation.class_name.as_deref(), Some("org.example.GenSource"));
}

#[tokio::test]
async fn register_without_capacity_still_succeeds() {
    let c = cluster(&[]);
    let def = definition("src1", 2);
    c.register(&def).await;
    assert_eq!(c.states(&def.id), vec![InstanceState::Pending; 2]);

    c.workers.add_node(WorkerNode::new("node-a", "127.0.0.1", 7000, ResourceLimits::new(16.0, 64 << 30, 1 << 40)));
    c.orch.reconcile_all().await;
    assert_eq!(c.states(&def.id), vec![InstanceState::Running; 2]);
}

#[tokio::test]
async fn update_bumps_version_by_one() {
    let c = cluster(&["node-a", "node-b"]);
    let def = definition("src1", 2);
    c.register(&def).await;

    let mut next = c.orch.get_info(&def.id).unwrap();
    next.parallelism = 3;
    next.configs.insert("pollIntervalMs".into(), serde_json::json!(250));
    let report = c.orch.update(&def.id, next, UpdateOptions::default()).await.unwrap();
    assert!(report.completed());
    assert_eq!((report.from_version, report.to_version), (1, 2));

    let info = c.orch.get_info(&def.id).unwrap();
    assert_eq!(info.version, 2);
    assert_eq!(info.parallelism, 3);
    let records = c.orch.store().list_instances(&def.id).unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.config_version == 2 && r.state == InstanceState::Running));
}

#[tokio::test]
async fn update_failure_modes() {
    let c = cluster(&["node-a"]);
    let def = definition("src1", 1);
    c.register(&def).await;
    let current = c.orch.get_info(&def.id).unwrap();

    let err = c
        .orch
        .update(&def.id, current.clone(), UpdateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidUpdate(_)));

    let mut changed = current.clone();
    changed.parallelism = 2;
    let stale = UpdateOptions {
        expected_version: Some(7),
        ..UpdateOptions::default()
    };
    let err = c.orch.update(&def.id, changed.clone(), stale).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::VersionConflict { expected: 7, actual: 1 }
    ));

    let mut unknown = changed.clone();
    unknown.id = id("missing");
    let err = c
        .orch
        .update(&id("missing"), unknown, UpdateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));

    // Rejected updates leave the stored definition untouched.
    assert_eq!(c.orch.get_info(&def.id).unwrap().version, 1);
}

#[tokio::test]
async fn forced_update_restarts_unchanged_instances() {
    let c = cluster(&["node-a"]);
    let def = definition("src1", 2);
    c.register(&def).await;

    let current = c.orch.get_info(&def.id).unwrap();
    let options = UpdateOptions {
        force_restart: true,
        ..UpdateOptions::default()
    };
    let report = c.orch.update(&def.id, current, options).await.unwrap();
    assert_eq!(report.restarted.len(), 2);
    assert_eq!(c.workers.count(Verb::Restart), 2);
}

#[tokio::test]
async fn scale_down_removes_highest_ordinals_first() {
    let c = cluster(&["node-a", "node-b"]);
    let def = definition("src1", 4);
    c.register(&def).await;
    let before = c.placement(&def.id);
    c.workers.clear_log();

    let mut next = c.orch.get_info(&def.id).unwrap();
    next.parallelism = 2;
    let report = c.orch.update(&def.id, next, UpdateOptions::default()).await.unwrap();

    let removed: Vec<u32> = report.removed.iter().map(|o| o.ordinal).collect();
    assert_eq!(removed, vec![3, 2]);
    let stops: Vec<u32> = c
        .workers
        .command_log()
        .into_iter()
        .filter(|s| s.verb == Verb::Stop)
        .map(|s| s.target.ordinal)
        .collect();
    assert_eq!(stops, vec![3, 2]);

    let after = c.placement(&def.id);
    assert_eq!(after.len(), 2);
    for (ordinal, node) in &after {
        assert_eq!(before.get(ordinal), Some(node));
    }
    assert_eq!(c.workers.count(Verb::Restart), 0);
}

#[tokio::test]
async fn scale_up_creates_instances_that_reach_running() {
    let c = cluster(&["node-a", "node-b"]);
    let def = definition("src1", 2);
    c.register(&def).await;

    let mut next = c.orch.get_info(&def.id).unwrap();
    next.parallelism = 5;
    let report = c.orch.update(&def.id, next, UpdateOptions::default()).await.unwrap();
    assert_eq!(report.created.len(), 3);
    assert!(report.created.iter().all(|o| o.is_ok()));
    assert_eq!(c.states(&def.id), vec![InstanceState::Running; 5]);

    let status = c.orch.get_status(&def.id).await.unwrap();
    assert!(status.healthy);
    assert_eq!(status.num_running, 5);
}

#[tokio::test]
async fn deregister_stops_and_removes_every_instance() {
    let c = cluster(&["node-a", "node-b"]);
    let def = definition("src1", 3);
    c.register(&def).await;
    assert_eq!(c.workers.running_instances().len(), 3);

    let report = c.orch.deregister(&def.id).await.unwrap();
    assert_eq!(report.removed, 3);
    assert!(report.unconfirmed.is_empty());

    assert!(c.orch.store().list_instances(&def.id).unwrap().is_empty());
    assert!(c.workers.running_instances().is_empty());
    assert!(matches!(
        c.orch.get_info(&def.id),
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(matches!(
        c.orch.deregister(&def.id).await,
        Err(OrchestratorError::NotFound(_))
    ));
}

#[tokio::test]
async fn deregister_succeeds_with_an_unreachable_worker() {
    let c = cluster(&["node-a", "node-b"]);
    let def = definition("src1", 2);
    c.register(&def).await;
    c.workers.set_unreachable("node-b", true);

    let report = c.orch.deregister(&def.id).await.unwrap();
    assert!(c.orch.store().list_instances(&def.id).unwrap().is_empty());
    assert_eq!(report.removed, 2);

    // The stop never reached node-b, so its instance may still be running.
    assert_eq!(report.unconfirmed.len(), 1);
    let unconfirmed = &report.unconfirmed[0];
    assert_eq!(unconfirmed.ordinal, 1);
    assert_eq!(unconfirmed.node_id.as_deref(), Some("node-b"));
    assert_eq!(unconfirmed.action, Action::Remove);
    assert!(matches!(unconfirmed.error, Some(OutcomeError::Unreachable(_))));
    assert_eq!(c.workers.running_instances().len(), 1);
}

// ── Concurrency ──────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_updates_on_one_identity_serialize() {
    let c = cluster(&["node-a"]);
    let def = definition("src1", 1);
    c.register(&def).await;

    let base = c.orch.get_info(&def.id).unwrap();
    let mut tasks = Vec::new();
    for value in [100, 200] {
        let orch = c.orch.clone();
        let mut next = base.clone();
        next.configs.insert("batch".into(), serde_json::json!(value));
        tasks.push(tokio::spawn(async move {
            orch.update(&next.id.clone(), next, UpdateOptions::default()).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let info = c.orch.get_info(&def.id).unwrap();
    assert_eq!(info.version, 3);
    let record = c.orch.store().list_instances(&def.id).unwrap().remove(0);
    assert_eq!(record.config_version, 3);
    assert_eq!(record.config_digest, info.config_digest());
}

#[tokio::test]
async fn concurrent_updates_from_the_same_base_lose_one() {
    let c = cluster(&["node-a"]);
    let def = definition("src1", 1);
    c.register(&def).await;

    let base = c.orch.get_info(&def.id).unwrap();
    let mut tasks = Vec::new();
    for value in [100, 200] {
        let orch = c.orch.clone();
        let mut next = base.clone();
        next.configs.insert("batch".into(), serde_json::json!(value));
        let options = UpdateOptions {
            expected_version: Some(base.version),
            ..UpdateOptions::default()
        };
        tasks.push(tokio::spawn(async move {
            orch.update(&next.id.clone(), next, options).await
        }));
    }
    let mut ok = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(OrchestratorError::VersionConflict { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((ok, conflicts), (1, 1));
    assert_eq!(c.orch.get_info(&def.id).unwrap().version, 2);
}

// ── Placement and status ─────────────────────────────────────────

#[tokio::test]
async fn three_instances_on_two_nodes() {
    let c = cluster(&["node-a", "node-b"]);
    let def = definition("src1", 3);
    c.register(&def).await;

    let placement = c.placement(&def.id);
    assert_eq!(placement[&0], "node-a");
    assert_eq!(placement[&1], "node-a");
    assert_eq!(placement[&2], "node-b");

    let status = c.orch.get_status(&def.id).await.unwrap();
    assert!(status.healthy);
    assert_eq!(status.num_running, 3);
    assert_eq!(status.version, 1);
}

#[tokio::test]
async fn status_tolerates_one_unresponsive_worker() {
    let c = cluster(&["node-a", "node-b", "node-c"]);
    let def = definition("src1", 3);
    c.register(&def).await;
    let placement = c.placement(&def.id);
    let silent = placement[&1].clone();
    c.workers.set_hanging(&silent, true);

    let started = Instant::now();
    let status = c.orch.get_status(&def.id).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    let states: Vec<ReportedState> = status.instances.iter().map(|e| e.state).collect();
    assert_eq!(
        states,
        vec![ReportedState::Running, ReportedState::Unknown, ReportedState::Running]
    );
    assert_eq!(status.num_running, 2);
    assert!(!status.healthy);

    let err = c.orch.get_instance_status(&def.id, 1).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Unreachable(_)));
    let entry = c.orch.get_instance_status(&def.id, 0).await.unwrap();
    assert_eq!(entry.state, ReportedState::Running);
}

#[tokio::test]
async fn instance_status_out_of_range_is_not_found() {
    let c = cluster(&["node-a"]);
    let def = definition("src1", 1);
    c.register(&def).await;
    assert!(matches!(
        c.orch.get_instance_status(&def.id, 5).await,
        Err(OrchestratorError::NotFound(_))
    ));
}

#[tokio::test]
async fn reconciliation_is_idempotent() {
    let c = cluster(&["node-a", "node-b"]);
    let def = definition("src1", 3);
    c.register(&def).await;
    c.workers.clear_log();

    c.orch.reconcile_all().await;
    c.orch.reconcile_all().await;
    assert!(c.workers.command_log().is_empty());
}

#[tokio::test]
async fn lost_node_is_rescheduled_by_the_loop() {
    let c = cluster(&["node-a", "node-b"]);
    let def = definition("src1", 2);
    c.register(&def).await;
    let placement = c.placement(&def.id);
    let lost = placement[&1].clone();

    c.workers.kill_node(&lost);
    c.orch.reconcile_all().await;

    let after = c.placement(&def.id);
    assert!(after.values().all(|n| n != &lost));
    assert_eq!(c.states(&def.id), vec![InstanceState::Running; 2]);
}

// ── Operator verbs ───────────────────────────────────────────────

#[tokio::test]
async fn stop_and_start_single_instance() {
    let c = cluster(&["node-a"]);
    let def = definition("src1", 2);
    c.register(&def).await;

    c.orch.stop_instance(&def.id, 1).await.unwrap();
    assert_eq!(
        c.states(&def.id),
        vec![InstanceState::Running, InstanceState::Stopped]
    );

    // The loop leaves operator-stopped instances alone.
    c.orch.reconcile_all().await;
    assert_eq!(c.states(&def.id)[1], InstanceState::Stopped);

    c.orch.start_instance(&def.id, 1).await.unwrap();
    assert_eq!(c.states(&def.id), vec![InstanceState::Running; 2]);

    assert!(matches!(
        c.orch.start_instance(&def.id, 9).await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(matches!(
        c.orch.stop_instance(&id("missing"), 0).await,
        Err(OrchestratorError::NotFound(_))
    ));
}

#[tokio::test]
async fn restart_instance_on_unreachable_worker_fails() {
    let c = cluster(&["node-a"]);
    let def = definition("src1", 1);
    c.register(&def).await;
    c.workers.set_unreachable("node-a", true);

    let err = c.orch.restart_instance(&def.id, 0).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Unreachable(_)));
}

#[tokio::test]
async fn bulk_verbs_report_partial_failure() {
    let c = cluster(&["node-a", "node-b"]);
    let def = definition("src1", 3);
    c.register(&def).await;

    c.orch.stop_all(&def.id).await.unwrap();
    assert_eq!(c.states(&def.id), vec![InstanceState::Stopped; 3]);

    c.workers.reject_starts("node-b", Some("out of file handles"));
    let err = c.orch.start_all(&def.id).await.unwrap_err();
    match err {
        OrchestratorError::PartialFailure(outcomes) => {
            assert_eq!(outcomes.len(), 3);
            let failed: Vec<u32> = outcomes
                .iter()
                .filter(|o| !o.is_ok())
                .map(|o| o.ordinal)
                .collect();
            assert_eq!(failed, vec![2]);
        }
        other => panic!("expected partial failure, got {other}"),
    }

    c.workers.reject_starts("node-b", None);
    c.orch.restart_all(&def.id).await.unwrap();
    assert_eq!(c.states(&def.id), vec![InstanceState::Running; 3]);
}

// ── Reports and catalog ──────────────────────────────────────────

#[tokio::test]
async fn worker_reports_are_applied_to_owned_instances() {
    let c = cluster(&["node-a", "node-b"]);
    let def = definition("src1", 3);
    c.register(&def).await;

    let report = |ordinal| InstanceReport {
        tenant: "t1".to_string(),
        namespace: "ns1".to_string(),
        name: "src1".to_string(),
        ordinal,
        status: WorkerInstanceStatus {
            running: true,
            config_version: 1,
            ..WorkerInstanceStatus::default()
        },
    };

    // node-a owns ordinals 0 and 1, not 2.
    let applied = c
        .orch
        .observe("node-a", &[report(0), report(1), report(2)])
        .await
        .unwrap();
    assert_eq!(applied, 2);

    let crashed = InstanceReport {
        status: WorkerInstanceStatus {
            running: false,
            last_error: Some("connection reset".to_string()),
            ..WorkerInstanceStatus::default()
        },
        ..report(2)
    };
    assert_eq!(c.orch.observe("node-b", &[crashed]).await.unwrap(), 1);
    let record = c
        .orch
        .store()
        .get_instance(&InstanceKey::new(&def.id, 2))
        .unwrap()
        .unwrap();
    assert_eq!(record.state, InstanceState::Failed);
}

#[tokio::test]
async fn list_and_connector_types() {
    let c = cluster(&["node-a"]);
    c.register(&definition("alpha", 1)).await;
    c.register(&definition("beta", 1)).await;
    let mut other = definition("gamma", 1);
    other.id = DefinitionId::new("t1", "ns2", "gamma");
    c.orch.register(&other.id.clone(), other, None).await.unwrap();

    let mut names = c.orch.list("t1", "ns1").unwrap();
    names.sort();
    assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
    assert!(c.orch.list("t2", "ns1").unwrap().is_empty());

    let types = c.orch.list_connector_types();
    assert_eq!(types.len(), 1);
    assert_eq!(types[0].name, "gen");
}
