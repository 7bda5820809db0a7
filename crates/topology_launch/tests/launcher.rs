//! Launcher behaviour against an in-memory runtime and real processes

mod common;

use common::{load, Call, FakeRuntime, ANCHORE_TOPOLOGY};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use topology_launch::{
    LaunchError, Launcher, LauncherConfig, ProcessRuntime, ServiceLaunchError, ServiceState,
};

fn config() -> LauncherConfig {
    LauncherConfig {
        project_name: "anchore".to_string(),
        shutdown_timeout: Duration::from_secs(5),
        restart_delay: Duration::ZERO,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_dependencies_start_before_dependents() {
    let topology = load(ANCHORE_TOPOLOGY);
    let runtime = Arc::new(FakeRuntime::new().with_start_delay(Duration::from_millis(20)));
    let launcher = Launcher::new(runtime.clone(), config());

    let running = launcher.start(&topology).await.unwrap();

    assert_eq!(running.len(), 6);
    assert_eq!(running.started_count(), 6);
    assert_eq!(running.start_order()[0], "anchore-db");
    assert_eq!(running.start_order()[1], "catalog");

    // Every dependency finished starting before its dependent was asked to start
    for spec in topology.services.values() {
        let begin = runtime
            .log
            .position(&Call::StartBegin(spec.name.clone()))
            .unwrap();
        for dep in &spec.depends_on {
            let end = runtime.log.position(&Call::StartEnd(dep.clone())).unwrap();
            assert!(end < begin, "{} started before {} was up", spec.name, dep);
        }
    }
}

#[tokio::test]
async fn test_independent_services_start_concurrently() {
    let topology = load(ANCHORE_TOPOLOGY);
    let runtime = Arc::new(FakeRuntime::new().with_start_delay(Duration::from_millis(50)));
    let launcher = Launcher::new(runtime.clone(), config());

    launcher.start(&topology).await.unwrap();

    // api, queue, policy-engine and analyzer only wait for the database and catalog
    assert_eq!(runtime.max_concurrent_starts(), 4);
}

#[tokio::test]
async fn test_failed_start_leaves_started_services_running() {
    let topology = load(ANCHORE_TOPOLOGY);
    let runtime = Arc::new(FakeRuntime::new().failing("catalog"));
    let launcher = Launcher::new(runtime.clone(), config());

    let (failures, mut running) = match launcher.start(&topology).await {
        Err(LaunchError::Partial { failures, running }) => (failures, running),
        other => panic!("expected partial launch, got {:?}", other.map(|_| ())),
    };

    assert_eq!(failures.len(), 5);
    assert!(matches!(
        &failures[0],
        ServiceLaunchError::Runtime { service, .. } if service == "catalog"
    ));
    for failure in &failures[1..] {
        assert!(matches!(
            failure,
            ServiceLaunchError::DependencyFailed { dependency, .. } if dependency == "catalog"
        ));
    }

    // Nothing is rolled back and nothing downstream was attempted
    assert_eq!(running.state("anchore-db"), Some(ServiceState::Started));
    assert_eq!(running.state("catalog"), Some(ServiceState::Crashed(None)));
    assert_eq!(running.state("api"), Some(ServiceState::Pending));
    assert_eq!(runtime.log.started(), vec!["anchore-db"]);
    assert!(runtime.log.position(&Call::StartBegin("api".to_string())).is_none());
    assert!(runtime.log.stopped().is_empty());

    running.stop().await;
    assert_eq!(runtime.log.stopped(), vec!["anchore-db"]);
    assert_eq!(running.started_count(), 0);
}

#[tokio::test]
async fn test_stop_runs_in_reverse_dependency_order() {
    let topology = load(ANCHORE_TOPOLOGY);
    let runtime = Arc::new(FakeRuntime::new());
    let launcher = Launcher::new(runtime.clone(), config());

    let mut running = launcher.start(&topology).await.unwrap();
    running.stop().await;

    assert_eq!(
        runtime.log.stopped(),
        vec!["analyzer", "policy-engine", "queue", "api", "catalog", "anchore-db"]
    );
    for status in running.status() {
        assert_eq!(status.state, ServiceState::Stopped, "{}", status.name);
    }
    assert!(!running.has_live_services());
}

#[tokio::test]
async fn test_selected_services_only() {
    let topology = load(ANCHORE_TOPOLOGY);
    let runtime = Arc::new(FakeRuntime::new());
    let launcher = Launcher::new(
        runtime.clone(),
        LauncherConfig {
            services: vec!["queue".to_string()],
            ..config()
        },
    );

    let running = launcher.start(&topology).await.unwrap();
    assert_eq!(running.start_order(), ["anchore-db", "catalog", "queue"]);
    assert_eq!(running.state("api"), None);
}

#[tokio::test]
async fn test_unknown_selected_service() {
    let topology = load(ANCHORE_TOPOLOGY);
    let launcher = Launcher::new(
        Arc::new(FakeRuntime::new()),
        LauncherConfig {
            services: vec!["scanner".to_string()],
            ..config()
        },
    );

    assert!(matches!(
        launcher.start(&topology).await,
        Err(LaunchError::Order(_))
    ));
}

#[tokio::test]
async fn test_on_failure_policy_restarts_crashed_service() {
    let topology = load(&ANCHORE_TOPOLOGY.replace(
        "    command: [\"anchore-manager\", \"service\", \"start\", \"simplequeue\"]\n",
        "    command: [\"anchore-manager\", \"service\", \"start\", \"simplequeue\"]\n    restart: on-failure\n",
    ));
    let runtime = Arc::new(FakeRuntime::new().exiting("queue", 1).exiting("analyzer", 1));
    let launcher = Launcher::new(runtime.clone(), config());

    let mut running = launcher.start(&topology).await.unwrap();
    running.poll().await;

    assert_eq!(runtime.log.start_count("queue"), 2);
    assert_eq!(running.state("queue"), Some(ServiceState::Started));
    let queue = running
        .status()
        .into_iter()
        .find(|s| s.name == "queue")
        .unwrap();
    assert_eq!(queue.restart_count, 1);

    // No restart policy: the crash is final
    assert_eq!(runtime.log.start_count("analyzer"), 1);
    assert_eq!(running.state("analyzer"), Some(ServiceState::Crashed(Some(1))));

    running.stop().await;
}

#[cfg(unix)]
mod process_runtime {
    use super::*;
    use topology_launch::{InterpolationContext, Topology};

    fn topology(command: &str) -> Topology {
        let source = format!(
            r#"
shared:
  environment:
    GREETING: hello
services:
  worker:
    image: local
    command: ["sh", "-c", "{}"]
"#,
            command
        );
        Topology::load_with(&source, &InterpolationContext::isolated()).unwrap()
    }

    #[tokio::test]
    async fn test_process_is_stopped_on_shutdown() {
        let topology = topology("exec sleep 30");
        let launcher = Launcher::new(Arc::new(ProcessRuntime::new()), config());

        let mut running = launcher.start(&topology).await.unwrap();
        assert_eq!(running.state("worker"), Some(ServiceState::Started));
        assert!(running.status()[0].container.as_deref().unwrap().starts_with("pid:"));

        let started = std::time::Instant::now();
        running.stop().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(running.state("worker"), Some(ServiceState::Stopped));
    }

    #[tokio::test]
    async fn test_supervise_returns_when_everything_exited() {
        let topology = topology("test $$GREETING = hello && exit 3");
        let launcher = Launcher::new(Arc::new(ProcessRuntime::new()), config());
        let (_shutdown_tx, shutdown_rx) = watch::channel(());

        let mut running = launcher.start(&topology).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), running.supervise(shutdown_rx))
            .await
            .unwrap();

        assert_eq!(running.state("worker"), Some(ServiceState::Crashed(Some(3))));
        assert!(!running.has_live_services());
    }

    #[tokio::test]
    async fn test_exit_detected_while_sibling_keeps_logging() {
        let topology = Topology::load_with(
            r#"
services:
  chatty:
    image: local
    command: ["sh", "-c", "while true; do echo tick; sleep 0.05; done"]
  worker:
    image: local
    command: ["sh", "-c", "exit 3"]
"#,
            &InterpolationContext::isolated(),
        )
        .unwrap();
        let launcher = Launcher::new(Arc::new(ProcessRuntime::new()), config());
        let (_shutdown_tx, shutdown_rx) = watch::channel(());

        let mut running = launcher.start(&topology).await.unwrap();
        // chatty never exits, so supervision only ends at the timeout
        let supervised =
            tokio::time::timeout(Duration::from_secs(3), running.supervise(shutdown_rx)).await;
        assert!(supervised.is_err());

        assert_eq!(running.state("worker"), Some(ServiceState::Crashed(Some(3))));
        assert_eq!(running.state("chatty"), Some(ServiceState::Started));

        running.stop().await;
        assert_eq!(running.started_count(), 0);
    }

    #[tokio::test]
    async fn test_supervise_returns_on_shutdown_signal() {
        let topology = topology("exec sleep 30");
        let launcher = Launcher::new(Arc::new(ProcessRuntime::new()), config());
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let mut running = launcher.start(&topology).await.unwrap();
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running.supervise(shutdown_rx))
            .await
            .unwrap();

        assert_eq!(running.state("worker"), Some(ServiceState::Started));
        running.stop().await;
        assert_eq!(running.started_count(), 0);
    }
}
