//! Node-failure scenarios: heartbeat timeout detection, noconnection
//! monitor signals, and distributed supervisor failover with migration.

use async_trait::async_trait;
use axon_cluster::{
    Behavior, Cluster, ClusterConfig, CoreError, DistChildSpec, DistSupervisor,
    DistSupervisorEvent, DistSupervisorOptions, ExitReason, GenServerOptions, InfoMessage,
    MembershipEvent, NodeDownReason, NodeSelector, ServerRef,
};
use axon_core::Strategy;
use serde_json::Value;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

struct Worker;

#[async_trait]
impl Behavior for Worker {
    async fn handle_call(&mut self, _msg: Value) -> Result<Value, CoreError> {
        Ok(Value::String("ok".to_string()))
    }
}

struct Recorder {
    seen: Arc<RwLock<Vec<InfoMessage>>>,
}

#[async_trait]
impl Behavior for Recorder {
    async fn handle_info(&mut self, msg: InfoMessage) -> Result<(), CoreError> {
        self.seen.write().await.push(msg);
        Ok(())
    }
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_node(name: &str) -> Cluster {
    let port = free_port().await;
    let config = ClusterConfig::new(name)
        .with_host("127.0.0.1")
        .with_port(port)
        .with_heartbeat(150, 3)
        .with_reconnect(100, 500, 3);
    let cluster = Cluster::new(config).unwrap();
    cluster.start().await.unwrap();
    cluster.behaviors().register("worker", |_| Box::new(Worker)).await;
    cluster
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition never held: {}", what);
}

async fn connect(a: &Cluster, b: &Cluster) {
    a.connect_to(b.node_id()).await.unwrap();
    eventually("peers see each other", || async {
        a.get_connected_nodes().await.contains(b.node_id())
            && b.get_connected_nodes().await.contains(a.node_id())
    })
    .await;
}

#[tokio::test]
#[serial]
async fn monitor_delivers_noconnection_exactly_once_on_node_loss() {
    let a = start_node("fo-mon-a").await;
    let b = start_node("fo-mon-b").await;
    connect(&a, &b).await;

    let seen = Arc::new(RwLock::new(Vec::new()));
    let watcher = a
        .start_server(Recorder { seen: seen.clone() }, GenServerOptions::default())
        .await
        .unwrap();
    let target = b
        .start_server(Worker, GenServerOptions::default())
        .await
        .unwrap();
    let target = ServerRef::remote(target.id, b.node_id().clone());

    let monitor_ref = a.monitor(&watcher, &target, None).await.unwrap();

    // Take the whole node down.
    b.stop().await;

    eventually("noconnection delivered", || async {
        seen.read().await.iter().any(|msg| {
            matches!(
                msg,
                InfoMessage::Down { monitor_id, reason, .. }
                    if *monitor_id == monitor_ref.monitor_id
                        && *reason == ExitReason::Noconnection
            )
        })
    })
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let downs = seen
        .read()
        .await
        .iter()
        .filter(|msg| matches!(msg, InfoMessage::Down { .. }))
        .count();
    assert_eq!(downs, 1);

    a.stop().await;
}

#[tokio::test]
#[serial]
async fn link_collapses_into_local_noconnection_exit_on_node_loss() {
    let a = start_node("fo-link-a").await;
    let b = start_node("fo-link-b").await;
    connect(&a, &b).await;

    let seen = Arc::new(RwLock::new(Vec::new()));
    let p = a
        .start_server(
            Recorder { seen: seen.clone() },
            GenServerOptions::default().trap_exit(true),
        )
        .await
        .unwrap();
    let q = b
        .start_server(Worker, GenServerOptions::default())
        .await
        .unwrap();
    let q = ServerRef::remote(q.id, b.node_id().clone());

    a.link(&p, &q, None).await.unwrap();
    b.stop().await;

    eventually("noconnection exit signal", || async {
        seen.read().await.iter().any(|msg| {
            matches!(
                msg,
                InfoMessage::ExitSignal { reason, .. } if *reason == ExitReason::Noconnection
            )
        })
    })
    .await;
    assert!(a.runtime().is_running(p.id).await);

    a.stop().await;
}

#[tokio::test]
#[serial]
async fn heartbeat_timeout_declares_silent_peer_down() {
    use axon_cluster::{ClusterMessage, MessageSerializer, ReconnectPolicy, Transport};
    use axon_core::NodeId;

    let a = start_node("hb-a").await;

    // A bare transport that identifies itself once and then goes silent:
    // no heartbeats ever arrive from it.
    let silent_port = free_port().await;
    let silent_id = NodeId::new("hb-silent", "127.0.0.1", silent_port).unwrap();
    let silent = Transport::new(
        silent_id.clone(),
        Arc::new(MessageSerializer::default()),
        axon_cluster::transport::TransportSettings {
            bind_host: "127.0.0.1".to_string(),
            port: silent_port,
            connect_timeout: Duration::from_secs(2),
            reconnect: ReconnectPolicy::default(),
        },
    );
    silent.start().await.unwrap();
    silent.connect_to(a.node_id()).await.unwrap();
    // One heartbeat identifies the silent node to A.
    silent
        .send(
            a.node_id(),
            &ClusterMessage::Heartbeat {
                process_count: 0,
                uptime_ms: 0,
            },
        )
        .await
        .unwrap();

    let mut events = a.subscribe_membership();
    eventually("silent peer marked connected", || async {
        a.get_connected_nodes().await.contains(&silent_id)
    })
    .await;

    // Heartbeat interval 150 ms * miss threshold 3: the sweep should fire
    // well within a few seconds.
    let deadline = Duration::from_secs(10);
    let down = tokio::time::timeout(deadline, async {
        loop {
            if let Ok(MembershipEvent::NodeDown { node_id, reason }) = events.recv().await {
                if node_id == silent_id {
                    return reason;
                }
            }
        }
    })
    .await
    .expect("node down event");
    assert_eq!(down, NodeDownReason::HeartbeatTimeout);

    // Keep the silent transport alive until the assertion is done.
    silent.stop().await;
    a.stop().await;
}

#[tokio::test]
#[serial]
async fn distributed_supervisor_fails_over_on_node_loss() {
    let n1 = start_node("dsup-n1").await;
    let n2 = start_node("dsup-n2").await;
    let n3 = start_node("dsup-n3").await;
    connect(&n1, &n2).await;
    connect(&n1, &n3).await;
    connect(&n2, &n3).await;

    let handle = DistSupervisor::start(
        n1.clone(),
        DistSupervisorOptions::new(Strategy::OneForOne, NodeSelector::RoundRobin)
            .child(DistChildSpec::new("c1", "worker"))
            .child(DistChildSpec::new("c2", "worker"))
            .child(DistChildSpec::new("c3", "worker"))
            .intensity(5, Duration::from_secs(60)),
    )
    .await
    .unwrap();
    let mut events = handle.subscribe();

    // Round robin over three connected nodes places one child per node.
    let children = handle.get_children().await.unwrap();
    assert_eq!(children.len(), 3);
    let on_n2: Vec<String> = children
        .iter()
        .filter(|c| c.node.as_ref() == Some(n2.node_id()))
        .map(|c| c.id.clone())
        .collect();
    assert_eq!(on_n2.len(), 1, "expected exactly one child on n2");
    let moved_child = on_n2[0].clone();

    // Kill N2; the supervisor must observe noconnection and migrate.
    n2.stop().await;

    let migration = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            if let Ok(DistSupervisorEvent::ChildMigrated { child_id, from, to }) =
                events.recv().await
            {
                return (child_id, from, to);
            }
        }
    })
    .await
    .expect("child_migrated event");
    assert_eq!(migration.0, moved_child);
    assert_eq!(&migration.1, n2.node_id());
    assert_ne!(&migration.2, n2.node_id());

    let stats = handle.get_stats().await.unwrap();
    assert_eq!(stats.node_failure_restarts, 1);
    assert_eq!(stats.active, 3);

    // The migrated child answers calls at its new home.
    let children = handle.get_children().await.unwrap();
    let migrated = children.iter().find(|c| c.id == moved_child).unwrap();
    assert_ne!(migrated.node.as_ref(), Some(n2.node_id()));

    handle.stop().await.unwrap();
    n1.stop().await;
    n3.stop().await;
}

#[tokio::test]
#[serial]
async fn distributed_supervisor_restarts_crashed_child() {
    let n1 = start_node("dsup2-n1").await;
    let n2 = start_node("dsup2-n2").await;
    connect(&n1, &n2).await;

    let handle = DistSupervisor::start(
        n1.clone(),
        DistSupervisorOptions::new(
            Strategy::OneForOne,
            NodeSelector::Node(n2.node_id().clone()),
        )
        .child(DistChildSpec::new("pinned", "worker")),
    )
    .await
    .unwrap();

    let children = handle.get_children().await.unwrap();
    let old_ref = children[0].server_ref.clone().unwrap();
    assert_eq!(children[0].node.as_ref(), Some(n2.node_id()));

    // Crash the child on its host node.
    n2.runtime().kill(old_ref.id, ExitReason::error("boom")).await;

    eventually("child restarted in place", || async {
        let children = handle.get_children().await.unwrap();
        match &children[0].server_ref {
            Some(server_ref) => server_ref.id != old_ref.id && children[0].restart_count == 1,
            None => false,
        }
    })
    .await;

    let stats = handle.get_stats().await.unwrap();
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.node_failure_restarts, 0);

    handle.stop().await.unwrap();
    n1.stop().await;
    n2.stop().await;
}

#[tokio::test]
#[serial]
async fn graceful_shutdown_suppresses_reconnect() {
    let a = start_node("grace-a").await;
    let b = start_node("grace-b").await;
    connect(&a, &b).await;

    b.stop().await;
    eventually("b marked down", || async {
        !a.get_connected_nodes().await.contains(b.node_id())
    })
    .await;

    // Long enough for several reconnect attempts if any were scheduled.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!a.get_connected_nodes().await.contains(b.node_id()));

    a.stop().await;
}
