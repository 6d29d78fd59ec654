//! Two-node integration tests on loopback: remote call/cast, remote spawn,
//! global registry conflict resolution, remote monitors and links.

use async_trait::async_trait;
use axon_cluster::{
    Behavior, Cluster, ClusterConfig, ClusterError, CoreError, ExitReason, GenServerOptions,
    InfoMessage, NodeId, Registration, ServerId, ServerRef, SpawnOptions,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

struct Counter {
    value: i64,
}

#[async_trait]
impl Behavior for Counter {
    async fn handle_call(&mut self, msg: Value) -> Result<Value, CoreError> {
        match msg.as_str() {
            Some("get") => Ok(json!(self.value)),
            Some("boom") => Err(CoreError::handler("boom")),
            Some("slow") => {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(json!(self.value))
            }
            _ => Ok(Value::Null),
        }
    }

    async fn handle_cast(&mut self, msg: Value) -> Result<(), CoreError> {
        if msg.as_str() == Some("inc") {
            self.value += 1;
        }
        Ok(())
    }
}

/// Records every info message it receives
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

async fn start_node(name: &str, seeds: Vec<String>) -> Cluster {
    let port = free_port().await;
    let config = ClusterConfig::new(name)
        .with_host("127.0.0.1")
        .with_port(port)
        .with_seeds(seeds)
        .with_heartbeat(200, 3);
    let cluster = Cluster::new(config).unwrap();
    cluster.start().await.unwrap();
    cluster
}

/// Poll until the condition holds or the deadline passes
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
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

fn remote(cluster: &Cluster, server_ref: &ServerRef) -> ServerRef {
    ServerRef::remote(server_ref.id, cluster.node_id().clone())
}

#[tokio::test]
async fn remote_call_and_cast_preserve_order() {
    let a = start_node("basic-a", vec![]).await;
    let b = start_node("basic-b", vec![]).await;
    connect(&a, &b).await;

    let counter = b
        .start_server(Counter { value: 0 }, GenServerOptions::default())
        .await
        .unwrap();
    let target = remote(&b, &counter);

    // Casts then a call over one TCP link: the call observes all casts.
    for _ in 0..100 {
        a.cast(&target, json!("inc")).await.unwrap();
    }
    let reply = a.call(&target, json!("get"), None).await.unwrap();
    assert_eq!(reply, json!(100));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn remote_call_error_paths() {
    let a = start_node("err-a", vec![]).await;
    let b = start_node("err-b", vec![]).await;
    connect(&a, &b).await;

    // Unknown server id on a live node.
    let ghost = ServerRef::remote(ServerId::new(), b.node_id().clone());
    let err = a.call(&ghost, json!("get"), None).await.unwrap_err();
    assert!(matches!(err, ClusterError::RemoteServerNotRunning(_)));

    // A handler that outlives the caller's deadline.
    let counter = b
        .start_server(Counter { value: 0 }, GenServerOptions::default())
        .await
        .unwrap();
    let target = remote(&b, &counter);
    let err = a
        .call(&target, json!("slow"), Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::RemoteCallTimeout { .. }));

    // A node nobody is connected to.
    let nowhere = ServerRef::remote(ServerId::new(), NodeId::parse("ghost@127.0.0.1:1").unwrap());
    let err = a.call(&nowhere, json!("get"), None).await.unwrap_err();
    assert!(matches!(err, ClusterError::NodeNotReachable(_)));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn remote_spawn_with_local_registration() {
    let a = start_node("spawn-a", vec![]).await;
    let b = start_node("spawn-b", vec![]).await;
    connect(&a, &b).await;

    b.behaviors()
        .register("counter", |_args| Box::new(Counter { value: 0 }))
        .await;

    let spawned = a
        .spawn(
            "counter",
            b.node_id(),
            SpawnOptions {
                name: Some("the_counter".to_string()),
                registration: Registration::Local,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(spawned.node_id.as_ref(), Some(b.node_id()));

    // The name exists on B, and the process answers calls from A.
    assert!(b.runtime().registry().is_registered("the_counter").await);
    let reply = a.call(&spawned, json!("get"), None).await.unwrap();
    assert_eq!(reply, json!(0));

    // Unknown behaviors surface as typed failures.
    let err = a
        .spawn("nope", b.node_id(), SpawnOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::BehaviorNotFound(_)));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn global_registry_conflict_resolves_to_earlier_registration() {
    let a = start_node("greg-a", vec![]).await;
    let b = start_node("greg-b", vec![]).await;

    let seen = Arc::new(RwLock::new(Vec::new()));
    let a_proc = a
        .start_server(Recorder { seen: seen.clone() }, GenServerOptions::default())
        .await
        .unwrap();
    let b_seen = Arc::new(RwLock::new(Vec::new()));
    let b_proc = b
        .start_server(
            Recorder {
                seen: b_seen.clone(),
            },
            GenServerOptions::default(),
        )
        .await
        .unwrap();

    // Register the same name on both sides while disconnected; A first so
    // its registration timestamp is strictly older.
    a.global_registry()
        .register("svc", a_proc.clone())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    b.global_registry()
        .register("svc", b_proc.clone())
        .await
        .unwrap();

    connect(&a, &b).await;

    // Both views converge on A's entry.
    eventually("registry converges", || async {
        let a_entry = a.global_registry().get_entry("svc").await;
        let b_entry = b.global_registry().get_entry("svc").await;
        match (a_entry, b_entry) {
            (Some(ae), Some(be)) => {
                ae.owner_node_id == *a.node_id()
                    && be.owner_node_id == *a.node_id()
                    && ae.server_ref.id == a_proc.id
                    && be.server_ref.id == a_proc.id
            }
            _ => false,
        }
    })
    .await;

    // B's losing process received the conflict signal.
    eventually("conflict signal delivered", || async {
        b_seen.read().await.iter().any(|msg| {
            matches!(msg, InfoMessage::NameConflict { name, .. } if name == "svc")
        })
    })
    .await;
    assert!(seen.read().await.is_empty());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn remote_monitor_reports_process_death_and_noproc() {
    let a = start_node("mon-a", vec![]).await;
    let b = start_node("mon-b", vec![]).await;
    connect(&a, &b).await;

    let seen = Arc::new(RwLock::new(Vec::new()));
    let watcher = a
        .start_server(Recorder { seen: seen.clone() }, GenServerOptions::default())
        .await
        .unwrap();

    let target = b
        .start_server(Counter { value: 0 }, GenServerOptions::default())
        .await
        .unwrap();
    let remote_target = remote(&b, &target);

    let monitor_ref = a.monitor(&watcher, &remote_target, None).await.unwrap();

    // Crash the monitored process on B.
    b.runtime()
        .kill(target.id, ExitReason::error("boom"))
        .await;

    eventually("down notification arrives", || async {
        seen.read().await.iter().any(|msg| {
            matches!(
                msg,
                InfoMessage::Down { monitor_id, reason, .. }
                    if *monitor_id == monitor_ref.monitor_id && reason.is_abnormal()
            )
        })
    })
    .await;
    // At most once per monitor id.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let downs = seen
        .read()
        .await
        .iter()
        .filter(|msg| matches!(msg, InfoMessage::Down { .. }))
        .count();
    assert_eq!(downs, 1);

    // Monitoring a dead process acks, then reports noproc immediately.
    let gone = ServerRef::remote(ServerId::new(), b.node_id().clone());
    let noproc_ref = a.monitor(&watcher, &gone, None).await.unwrap();
    eventually("noproc arrives", || async {
        seen.read().await.iter().any(|msg| {
            matches!(
                msg,
                InfoMessage::Down { monitor_id, reason, .. }
                    if *monitor_id == noproc_ref.monitor_id && *reason == ExitReason::Noproc
            )
        })
    })
    .await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn link_propagates_abnormal_exit_to_trapping_peer() {
    let a = start_node("link-a", vec![]).await;
    let b = start_node("link-b", vec![]).await;
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
        .start_server(Counter { value: 0 }, GenServerOptions::default())
        .await
        .unwrap();
    let q_remote = remote(&b, &q);

    a.link(&p, &q_remote, None).await.unwrap();

    // Q crashes; P traps the exit signal instead of dying.
    let _ = a.call(&q_remote, json!("boom"), None).await;
    eventually("exit signal trapped", || async {
        seen.read().await.iter().any(|msg| {
            matches!(
                msg,
                InfoMessage::ExitSignal { from, reason }
                    if from.id == q.id
                        && matches!(reason, ExitReason::Error { message } if message.contains("boom"))
            )
        })
    })
    .await;
    assert!(a.runtime().is_running(p.id).await);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn link_normal_exit_does_not_propagate() {
    let a = start_node("nlink-a", vec![]).await;
    let b = start_node("nlink-b", vec![]).await;
    connect(&a, &b).await;

    let p = a
        .start_server(Counter { value: 0 }, GenServerOptions::default())
        .await
        .unwrap();
    let q = b
        .start_server(Counter { value: 0 }, GenServerOptions::default())
        .await
        .unwrap();
    let q_remote = remote(&b, &q);

    a.link(&p, &q_remote, None).await.unwrap();
    b.runtime().stop(q.id, ExitReason::Normal).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(a.runtime().is_running(p.id).await);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn link_kills_non_trapping_peer_on_crash() {
    let a = start_node("klink-a", vec![]).await;
    let b = start_node("klink-b", vec![]).await;
    connect(&a, &b).await;

    let p = a
        .start_server(Counter { value: 0 }, GenServerOptions::default())
        .await
        .unwrap();
    let q = b
        .start_server(Counter { value: 0 }, GenServerOptions::default())
        .await
        .unwrap();
    let q_remote = remote(&b, &q);

    a.link(&p, &q_remote, None).await.unwrap();
    b.runtime().kill(q.id, ExitReason::error("boom")).await;

    eventually("linked process dies too", || async {
        !a.runtime().is_running(p.id).await
    })
    .await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn link_to_missing_process_is_rejected() {
    let a = start_node("rlink-a", vec![]).await;
    let b = start_node("rlink-b", vec![]).await;
    connect(&a, &b).await;

    let p = a
        .start_server(Counter { value: 0 }, GenServerOptions::default())
        .await
        .unwrap();
    let gone = ServerRef::remote(ServerId::new(), b.node_id().clone());

    let err = a.link(&p, &gone, None).await.unwrap_err();
    assert!(matches!(err, ClusterError::RemoteLinkRejected(_)));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn mismatched_secrets_never_form_a_cluster() {
    let port_a = free_port().await;
    let port_b = free_port().await;
    let a = Cluster::new(
        ClusterConfig::new("sec-a")
            .with_host("127.0.0.1")
            .with_port(port_a)
            .with_secret("alpha"),
    )
    .unwrap();
    let b = Cluster::new(
        ClusterConfig::new("sec-b")
            .with_host("127.0.0.1")
            .with_port(port_b)
            .with_secret("beta"),
    )
    .unwrap();
    a.start().await.unwrap();
    b.start().await.unwrap();

    // The dial may succeed at the TCP level, but B rejects A's first frame,
    // so no authenticated session ever forms.
    let _ = a.connect_to(b.node_id()).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(b.get_connected_nodes().await.is_empty());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn stop_rejects_pending_operations() {
    let a = start_node("stop-a", vec![]).await;
    let b = start_node("stop-b", vec![]).await;
    connect(&a, &b).await;

    let counter = b
        .start_server(Counter { value: 0 }, GenServerOptions::default())
        .await
        .unwrap();
    let target = remote(&b, &counter);

    // Start a slow call, then stop the calling cluster underneath it.
    let a2 = a.clone();
    let target2 = target.clone();
    let pending = tokio::spawn(async move {
        a2.call(&target2, json!("slow"), Some(Duration::from_secs(10)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    a.stop().await;
    // Stop is idempotent.
    a.stop().await;

    let result = pending.await.unwrap();
    assert!(result.is_err());

    b.stop().await;
}
