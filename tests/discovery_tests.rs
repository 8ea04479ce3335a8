//! # Discovery Integration Tests
//!
//! Topology changes, locality detection and configuration loading as seen
//! through a running balancer.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_test::{assert_err, assert_ok};

use cluster_balancer::conn::{ConnectionPool, Pool};
use cluster_balancer::discovery::UnreachableDiscovery;
use cluster_balancer::{
    Balancer, BalancerError, CallOptions, Context, DriverConfig, Endpoint, StaticDiscovery, TcpLocalityDetector,
};

use common::{eventually, node, test_config, FlakyDiscovery, HangingDiscovery, ScriptedDialer};

fn scripted_pool() -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::new(Arc::new(ScriptedDialer::default())))
}

async fn build(config: DriverConfig, discovery: &StaticDiscovery, pool: Arc<ConnectionPool>) -> Balancer {
    Balancer::builder(config)
        .with_pool(pool)
        .with_discovery(Arc::new(discovery.clone()))
        .build(&Context::background())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_rediscovery_reuses_pooled_connections() {
    let discovery = StaticDiscovery::new(vec![node("a:2135", 1, "vla"), node("b:2135", 2, "vla")]);
    let pool = scripted_pool();
    let balancer = build(test_config(), &discovery, pool.clone()).await;
    let before = balancer.connections_state();

    discovery.add_endpoint(node("c:2135", 3, "vla"));
    balancer.rediscover(&Context::background()).await.unwrap();
    let after = balancer.connections_state();

    assert_eq!(after.len(), 3);
    assert_eq!(pool.len(), 3);
    assert!(Arc::ptr_eq(&before.connections()[0], &after.connections()[0]));
    assert!(Arc::ptr_eq(&before.connections()[1], &after.connections()[1]));
}

#[tokio::test]
async fn test_removed_node_leaves_the_snapshot() {
    let discovery = StaticDiscovery::new(vec![node("a:2135", 1, "vla"), node("b:2135", 2, "vla")]);
    let balancer = build(test_config(), &discovery, scripted_pool()).await;

    assert_eq!(discovery.remove_endpoint("a:2135"), 1);
    balancer.rediscover(&Context::background()).await.unwrap();

    let state = balancer.connections_state();
    assert_eq!(state.len(), 1);
    assert_eq!(state.connections()[0].endpoint().address(), "b:2135");
}

#[tokio::test]
async fn test_background_discovery_picks_up_new_nodes() {
    let mut config = test_config();
    config.discovery.interval = Duration::from_millis(20);
    let discovery = StaticDiscovery::new(vec![node("a:2135", 1, "vla")]);
    let balancer = build(config, &discovery, scripted_pool()).await;
    assert!(balancer.has_repeater());

    discovery.add_endpoint(node("b:2135", 2, "vla"));
    assert!(eventually(|| balancer.connections_state().len() == 2).await);

    balancer.close(&Context::background()).await.unwrap();
}

#[tokio::test]
async fn test_every_attempt_closes_its_session() {
    let discovery = StaticDiscovery::new(vec![node("a:2135", 1, "vla")]);
    let balancer = build(test_config(), &discovery, scripted_pool()).await;

    assert_ok!(balancer.rediscover(&Context::background()).await);
    assert_ok!(balancer.rediscover(&Context::background()).await);

    assert_eq!(discovery.connect_count(), 3);
    assert_eq!(discovery.close_count(), 3);
}

#[tokio::test]
async fn test_unreachable_discovery_exhausts_retries() {
    let mut config = test_config();
    config.retry.max_attempts = 3;

    let err = assert_err!(
        Balancer::builder(config)
            .with_pool(scripted_pool())
            .with_discovery(Arc::new(UnreachableDiscovery::new("seed:2135")))
            .build(&Context::background())
            .await
    );

    assert!(matches!(err, BalancerError::RetryExhausted { attempts: 3, .. }));
    assert!(matches!(err.root(), BalancerError::Dial { .. }));
    assert_eq!(err.error_type(), "dial_error");
}

#[tokio::test]
async fn test_exhausted_attempt_timeouts_surface_as_deadline() {
    let mut config = test_config();
    config.dial_timeout = Some(Duration::from_millis(5));
    config.retry.max_attempts = 2;
    let discovery = HangingDiscovery::new(StaticDiscovery::new(vec![node("a:2135", 1, "vla")]), usize::MAX);

    let err = assert_err!(
        Balancer::builder(config)
            .with_pool(scripted_pool())
            .with_discovery(Arc::new(discovery))
            .build(&Context::background())
            .await
    );

    assert!(matches!(err, BalancerError::RetryExhausted { attempts: 2, .. }));
    assert!(err.is_context_error());
    assert!(matches!(err.root(), BalancerError::DeadlineExceeded));
    assert!(std::error::Error::source(&err).is_some());
}

#[tokio::test]
async fn test_failed_background_rounds_keep_the_snapshot() {
    let mut config = test_config();
    config.discovery.interval = Duration::from_millis(10);
    let discovery = Arc::new(FlakyDiscovery::new(StaticDiscovery::new(vec![node("a:2135", 1, "vla")])));

    let balancer = Balancer::builder(config)
        .with_pool(scripted_pool())
        .with_discovery(discovery.clone())
        .build(&Context::background())
        .await
        .unwrap();
    let published = balancer.connections_state();

    discovery.set_failing(true);
    let failed_from = discovery.attempts();
    assert!(eventually(|| discovery.attempts() >= failed_from + 3).await);

    assert!(Arc::ptr_eq(&published, &balancer.connections_state()));
    for _ in 0..3 {
        let conn = balancer.get_conn(&Context::background()).unwrap();
        assert_eq!(conn.endpoint().address(), "a:2135");
        let reply = balancer
            .invoke(&Context::background(), "/test.Node/Address", bytes::Bytes::new(), &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(reply, bytes::Bytes::from_static(b"a:2135"));
    }

    discovery.inner.add_endpoint(node("b:2135", 2, "vla"));
    discovery.set_failing(false);
    assert!(eventually(|| balancer.connections_state().len() == 2).await);
    assert!(!Arc::ptr_eq(&published, &balancer.connections_state()));

    balancer.close(&Context::background()).await.unwrap();
}

#[tokio::test]
async fn test_tcp_locality_detection_prefers_reachable_location() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let reachable = listener.local_addr().unwrap().to_string();
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let unreachable = closed.local_addr().unwrap().to_string();
    drop(closed);

    let discovery = StaticDiscovery::new(vec![
        Endpoint::new(unreachable).with_node_id(1).with_location("man"),
        Endpoint::new(reachable.clone()).with_node_id(2).with_location("sas"),
    ]);
    let mut config = test_config();
    config.balancer.detect_local_dc = true;

    let balancer = Balancer::builder(config)
        .with_pool(scripted_pool())
        .with_discovery(Arc::new(discovery))
        .with_locality_detector(Arc::new(TcpLocalityDetector::default()))
        .build(&Context::background())
        .await
        .unwrap();

    let state = balancer.connections_state();
    assert_eq!(state.self_location(), "sas");
    assert_eq!(state.preferred_count(), 1);
    let conn = balancer.get_conn(&Context::background()).unwrap();
    assert_eq!(conn.endpoint().address(), reachable);
}

#[tokio::test]
async fn test_failed_locality_detection_fails_initialization() {
    let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let discovery = StaticDiscovery::new(vec![
        Endpoint::new(a.local_addr().unwrap().to_string()).with_location("man"),
        Endpoint::new(b.local_addr().unwrap().to_string()).with_location("sas"),
    ]);
    drop(a);
    drop(b);

    let mut config = test_config();
    config.balancer.detect_local_dc = true;
    config.retry.max_attempts = 2;

    let err = Balancer::builder(config)
        .with_pool(scripted_pool())
        .with_discovery(Arc::new(discovery))
        .build(&Context::background())
        .await
        .unwrap_err();

    assert!(matches!(err, BalancerError::RetryExhausted { attempts: 2, .. }));
    assert!(matches!(err.root(), BalancerError::Locality { .. }));
}

#[tokio::test]
async fn test_balancer_from_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("balancer.yaml");
    tokio::fs::write(
        &config_path,
        r#"
endpoint: "seed:2135"
database: "/local/test"
balancer:
  single_conn: true
discovery:
  interval: "0s"
"#,
    )
    .await
    .unwrap();

    let config = DriverConfig::load_from_file(&config_path).await.unwrap();
    let discovery = StaticDiscovery::new(vec![node("a:2135", 1, "vla")]);
    let pool = scripted_pool();
    let balancer = build(config, &discovery, pool.clone()).await;

    assert!(balancer.connections_state().is_single_conn());
    assert_eq!(discovery.connect_count(), 0);
    assert_eq!(pool.len(), 1);

    let conn = balancer.get_conn(&Context::background()).unwrap();
    assert_eq!(conn.endpoint().address(), "seed:2135");

    let cause = BalancerError::call(tonic::Status::unavailable("down"));
    pool.ban(&Context::background(), &conn, &cause);
    let again = balancer.get_conn(&Context::background()).unwrap();
    assert!(Arc::ptr_eq(&conn, &again));
}
