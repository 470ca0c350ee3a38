mod common;

use common::test_helpers::CountingPolicy;
use sessionkeeper::testing::FakeEnsemble;
use sessionkeeper::{
    Acl, ClientConfig, Code, CreateMode, Error, MemoryTracerDriver, ResilientClient, RetryLoop, RetryNTimes,
    RetryPolicy, SessionFailMode, SessionFailRetryLoop, Tracer,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn client(ensemble: &FakeEnsemble, policy: Arc<dyn RetryPolicy>, tracer: Tracer) -> ResilientClient {
    let config = ClientConfig::new("zk1:2181", Arc::new(ensemble.clone()), policy)
        .unwrap()
        .session_timeout(Duration::from_secs(6))
        .connection_timeout(Duration::from_secs(3))
        .tracer(tracer);
    let client = ResilientClient::new(config).unwrap();
    client.start().unwrap();
    client
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let ensemble = FakeEnsemble::new();
    let driver = MemoryTracerDriver::new();
    let client = client(&ensemble, Arc::new(RetryNTimes::new(3, Duration::from_millis(1))), Tracer::new(driver.clone()));
    ensemble.connect();
    ensemble.fail_next_operations([Code::ConnectionLoss, Code::OperationTimeout]);

    let attempts = AtomicUsize::new(0);
    let path = RetryLoop::call_with_retry(&client, || async {
        attempts.fetch_add(1, Ordering::SeqCst);
        client.get_session()?.create("/lock", b"", &Acl::open_unsafe(), CreateMode::Persistent).await
    })
    .await
    .unwrap();

    assert_eq!(path, "/lock");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(driver.count("retries-allowed"), 2);
    assert_eq!(driver.count("retries-disallowed"), 0);
}

#[tokio::test]
async fn exhausted_policy_returns_last_error() {
    let ensemble = FakeEnsemble::new();
    let policy = Arc::new(CountingPolicy::new(RetryNTimes::new(2, Duration::ZERO)));
    let client = client(&ensemble, policy.clone(), Tracer::default());
    ensemble.connect();
    ensemble.set_reachable(false);

    let err = RetryLoop::call_with_retry(&client, || async { client.get_session()?.sync("/").await })
        .await
        .unwrap_err();
    assert_eq!(err.keeper_code(), Some(Code::ConnectionLoss));
    assert_eq!(policy.asked(), 3);
    assert_eq!(policy.allowed(), 2);
}

#[tokio::test]
async fn non_retryable_error_is_not_retried() {
    let ensemble = FakeEnsemble::new();
    let policy = Arc::new(CountingPolicy::new(RetryNTimes::new(5, Duration::ZERO)));
    let client = client(&ensemble, policy.clone(), Tracer::default());
    ensemble.connect();

    let err = RetryLoop::call_with_retry(&client, || async { client.get_session()?.delete("/absent", None).await })
        .await
        .unwrap_err();
    assert_eq!(err.keeper_code(), Some(Code::NoNode));
    assert_eq!(policy.asked(), 0);
}

#[tokio::test(start_paused = true)]
async fn close_interrupts_retry_sleep() {
    let ensemble = FakeEnsemble::new();
    let client = client(&ensemble, Arc::new(RetryNTimes::new(5, Duration::from_secs(60))), Tracer::default());
    ensemble.connect();
    ensemble.set_reachable(false);

    let closer = client.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        closer.close();
    });

    let started = tokio::time::Instant::now();
    let err = RetryLoop::call_with_retry(&client, || async { client.get_session()?.sync("/").await })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Closed));
    assert!(started.elapsed() < Duration::from_secs(60));
}

#[tokio::test]
async fn session_loss_reruns_block_in_retry_mode() {
    let ensemble = FakeEnsemble::new();
    let client = client(&ensemble, Arc::new(RetryNTimes::new(3, Duration::ZERO)), Tracer::default());
    ensemble.connect();

    let runs = AtomicUsize::new(0);
    let result = SessionFailRetryLoop::call_with_retry(&client, SessionFailMode::Retry, |scoped| {
        let runs = &runs;
        let ensemble = ensemble.clone();
        async move {
            let run = runs.fetch_add(1, Ordering::SeqCst);
            scoped.get_session()?.create("/owner", b"", &Acl::open_unsafe(), CreateMode::Ephemeral).await?;
            if run == 0 {
                ensemble.expire();
                ensemble.connect();
            }
            scoped.get_session()?.exists("/owner", false).await
        }
    })
    .await
    .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(result.is_some());
    assert_eq!(ensemble.sessions_created(), 2);
}

#[tokio::test]
async fn expiry_after_block_finished_reruns_it_in_retry_mode() {
    let ensemble = FakeEnsemble::new();
    let client = client(&ensemble, Arc::new(RetryNTimes::new(3, Duration::ZERO)), Tracer::default());
    ensemble.connect();

    let runs = AtomicUsize::new(0);
    SessionFailRetryLoop::call_with_retry(&client, SessionFailMode::Retry, |scoped| {
        let runs = &runs;
        let ensemble = ensemble.clone();
        async move {
            let run = runs.fetch_add(1, Ordering::SeqCst);
            scoped.get_session()?.create("/eph", b"", &Acl::open_unsafe(), CreateMode::Ephemeral).await?;
            if run == 0 {
                ensemble.expire();
                ensemble.connect();
            }
            Ok(())
        }
    })
    .await
    .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(ensemble.node_exists("/eph"));
    assert_eq!(ensemble.sessions_created(), 2);
}

#[tokio::test]
async fn session_loss_fails_block_in_fail_mode() {
    let ensemble = FakeEnsemble::new();
    let client = client(&ensemble, Arc::new(RetryNTimes::new(3, Duration::ZERO)), Tracer::default());
    ensemble.connect();

    let runs = AtomicUsize::new(0);
    let err = SessionFailRetryLoop::call_with_retry(&client, SessionFailMode::Fail, |scoped| {
        let runs = &runs;
        let ensemble = ensemble.clone();
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            ensemble.expire();
            scoped.get_session()?.sync("/").await
        }
    })
    .await
    .unwrap_err();

    assert!(err.is_session_failed());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(client.get_session().is_ok());
}

#[tokio::test]
async fn nested_retry_loop_sees_the_scope() {
    let ensemble = FakeEnsemble::new();
    let client = client(&ensemble, Arc::new(RetryNTimes::new(3, Duration::ZERO)), Tracer::default());
    ensemble.connect();

    let mut session_loop = client.new_session_fail_retry_loop(SessionFailMode::Fail);
    ensemble.expire();
    ensemble.connect();
    let scoped = session_loop.client().clone();
    let err = RetryLoop::call_with_retry(&scoped, || async { scoped.get_session()?.sync("/").await })
        .await
        .unwrap_err();
    assert!(err.is_session_failed());
    assert!(session_loop.take_exception(err).await.unwrap_err().is_session_failed());
    session_loop.close();
}

#[tokio::test]
async fn retry_policy_swap_applies_to_new_loops() {
    let ensemble = FakeEnsemble::new();
    let first = Arc::new(CountingPolicy::new(RetryNTimes::new(0, Duration::ZERO)));
    let client = client(&ensemble, first.clone(), Tracer::default());
    ensemble.connect();
    ensemble.set_reachable(false);

    let second = Arc::new(CountingPolicy::new(RetryNTimes::new(1, Duration::ZERO)));
    client.set_retry_policy(second.clone());
    let _ = RetryLoop::call_with_retry(&client, || async { client.get_session()?.sync("/").await }).await;
    assert_eq!(first.asked(), 0);
    assert_eq!(second.asked(), 2);
}

#[tokio::test]
async fn concurrent_loops_share_one_session() {
    let ensemble = FakeEnsemble::new();
    let client = client(&ensemble, Arc::new(RetryNTimes::new(3, Duration::ZERO)), Tracer::default());
    ensemble.connect();
    ensemble.fail_next_operations([Code::ConnectionLoss, Code::ConnectionLoss]);

    let creates = (0..5).map(|i| {
        let client = client.clone();
        async move {
            let path = format!("/job-{i}");
            RetryLoop::call_with_retry(&client, || async {
                client.get_session()?.create(&path, b"", &Acl::open_unsafe(), CreateMode::Persistent).await
            })
            .await
        }
    });
    let results = futures::future::join_all(creates).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(ensemble.sessions_created(), 1);
    assert!((0..5).all(|i| ensemble.node_exists(&format!("/job-{i}"))));
}
