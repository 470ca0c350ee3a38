mod common;

use common::test_helpers;
use sessionkeeper::testing::FakeEnsemble;
use sessionkeeper::{ConnectionState, Framework, KeeperState, ListenerError, RetryOneTime};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn started(ensemble: &FakeEnsemble) -> (Framework, Arc<Mutex<Vec<ConnectionState>>>) {
    let framework =
        test_helpers::framework_builder(ensemble, Arc::new(RetryOneTime::new(Duration::ZERO))).build().unwrap();
    let states = test_helpers::recorder::<ConnectionState>();
    let sink = states.clone();
    framework.add_connection_state_listener(Arc::new(move |state: ConnectionState| -> Result<(), ListenerError> {
        sink.lock().unwrap().push(state);
        Ok(())
    }));
    framework.start().unwrap();
    (framework, states)
}

async fn settle(states: &Arc<Mutex<Vec<ConnectionState>>>, expected: usize) -> Vec<ConnectionState> {
    test_helpers::wait_until(Duration::from_secs(2), || states.lock().unwrap().len() >= expected).await;
    states.lock().unwrap().clone()
}

#[tokio::test]
async fn first_connection_is_reported_as_connected() {
    let ensemble = FakeEnsemble::new();
    let (framework, states) = started(&ensemble);

    ensemble.connect();
    ensemble.connect();
    assert_eq!(settle(&states, 1).await, vec![ConnectionState::Connected]);
    assert!(framework.block_until_connected(Some(Duration::from_millis(50))).await);
    framework.close();
}

#[tokio::test]
async fn read_only_first_then_connected() {
    let ensemble = FakeEnsemble::new();
    let (framework, states) = started(&ensemble);

    ensemble.connect_read_only();
    ensemble.connect();
    assert_eq!(settle(&states, 2).await, vec![ConnectionState::ReadOnly, ConnectionState::Connected]);
    framework.close();
}

#[tokio::test]
async fn expiry_is_lost_then_reconnected() {
    let ensemble = FakeEnsemble::new();
    let (framework, states) = started(&ensemble);

    ensemble.connect();
    ensemble.expire();
    ensemble.connect();
    assert_eq!(
        settle(&states, 3).await,
        vec![ConnectionState::Connected, ConnectionState::Lost, ConnectionState::Reconnected]
    );
    assert_eq!(ensemble.sessions_created(), 2);
    framework.close();
}

#[tokio::test]
async fn events_before_start_are_ignored() {
    let ensemble = FakeEnsemble::new();
    let framework =
        test_helpers::framework_builder(&ensemble, Arc::new(RetryOneTime::new(Duration::ZERO))).build().unwrap();
    let manager = framework.connection_state_manager();
    assert!(!manager.add_state_change(ConnectionState::Connected));
    assert_eq!(manager.current_state(), None);
    assert!(!framework.block_until_connected(Some(Duration::from_millis(10))).await);
}

#[tokio::test]
async fn auth_failure_does_not_change_state() {
    let ensemble = FakeEnsemble::new();
    let (framework, states) = started(&ensemble);

    ensemble.connect();
    ensemble.emit(KeeperState::AuthFailed);
    ensemble.emit(KeeperState::SyncConnected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(settle(&states, 1).await, vec![ConnectionState::Connected]);
    framework.close();
}

#[tokio::test]
async fn close_stops_notifications() {
    let ensemble = FakeEnsemble::new();
    let (framework, states) = started(&ensemble);

    ensemble.connect();
    settle(&states, 1).await;
    framework.close();
    assert_eq!(framework.connection_state_manager().listener_count(), 0);

    ensemble.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*states.lock().unwrap(), vec![ConnectionState::Connected]);
}
