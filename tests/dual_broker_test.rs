// Two brokers configured to the same intake socket path cannot both
// reach the running state.
//
// Run with: cargo test --test dual_broker_test

use gelf_broker::BrokerError;
use gelf_broker::Listener;
use tempfile::TempDir;

#[test]
fn second_broker_on_the_same_socket_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("intake.sock");

    let broker_a = Listener::bind(&path, None).expect("first broker binds cleanly");

    let broker_b = Listener::bind(&path, None);
    assert!(matches!(broker_b, Err(BrokerError::FatalListenerConflict(_))));

    // Broker A is unaffected by B's failed attempt.
    assert!(broker_a.check());
}
