use crate::connection::{ConnectionManager, ConnectionState, ConnectionStats};
use crate::types::ClientConfig;

#[test]
fn connection_state_is_active_covers_in_progress_states() {
    assert!(ConnectionState::TcpOpen.is_active());
    assert!(ConnectionState::VerifyInProgress.is_active());
    assert!(ConnectionState::VerifyComplete.is_active());
    assert!(ConnectionState::SetupInProgress.is_active());
    assert!(ConnectionState::Ready.is_active());
    assert!(!ConnectionState::Disconnected.is_active());
    assert!(!ConnectionState::Closing.is_active());
}

#[test]
fn connection_state_is_ready_and_is_closing() {
    assert!(ConnectionState::Ready.is_ready());
    assert!(!ConnectionState::SetupInProgress.is_ready());
    assert!(ConnectionState::Closing.is_closing());
    assert!(!ConnectionState::Ready.is_closing());
}

#[test]
fn connection_stats_records_bytes() {
    let mut stats = ConnectionStats::default();
    stats.record_sent(100);
    stats.record_received(200);

    assert_eq!(stats.bytes_sent, 100);
    assert_eq!(stats.bytes_received, 200);
}

#[tokio::test]
async fn new_manager_starts_disconnected_with_no_device() {
    let manager = ConnectionManager::new(ClientConfig::default());
    assert_eq!(manager.state().await, ConnectionState::Disconnected);
    assert!(manager.device().await.is_none());
}

#[tokio::test]
async fn disconnect_on_a_fresh_manager_is_a_no_op() {
    let manager = ConnectionManager::new(ClientConfig::default());
    manager.disconnect().await;
    assert_eq!(manager.state().await, ConnectionState::Disconnected);
}
