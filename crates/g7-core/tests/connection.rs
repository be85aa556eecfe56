//! Connection manager behaviour against the mock transport.
//!
//! Every manager request is queued behind the transport events already
//! delivered, so awaiting any request (see [`settle`]) guarantees those
//! events have been handled.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use g7_core::uuids::ADVERTISEMENT_SERVICE;
use g7_core::{
    Channel, ConnectionConfig, ConnectionDelegate, ConnectionManager, ConnectionState,
    DisconnectReason, Error, MockTransport, PeripheralId, PeripheralInfo, PowerState, Result,
    TransportCall, TransportEvent,
};

/// Delegate that records every callback.
#[derive(Default)]
struct Recorder {
    rejected_prefix: Option<&'static str>,
    ready: Mutex<Vec<std::result::Result<String, String>>>,
    data: Mutex<Vec<(Channel, Vec<u8>)>>,
    scanning: Mutex<Vec<bool>>,
}

impl Recorder {
    fn rejecting(prefix: &'static str) -> Self {
        Self {
            rejected_prefix: Some(prefix),
            ..Default::default()
        }
    }

    fn ready(&self) -> Vec<std::result::Result<String, String>> {
        self.ready.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<String> {
        self.ready().into_iter().filter_map(|r| r.err()).collect()
    }

    fn data(&self) -> Vec<(Channel, Vec<u8>)> {
        self.data.lock().unwrap().clone()
    }

    fn scanning(&self) -> Vec<bool> {
        self.scanning.lock().unwrap().clone()
    }
}

impl ConnectionDelegate for Recorder {
    fn should_connect(&self, peripheral: &PeripheralInfo) -> bool {
        match (self.rejected_prefix, peripheral.name.as_deref()) {
            (Some(prefix), Some(name)) => !name.starts_with(prefix),
            _ => true,
        }
    }

    fn connection_ready(&self, peripheral: &PeripheralInfo, result: Result<()>) {
        let entry = match result {
            Ok(()) => Ok(peripheral.id.to_string()),
            Err(e) => Err(e.to_string()),
        };
        self.ready.lock().unwrap().push(entry);
    }

    fn data_received(&self, _peripheral: &PeripheralInfo, channel: Channel, data: &[u8]) {
        self.data.lock().unwrap().push((channel, data.to_vec()));
    }

    fn scanning_status_changed(&self, scanning: bool) {
        self.scanning.lock().unwrap().push(scanning);
    }
}

struct Harness {
    transport: Arc<MockTransport>,
    recorder: Arc<Recorder>,
    manager: ConnectionManager,
}

fn harness_with(recorder: Recorder, config: ConnectionConfig, power: PowerState) -> Harness {
    let (transport, events) = MockTransport::new();
    transport.set_power_state(power);
    let recorder = Arc::new(recorder);
    let delegate: Arc<dyn ConnectionDelegate> = recorder.clone();
    let manager = ConnectionManager::spawn(Arc::clone(&transport), events, Some(delegate), &config);
    Harness {
        transport,
        recorder,
        manager,
    }
}

fn harness() -> Harness {
    harness_with(
        Recorder::default(),
        ConnectionConfig::default(),
        PowerState::PoweredOn,
    )
}

fn sensor() -> PeripheralInfo {
    PeripheralInfo::named("AA:BB:CC:DD:EE:01", "DXCM12")
}

/// Wait until every event delivered so far has been handled.
async fn settle(manager: &ConnectionManager) {
    manager.is_scanning().await.unwrap();
}

async fn connect(h: &Harness) {
    h.manager.scan_for_peripheral().await.unwrap();
    h.transport.discover(sensor()).await;
    settle(&h.manager).await;
    assert_eq!(h.manager.state(), ConnectionState::Connected);
}

// --- Scanning ---

#[tokio::test]
async fn test_scan_when_powered_on() {
    let h = harness();
    h.manager.scan_for_peripheral().await.unwrap();

    assert_eq!(
        h.transport.calls(),
        vec![TransportCall::StartScan(vec![ADVERTISEMENT_SERVICE])]
    );
    assert!(h.manager.is_scanning().await.unwrap());
    assert_eq!(h.manager.state(), ConnectionState::Scanning);
    assert_eq!(h.recorder.scanning(), vec![true]);
}

#[tokio::test]
async fn test_scan_is_idempotent() {
    let h = harness();
    h.manager.scan_for_peripheral().await.unwrap();
    h.manager.scan_for_peripheral().await.unwrap();
    assert_eq!(h.transport.start_scan_count(), 1);
    assert_eq!(h.recorder.scanning(), vec![true]);
}

#[tokio::test]
async fn test_scan_deferred_until_power_on() {
    let h = harness_with(
        Recorder::default(),
        ConnectionConfig::default(),
        PowerState::PoweredOff,
    );
    h.manager.scan_for_peripheral().await.unwrap();
    assert_eq!(h.transport.start_scan_count(), 0);
    assert_eq!(h.manager.state(), ConnectionState::Idle);

    h.transport.power_on().await;
    settle(&h.manager).await;
    assert_eq!(h.transport.start_scan_count(), 1);
    assert_eq!(h.manager.state(), ConnectionState::Scanning);
}

#[tokio::test]
async fn test_power_off_stops_scan() {
    let h = harness();
    h.manager.scan_for_peripheral().await.unwrap();

    h.transport.power_off().await;
    settle(&h.manager).await;
    assert!(!h.manager.is_scanning().await.unwrap());
    assert_eq!(h.manager.state(), ConnectionState::Idle);
    assert_eq!(h.recorder.scanning(), vec![true, false]);
}

#[tokio::test]
async fn test_stop_scanning_notifies_only_on_edge() {
    let h = harness();
    h.manager.stop_scanning().await.unwrap();
    assert!(h.recorder.scanning().is_empty());

    h.manager.scan_for_peripheral().await.unwrap();
    h.manager.stop_scanning().await.unwrap();
    h.manager.stop_scanning().await.unwrap();

    assert_eq!(h.recorder.scanning(), vec![true, false]);
    assert_eq!(h.manager.state(), ConnectionState::Idle);
}

// --- Connecting ---

#[tokio::test]
async fn test_discovery_connects_and_reports_ready() {
    let h = harness();
    connect(&h).await;

    let id = sensor().id;
    assert_eq!(
        h.transport.calls(),
        vec![
            TransportCall::StartScan(vec![ADVERTISEMENT_SERVICE]),
            TransportCall::Connect(id.clone()),
            TransportCall::StopScan,
            TransportCall::Configure(id.clone()),
        ]
    );
    assert_eq!(h.recorder.ready(), vec![Ok(id.to_string())]);
    assert_eq!(h.manager.peripheral_id(), Some(id));
    assert!(h.manager.is_connected().await.unwrap());
    assert_eq!(h.recorder.scanning(), vec![true, false]);
}

#[tokio::test]
async fn test_admission_check_rejects_peripheral() {
    let h = harness_with(
        Recorder::rejecting("DXCM"),
        ConnectionConfig::default(),
        PowerState::PoweredOn,
    );
    h.manager.scan_for_peripheral().await.unwrap();
    h.transport.discover(sensor()).await;
    settle(&h.manager).await;

    assert_eq!(h.transport.connect_count(), 0);
    assert_eq!(h.manager.state(), ConnectionState::Scanning);
    assert_eq!(h.manager.peripheral_id(), None);
}

#[tokio::test]
async fn test_no_delegate_accepts_everything() {
    let (transport, events) = MockTransport::new();
    transport.set_power_state(PowerState::PoweredOn);
    let manager = ConnectionManager::spawn(
        Arc::clone(&transport),
        events,
        None,
        &ConnectionConfig::default(),
    );
    manager.scan_for_peripheral().await.unwrap();
    transport
        .discover(PeripheralInfo::named("p-9", "Anything"))
        .await;
    settle(&manager).await;
    assert!(manager.is_connected().await.unwrap());
}

#[tokio::test]
async fn test_adopts_already_connected_peripheral() {
    let h = harness();
    h.transport.add_connected_peripheral(sensor());
    h.manager.scan_for_peripheral().await.unwrap();
    settle(&h.manager).await;

    assert_eq!(h.transport.connect_count(), 1);
    assert_eq!(h.transport.start_scan_count(), 0);
    assert!(h.manager.is_connected().await.unwrap());
}

#[tokio::test]
async fn test_reconnects_to_remembered_peripheral() {
    let h = harness();
    h.transport.add_known_peripheral(sensor());
    h.manager.set_peripheral_id(Some(sensor().id));

    h.manager.scan_for_peripheral().await.unwrap();
    settle(&h.manager).await;

    assert_eq!(
        h.transport.calls().first(),
        Some(&TransportCall::Connect(sensor().id))
    );
    assert!(h.manager.is_connected().await.unwrap());
}

#[tokio::test]
async fn test_restored_peripheral_adopted_only_without_link() {
    let h = harness_with(
        Recorder::default(),
        ConnectionConfig::default(),
        PowerState::PoweredOff,
    );
    let restored = PeripheralInfo::named("AA:BB:CC:DD:EE:03", "DXCM34");
    h.transport
        .emit(TransportEvent::Restored(vec![restored.clone()]))
        .await;
    settle(&h.manager).await;
    assert_eq!(h.manager.peripheral_id(), Some(restored.id.clone()));
    assert_eq!(h.transport.connect_count(), 0);

    h.manager.forget_peripheral().await.unwrap();
    h.transport.power_on().await;
    h.transport.discover(sensor()).await;
    settle(&h.manager).await;
    assert_eq!(h.manager.state(), ConnectionState::Connected);

    h.transport
        .emit(TransportEvent::Restored(vec![restored]))
        .await;
    settle(&h.manager).await;
    assert_eq!(h.manager.peripheral_id(), Some(sensor().id));
    assert!(h.manager.is_connected().await.unwrap());
}

#[tokio::test]
async fn test_scan_while_connecting_keeps_scanning() {
    let h = harness_with(
        Recorder::default(),
        ConnectionConfig::default().scan_while_connecting(true),
        PowerState::PoweredOn,
    );
    h.transport.set_auto_respond(false);
    h.manager.scan_for_peripheral().await.unwrap();
    h.transport.discover(sensor()).await;
    settle(&h.manager).await;

    assert_eq!(h.manager.state(), ConnectionState::Connecting);
    assert!(h.manager.is_scanning().await.unwrap());

    h.transport
        .emit(TransportEvent::Connected(sensor().id))
        .await;
    settle(&h.manager).await;
    assert!(h.manager.is_connected().await.unwrap());
    assert!(h.manager.is_scanning().await.unwrap());
}

#[tokio::test]
async fn test_discovery_ignored_while_connected() {
    let h = harness();
    connect(&h).await;
    h.transport.clear_calls();

    h.transport
        .discover(PeripheralInfo::named("AA:BB:CC:DD:EE:02", "DXCM34"))
        .await;
    settle(&h.manager).await;

    assert!(h.transport.calls().is_empty());
    assert_eq!(h.manager.peripheral_id(), Some(sensor().id));
}

#[tokio::test]
async fn test_configure_failure_reports_and_releases() {
    let h = harness();
    h.transport.set_fail_configure(true);
    h.manager.scan_for_peripheral().await.unwrap();
    h.transport.discover(sensor()).await;
    settle(&h.manager).await;

    assert_eq!(h.recorder.errors().len(), 1);
    assert!(
        h.transport
            .calls()
            .contains(&TransportCall::CancelConnection(sensor().id))
    );
    assert!(!h.manager.is_connected().await.unwrap());
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let h = harness();
    h.transport.set_auto_respond(false);
    h.manager.scan_for_peripheral().await.unwrap();
    h.transport.discover(sensor()).await;
    h.transport
        .emit(TransportEvent::ConnectFailed {
            id: sensor().id,
            reason: g7_core::ConnectionFailureReason::Timeout,
        })
        .await;
    settle(&h.manager).await;

    assert_eq!(h.recorder.errors().len(), 1);
    assert_eq!(h.manager.state(), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_rescans_after_delay() {
    let h = harness();
    h.transport.set_auto_respond(false);
    h.manager.scan_for_peripheral().await.unwrap();
    h.transport.discover(sensor()).await;
    settle(&h.manager).await;
    h.transport.clear_calls();

    h.transport
        .emit(TransportEvent::ConnectFailed {
            id: sensor().id,
            reason: g7_core::ConnectionFailureReason::Timeout,
        })
        .await;
    settle(&h.manager).await;
    assert_eq!(h.recorder.errors().len(), 1);

    tokio::time::sleep(Duration::from_millis(1900)).await;
    settle(&h.manager).await;
    assert_eq!(h.transport.start_scan_count(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    settle(&h.manager).await;
    assert_eq!(h.transport.start_scan_count(), 1);
    assert_eq!(h.manager.state(), ConnectionState::Scanning);
}

// --- Disconnects and rescans ---

#[tokio::test(start_paused = true)]
async fn test_unexpected_disconnect_rescans_after_delay() {
    let h = harness();
    connect(&h).await;
    h.transport.clear_calls();

    h.transport
        .emit(TransportEvent::Disconnected {
            id: sensor().id,
            reason: DisconnectReason::LinkLost,
        })
        .await;
    settle(&h.manager).await;

    assert_eq!(h.recorder.errors().len(), 1);
    assert_eq!(h.manager.state(), ConnectionState::Idle);

    tokio::time::sleep(Duration::from_millis(1900)).await;
    settle(&h.manager).await;
    assert_eq!(h.transport.start_scan_count(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    settle(&h.manager).await;
    assert_eq!(h.transport.start_scan_count(), 1);
    assert_eq!(h.manager.state(), ConnectionState::Scanning);
}

#[tokio::test(start_paused = true)]
async fn test_benign_disconnect_is_silent_but_rescans() {
    let h = harness();
    connect(&h).await;
    h.transport.clear_calls();

    h.transport
        .emit(TransportEvent::Disconnected {
            id: sensor().id,
            reason: DisconnectReason::PeripheralDisconnected,
        })
        .await;
    settle(&h.manager).await;
    assert!(h.recorder.errors().is_empty());

    tokio::time::sleep(Duration::from_millis(2100)).await;
    settle(&h.manager).await;
    assert_eq!(h.transport.start_scan_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rescan_reconnects_known_peripheral() {
    let h = harness();
    h.transport.add_known_peripheral(sensor());
    connect(&h).await;
    h.transport.clear_calls();

    h.transport
        .emit(TransportEvent::Disconnected {
            id: sensor().id,
            reason: DisconnectReason::LinkLost,
        })
        .await;
    tokio::time::sleep(Duration::from_millis(2100)).await;
    settle(&h.manager).await;

    assert_eq!(h.transport.connect_count(), 1);
    assert!(h.manager.is_connected().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_no_rescan_without_stay_connected() {
    let h = harness_with(
        Recorder::default(),
        ConnectionConfig::default().stay_connected(false),
        PowerState::PoweredOn,
    );
    connect(&h).await;
    h.transport.clear_calls();

    h.transport
        .emit(TransportEvent::Disconnected {
            id: sensor().id,
            reason: DisconnectReason::LinkLost,
        })
        .await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    settle(&h.manager).await;

    assert_eq!(h.transport.start_scan_count(), 0);
    assert_eq!(h.recorder.errors().len(), 1);
}

#[tokio::test]
async fn test_disconnect_keeps_identifier() {
    let h = harness();
    connect(&h).await;

    h.manager.disconnect().await.unwrap();
    settle(&h.manager).await;

    assert!(!h.manager.is_connected().await.unwrap());
    assert_eq!(h.manager.peripheral_id(), Some(sensor().id));
    assert!(
        h.transport
            .calls()
            .contains(&TransportCall::CancelConnection(sensor().id))
    );
    assert!(h.recorder.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_forget_clears_identifier_and_pending_rescan() {
    let h = harness();
    connect(&h).await;
    h.transport
        .emit(TransportEvent::Disconnected {
            id: sensor().id,
            reason: DisconnectReason::LinkLost,
        })
        .await;
    settle(&h.manager).await;
    h.transport.clear_calls();

    h.manager.forget_peripheral().await.unwrap();
    assert_eq!(h.manager.peripheral_id(), None);

    tokio::time::sleep(Duration::from_secs(5)).await;
    settle(&h.manager).await;
    assert_eq!(h.transport.start_scan_count(), 0);
    assert_eq!(h.manager.state(), ConnectionState::Idle);
}

#[tokio::test]
async fn test_forget_releases_link() {
    let h = harness();
    connect(&h).await;

    h.manager.forget_peripheral().await.unwrap();
    settle(&h.manager).await;

    assert_eq!(h.manager.peripheral_id(), None);
    assert!(!h.manager.is_connected().await.unwrap());
    assert!(
        h.transport
            .calls()
            .contains(&TransportCall::CancelConnection(sensor().id))
    );
}

// --- Payload routing ---

#[tokio::test]
async fn test_payloads_routed_by_channel() {
    let h = harness();
    connect(&h).await;
    let id = sensor().id;

    h.transport.notify(&id, Channel::Control, &[0x4E]).await;
    h.transport.notify(&id, Channel::Communication, &[0x01]).await;
    h.transport.notify(&id, Channel::Backfill, &[0x02]).await;
    h.transport.notify(&id, Channel::Authentication, &[0x05]).await;
    settle(&h.manager).await;

    assert_eq!(
        h.recorder.data(),
        vec![
            (Channel::Control, vec![0x4E]),
            (Channel::Backfill, vec![0x02]),
            (Channel::Authentication, vec![0x05]),
        ]
    );
}

#[tokio::test]
async fn test_payload_from_other_peripheral_dropped() {
    let h = harness();
    connect(&h).await;

    h.transport
        .notify(&PeripheralId::new("someone-else"), Channel::Control, &[0x4E])
        .await;
    settle(&h.manager).await;
    assert!(h.recorder.data().is_empty());
}

#[tokio::test]
async fn test_write_requires_connection() {
    let h = harness();
    let result = h.manager.write(Channel::Control, vec![0x52]).await;
    assert!(matches!(result, Err(Error::NotConnected)));

    connect(&h).await;
    h.manager.write(Channel::Control, vec![0x52]).await.unwrap();
    assert!(h.transport.calls().contains(&TransportCall::Write {
        id: sensor().id,
        channel: Channel::Control,
        data: vec![0x52],
    }));
}

// --- Lifecycle of the manager itself ---

#[tokio::test]
async fn test_flags_are_readable_without_the_worker() {
    let h = harness();
    assert!(h.manager.stay_connected());
    h.manager.set_stay_connected(false);
    assert!(!h.manager.stay_connected());

    assert!(!h.manager.scan_while_connecting());
    h.manager.set_scan_while_connecting(true);
    assert!(h.manager.scan_while_connecting());
}

#[tokio::test]
async fn test_watch_state_observes_connection() {
    let h = harness();
    let mut state = h.manager.watch_state();
    connect(&h).await;
    state
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_requests_fail_after_shutdown() {
    let h = harness();
    h.manager.shutdown();
    let result = h.manager.scan_for_peripheral().await;
    assert!(matches!(result, Err(Error::ManagerClosed)));
}
