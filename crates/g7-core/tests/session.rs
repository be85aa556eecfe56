//! Session tracking, persistence and the monitor facade.

use std::time::Duration;

use time::OffsetDateTime;
use time::macros::datetime;
use tokio::time::timeout;

use g7_core::{
    BackfillRecord, Channel, Config, ConnectionState, Error, LifecycleState, MockTransport,
    PeripheralInfo, PowerState, SensorMonitor, SensorSession, SensorVariant, SessionConfig,
    SessionEvent, SessionState, TransportCall,
};

const T0: OffsetDateTime = datetime!(2026-03-01 08:00 UTC);

fn sensor() -> PeripheralInfo {
    PeripheralInfo::named("AA:BB:CC:DD:EE:01", "DXCM12")
}

/// A glucose message produced `secs` after activation.
fn glucose(sequence: u16, secs: u32, value: u16, state: u8) -> Vec<u8> {
    let mut data = vec![0u8; 19];
    data[0] = 0x4E;
    data[2..6].copy_from_slice(&secs.to_le_bytes());
    data[6..8].copy_from_slice(&sequence.to_le_bytes());
    data[12..14].copy_from_slice(&value.to_le_bytes());
    data[14] = state;
    data[15] = 0x7F;
    data[16..18].copy_from_slice(&0xFFFFu16.to_le_bytes());
    data
}

fn backfill(secs: u32, value: u16) -> Vec<u8> {
    let mut data = vec![0u8; 9];
    data[0..4].copy_from_slice(&secs.to_le_bytes());
    data[4..6].copy_from_slice(&value.to_le_bytes());
    data[6] = 6;
    data[8] = 0x7F;
    data
}

fn drain(rx: &mut g7_core::EventReceiver) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn kind(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::Connected { .. } => "connected",
        SessionEvent::ConnectionError { .. } => "connection_error",
        SessionEvent::ScanningChanged { .. } => "scanning_changed",
        SessionEvent::SensorAdopted { .. } => "sensor_adopted",
        SessionEvent::NewReading { .. } => "new_reading",
        SessionEvent::Backfill { .. } => "backfill",
        SessionEvent::ExtendedVersion { .. } => "extended_version",
        SessionEvent::Authentication { .. } => "authentication",
        SessionEvent::SensorForgotten => "sensor_forgotten",
        SessionEvent::StateChanged => "state_changed",
        _ => "other",
    }
}

// --- SensorSession ---

#[test]
fn test_first_reading_adopts_sensor() {
    let session = SensorSession::new(SessionState::new(), &SessionConfig::default());
    let mut rx = session.subscribe();
    let now = T0 + time::Duration::hours(2);

    session.handle_control(&sensor(), &glucose(24, 7200, 104, 6), now);

    let events = drain(&mut rx);
    let kinds: Vec<_> = events.iter().map(kind).collect();
    assert_eq!(kinds, vec!["sensor_adopted", "new_reading", "state_changed"]);

    let state = session.snapshot();
    assert_eq!(state.sensor_id.as_deref(), Some("DXCM12"));
    assert_eq!(state.variant, SensorVariant::G7);
    assert_eq!(state.activated_at, Some(T0));
    assert_eq!(state.latest_reading.as_ref().unwrap().glucose, Some(104));
}

#[test]
fn test_readings_are_never_duplicated() {
    let session = SensorSession::new(SessionState::new(), &SessionConfig::default());
    let now = T0 + time::Duration::hours(2);
    session.handle_control(&sensor(), &glucose(24, 7200, 104, 6), now);

    let mut rx = session.subscribe();
    session.handle_control(&sensor(), &glucose(24, 7200, 104, 6), now);
    session.handle_control(&sensor(), &glucose(23, 6900, 101, 6), now);
    assert!(drain(&mut rx).is_empty());

    session.handle_control(&sensor(), &glucose(25, 7500, 108, 6), now);
    let kinds: Vec<_> = drain(&mut rx).iter().map(kind).collect();
    assert_eq!(kinds, vec!["new_reading", "state_changed"]);
}

#[test]
fn test_backfill_delivered_once_before_next_reading() {
    let session = SensorSession::new(SessionState::new(), &SessionConfig::default());
    let now = T0 + time::Duration::hours(2);
    session.handle_control(&sensor(), &glucose(24, 7200, 104, 6), now);

    let mut rx = session.subscribe();
    session.handle_backfill(&backfill(6600, 98));
    session.handle_backfill(&backfill(6900, 101));
    session.handle_backfill(&backfill(6900, 101));
    session.handle_backfill(&backfill(7500, 108));
    assert!(drain(&mut rx).is_empty());

    // The live reading carries the 7500 s value itself.
    session.handle_control(&sensor(), &glucose(25, 7500, 108, 6), now);
    let events = drain(&mut rx);
    let kinds: Vec<_> = events.iter().map(kind).collect();
    assert_eq!(kinds, vec!["backfill", "new_reading", "state_changed"]);

    let SessionEvent::Backfill { records, .. } = &events[0] else {
        panic!("expected backfill, got {:?}", events[0]);
    };
    let timestamps: Vec<i64> = records
        .iter()
        .map(|r: &BackfillRecord| r.timestamp.whole_seconds())
        .collect();
    assert_eq!(timestamps, vec![6600, 6900]);

    session.handle_backfill(&backfill(6900, 101));
    session.handle_control(&sensor(), &glucose(26, 7800, 110, 6), now);
    let kinds: Vec<_> = drain(&mut rx).iter().map(kind).collect();
    assert_eq!(kinds, vec!["new_reading", "state_changed"]);
}

#[test]
fn test_backfill_skips_values_already_delivered_live() {
    let session = SensorSession::new(SessionState::new(), &SessionConfig::default());
    let now = T0 + time::Duration::hours(2);
    session.handle_control(&sensor(), &glucose(24, 7200, 104, 6), now);
    session.handle_control(&sensor(), &glucose(25, 7500, 108, 6), now);

    let mut rx = session.subscribe();
    session.handle_backfill(&backfill(7200, 104));
    session.handle_control(&sensor(), &glucose(26, 7800, 110, 6), now);
    let kinds: Vec<_> = drain(&mut rx).iter().map(kind).collect();
    assert_eq!(kinds, vec!["new_reading", "state_changed"]);
}

#[test]
fn test_restored_session_skips_backfill_up_to_latest_reading() {
    let session = SensorSession::new(SessionState::new(), &SessionConfig::default());
    let now = T0 + time::Duration::hours(2);
    session.handle_control(&sensor(), &glucose(24, 7200, 104, 6), now);

    let restored = SensorSession::new(session.snapshot(), &SessionConfig::default());
    let mut rx = restored.subscribe();
    restored.handle_backfill(&backfill(6900, 101));
    restored.handle_backfill(&backfill(7200, 104));
    restored.handle_backfill(&backfill(7350, 106));
    restored.handle_control(&sensor(), &glucose(25, 7500, 108, 6), now);

    let events = drain(&mut rx);
    let kinds: Vec<_> = events.iter().map(kind).collect();
    assert_eq!(kinds, vec!["backfill", "new_reading", "state_changed"]);
    let SessionEvent::Backfill { records, .. } = &events[0] else {
        panic!("expected backfill, got {:?}", events[0]);
    };
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].timestamp.whole_seconds(), 7350);
}

#[test]
fn test_extended_version_upgrades_to_fifteen_day() {
    let session = SensorSession::new(SessionState::new(), &SessionConfig::default());
    session.handle_control(&sensor(), &glucose(1, 60, 0xFFFF, 2), T0);

    // 15.5 days including 12 hours of grace, 60 minute warmup.
    let mut data = vec![0x52, 0x00];
    data.extend_from_slice(&(15 * 86_400 + 43_200u32).to_le_bytes());
    data.extend_from_slice(&3600u16.to_le_bytes());
    data.extend_from_slice(&[0x00, 0x02, 0x04, 0x04, 0xFF]);
    data.extend_from_slice(&12u16.to_le_bytes());
    session.handle_control(&sensor(), &data, T0);

    let state = session.snapshot();
    assert!(state.fifteen_day);
    assert_eq!(state.variant, SensorVariant::G7Extended);

    let report = session.lifecycle(T0 + time::Duration::minutes(30));
    assert_eq!(report.state, LifecycleState::Warmup);
    assert_eq!(
        report.expires_at,
        state.activated_at.map(|at| at + time::Duration::days(15))
    );
}

#[test]
fn test_failed_sensor_freezes_progress() {
    let session = SensorSession::new(SessionState::new(), &SessionConfig::default());
    let failed_at = T0 + time::Duration::days(5);
    session.handle_control(&sensor(), &glucose(1440, 5 * 86_400, 0xFFFF, 25), failed_at);

    let later = session.lifecycle(T0 + time::Duration::days(8));
    assert_eq!(later.state, LifecycleState::Failed);
    let progress = later.progress.unwrap();
    assert!((progress.fraction - 0.5).abs() < 1e-9);

    assert!(matches!(
        session.latest_reliable_reading(),
        Err(Error::Calibration(_))
    ));
}

#[test]
fn test_restored_sensor_limits_admission() {
    let state = SessionState {
        sensor_id: Some("DXCM12".into()),
        variant: SensorVariant::G7,
        activated_at: Some(T0),
        ..Default::default()
    };
    let session = SensorSession::new(state, &SessionConfig::default());
    assert!(session.admits(&sensor()));
    assert!(!session.admits(&PeripheralInfo::named("p-2", "DXCM99")));

    session.forget_sensor();
    assert!(session.admits(&PeripheralInfo::named("p-2", "DXCM99")));
    assert!(!session.snapshot().has_sensor());
}

#[test]
fn test_persisted_state_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let session = SensorSession::new(SessionState::new(), &SessionConfig::default());
    session.set_upload_readings(true);
    session.handle_control(&sensor(), &glucose(24, 7200, 104, 6), T0 + time::Duration::hours(2));
    session.snapshot().save(&path).unwrap();

    let restored = SessionState::load(&path).unwrap();
    assert_eq!(restored.sensor_id.as_deref(), Some("DXCM12"));
    assert_eq!(restored.activated_at, Some(T0));
    assert!(restored.upload_readings);
    assert_eq!(restored.latest_reading.as_ref().unwrap().sequence, 24);

    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(json["sensorType"], "G7");
    assert!(json.get("sensorID").is_some());
}

// --- SensorMonitor ---

async fn next_matching(
    rx: &mut g7_core::EventReceiver,
    wanted: &str,
) -> SessionEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.unwrap();
            if kind(&event) == wanted {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", wanted))
}

#[tokio::test]
async fn test_monitor_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("g7").join("state.json");
    let mut config = Config::default();
    config.session.state_path = Some(path.clone());

    let (transport, events) = MockTransport::new();
    transport.set_power_state(PowerState::PoweredOn);
    let monitor = SensorMonitor::start(transport.clone(), events, SessionState::new(), &config)
        .await
        .unwrap();
    let mut rx = monitor.subscribe();

    transport
        .discover(PeripheralInfo::named("p-1", "Polar H10 12345"))
        .await;
    transport.discover(sensor()).await;
    next_matching(&mut rx, "connected").await;
    assert_eq!(monitor.manager().state(), ConnectionState::Connected);

    // The monitor asks a newly connected sensor for its session timing.
    timeout(Duration::from_secs(2), async {
        while !transport.calls().iter().any(|c| {
            matches!(c, TransportCall::Write { channel: Channel::Control, data, .. } if data == &vec![0x52])
        }) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    transport
        .notify(&sensor().id, Channel::Control, &glucose(24, 7200, 104, 6))
        .await;
    let SessionEvent::NewReading { reading, .. } = next_matching(&mut rx, "new_reading").await
    else {
        unreachable!();
    };
    assert_eq!(reading.glucose, Some(104));
    assert_eq!(monitor.snapshot().sensor_id.as_deref(), Some("DXCM12"));
    assert_eq!(
        monitor.lifecycle(OffsetDateTime::now_utc()).state,
        LifecycleState::Ok
    );

    timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(state) = SessionState::load(&path)
                && state.latest_reading.is_some()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_monitor_scan_for_new_sensor() {
    let (transport, events) = MockTransport::new();
    transport.set_power_state(PowerState::PoweredOn);
    let monitor = SensorMonitor::start(
        transport.clone(),
        events,
        SessionState::new(),
        &Config::default(),
    )
    .await
    .unwrap();
    let mut rx = monitor.subscribe();

    transport.discover(sensor()).await;
    next_matching(&mut rx, "connected").await;
    transport
        .notify(&sensor().id, Channel::Control, &glucose(24, 7200, 104, 6))
        .await;
    next_matching(&mut rx, "new_reading").await;

    monitor.scan_for_new_sensor().await.unwrap();
    assert!(!monitor.snapshot().has_sensor());
    assert_eq!(monitor.manager().peripheral_id(), None);
    assert!(monitor.manager().is_scanning().await.unwrap());

    let second = PeripheralInfo::named("AA:BB:CC:DD:EE:02", "DX0255");
    transport.discover(second.clone()).await;
    next_matching(&mut rx, "connected").await;
    assert_eq!(monitor.manager().peripheral_id(), Some(second.id));
}

#[tokio::test]
async fn test_monitor_rejects_invalid_config() {
    let (transport, events) = MockTransport::new();
    transport.set_power_state(PowerState::PoweredOn);
    let mut config = Config::default();
    config.session.event_capacity = 0;

    let result = SensorMonitor::start(transport.clone(), events, SessionState::new(), &config).await;
    assert!(matches!(result, Err(Error::Config(_))));
    assert_eq!(transport.start_scan_count(), 0);
}
