//! High-level sensor monitor.
//!
//! [`SensorMonitor`] wires a [`SensorSession`] to a [`ConnectionManager`] and
//! runs a small background task that reacts to session events: it asks a
//! freshly connected sensor for its session timing and persists state when
//! it changes.
//!
//! # Example
//!
//! ```ignore
//! use g7_core::{BtleplugTransport, Config, SensorMonitor, SessionState};
//!
//! let config = Config::load_or_default("g7.toml")?;
//! let (transport, events) = BtleplugTransport::new(64).await?;
//! let monitor = SensorMonitor::start(transport, events, SessionState::default(), &config).await?;
//!
//! let mut rx = monitor.subscribe();
//! while let Ok(event) = rx.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use g7_types::{Channel, ControlRequest};

use crate::config::Config;
use crate::error::Result;
use crate::events::{EventReceiver, SessionEvent};
use crate::lifecycle::LifecycleReport;
use crate::manager::ConnectionManager;
use crate::session::SensorSession;
use crate::state::SessionState;
use crate::traits::ConnectionDelegate;
use crate::transport::{Transport, TransportEvent};

/// A running sensor session: connection manager, session state and the
/// background task tying them together.
///
/// Dropping the monitor stops the manager and the background task.
pub struct SensorMonitor {
    manager: Arc<ConnectionManager>,
    session: Arc<SensorSession>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SensorMonitor {
    /// Start monitoring with restored (or empty) state and begin scanning.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if `config` fails validation.
    pub async fn start<T: Transport>(
        transport: Arc<T>,
        events: mpsc::Receiver<TransportEvent>,
        initial: SessionState,
        config: &Config,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(sensor) = &initial.sensor_id {
            info!("Restoring session for sensor {}", sensor);
        }

        let session = Arc::new(SensorSession::new(initial, &config.session));
        let delegate: Arc<dyn ConnectionDelegate> = session.clone();
        let manager = Arc::new(ConnectionManager::spawn(
            transport,
            events,
            Some(delegate),
            &config.connection,
        ));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_background(
            Arc::clone(&manager),
            Arc::clone(&session),
            config.session.state_path.clone(),
            session.subscribe(),
            cancel.clone(),
        ));

        manager.scan_for_peripheral().await?;

        Ok(Self {
            manager,
            session,
            cancel,
            task,
        })
    }

    /// Drop the paired sensor and look for a new one.
    pub async fn scan_for_new_sensor(&self) -> Result<()> {
        self.manager.forget_peripheral().await?;
        self.session.forget_sensor();
        self.manager.scan_for_peripheral().await
    }

    /// Drop the paired sensor and stop looking.
    pub async fn forget_sensor(&self) -> Result<()> {
        self.manager.forget_peripheral().await?;
        self.manager.stop_scanning().await?;
        self.session.forget_sensor();
        Ok(())
    }

    pub fn snapshot(&self) -> SessionState {
        self.session.snapshot()
    }

    pub fn lifecycle(&self, now: OffsetDateTime) -> LifecycleReport {
        self.session.lifecycle(now)
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.session.subscribe()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn session(&self) -> &SensorSession {
        &self.session
    }

    /// Stop the manager and the background task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.manager.shutdown();
    }
}

impl Drop for SensorMonitor {
    fn drop(&mut self) {
        self.shutdown();
        self.task.abort();
    }
}

impl std::fmt::Debug for SensorMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorMonitor")
            .field("manager", &self.manager)
            .field("sensor", &self.session.snapshot().sensor_id)
            .finish()
    }
}

async fn run_background(
    manager: Arc<ConnectionManager>,
    session: Arc<SensorSession>,
    state_path: Option<PathBuf>,
    mut events: EventReceiver,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(SessionEvent::Connected { sensor }) => {
                if session.snapshot().extended_version.is_none() {
                    debug!("Requesting session timing from {}", sensor.id);
                    let request = ControlRequest::ExtendedVersion.to_bytes();
                    if let Err(e) = manager.write(Channel::Control, request).await {
                        warn!("Failed to request session timing: {}", e);
                    }
                }
            }
            Ok(SessionEvent::StateChanged) => persist(&session, state_path.as_deref()),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // A skipped StateChanged would otherwise go unsaved.
                warn!("Monitor lagged, skipped {} session events", skipped);
                persist(&session, state_path.as_deref());
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Monitor task stopped");
}

fn persist(session: &SensorSession, path: Option<&Path>) {
    if let Some(path) = path
        && let Err(e) = session.snapshot().save(path)
    {
        warn!("Failed to persist session state to {}: {}", path.display(), e);
    }
}
