//! Background scheduler that triggers sync cycles.
//!
//! Triggers come from three sources:
//! - a periodic timer, every `sync_interval_minutes` while `auto_sync` is on
//! - connectivity changes (reconnecting syncs immediately)
//! - explicit requests through [`Scheduler::request_sync`]
//!
//! Settings are read at each evaluation, so changes apply from the next
//! tick. A trigger that is not allowed to run is skipped, not delayed.

use crate::config::SyncSettings;
use crate::gateway::RemoteGateway;
use crate::state::SyncEngine;
use crate::store::LocalStore;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Network connectivity reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    /// No network.
    #[default]
    Offline,
    /// Wi-Fi.
    Wifi,
    /// Wired network.
    Ethernet,
    /// Metered mobile data.
    Cellular,
}

impl Connectivity {
    /// Returns true if any network is available.
    pub fn is_online(&self) -> bool {
        !matches!(self, Connectivity::Offline)
    }

    /// Returns true for unmetered connections.
    pub fn is_wifi_equivalent(&self) -> bool {
        matches!(self, Connectivity::Wifi | Connectivity::Ethernet)
    }
}

/// Why the scheduler started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The periodic timer fired.
    Timer,
    /// Connectivity came back.
    Reconnect,
    /// Someone asked for a sync.
    Manual,
}

/// Why a trigger was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// `auto_sync` is off (automatic triggers only).
    AutoSyncDisabled,
    /// No network.
    Offline,
    /// `sync_only_on_wifi` is on and the connection is metered.
    MeteredConnection,
    /// The app is in the background and `background_sync` is off.
    Backgrounded,
}

/// Decides whether a trigger may start a cycle.
pub fn evaluate(
    trigger: Trigger,
    settings: &SyncSettings,
    connectivity: Connectivity,
    foreground: bool,
) -> Result<(), SkipReason> {
    if !connectivity.is_online() {
        return Err(SkipReason::Offline);
    }
    if trigger == Trigger::Manual {
        return Ok(());
    }
    if !settings.auto_sync {
        return Err(SkipReason::AutoSyncDisabled);
    }
    if settings.sync_only_on_wifi && !connectivity.is_wifi_equivalent() {
        return Err(SkipReason::MeteredConnection);
    }
    if trigger == Trigger::Timer && !foreground && !settings.background_sync {
        return Err(SkipReason::Backgrounded);
    }
    Ok(())
}

/// Handle to a running scheduler task.
pub struct Scheduler {
    connectivity: watch::Sender<Connectivity>,
    foreground: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    manual: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Scheduler {
    /// Spawns the scheduler loop for `engine`.
    pub fn spawn<G, S>(engine: SyncEngine<G, S>, connectivity: Connectivity) -> Self
    where
        G: RemoteGateway + 'static,
        S: LocalStore + 'static,
    {
        let (connectivity_tx, connectivity_rx) = watch::channel(connectivity);
        let (foreground_tx, foreground_rx) = watch::channel(true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manual = Arc::new(Notify::new());

        engine.set_online(connectivity.is_online());
        let task = SchedulerTask {
            engine,
            connectivity: connectivity_rx,
            foreground: foreground_rx,
            shutdown: shutdown_rx,
            manual: Arc::clone(&manual),
        };
        let handle = tokio::spawn(task.run());

        Self {
            connectivity: connectivity_tx,
            foreground: foreground_tx,
            shutdown: shutdown_tx,
            manual,
            handle,
        }
    }

    /// Reports a connectivity change.
    pub fn set_connectivity(&self, connectivity: Connectivity) {
        self.connectivity.send_replace(connectivity);
    }

    /// Current connectivity.
    pub fn connectivity(&self) -> Connectivity {
        *self.connectivity.borrow()
    }

    /// Reports whether the app is in the foreground.
    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.send_replace(foreground);
    }

    /// Asks for a sync outside the timer. Skipped while offline.
    pub fn request_sync(&self) {
        self.manual.notify_one();
    }

    /// Stops the loop and waits for it to exit.
    ///
    /// A cycle already started keeps running to completion in its own task.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if self.handle.await.is_err() {
            debug!("scheduler task ended abnormally");
        }
    }
}

struct SchedulerTask<G, S> {
    engine: SyncEngine<G, S>,
    connectivity: watch::Receiver<Connectivity>,
    foreground: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
    manual: Arc<Notify>,
}

impl<G, S> SchedulerTask<G, S>
where
    G: RemoteGateway + 'static,
    S: LocalStore + 'static,
{
    async fn run(mut self) {
        let mut last_tick = Instant::now();
        let mut was_online = self.connectivity.borrow().is_online();
        info!(
            interval_minutes = self.engine.settings().sync_interval_minutes,
            "sync scheduler started"
        );

        loop {
            // re-read every evaluation so interval changes apply from the next tick
            let next_tick = last_tick + self.engine.settings().interval();

            tokio::select! {
                _ = self.shutdown.changed() => break,
                changed = self.connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now = *self.connectivity.borrow_and_update();
                    self.engine.set_online(now.is_online());
                    if now.is_online() && !was_online {
                        info!(connectivity = ?now, "connectivity restored");
                        self.trigger(Trigger::Reconnect).await;
                    } else if !now.is_online() && was_online {
                        info!("connectivity lost, sync suspended");
                    }
                    was_online = now.is_online();
                }
                changed = self.foreground.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.manual.notified() => {
                    self.trigger(Trigger::Manual).await;
                }
                _ = tokio::time::sleep_until(next_tick) => {
                    last_tick = Instant::now();
                    self.trigger(Trigger::Timer).await;
                }
            }
        }
        info!("sync scheduler stopped");
    }

    async fn trigger(&self, trigger: Trigger) {
        let settings = self.engine.settings();
        let connectivity = *self.connectivity.borrow();
        let foreground = *self.foreground.borrow();

        match evaluate(trigger, &settings, connectivity, foreground) {
            Ok(()) => {
                debug!(?trigger, "sync triggered");
                let result = self.engine.force_sync().await;
                debug!(?trigger, success = result.success, "triggered sync finished");
            }
            Err(reason) => debug!(?trigger, ?reason, "sync trigger skipped"),
        }
    }
}
