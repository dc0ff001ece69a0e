//! Process life cycle and graceful shutdown.
//!
//! See <https://tokio.rs/tokio/topics/shutdown> for the idea. A watch
//! channel fans the stop signal out to every session; an mpsc channel
//! whose senders are the outstanding [`Activity`] clones tells the
//! waiter when the last one has gone away. Sessions observe the signal
//! at their read boundary, answer `421`, and drop their Activity on the
//! way out.

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc::{Receiver as MpscReceiver, Sender as MpscSender};
use tokio::sync::watch::{Receiver as WatchReceiver, Sender as WatchSender};

static ACTIVE: OnceCell<Mutex<Option<Activity>>> = OnceCell::new();
static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);
static STOPPING: OnceCell<ShutdownState> = OnceCell::new();

/// Represents some activity which cannot be ruthlessly interrupted:
/// a live session, in this server. While any Activity instances are
/// alive, [`LifeCycle::wait_for_shutdown`] cannot complete.
#[derive(Clone)]
pub struct Activity {
    _tx: MpscSender<()>,
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Activity").finish()
    }
}

impl Activity {
    /// Obtain an Activity instance, or `None` once the process is
    /// shutting down and no new work may start.
    pub fn get_opt() -> Option<Self> {
        Some(ACTIVE.get()?.lock().unwrap().as_ref()?.clone())
    }

    pub fn get() -> anyhow::Result<Self> {
        Self::get_opt().ok_or_else(|| anyhow::anyhow!("shutting down"))
    }

    pub fn is_shutting_down(&self) -> bool {
        SHUTTING_DOWN.load(Ordering::Relaxed)
    }
}

struct ShutdownState {
    tx: WatchSender<()>,
    rx: WatchReceiver<()>,
    request_shutdown_tx: MpscSender<()>,
    reason: Mutex<String>,
}

/// Select on [`ShutdownSubscription::shutting_down`] alongside your
/// normal work to wake up when the process begins to stop. Once the
/// signal has fired it stays fired; re-selecting completes
/// immediately.
pub struct ShutdownSubscription {
    rx: WatchReceiver<()>,
    fired: bool,
}

impl ShutdownSubscription {
    pub fn get() -> Self {
        Self {
            rx: STOPPING.get().expect("LifeCycle::new not called").rx.clone(),
            fired: false,
        }
    }

    pub async fn shutting_down(&mut self) {
        if self.fired {
            return;
        }
        self.rx.changed().await.ok();
        self.fired = true;
    }

    /// A subscription that never fires, for embedding the session
    /// engine without a process life cycle (tests, tools).
    pub fn never() -> Self {
        let (tx, rx) = tokio::sync::watch::channel(());
        // Keep the sender alive forever so the channel never closes.
        std::mem::forget(tx);
        Self { rx, fired: false }
    }

    /// A subscription paired with its trigger, for driving sessions
    /// directly without the global life cycle.
    pub fn manual() -> (WatchSender<()>, Self) {
        let (tx, rx) = tokio::sync::watch::channel(());
        (tx, Self { rx, fired: false })
    }

    /// The operator-supplied reason, used as the 421 text.
    pub fn reason() -> String {
        STOPPING
            .get()
            .map(|s| s.reason.lock().unwrap().clone())
            .unwrap_or_else(|| "Service shutting down".to_string())
    }
}

/// Owns the global life cycle state. Create exactly one, early.
pub struct LifeCycle {
    activity_rx: MpscReceiver<()>,
    request_shutdown_rx: MpscReceiver<()>,
}

impl LifeCycle {
    /// Initialize the process life cycle. May be called only once;
    /// panics otherwise.
    pub fn new() -> Self {
        let (activity_tx, activity_rx) = tokio::sync::mpsc::channel(1);
        ACTIVE
            .set(Mutex::new(Some(Activity { _tx: activity_tx })))
            .map_err(|_| ())
            .expect("LifeCycle::new called twice");

        let (request_shutdown_tx, request_shutdown_rx) = tokio::sync::mpsc::channel(1);
        let (tx, rx) = tokio::sync::watch::channel(());
        STOPPING
            .set(ShutdownState {
                tx,
                rx,
                request_shutdown_tx,
                reason: Mutex::new("Service shutting down".to_string()),
            })
            .map_err(|_| ())
            .expect("LifeCycle::new called twice");

        Self {
            activity_rx,
            request_shutdown_rx,
        }
    }

    /// Ask the process to stop. Wakes the `wait_for_shutdown` caller.
    pub async fn request_shutdown(reason: &str) {
        if let Some(state) = STOPPING.get() {
            *state.reason.lock().unwrap() = reason.to_string();
            state.request_shutdown_tx.send(()).await.ok();
        }
    }

    /// Block until a shutdown is requested (signal or
    /// [`LifeCycle::request_shutdown`]), propagate the stop signal to
    /// sessions, then wait for them to drain. Returns an error if the
    /// sessions did not drain within `limit`; the listeners are closed
    /// either way.
    pub async fn wait_for_shutdown(&mut self, limit: Duration) -> anyhow::Result<()> {
        wait_for_stop_request(&mut self.request_shutdown_rx).await;
        tracing::info!("shutdown requested, notifying sessions");

        SHUTTING_DOWN.store(true, Ordering::SeqCst);
        // Drop the prototype Activity so the drain below can finish,
        // and refuse new ones.
        ACTIVE.get().map(|a| a.lock().unwrap().take());
        STOPPING.get().map(|s| s.tx.send(()).ok());

        match tokio::time::timeout(limit, self.activity_rx.recv()).await {
            Ok(_) => {
                tracing::info!("all sessions closed, shutdown complete");
                Ok(())
            }
            Err(_) => anyhow::bail!("shutdown deadline elapsed with sessions still open"),
        }
    }
}

/// SIGINT, SIGTERM (where available) or an in-process request.
async fn wait_for_stop_request(request_rx: &mut MpscReceiver<()>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                    _ = request_rx.recv() => {}
                };
            }
            Err(err) => {
                tracing::warn!("unable to install SIGTERM handler: {err}");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = request_rx.recv() => {}
                };
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = request_rx.recv() => {}
        };
    }
}
