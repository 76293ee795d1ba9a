use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::events::LoungeEvent;
use crate::retry::{shutdown_requested, sleep_or_shutdown, RetryPolicy};
use crate::sender::LoungeSender;

/// While playing, ping once the last position update is older than this.
const ACTIVE_STALE: Duration = Duration::from_secs(7);
const ACTIVE_INTERVAL: Duration = Duration::from_secs(7);
/// While paused, ping this long after the last successful ping.
const PAUSED_INTERVAL: Duration = Duration::from_secs(18);

/// What the liveness loop needs to know about local playback.
pub trait PlaybackProbe: Send + Sync + 'static {
    fn is_paused(&self) -> bool;
    /// When the last playback position update was observed.
    fn last_update(&self) -> Instant;
}

/// [`PlaybackProbe`] fed from now-playing snapshots.
pub struct PlaybackState {
    inner: Mutex<(bool, Instant)>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            inner: Mutex::new((true, Instant::now())),
        }
    }
}

impl PlaybackState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, is_playing: bool) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = (!is_playing, Instant::now());
    }
}

impl PlaybackProbe for PlaybackState {
    fn is_paused(&self) -> bool {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    fn last_update(&self) -> Instant {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).1
    }
}

/// A spawned loop plus the switch that stops it.
struct Worker {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Worker {
    fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (stop, rx) = watch::channel(false);
        Self {
            stop,
            task: tokio::spawn(f(rx)),
        }
    }

    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                tracing::warn!("[heartbeat] task ended abnormally: {e}");
            }
        }
    }
}

/// Background loops that keep a remote-control session honest: the
/// reachability probe, the streaming reader and the liveness ping.
///
/// Dropping the controller aborts whatever is still running; call
/// [`shutdown`](Self::shutdown) for an orderly stop.
pub struct HeartbeatController {
    sender: LoungeSender,
    reachability: Option<Worker>,
    stream: Option<Worker>,
    liveness: Option<Worker>,
}

impl HeartbeatController {
    pub fn new(sender: LoungeSender) -> Self {
        Self {
            sender,
            reachability: None,
            stream: None,
            liveness: None,
        }
    }

    /// Probe the selected device every 15s. No-op if already running.
    pub fn start_reachability(&mut self) {
        if self.reachability.as_ref().is_some_and(Worker::is_running) {
            return;
        }
        let sender = self.sender.clone();
        self.reachability = Some(Worker::spawn(|stop| reachability_loop(sender, stop)));
    }

    pub async fn stop_reachability(&mut self) {
        if let Some(worker) = self.reachability.take() {
            worker.stop().await;
        }
    }

    /// Start the streaming reader and the liveness ping for the device being
    /// driven. Restarts both unless both are still running.
    pub async fn start_heartbeat(&mut self, probe: Arc<dyn PlaybackProbe>) {
        let running = |w: &Option<Worker>| w.as_ref().is_some_and(Worker::is_running);
        if running(&self.stream) && running(&self.liveness) {
            return;
        }
        self.stop_heartbeat().await;

        let sender = self.sender.clone();
        self.stream = Some(Worker::spawn(|stop| async move {
            if let Err(e) = sender.stream_now_playing(stop).await {
                tracing::warn!("[heartbeat] streaming reader stopped: {e}");
                sender.events().publish(LoungeEvent::ConnectionLost);
            }
        }));

        let sender = self.sender.clone();
        self.liveness = Some(Worker::spawn(|stop| liveness_loop(sender, probe, stop)));
    }

    pub async fn stop_heartbeat(&mut self) {
        if let Some(worker) = self.liveness.take() {
            worker.stop().await;
        }
        if let Some(worker) = self.stream.take() {
            worker.stop().await;
        }
    }

    /// Stop every loop and wait for them to finish.
    pub async fn shutdown(&mut self) {
        self.stop_reachability().await;
        self.stop_heartbeat().await;
        tracing::debug!("[heartbeat] all loops stopped");
    }
}

impl Drop for HeartbeatController {
    fn drop(&mut self) {
        for worker in [&self.reachability, &self.stream, &self.liveness].into_iter().flatten() {
            worker.task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

async fn reachability_loop(sender: LoungeSender, mut stop: watch::Receiver<bool>) {
    let policy = RetryPolicy::REACHABILITY;
    let events = sender.events().clone();
    let mut failures = 0u32;

    loop {
        if sender.current_device().is_none() {
            failures = 0;
            events.publish(LoungeEvent::Reachability {
                reachable: false,
                status: None,
            });
        } else {
            let result = tokio::select! {
                biased;
                _ = shutdown_requested(&mut stop) => return,
                result = sender.ping() => result,
            };
            match result {
                Ok(status) => {
                    failures = 0;
                    events.publish(LoungeEvent::Reachability { reachable: true, status });
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!("[heartbeat] reachability ping failed ({failures}/{}): {e}", policy.max_retries);
                    events.publish(LoungeEvent::Reachability {
                        reachable: false,
                        status: None,
                    });
                    if failures >= policy.max_retries {
                        tracing::info!("[heartbeat] device unreachable, clearing selection");
                        if let Err(e) = sender.clear_active_device() {
                            tracing::warn!("[heartbeat] failed to clear active device: {e}");
                        }
                        events.publish(LoungeEvent::DeviceEvicted);
                        failures = 0;
                    }
                }
            }
        }

        if sleep_or_shutdown(policy.base_delay, &mut stop).await.is_err() {
            return;
        }
    }
}

async fn liveness_loop(sender: LoungeSender, probe: Arc<dyn PlaybackProbe>, mut stop: watch::Receiver<bool>) {
    let policy = RetryPolicy::LIVENESS;
    let events = sender.events().clone();
    let mut interval = policy.base_delay;
    let mut failures = 0u32;
    let mut last_success: Option<Instant> = None;

    loop {
        if sleep_or_shutdown(interval, &mut stop).await.is_err() {
            return;
        }

        let paused = probe.is_paused();
        let idle_interval = if paused { PAUSED_INTERVAL } else { ACTIVE_INTERVAL };
        let due = if paused {
            last_success.map_or(true, |at| at.elapsed() >= PAUSED_INTERVAL)
        } else {
            probe.last_update().elapsed() > ACTIVE_STALE
        };

        if !due {
            interval = idle_interval;
            if !paused {
                failures = 0;
            }
            continue;
        }

        let result = tokio::select! {
            biased;
            _ = shutdown_requested(&mut stop) => return,
            result = sender.ping() => result,
        };
        match result {
            Ok(status) => {
                failures = 0;
                last_success = Some(Instant::now());
                interval = idle_interval;
                events.publish(LoungeEvent::PingResult { reachable: true, status });
            }
            Err(e) => {
                failures += 1;
                interval = policy.grow(interval);
                tracing::warn!(
                    "[heartbeat] liveness ping failed ({failures}/{}), next in {}s: {e}",
                    policy.max_retries,
                    interval.as_secs()
                );
                events.publish(LoungeEvent::PingResult {
                    reachable: false,
                    status: None,
                });
                if failures >= policy.max_retries {
                    tracing::info!("[heartbeat] receiver lost");
                    events.publish(LoungeEvent::ConnectionLost);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::tests::{handshake_body, paired_sender};
    use crate::transport::mock::MockTransport;

    struct FixedProbe {
        paused: bool,
        at: Instant,
    }

    impl PlaybackProbe for FixedProbe {
        fn is_paused(&self) -> bool {
            self.paused
        }

        fn last_update(&self) -> Instant {
            self.at
        }
    }

    async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<LoungeEvent>) -> LoungeEvent {
        rx.recv().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn three_failures_evict_device() {
        let transport = Arc::new(MockTransport::new());
        for _ in 0..3 {
            transport.push_status(403, "");
        }
        let (sender, _) = paired_sender(transport.clone());
        let mut events = sender.events().subscribe();
        let mut controller = HeartbeatController::new(sender.clone());
        controller.start_reachability();

        for _ in 0..3 {
            assert_eq!(
                next_event(&mut events).await,
                LoungeEvent::Reachability {
                    reachable: false,
                    status: None
                }
            );
        }
        assert_eq!(next_event(&mut events).await, LoungeEvent::DeviceEvicted);
        assert_eq!(sender.current_device(), None);

        // Nothing is selected any more, so nothing reports reachable.
        assert_eq!(
            next_event(&mut events).await,
            LoungeEvent::Reachability {
                reachable: false,
                status: None
            }
        );
        assert_eq!(transport.requests().len(), 3);
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reachable_device_reports_success() {
        let transport = Arc::new(MockTransport::new());
        transport.push_ok(&handshake_body("SID1")).push_ok("");
        let (sender, _) = paired_sender(transport.clone());
        let mut events = sender.events().subscribe();
        let mut controller = HeartbeatController::new(sender.clone());
        controller.start_reachability();

        assert_eq!(
            next_event(&mut events).await,
            LoungeEvent::Reachability {
                reachable: true,
                status: None
            }
        );
        controller.shutdown().await;
        assert!(sender.current_device().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_gives_up_after_five_failures() {
        let transport = Arc::new(MockTransport::new().hang_when_empty());
        let (sender, _) = paired_sender(transport.clone());
        let mut events = sender.events().subscribe();

        // Stale position while playing: every tick pings. The loop runs
        // alone so the mock script is not shared with a streaming reader.
        let probe: Arc<dyn PlaybackProbe> = Arc::new(FixedProbe {
            paused: false,
            at: Instant::now(),
        });
        for _ in 0..5 {
            transport.push_status(403, "");
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let started = Instant::now();
        let task = tokio::spawn(liveness_loop(sender.clone(), probe, stop_rx));

        for _ in 0..5 {
            assert_eq!(
                next_event(&mut events).await,
                LoungeEvent::PingResult {
                    reachable: false,
                    status: None
                }
            );
        }
        assert_eq!(next_event(&mut events).await, LoungeEvent::ConnectionLost);
        task.await.unwrap();

        // 7s, then 14s four times.
        assert!(started.elapsed() >= Duration::from_secs(7 + 4 * 14));
        drop(stop_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_liveness_pings_on_slow_cadence() {
        let transport = Arc::new(MockTransport::new());
        transport
            .push_ok(&handshake_body("SID1"))
            .push_ok("")
            .push_ok("");
        let (sender, _) = paired_sender(transport.clone());
        let mut events = sender.events().subscribe();

        let probe: Arc<dyn PlaybackProbe> = Arc::new(FixedProbe {
            paused: true,
            at: Instant::now(),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let started = Instant::now();
        let task = tokio::spawn(liveness_loop(sender.clone(), probe, stop_rx));

        let ok = LoungeEvent::PingResult {
            reachable: true,
            status: None,
        };
        assert_eq!(next_event(&mut events).await, ok);
        assert!(started.elapsed() < Duration::from_secs(8));
        assert_eq!(next_event(&mut events).await, ok);
        assert!(started.elapsed() >= Duration::from_secs(7 + 18));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_playback_skips_ping() {
        let transport = Arc::new(MockTransport::new());
        let (sender, _) = paired_sender(transport.clone());
        let state = Arc::new(PlaybackState::new());
        state.update(true);

        let (stop_tx, stop_rx) = watch::channel(false);
        let probe: Arc<dyn PlaybackProbe> = state.clone();
        let task = tokio::spawn(liveness_loop(sender, probe, stop_rx));

        // Keep the position fresh across two ticks.
        for _ in 0..2 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            state.update(true);
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(transport.requests().is_empty());

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_runs_stream_and_stops_cleanly() {
        let transport = Arc::new(MockTransport::new().hang_when_empty());
        transport
            .push_ok(&handshake_body("SID1"))
            .push_chunks(200, Vec::new(), true);
        let (sender, _) = paired_sender(transport.clone());
        let mut controller = HeartbeatController::new(sender);

        controller.start_heartbeat(Arc::new(PlaybackState::new())).await;
        for _ in 0..100 {
            if transport.requests().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.requests()[1].query_value("RID"), Some("rpc"));

        controller.shutdown().await;
        assert!(controller.stream.is_none());
        assert!(controller.liveness.is_none());
    }
}
