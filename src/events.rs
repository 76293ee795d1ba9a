use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::now_playing::NowPlayingStatus;

const EVENT_CAPACITY: usize = 64;

/// Everything the engine reports to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum LoungeEvent {
    /// Pushed by the receiver over the streaming bind.
    NowPlaying(NowPlayingStatus),
    /// Result of a reachability probe.
    Reachability {
        reachable: bool,
        status: Option<NowPlayingStatus>,
    },
    /// Result of a liveness ping while driving playback.
    PingResult {
        reachable: bool,
        status: Option<NowPlayingStatus>,
    },
    /// The active device stopped answering and was deselected.
    DeviceEvicted,
    /// The liveness loop gave up on the receiver.
    ConnectionLost,
}

/// Fan-out of engine events. Any number of tasks may publish; each
/// subscriber gets its own copy. Snapshots are idempotent, so a lagging
/// subscriber simply skips ahead.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<LoungeEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: LoungeEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoungeEvent> {
        self.tx.subscribe()
    }

    /// Run `callback` for every now-playing snapshot, from any source
    /// (streaming push or ping response). The task ends when the hub is
    /// dropped or the handle is aborted.
    pub fn on_now_playing<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(NowPlayingStatus) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(LoungeEvent::NowPlaying(status)) => callback(status),
                    Ok(LoungeEvent::Reachability { status: Some(status), .. })
                    | Ok(LoungeEvent::PingResult { status: Some(status), .. }) => callback(status),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("[events] now-playing subscriber skipped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
