use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant};

use crate::config::Config;
use crate::events::EventHub;
use crate::lounge::{status_error, truncate, BindParams, LoungeError, Result};
use crate::messages::{Action, AudioTrackPayload, CaptionTrackPayload, SeekToPayload, SetPlaylistPayload};
use crate::now_playing::{parse_now_playing, queue_signature, NowPlayingStatus};
use crate::pairing;
use crate::retry::{ErrorClass, RetryPolicy};
use crate::session::{Device, Session, SessionManager, SessionStore};
use crate::storage::Storage;
use crate::transport::Transport;

/// DNS failures get a shorter ceiling than other transient errors.
const DNS_RETRY_CAP: Duration = Duration::from_secs(2);
/// An unchanged queue is not pushed again within this window.
const SYNC_DEBOUNCE: Duration = Duration::from_secs(4);

/// A video (and optionally its queue) to start on the receiver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoRequest {
    pub video_id: String,
    pub start_position_ms: i64,
    /// Empty means just `[video_id]`.
    pub queue: Vec<String>,
    pub current_index: usize,
    pub list_id: Option<String>,
    pub params: Option<String>,
    pub player_params: Option<String>,
    pub audio_only: bool,
}

impl VideoRequest {
    pub fn new(video_id: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            ..Default::default()
        }
    }

    fn queue_ids(&self) -> Vec<String> {
        if self.queue.is_empty() {
            vec![self.video_id.clone()]
        } else {
            self.queue.clone()
        }
    }

    fn signature(&self) -> String {
        queue_signature(
            &self.video_id,
            self.current_index,
            &self.queue_ids(),
            self.list_id.as_deref(),
            self.params.as_deref(),
            self.player_params.as_deref(),
        )
    }

    fn payload(&self) -> SetPlaylistPayload {
        let start_secs = (self.start_position_ms as f64 / 1000.0).max(0.0);
        let mut payload = SetPlaylistPayload::new(&self.video_id, self.queue_ids(), self.current_index, start_secs);
        payload.list_id = self.list_id.clone();
        payload.params = self.params.clone();
        payload.player_params = self.player_params.clone();
        payload.audio_only = self.audio_only;
        payload
    }
}

pub(crate) struct Inner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) store: SessionStore,
    pub(crate) sessions: SessionManager,
    pub(crate) bind: BindParams,
    pub(crate) events: EventHub,
    last_sync: Mutex<Option<(String, Instant)>>,
}

/// Remote-control client for one paired screen at a time.
///
/// Cheap to clone; clones share the session, the dispatch lock and the
/// event hub.
#[derive(Clone)]
pub struct LoungeSender {
    pub(crate) inner: Arc<Inner>,
}

impl LoungeSender {
    pub fn new(config: &Config, transport: Arc<dyn Transport>, storage: Arc<dyn Storage>) -> Self {
        let store = SessionStore::new(storage);
        Self {
            inner: Arc::new(Inner {
                transport,
                sessions: SessionManager::new(store.clone()),
                store,
                bind: BindParams::new(config.client_name(), config.request_timeout),
                events: EventHub::new(),
                last_sync: Mutex::new(None),
            }),
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    /// The live session, if one is bound.
    pub fn session(&self) -> Option<Session> {
        self.inner.sessions.current()
    }

    /// Local sequence cursor.
    pub fn sequence(&self) -> i64 {
        self.inner.sessions.local_aid()
    }

    // -----------------------------------------------------------------------
    // Devices
    // -----------------------------------------------------------------------

    /// Resolve a TV code and remember the screen. Does not select it.
    pub async fn pair(&self, code: &str) -> Result<Device> {
        pairing::pair(
            self.inner.transport.as_ref(),
            &self.inner.store,
            self.inner.bind.request_timeout(),
            code,
        )
        .await
    }

    pub fn paired_devices(&self) -> Vec<Device> {
        self.inner.store.devices()
    }

    pub fn current_device(&self) -> Option<Device> {
        self.inner.store.current_device()
    }

    /// Select `device`. The next command handshakes against it, starting
    /// from that screen's durable baseline.
    pub fn set_active_device(&self, device: &Device) -> Result<()> {
        self.inner.store.set_active(device)?;
        self.inner.sessions.invalidate(device);
        self.clear_sync_signature();
        tracing::info!("[lounge] active device: {} ({})", device.name, device.screen_id);
        Ok(())
    }

    /// Forget `device`; deselects it if it was the active one.
    pub fn remove_device(&self, device: &Device) -> Result<bool> {
        let removed = self.inner.store.remove_device(device)?;
        if removed {
            let bound = self
                .inner
                .sessions
                .current()
                .is_some_and(|s| s.lounge_token == device.lounge_token);
            let active = self.inner.store.active_screen_id().as_deref() == Some(device.screen_id.as_str());
            if bound || active {
                self.clear_active_device()?;
            }
        }
        Ok(removed)
    }

    pub fn clear_active_device(&self) -> Result<()> {
        self.inner.store.clear_active()?;
        self.inner.sessions.drop_session();
        self.clear_sync_signature();
        Ok(())
    }

    /// Wipe all pairing data. The local device id survives.
    pub fn clear_device(&self) -> Result<()> {
        self.inner.store.wipe()?;
        self.inner.sessions.reset();
        self.clear_sync_signature();
        tracing::info!("[lounge] pairing data wiped");
        Ok(())
    }

    /// `clear_device` plus the local device id.
    pub fn clear_all_devices(&self) -> Result<()> {
        self.inner.store.wipe_all()?;
        self.inner.sessions.reset();
        self.clear_sync_signature();
        tracing::info!("[lounge] all devices and local identity wiped");
        Ok(())
    }

    fn clear_sync_signature(&self) {
        *self.inner.last_sync.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Load a video (and queue) and start it. `setPlaylist` and `play` go out
    /// in one batch.
    pub async fn send_video(&self, video: &VideoRequest) -> Result<()> {
        tracing::debug!(
            "[lounge] sendVideo videoId={} positionMs={} queueSize={}",
            video.video_id,
            video.start_position_ms,
            video.queue_ids().len()
        );
        let actions = vec![
            Action::with_payload("setPlaylist", &video.payload())?,
            Action::new("play"),
        ];
        self.dispatch(&actions).await?;
        *self.inner.last_sync.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((video.signature(), Instant::now()));
        Ok(())
    }

    /// Like [`send_video`](Self::send_video), but skipped when the same
    /// queue was pushed moments ago. Returns whether anything was sent.
    pub async fn sync_video(&self, video: &VideoRequest) -> Result<bool> {
        let signature = video.signature();
        let recent = self
            .inner
            .last_sync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|(last, at)| *last == signature && at.elapsed() < SYNC_DEBOUNCE);
        if recent {
            tracing::debug!("[lounge] skip sync, queue unchanged");
            return Ok(false);
        }
        self.send_video(video).await?;
        Ok(true)
    }

    pub async fn play(&self) -> Result<()> {
        self.dispatch(&[Action::new("play")]).await.map(drop)
    }

    pub async fn pause(&self) -> Result<()> {
        self.dispatch(&[Action::new("pause")]).await.map(drop)
    }

    pub async fn seek_to(&self, position_ms: i64) -> Result<()> {
        let payload = SeekToPayload {
            new_time: position_ms as f64 / 1000.0,
            reason: 0,
            seek_playback_rate: 1.0,
        };
        let action = Action::with_payload("seekTo", &payload)?;
        self.dispatch(&[action]).await.map(drop)
    }

    /// `None` or blank turns captions off.
    pub async fn set_caption_track(&self, track_id: Option<&str>) -> Result<()> {
        let payload = CaptionTrackPayload {
            track_id: non_blank(track_id),
        };
        let action = Action::with_payload("setCaptionTrack", &payload)?;
        self.dispatch(&[action]).await.map(drop)
    }

    pub async fn set_audio_track(&self, audio_track_id: Option<&str>) -> Result<()> {
        let payload = AudioTrackPayload {
            audio_track_id: non_blank(audio_track_id),
        };
        let action = Action::with_payload("setAudioTrack", &payload)?;
        self.dispatch(&[action]).await.map(drop)
    }

    pub async fn next(&self) -> Result<()> {
        self.dispatch(&[Action::new("next")]).await.map(drop)
    }

    pub async fn previous(&self) -> Result<()> {
        self.dispatch(&[Action::new("previous")]).await.map(drop)
    }

    /// Zero-action bind. Proves the session is alive; some receivers also
    /// answer with their current state.
    pub async fn ping(&self) -> Result<Option<NowPlayingStatus>> {
        let body = self.dispatch(&[]).await?;
        Ok(parse_now_playing(&body))
    }

    /// Ask the receiver for its current state.
    pub async fn request_now_playing(&self) -> Result<Option<NowPlayingStatus>> {
        let body = self.dispatch(&[Action::new("getNowPlaying")]).await?;
        Ok(parse_now_playing(&body))
    }

    /// Subscribe to the streaming bind until `shutdown` fires.
    pub async fn stream_now_playing(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        crate::stream::run_stream(self.clone(), shutdown).await
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Send one batch and return the raw response body.
    ///
    /// Runs under the dispatch lock. Ids `[aid, aid + n)` are assigned to the
    /// batch and only committed once the receiver accepted it.
    pub(crate) async fn dispatch(&self, actions: &[Action]) -> Result<String> {
        let inner = &self.inner;
        let device = inner.store.current_device().ok_or(LoungeError::NotPaired)?;
        let remote_id = inner.store.remote_id()?;

        let _guard = inner.sessions.lock().await;
        inner.sessions.drop_if_stale(&device);

        let mut transient = RetryPolicy::DISPATCH.backoff();
        let mut resets = RetryPolicy::SESSION_RESET.backoff();
        loop {
            let err = match self.attempt(&device, &remote_id, actions).await {
                Ok(body) => return Ok(body),
                Err(e) => e,
            };

            match err.class() {
                ErrorClass::SessionExpired => {
                    inner.sessions.invalidate(&device);
                    if resets.next_delay().is_none() {
                        tracing::error!("[lounge] session still expired after {} resets: {err}", resets.attempts() - 1);
                        return Err(err);
                    }
                    tracing::warn!("[lounge] {err}, rebinding (reset {})", resets.attempts());
                }
                class if class.is_retryable() => {
                    let Some(mut delay) = transient.next_delay() else {
                        tracing::error!("[lounge] giving up after {} attempts: {err}", transient.attempts());
                        return Err(err);
                    };
                    if matches!(&err, LoungeError::Transport(e) if e.is_dns()) {
                        delay = delay.min(DNS_RETRY_CAP);
                    }
                    tracing::warn!(
                        "[lounge] {err}, retry {} in {}ms",
                        transient.attempts(),
                        delay.as_millis()
                    );
                    time::sleep(delay).await;
                }
                _ => {
                    tracing::error!("[lounge] dispatch failed: {err}");
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(&self, device: &Device, remote_id: &str, actions: &[Action]) -> Result<String> {
        let inner = &self.inner;
        let session = inner
            .sessions
            .get_or_create(inner.transport.as_ref(), &inner.bind, device, remote_id)
            .await?;

        let request = inner.bind.dispatch_request(device, &session, actions);
        tracing::debug!(
            "[lounge] send count={} AID={} SID={}",
            actions.len(),
            session.aid,
            session.sid
        );

        let resp = inner.transport.execute(request).await?;
        let status = resp.status;
        let body = resp.text().await?;
        if !(200..300).contains(&status) {
            tracing::debug!("[lounge] bind returned {status}: {}", truncate(&body, 200));
            return Err(status_error(status, &body));
        }

        let aid = inner.sessions.commit(&session, actions.len());
        tracing::trace!("[lounge] accepted, AID now {aid}");
        Ok(body)
    }
}

fn non_blank(id: Option<&str>) -> String {
    id.map(str::trim).filter(|s| !s.is_empty()).unwrap_or_default().to_owned()
}
