use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;

use crate::events::LoungeEvent;
use crate::lounge::{status_error, truncate, LoungeError, Result};
use crate::messages::{ChunkParser, IncomingMessage};
use crate::now_playing::status_from_entry;
use crate::retry::{is_shutdown, shutdown_requested, sleep_or_shutdown, Backoff, ErrorClass, RetryPolicy};
use crate::sender::LoungeSender;
use crate::session::{Device, Session};

/// Delay after a hard reset, and after a timeout/DNS blip.
const QUICK_RECONNECT: Duration = Duration::from_secs(2);

/// How one streaming connection ended.
enum StreamEnd {
    /// Body finished normally (server closes long-polls periodically)
    Closed,
    /// The session was replaced by someone else, e.g. a dispatch reset.
    /// Reconnects without delay.
    Replaced,
    Failed(LoungeError),
}

/// Hold the streaming bind open and publish what the receiver pushes.
///
/// Reconnects forever with backoff. Returns `Ok(())` on shutdown and
/// `Err(NotPaired)` if the device selection goes away.
pub async fn run_stream(sender: LoungeSender, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let mut backoff = RetryPolicy::STREAM.backoff();

    loop {
        if is_shutdown(&shutdown) {
            return Ok(());
        }

        let device = sender.current_device().ok_or(LoungeError::NotPaired)?;

        let end = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => {
                sender.inner.sessions.checkpoint();
                return Ok(());
            }
            end = connect_once(&sender, &device, &mut backoff) => end,
        };

        let delay = match end {
            StreamEnd::Closed => {
                tracing::debug!("[stream] connection closed, reconnecting");
                backoff.next_delay()
            }
            StreamEnd::Replaced => {
                tracing::debug!("[stream] session replaced, reconnecting");
                continue;
            }
            StreamEnd::Failed(e) => match e.class() {
                ErrorClass::SessionExpired => {
                    tracing::warn!("[stream] {e}, hard reset");
                    sender.inner.sessions.invalidate(&device);
                    Some(QUICK_RECONNECT)
                }
                ErrorClass::Transient => {
                    tracing::warn!("[stream] {e}, reconnecting shortly");
                    Some(QUICK_RECONNECT)
                }
                _ => {
                    tracing::warn!("[stream] {e}, backing off");
                    backoff.next_delay()
                }
            },
        };

        let delay = delay.unwrap_or(RetryPolicy::STREAM.max_delay);
        if sleep_or_shutdown(delay, &mut shutdown).await.is_err() {
            return Ok(());
        }
    }
}

/// One handshake-if-needed plus one long-poll connection, read to the end.
/// Incoming data resets `backoff`.
async fn connect_once(sender: &LoungeSender, device: &Device, backoff: &mut Backoff) -> StreamEnd {
    let session = match ensure_session(sender, device).await {
        Ok(session) => session,
        Err(e) => return StreamEnd::Failed(e),
    };

    let end = read_stream(sender, device, &session, backoff).await;
    sender.inner.sessions.checkpoint();
    end
}

async fn read_stream(sender: &LoungeSender, device: &Device, session: &Session, backoff: &mut Backoff) -> StreamEnd {
    let inner = &sender.inner;

    // Skip cursor for this connection. After the connect AID, only ids pushed
    // by the receiver move it.
    let mut cursor = session.aid.max(inner.sessions.local_aid());
    let request = inner.bind.stream_request(device, session, cursor);
    tracing::debug!("[stream] connecting SID={} AID={cursor}", session.sid);

    let resp = match inner.transport.execute(request).await {
        Ok(resp) => resp,
        Err(e) => return StreamEnd::Failed(e.into()),
    };

    if !(200..300).contains(&resp.status) {
        let status = resp.status;
        let body = resp.text().await.unwrap_or_default();
        tracing::debug!("[stream] bind returned {status}: {}", truncate(&body, 200));
        return StreamEnd::Failed(status_error(status, &body));
    }

    let mut body = resp.body;
    let mut parser = ChunkParser::new();
    loop {
        let next = body.next().await;
        // Frames of a replaced channel are dropped unread.
        if !still_current(sender, session) {
            return StreamEnd::Replaced;
        }

        match next {
            Some(Ok(bytes)) => {
                backoff.reset();
                for msg in parser.feed(&bytes) {
                    cursor = handle_message(sender, session, msg, cursor);
                }
            }
            Some(Err(e)) => return StreamEnd::Failed(e.into()),
            None => {
                for msg in parser.finish() {
                    cursor = handle_message(sender, session, msg, cursor);
                }
                return StreamEnd::Closed;
            }
        }
    }
}

/// Get-or-create under the dispatch lock, released before streaming.
async fn ensure_session(sender: &LoungeSender, device: &Device) -> Result<Session> {
    let inner = &sender.inner;
    let remote_id = inner.store.remote_id()?;
    let _guard = inner.sessions.lock().await;
    inner.sessions.drop_if_stale(device);
    inner
        .sessions
        .get_or_create(inner.transport.as_ref(), &inner.bind, device, &remote_id)
        .await
}

fn still_current(sender: &LoungeSender, session: &Session) -> bool {
    sender
        .inner
        .sessions
        .current()
        .is_some_and(|live| live.is_same(session))
}

/// Advance the cursor past `msg` and publish any now-playing payload.
/// Returns the new connection cursor.
fn handle_message(sender: &LoungeSender, session: &Session, msg: IncomingMessage, cursor: i64) -> i64 {
    if msg.index <= cursor {
        tracing::trace!("[stream] skipping already seen id={}", msg.index);
        return cursor;
    }
    sender.inner.sessions.merge_sequence(session, msg.index);
    let cursor = msg.index;

    match msg.command.as_str() {
        "noop" => tracing::trace!("[stream] keepalive id={}", msg.index),
        "c" | "S" => tracing::debug!("[stream] session command {} id={}", msg.command, msg.index),
        _ => match status_from_entry(&msg.to_entry()) {
            Some(status) => {
                tracing::debug!("[stream] {} id={} video={:?}", msg.command, msg.index, status.video_id);
                sender.events().publish(LoungeEvent::NowPlaying(status));
            }
            None => tracing::debug!("[stream] ignoring {} id={}", msg.command, msg.index),
        },
    }
    cursor
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::task::JoinHandle;
    use tokio::time;

    use super::*;
    use crate::sender::tests::{frame, handshake_body, paired_sender};
    use crate::storage::Storage;
    use crate::transport::mock::MockTransport;

    fn spawn_stream(sender: &LoungeSender) -> (watch::Sender<bool>, JoinHandle<Result<()>>) {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_stream(sender.clone(), rx));
        (tx, handle)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn short_frame_advances_cursor_silently() {
        let transport = Arc::new(MockTransport::new().hang_when_empty());
        transport
            .push_ok(&handshake_body("SID1"))
            .push_ok("23\n[[5,[\"noop\"]]]\n");
        let (sender, _) = paired_sender(transport.clone());
        let mut events = sender.events().subscribe();

        let (stop, handle) = spawn_stream(&sender);
        wait_until(|| transport.requests().len() == 3).await;

        assert_eq!(sender.sequence(), 5);
        assert_eq!(sender.inner.store.last_aid("screen-1"), 5);
        assert_eq!(transport.requests()[2].query_value("AID"), Some("5"));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_any_event_with_status() {
        let transport = Arc::new(MockTransport::new().hang_when_empty());
        transport.push_ok(&handshake_body("SID1")).push_chunks(
            200,
            vec![
                frame(r#"[[3,["noop"]],[4,["onStateChange",{"currentTime":"7","state":"1"}]]]"#).into_bytes(),
                frame(r#"[[4,["nowPlaying",{"videoId":"dup"}]]]"#).into_bytes(),
                frame(r#"[[6,["nowPlaying",{"videoId":"abc","duration":"100"}]]]"#).into_bytes(),
            ],
            true,
        );
        let (sender, _) = paired_sender(transport.clone());
        let mut events = sender.events().subscribe();

        let (stop, handle) = spawn_stream(&sender);

        let LoungeEvent::NowPlaying(first) = events.recv().await.unwrap() else {
            panic!("expected now playing");
        };
        assert_eq!(first.current_time_ms, Some(7000));
        assert_eq!(first.is_playing, Some(true));

        let LoungeEvent::NowPlaying(second) = events.recv().await.unwrap() else {
            panic!("expected now playing");
        };
        assert_eq!(second.video_id.as_deref(), Some("abc"));
        assert_eq!(sender.sequence(), 6);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(transport.requests().len(), 2);
    }

    async fn next_video(events: &mut tokio::sync::broadcast::Receiver<LoungeEvent>) -> Option<String> {
        match events.recv().await.unwrap() {
            LoungeEvent::NowPlaying(status) => status.video_id,
            other => panic!("expected now playing, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dispatched_ids_do_not_hide_pushed_events() {
        let transport = Arc::new(MockTransport::new().hang_when_empty());
        transport.push_ok(&handshake_body("SID1"));
        let push = transport.push_live();
        for _ in 0..5 {
            transport.push_ok("");
        }
        let (sender, _) = paired_sender(transport.clone());
        let mut events = sender.events().subscribe();

        let (stop, handle) = spawn_stream(&sender);
        push.send(frame(r#"[[3,["nowPlaying",{"videoId":"a"}]]]"#).into_bytes()).unwrap();
        assert_eq!(next_video(&mut events).await.as_deref(), Some("a"));

        for _ in 0..5 {
            sender.play().await.unwrap();
        }
        assert_eq!(sender.sequence(), 8);

        push.send(frame(r#"[[4,["nowPlaying",{"videoId":"b"}]]]"#).into_bytes()).unwrap();
        push.send(frame(r#"[[5,["nowPlaying",{"videoId":"c"}]]]"#).into_bytes()).unwrap();
        assert_eq!(next_video(&mut events).await.as_deref(), Some("b"));
        assert_eq!(next_video(&mut events).await.as_deref(), Some("c"));
        assert_eq!(sender.sequence(), 8);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_session_reconnects_at_once() {
        let transport = Arc::new(MockTransport::new().hang_when_empty());
        transport.push_ok(&handshake_body("SID1"));
        let push = transport.push_live();
        transport
            .push_status(410, "")
            .push_ok(&frame(r#"[[0,["c","SID2","",8]]]"#))
            .push_ok("");
        let (sender, storage) = paired_sender(transport.clone());

        let (stop, handle) = spawn_stream(&sender);
        wait_until(|| transport.requests().len() == 2).await;

        // A dispatch reset swaps the session under the open stream.
        sender.play().await.unwrap();
        assert_eq!(sender.session().unwrap().sid, "SID2");

        let before = time::Instant::now();
        push.send(frame(r#"[[9,["noop"]]]"#).into_bytes()).unwrap();
        wait_until(|| transport.requests().len() == 6).await;
        assert!(before.elapsed() < Duration::from_millis(100));

        let requests = transport.requests();
        assert_eq!(requests[5].query_value("SID"), Some("SID2"));
        assert_eq!(requests[5].query_value("RID"), Some("rpc"));
        // Frames of the old channel are not merged into the new one.
        assert_eq!(sender.sequence(), 3);
        assert_eq!(storage.get_int("last_aid.screen-1"), Some(3));

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_stream_triggers_hard_reset() {
        let transport = Arc::new(MockTransport::new().hang_when_empty());
        transport
            .push_ok(&handshake_body("SID1"))
            .push_status(410, "")
            .push_ok(&handshake_body("SID2"))
            .push_chunks(200, Vec::new(), true);
        let (sender, _) = paired_sender(transport.clone());

        let (stop, handle) = spawn_stream(&sender);
        wait_until(|| transport.requests().len() == 4).await;

        let requests = transport.requests();
        assert_eq!(requests[2].query_value("SID"), None);
        assert_eq!(requests[3].query_value("SID"), Some("SID2"));
        assert_eq!(requests[3].query_value("RID"), Some("rpc"));
        assert_eq!(sender.session().unwrap().sid, "SID2");

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn soft_reconnect_keeps_session() {
        let transport = Arc::new(MockTransport::new().hang_when_empty());
        transport
            .push_ok(&handshake_body("SID1"))
            .push_status(502, "")
            .push_ok(&frame(r#"[[2,["noop"]]]"#));
        let (sender, _) = paired_sender(transport.clone());

        let (stop, handle) = spawn_stream(&sender);
        wait_until(|| transport.requests().len() == 4).await;

        let requests = transport.requests();
        assert!(requests[1..].iter().all(|r| r.query_value("SID") == Some("SID1")));
        assert_eq!(requests[3].query_value("AID"), Some("2"));

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_device_is_deselected() {
        let transport = Arc::new(MockTransport::new());
        transport.push_ok(&handshake_body("SID1")).push_ok("");
        let (sender, _) = paired_sender(transport.clone());

        let (_stop, handle) = spawn_stream(&sender);
        wait_until(|| transport.requests().len() == 2).await;
        sender.clear_active_device().unwrap();

        assert!(matches!(handle.await.unwrap(), Err(LoungeError::NotPaired)));
    }
}
