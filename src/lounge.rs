use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::messages::{self, encode_dispatch_form, generate_cpn, zx, Action, ChunkParser, IncomingMessage};
use crate::retry::ErrorClass;
use crate::session::{Device, Session};
use crate::storage::StorageError;
use crate::transport::{HttpRequest, Transport, TransportError};

pub const BIND_URL: &str = "https://www.youtube.com/api/lounge/bc/bind";

/// First request id handed out per client.
const RID_START: u64 = 1337;
/// Lowest sequence id a fresh session may start from.
const PROTOCOL_BASELINE: i64 = 0;
const SESSION_EXPIRED_MARKER: &str = "unknown sid";

pub type Result<T> = std::result::Result<T, LoungeError>;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingFailure {
    /// The code did not resolve to any screen
    NoScreens,
    Http(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    Http(u16),
    /// 2xx response without a `["c", "<sid>"]` entry
    MissingSid,
}

#[derive(Debug)]
pub enum LoungeError {
    /// No active device selected
    NotPaired,
    PairingFailed(PairingFailure),
    HandshakeFailed(HandshakeFailure),
    /// 404/410, or 400 "Unknown SID": the session has to be rebuilt
    SessionExpired { status: u16 },
    Transport(TransportError),
    /// 5xx from the bind endpoint
    ServerError { status: u16 },
    /// Any other non-2xx answer to a dispatch
    DispatchFailed { status: u16 },
    Message(messages::MessageError),
    Storage(StorageError),
    /// Shutdown signal received
    Shutdown,
}

impl LoungeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LoungeError::Transport(e) if e.is_timeout() || e.is_dns() => ErrorClass::Transient,
            LoungeError::ServerError { .. } => ErrorClass::Server,
            LoungeError::SessionExpired { .. } => ErrorClass::SessionExpired,
            _ => ErrorClass::Fatal,
        }
    }
}

impl std::fmt::Display for LoungeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoungeError::NotPaired => write!(f, "lounge: no active device"),
            LoungeError::PairingFailed(PairingFailure::NoScreens) => {
                write!(f, "lounge pairing: no screen for this code")
            }
            LoungeError::PairingFailed(PairingFailure::Http(status)) => {
                write!(f, "lounge pairing: http {status}")
            }
            LoungeError::HandshakeFailed(HandshakeFailure::Http(status)) => {
                write!(f, "lounge handshake: http {status}")
            }
            LoungeError::HandshakeFailed(HandshakeFailure::MissingSid) => {
                write!(f, "lounge handshake: response carried no SID")
            }
            LoungeError::SessionExpired { status } => write!(f, "lounge: session expired ({status})"),
            LoungeError::Transport(e) => write!(f, "lounge {e}"),
            LoungeError::ServerError { status } => write!(f, "lounge: server error {status}"),
            LoungeError::DispatchFailed { status } => write!(f, "lounge: dispatch failed ({status})"),
            LoungeError::Message(e) => write!(f, "lounge message: {e}"),
            LoungeError::Storage(e) => write!(f, "lounge {e}"),
            LoungeError::Shutdown => write!(f, "lounge: shutdown"),
        }
    }
}

impl std::error::Error for LoungeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoungeError::Transport(e) => Some(e),
            LoungeError::Message(e) => Some(e),
            LoungeError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for LoungeError {
    fn from(e: TransportError) -> Self {
        LoungeError::Transport(e)
    }
}

impl From<messages::MessageError> for LoungeError {
    fn from(e: messages::MessageError) -> Self {
        LoungeError::Message(e)
    }
}

impl From<StorageError> for LoungeError {
    fn from(e: StorageError) -> Self {
        LoungeError::Storage(e)
    }
}

/// Map a non-2xx bind answer onto the error taxonomy.
pub fn status_error(status: u16, body: &str) -> LoungeError {
    match status {
        404 | 410 => LoungeError::SessionExpired { status },
        400 if body.to_ascii_lowercase().contains(SESSION_EXPIRED_MARKER) => {
            LoungeError::SessionExpired { status }
        }
        500..=599 => LoungeError::ServerError { status },
        _ => LoungeError::DispatchFailed { status },
    }
}

// ---------------------------------------------------------------------------
// Request builders
// ---------------------------------------------------------------------------

/// Per-client request parameters: who we are and the `RID` counter.
pub struct BindParams {
    client_name: String,
    request_timeout: Duration,
    rid: AtomicU64,
}

impl BindParams {
    pub fn new(client_name: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client_name: client_name.into(),
            request_timeout,
            rid: AtomicU64::new(RID_START),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn next_rid(&self) -> String {
        self.rid.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn identity_query(&self, device: &Device, remote_id: &str, gsession_id: Option<&str>) -> Vec<(String, String)> {
        let mut query: Vec<(String, String)> = vec![
            ("device".into(), "REMOTE_CONTROL".into()),
            ("app".into(), "android-remote".into()),
            ("name".into(), self.client_name.clone()),
            ("id".into(), remote_id.to_owned()),
        ];
        if let Some(gs) = gsession_id {
            query.push(("gsessionid".into(), gs.to_owned()));
        }
        query.extend([
            ("loungeIdToken".into(), device.lounge_token.clone()),
            ("VER".into(), "8".into()),
            ("v".into(), "2".into()),
            ("theme".into(), "cl".into()),
            ("ui".into(), "1".into()),
            ("capabilities".into(), "remote_queue".into()),
        ]);
        query
    }

    fn post_query(
        &self,
        device: &Device,
        remote_id: &str,
        cpn: &str,
        session: Option<&Session>,
    ) -> Vec<(String, String)> {
        let mut query = self.identity_query(device, remote_id, session.and_then(|s| s.gsession_id.as_deref()));
        query.extend([
            ("RID".into(), self.next_rid()),
            ("conn".into(), "longpoll".into()),
            ("prop".into(), "yls".into()),
            ("ctype".into(), "lb".into()),
            ("t".into(), "1".into()),
            ("cpn".into(), cpn.to_owned()),
            ("TYPE".into(), "xmlhttp".into()),
            ("CI".into(), "0".into()),
            ("CVER".into(), "1".into()),
        ]);
        if let Some(session) = session {
            query.push(("SID".into(), session.sid.clone()));
            query.push(("AID".into(), session.aid.to_string()));
        }
        query
    }

    /// Empty-action bind without a session id.
    pub fn handshake_request(&self, device: &Device, remote_id: &str, cpn: &str) -> HttpRequest {
        HttpRequest::post(BIND_URL)
            .query(self.post_query(device, remote_id, cpn, None))
            .form(encode_dispatch_form(&[], 0, 0))
            .timeout(Some(self.request_timeout))
    }

    /// One batch; ids start at `session.aid`.
    pub fn dispatch_request(&self, device: &Device, session: &Session, actions: &[Action]) -> HttpRequest {
        HttpRequest::post(BIND_URL)
            .query(self.post_query(device, &session.remote_id, &session.cpn, Some(session)))
            .form(encode_dispatch_form(actions, session.aid, session.aid))
            .timeout(Some(self.request_timeout))
    }

    /// Long-poll GET that stays open; receives events after `aid`.
    pub fn stream_request(&self, device: &Device, session: &Session, aid: i64) -> HttpRequest {
        let mut query = self.identity_query(device, &session.remote_id, session.gsession_id.as_deref());
        query.extend([
            ("conn".into(), "longpoll".into()),
            ("prop".into(), "yls".into()),
            ("ctype".into(), "lb".into()),
            ("RID".into(), "rpc".into()),
            ("AID".into(), aid.to_string()),
            ("CI".into(), "0".into()),
            ("TYPE".into(), "xmlhttp".into()),
            ("cpn".into(), session.cpn.clone()),
            ("SID".into(), session.sid.clone()),
            ("t".into(), "1".into()),
            ("zx".into(), zx()),
        ]);
        HttpRequest::get(BIND_URL).query(query).timeout(None)
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Open a new bind session for `device`.
///
/// Issues exactly one request. The returned session starts at
/// `max(0, known_aid, 1 + highest id in the response)`.
pub async fn handshake(
    transport: &dyn Transport,
    bind: &BindParams,
    device: &Device,
    remote_id: &str,
    known_aid: i64,
) -> Result<Session> {
    let cpn = generate_cpn();
    let resp = transport
        .execute(bind.handshake_request(device, remote_id, &cpn))
        .await?;

    let status = resp.status;
    let body = resp.text().await?;
    if !(200..300).contains(&status) {
        tracing::error!("[lounge] handshake returned {status}: {}", truncate(&body, 200));
        return Err(LoungeError::HandshakeFailed(HandshakeFailure::Http(status)));
    }

    let messages = handshake_messages(&body);
    let sid = parse_sid(&messages).ok_or(LoungeError::HandshakeFailed(HandshakeFailure::MissingSid))?;
    let gsession_id = parse_gsession(&messages);
    let max_seen = parse_max_message_id(&messages);
    let aid = PROTOCOL_BASELINE.max(known_aid).max(max_seen + 1);

    tracing::info!(
        "[lounge] session bound: screen={} SID={sid}, gsession={}, AID={aid}",
        device.screen_id,
        gsession_id.as_deref().unwrap_or("-"),
    );

    Ok(Session {
        lounge_token: device.lounge_token.clone(),
        screen_id: device.screen_id.clone(),
        remote_id: remote_id.to_owned(),
        sid,
        gsession_id,
        aid,
        cpn,
    })
}

/// Entries of a handshake body. Normally length-prefixed frames; a short
/// final frame or a bare JSON array is accepted too.
pub fn handshake_messages(body: &str) -> Vec<IncomingMessage> {
    if let Ok(messages) = messages::parse_chunks(body.as_bytes()) {
        if !messages.is_empty() {
            return messages;
        }
    }
    let mut parser = ChunkParser::new();
    let mut messages = parser.feed(body.as_bytes());
    messages.extend(parser.finish());
    if messages.is_empty() {
        messages = messages::parse_messages(body.trim().as_bytes()).unwrap_or_default();
    }
    messages
}

/// Session id from the first `[n, ["c", "<sid>", ...]]` entry.
pub fn parse_sid(messages: &[IncomingMessage]) -> Option<String> {
    messages
        .iter()
        .filter(|m| m.command == "c")
        .find_map(|m| m.arg_str(0).filter(|s| !s.is_empty()))
        .map(String::from)
}

/// gsession id from the first `[n, ["S", "<gs>"]]` entry.
pub fn parse_gsession(messages: &[IncomingMessage]) -> Option<String> {
    messages
        .iter()
        .filter(|m| m.command == "S")
        .find_map(|m| m.arg_str(0).filter(|s| !s.is_empty()))
        .map(String::from)
}

/// Highest message id present, or -1.
pub fn parse_max_message_id(messages: &[IncomingMessage]) -> i64 {
    messages.iter().map(|m| m.index).max().unwrap_or(-1)
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn frame(json: &str) -> String {
        format!("{}\n{}", json.len(), json)
    }

    fn device() -> Device {
        Device {
            screen_id: "screen-1".into(),
            lounge_token: "tok".into(),
            name: "TV".into(),
        }
    }

    fn bind() -> BindParams {
        BindParams::new("LibreTube (Test)", Duration::from_secs(5))
    }

    #[test]
    fn parses_session_ids_from_handshake_body() {
        let body = frame(r#"[[0,["c","SID123","",8]],[1,["S","GS1"]]]"#);
        let messages = handshake_messages(&body);
        assert_eq!(parse_sid(&messages).as_deref(), Some("SID123"));
        assert_eq!(parse_gsession(&messages).as_deref(), Some("GS1"));
        assert_eq!(parse_max_message_id(&messages), 1);
    }

    #[test]
    fn reads_every_frame_and_a_short_tail() {
        let body = format!(
            "{}\n{}",
            frame(r#"[[0,["c","SID7","",8]]]"#),
            frame(r#"[[1,["S","GS7"]],[2,["noop"]]]"#)
        );
        let messages = handshake_messages(&body);
        assert_eq!(parse_gsession(&messages).as_deref(), Some("GS7"));
        assert_eq!(parse_max_message_id(&messages), 2);

        // Declared length overshoots the bytes actually sent.
        let messages = handshake_messages("99\n[[0,[\"c\",\"SID8\",\"\",8]]]");
        assert_eq!(parse_sid(&messages).as_deref(), Some("SID8"));
    }

    #[test]
    fn accepts_unframed_body() {
        let messages = handshake_messages(r#"[[0,["c","SID9","",8]],[4,["noop"]]]"#);
        assert_eq!(parse_sid(&messages).as_deref(), Some("SID9"));
        assert_eq!(parse_gsession(&messages), None);
        assert_eq!(parse_max_message_id(&messages), 4);
        assert_eq!(parse_max_message_id(&[]), -1);
    }

    #[test]
    fn classifies_statuses() {
        assert!(matches!(status_error(410, ""), LoungeError::SessionExpired { status: 410 }));
        assert!(matches!(status_error(404, ""), LoungeError::SessionExpired { .. }));
        assert!(matches!(
            status_error(400, "Error: UNKNOWN SID"),
            LoungeError::SessionExpired { status: 400 }
        ));
        assert!(matches!(status_error(400, "bad"), LoungeError::DispatchFailed { status: 400 }));
        assert_eq!(status_error(503, "").class(), ErrorClass::Server);
        assert_eq!(status_error(403, "").class(), ErrorClass::Fatal);
        assert_eq!(
            LoungeError::Transport(TransportError::Dns("nx".into())).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            LoungeError::Transport(TransportError::Connect("refused".into())).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn request_shapes() {
        let bind = bind();
        let hs = bind.handshake_request(&device(), "remote", "cpn1");
        assert_eq!(hs.form.as_deref(), Some("count=0&ofs=0&actions=%5B%5D"));
        assert_eq!(hs.query_value("RID"), Some("1337"));
        assert_eq!(hs.query_value("loungeIdToken"), Some("tok"));
        assert_eq!(hs.query_value("SID"), None);
        assert_eq!(hs.query_value("name"), Some("LibreTube (Test)"));

        let session = Session {
            lounge_token: "tok".into(),
            screen_id: "screen-1".into(),
            remote_id: "remote".into(),
            sid: "S1".into(),
            gsession_id: Some("G1".into()),
            aid: 7,
            cpn: "cpn1".into(),
        };
        let send = bind.dispatch_request(&device(), &session, &[Action::new("play")]);
        assert_eq!(send.query_value("RID"), Some("1338"));
        assert_eq!(send.query_value("AID"), Some("7"));
        assert_eq!(send.query_value("gsessionid"), Some("G1"));
        assert!(send.form.as_deref().unwrap().contains("req0__sc=play"));

        let stream = bind.stream_request(&device(), &session, 9);
        assert_eq!(stream.query_value("RID"), Some("rpc"));
        assert_eq!(stream.query_value("AID"), Some("9"));
        assert!(stream.query_value("zx").is_some());
        assert!(stream.timeout.is_none());
    }

    #[tokio::test]
    async fn handshake_picks_highest_baseline() {
        let transport = MockTransport::new();
        transport.push_ok(&frame(r#"[[0,["c","SID123","",8]],[1,["S","GS1"]]]"#));
        let session = handshake(&transport, &bind(), &device(), "remote", 0).await.unwrap();
        assert_eq!(session.sid, "SID123");
        assert_eq!(session.gsession_id.as_deref(), Some("GS1"));
        assert_eq!(session.aid, 2);

        transport.push_ok(&frame(r#"[[0,["c","SID124","",8]]]"#));
        let session = handshake(&transport, &bind(), &device(), "remote", 30).await.unwrap();
        assert_eq!(session.aid, 30);
    }

    #[tokio::test]
    async fn handshake_failures() {
        let transport = MockTransport::new();
        transport.push_status(403, "nope").push_ok(&frame(r#"[[0,["noop"]]]"#));

        let err = handshake(&transport, &bind(), &device(), "r", 0).await.unwrap_err();
        assert!(matches!(err, LoungeError::HandshakeFailed(HandshakeFailure::Http(403))));

        let err = handshake(&transport, &bind(), &device(), "r", 0).await.unwrap_err();
        assert!(matches!(err, LoungeError::HandshakeFailed(HandshakeFailure::MissingSid)));
    }
}
