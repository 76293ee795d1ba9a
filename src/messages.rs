use rand::Rng;
use serde::Serialize;
use serde_json::Value;

pub type Result<T> = std::result::Result<T, MessageError>;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum MessageError {
    /// Malformed wire-format data (bad length prefix, invalid JSON, etc.)
    Parse(String),
    /// JSON structure doesn't match expected message layout
    Schema(String),
    /// An action payload could not be turned into JSON
    Encode(String),
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageError::Parse(msg) => write!(f, "lounge parse: {msg}"),
            MessageError::Schema(msg) => write!(f, "lounge schema: {msg}"),
            MessageError::Encode(msg) => write!(f, "lounge encode: {msg}"),
        }
    }
}

impl std::error::Error for MessageError {}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A single event pushed by the receiver over the bind channel.
///
/// Wire format: `[index, ["eventName", arg0, arg1, ...]]`.
/// Arguments are kept as raw JSON because receivers disagree on their shape.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub index: i64,
    pub command: String,
    pub args: Vec<Value>,
}

impl IncomingMessage {
    /// First argument as a string (`["c", "SID", ...]`, `["S", "GSID"]`).
    pub fn arg_str(&self, pos: usize) -> Option<&str> {
        self.args.get(pos).and_then(Value::as_str)
    }

    /// Rebuild the `[index, [command, args...]]` entry this message came from.
    pub fn to_entry(&self) -> Value {
        let mut inner = Vec::with_capacity(self.args.len() + 1);
        inner.push(Value::String(self.command.clone()));
        inner.extend(self.args.iter().cloned());
        Value::Array(vec![Value::from(self.index), Value::Array(inner)])
    }
}

/// A named action sent to the receiver, optionally carrying a JSON payload.
///
/// `fields` are the payload values mirrored into the form body as
/// `req{n}_<key>` for receivers that ignore the JSON `actions` field.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub name: String,
    pub payload: Option<Value>,
    pub fields: Vec<(String, String)>,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: None,
            fields: Vec::new(),
        }
    }

    pub fn with_payload<P: ActionPayload>(name: impl Into<String>, payload: &P) -> Result<Self> {
        let value = serde_json::to_value(payload)
            .map_err(|e| MessageError::Encode(format!("action payload: {e}")))?;
        Ok(Self {
            name: name.into(),
            payload: Some(value),
            fields: payload
                .form_fields()
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v))
                .collect(),
        })
    }
}

/// A serializable action payload that knows which of its values are mirrored
/// into the form body.
pub trait ActionPayload: Serialize {
    fn form_fields(&self) -> Vec<(&'static str, String)>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPlaylistPayload {
    pub video_id: String,
    pub video_ids: Vec<String>,
    pub current_index: usize,
    pub current_time: f64,
    pub state: i32,
    pub source: String,
    pub prioritize_mobile_sender_playback_state_on_connection: bool,
    pub list_id: Option<String>,
    pub params: Option<String>,
    pub player_params: Option<String>,
    pub audio_only: bool,
}

impl SetPlaylistPayload {
    pub fn new(video_id: impl Into<String>, video_ids: Vec<String>, current_index: usize, current_time: f64) -> Self {
        Self {
            video_id: video_id.into(),
            video_ids,
            current_index,
            current_time,
            state: STATE_PLAYING as i32,
            source: "REMOTE_CONTROL".into(),
            prioritize_mobile_sender_playback_state_on_connection: true,
            list_id: None,
            params: None,
            player_params: None,
            audio_only: false,
        }
    }
}

impl ActionPayload for SetPlaylistPayload {
    fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("videoId", self.video_id.clone()),
            ("videoIds", self.video_ids.join(",")),
            ("currentIndex", self.current_index.to_string()),
            ("currentTime", fmt_time(self.current_time)),
            ("state", self.state.to_string()),
            ("source", self.source.clone()),
            ("audioOnly", self.audio_only.to_string()),
        ];
        if let Some(list_id) = &self.list_id {
            fields.push(("listId", list_id.clone()));
        }
        if let Some(params) = &self.params {
            fields.push(("params", params.clone()));
        }
        if let Some(player_params) = &self.player_params {
            fields.push(("playerParams", player_params.clone()));
        }
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeekToPayload {
    pub new_time: f64,
    pub reason: i32,
    pub seek_playback_rate: f64,
}

impl ActionPayload for SeekToPayload {
    fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("newTime", fmt_time(self.new_time)),
            ("reason", self.reason.to_string()),
            ("seekPlaybackRate", fmt_time(self.seek_playback_rate)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptionTrackPayload {
    pub track_id: String,
}

impl ActionPayload for CaptionTrackPayload {
    fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![("trackId", self.track_id.clone())]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioTrackPayload {
    pub audio_track_id: String,
}

impl ActionPayload for AudioTrackPayload {
    fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![("audioTrackId", self.audio_track_id.clone())]
    }
}

/// Lounge `state` / `playerState` code for a playing video.
pub const STATE_PLAYING: i64 = 1;

/// Generate a per-session content playback nonce (CPN): 16 alphanumerics.
pub fn generate_cpn() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Format a time/duration value for the form body.
///
/// Matches JavaScript's `Number.toString()` behavior:
/// - Whole numbers: `"191"` not `"191.000"`
/// - Fractional: `"42.567"` not `"42.567000"`
pub fn fmt_time(val: f64) -> String {
    if val.fract() == 0.0 {
        format!("{}", val as i64)
    } else {
        format!("{}", val)
    }
}

// ---------------------------------------------------------------------------
// Wire-format parsing: length-prefixed JSON chunks
// ---------------------------------------------------------------------------

/// Read all length-prefixed JSON chunks from a response body and return the
/// flattened list of incoming messages.
///
/// The wire format is:
/// ```text
/// <decimal_length>\n
/// <JSON array of that many bytes>
/// <decimal_length>\n
/// <JSON array of that many bytes>
/// ...
/// ```
///
/// Each JSON chunk is an array of message tuples:
/// ```json
/// [[0, ["c", "SESSION_ID", "", 8]], [1, ["S", "GSESSION_ID"]]]
/// ```
pub fn parse_chunks(data: &[u8]) -> Result<Vec<IncomingMessage>> {
    let mut messages = Vec::new();
    let mut pos = 0;
    let len = data.len();

    while pos < len {
        while pos < len && matches!(data[pos], b'\n' | b'\r' | b' ') {
            pos += 1;
        }
        if pos >= len {
            break;
        }

        let line_end = memchr_newline(data, pos).ok_or_else(|| {
            MessageError::Parse(format!(
                "expected length line at offset {pos}, got: {:?}",
                String::from_utf8_lossy(&data[pos..std::cmp::min(pos + 40, len)])
            ))
        })?;

        let length_str = std::str::from_utf8(&data[pos..line_end])
            .map_err(|e| MessageError::Parse(format!("invalid UTF-8 in length line: {e}")))?
            .trim();

        let chunk_len: usize = length_str
            .parse()
            .map_err(|e| MessageError::Parse(format!("bad length value \"{length_str}\": {e}")))?;

        let chunk_start = line_end + 1;
        let chunk_end = chunk_start + chunk_len;

        if chunk_end > len {
            return Err(MessageError::Parse(format!(
                "chunk claims {chunk_len} bytes at offset {chunk_start}, but only {} remain",
                len - chunk_start
            )));
        }

        messages.append(&mut parse_messages(&data[chunk_start..chunk_end])?);
        pos = chunk_end;
    }

    Ok(messages)
}

/// Parse a single JSON chunk (one array of message tuples) into messages.
///
/// Entries that do not look like `[index, ["command", ...]]` are skipped;
/// only a non-array top level is an error.
pub fn parse_messages(data: &[u8]) -> Result<Vec<IncomingMessage>> {
    let value: Value = serde_json::from_slice(data)
        .map_err(|e| MessageError::Parse(format!("invalid JSON: {e}")))?;

    let outer = value
        .as_array()
        .ok_or_else(|| MessageError::Schema("top-level JSON is not an array".into()))?;

    Ok(outer.iter().filter_map(message_from_entry).collect())
}

/// Decode one `[index, ["command", args...]]` entry.
pub fn message_from_entry(entry: &Value) -> Option<IncomingMessage> {
    let tuple = entry.as_array()?;
    let index = match tuple.first()? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    let inner = tuple.get(1)?.as_array()?;
    let command = inner.first()?.as_str()?.to_owned();

    Some(IncomingMessage {
        index,
        command,
        args: inner[1..].to_vec(),
    })
}

/// Find the next `\n` starting at `pos`.
fn memchr_newline(data: &[u8], pos: usize) -> Option<usize> {
    data[pos..].iter().position(|&b| b == b'\n').map(|i| pos + i)
}

// ---------------------------------------------------------------------------
// Incremental streaming parser
// ---------------------------------------------------------------------------

/// Incremental parser for the streaming bind response.
///
/// The receiver sends length-prefixed JSON chunks over one long-lived HTTP
/// response. A transport read can end anywhere inside a frame, so
/// `ChunkParser` buffers partial data and yields messages once the declared
/// length is fully available.
pub struct ChunkParser {
    buf: Vec<u8>,
}

impl Default for ChunkParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
        }
    }

    /// Feed raw bytes from the HTTP stream. Returns any complete messages
    /// that can be parsed from the accumulated buffer.
    pub fn feed(&mut self, data: &[u8]) -> Vec<IncomingMessage> {
        self.buf.extend_from_slice(data);
        let mut messages = Vec::new();

        loop {
            let start = self
                .buf
                .iter()
                .position(|b| !matches!(b, b'\n' | b'\r' | b' '));
            match start {
                Some(s) if s > 0 => {
                    self.buf.drain(..s);
                }
                None => {
                    self.buf.clear();
                    break;
                }
                _ => {}
            }

            let newline_pos = match self.buf.iter().position(|&b| b == b'\n') {
                Some(p) => p,
                None => break, // incomplete length line, wait for more data
            };

            let chunk_len: usize = match std::str::from_utf8(&self.buf[..newline_pos])
                .ok()
                .and_then(|s| s.trim().parse().ok())
            {
                Some(n) => n,
                None => {
                    tracing::trace!("[codec] skipping non-numeric length line");
                    self.buf.drain(..=newline_pos);
                    continue;
                }
            };

            let chunk_start = newline_pos + 1;
            let chunk_end = chunk_start + chunk_len;

            if chunk_end > self.buf.len() {
                break; // not enough data for this chunk yet
            }

            match parse_messages(&self.buf[chunk_start..chunk_end]) {
                Ok(mut msgs) => messages.append(&mut msgs),
                Err(e) => tracing::debug!("[codec] dropping malformed chunk: {e}"),
            }

            self.buf.drain(..chunk_end);
        }

        messages
    }

    /// Called at end of stream. A final frame whose declared length was never
    /// reached is still decoded if the bytes that did arrive are valid JSON.
    pub fn finish(&mut self) -> Vec<IncomingMessage> {
        let pending = std::mem::take(&mut self.buf);
        let body = match pending.iter().position(|&b| b == b'\n') {
            Some(p) => &pending[p + 1..],
            None => return Vec::new(),
        };
        let trimmed = trim_ascii_ws(body);
        if trimmed.is_empty() {
            return Vec::new();
        }
        match parse_messages(trimmed) {
            Ok(msgs) => {
                tracing::debug!("[codec] recovered {} message(s) from truncated frame", msgs.len());
                msgs
            }
            Err(e) => {
                tracing::debug!("[codec] discarding truncated frame: {e}");
                Vec::new()
            }
        }
    }
}

fn trim_ascii_ws(mut data: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = data {
        if first.is_ascii_whitespace() {
            data = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = data {
        if last.is_ascii_whitespace() {
            data = rest;
        } else {
            break;
        }
    }
    data
}

// ---------------------------------------------------------------------------
// Outgoing batch encoding
// ---------------------------------------------------------------------------

/// Encode a batch as the JSON `actions` field:
/// `[[start, ["name", payload?]], [start+1, ["name"]], ...]`.
pub fn encode_actions(actions: &[Action], start_id: i64) -> String {
    let entries: Vec<Value> = actions
        .iter()
        .enumerate()
        .map(|(i, action)| {
            let mut command = vec![Value::String(action.name.clone())];
            if let Some(payload) = &action.payload {
                command.push(payload.clone());
            }
            Value::Array(vec![Value::from(start_id + i as i64), Value::Array(command)])
        })
        .collect();
    Value::Array(entries).to_string()
}

/// Serialize a batch into the form-urlencoded bind body.
///
/// Format:
/// ```text
/// count=N&ofs=O&actions=[...]&req0__sc=name&req0_key=val&req1__sc=...
/// ```
pub fn encode_dispatch_form(actions: &[Action], start_id: i64, offset: i64) -> String {
    let mut parts: Vec<String> = Vec::new();

    parts.push(format!("count={}", actions.len()));
    parts.push(format!("ofs={offset}"));
    parts.push(format!(
        "actions={}",
        percent_encode(&encode_actions(actions, start_id))
    ));

    for (i, action) in actions.iter().enumerate() {
        parts.push(format!("req{i}__sc={}", percent_encode(&action.name)));
        for (key, val) in &action.fields {
            parts.push(format!("req{i}_{key}={}", percent_encode(val)));
        }
    }

    parts.join("&")
}

/// Percent-encode a value for use in form-urlencoded bodies.
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push(hex_digit(byte >> 4));
                out.push(hex_digit(byte & 0x0F));
            }
        }
    }
    out
}

fn hex_digit(nibble: u8) -> char {
    match nibble {
        0..=9 => (b'0' + nibble) as char,
        _ => (b'A' + nibble - 10) as char,
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Generate a random 12-character lowercase string, used as the `zx`
/// cache-buster query parameter on the streaming request.
pub fn zx() -> String {
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| (b'a' + rng.gen_range(0..26)) as char)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
