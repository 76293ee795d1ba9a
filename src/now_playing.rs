use serde::Serialize;
use serde_json::{Map, Value};

use crate::messages::STATE_PLAYING;

/// Normalized playback snapshot reported by a receiver.
///
/// Every field is optional; receivers send partial updates and disagree on
/// naming, so a missing field means "unknown", never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NowPlayingStatus {
    pub current_time_ms: Option<i64>,
    pub duration_ms: Option<i64>,
    pub is_playing: Option<bool>,
    pub video_id: Option<String>,
    pub current_index: Option<i64>,
    pub video_ids: Option<Vec<String>>,
}

/// Extract the first now-playing snapshot from a response or frame body.
///
/// The body may carry a length prefix or other noise before the JSON, so
/// this scans for bracketed arrays and walks their `[id, [event, payload]]`
/// entries in order. Anything unparsable yields `None`.
pub fn parse_now_playing(body: &str) -> Option<NowPlayingStatus> {
    let mut pos = 0;
    while let Some(offset) = body[pos..].find('[') {
        let start = pos + offset;
        let mut stream = serde_json::Deserializer::from_str(&body[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Array(entries))) => {
                if let Some(status) = entries.iter().find_map(status_from_entry) {
                    return Some(status);
                }
                pos = start + stream.byte_offset().max(1);
            }
            _ => pos = start + 1,
        }
    }

    tracing::debug!(
        "[now-playing] no status in body: {}",
        &body[..floor_char_boundary(body, 400)]
    );
    None
}

/// Status carried by a single `[id, [event, payload]]` entry, if any.
pub fn status_from_entry(entry: &Value) -> Option<NowPlayingStatus> {
    let payload = entry.as_array()?.get(1)?.as_array()?.get(1)?.as_object()?;
    status_from_payload(payload)
}

fn status_from_payload(payload: &Map<String, Value>) -> Option<NowPlayingStatus> {
    let video_id = payload
        .get("videoId")
        .and_then(as_text)
        .filter(|s| !s.trim().is_empty());

    let current_index = payload
        .get("currentIndex")
        .and_then(as_int)
        .or_else(|| payload.get("index").and_then(as_int));

    let video_ids = match payload.get("videoIds") {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(as_text)
                .filter(|s| !s.is_empty())
                .collect(),
        ),
        Some(Value::String(joined)) => {
            let ids: Vec<String> = joined
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            (!ids.is_empty()).then_some(ids)
        }
        _ => None,
    };

    let current_time = payload
        .get("currentTime")
        .and_then(as_f64)
        .or_else(|| payload.get("time").and_then(as_f64));
    let duration = payload.get("duration").and_then(as_f64);

    let is_playing = match (
        payload.get("playerState").and_then(as_int),
        payload.get("state").and_then(as_int),
    ) {
        (Some(player_state), _) => Some(player_state == STATE_PLAYING),
        (None, Some(state)) => Some(state == STATE_PLAYING),
        (None, None) => None,
    };

    let status = NowPlayingStatus {
        current_time_ms: current_time.map(|s| (s * 1000.0) as i64),
        duration_ms: duration.map(|s| (s * 1000.0) as i64),
        is_playing,
        video_id,
        current_index,
        video_ids,
    };

    (status != NowPlayingStatus::default()).then_some(status)
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_int(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Signature of a queue as last pushed to the receiver. Two signatures are
/// equal iff every component is equal; queue order matters.
pub fn queue_signature(
    video_id: &str,
    current_index: usize,
    queue_ids: &[String],
    list_id: Option<&str>,
    params: Option<&str>,
    player_params: Option<&str>,
) -> String {
    [
        video_id.to_owned(),
        current_index.to_string(),
        queue_ids.join("|"),
        list_id.unwrap_or_default().to_owned(),
        params.unwrap_or_default().to_owned(),
        player_params.unwrap_or_default().to_owned(),
    ]
    .join("#")
}
