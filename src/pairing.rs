use std::time::Duration;

use serde::Deserialize;

use crate::lounge::{truncate, LoungeError, PairingFailure, Result};
use crate::messages::{percent_encode, MessageError};
use crate::session::{Device, SessionStore};
use crate::transport::{HttpRequest, Transport};

pub const PAIRING_URL: &str = "https://www.youtube.com/api/lounge/pairing";

/// Length of the code shown on the TV's "Link with TV code" screen.
pub const CODE_LENGTH: usize = 12;

#[derive(Debug, Default, Deserialize)]
struct ScreenResponse {
    #[serde(default)]
    screen: Option<LoungeScreen>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LoungeScreen {
    screen_id: String,
    lounge_token: String,
    name: Option<String>,
}

/// Keep only the digits: `" 12-34 56 78 90 12"` -> `"123456789012"`.
pub fn normalize_code(code: &str) -> String {
    code.chars().filter(char::is_ascii_digit).collect()
}

pub fn is_valid_code(code: &str) -> bool {
    normalize_code(code).len() == CODE_LENGTH
}

/// Resolve a TV code to a screen and remember it as a paired device.
///
/// Does not select the device and does not touch any session state.
pub async fn pair(
    transport: &dyn Transport,
    store: &SessionStore,
    timeout: Duration,
    code: &str,
) -> Result<Device> {
    let code = normalize_code(code);
    tracing::debug!("[pairing] requesting screen for code={code}");

    let request = HttpRequest::post(format!("{PAIRING_URL}/get_screen"))
        .form(format!("pairing_code={}&access_type=permanent", percent_encode(&code)))
        .timeout(Some(timeout));
    let resp = transport.execute(request).await?;

    let status = resp.status;
    let body = resp.text().await?;
    if !(200..300).contains(&status) {
        tracing::error!("[pairing] get_screen returned {status}: {}", truncate(&body, 200));
        return Err(LoungeError::PairingFailed(PairingFailure::Http(status)));
    }

    let parsed: ScreenResponse = serde_json::from_str(&body)
        .map_err(|e| MessageError::Parse(format!("get_screen response: {e}")))?;
    let screen = parsed
        .screen
        .filter(|s| !s.screen_id.is_empty() && !s.lounge_token.is_empty())
        .ok_or(LoungeError::PairingFailed(PairingFailure::NoScreens))?;

    let device = Device {
        name: screen
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| screen.screen_id.clone()),
        screen_id: screen.screen_id,
        lounge_token: screen.lounge_token,
    };
    store.save_device(&device)?;

    tracing::info!("[pairing] paired with screen={} name={}", device.screen_id, device.name);
    Ok(device)
}
