//! Remote-control sender for TV screens that speak the lounge bind-channel
//! protocol: pair with a TV code, push videos and transport commands, and
//! follow what the screen is playing.

pub mod config;
pub mod events;
pub mod heartbeat;
pub mod lounge;
pub mod messages;
pub mod now_playing;
pub mod pairing;
pub mod retry;
pub mod sender;
pub mod session;
pub mod storage;
pub mod stream;
pub mod transport;

pub use config::Config;
pub use events::{EventHub, LoungeEvent};
pub use heartbeat::{HeartbeatController, PlaybackProbe, PlaybackState};
pub use lounge::{LoungeError, Result};
pub use now_playing::NowPlayingStatus;
pub use sender::{LoungeSender, VideoRequest};
pub use session::Device;
