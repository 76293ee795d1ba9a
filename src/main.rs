use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use lounge_remote::heartbeat::{HeartbeatController, PlaybackState};
use lounge_remote::pairing;
use lounge_remote::storage::FileStorage;
use lounge_remote::transport::ReqwestTransport;
use lounge_remote::{Config, Device, LoungeEvent, LoungeSender, NowPlayingStatus, VideoRequest};

type CliResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

const USAGE: &str = "\
usage: lounge-remote <command> [args]

  pair <code>             link with the 12-digit code shown on the TV
  devices                 list paired screens (* = active)
  use <screen id|name>    select a paired screen
  forget <screen id|name> remove a paired screen
  wipe [--all]            forget all screens (--all: also the local device id)
  video <id> [queue ids]  play a video, optionally within a queue
  play | pause | next | previous
  seek <seconds>
  captions [track id]     no id turns captions off
  audio [track id]
  ping                    check the active screen answers
  status                  ask the active screen what it is playing
  watch                   follow the active screen until Ctrl-C";

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> CliResult {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        println!("{USAGE}");
        return Ok(());
    };

    let config = Config::from_env();
    let state_file = match &config.state_file {
        Some(path) => path.clone(),
        None => FileStorage::default_path()?,
    };
    tracing::debug!("[init] state file {}", state_file.display());

    let transport = Arc::new(ReqwestTransport::new()?);
    let storage = Arc::new(FileStorage::new(state_file));
    let sender = LoungeSender::new(&config, transport, storage);

    run(&sender, command, rest).await
}

async fn run(sender: &LoungeSender, command: &str, rest: &[String]) -> CliResult {
    let arg = |n: usize| rest.get(n).map(String::as_str);

    match command {
        "pair" => {
            let code = rest.join(" ");
            if !pairing::is_valid_code(&code) {
                return Err(format!("pairing code must have {} digits", pairing::CODE_LENGTH).into());
            }
            let device = sender.pair(&code).await?;
            sender.set_active_device(&device)?;
            println!("paired with {} ({})", device.name, device.screen_id);
        }
        "devices" => {
            let active = sender.current_device();
            let devices = sender.paired_devices();
            if devices.is_empty() {
                println!("no paired screens");
            }
            for device in devices {
                let marker = if active.as_ref() == Some(&device) { '*' } else { ' ' };
                println!("{marker} {}  {}", device.screen_id, device.name);
            }
        }
        "use" => {
            let device = find_device(sender, arg(0))?;
            sender.set_active_device(&device)?;
            println!("using {}", device.name);
        }
        "forget" => {
            let device = find_device(sender, arg(0))?;
            sender.remove_device(&device)?;
            println!("forgot {}", device.name);
        }
        "wipe" => {
            if arg(0) == Some("--all") {
                sender.clear_all_devices()?;
            } else {
                sender.clear_device()?;
            }
            println!("pairing data cleared");
        }
        "video" => {
            let video_id = arg(0).ok_or("missing video id")?;
            sender.send_video(&video_request(video_id, &rest[1..])).await?;
        }
        "play" => sender.play().await?,
        "pause" => sender.pause().await?,
        "next" => sender.next().await?,
        "previous" => sender.previous().await?,
        "seek" => {
            let seconds: f64 = arg(0).ok_or("missing position")?.parse()?;
            sender.seek_to((seconds * 1000.0) as i64).await?;
        }
        "captions" => sender.set_caption_track(arg(0)).await?,
        "audio" => sender.set_audio_track(arg(0)).await?,
        "ping" => {
            let status = sender.ping().await?;
            println!("reachable");
            if let Some(status) = status {
                print_status(&status);
            }
        }
        "status" => match sender.request_now_playing().await? {
            Some(status) => print_status(&status),
            None => println!("no status reported"),
        },
        "watch" => watch(sender).await?,
        other => {
            println!("{USAGE}");
            return Err(format!("unknown command: {other}").into());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn find_device(sender: &LoungeSender, needle: Option<&str>) -> Result<Device, String> {
    let needle = needle.ok_or("missing screen id or name")?;
    sender
        .paired_devices()
        .into_iter()
        .find(|d| d.screen_id == needle || d.name.eq_ignore_ascii_case(needle))
        .ok_or_else(|| format!("no paired screen matches {needle:?}"))
}

/// `video b a b c` plays `b` as the second entry of `[a, b, c]`; a queue
/// without the video gets it prepended.
fn video_request(video_id: &str, queue: &[String]) -> VideoRequest {
    let mut request = VideoRequest::new(video_id);
    if queue.is_empty() {
        return request;
    }
    match queue.iter().position(|id| id == video_id) {
        Some(index) => {
            request.queue = queue.to_vec();
            request.current_index = index;
        }
        None => {
            request.queue = std::iter::once(video_id.to_owned()).chain(queue.iter().cloned()).collect();
        }
    }
    request
}

fn print_status(status: &NowPlayingStatus) {
    let secs = |ms: Option<i64>| ms.map(|ms| format!("{:.1}s", ms as f64 / 1000.0)).unwrap_or_else(|| "?".into());
    let state = match status.is_playing {
        Some(true) => "playing",
        Some(false) => "paused",
        None => "unknown",
    };
    println!(
        "{} {} {}/{} index={}",
        state,
        status.video_id.as_deref().unwrap_or("-"),
        secs(status.current_time_ms),
        secs(status.duration_ms),
        status.current_index.map_or_else(|| "-".into(), |i| i.to_string()),
    );
}

/// Run the streaming reader and both heartbeat loops, printing events.
async fn watch(sender: &LoungeSender) -> CliResult {
    let device = sender.current_device().ok_or("no active screen, run `use` first")?;
    println!("watching {} (Ctrl-C to stop)", device.name);

    let playback = Arc::new(PlaybackState::new());
    let feed = playback.clone();
    let feeder = sender.events().on_now_playing(move |status| {
        if let Some(playing) = status.is_playing {
            feed.update(playing);
        }
    });

    let mut events = sender.events().subscribe();
    let mut controller = HeartbeatController::new(sender.clone());
    controller.start_reachability();
    controller.start_heartbeat(playback).await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(LoungeEvent::NowPlaying(status)) => print_status(&status),
                Ok(LoungeEvent::Reachability { reachable, .. }) => {
                    tracing::info!("[watch] reachable={reachable}");
                }
                Ok(LoungeEvent::PingResult { reachable, status }) => {
                    tracing::debug!("[watch] ping reachable={reachable}");
                    if let Some(status) = status {
                        print_status(&status);
                    }
                }
                Ok(LoungeEvent::DeviceEvicted) => {
                    println!("screen stopped answering and was deselected");
                    break;
                }
                Ok(LoungeEvent::ConnectionLost) => {
                    println!("connection lost");
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("[watch] skipped {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, shutting down...");
                break;
            }
        }
    }

    controller.shutdown().await;
    feeder.abort();
    tracing::info!("Shutdown complete");
    Ok(())
}
