// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use std::error::Error;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use rosc::{
    address::{Matcher, OscAddress},
    OscMessage, OscPacket, OscType,
};
use tokio::{net::UdpSocket, sync::mpsc};
use tracing::{debug, error, info, span, Level};

use crate::color::Rgb;
use crate::dissolve;
use crate::engine::{Counters, SceneManager};
use crate::scene::loader;

/// Size of the bounded control event queue between the UDP receiver and the
/// apply worker. Events beyond this are dropped, not buffered.
pub const EVENT_QUEUE_SIZE: usize = 64;

/// The file extension the loaders expect, appended to extensionless paths.
const DEFAULT_DOCUMENT_EXTENSION: &str = "json";

/// A decoded control message, ready to be applied to the scene manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    LoadScenes(String),
    StageScene(i64),
    StageEffect(i64),
    StagePalette(i64),
    CommitPattern,
    Pause,
    Resume,
    SetPaletteColor {
        palette_id: usize,
        color_id: usize,
        color: Rgb,
    },
    LoadDissolvePatterns(String),
    SetDissolvePattern(i64),
    SetSpeedPercent(i64),
    SetMasterBrightness(i64),
}

/// The OSC addresses the engine listens for.
pub struct ControlAddresses {
    load_json: Matcher,
    change_scene: Matcher,
    change_effect: Matcher,
    change_palette: Matcher,
    change_pattern: Matcher,
    pause: Matcher,
    resume: Matcher,
    palette_color: Matcher,
    load_dissolve_json: Matcher,
    set_dissolve_pattern: Matcher,
    set_speed_percent: Matcher,
    master_brightness: Matcher,
}

impl ControlAddresses {
    pub fn new() -> Result<ControlAddresses, Box<dyn Error>> {
        Ok(ControlAddresses {
            load_json: Matcher::new("/load_json")?,
            change_scene: Matcher::new("/change_scene")?,
            change_effect: Matcher::new("/change_effect")?,
            change_palette: Matcher::new("/change_palette")?,
            change_pattern: Matcher::new("/change_pattern")?,
            pause: Matcher::new("/pause")?,
            resume: Matcher::new("/resume")?,
            palette_color: Matcher::new("/palette/*/*")?,
            load_dissolve_json: Matcher::new("/load_dissolve_json")?,
            set_dissolve_pattern: Matcher::new("/set_dissolve_pattern")?,
            set_speed_percent: Matcher::new("/set_speed_percent")?,
            master_brightness: Matcher::new("/master_brightness")?,
        })
    }

    /// Decodes one OSC message into a control event. None means the message
    /// was unknown or malformed and should be counted and dropped.
    pub fn decode(&self, message: &OscMessage) -> Option<ControlEvent> {
        let address = OscAddress::new(message.addr.clone()).ok()?;

        if self.load_json.match_address(&address) {
            return Some(ControlEvent::LoadScenes(with_default_extension(&string_arg(
                message, 0,
            )?)));
        }
        if self.change_scene.match_address(&address) {
            return Some(ControlEvent::StageScene(int_arg(message, 0)?));
        }
        if self.change_effect.match_address(&address) {
            return Some(ControlEvent::StageEffect(int_arg(message, 0)?));
        }
        if self.change_palette.match_address(&address) {
            return Some(ControlEvent::StagePalette(int_arg(message, 0)?));
        }
        if self.change_pattern.match_address(&address) {
            return Some(ControlEvent::CommitPattern);
        }
        if self.pause.match_address(&address) {
            return Some(ControlEvent::Pause);
        }
        if self.resume.match_address(&address) {
            return Some(ControlEvent::Resume);
        }
        if self.palette_color.match_address(&address) {
            return decode_palette_color(message);
        }
        if self.load_dissolve_json.match_address(&address) {
            return Some(ControlEvent::LoadDissolvePatterns(with_default_extension(
                &string_arg(message, 0)?,
            )));
        }
        if self.set_dissolve_pattern.match_address(&address) {
            return Some(ControlEvent::SetDissolvePattern(int_arg(message, 0)?));
        }
        if self.set_speed_percent.match_address(&address) {
            return Some(ControlEvent::SetSpeedPercent(int_arg(message, 0)?));
        }
        if self.master_brightness.match_address(&address) {
            return Some(ControlEvent::SetMasterBrightness(int_arg(message, 0)?));
        }

        None
    }
}

fn int_arg(message: &OscMessage, index: usize) -> Option<i64> {
    match message.args.get(index)? {
        OscType::Int(value) => Some(i64::from(*value)),
        OscType::Long(value) => Some(*value),
        _ => None,
    }
}

fn string_arg(message: &OscMessage, index: usize) -> Option<String> {
    match message.args.get(index)? {
        OscType::String(value) => Some(value.clone()),
        _ => None,
    }
}

/// Appends the loader's extension to paths that have none, so senders can
/// say `/load_json scenes` and mean `scenes.json`.
fn with_default_extension(path: &str) -> String {
    if Path::new(path).extension().is_none() {
        format!("{}.{}", path, DEFAULT_DOCUMENT_EXTENSION)
    } else {
        path.to_string()
    }
}

/// Parses `/palette/{p}/{c}` plus three integer channel arguments. The color
/// slot must name one of the six palette slots; channels are clamped.
fn decode_palette_color(message: &OscMessage) -> Option<ControlEvent> {
    let mut parts = message.addr.split('/').skip(2);
    let palette_id: usize = parts.next()?.parse().ok()?;
    let color_id: usize = parts.next()?.parse().ok()?;
    if color_id >= crate::scene::PALETTE_SIZE {
        return None;
    }

    let channel = |index| int_arg(message, index).map(|value| value.clamp(0, 255) as u8);
    Some(ControlEvent::SetPaletteColor {
        palette_id,
        color_id,
        color: Rgb::new(channel(0)?, channel(1)?, channel(2)?),
    })
}

/// Serves the control socket: datagrams are decoded and enqueued for the
/// apply worker. Only a fatal socket error ends the loop; malformed traffic
/// is counted and dropped.
pub async fn serve(
    socket: UdpSocket,
    events: mpsc::Sender<ControlEvent>,
    counters: Arc<Counters>,
) -> std::io::Result<()> {
    let addresses =
        ControlAddresses::new().map_err(|e| std::io::Error::other(e.to_string()))?;
    info!(addr = socket.local_addr()?.to_string(), "Control server started.");

    let mut buf = [0u8; rosc::decoder::MTU];
    loop {
        let (size, sender_addr) = socket.recv_from(&mut buf).await?;
        match rosc::decoder::decode_udp(&buf[..size]) {
            Ok((_, packet)) => enqueue_packet(&addresses, &packet, &events, &counters),
            Err(e) => {
                counters.malformed_events.fetch_add(1, Ordering::Relaxed);
                error!(
                    err = e.to_string(),
                    sender = sender_addr.to_string(),
                    "Error decoding control message."
                );
            }
        }
    }
}

/// Flattens bundles and enqueues every decodable message in arrival order.
fn enqueue_packet(
    addresses: &ControlAddresses,
    packet: &OscPacket,
    events: &mpsc::Sender<ControlEvent>,
    counters: &Arc<Counters>,
) {
    match packet {
        OscPacket::Message(message) => match addresses.decode(message) {
            Some(event) => {
                debug!(addr = message.addr.as_str(), "Control message received.");
                if events.try_send(event).is_err() {
                    counters.dropped_events.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                counters.malformed_events.fetch_add(1, Ordering::Relaxed);
                debug!(addr = message.addr.as_str(), "Dropping unrecognized control message.");
            }
        },
        OscPacket::Bundle(bundle) => {
            for inner in &bundle.content {
                enqueue_packet(addresses, inner, events, counters);
            }
        }
    }
}

/// Starts the apply worker: a dedicated thread draining the event queue and
/// calling the matching scene manager operation for each event. The thread
/// exits when the queue's senders are gone.
pub fn start_apply_thread(
    mut events: mpsc::Receiver<ControlEvent>,
    manager: Arc<SceneManager>,
    counters: Arc<Counters>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let span = span!(Level::INFO, "control apply");
        let _enter = span.enter();

        while let Some(event) = events.blocking_recv() {
            apply_event(&manager, &counters, event);
        }
        info!("Control apply worker stopped.");
    })
}

/// Applies one decoded control event to the engine. Failures are local:
/// they're counted and logged, and playback continues with previous state.
pub fn apply_event(manager: &SceneManager, counters: &Counters, event: ControlEvent) {
    match event {
        ControlEvent::LoadScenes(path) => {
            let now = Instant::now();
            match loader::load_scenes_file(Path::new(&path), now) {
                Ok(scenes) => manager.load_scenes(scenes, now),
                Err(e) => {
                    counters.load_failures.fetch_add(1, Ordering::Relaxed);
                    error!(err = e.to_string(), path, "Error loading scene bundle.");
                }
            }
        }
        ControlEvent::StageScene(id) => match u32::try_from(id) {
            Ok(id) => manager.cache_change_scene(id),
            Err(_) => {
                counters.missing_resources.fetch_add(1, Ordering::Relaxed);
            }
        },
        ControlEvent::StageEffect(id) => match u32::try_from(id) {
            Ok(id) => manager.cache_change_effect(id),
            Err(_) => {
                counters.missing_resources.fetch_add(1, Ordering::Relaxed);
            }
        },
        ControlEvent::StagePalette(id) => match usize::try_from(id) {
            Ok(id) => manager.cache_change_palette(id),
            Err(_) => {
                counters.missing_resources.fetch_add(1, Ordering::Relaxed);
            }
        },
        ControlEvent::CommitPattern => manager.commit_pattern(Instant::now()),
        ControlEvent::Pause => manager.pause(),
        ControlEvent::Resume => manager.resume(),
        ControlEvent::SetPaletteColor {
            palette_id,
            color_id,
            color,
        } => manager.set_palette_color(palette_id, color_id, color),
        ControlEvent::LoadDissolvePatterns(path) => {
            match dissolve::load_dissolve_file(Path::new(&path)) {
                Ok(patterns) => manager.load_dissolve_patterns(patterns),
                Err(e) => {
                    counters.load_failures.fetch_add(1, Ordering::Relaxed);
                    error!(err = e.to_string(), path, "Error loading dissolve patterns.");
                }
            }
        }
        ControlEvent::SetDissolvePattern(id) => match u32::try_from(id) {
            Ok(id) => manager.set_dissolve_pattern(id),
            Err(_) => {
                counters.missing_resources.fetch_add(1, Ordering::Relaxed);
            }
        },
        ControlEvent::SetSpeedPercent(percent) => manager.set_speed_percent(percent),
        ControlEvent::SetMasterBrightness(brightness) => {
            manager.set_master_brightness(brightness)
        }
    }
}
