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

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{info, span, warn, Level};

use crate::color::Frame;
use crate::engine::{Counters, SceneManager};
use crate::playsync::CancelHandle;

/// How often to check for newly loaded scenes while there is nothing to play.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// A playback summary is logged once per this many frames.
const FPS_LOG_INTERVAL: u64 = 600;

/// Starts the frame scheduler on its own thread. Each tick advances the
/// animation by the speed-scaled real time delta, renders one frame under the
/// engine mutex and hands it to the output worker. The loop is paced with a
/// spin sleep against an absolute tick anchor; when a frame overruns its
/// budget the anchor is dropped forward so no backlog accumulates.
pub fn start_thread(
    manager: Arc<SceneManager>,
    counters: Arc<Counters>,
    frame_sender: Sender<Frame>,
    cancel_handle: CancelHandle,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let span = span!(Level::INFO, "frame scheduler");
        let _enter = span.enter();

        info!("Frame scheduler started.");

        let mut next_tick = Instant::now();
        let mut last_frame_instant = Instant::now();
        let mut frame_count: u64 = 0;
        let mut window_start = Instant::now();

        loop {
            if cancel_handle.is_cancelled() {
                info!("Frame scheduler stopped.");
                return;
            }

            // Playback is conditional: idle until a scene bundle is loaded.
            if !manager.has_scenes() {
                thread::sleep(IDLE_POLL);
                next_tick = Instant::now();
                last_frame_instant = next_tick;
                window_start = next_tick;
                continue;
            }

            // The tick length follows the active scene, re-read every frame.
            let tick = Duration::from_secs(1).div_f64(f64::from(manager.fps()));

            let now = Instant::now();
            let delta_real = now.duration_since(last_frame_instant).as_secs_f64();
            last_frame_instant = now;
            let delta = delta_real * f64::from(manager.speed_percent()) / 100.0;

            manager.update_animation(delta, now);
            let frame = manager.render(now);
            if frame_sender.send(frame).is_err() {
                warn!("Output worker is gone, stopping the scheduler.");
                return;
            }

            frame_count += 1;
            if frame_count % FPS_LOG_INTERVAL == 0 {
                let window = window_start.elapsed().as_secs_f64();
                if window > 0.0 {
                    info!(
                        fps = format!("{:.1}", FPS_LOG_INTERVAL as f64 / window),
                        speed = manager.speed_percent(),
                        stats = counters.summary(),
                        "Playback running."
                    );
                }
                window_start = Instant::now();
            }

            next_tick += tick;
            let behind = Instant::now();
            if next_tick < behind {
                next_tick = behind;
            } else {
                spin_sleep::sleep(next_tick - behind);
            }
        }
    })
}
