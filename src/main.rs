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
mod color;
mod config;
mod control;
mod dissolve;
mod engine;
mod output;
mod playsync;
mod scene;
mod scheduler;
#[cfg(test)]
mod testutil;

use std::env;
use std::error::Error;
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::time::Instant;

use clap::{crate_version, Parser, Subcommand};
use tokio::net::UdpSocket;
use tracing::{error, info};

use crate::engine::{Counters, SceneManager};
use crate::playsync::CancelHandle;

const SYSTEMD_SERVICE: &str = r#"
[Unit]
Description=LED animation playback engine

[Service]
Type=simple
Restart=on-failure
EnvironmentFile=-/etc/default/ledtrack
ExecStart={{ CURRENT_EXECUTABLE }} start "$LEDTRACK_CONFIG"
ExecReload=/bin/kill -HUP $MAINPID

[Install]
WantedBy=multi-user.target
Alias=ledtrack.service
"#;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A real-time LED animation playback engine."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Starts the playback engine.
    Start {
        /// The path to the engine config.
        config_path: String,
    },
    /// Loads and validates a scene bundle file.
    VerifyScenes {
        /// The path to the scene bundle to verify.
        scenes_path: String,
    },
    /// Loads and validates a dissolve pattern file.
    VerifyDissolve {
        /// The path to the dissolve pattern bundle to verify.
        patterns_path: String,
    },
    /// Prints a systemd service definition to stdout.
    Systemd {},
}

#[tokio::main]
async fn main() {
    // Default logging to off globally with ledtrack at info level.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off,ledtrack=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config_path } => start(Path::new(&config_path)).await,
        Commands::VerifyScenes { scenes_path } => verify_scenes(Path::new(&scenes_path)),
        Commands::VerifyDissolve { patterns_path } => verify_dissolve(Path::new(&patterns_path)),
        Commands::Systemd {} => {
            let current_executable_path = env::current_exe()?;
            println!(
                "{}",
                SYSTEMD_SERVICE.replace(
                    "{{ CURRENT_EXECUTABLE }}",
                    current_executable_path
                        .to_str()
                        .expect("unable to convert current executable path to string")
                )
            );
            Ok(())
        }
    }
}

/// Brings up the playback workers and serves control traffic until ctrl-c.
async fn start(config_path: &Path) -> Result<(), Box<dyn Error>> {
    let config = config::Engine::deserialize(config_path)?;
    let osc = config.osc();
    let animation = config.animation();

    let counters = Counters::new();
    let manager = Arc::new(SceneManager::new(
        animation.led_count(),
        animation.fps(),
        animation.master_brightness(),
        animation.speed_percent(),
        counters.clone(),
    ));
    let cancel_handle = CancelHandle::new();

    // Output fan-out worker.
    let destinations = config
        .destinations()
        .iter()
        .map(|destination| {
            output::Destination::new(
                destination.ip(),
                destination.port(),
                destination.copy_mode(),
                destination.start_led(),
                destination.end_led(),
            )
        })
        .collect::<Result<Vec<output::Destination>, Box<dyn Error>>>()?;
    let (frame_sender, frame_receiver) = mpsc::channel();
    let output = output::Output::new(osc.output_address(), destinations, counters.clone())?;
    let output_handle = output.start_thread(frame_receiver, cancel_handle.clone());

    // Frame scheduler worker.
    let scheduler_handle = scheduler::start_thread(
        manager.clone(),
        counters.clone(),
        frame_sender,
        cancel_handle.clone(),
    );

    // Control ingress: the UDP server feeds the bounded event queue, the
    // apply worker drains it into the scene manager.
    let (event_sender, event_receiver) =
        tokio::sync::mpsc::channel(control::EVENT_QUEUE_SIZE);
    let apply_handle =
        control::start_apply_thread(event_receiver, manager.clone(), counters.clone());

    let socket = UdpSocket::bind((osc.host(), osc.port())).await?;
    let serve_task = {
        let counters = counters.clone();
        tokio::spawn(async move {
            if let Err(e) = control::serve(socket, event_sender, counters).await {
                // Playback continues with the last known state.
                error!(err = e.to_string(), "Control server failed.");
            }
        })
    };

    info!("Engine started. Waiting for a scene bundle to begin playback.");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down.");

    cancel_handle.cancel();
    serve_task.abort();
    let _ = serve_task.await;

    scheduler_handle
        .join()
        .map_err(|_| "error waiting for the frame scheduler".to_string())?;
    output_handle
        .join()
        .map_err(|_| "error waiting for the output worker".to_string())?;
    apply_handle
        .join()
        .map_err(|_| "error waiting for the control apply worker".to_string())?;

    Ok(())
}

/// Verifies a scene bundle file and prints a summary.
fn verify_scenes(scenes_path: &Path) -> Result<(), Box<dyn Error>> {
    let scenes = match scene::loader::load_scenes_file(scenes_path, Instant::now()) {
        Ok(scenes) => scenes,
        Err(e) => {
            eprintln!("❌ Invalid scene bundle:");
            eprintln!("{}", e);
            return Err(e.into());
        }
    };

    println!("✅ Scene bundle is valid");
    println!("   Found {} scene(s):", scenes.len());
    for scene in &scenes {
        println!(
            "   - scene {} ({} LEDs @ {} fps, {} palette(s))",
            scene.scene_id(),
            scene.led_count(),
            scene.fps(),
            scene.palette_count(),
        );
        for effect in scene.effects() {
            println!(
                "     effect {}: {} segment(s)",
                effect.effect_id(),
                effect.segments().len(),
            );
            for segment in effect.segments() {
                println!(
                    "       segment {}: {} LED(s)",
                    segment.segment_id(),
                    segment.total_led_count(),
                );
            }
        }
    }

    Ok(())
}

/// Verifies a dissolve pattern file and prints a summary.
fn verify_dissolve(patterns_path: &Path) -> Result<(), Box<dyn Error>> {
    let patterns = match dissolve::load_dissolve_file(patterns_path) {
        Ok(patterns) => patterns,
        Err(e) => {
            eprintln!("❌ Invalid dissolve pattern bundle:");
            eprintln!("{}", e);
            return Err(e.into());
        }
    };

    println!("✅ Dissolve pattern bundle is valid");
    println!("   Found {} pattern(s):", patterns.len());
    for (pattern_id, pattern) in &patterns {
        println!("   - pattern {}: {} band(s)", pattern_id, pattern.band_count());
    }

    Ok(())
}
