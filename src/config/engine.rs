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
use std::fs;
use std::path::Path;

use serde::Deserialize;

/// The default control listen address and port.
pub const DEFAULT_OSC_HOST: &str = "0.0.0.0";
pub const DEFAULT_OSC_PORT: u16 = 8000;

/// The OSC address frames are emitted on.
pub const DEFAULT_OUTPUT_ADDRESS: &str = "/light/serial";

/// Playback defaults used before the first scene bundle is loaded.
pub const DEFAULT_LED_COUNT: usize = 225;
pub const DEFAULT_FPS: u32 = 60;
pub const DEFAULT_MASTER_BRIGHTNESS: u8 = 255;
pub const DEFAULT_SPEED_PERCENT: u16 = 100;

/// A YAML representation of the engine configuration.
#[derive(Deserialize, Clone)]
pub struct Engine {
    /// The OSC input and output settings.
    osc: Option<Osc>,

    /// Playback defaults.
    animation: Option<Animation>,

    /// The downstream light controllers to fan frames out to.
    destinations: Vec<Destination>,
}

impl Engine {
    /// Reads and validates the engine configuration from a YAML file.
    pub fn deserialize(path: &Path) -> Result<Engine, Box<dyn Error>> {
        let engine: Engine = serde_yaml::from_str(&fs::read_to_string(path)?)?;
        engine.validate()?;
        Ok(engine)
    }

    fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.destinations.is_empty() {
            return Err("at least one destination must be configured".into());
        }
        for destination in &self.destinations {
            if destination.port == 0 {
                return Err(format!("destination {} has port 0", destination.ip).into());
            }
        }
        Ok(())
    }

    /// Gets the OSC settings.
    pub fn osc(&self) -> Osc {
        self.osc.clone().unwrap_or_default()
    }

    /// Gets the playback defaults.
    pub fn animation(&self) -> Animation {
        self.animation.clone().unwrap_or_default()
    }

    /// Gets the configured destinations.
    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }
}

/// A YAML representation of the OSC configuration.
#[derive(Deserialize, Clone, Default)]
pub struct Osc {
    /// The address the control server listens on.
    host: Option<String>,

    /// The port the control server listens on.
    port: Option<u16>,

    /// The OSC address frames are emitted on.
    output_address: Option<String>,
}

impl Osc {
    /// Gets the control listen host.
    pub fn host(&self) -> String {
        self.host.clone().unwrap_or_else(|| DEFAULT_OSC_HOST.to_string())
    }

    /// Gets the control listen port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_OSC_PORT)
    }

    /// Gets the output OSC address.
    pub fn output_address(&self) -> String {
        self.output_address
            .clone()
            .unwrap_or_else(|| DEFAULT_OUTPUT_ADDRESS.to_string())
    }
}

/// A YAML representation of the playback defaults.
#[derive(Deserialize, Clone, Default)]
pub struct Animation {
    /// Frame size before any scene is loaded.
    led_count: Option<usize>,

    /// Tick rate before any scene is loaded.
    fps: Option<u32>,

    /// Initial master brightness.
    master_brightness: Option<u8>,

    /// Initial playback speed in percent.
    speed_percent: Option<u16>,
}

impl Animation {
    pub fn led_count(&self) -> usize {
        self.led_count.unwrap_or(DEFAULT_LED_COUNT)
    }

    pub fn fps(&self) -> u32 {
        self.fps.unwrap_or(DEFAULT_FPS)
    }

    pub fn master_brightness(&self) -> u8 {
        self.master_brightness.unwrap_or(DEFAULT_MASTER_BRIGHTNESS)
    }

    pub fn speed_percent(&self) -> u16 {
        self.speed_percent.unwrap_or(DEFAULT_SPEED_PERCENT)
    }
}

/// A YAML representation of one output destination.
#[derive(Deserialize, Clone)]
pub struct Destination {
    /// The destination IP address.
    ip: String,

    /// The destination UDP port.
    port: u16,

    /// When true the destination receives the whole frame and the range
    /// fields are ignored.
    #[serde(default)]
    copy_mode: bool,

    /// First LED of the slice this destination receives.
    #[serde(default)]
    start_led: i64,

    /// Last LED of the slice, inclusive; -1 means the last LED of the strip.
    #[serde(default = "default_end_led")]
    end_led: i64,
}

fn default_end_led() -> i64 {
    -1
}

impl Destination {
    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn copy_mode(&self) -> bool {
        self.copy_mode
    }

    pub fn start_led(&self) -> i64 {
        self.start_led
    }

    pub fn end_led(&self) -> i64 {
        self.end_led
    }
}
