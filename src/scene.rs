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

use std::time::Instant;

use crate::color::Rgb;

pub mod loader;
pub mod segment;

pub use segment::{DimmerPhase, Segment};

/// Every palette holds exactly this many colors.
pub const PALETTE_SIZE: usize = 6;

/// A fixed bank of six colors that segments index into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: [Rgb; PALETTE_SIZE],
}

impl Palette {
    pub fn new(colors: [Rgb; PALETTE_SIZE]) -> Palette {
        Palette { colors }
    }

    pub fn all_black() -> Palette {
        Palette {
            colors: [Rgb::BLACK; PALETTE_SIZE],
        }
    }

    /// Looks up a color by segment-supplied index. Anything outside the
    /// palette renders black rather than failing.
    pub fn color(&self, color_id: i64) -> Rgb {
        usize::try_from(color_id)
            .ok()
            .and_then(|id| self.colors.get(id))
            .copied()
            .unwrap_or(Rgb::BLACK)
    }

    /// Replaces one palette slot. Returns false if the slot doesn't exist.
    pub fn set_color(&mut self, color_id: usize, color: Rgb) -> bool {
        match self.colors.get_mut(color_id) {
            Some(slot) => {
                *slot = color;
                true
            }
            None => false,
        }
    }
}

/// An effect is an ordered group of segments rendered together.
#[derive(Debug, Clone)]
pub struct Effect {
    effect_id: u32,
    segments: Vec<Segment>,
}

impl Effect {
    pub fn new(effect_id: u32, segments: Vec<Segment>) -> Effect {
        Effect {
            effect_id,
            segments,
        }
    }

    pub fn effect_id(&self) -> u32 {
        self.effect_id
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Advances every segment's position by the virtual time delta.
    pub fn update_animation(&mut self, delta_time: f64, now: Instant) {
        for segment in self.segments.iter_mut() {
            segment.update_position(delta_time, now);
        }
    }

    /// Restarts every segment's dimmer cycle.
    pub fn reset_timings(&mut self, now: Instant) {
        for segment in self.segments.iter_mut() {
            segment.reset_timing(now);
        }
    }
}

/// A scene owns its palettes and effects exclusively; dropping the scene
/// drops everything in it.
#[derive(Debug, Clone)]
pub struct Scene {
    scene_id: u32,
    led_count: usize,
    fps: u32,
    current_effect_id: u32,
    current_palette_id: usize,
    palettes: Vec<Palette>,
    effects: Vec<Effect>,
}

impl Scene {
    pub fn new(
        scene_id: u32,
        led_count: usize,
        fps: u32,
        current_effect_id: u32,
        current_palette_id: usize,
        palettes: Vec<Palette>,
        effects: Vec<Effect>,
    ) -> Scene {
        Scene {
            scene_id,
            led_count: led_count.max(1),
            fps: fps.max(1),
            current_effect_id,
            current_palette_id,
            palettes,
            effects,
        }
    }

    pub fn scene_id(&self) -> u32 {
        self.scene_id
    }

    pub fn led_count(&self) -> usize {
        self.led_count
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn current_effect_id(&self) -> u32 {
        self.current_effect_id
    }

    pub fn current_palette_id(&self) -> usize {
        self.current_palette_id
    }

    pub fn palette_count(&self) -> usize {
        self.palettes.len()
    }

    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    pub fn has_effect(&self, effect_id: u32) -> bool {
        self.effects.iter().any(|e| e.effect_id() == effect_id)
    }

    /// Selects which effect and palette the scene renders with.
    pub fn set_current(&mut self, effect_id: u32, palette_id: usize) {
        self.current_effect_id = effect_id;
        self.current_palette_id = palette_id;
    }

    /// The effect currently selected for rendering, if it exists.
    pub fn current_effect(&self) -> Option<&Effect> {
        self.effects
            .iter()
            .find(|e| e.effect_id() == self.current_effect_id)
    }

    fn current_effect_mut(&mut self) -> Option<&mut Effect> {
        let effect_id = self.current_effect_id;
        self.effects.iter_mut().find(|e| e.effect_id() == effect_id)
    }

    /// The palette currently selected for rendering; all black when the
    /// selection is out of range.
    pub fn current_palette(&self) -> Palette {
        self.palettes
            .get(self.current_palette_id)
            .cloned()
            .unwrap_or_else(Palette::all_black)
    }

    /// Mutates one color of one palette in place. Returns false when either
    /// index is out of range.
    pub fn set_palette_color(&mut self, palette_id: usize, color_id: usize, color: Rgb) -> bool {
        match self.palettes.get_mut(palette_id) {
            Some(palette) => palette.set_color(color_id, color),
            None => false,
        }
    }

    /// Advances the active effect's segments by the virtual time delta.
    pub fn update_animation(&mut self, delta_time: f64, now: Instant) {
        if let Some(effect) = self.current_effect_mut() {
            effect.update_animation(delta_time, now);
        }
    }

    /// Restarts the dimmer cycle of every segment in the scene.
    pub fn reset_timings(&mut self, now: Instant) {
        for effect in self.effects.iter_mut() {
            effect.reset_timings(now);
        }
    }

    /// Renders the active effect's segments additively into the frame with
    /// the active palette.
    pub fn render(&self, now: Instant, frame: &mut [Rgb]) {
        let palette = self.current_palette();
        if let Some(effect) = self.current_effect() {
            for segment in effect.segments() {
                segment.render(&palette, now, frame);
            }
        }
    }
}
