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

use super::Palette;

/// Segments slower than this are treated as stationary.
const MIN_MOVE_SPEED: f64 = 0.001;

/// The minimum fade factor applied to a segment's edge LEDs, so a moving
/// segment never visually loses its first or last pixel entirely.
const MIN_EDGE_FADE: f64 = 0.1;

/// One linear brightness ramp of a segment's dimmer cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct DimmerPhase {
    /// How long the ramp takes. Always at least one millisecond.
    pub duration_ms: u64,
    /// Brightness at the start of the ramp, in percent.
    pub start_pct: f64,
    /// Brightness at the end of the ramp, in percent.
    pub end_pct: f64,
}

impl DimmerPhase {
    pub fn new(duration_ms: u64, start_pct: f64, end_pct: f64) -> DimmerPhase {
        DimmerPhase {
            duration_ms: duration_ms.max(1),
            start_pct: start_pct.clamp(0.0, 100.0),
            end_pct: end_pct.clamp(0.0, 100.0),
        }
    }
}

/// The atomic renderable unit: a run of colored LED parts that moves inside a
/// range of the strip and pulses through a periodic dimmer cycle.
#[derive(Debug, Clone)]
pub struct Segment {
    segment_id: u32,
    /// Palette color index per part. Out-of-palette indices render black.
    color: Vec<i64>,
    /// Transparency per part; 0.0 is opaque, 1.0 is invisible.
    transparency: Vec<f64>,
    /// LEDs per part. Parts with zero length emit nothing.
    length: Vec<usize>,
    /// LEDs per second; the sign is the direction of travel.
    move_speed: f64,
    /// Inclusive LED index range the segment moves within.
    move_range: (i64, i64),
    /// LED index of the leftmost LED of part 0.
    current_position: i64,
    /// Sub-LED remainder of the position. Integer steps are taken out of this
    /// accumulator, and its live value drives the edge fade.
    position_carry: f64,
    /// True reflects at the range boundary, false wraps around it.
    is_edge_reflect: bool,
    dimmer_time: Vec<DimmerPhase>,
    segment_start_time: Instant,
}

impl Segment {
    /// Creates a segment, normalizing the raw attribute lists: the color list
    /// is never empty, transparency is padded (opaque) and clamped, short
    /// color lists are extended by repeating their last entry so every part
    /// has a color, and the move range is swapped into low/high order.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        segment_id: u32,
        color: Vec<i64>,
        transparency: Vec<f64>,
        length: Vec<i64>,
        move_speed: f64,
        move_range: (i64, i64),
        initial_position: i64,
        is_edge_reflect: bool,
        dimmer_time: Vec<DimmerPhase>,
        now: Instant,
    ) -> Segment {
        let mut color = color;
        if color.is_empty() {
            color.push(0);
        }

        let length: Vec<usize> = length
            .into_iter()
            .map(|l| usize::try_from(l).unwrap_or(0))
            .collect();

        while color.len() < length.len() {
            color.push(*color.last().expect("color list is never empty"));
        }

        let mut transparency: Vec<f64> =
            transparency.into_iter().map(|t| t.clamp(0.0, 1.0)).collect();
        while transparency.len() < color.len() {
            let pad = transparency.last().copied().unwrap_or(0.0);
            transparency.push(pad);
        }

        let (lo, hi) = move_range;
        let move_range = if lo <= hi { (lo, hi) } else { (hi, lo) };

        let dimmer_time = if dimmer_time.is_empty() {
            vec![DimmerPhase::new(1000, 0.0, 100.0)]
        } else {
            dimmer_time
        };

        Segment {
            segment_id,
            color,
            transparency,
            length,
            move_speed,
            move_range,
            current_position: initial_position,
            position_carry: 0.0,
            is_edge_reflect,
            dimmer_time,
            segment_start_time: now,
        }
    }

    pub fn segment_id(&self) -> u32 {
        self.segment_id
    }

    pub fn current_position(&self) -> i64 {
        self.current_position
    }

    pub fn move_speed(&self) -> f64 {
        self.move_speed
    }

    pub fn segment_start_time(&self) -> Instant {
        self.segment_start_time
    }

    /// The number of LEDs this segment emits when rendered.
    pub fn total_led_count(&self) -> usize {
        let parts: usize = self.length.iter().sum();
        parts + self.color.len().saturating_sub(self.length.len())
    }

    /// Restarts the dimmer cycle from the given instant.
    pub fn reset_timing(&mut self, now: Instant) {
        self.segment_start_time = now;
    }

    /// Computes the dimmer brightness at the given instant as a factor in
    /// [0, 1]. The cycle is the sum of all phase durations; the instant is
    /// folded into it and the matching linear ramp evaluated. Landing exactly
    /// on a cycle boundary reads as the end of the last ramp, not the start
    /// of the first.
    pub fn brightness_at(&self, now: Instant) -> f64 {
        if self.dimmer_time.is_empty() {
            return 1.0;
        }

        let elapsed_ms = now
            .saturating_duration_since(self.segment_start_time)
            .as_secs_f64()
            * 1000.0;
        let cycle_ms: f64 = self
            .dimmer_time
            .iter()
            .map(|phase| phase.duration_ms as f64)
            .sum();
        if cycle_ms <= 0.0 {
            return 1.0;
        }

        let mut phase_ms = elapsed_ms % cycle_ms;
        if phase_ms == 0.0 && elapsed_ms > 0.0 {
            phase_ms = cycle_ms;
        }

        let mut current_ms = 0.0;
        for phase in &self.dimmer_time {
            let duration = phase.duration_ms as f64;
            if phase_ms <= current_ms + duration {
                let progress = ((phase_ms - current_ms) / duration).clamp(0.0, 1.0);
                let brightness = phase.start_pct + (phase.end_pct - phase.start_pct) * progress;
                return (brightness / 100.0).clamp(0.0, 1.0);
            }
            current_ms += duration;
        }

        // Floating point drift can push phase_ms past the final ramp; hold
        // the last target brightness.
        let last = self.dimmer_time.last().expect("dimmer cycle is non-empty");
        (last.end_pct / 100.0).clamp(0.0, 1.0)
    }

    /// Advances the position by the virtual time delta, taking whole-LED
    /// steps out of the fractional accumulator and handling the range
    /// boundary in the segment's configured mode.
    pub fn update_position(&mut self, delta_time: f64, now: Instant) {
        if self.move_speed.abs() < MIN_MOVE_SPEED {
            return;
        }

        self.position_carry += self.move_speed * delta_time;
        if self.position_carry.abs() >= 1.0 {
            let step = self.position_carry.trunc();
            self.current_position += step as i64;
            self.position_carry -= step;
        }

        let (lo, hi) = self.move_range;
        if self.is_edge_reflect {
            // Only flip when arriving at a boundary, so a segment starting on
            // one and moving away keeps going.
            if self.current_position <= lo && self.move_speed < 0.0 {
                self.current_position = lo;
                self.move_speed = self.move_speed.abs();
                self.position_carry = 0.0;
                self.reset_timing(now);
            } else if self.current_position >= hi && self.move_speed > 0.0 {
                self.current_position = hi;
                self.move_speed = -self.move_speed.abs();
                self.position_carry = 0.0;
                self.reset_timing(now);
            }
        } else if self.current_position < lo || self.current_position > hi {
            if hi == lo {
                self.current_position = lo;
            } else {
                let span = hi - lo + 1;
                self.current_position = lo + (self.current_position - lo).rem_euclid(span);
            }
        }
    }

    /// Expands the part lists into one color per emitted LED, with
    /// transparency and the current dimmer brightness applied. Colors past
    /// the end of the length list contribute one tail LED each.
    fn expand_colors(&self, palette: &Palette, brightness: f64) -> Vec<Rgb> {
        let mut colors = Vec::with_capacity(self.total_led_count());

        for (part, &part_length) in self.length.iter().enumerate() {
            if part_length == 0 {
                continue;
            }
            let base = palette.color(self.color[part]);
            let alpha = self.transparency.get(part).copied().unwrap_or(0.0);
            let resolved = base.scaled((1.0 - alpha) * brightness);
            colors.extend(std::iter::repeat(resolved).take(part_length));
        }

        for extra in self.length.len()..self.color.len() {
            let base = palette.color(self.color[extra]);
            let alpha = self.transparency.get(extra).copied().unwrap_or(0.0);
            colors.push(base.scaled((1.0 - alpha) * brightness));
        }

        colors
    }

    /// Renders this segment additively into the frame at its current
    /// position. The fractional accumulator fades the leading and trailing
    /// LEDs for sub-pixel motion.
    pub fn render(&self, palette: &Palette, now: Instant, frame: &mut [Rgb]) {
        let brightness = self.brightness_at(now);
        if brightness <= 0.0 {
            return;
        }

        let mut colors = self.expand_colors(palette, brightness);
        if colors.is_empty() {
            return;
        }

        let count = colors.len() as i64;
        let mut base = self.current_position;
        if base < 0 {
            if base <= -count {
                return;
            }
            // Partially off the left edge: drop the hidden LEDs, no fade.
            colors.drain(..base.unsigned_abs() as usize);
            base = 0;
        } else if colors.len() > 1 && self.position_carry > 0.0 {
            let last = colors.len() - 1;
            colors[0] = colors[0].scaled(MIN_EDGE_FADE.max(self.position_carry));
            colors[last] = colors[last].scaled(MIN_EDGE_FADE.max(1.0 - self.position_carry));
        }

        for (i, color) in colors.into_iter().enumerate() {
            let led_index = base + i as i64;
            if led_index >= 0 && (led_index as usize) < frame.len() {
                let led = led_index as usize;
                frame[led] = frame[led].saturating_add(color);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_position_carry(&mut self, carry: f64) {
        self.position_carry = carry;
    }
}
