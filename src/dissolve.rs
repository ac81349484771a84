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

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Instant;

use serde::Deserialize;
use tracing::warn;

use crate::color::{Frame, Rgb};
use crate::scene::loader::LoadError;

/// One timed band of a dissolve pattern: the LEDs in `[start_led, end_led]`
/// cross-fade over `duration_ms` after an initial `delay_ms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Band {
    delay_ms: i64,
    duration_ms: i64,
    start_led: i64,
    end_led: i64,
}

impl Band {
    pub fn new(delay_ms: i64, duration_ms: i64, start_led: i64, end_led: i64) -> Band {
        let (start_led, end_led) = if start_led <= end_led {
            (start_led, end_led)
        } else {
            (end_led, start_led)
        };
        Band {
            delay_ms: delay_ms.max(0),
            duration_ms,
            start_led,
            end_led,
        }
    }

    /// Band progress at `elapsed_ms` since the dissolve started. A duration
    /// of zero or less makes the band instantaneous once its delay passes.
    fn progress(&self, elapsed_ms: f64) -> f64 {
        let t = elapsed_ms - self.delay_ms as f64;
        if t <= 0.0 {
            0.0
        } else if t >= self.duration_ms as f64 {
            1.0
        } else {
            t / self.duration_ms as f64
        }
    }

    /// The LED index range this band touches on a strip of the given size,
    /// clipped to valid indices. None if the band lies entirely outside.
    fn clipped_range(&self, led_count: usize) -> Option<(usize, usize)> {
        if led_count == 0 || self.end_led < 0 {
            return None;
        }
        let start = usize::try_from(self.start_led).unwrap_or(0);
        if start >= led_count {
            return None;
        }
        let end = usize::try_from(self.end_led).unwrap_or(0).min(led_count - 1);
        Some((start, end))
    }
}

/// An ordered list of bands governing one transition. Bands may overlap in
/// both LED range and time; overlapping LEDs take the furthest progress.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DissolvePattern {
    bands: Vec<Band>,
}

impl DissolvePattern {
    pub fn new(bands: Vec<Band>) -> DissolvePattern {
        DissolvePattern { bands }
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }
}

/// Loads a dissolve pattern bundle from a JSON file.
pub fn load_dissolve_file(path: &Path) -> Result<BTreeMap<u32, DissolvePattern>, LoadError> {
    parse_dissolve_bundle(&fs::read_to_string(path)?)
}

#[derive(Deserialize)]
struct DissolveBundleDoc {
    dissolve_patterns: BTreeMap<String, Vec<Vec<i64>>>,
}

/// Parses a dissolve pattern bundle. Pattern ids are decimal strings; rows
/// are `[delay_ms, duration_ms, start_led, end_led]`. Entries that don't fit
/// the shape are skipped with a warning rather than rejecting the document.
pub fn parse_dissolve_bundle(json: &str) -> Result<BTreeMap<u32, DissolvePattern>, LoadError> {
    let doc: DissolveBundleDoc = serde_json::from_str(json)?;

    let mut patterns = BTreeMap::new();
    for (key, rows) in doc.dissolve_patterns {
        let pattern_id: u32 = match key.parse() {
            Ok(id) => id,
            Err(_) => {
                warn!(key = key.as_str(), "Skipping dissolve pattern with non-integer id");
                continue;
            }
        };

        let mut bands = Vec::with_capacity(rows.len());
        for row in rows {
            match row.as_slice() {
                &[delay, duration, start, end] => bands.push(Band::new(delay, duration, start, end)),
                _ => warn!(pattern = pattern_id, "Skipping dissolve band with wrong arity"),
            }
        }
        patterns.insert(pattern_id, DissolvePattern::new(bands));
    }

    Ok(patterns)
}

/// An in-flight dissolve: an immutable copy of the frame being faded out,
/// the instant the fade began, and the pattern driving it. The target frame
/// is rendered live each tick and blended against the snapshot.
#[derive(Debug, Clone)]
pub struct Dissolve {
    from_frame: Frame,
    start: Instant,
    pattern: DissolvePattern,
    led_count: usize,
}

impl Dissolve {
    pub fn new(from_frame: Frame, start: Instant, pattern: DissolvePattern, led_count: usize) -> Dissolve {
        let mut from_frame = from_frame;
        from_frame.resize(led_count, Rgb::BLACK);
        Dissolve {
            from_frame,
            start,
            pattern,
            led_count,
        }
    }

    fn elapsed_ms(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.start).as_secs_f64() * 1000.0
    }

    /// True once every band that touches the strip has fully completed. A
    /// pattern with no effective bands is complete immediately.
    pub fn is_complete(&self, now: Instant) -> bool {
        let elapsed = self.elapsed_ms(now);
        self.pattern
            .bands
            .iter()
            .filter(|band| band.clipped_range(self.led_count).is_some())
            .all(|band| band.progress(elapsed) >= 1.0)
    }

    /// Blends the fading snapshot with the live target frame. LEDs outside
    /// every band hold the snapshot until the dissolve terminates.
    pub fn blend(&self, now: Instant, to_frame: &[Rgb]) -> Frame {
        let elapsed = self.elapsed_ms(now);

        let mut progress = vec![0.0f64; self.led_count];
        for band in &self.pattern.bands {
            let Some((start, end)) = band.clipped_range(self.led_count) else {
                continue;
            };
            let band_progress = band.progress(elapsed);
            for led in &mut progress[start..=end] {
                *led = led.max(band_progress);
            }
        }

        progress
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let from = self.from_frame[i];
                let to = to_frame.get(i).copied().unwrap_or(Rgb::BLACK);
                from.blend(to, p)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::color::black_frame;

    use super::*;

    fn red_frame(led_count: usize) -> Frame {
        vec![Rgb::new(200, 0, 0); led_count]
    }

    fn blue_frame(led_count: usize) -> Frame {
        vec![Rgb::new(0, 0, 200); led_count]
    }

    #[test]
    fn test_parse_dissolve_bundle() -> Result<(), LoadError> {
        let patterns = parse_dissolve_bundle(
            r#"{"dissolve_patterns": {"0": [[0, 100, 0, 4], [200, 100, 5, 9]], "3": []}}"#,
        )?;
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[&0].band_count(), 2);
        assert!(patterns[&3].is_empty());
        Ok(())
    }

    #[test]
    fn test_parse_skips_bad_entries() -> Result<(), LoadError> {
        let patterns = parse_dissolve_bundle(
            r#"{"dissolve_patterns": {"zero": [[0, 100, 0, 4]], "1": [[0, 100, 0], [0, 50, 0, 3]]}}"#,
        )?;
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[&1].band_count(), 1);
        Ok(())
    }

    #[test]
    fn test_single_band_midpoint() {
        let start = Instant::now();
        let pattern = DissolvePattern::new(vec![Band::new(0, 100, 0, 9)]);
        let dissolve = Dissolve::new(red_frame(10), start, pattern, 10);

        let halfway = dissolve.blend(start + Duration::from_millis(50), &blue_frame(10));
        assert_eq!(halfway, vec![Rgb::new(100, 0, 100); 10]);
        assert!(!dissolve.is_complete(start + Duration::from_millis(50)));
        assert!(dissolve.is_complete(start + Duration::from_millis(100)));
    }

    #[test]
    fn test_multi_band_union() {
        let start = Instant::now();
        let pattern =
            DissolvePattern::new(vec![Band::new(0, 100, 0, 4), Band::new(200, 100, 5, 9)]);
        let dissolve = Dissolve::new(red_frame(10), start, pattern, 10);
        let to = blue_frame(10);

        // At 50ms: the first band is halfway, the second hasn't started.
        let frame = dissolve.blend(start + Duration::from_millis(50), &to);
        for led in 0..5 {
            assert_eq!(frame[led], Rgb::new(100, 0, 100));
        }
        for led in 5..10 {
            assert_eq!(frame[led], Rgb::new(200, 0, 0));
        }

        // At 250ms: the first band is done, the second halfway.
        let frame = dissolve.blend(start + Duration::from_millis(250), &to);
        for led in 0..5 {
            assert_eq!(frame[led], Rgb::new(0, 0, 200));
        }
        for led in 5..10 {
            assert_eq!(frame[led], Rgb::new(100, 0, 100));
        }

        assert!(!dissolve.is_complete(start + Duration::from_millis(299)));
        assert!(dissolve.is_complete(start + Duration::from_millis(300)));
    }

    #[test]
    fn test_progress_is_monotonic() {
        let start = Instant::now();
        let pattern =
            DissolvePattern::new(vec![Band::new(40, 200, 0, 3), Band::new(0, 500, 2, 7)]);
        let dissolve = Dissolve::new(black_frame(8), start, pattern, 8);
        let to = vec![Rgb::new(255, 255, 255); 8];

        let mut previous = vec![0u8; 8];
        for ms in (0..=600).step_by(20) {
            let frame = dissolve.blend(start + Duration::from_millis(ms), &to);
            for (led, color) in frame.iter().enumerate() {
                assert!(
                    color.r >= previous[led],
                    "progress regressed on LED {} at {}ms",
                    led,
                    ms
                );
                previous[led] = color.r;
            }
        }
    }

    #[test]
    fn test_empty_pattern_completes_instantly() {
        let start = Instant::now();
        let dissolve = Dissolve::new(red_frame(4), start, DissolvePattern::default(), 4);
        assert!(dissolve.is_complete(start));
    }

    #[test]
    fn test_zero_duration_band_is_instant() {
        let start = Instant::now();
        let pattern = DissolvePattern::new(vec![Band::new(50, 0, 0, 3)]);
        let dissolve = Dissolve::new(red_frame(4), start, pattern, 4);
        let to = blue_frame(4);

        let before = dissolve.blend(start + Duration::from_millis(50), &to);
        assert_eq!(before, red_frame(4));
        let after = dissolve.blend(start + Duration::from_millis(51), &to);
        assert_eq!(after, blue_frame(4));
    }

    #[test]
    fn test_out_of_range_bands_are_clipped() {
        let start = Instant::now();
        let pattern =
            DissolvePattern::new(vec![Band::new(0, 100, -5, 1), Band::new(0, 100, 10, 20)]);
        let dissolve = Dissolve::new(red_frame(4), start, pattern, 4);
        let to = blue_frame(4);

        let frame = dissolve.blend(start + Duration::from_millis(100), &to);
        assert_eq!(frame[0], Rgb::new(0, 0, 200));
        assert_eq!(frame[1], Rgb::new(0, 0, 200));
        // Uncovered LEDs hold the snapshot.
        assert_eq!(frame[2], Rgb::new(200, 0, 0));
        assert_eq!(frame[3], Rgb::new(200, 0, 0));
        // The fully off-strip band doesn't hold completion open.
        assert!(dissolve.is_complete(start + Duration::from_millis(100)));
    }

    #[test]
    fn test_from_frame_resized_to_strip() {
        let start = Instant::now();
        let pattern = DissolvePattern::new(vec![Band::new(0, 100, 0, 5)]);
        let dissolve = Dissolve::new(red_frame(2), start, pattern, 6);
        let frame = dissolve.blend(start, &blue_frame(6));
        assert_eq!(frame[0], Rgb::new(200, 0, 0));
        assert_eq!(frame[5], Rgb::BLACK);
    }
}
