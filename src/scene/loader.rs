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

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Instant;

use serde::Deserialize;

use crate::color::Rgb;

use super::{DimmerPhase, Effect, Palette, Scene, Segment, PALETTE_SIZE};

/// Default strip size for scenes that don't specify one.
const DEFAULT_LED_COUNT: i64 = 225;

/// Default frame rate for scenes that don't specify one.
const DEFAULT_FPS: i64 = 60;

/// Typed error for scene/dissolve document failures so callers can
/// distinguish a missing file from a malformed one.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("error reading document: {0}")]
    Io(#[from] std::io::Error),
    #[error("error parsing document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid document: {0}")]
    Invalid(String),
}

/// A JSON representation of a scene bundle document.
#[derive(Deserialize)]
struct SceneBundleDoc {
    scenes: Vec<SceneDoc>,
}

/// A JSON representation of a single scene.
#[derive(Deserialize)]
struct SceneDoc {
    #[serde(alias = "scene_ID")]
    scene_id: u32,

    #[serde(default = "default_led_count")]
    led_count: i64,

    #[serde(default = "default_fps")]
    fps: i64,

    #[serde(default)]
    current_effect_id: u32,

    #[serde(default)]
    current_palette_id: usize,

    /// Each palette is a list of `[r, g, b]` triples; short palettes are
    /// padded with black up to the fixed palette size.
    #[serde(default)]
    palettes: Vec<Vec<Vec<i64>>>,

    #[serde(default)]
    effects: Vec<EffectDoc>,
}

#[derive(Deserialize)]
struct EffectDoc {
    #[serde(alias = "effect_ID")]
    effect_id: u32,

    #[serde(default)]
    segments: Vec<SegmentDoc>,
}

#[derive(Deserialize)]
struct SegmentDoc {
    #[serde(alias = "segment_ID")]
    segment_id: u32,

    #[serde(default)]
    color: Vec<i64>,

    #[serde(default)]
    transparency: Vec<f64>,

    #[serde(default)]
    length: Vec<i64>,

    #[serde(default)]
    move_speed: f64,

    /// `[lo, hi]`; defaults to the whole strip when absent.
    #[serde(default)]
    move_range: Vec<i64>,

    #[serde(default)]
    initial_position: i64,

    #[serde(default = "default_true")]
    is_edge_reflect: bool,

    #[serde(default)]
    dimmer_time: Option<DimmerTimeDoc>,
}

/// Dimmer cycles appear in two document formats: the current one is a list
/// of `[duration_ms, start_pct, end_pct]` ramps, the legacy one a flat list
/// of brightness stops played at one second per ramp.
#[derive(Deserialize)]
#[serde(untagged)]
enum DimmerTimeDoc {
    Phases(Vec<(f64, f64, f64)>),
    Legacy(Vec<f64>),
}

fn default_led_count() -> i64 {
    DEFAULT_LED_COUNT
}

fn default_fps() -> i64 {
    DEFAULT_FPS
}

fn default_true() -> bool {
    true
}

/// Loads and validates a scene bundle from a JSON file.
pub fn load_scenes_file(path: &Path, now: Instant) -> Result<Vec<Scene>, LoadError> {
    parse_scene_bundle(&fs::read_to_string(path)?, now)
}

/// Parses and validates a scene bundle document. The returned scenes satisfy
/// the engine's invariants; anything that can't be repaired by clamping or
/// padding rejects the whole document, leaving the caller's state untouched.
pub fn parse_scene_bundle(json: &str, now: Instant) -> Result<Vec<Scene>, LoadError> {
    let doc: SceneBundleDoc = serde_json::from_str(json)?;
    if doc.scenes.is_empty() {
        return Err(LoadError::Invalid("document contains no scenes".to_string()));
    }

    let mut seen_ids: HashSet<u32> = HashSet::new();
    let mut scenes = Vec::with_capacity(doc.scenes.len());
    for scene_doc in doc.scenes {
        if !seen_ids.insert(scene_doc.scene_id) {
            return Err(LoadError::Invalid(format!(
                "duplicate scene id {}",
                scene_doc.scene_id
            )));
        }
        scenes.push(scene_from_doc(scene_doc, now)?);
    }

    Ok(scenes)
}

fn scene_from_doc(doc: SceneDoc, now: Instant) -> Result<Scene, LoadError> {
    let led_count = usize::try_from(doc.led_count)
        .ok()
        .filter(|&count| count >= 1)
        .ok_or_else(|| {
            LoadError::Invalid(format!(
                "scene {} has invalid led_count {}",
                doc.scene_id, doc.led_count
            ))
        })?;
    let fps = u32::try_from(doc.fps).ok().filter(|&fps| fps >= 1).ok_or_else(|| {
        LoadError::Invalid(format!("scene {} has invalid fps {}", doc.scene_id, doc.fps))
    })?;

    let palettes: Vec<Palette> = doc.palettes.into_iter().map(palette_from_doc).collect();

    let mut seen_effects: HashSet<u32> = HashSet::new();
    let mut effects = Vec::with_capacity(doc.effects.len());
    for effect_doc in doc.effects {
        if !seen_effects.insert(effect_doc.effect_id) {
            return Err(LoadError::Invalid(format!(
                "scene {} has duplicate effect id {}",
                doc.scene_id, effect_doc.effect_id
            )));
        }

        let segments = effect_doc
            .segments
            .into_iter()
            .map(|segment| segment_from_doc(segment, led_count, now))
            .collect();
        effects.push(Effect::new(effect_doc.effect_id, segments));
    }

    Ok(Scene::new(
        doc.scene_id,
        led_count,
        fps,
        doc.current_effect_id,
        doc.current_palette_id,
        palettes,
        effects,
    ))
}

/// Converts a palette document into exactly six colors, clamping channels
/// and padding short palettes with black.
fn palette_from_doc(doc: Vec<Vec<i64>>) -> Palette {
    let mut colors = [Rgb::BLACK; PALETTE_SIZE];
    for (slot, triple) in colors.iter_mut().zip(doc.iter()) {
        let channel = |i: usize| triple.get(i).copied().unwrap_or(0).clamp(0, 255) as u8;
        *slot = Rgb::new(channel(0), channel(1), channel(2));
    }
    Palette::new(colors)
}

fn segment_from_doc(doc: SegmentDoc, led_count: usize, now: Instant) -> Segment {
    let move_range = if doc.move_range.len() >= 2 {
        (doc.move_range[0], doc.move_range[1])
    } else {
        (0, led_count as i64 - 1)
    };

    let dimmer_time = match doc.dimmer_time {
        Some(DimmerTimeDoc::Phases(phases)) => phases
            .into_iter()
            .map(|(duration, start, end)| {
                DimmerPhase::new(duration.max(1.0) as u64, start, end)
            })
            .collect(),
        Some(DimmerTimeDoc::Legacy(stops)) => convert_legacy_dimmer(&stops),
        None => vec![],
    };

    Segment::new(
        doc.segment_id,
        doc.color,
        doc.transparency,
        doc.length,
        doc.move_speed,
        move_range,
        doc.initial_position,
        doc.is_edge_reflect,
        dimmer_time,
        now,
    )
}

/// Converts the legacy flat brightness list: every adjacent pair becomes a
/// one second ramp between the two stops.
fn convert_legacy_dimmer(stops: &[f64]) -> Vec<DimmerPhase> {
    if stops.len() < 2 {
        return vec![];
    }
    stops
        .windows(2)
        .map(|pair| DimmerPhase::new(1000, pair[0], pair[1]))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    const BUNDLE: &str = r#"{
        "scenes": [
            {
                "scene_id": 0,
                "led_count": 10,
                "fps": 30,
                "current_effect_id": 0,
                "current_palette_id": 0,
                "palettes": [
                    [[255, 0, 0], [0, 255, 0], [0, 0, 255], [0, 0, 0], [0, 0, 0], [0, 0, 0]]
                ],
                "effects": [
                    {
                        "effect_id": 0,
                        "segments": [
                            {
                                "segment_id": 0,
                                "color": [0],
                                "transparency": [0.0],
                                "length": [4],
                                "move_speed": 0.0,
                                "move_range": [0, 9],
                                "initial_position": 0,
                                "is_edge_reflect": true,
                                "dimmer_time": [[1000, 100, 100]]
                            }
                        ]
                    }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_parse_bundle() -> Result<(), LoadError> {
        let scenes = parse_scene_bundle(BUNDLE, Instant::now())?;
        assert_eq!(scenes.len(), 1);

        let scene = &scenes[0];
        assert_eq!(scene.scene_id(), 0);
        assert_eq!(scene.led_count(), 10);
        assert_eq!(scene.fps(), 30);
        assert_eq!(scene.palette_count(), 1);
        assert_eq!(scene.current_palette().color(0), Rgb::new(255, 0, 0));

        let effect = scene.current_effect().expect("effect 0 exists");
        assert_eq!(effect.segments().len(), 1);
        assert_eq!(effect.segments()[0].total_led_count(), 4);
        Ok(())
    }

    #[test]
    fn test_defaults_applied() -> Result<(), LoadError> {
        let scenes = parse_scene_bundle(
            r#"{"scenes": [{"scene_id": 3, "effects": [{"effect_id": 0, "segments": [{"segment_id": 0, "color": [1], "length": [2]}]}]}]}"#,
            Instant::now(),
        )?;
        let scene = &scenes[0];
        assert_eq!(scene.led_count(), 225);
        assert_eq!(scene.fps(), 60);
        assert_eq!(scene.current_effect_id(), 0);
        assert_eq!(scene.current_palette_id(), 0);
        // No palettes in the document: the selection renders black.
        assert_eq!(scene.current_palette(), Palette::all_black());
        Ok(())
    }

    #[test]
    fn test_legacy_dimmer_conversion() {
        let phases = convert_legacy_dimmer(&[0.0, 100.0, 50.0]);
        assert_eq!(
            phases,
            vec![
                DimmerPhase::new(1000, 0.0, 100.0),
                DimmerPhase::new(1000, 100.0, 50.0),
            ]
        );
        assert!(convert_legacy_dimmer(&[40.0]).is_empty());
    }

    #[test]
    fn test_legacy_dimmer_in_document() -> Result<(), LoadError> {
        let scenes = parse_scene_bundle(
            r#"{"scenes": [{"scene_id": 0, "led_count": 4,
                "palettes": [[[255, 255, 255]]],
                "effects": [{"effect_id": 0, "segments": [
                    {"segment_id": 0, "color": [0], "length": [1], "dimmer_time": [0, 100]}
                ]}]}]}"#,
            Instant::now(),
        )?;
        let scene = &scenes[0];
        let segment = &scene.current_effect().expect("effect").segments()[0];
        // Halfway through the converted one second ramp from 0 to 100.
        let now = segment.segment_start_time() + std::time::Duration::from_millis(500);
        assert!((segment.brightness_at(now) - 0.5).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_rejects_empty_bundle() {
        assert!(matches!(
            parse_scene_bundle(r#"{"scenes": []}"#, Instant::now()),
            Err(LoadError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_scene_ids() {
        let result = parse_scene_bundle(
            r#"{"scenes": [{"scene_id": 1}, {"scene_id": 1}]}"#,
            Instant::now(),
        );
        assert!(matches!(result, Err(LoadError::Invalid(_))));
    }

    #[test]
    fn test_rejects_bad_led_count() {
        let result =
            parse_scene_bundle(r#"{"scenes": [{"scene_id": 0, "led_count": 0}]}"#, Instant::now());
        assert!(matches!(result, Err(LoadError::Invalid(_))));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            parse_scene_bundle("{not json", Instant::now()),
            Err(LoadError::Parse(_))
        ));
    }

    #[test]
    fn test_palette_padding_and_clamping() {
        let palette = palette_from_doc(vec![vec![300, -5, 128], vec![1, 2]]);
        assert_eq!(palette.color(0), Rgb::new(255, 0, 128));
        assert_eq!(palette.color(1), Rgb::new(1, 2, 0));
        assert_eq!(palette.color(2), Rgb::BLACK);
        assert_eq!(palette.color(5), Rgb::BLACK);
    }

    #[test]
    fn test_missing_move_range_defaults_to_strip() -> Result<(), LoadError> {
        let scenes = parse_scene_bundle(
            r#"{"scenes": [{"scene_id": 0, "led_count": 50,
                "effects": [{"effect_id": 0, "segments": [
                    {"segment_id": 0, "color": [0], "length": [1], "move_speed": 100.0, "is_edge_reflect": false}
                ]}]}]}"#,
            Instant::now(),
        )?;
        let mut scene = scenes.into_iter().next().expect("one scene");
        // A long wrap-mode travel stays within the defaulted [0, 49] range.
        let now = Instant::now();
        scene.update_animation(3.7, now);
        let segment = &scene.current_effect().expect("effect").segments()[0];
        assert!((0..50).contains(&segment.current_position()));
        Ok(())
    }
}
