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
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::{debug, info};

use crate::color::{apply_master, black_frame, Frame, Rgb};
use crate::dissolve::{Dissolve, DissolvePattern};
use crate::scene::Scene;

/// Event and error counters shared across the worker threads. These are the
/// engine's only user-visible failure signal; per-event failures never stop
/// playback.
#[derive(Default)]
pub struct Counters {
    /// Frames produced by the render pipeline.
    pub frames_rendered: AtomicU64,
    /// Control messages that could not be decoded.
    pub malformed_events: AtomicU64,
    /// Control events dropped because the ingress queue was full.
    pub dropped_events: AtomicU64,
    /// Operations referring to scenes/effects/palettes/patterns that don't exist.
    pub missing_resources: AtomicU64,
    /// Datagram send failures, counted per destination.
    pub send_errors: AtomicU64,
    /// Scene or dissolve documents that were rejected.
    pub load_failures: AtomicU64,
    /// Number of lit LEDs in the most recent frame.
    pub active_leds: AtomicU64,
}

impl Counters {
    pub fn new() -> Arc<Counters> {
        Arc::new(Counters::default())
    }

    /// One-line snapshot for the periodic playback log.
    pub fn summary(&self) -> String {
        format!(
            "frames={} active_leds={} malformed={} dropped={} missing={} send_errors={} load_failures={}",
            self.frames_rendered.load(Ordering::Relaxed),
            self.active_leds.load(Ordering::Relaxed),
            self.malformed_events.load(Ordering::Relaxed),
            self.dropped_events.load(Ordering::Relaxed),
            self.missing_resources.load(Ordering::Relaxed),
            self.send_errors.load(Ordering::Relaxed),
            self.load_failures.load(Ordering::Relaxed),
        )
    }
}

/// The identifiers selecting what is rendered: a scene, one of its effects,
/// and one of its palettes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternIds {
    pub scene: u32,
    pub effect: u32,
    pub palette: usize,
}

/// All mutable engine state, guarded by the one mutex in `SceneManager`.
struct EngineState {
    scenes: Vec<Scene>,
    /// What is currently rendering. None until the first scene load.
    active: Option<PatternIds>,
    /// What the next commit will switch to.
    staged: Option<PatternIds>,
    dissolve_patterns: BTreeMap<u32, DissolvePattern>,
    active_dissolve_pattern_id: u32,
    dissolve: Option<Dissolve>,
    speed_percent: u16,
    master_brightness: u8,
    paused: bool,
    /// The most recent composed frame before master brightness; this is the
    /// snapshot a commit fades out from.
    last_frame: Frame,
    default_led_count: usize,
    default_fps: u32,
}

impl EngineState {
    fn scene(&self, scene_id: u32) -> Option<&Scene> {
        self.scenes.iter().find(|s| s.scene_id() == scene_id)
    }

    fn scene_mut(&mut self, scene_id: u32) -> Option<&mut Scene> {
        self.scenes.iter_mut().find(|s| s.scene_id() == scene_id)
    }

    fn active_scene(&self) -> Option<&Scene> {
        self.active.and_then(|ids| self.scene(ids.scene))
    }

    fn led_count(&self) -> usize {
        self.active_scene()
            .map(Scene::led_count)
            .unwrap_or(self.default_led_count)
    }
}

/// Owns the scene graph and every piece of playback state. All public
/// operations serialize on the internal mutex; `render` holds it for the
/// duration of one frame.
pub struct SceneManager {
    state: Mutex<EngineState>,
    counters: Arc<Counters>,
}

impl SceneManager {
    pub fn new(
        default_led_count: usize,
        default_fps: u32,
        master_brightness: u8,
        speed_percent: u16,
        counters: Arc<Counters>,
    ) -> SceneManager {
        SceneManager {
            state: Mutex::new(EngineState {
                scenes: Vec::new(),
                active: None,
                staged: None,
                dissolve_patterns: BTreeMap::new(),
                active_dissolve_pattern_id: 0,
                dissolve: None,
                speed_percent: speed_percent.min(1023),
                master_brightness,
                paused: false,
                last_frame: black_frame(default_led_count.max(1)),
                default_led_count: default_led_count.max(1),
                default_fps: default_fps.max(1),
            }),
            counters,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the whole scene map. Playback restarts from the first scene
    /// of the bundle with its first effect and palette, with no dissolve.
    pub fn load_scenes(&self, scenes: Vec<Scene>, now: Instant) {
        let mut state = self.lock();

        let first_scene = match scenes.first() {
            Some(scene) => scene.scene_id(),
            None => return,
        };

        state.scenes = scenes;
        for scene in state.scenes.iter_mut() {
            scene.reset_timings(now);
        }

        let ids = PatternIds {
            scene: first_scene,
            effect: 0,
            palette: 0,
        };
        state.active = Some(ids);
        state.staged = Some(ids);
        if let Some(scene) = state.scene_mut(first_scene) {
            scene.set_current(ids.effect, ids.palette);
        }

        state.dissolve = None;
        let led_count = state.led_count();
        state.last_frame = black_frame(led_count);

        info!(
            scenes = state.scenes.len(),
            active_scene = first_scene,
            led_count,
            "Loaded scene bundle."
        );
    }

    /// Stages a scene change for the next commit. Unknown ids are ignored.
    pub fn cache_change_scene(&self, scene_id: u32) {
        let mut state = self.lock();
        if state.scene(scene_id).is_none() {
            self.counters.missing_resources.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Some(staged) = state.staged.as_mut() {
            staged.scene = scene_id;
            debug!(scene = scene_id, "Staged scene change.");
        }
    }

    /// Stages an effect change for the next commit. The id must exist in the
    /// currently staged scene.
    pub fn cache_change_effect(&self, effect_id: u32) {
        let mut state = self.lock();
        let Some(staged) = state.staged else {
            return;
        };
        if state
            .scene(staged.scene)
            .is_some_and(|scene| scene.has_effect(effect_id))
        {
            if let Some(staged) = state.staged.as_mut() {
                staged.effect = effect_id;
                debug!(effect = effect_id, "Staged effect change.");
            }
        } else {
            self.counters.missing_resources.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stages a palette change for the next commit. The id must be in range
    /// on the currently staged scene.
    pub fn cache_change_palette(&self, palette_id: usize) {
        let mut state = self.lock();
        let Some(staged) = state.staged else {
            return;
        };
        if state
            .scene(staged.scene)
            .is_some_and(|scene| palette_id < scene.palette_count())
        {
            if let Some(staged) = state.staged.as_mut() {
                staged.palette = palette_id;
                debug!(palette = palette_id, "Staged palette change.");
            }
        } else {
            self.counters.missing_resources.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Commits the staged ids. If anything differs from the active ids the
    /// current frame is snapshotted and a dissolve towards the new pattern
    /// begins; otherwise this is a no-op. A commit landing mid-dissolve
    /// restarts the fade from the in-progress composed frame.
    pub fn commit_pattern(&self, now: Instant) {
        let mut state = self.lock();
        let (Some(active), Some(staged)) = (state.active, state.staged) else {
            return;
        };
        if active == staged {
            return;
        }

        state.active = Some(staged);
        if let Some(scene) = state.scene_mut(staged.scene) {
            scene.set_current(staged.effect, staged.palette);
            scene.reset_timings(now);
        }

        let led_count = state.led_count();
        let from_frame = state.last_frame.clone();
        // Keep the snapshot around (resized to the new strip) so a second
        // commit landing before the next render still fades from it.
        state.last_frame.resize(led_count, Rgb::BLACK);

        let pattern = state
            .dissolve_patterns
            .get(&state.active_dissolve_pattern_id)
            .cloned()
            .unwrap_or_default();
        state.dissolve = if pattern.is_empty() {
            None
        } else {
            Some(Dissolve::new(from_frame, now, pattern, led_count))
        };

        info!(
            scene = staged.scene,
            effect = staged.effect,
            palette = staged.palette,
            dissolve = state.dissolve.is_some(),
            "Committed staged pattern."
        );
    }

    /// Mutates one palette color of the active scene in place. Takes effect
    /// on the next rendered frame, with no dissolve.
    pub fn set_palette_color(&self, palette_id: usize, color_id: usize, color: Rgb) {
        let mut state = self.lock();
        let Some(ids) = state.active else {
            return;
        };
        let updated = state
            .scene_mut(ids.scene)
            .is_some_and(|scene| scene.set_palette_color(palette_id, color_id, color));
        if !updated {
            self.counters.missing_resources.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Selects which dissolve pattern future commits use.
    pub fn set_dissolve_pattern(&self, pattern_id: u32) {
        let mut state = self.lock();
        if state.dissolve_patterns.contains_key(&pattern_id) {
            state.active_dissolve_pattern_id = pattern_id;
            info!(pattern = pattern_id, "Selected dissolve pattern.");
        } else {
            self.counters.missing_resources.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Replaces the dissolve pattern map.
    pub fn load_dissolve_patterns(&self, patterns: BTreeMap<u32, DissolvePattern>) {
        let mut state = self.lock();
        info!(patterns = patterns.len(), "Loaded dissolve patterns.");
        state.dissolve_patterns = patterns;
    }

    pub fn pause(&self) {
        self.lock().paused = true;
        info!("Playback paused.");
    }

    pub fn resume(&self) {
        self.lock().paused = false;
        info!("Playback resumed.");
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Sets the playback speed, clamped to [0, 1023] percent.
    pub fn set_speed_percent(&self, percent: i64) {
        self.lock().speed_percent = percent.clamp(0, 1023) as u16;
    }

    pub fn speed_percent(&self) -> u16 {
        self.lock().speed_percent
    }

    /// Sets the master brightness, clamped to [0, 255].
    pub fn set_master_brightness(&self, brightness: i64) {
        self.lock().master_brightness = brightness.clamp(0, 255) as u8;
    }

    pub fn has_scenes(&self) -> bool {
        !self.lock().scenes.is_empty()
    }

    /// The frame rate playback should run at: the active scene's, or the
    /// configured default before any load.
    pub fn fps(&self) -> u32 {
        let state = self.lock();
        state.active_scene().map(Scene::fps).unwrap_or(state.default_fps)
    }

    pub fn led_count(&self) -> usize {
        self.lock().led_count()
    }

    /// Advances segment positions by the virtual time delta. Does nothing
    /// while paused so motion freezes in place.
    pub fn update_animation(&self, delta_time: f64, now: Instant) {
        let mut state = self.lock();
        if state.paused {
            return;
        }
        let Some(ids) = state.active else {
            return;
        };
        if let Some(scene) = state.scene_mut(ids.scene) {
            scene.update_animation(delta_time, now);
        }
    }

    /// Produces the next frame: the active pattern rendered additively, an
    /// in-flight dissolve blended on top, then master brightness. Paused
    /// playback emits black frames.
    pub fn render(&self, now: Instant) -> Frame {
        let mut state = self.lock();
        self.counters.frames_rendered.fetch_add(1, Ordering::Relaxed);

        if state.paused {
            let frame = black_frame(state.led_count());
            self.counters.active_leds.store(0, Ordering::Relaxed);
            return frame;
        }

        let mut frame = black_frame(state.led_count());
        if let Some(scene) = state.active_scene() {
            scene.render(now, &mut frame);
        }

        if state.dissolve.as_ref().is_some_and(|d| d.is_complete(now)) {
            state.dissolve = None;
            debug!("Dissolve complete.");
        } else if let Some(dissolve) = &state.dissolve {
            frame = dissolve.blend(now, &frame);
        }

        state.last_frame = frame.clone();

        apply_master(&mut frame, state.master_brightness);
        let active = frame.iter().filter(|led| **led != Rgb::BLACK).count();
        self.counters.active_leds.store(active as u64, Ordering::Relaxed);

        frame
    }

    /// The ids currently rendering, if a bundle has been loaded.
    pub fn active_ids(&self) -> Option<PatternIds> {
        self.lock().active
    }

    /// The ids the next commit will adopt.
    pub fn staged_ids(&self) -> Option<PatternIds> {
        self.lock().staged
    }

    pub fn dissolve_in_progress(&self) -> bool {
        self.lock().dissolve.is_some()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::scene::loader::parse_scene_bundle;

    use super::*;

    /// Two scenes: scene 0 fills four LEDs red, scene 1 fills them blue.
    const TWO_SCENES: &str = r#"{
        "scenes": [
            {
                "scene_id": 0, "led_count": 4, "fps": 60,
                "palettes": [[[200, 0, 0], [0,0,0], [0,0,0], [0,0,0], [0,0,0], [0,0,0]]],
                "effects": [{"effect_id": 0, "segments": [
                    {"segment_id": 0, "color": [0], "transparency": [0.0], "length": [4],
                     "move_range": [0, 3], "dimmer_time": [[1000, 100, 100]]}
                ]}]
            },
            {
                "scene_id": 1, "led_count": 4, "fps": 60,
                "palettes": [[[0, 0, 200], [0,0,0], [0,0,0], [0,0,0], [0,0,0], [0,0,0]]],
                "effects": [{"effect_id": 0, "segments": [
                    {"segment_id": 0, "color": [0], "transparency": [0.0], "length": [4],
                     "move_range": [0, 3], "dimmer_time": [[1000, 100, 100]]}
                ]}]
            }
        ]
    }"#;

    fn manager_with_scenes(now: Instant) -> SceneManager {
        let manager = SceneManager::new(4, 60, 255, 100, Counters::new());
        let scenes = parse_scene_bundle(TWO_SCENES, now).expect("bundle parses");
        manager.load_scenes(scenes, now);
        manager
    }

    fn single_band_patterns() -> BTreeMap<u32, DissolvePattern> {
        crate::dissolve::parse_dissolve_bundle(r#"{"dissolve_patterns": {"0": [[0, 100, 0, 3]]}}"#)
            .expect("bundle parses")
    }

    #[test]
    fn test_load_starts_on_first_scene() {
        let now = Instant::now();
        let manager = manager_with_scenes(now);

        let active = manager.active_ids().expect("active after load");
        assert_eq!(active, PatternIds { scene: 0, effect: 0, palette: 0 });
        assert_eq!(manager.staged_ids(), Some(active));
        assert_eq!(manager.led_count(), 4);
        assert!(!manager.dissolve_in_progress());

        let frame = manager.render(now);
        assert_eq!(frame, vec![Rgb::new(200, 0, 0); 4]);
    }

    #[test]
    fn test_frame_shape_and_range() {
        let now = Instant::now();
        let manager = manager_with_scenes(now);
        for tick in 0..20 {
            let frame = manager.render(now + Duration::from_millis(tick * 16));
            assert_eq!(frame.len(), 4);
        }
    }

    #[test]
    fn test_staged_changes_do_not_render() {
        let now = Instant::now();
        let manager = manager_with_scenes(now);

        manager.cache_change_scene(1);
        manager.cache_change_effect(0);
        manager.cache_change_palette(0);

        for tick in 0..10 {
            let frame = manager.render(now + Duration::from_millis(tick * 16));
            assert_eq!(frame, vec![Rgb::new(200, 0, 0); 4], "stage leaked at tick {}", tick);
        }
        assert_eq!(
            manager.staged_ids(),
            Some(PatternIds { scene: 1, effect: 0, palette: 0 })
        );
    }

    #[test]
    fn test_commit_blends_through_dissolve() {
        let now = Instant::now();
        let manager = manager_with_scenes(now);
        manager.load_dissolve_patterns(single_band_patterns());

        // Establish the pre-commit frame.
        manager.render(now);

        manager.cache_change_scene(1);
        let commit = now + Duration::from_millis(100);
        manager.commit_pattern(commit);
        assert!(manager.dissolve_in_progress());

        let frame = manager.render(commit + Duration::from_millis(50));
        assert_eq!(frame, vec![Rgb::new(100, 0, 100); 4]);

        // Past the band the dissolve terminates and the new scene renders raw.
        let frame = manager.render(commit + Duration::from_millis(150));
        assert_eq!(frame, vec![Rgb::new(0, 0, 200); 4]);
        assert!(!manager.dissolve_in_progress());
    }

    #[test]
    fn test_commit_without_difference_is_noop() {
        let now = Instant::now();
        let manager = manager_with_scenes(now);
        manager.load_dissolve_patterns(single_band_patterns());
        manager.render(now);

        manager.cache_change_scene(0);
        manager.cache_change_effect(0);
        manager.cache_change_palette(0);
        manager.commit_pattern(now + Duration::from_millis(10));
        assert!(!manager.dissolve_in_progress());
    }

    #[test]
    fn test_commit_without_patterns_switches_instantly() {
        let now = Instant::now();
        let manager = manager_with_scenes(now);
        manager.render(now);

        manager.cache_change_scene(1);
        manager.commit_pattern(now + Duration::from_millis(10));
        assert!(!manager.dissolve_in_progress());

        let frame = manager.render(now + Duration::from_millis(20));
        assert_eq!(frame, vec![Rgb::new(0, 0, 200); 4]);
    }

    #[test]
    fn test_commit_mid_dissolve_restarts_from_composed_frame() {
        let now = Instant::now();
        let manager = manager_with_scenes(now);
        manager.load_dissolve_patterns(single_band_patterns());
        manager.render(now);

        manager.cache_change_scene(1);
        let first_commit = now + Duration::from_millis(100);
        manager.commit_pattern(first_commit);

        // Halfway through, swing back towards scene 0.
        let halfway = first_commit + Duration::from_millis(50);
        let composed = manager.render(halfway);
        assert_eq!(composed, vec![Rgb::new(100, 0, 100); 4]);

        manager.cache_change_scene(0);
        manager.commit_pattern(halfway);
        assert!(manager.dissolve_in_progress());

        // The new fade starts from the composed frame, not from scene 1.
        let frame = manager.render(halfway + Duration::from_millis(50));
        assert_eq!(frame, vec![Rgb::new(150, 0, 50); 4]);
    }

    #[test]
    fn test_load_cancels_dissolve() {
        let now = Instant::now();
        let manager = manager_with_scenes(now);
        manager.load_dissolve_patterns(single_band_patterns());
        manager.render(now);
        manager.cache_change_scene(1);
        manager.commit_pattern(now);
        assert!(manager.dissolve_in_progress());

        let scenes = parse_scene_bundle(TWO_SCENES, now).expect("bundle parses");
        manager.load_scenes(scenes, now + Duration::from_millis(10));
        assert!(!manager.dissolve_in_progress());
        assert_eq!(
            manager.active_ids(),
            Some(PatternIds { scene: 0, effect: 0, palette: 0 })
        );
    }

    #[test]
    fn test_staging_unknown_ids_is_ignored() {
        let now = Instant::now();
        let counters = Counters::new();
        let manager = SceneManager::new(4, 60, 255, 100, counters.clone());
        let scenes = parse_scene_bundle(TWO_SCENES, now).expect("bundle parses");
        manager.load_scenes(scenes, now);

        manager.cache_change_scene(7);
        manager.cache_change_effect(3);
        manager.cache_change_palette(9);
        assert_eq!(
            manager.staged_ids(),
            Some(PatternIds { scene: 0, effect: 0, palette: 0 })
        );
        assert_eq!(counters.missing_resources.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_palette_mutation_applies_next_frame() {
        let now = Instant::now();
        let manager = manager_with_scenes(now);
        manager.render(now);

        manager.set_palette_color(0, 0, Rgb::new(0, 50, 0));
        assert!(!manager.dissolve_in_progress());
        let frame = manager.render(now + Duration::from_millis(16));
        assert_eq!(frame, vec![Rgb::new(0, 50, 0); 4]);
    }

    #[test]
    fn test_master_brightness_scales_output() {
        let now = Instant::now();
        let manager = manager_with_scenes(now);

        manager.set_master_brightness(128);
        let frame = manager.render(now);
        assert_eq!(frame, vec![Rgb::new(100, 0, 0); 4]);

        manager.set_master_brightness(0);
        let frame = manager.render(now);
        assert_eq!(frame, vec![Rgb::BLACK; 4]);
    }

    #[test]
    fn test_pause_emits_black_and_freezes() {
        let now = Instant::now();
        let manager = manager_with_scenes(now);
        manager.pause();
        assert!(manager.is_paused());

        for tick in 0..5 {
            let frame = manager.render(now + Duration::from_millis(tick * 16));
            assert_eq!(frame, vec![Rgb::BLACK; 4]);
        }

        // Position updates are ignored while paused.
        manager.update_animation(1.0, now);
        manager.resume();
        let frame = manager.render(now + Duration::from_millis(100));
        assert_eq!(frame, vec![Rgb::new(200, 0, 0); 4]);
    }

    #[test]
    fn test_speed_and_brightness_clamping() {
        let manager = SceneManager::new(4, 60, 255, 100, Counters::new());
        manager.set_speed_percent(5000);
        assert_eq!(manager.speed_percent(), 1023);
        manager.set_speed_percent(-5);
        assert_eq!(manager.speed_percent(), 0);
        // Out-of-range brightness clamps rather than erroring.
        manager.set_master_brightness(4096);
        manager.set_master_brightness(-1);
    }

    #[test]
    fn test_set_dissolve_pattern_requires_loaded_id() {
        let counters = Counters::new();
        let manager = SceneManager::new(4, 60, 255, 100, counters.clone());
        manager.load_dissolve_patterns(single_band_patterns());
        manager.set_dissolve_pattern(5);
        assert_eq!(counters.missing_resources.load(Ordering::Relaxed), 1);
        manager.set_dissolve_pattern(0);
        assert_eq!(counters.missing_resources.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_fps_follows_active_scene() {
        let now = Instant::now();
        let manager = SceneManager::new(4, 24, 255, 100, Counters::new());
        assert_eq!(manager.fps(), 24);
        let scenes = parse_scene_bundle(TWO_SCENES, now).expect("bundle parses");
        manager.load_scenes(scenes, now);
        assert_eq!(manager.fps(), 60);
    }
}
