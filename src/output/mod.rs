//! Output management
//!
//! Tracks the backend's outputs, configures their mode and drives the
//! commit/frame-done cycle. The first output in the list is the primary one.

use crate::engine::{Engine, ObjectId, OutputId, OutputMode, OutputState, SceneOutputId, SignalKind};
use crate::listeners::ListenerSet;
use log::{debug, error, info, warn};
use std::fmt;
use std::time::Instant;

/// Output lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStatus {
    Uninitialized,
    Configured,
    Rendering,
    Destroyed,
}

impl fmt::Display for OutputStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStatus::Uninitialized => write!(f, "uninitialized"),
            OutputStatus::Configured => write!(f, "configured"),
            OutputStatus::Rendering => write!(f, "rendering"),
            OutputStatus::Destroyed => write!(f, "destroyed"),
        }
    }
}

#[derive(Debug)]
pub struct Output {
    pub id: OutputId,
    pub name: String,
    pub mode: OutputMode,
    pub scene_output: Option<SceneOutputId>,
    pub status: OutputStatus,
    /// Frames committed and acknowledged with frame-done
    pub frames: u64,
    listeners: ListenerSet,
}

impl Output {
    pub fn width(&self) -> u32 {
        self.mode.width
    }

    pub fn height(&self) -> u32 {
        self.mode.height
    }

    pub fn listeners_active(&self) -> bool {
        self.listeners.is_active()
    }
}

pub struct OutputManager {
    outputs: Vec<Output>,
    listeners: ListenerSet,
    default_mode: OutputMode,
    start_time: Instant,
}

impl OutputManager {
    pub fn new(default_mode: OutputMode) -> Self {
        Self {
            outputs: Vec::new(),
            listeners: ListenerSet::new(),
            default_mode,
            start_time: Instant::now(),
        }
    }

    /// Subscribe to new outputs of the backend
    pub fn init(&mut self, engine: &mut dyn Engine) {
        self.listeners.add(engine, ObjectId::Backend, SignalKind::NewOutput);
    }

    pub fn default_mode(&self) -> OutputMode {
        self.default_mode
    }

    /// Configure a new backend output and add it in front of the list
    pub fn handle_new_output(&mut self, engine: &mut dyn Engine, id: OutputId) -> bool {
        let name = engine.output_name(id).unwrap_or_else(|| id.to_string());

        if !engine.output_init_render(id) {
            error!("Failed to initialize rendering on output {}", name);
            return false;
        }

        let mode = match engine.output_preferred_mode(id) {
            Some(mode) => mode,
            None => {
                debug!("Output {} has no modes, using {}", name, self.default_mode);
                self.default_mode
            }
        };

        let state = OutputState { enabled: true, mode };
        if !engine.output_commit_state(id, &state) {
            error!("Failed to commit output {} state {}, dropping output", name, mode);
            return false;
        }

        let mut listeners = ListenerSet::new();
        listeners.add(engine, ObjectId::Output(id), SignalKind::OutputFrame);
        listeners.add(engine, ObjectId::Output(id), SignalKind::OutputRequestState);
        listeners.add(engine, ObjectId::Output(id), SignalKind::OutputDestroy);

        let scene_output = engine.scene_output_create(id);
        if scene_output.is_none() {
            warn!("No scene output for {}, frames will not be presented", name);
        }

        info!("Output {} configured at {}", name, mode);
        self.outputs.insert(
            0,
            Output {
                id,
                name,
                mode,
                scene_output,
                status: OutputStatus::Configured,
                frames: 0,
                listeners,
            },
        );
        true
    }

    /// Frame signal: commit the scene, then tell clients the frame is done
    pub fn handle_frame(&mut self, engine: &mut dyn Engine, id: OutputId) -> bool {
        let now = self.start_time.elapsed();
        let Some(output) = self.outputs.iter_mut().find(|o| o.id == id) else {
            return false;
        };
        let Some(scene_output) = output.scene_output else {
            return false;
        };

        let committed = engine.scene_output_commit(scene_output);
        if !committed {
            debug!("Scene commit on {} failed", output.name);
        }
        // Clients block on frame-done; it goes out even when nothing was presented
        engine.scene_output_send_frame_done(scene_output, now);

        if committed {
            output.status = OutputStatus::Rendering;
            output.frames += 1;
        }
        committed
    }

    /// Manual pump for backends without autonomous frame signals
    pub fn render_frame(&mut self, engine: &mut dyn Engine, id: OutputId) -> bool {
        self.handle_frame(engine, id)
    }

    pub fn render_primary(&mut self, engine: &mut dyn Engine) -> bool {
        match self.primary().map(|o| o.id) {
            Some(id) => self.render_frame(engine, id),
            None => false,
        }
    }

    pub fn handle_request_state(&mut self, engine: &mut dyn Engine, id: OutputId, state: &OutputState) {
        let Some(output) = self.outputs.iter_mut().find(|o| o.id == id) else {
            return;
        };
        if engine.output_commit_state(id, state) {
            info!("Output {} switched to {}", output.name, state.mode);
            output.mode = state.mode;
        } else {
            warn!("Output {} rejected state {}", output.name, state.mode);
        }
    }

    /// Backend removed the output
    pub fn handle_destroy(&mut self, engine: &mut dyn Engine, id: OutputId) {
        let Some(index) = self.outputs.iter().position(|o| o.id == id) else {
            return;
        };
        let mut output = self.outputs.remove(index);
        output.listeners.remove_all(engine);
        if let Some(scene_output) = output.scene_output.take() {
            engine.scene_output_destroy(scene_output);
        }
        output.status = OutputStatus::Destroyed;
        info!("Output {} destroyed", output.name);
    }

    pub fn primary(&self) -> Option<&Output> {
        self.outputs.first()
    }

    pub fn get(&self, id: OutputId) -> Option<&Output> {
        self.outputs.iter().find(|o| o.id == id)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Output> {
        self.outputs.iter()
    }

    /// Drop all subscriptions; safe to call more than once
    pub fn finish(&mut self, engine: &mut dyn Engine) {
        self.listeners.remove_all(engine);
        for output in &mut self.outputs {
            if output.listeners.remove_all(engine) {
                output.status = OutputStatus::Destroyed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{SimConfig, SimEngine, RendererKind};

    const DEFAULT: OutputMode = OutputMode {
        width: 1280,
        height: 720,
        refresh_mhz: 60000,
    };

    fn engine(config: SimConfig) -> SimEngine {
        let mut engine = SimEngine::new(config).unwrap();
        engine.create_display().unwrap();
        engine.create_backend().unwrap();
        engine.create_renderer(RendererKind::Pixman).unwrap();
        engine.create_allocator().unwrap();
        engine.create_scene().unwrap();
        engine.start_backend().unwrap();
        engine
    }

    #[test]
    fn test_default_mode_without_modes() {
        let mut engine = engine(SimConfig::default());
        let mut manager = OutputManager::new(DEFAULT);
        let id = engine.add_virtual_output(800, 600).unwrap();

        assert!(manager.handle_new_output(&mut engine, id));
        let primary = manager.primary().unwrap();
        assert_eq!((primary.width(), primary.height()), (1280, 720));
        assert_eq!(primary.status, OutputStatus::Configured);
        assert_eq!(engine.output_current_state(id).unwrap().mode, DEFAULT);
    }

    #[test]
    fn test_preferred_mode_wins() {
        let preferred = OutputMode { width: 1920, height: 1080, refresh_mhz: 59940 };
        let mut engine = engine(SimConfig {
            output_modes: vec![preferred],
            ..Default::default()
        });
        let mut manager = OutputManager::new(DEFAULT);
        let id = engine.add_virtual_output(800, 600).unwrap();

        assert!(manager.handle_new_output(&mut engine, id));
        assert_eq!(manager.primary().unwrap().mode, preferred);
    }

    #[test]
    fn test_commit_failure_drops_output() {
        let mut engine = engine(SimConfig {
            fail_output_commit: true,
            ..Default::default()
        });
        let mut manager = OutputManager::new(DEFAULT);
        let id = engine.add_virtual_output(800, 600).unwrap();

        assert!(!manager.handle_new_output(&mut engine, id));
        assert!(manager.is_empty());
        assert_eq!(engine.listener_count(), 0);
    }

    #[test]
    fn test_newest_output_is_primary() {
        let mut engine = engine(SimConfig::default());
        let mut manager = OutputManager::new(DEFAULT);
        let first = engine.add_virtual_output(800, 600).unwrap();
        let second = engine.add_virtual_output(800, 600).unwrap();
        manager.handle_new_output(&mut engine, first);
        manager.handle_new_output(&mut engine, second);

        assert_eq!(manager.primary().unwrap().id, second);
        manager.handle_destroy(&mut engine, second);
        assert_eq!(manager.primary().unwrap().id, first);
    }

    #[test]
    fn test_frame_pairs_commit_and_done() {
        let mut engine = engine(SimConfig::default());
        let mut manager = OutputManager::new(DEFAULT);
        let id = engine.add_virtual_output(800, 600).unwrap();
        manager.handle_new_output(&mut engine, id);

        assert!(manager.render_frame(&mut engine, id));
        assert_eq!(engine.frame_done_count(), 1);
        assert_eq!(manager.primary().unwrap().status, OutputStatus::Rendering);
        assert_eq!(manager.primary().unwrap().frames, 1);

        // Rejected mode keeps the current one
        let zero = OutputMode { width: 0, height: 0, refresh_mhz: 0 };
        manager.handle_request_state(&mut engine, id, &OutputState { enabled: true, mode: zero });
        assert_eq!(manager.primary().unwrap().mode, DEFAULT);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut engine = engine(SimConfig::default());
        let mut manager = OutputManager::new(DEFAULT);
        manager.init(&mut engine);
        let id = engine.add_virtual_output(800, 600).unwrap();
        manager.handle_new_output(&mut engine, id);
        assert_eq!(engine.listener_count(), 4);

        manager.handle_destroy(&mut engine, id);
        manager.handle_destroy(&mut engine, id);
        assert_eq!(engine.listener_count(), 1);

        manager.finish(&mut engine);
        manager.finish(&mut engine);
        assert_eq!(engine.listener_count(), 0);
    }
}
