//! Compositor state and host API

use super::handlers::{self, SignalHandler};
use crate::config::{render_mode_from_env, Config};
use crate::engine::{Engine, EngineError, Rect, SceneOutputId, SignalKind, WaylandConfig, WaylandEngine};
use crate::error::{CompositorError, Result};
use crate::output::OutputManager;
use crate::render::{
    copy_pixels, CapturedFrame, FrameDimensions, FrameHasher, FrameStats, HasherConfig,
    RenderBackend, RenderError, RenderMode,
};
use crate::seat::Seat;
use crate::view::{View, ViewId, ViewManager};
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::os::fd::BorrowedFd;

/// xdg-shell version advertised to clients
const XDG_SHELL_VERSION: u32 = 6;

const VIRTUAL_KEYBOARD_NAME: &str = "nestcomp-keyboard";

pub type FrameCallback = Box<dyn FnMut(&CapturedFrame<'_>)>;
/// Called with `true` when a view is added to the host list, `false` when removed
pub type ViewCallback = Box<dyn FnMut(ViewId, bool)>;
pub type CommitCallback = Box<dyn FnMut()>;

pub struct Compositor<E: Engine = WaylandEngine> {
    pub(super) engine: E,
    pub(super) config: Config,
    pub(super) handlers: HashMap<SignalKind, SignalHandler<E>>,
    pub(super) backend: Option<RenderBackend>,
    pub(super) outputs: OutputManager,
    pub(super) views: ViewManager,
    pub(super) seat: Seat,

    /// Mapped views in the order the host saw them added
    pub(super) host_views: Vec<ViewId>,

    hasher: Option<FrameHasher>,
    frames_skipped: u64,
    socket: Option<String>,
    started: bool,
    destroyed: bool,

    on_frame: Option<FrameCallback>,
    on_view: Option<ViewCallback>,
    on_commit: Option<CommitCallback>,
}

impl Compositor<WaylandEngine> {
    /// Create a compositor speaking the Wayland protocol on a real socket
    pub fn create(config: Config) -> Result<Self> {
        Self::with_engine(WaylandEngine::new(WaylandConfig::default()), config)
    }
}

impl<E: Engine> Compositor<E> {
    pub fn with_engine(mut engine: E, config: Config) -> Result<Self> {
        engine
            .create_display()
            .map_err(|e| CompositorError::Init("display", e))?;

        let seat = Seat::new(&config.seat, &config.input)
            .map_err(|e| CompositorError::Init("keymap", EngineError::Subsystem(e.to_string())))?;

        let hasher = config
            .render
            .skip_unchanged_frames
            .then(|| FrameHasher::new(HasherConfig::default()));

        Ok(Self {
            outputs: OutputManager::new(config.output.mode()),
            views: ViewManager::new(config.views.policy()),
            seat,
            engine,
            config,
            handlers: HashMap::new(),
            backend: None,
            host_views: Vec::new(),
            hasher,
            frames_skipped: 0,
            socket: None,
            started: false,
            destroyed: false,
            on_frame: None,
            on_view: None,
            on_commit: None,
        })
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed {
            return Err(CompositorError::Destroyed);
        }
        Ok(())
    }

    /// Create the render backend and every protocol subsystem
    ///
    /// Returns the effective render mode; a hardware request may come back
    /// as software. On error the compositor is left partially initialized
    /// and should be destroyed.
    pub fn init_backend(&mut self, mode: RenderMode) -> Result<RenderMode> {
        self.ensure_alive()?;
        if self.backend.is_some() {
            return Err(CompositorError::AlreadyInitialized);
        }

        let backend = self
            .backend
            .insert(RenderBackend::create(mode, &mut self.engine)?);
        backend.init_renderer(&mut self.engine)?;
        let effective = backend.mode();

        self.engine
            .create_scene()
            .map_err(|e| CompositorError::Init("scene", e))?;
        self.engine
            .create_compositor_globals()
            .map_err(|e| CompositorError::Init("compositor", e))?;
        self.engine
            .create_xdg_shell(XDG_SHELL_VERSION)
            .map_err(|e| CompositorError::Init("xdg shell", e))?;
        if let Err(e) = self.engine.create_decoration_manager() {
            warn!("Decoration manager unavailable: {}", e);
        }

        self.outputs.init(&mut self.engine);
        self.views.init(&mut self.engine);
        self.seat
            .init(&mut self.engine)
            .map_err(|e| CompositorError::Init("seat", e))?;

        self.handlers = handlers::registry();
        info!("Backend initialized ({} rendering)", effective);
        Ok(effective)
    }

    /// `init_backend` with the mode from `NESTCOMP_HARDWARE`, else from config
    pub fn init_backend_from_env(&mut self) -> Result<RenderMode> {
        let mode = render_mode_from_env().unwrap_or(self.config.render.mode);
        self.init_backend(mode)
    }

    /// Open the client endpoint, start the backend and add the virtual output
    pub fn start(&mut self) -> Result<()> {
        self.ensure_alive()?;
        if self.backend.is_none() {
            return Err(CompositorError::NotInitialized);
        }
        if self.started {
            return Err(CompositorError::AlreadyStarted);
        }

        let socket = self
            .engine
            .add_socket_auto()
            .map_err(|e| CompositorError::Init("socket", e))?;
        self.engine
            .start_backend()
            .map_err(|e| CompositorError::Init("backend", e))?;

        let mode = self.config.output.mode();
        self.engine
            .add_virtual_output(mode.width, mode.height)
            .map_err(|e| CompositorError::Init("output", e))?;
        if let Err(e) = self.engine.add_virtual_keyboard(VIRTUAL_KEYBOARD_NAME) {
            warn!("No virtual keyboard: {}", e);
        }

        info!("Compositor listening on {}", socket);
        self.socket = Some(socket);
        self.started = true;

        self.dispatch_events();
        Ok(())
    }

    /// Run handlers for every queued signal, then flush clients
    ///
    /// Returns the number of signals handled.
    pub fn dispatch_events(&mut self) -> usize {
        if self.destroyed {
            return 0;
        }
        self.engine.dispatch_pending();
        let mut handled = 0;
        while let Some(signal) = self.engine.next_signal() {
            match self.handlers.get(&signal.kind).copied() {
                Some(handler) => {
                    handler(self, &signal);
                    handled += 1;
                }
                None => trace!("Unhandled signal {:?} from {:?}", signal.kind, signal.source),
            }
        }
        self.engine.flush_clients();
        handled
    }

    pub fn flush_clients(&mut self) {
        if !self.destroyed {
            self.engine.flush_clients();
        }
    }

    /// Descriptor to poll for readability before calling `dispatch_events`
    pub fn event_fd(&self) -> Option<BorrowedFd<'_>> {
        if self.destroyed {
            return None;
        }
        self.engine.event_fd()
    }

    // Callbacks

    pub fn set_frame_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&CapturedFrame<'_>) + 'static,
    {
        self.on_frame = Some(Box::new(callback));
    }

    pub fn set_view_callback<F>(&mut self, callback: F)
    where
        F: FnMut(ViewId, bool) + 'static,
    {
        self.on_view = Some(Box::new(callback));
    }

    pub fn set_commit_callback<F>(&mut self, callback: F)
    where
        F: FnMut() + 'static,
    {
        self.on_commit = Some(Box::new(callback));
    }

    pub(super) fn view_added(&mut self, id: ViewId) {
        if self.host_views.contains(&id) {
            return;
        }
        self.host_views.push(id);
        if let Some(callback) = self.on_view.as_mut() {
            callback(id, true);
        }
    }

    pub(super) fn view_removed(&mut self, id: ViewId) {
        let before = self.host_views.len();
        self.host_views.retain(|v| *v != id);
        if self.host_views.len() == before {
            return;
        }
        if let Some(callback) = self.on_view.as_mut() {
            callback(id, false);
        }
    }

    /// Hand the presented frame to the frame callback, unless it is unchanged
    pub(super) fn emit_frame(&mut self, scene_output: SceneOutputId) {
        let Some(callback) = self.on_frame.as_mut() else {
            return;
        };
        let Some(backend) = self.backend.as_mut() else {
            return;
        };
        match backend.capture_frame(&self.engine, scene_output) {
            Ok(frame) => {
                if let Some(hasher) = self.hasher.as_mut() {
                    if !hasher.has_changed(&frame) {
                        self.frames_skipped += 1;
                        trace!("Unchanged frame skipped");
                        return;
                    }
                }
                callback(&frame);
            }
            Err(RenderError::NoFrameAvailable) => trace!("No frame to hand out yet"),
            Err(e) => warn!("Frame capture failed: {}", e),
        }
    }

    pub(super) fn reset_hasher(&mut self) {
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.reset();
        }
    }

    // Host queries

    pub fn socket_name(&self) -> Option<&str> {
        self.socket.as_deref()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Size of the primary output
    pub fn output_size(&self) -> Option<(u32, u32)> {
        self.outputs.primary().map(|o| (o.width(), o.height()))
    }

    /// Effective render mode, once the backend is initialized
    pub fn render_mode(&self) -> Option<RenderMode> {
        self.backend.as_ref().map(|b| b.mode())
    }

    pub fn view_count(&self) -> usize {
        self.host_views.len()
    }

    pub fn view_id(&self, index: usize) -> Result<ViewId> {
        self.host_views
            .get(index)
            .copied()
            .ok_or(CompositorError::InvalidViewIndex(index))
    }

    fn view(&self, index: usize) -> Result<&View> {
        let id = self.view_id(index)?;
        self.views
            .get(id)
            .ok_or(CompositorError::InvalidViewIndex(index))
    }

    pub fn view_title(&self, index: usize) -> Result<String> {
        let view = self.view(index)?;
        Ok(view.title().unwrap_or("(untitled)").to_string())
    }

    pub fn view_geometry(&self, index: usize) -> Result<Rect> {
        let id = self.view_id(index)?;
        self.views
            .geometry(&self.engine, id)
            .ok_or(CompositorError::InvalidViewIndex(index))
    }

    pub fn view_is_mapped(&self, index: usize) -> Result<bool> {
        Ok(self.view(index)?.is_mapped())
    }

    /// Copy a view's last committed buffer into a host buffer
    pub fn view_frame_copy(&self, index: usize, dst: &mut [u8], width: u32, height: u32, stride: u32) -> Result<()> {
        let view = self.view(index)?;
        let got = dst.len();
        let mut outcome = Err(CompositorError::NoContent);
        self.engine.with_surface_buffer(view.surface, &mut |buffer| {
            let Some(pixels) = buffer.pixels else {
                return;
            };
            outcome = if copy_pixels(
                pixels.data,
                buffer.width,
                buffer.height,
                pixels.stride,
                &mut *dst,
                width,
                height,
                stride,
            ) {
                Ok(())
            } else {
                Err(CompositorError::BufferTooSmall {
                    needed: stride as usize * height.min(buffer.height) as usize,
                    got,
                })
            };
        });
        outcome
    }

    /// Layout of the last frame captured through the render backend
    pub fn frame_dimensions(&self) -> Option<FrameDimensions> {
        self.backend.as_ref().map(|b| b.dimensions())
    }

    pub fn frame_stats(&self) -> Option<&FrameStats> {
        self.backend.as_ref().map(|b| b.stats())
    }

    /// Frames not handed to the frame callback because nothing changed
    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped
    }

    pub fn focused_view(&self) -> Option<ViewId> {
        self.seat.focused_view()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn views(&self) -> &ViewManager {
        &self.views
    }

    pub fn seat(&self) -> &Seat {
        &self.seat
    }

    pub fn outputs(&self) -> &OutputManager {
        &self.outputs
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Direct engine access, e.g. for driving simulated clients in tests
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    // Host commands

    pub fn focus_view(&mut self, index: usize) -> Result<bool> {
        let id = self.view_id(index)?;
        Ok(self
            .seat
            .focus_view(&mut self.engine, &mut self.views, Some(id)))
    }

    pub fn close_view(&mut self, index: usize) -> Result<bool> {
        let id = self.view_id(index)?;
        Ok(self.views.close(&mut self.engine, id))
    }

    /// Ask the client for a new size; visible in the geometry after its next commit
    pub fn resize_view(&mut self, index: usize, width: i32, height: i32) -> Result<bool> {
        let id = self.view_id(index)?;
        Ok(self.views.request_size(&mut self.engine, id, width, height))
    }

    pub fn set_view_position(&mut self, index: usize, x: i32, y: i32) -> Result<bool> {
        let id = self.view_id(index)?;
        Ok(self.views.set_position(&mut self.engine, id, x, y))
    }

    /// Returns false when no view has keyboard focus
    pub fn send_key(&mut self, code: u32, pressed: bool) -> bool {
        if self.destroyed {
            return false;
        }
        self.seat.send_key(&mut self.engine, code, pressed)
    }

    pub fn send_modifiers(&mut self, depressed: u32, latched: u32, locked: u32, group: u32) {
        if self.destroyed {
            return;
        }
        self.seat
            .send_modifiers(&mut self.engine, depressed, latched, locked, group);
    }

    /// Move the cursor in layout coordinates; returns true when over a view
    pub fn send_pointer_motion(&mut self, x: f64, y: f64) -> bool {
        if self.destroyed {
            return false;
        }
        self.seat.send_pointer_motion(&mut self.engine, &self.views, x, y)
    }

    pub fn send_pointer_button(&mut self, button: u32, pressed: bool) {
        if self.destroyed {
            return;
        }
        self.seat
            .send_pointer_button(&mut self.engine, &mut self.views, button, pressed);
    }

    pub fn send_pointer_axis(&mut self, horizontal: bool, value: f64) -> bool {
        if self.destroyed {
            return false;
        }
        self.seat.send_pointer_axis(&mut self.engine, horizontal, value)
    }

    // Rendering

    fn primary_scene_output(&self) -> Result<SceneOutputId> {
        self.outputs
            .primary()
            .and_then(|o| o.scene_output)
            .ok_or(CompositorError::NoOutput)
    }

    /// Present the primary output and hand the frame to the frame callback
    pub fn render_and_notify(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        let Ok(scene_output) = self.primary_scene_output() else {
            return false;
        };
        if !self.outputs.render_primary(&mut self.engine) {
            return false;
        }
        self.emit_frame(scene_output);
        true
    }

    /// Host finished consuming a frame: present the next one, then fire the commit callback
    pub fn notify_frame_commit(&mut self) {
        if self.destroyed {
            return;
        }
        self.render_and_notify();
        if let Some(callback) = self.on_commit.as_mut() {
            callback();
        }
    }

    /// Present the primary output and copy it into a host buffer
    pub fn render_frame(&mut self, dst: &mut [u8], width: u32, height: u32, stride: u32) -> Result<()> {
        self.ensure_alive()?;
        let scene_output = self.primary_scene_output()?;
        if !self.outputs.render_primary(&mut self.engine) {
            debug!("Primary output commit failed, copying the previous frame");
        }

        let buffer = self
            .engine
            .scene_output_buffer(scene_output)
            .ok_or(RenderError::NoFrameAvailable)?;
        let pixels = buffer.pixels.ok_or(RenderError::NoFrameAvailable)?;
        if copy_pixels(
            pixels.data,
            buffer.width,
            buffer.height,
            pixels.stride,
            dst,
            width,
            height,
            stride,
        ) {
            Ok(())
        } else {
            Err(CompositorError::BufferTooSmall {
                needed: stride as usize * height.min(buffer.height) as usize,
                got: dst.len(),
            })
        }
    }

    /// Last presented frame of the primary output
    ///
    /// Fails with `NoFrameAvailable` until something has been presented.
    pub fn capture_frame(&mut self) -> Result<CapturedFrame<'_>> {
        self.ensure_alive()?;
        let scene_output = self.primary_scene_output()?;
        let backend = self
            .backend
            .as_mut()
            .ok_or(CompositorError::NotInitialized)?;
        Ok(backend.capture_frame(&self.engine, scene_output)?)
    }

    /// Tear everything down in dependency order; safe to call more than once
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        self.seat.finish(&mut self.engine);
        self.views.finish(&mut self.engine);
        self.outputs.finish(&mut self.engine);
        if let Some(mut backend) = self.backend.take() {
            backend.destroy(&mut self.engine);
        }
        self.handlers.clear();
        self.host_views.clear();
        self.socket = None;
        self.engine.destroy_display();
        info!("Compositor destroyed");
    }
}

impl<E: Engine> Drop for Compositor<E> {
    fn drop(&mut self) {
        self.destroy();
    }
}
