//! smithay-backed engine
//!
//! Speaks the real protocol: a listening socket, the compositor and xdg
//! shell globals, a seat with an xkb keymap, and Pixman rendering of the
//! window space into one offscreen image per output. Everything runs on a
//! calloop event loop whose descriptor the host polls.

mod handlers;
mod render;
mod state;

pub use state::{ClientState, EngineState};

use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use log::{debug, info, trace, warn};
use smithay::{
    backend::{
        input::{
            Axis, AxisSource as WlAxisSource, ButtonState as WlButtonState, KeyState as WlKeyState,
        },
        renderer::{pixman::PixmanRenderer, utils::with_renderer_surface_state},
    },
    desktop::WindowSurfaceType,
    input::{
        keyboard::{FilterResult, Keycode, XkbConfig},
        pointer::{AxisFrame, ButtonEvent, MotionEvent},
    },
    output::{Mode as WlMode, Output, PhysicalProperties, Subpixel},
    reexports::{
        calloop::{
            generic::Generic,
            ping::make_ping,
            timer::{TimeoutAction, Timer},
            EventLoop, Interest, Mode as LoopMode, PostAction, RegistrationToken,
        },
        wayland_protocols::xdg::{
            decoration::zv1::server::zxdg_toplevel_decoration_v1::Mode as XdgDecorationMode,
            shell::server::xdg_toplevel,
        },
        wayland_server::{protocol::wl_shm, Display},
    },
    utils::{Logical, Point, SERIAL_COUNTER},
    wayland::{
        compositor::{with_states, CompositorState},
        output::OutputManagerState,
        selection::data_device::clear_data_device_selection,
        shell::xdg::{XdgShellState, XdgToplevelSurfaceData},
        shm::with_buffer_contents,
        socket::ListeningSocketSource,
    },
};

use self::render::SceneOutput;
use self::state::{OutputEntry, SceneNode, SurfaceRole};
use super::{
    AxisEvent, AxisOrientation, AxisSource, BufferRef, ButtonState, Capabilities, DecorationId,
    DecorationMode, Engine, EngineError, InputDevice, InputDeviceId, InputDeviceKind, KeyState,
    ListenerId, Modifiers, NodeId, ObjectId, OutputId, OutputMode, OutputState, PixelData,
    PixelFormat, PopupId, Rect, RendererKind, Result, SceneHit, SceneOutputId, SelectionSourceId,
    Signal, SignalData, SignalKind, SignalQueue, SurfaceId, ToplevelId,
};

const DEFAULT_REPEAT_RATE: i32 = 25;
const DEFAULT_REPEAT_DELAY: i32 = 600;

/// Engine settings that never change after creation
#[derive(Debug, Clone)]
pub struct WaylandConfig {
    /// Clear color behind all windows, RGBA
    pub background: [f32; 4],
    /// Outputs are named `<prefix>-<n>`
    pub output_prefix: String,
}

impl Default for WaylandConfig {
    fn default() -> Self {
        Self {
            background: [0.1, 0.1, 0.1, 1.0],
            output_prefix: "NEST".to_string(),
        }
    }
}

struct Inner {
    event_loop: EventLoop<'static, EngineState>,
    state: EngineState,
    renderer: Option<PixmanRenderer>,
    socket_name: Option<String>,
    backend: bool,
    allocator: bool,
    scene_ready: bool,
    backend_started: bool,
    output_counter: u32,
}

/// [`Engine`] on smithay, calloop and pixman
pub struct WaylandEngine {
    config: WaylandConfig,
    inner: Option<Inner>,
}

impl WaylandEngine {
    pub fn new(config: WaylandConfig) -> Self {
        Self { config, inner: None }
    }

    pub fn config(&self) -> &WaylandConfig {
        &self.config
    }

    pub fn socket_name(&self) -> Option<&str> {
        self.inner.as_ref().and_then(|i| i.socket_name.as_deref())
    }

    fn state(&self) -> Option<&EngineState> {
        self.inner.as_ref().map(|i| &i.state)
    }

    fn state_mut(&mut self) -> Option<&mut EngineState> {
        self.inner.as_mut().map(|i| &mut i.state)
    }

    fn inner_mut(&mut self) -> Result<&mut Inner> {
        self.inner.as_mut().ok_or(EngineError::DisplayUnavailable)
    }
}

impl Default for WaylandEngine {
    fn default() -> Self {
        Self::new(WaylandConfig::default())
    }
}

fn frame_interval(refresh_mhz: i32) -> Duration {
    let mhz = refresh_mhz.max(1000) as u64;
    Duration::from_micros(1_000_000_000 / mhz)
}

/// Periodic OutputFrame signals at the output's refresh rate
fn arm_frame_timer(state: &mut EngineState, output: OutputId, refresh_mhz: i32) -> Option<RegistrationToken> {
    let interval = frame_interval(refresh_mhz);
    let timer = Timer::from_duration(interval);
    let inserted = state.loop_handle.insert_source(timer, move |_, _, state| {
        state
            .signals
            .raise(ObjectId::Output(output), SignalKind::OutputFrame, SignalData::None);
        TimeoutAction::ToDuration(interval)
    });
    match inserted {
        Ok(token) => Some(token),
        Err(e) => {
            warn!("Failed to arm frame timer for {}: {}", output, e.error);
            None
        }
    }
}

fn shm_format(format: wl_shm::Format) -> Option<PixelFormat> {
    match format {
        wl_shm::Format::Argb8888 => Some(PixelFormat::Argb8888),
        wl_shm::Format::Xrgb8888 => Some(PixelFormat::Xrgb8888),
        _ => None,
    }
}

fn now_msec(state: &EngineState) -> u32 {
    state.start_time.elapsed().as_millis() as u32
}

impl Engine for WaylandEngine {
    fn create_display(&mut self) -> Result<()> {
        if self.inner.is_some() {
            return Ok(());
        }
        let event_loop: EventLoop<'static, EngineState> =
            EventLoop::try_new().map_err(|e| EngineError::Backend(format!("event loop: {}", e)))?;
        let display: Display<EngineState> =
            Display::new().map_err(|e| EngineError::Backend(format!("display: {}", e)))?;
        let display_handle = display.handle();
        let loop_handle = event_loop.handle();

        let (ping, ping_source) = make_ping()?;
        loop_handle
            .insert_source(ping_source, |_, _, _| {})
            .map_err(|e| EngineError::Backend(format!("signal wakeup: {}", e.error)))?;

        loop_handle
            .insert_source(
                Generic::new(display, Interest::READ, LoopMode::Level),
                |_, display, state| {
                    // Safety: the display is never dropped while its clients are dispatched
                    if let Err(e) = unsafe { display.get_mut().dispatch_clients(state) } {
                        warn!("Failed to dispatch clients: {}", e);
                    }
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|e| EngineError::Backend(format!("display source: {}", e.error)))?;

        let state = EngineState::new(display_handle, loop_handle, SignalQueue::with_wakeup(ping));
        self.inner = Some(Inner {
            event_loop,
            state,
            renderer: None,
            socket_name: None,
            backend: false,
            allocator: false,
            scene_ready: false,
            backend_started: false,
            output_counter: 0,
        });
        debug!("Display created");
        Ok(())
    }

    fn destroy_display(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.state.signals.clear();
            debug!("Display destroyed (socket {:?})", inner.socket_name);
        }
    }

    fn add_socket_auto(&mut self) -> Result<String> {
        let inner = self.inner_mut()?;
        if let Some(name) = &inner.socket_name {
            return Ok(name.clone());
        }
        let socket = ListeningSocketSource::new_auto().map_err(|e| EngineError::Socket(e.to_string()))?;
        let name = socket.socket_name().to_string_lossy().into_owned();
        inner
            .event_loop
            .handle()
            .insert_source(socket, |stream, _, state| {
                if let Err(e) = state.display_handle.insert_client(stream, state::new_client_data()) {
                    warn!("Failed to accept client: {}", e);
                }
            })
            .map_err(|e| EngineError::Socket(e.error.to_string()))?;
        info!("Listening on {}", name);
        inner.socket_name = Some(name.clone());
        Ok(name)
    }

    fn event_fd(&self) -> Option<BorrowedFd<'_>> {
        self.inner.as_ref().map(|i| i.event_loop.as_fd())
    }

    fn dispatch_pending(&mut self) {
        let Some(inner) = self.inner.as_mut() else {
            return;
        };
        if let Err(e) = inner.event_loop.dispatch(Some(Duration::ZERO), &mut inner.state) {
            warn!("Event loop dispatch failed: {}", e);
        }
    }

    fn next_signal(&mut self) -> Option<Signal> {
        self.state_mut()?.signals.pop()
    }

    fn flush_clients(&mut self) {
        let Some(state) = self.state_mut() else {
            return;
        };
        state.send_scheduled_configures();
        if let Err(e) = state.display_handle.flush_clients() {
            warn!("Failed to flush clients: {}", e);
        }
    }

    fn add_listener(&mut self, source: ObjectId, kind: SignalKind) -> ListenerId {
        match self.state_mut() {
            Some(state) => state.signals.subscribe(source, kind),
            None => ListenerId(0),
        }
    }

    fn remove_listener(&mut self, listener: ListenerId) -> Result<()> {
        match self.state_mut() {
            Some(state) => {
                if state.signals.unsubscribe(listener) {
                    Ok(())
                } else {
                    Err(EngineError::UnknownListener(listener))
                }
            }
            None => Err(EngineError::UnknownListener(listener)),
        }
    }

    fn create_backend(&mut self) -> Result<()> {
        self.inner_mut()?.backend = true;
        Ok(())
    }

    fn destroy_backend(&mut self) {
        let Some(inner) = self.inner.as_mut() else {
            return;
        };
        let state = &mut inner.state;
        for (_, entry) in std::mem::take(&mut state.outputs) {
            if let Some(token) = entry.frame_timer {
                state.loop_handle.remove(token);
            }
            state.space.unmap_output(&entry.output);
            state.display_handle.remove_global::<EngineState>(entry.global);
        }
        state.scene_outputs.clear();
        inner.renderer = None;
        inner.allocator = false;
        inner.backend_started = false;
        inner.backend = false;
    }

    fn hardware_available(&self) -> bool {
        false
    }

    fn create_renderer(&mut self, kind: RendererKind) -> Result<()> {
        let inner = self.inner_mut()?;
        if !inner.backend {
            return Err(EngineError::Backend("no backend".to_string()));
        }
        match kind {
            RendererKind::Pixman => {
                let renderer = PixmanRenderer::new().map_err(|e| EngineError::Renderer(format!("{:?}", e)))?;
                inner.renderer = Some(renderer);
                info!("Pixman renderer created");
                Ok(())
            }
            RendererKind::Gles2 => Err(EngineError::Renderer("no GPU renderer in this build".to_string())),
        }
    }

    fn create_allocator(&mut self) -> Result<()> {
        let inner = self.inner_mut()?;
        if inner.renderer.is_none() {
            return Err(EngineError::Allocator("no renderer".to_string()));
        }
        // Pixman allocates its own offscreen images
        inner.allocator = true;
        Ok(())
    }

    fn create_scene(&mut self) -> Result<()> {
        self.inner_mut()?.scene_ready = true;
        Ok(())
    }

    fn create_compositor_globals(&mut self) -> Result<()> {
        let inner = self.inner_mut()?;
        if inner.renderer.is_none() {
            return Err(EngineError::Subsystem("compositor needs a renderer".to_string()));
        }
        let state = &mut inner.state;
        if state.compositor_state.is_none() {
            state.compositor_state = Some(CompositorState::new::<EngineState>(&state.display_handle));
            state.output_manager_state = Some(OutputManagerState::new_with_xdg_output::<EngineState>(
                &state.display_handle,
            ));
        }
        Ok(())
    }

    fn create_xdg_shell(&mut self, version: u32) -> Result<()> {
        let state = &mut self.inner_mut()?.state;
        if state.compositor_state.is_none() {
            return Err(EngineError::Subsystem("xdg shell needs the compositor global".to_string()));
        }
        if state.xdg_shell_state.is_none() {
            state.xdg_shell_state = Some(XdgShellState::new::<EngineState>(&state.display_handle));
            debug!("xdg shell created (asked for version {})", version);
        }
        Ok(())
    }

    fn create_decoration_manager(&mut self) -> Result<()> {
        let state = &mut self.inner_mut()?.state;
        if state.xdg_shell_state.is_none() {
            return Err(EngineError::Subsystem("decorations need the xdg shell".to_string()));
        }
        handlers::decoration_state(state);
        Ok(())
    }

    fn create_seat(&mut self, name: &str, keymap_layout: &str) -> Result<()> {
        let state = &mut self.inner_mut()?.state;
        if state.seat.is_some() {
            return Ok(());
        }
        let mut seat = state.seat_state.new_wl_seat(&state.display_handle, name);
        let xkb = XkbConfig {
            layout: keymap_layout,
            ..Default::default()
        };
        seat.add_keyboard(xkb, DEFAULT_REPEAT_DELAY, DEFAULT_REPEAT_RATE)
            .map_err(|e| EngineError::Subsystem(format!("keymap for layout '{}': {:?}", keymap_layout, e)))?;
        seat.add_pointer();
        state.seat = Some(seat);
        info!("Seat '{}' created with layout '{}'", name, keymap_layout);
        Ok(())
    }

    fn start_backend(&mut self) -> Result<()> {
        let inner = self.inner_mut()?;
        if !inner.backend || inner.renderer.is_none() {
            return Err(EngineError::Backend("backend not initialized".to_string()));
        }
        inner.backend_started = true;
        Ok(())
    }

    fn add_virtual_output(&mut self, width: u32, height: u32) -> Result<OutputId> {
        let prefix = self.config.output_prefix.clone();
        let inner = self.inner_mut()?;
        if !inner.backend_started {
            return Err(EngineError::Protocol("output added before backend start".to_string()));
        }
        inner.output_counter += 1;
        let name = format!("{}-{}", prefix, inner.output_counter);
        let state = &mut inner.state;

        let output = Output::new(
            name.clone(),
            PhysicalProperties {
                size: (0, 0).into(),
                subpixel: Subpixel::Unknown,
                make: "nestcomp".into(),
                model: "Virtual".into(),
            },
        );
        let global = output.create_global::<EngineState>(&state.display_handle);
        let id = OutputId(state.next_object_id());
        state.outputs.insert(
            id,
            OutputEntry {
                output,
                global,
                render_ready: false,
                state: None,
                frame_timer: None,
            },
        );
        debug!("Virtual output {} ({}x{} requested)", name, width, height);
        state
            .signals
            .raise(ObjectId::Backend, SignalKind::NewOutput, SignalData::Output(id));
        Ok(id)
    }

    fn add_virtual_keyboard(&mut self, name: &str) -> Result<InputDeviceId> {
        let inner = self.inner_mut()?;
        if !inner.backend_started {
            return Err(EngineError::Protocol("input device added before backend start".to_string()));
        }
        let state = &mut inner.state;
        let id = InputDeviceId(state.next_object_id());
        let device = InputDevice {
            id,
            kind: InputDeviceKind::Keyboard,
            name: name.to_string(),
        };
        state
            .signals
            .raise(ObjectId::Backend, SignalKind::NewInput, SignalData::InputDevice(device));
        Ok(id)
    }

    fn output_name(&self, output: OutputId) -> Option<String> {
        self.state()?.outputs.get(&output).map(|o| o.output.name())
    }

    fn output_init_render(&mut self, output: OutputId) -> bool {
        let Some(inner) = self.inner.as_mut() else {
            return false;
        };
        if inner.renderer.is_none() || !inner.allocator {
            return false;
        }
        match inner.state.outputs.get_mut(&output) {
            Some(entry) => {
                entry.render_ready = true;
                true
            }
            None => false,
        }
    }

    fn output_preferred_mode(&self, output: OutputId) -> Option<OutputMode> {
        let mode = self.state()?.outputs.get(&output)?.output.preferred_mode()?;
        Some(OutputMode {
            width: mode.size.w as u32,
            height: mode.size.h as u32,
            refresh_mhz: mode.refresh,
        })
    }

    fn output_commit_state(&mut self, output: OutputId, committed: &OutputState) -> bool {
        let Some(state) = self.state_mut() else {
            return false;
        };
        let Some(entry) = state.outputs.get_mut(&output) else {
            return false;
        };
        if !entry.render_ready || committed.mode.width == 0 || committed.mode.height == 0 {
            return false;
        }
        let wl_output = entry.output.clone();
        let previous_timer = entry.frame_timer.take();
        entry.state = Some(*committed);

        if let Some(token) = previous_timer {
            state.loop_handle.remove(token);
        }
        if committed.enabled {
            let mode = WlMode {
                size: (committed.mode.width as i32, committed.mode.height as i32).into(),
                refresh: committed.mode.refresh_mhz,
            };
            wl_output.change_current_state(Some(mode), None, None, Some((0, 0).into()));
            state.space.map_output(&wl_output, (0, 0));
            let timer = arm_frame_timer(state, output, committed.mode.refresh_mhz);
            if let Some(entry) = state.outputs.get_mut(&output) {
                entry.frame_timer = timer;
            }
        } else {
            state.space.unmap_output(&wl_output);
        }
        true
    }

    fn scene_output_create(&mut self, output: OutputId) -> Option<SceneOutputId> {
        let inner = self.inner.as_mut()?;
        if !inner.scene_ready || !inner.state.outputs.contains_key(&output) {
            return None;
        }
        let id = SceneOutputId(inner.state.next_object_id());
        inner.state.scene_outputs.insert(id, SceneOutput::new(output));
        Some(id)
    }

    fn scene_output_destroy(&mut self, scene_output: SceneOutputId) {
        if let Some(state) = self.state_mut() {
            state.scene_outputs.remove(&scene_output);
        }
    }

    fn scene_output_commit(&mut self, scene_output: SceneOutputId) -> bool {
        let background = self.config.background;
        let Some(inner) = self.inner.as_mut() else {
            return false;
        };
        let Some(renderer) = inner.renderer.as_mut() else {
            return false;
        };
        let state = &mut inner.state;
        let Some(target) = state.scene_outputs.get_mut(&scene_output) else {
            return false;
        };
        let Some(entry) = state.outputs.get(&target.output) else {
            return false;
        };
        let Some(mode) = entry.state.filter(|s| s.enabled).map(|s| s.mode) else {
            return false;
        };
        // Nothing to present until a window has been mapped once
        if target.frame.is_none() && state.space.elements().next().is_none() {
            return true;
        }
        target.render(renderer, &entry.output, &state.space, mode.width, mode.height, background)
    }

    fn scene_output_send_frame_done(&mut self, scene_output: SceneOutputId, now: Duration) {
        let Some(state) = self.state() else {
            return;
        };
        let Some(output) = state
            .scene_outputs
            .get(&scene_output)
            .and_then(|so| state.outputs.get(&so.output))
            .map(|entry| entry.output.clone())
        else {
            return;
        };
        for window in state.space.elements() {
            window.send_frame(&output, now, None, |_, _| Some(output.clone()));
        }
    }

    fn scene_output_buffer(&self, scene_output: SceneOutputId) -> Option<BufferRef<'_>> {
        let frame = self.state()?.scene_outputs.get(&scene_output)?.frame.as_ref()?;
        Some(BufferRef {
            width: frame.width,
            height: frame.height,
            pixels: Some(PixelData {
                data: &frame.data,
                stride: frame.stride(),
                format: PixelFormat::Xrgb8888,
            }),
            dmabuf: None,
        })
    }

    fn scene_create_toplevel_tree(&mut self, toplevel: ToplevelId) -> Option<NodeId> {
        let state = self.state_mut()?;
        let entry = state.toplevels.get(&toplevel)?;
        if !entry.initial_committed {
            warn!("Scene tree for {} before its role is initialized", toplevel);
            return None;
        }
        if let Some(tree) = entry.tree {
            return Some(tree);
        }
        let window = entry.window.clone();
        let node = NodeId(state.next_object_id());
        state.space.map_element(window, (0, 0), false);
        state.nodes.insert(node, SceneNode::Toplevel(toplevel));
        if let Some(entry) = state.toplevels.get_mut(&toplevel) {
            entry.tree = Some(node);
        }
        Some(node)
    }

    fn scene_create_popup_tree(&mut self, popup: PopupId, parent: NodeId) -> Option<NodeId> {
        let state = self.state_mut()?;
        if !state.popups.contains_key(&popup) || !state.nodes.contains_key(&parent) {
            return None;
        }
        // Popups are drawn with their window; the node only tracks them
        let node = NodeId(state.next_object_id());
        state.nodes.insert(node, SceneNode::Popup(popup));
        if let Some(entry) = state.popups.get_mut(&popup) {
            entry.tree = Some(node);
        }
        Some(node)
    }

    fn scene_node_set_position(&mut self, node: NodeId, x: i32, y: i32) {
        let Some(state) = self.state_mut() else {
            return;
        };
        match state.nodes.get(&node) {
            Some(SceneNode::Toplevel(toplevel)) => {
                if let Some(window) = state.toplevels.get(toplevel).map(|t| t.window.clone()) {
                    state.space.map_element(window, (x, y), false);
                }
            }
            Some(SceneNode::Popup(popup)) => trace!("{} follows its positioner", popup),
            None => {}
        }
    }

    fn scene_node_raise_to_top(&mut self, node: NodeId) {
        let Some(state) = self.state_mut() else {
            return;
        };
        if let Some(SceneNode::Toplevel(toplevel)) = state.nodes.get(&node) {
            if let Some(window) = state.toplevels.get(toplevel).map(|t| t.window.clone()) {
                state.space.raise_element(&window, false);
            }
        }
    }

    fn scene_node_destroy(&mut self, node: NodeId) {
        let Some(state) = self.state_mut() else {
            return;
        };
        match state.nodes.remove(&node) {
            Some(SceneNode::Toplevel(toplevel)) => {
                if let Some(entry) = state.toplevels.get_mut(&toplevel) {
                    entry.tree = None;
                    let window = entry.window.clone();
                    state.space.unmap_elem(&window);
                }
            }
            Some(SceneNode::Popup(popup)) => {
                if let Some(entry) = state.popups.get_mut(&popup) {
                    entry.tree = None;
                }
            }
            None => {}
        }
    }

    fn scene_hits_at(&self, x: f64, y: f64) -> Vec<SceneHit> {
        let Some(state) = self.state() else {
            return Vec::new();
        };
        let pos: Point<f64, Logical> = (x, y).into();
        let Some((window, location)) = state.space.element_under(pos) else {
            return Vec::new();
        };
        let Some(tree) = window
            .toplevel()
            .and_then(|t| state.toplevel_for(t.wl_surface()))
            .and_then(|id| state.toplevels.get(&id))
            .and_then(|t| t.tree)
        else {
            return Vec::new();
        };
        let Some((surface, surface_loc)) = window.surface_under(pos - location.to_f64(), WindowSurfaceType::ALL)
        else {
            return Vec::new();
        };

        let origin = (surface_loc + location).to_f64();
        let surface_id = state.known_surface_id(&surface);
        let node = match surface_id.and_then(|s| state.roles.get(&s)) {
            Some(SurfaceRole::Popup(popup)) => state.popups.get(popup).and_then(|p| p.tree).unwrap_or(tree),
            _ => tree,
        };
        vec![SceneHit {
            node,
            tree,
            surface: surface_id,
            sx: x - origin.x,
            sy: y - origin.y,
        }]
    }

    fn toplevel_surface(&self, toplevel: ToplevelId) -> Option<SurfaceId> {
        self.state()?.toplevels.get(&toplevel).map(|t| t.surface_id)
    }

    fn toplevel_from_surface(&self, surface: SurfaceId) -> Option<ToplevelId> {
        match self.state()?.roles.get(&surface)? {
            SurfaceRole::Toplevel(toplevel) => Some(*toplevel),
            _ => None,
        }
    }

    fn toplevel_title(&self, toplevel: ToplevelId) -> Option<String> {
        let entry = self.state()?.toplevels.get(&toplevel)?;
        with_states(entry.surface.wl_surface(), |states| {
            states
                .data_map
                .get::<XdgToplevelSurfaceData>()
                .and_then(|d| d.lock().ok().and_then(|d| d.title.clone()))
        })
    }

    fn toplevel_geometry(&self, toplevel: ToplevelId) -> Rect {
        let Some(entry) = self.state().and_then(|s| s.toplevels.get(&toplevel)) else {
            return Rect::default();
        };
        let geo = entry.window.geometry();
        Rect::new(geo.loc.x, geo.loc.y, geo.size.w, geo.size.h)
    }

    fn toplevel_set_size(&mut self, toplevel: ToplevelId, width: i32, height: i32) -> u32 {
        let Some(state) = self.state_mut() else {
            return 0;
        };
        let Some(surface) = state.configurable(toplevel) else {
            return 0;
        };
        surface.with_pending_state(|pending| {
            pending.size = Some((width, height).into());
        });
        state.schedule(toplevel)
    }

    fn toplevel_set_fullscreen(&mut self, toplevel: ToplevelId, fullscreen: bool) -> u32 {
        let Some(state) = self.state_mut() else {
            return 0;
        };
        let Some(surface) = state.configurable(toplevel) else {
            return 0;
        };
        surface.with_pending_state(|pending| {
            if fullscreen {
                pending.states.set(xdg_toplevel::State::Fullscreen);
            } else {
                pending.states.unset(xdg_toplevel::State::Fullscreen);
            }
        });
        state.schedule(toplevel)
    }

    fn toplevel_set_activated(&mut self, toplevel: ToplevelId, activated: bool) -> u32 {
        let Some(state) = self.state_mut() else {
            return 0;
        };
        let Some(surface) = state.configurable(toplevel) else {
            return 0;
        };
        surface.with_pending_state(|pending| {
            if activated {
                pending.states.set(xdg_toplevel::State::Activated);
            } else {
                pending.states.unset(xdg_toplevel::State::Activated);
            }
        });
        state.schedule(toplevel)
    }

    fn toplevel_schedule_configure(&mut self, toplevel: ToplevelId) -> u32 {
        let Some(state) = self.state_mut() else {
            return 0;
        };
        if state.configurable(toplevel).is_none() {
            return 0;
        }
        state.schedule(toplevel)
    }

    fn toplevel_send_close(&mut self, toplevel: ToplevelId) {
        if let Some(entry) = self.state().and_then(|s| s.toplevels.get(&toplevel)) {
            entry.surface.send_close();
        }
    }

    fn surface_size(&self, surface: SurfaceId) -> (i32, i32) {
        self.state()
            .and_then(|s| s.surfaces.get(&surface))
            .and_then(|wl| with_renderer_surface_state(wl, |st| st.surface_size()).flatten())
            .map(|size| (size.w, size.h))
            .unwrap_or((0, 0))
    }

    fn with_surface_buffer(&self, surface: SurfaceId, f: &mut dyn FnMut(BufferRef<'_>)) -> bool {
        let Some(wl) = self.state().and_then(|s| s.surfaces.get(&surface)) else {
            return false;
        };
        let Some(buffer) = with_renderer_surface_state(wl, |st| st.buffer().cloned()).flatten() else {
            return false;
        };
        let visited = with_buffer_contents(&buffer, |ptr, len, data| {
            let Some(format) = shm_format(data.format) else {
                return false;
            };
            if data.offset < 0 || data.stride <= 0 || data.height <= 0 || data.width <= 0 {
                return false;
            }
            let offset = data.offset as usize;
            let end = offset + data.stride as usize * data.height as usize;
            if end > len {
                return false;
            }
            // Safety: smithay keeps the pool mapped for the duration of this callback
            let pool = unsafe { std::slice::from_raw_parts(ptr, len) };
            f(BufferRef {
                width: data.width as u32,
                height: data.height as u32,
                pixels: Some(PixelData {
                    data: &pool[offset..end],
                    stride: data.stride as u32,
                    format,
                }),
                dmabuf: None,
            });
            true
        });
        visited.unwrap_or(false)
    }

    fn popup_parent(&self, popup: PopupId) -> Option<SurfaceId> {
        self.state()?.popups.get(&popup)?.parent
    }

    fn decoration_set_mode(&mut self, decoration: DecorationId, mode: DecorationMode) {
        let Some(state) = self.state_mut() else {
            return;
        };
        let Some(toplevel) = state.decorations.get(&decoration).copied() else {
            return;
        };
        let Some(entry) = state.toplevels.get(&toplevel) else {
            return;
        };
        entry.surface.with_pending_state(|pending| {
            pending.decoration_mode = Some(match mode {
                DecorationMode::ServerSide => XdgDecorationMode::ServerSide,
                DecorationMode::ClientSide => XdgDecorationMode::ClientSide,
            });
        });
        // Before the initial commit the mode rides on the initial configure
        if entry.initial_committed {
            state.schedule(toplevel);
        }
    }

    fn seat_set_capabilities(&mut self, caps: Capabilities) {
        // wl_seat capabilities follow the keyboard and pointer attached in create_seat
        trace!("Seat capabilities {:#x}", caps.bits());
    }

    fn seat_set_keyboard_repeat(&mut self, rate: i32, delay: i32) {
        if let Some(keyboard) = self.state().and_then(|s| s.keyboard()) {
            keyboard.change_repeat_info(rate, delay);
        }
    }

    fn seat_set_selection(&mut self, source: Option<SelectionSourceId>, serial: u32) {
        let Some(state) = self.state_mut() else {
            return;
        };
        state.selection = Some((source, serial));
        // Offered selections are already installed on the seat by smithay
        if source.is_none() {
            if let Some(seat) = state.seat.as_ref() {
                clear_data_device_selection(&state.display_handle, seat);
            }
        }
    }

    fn keyboard_notify_enter(&mut self, surface: SurfaceId, pressed: &[u32], mods: Modifiers) {
        let Some(state) = self.state_mut() else {
            return;
        };
        let Some(wl) = state.surfaces.get(&surface).cloned() else {
            warn!("Keyboard enter on dead surface {}", surface);
            return;
        };
        let Some(keyboard) = state.keyboard() else {
            return;
        };
        if keyboard.current_focus().as_ref() == Some(&wl) {
            return;
        }
        trace!("Keyboard enter {} with {} keys down", surface, pressed.len());
        keyboard.set_focus(state, Some(wl), SERIAL_COUNTER.next_serial());
        self.keyboard_notify_modifiers(mods);
    }

    fn keyboard_notify_key(&mut self, time_msec: u32, key: u32, key_state: KeyState) {
        let Some(state) = self.state_mut() else {
            return;
        };
        let Some(keyboard) = state.keyboard() else {
            return;
        };
        if keyboard.current_focus().is_none() {
            trace!("Key {} without keyboard focus dropped", key);
            return;
        }
        let key_state = match key_state {
            KeyState::Pressed => WlKeyState::Pressed,
            KeyState::Released => WlKeyState::Released,
        };
        keyboard.input::<(), _>(
            state,
            Keycode::from(key + 8),
            key_state,
            SERIAL_COUNTER.next_serial(),
            time_msec,
            |_, _, _| FilterResult::Forward,
        );
    }

    fn keyboard_notify_modifiers(&mut self, mods: Modifiers) {
        let Some(keyboard) = self.state().and_then(|s| s.keyboard()) else {
            return;
        };
        let mut modifiers = keyboard.modifier_state();
        if modifiers.serialized.depressed == mods.depressed
            && modifiers.serialized.latched == mods.latched
            && modifiers.serialized.locked == mods.locked
            && modifiers.serialized.layout_effective == mods.group
        {
            return;
        }
        modifiers.serialized.depressed = mods.depressed;
        modifiers.serialized.latched = mods.latched;
        modifiers.serialized.locked = mods.locked;
        modifiers.serialized.layout_effective = mods.group;
        keyboard.set_modifier_state(modifiers);
    }

    fn keyboard_clear_focus(&mut self) {
        let Some(state) = self.state_mut() else {
            return;
        };
        if let Some(keyboard) = state.keyboard() {
            keyboard.set_focus(state, None, SERIAL_COUNTER.next_serial());
        }
    }

    fn pointer_notify_enter(&mut self, surface: SurfaceId, sx: f64, sy: f64) {
        let Some(state) = self.state_mut() else {
            return;
        };
        let Some(wl) = state.surfaces.get(&surface).cloned() else {
            warn!("Pointer enter on dead surface {}", surface);
            return;
        };
        if state.pointer_focus.as_ref() == Some(&wl) {
            return;
        }
        let Some(pointer) = state.pointer() else {
            return;
        };
        state.pointer_focus = Some(wl.clone());
        state.pointer_location = (sx, sy).into();
        let event = MotionEvent {
            location: state.pointer_location,
            serial: SERIAL_COUNTER.next_serial(),
            time: now_msec(state),
        };
        pointer.motion(state, Some((wl, (0.0, 0.0).into())), &event);
        pointer.frame(state);
    }

    fn pointer_notify_motion(&mut self, time_msec: u32, sx: f64, sy: f64) {
        let Some(state) = self.state_mut() else {
            return;
        };
        let (Some(focus), Some(pointer)) = (state.pointer_focus.clone(), state.pointer()) else {
            return;
        };
        state.pointer_location = (sx, sy).into();
        let event = MotionEvent {
            location: state.pointer_location,
            serial: SERIAL_COUNTER.next_serial(),
            time: time_msec,
        };
        pointer.motion(state, Some((focus, (0.0, 0.0).into())), &event);
        pointer.frame(state);
    }

    fn pointer_notify_button(&mut self, time_msec: u32, button: u32, button_state: ButtonState) {
        let Some(state) = self.state_mut() else {
            return;
        };
        if state.pointer_focus.is_none() {
            return;
        }
        let Some(pointer) = state.pointer() else {
            return;
        };
        let event = ButtonEvent {
            serial: SERIAL_COUNTER.next_serial(),
            time: time_msec,
            button,
            state: match button_state {
                ButtonState::Pressed => WlButtonState::Pressed,
                ButtonState::Released => WlButtonState::Released,
            },
        };
        pointer.button(state, &event);
        pointer.frame(state);
    }

    fn pointer_notify_axis(&mut self, time_msec: u32, event: AxisEvent) {
        let Some(state) = self.state_mut() else {
            return;
        };
        if state.pointer_focus.is_none() {
            return;
        }
        let Some(pointer) = state.pointer() else {
            return;
        };
        let axis = match event.orientation {
            AxisOrientation::Vertical => Axis::Vertical,
            AxisOrientation::Horizontal => Axis::Horizontal,
        };
        let source = match event.source {
            AxisSource::Wheel => WlAxisSource::Wheel,
            AxisSource::Finger => WlAxisSource::Finger,
            AxisSource::Continuous => WlAxisSource::Continuous,
        };
        let mut frame = AxisFrame::new(time_msec).source(source).value(axis, event.delta);
        if event.discrete != 0 {
            frame = frame.v120(axis, event.discrete * 120);
        }
        pointer.axis(state, frame);
        pointer.frame(state);
    }

    fn pointer_clear_focus(&mut self) {
        let Some(state) = self.state_mut() else {
            return;
        };
        if state.pointer_focus.take().is_none() {
            return;
        }
        let Some(pointer) = state.pointer() else {
            return;
        };
        let event = MotionEvent {
            location: state.pointer_location,
            serial: SERIAL_COUNTER.next_serial(),
            time: now_msec(state),
        };
        pointer.motion(state, None, &event);
        pointer.frame(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_interval_follows_refresh() {
        assert_eq!(frame_interval(60_000), Duration::from_micros(16_666));
        assert_eq!(frame_interval(120_000), Duration::from_micros(8_333));
        // Bogus rates fall back to one frame per second
        assert_eq!(frame_interval(0), Duration::from_secs(1));
    }

    #[test]
    fn test_shm_formats() {
        assert_eq!(shm_format(wl_shm::Format::Argb8888), Some(PixelFormat::Argb8888));
        assert_eq!(shm_format(wl_shm::Format::Xrgb8888), Some(PixelFormat::Xrgb8888));
        assert_eq!(shm_format(wl_shm::Format::Rgb565), None);
    }

    #[test]
    fn test_operations_need_a_display() {
        let mut engine = WaylandEngine::default();
        assert!(matches!(engine.add_socket_auto(), Err(EngineError::DisplayUnavailable)));
        assert!(engine.event_fd().is_none());
        assert!(engine.next_signal().is_none());
        assert!(!engine.hardware_available());
    }

    #[test]
    fn test_gles_renderer_unavailable() {
        let mut engine = WaylandEngine::default();
        engine.create_display().unwrap();
        engine.create_backend().unwrap();
        assert!(matches!(engine.create_renderer(RendererKind::Gles2), Err(EngineError::Renderer(_))));
        engine.create_renderer(RendererKind::Pixman).unwrap();
        engine.create_allocator().unwrap();
        engine.destroy_display();
        assert!(engine.event_fd().is_none());
    }

    #[test]
    fn test_virtual_output_raises_new_output() {
        let mut engine = WaylandEngine::default();
        engine.create_display().unwrap();
        engine.create_backend().unwrap();
        engine.create_renderer(RendererKind::Pixman).unwrap();
        engine.create_allocator().unwrap();
        engine.start_backend().unwrap();
        let listener = engine.add_listener(ObjectId::Backend, SignalKind::NewOutput);

        let output = engine.add_virtual_output(800, 600).unwrap();
        let signal = engine.next_signal().unwrap();
        assert_eq!(signal.listener, listener);
        assert_eq!(signal.data, SignalData::Output(output));
        assert_eq!(engine.output_name(output).as_deref(), Some("NEST-1"));
        assert!(engine.output_preferred_mode(output).is_none());
    }
}
