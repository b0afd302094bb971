//! Simulated engine for tests and benches
//!
//! An in-process stand-in for [`WaylandEngine`](super::WaylandEngine): virtual
//! outputs, a small software scene graph composited into XRGB buffers and
//! scripted clients whose received events are logged instead of written to a
//! socket. The signal queue is the one the real engine uses, woken through a
//! calloop ping so the readiness descriptor behaves the same way.

mod buffer;
mod client;
mod scene;

pub use buffer::PixelBuffer;
pub use client::{ClientEvent, ToplevelStates};
pub use scene::{NodeKind, SceneGraph};

use super::{
    AxisEvent, BufferRef, ButtonState, Capabilities, ClientId, DecorationId, DecorationMode,
    DmabufAttributes, Engine, EngineError, InputDevice, InputDeviceId, InputDeviceKind, KeyState,
    ListenerId, Modifiers, NodeId, ObjectId, OutputId, OutputMode, OutputState, PixelFormat,
    PopupId, Rect, RendererKind, Result, SceneHit, SceneOutputId, SelectionSourceId, Signal,
    SignalData, SignalKind, SignalQueue, SurfaceId, ToplevelId,
};
use log::{debug, info, warn};
use smithay::reexports::calloop::{ping::make_ping, EventLoop};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Socket names are unique per process so several engines can coexist
static SOCKET_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Simulated engine configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Whether a GPU is reported as present
    pub hardware_available: bool,

    /// Fail GPU renderer creation even when hardware is available
    pub fail_hardware_renderer: bool,

    /// Export output buffers through a shareable descriptor when rendering on the GPU path
    pub export_dmabuf: bool,

    /// Row alignment of output buffers in bytes
    pub stride_align: u32,

    /// Modes advertised by virtual outputs (headless outputs usually have none)
    pub output_modes: Vec<OutputMode>,

    /// Make every output state commit fail
    pub fail_output_commit: bool,

    /// Prefix of the client endpoint name
    pub socket_prefix: String,

    /// Output clear color
    pub background: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            hardware_available: false,
            fail_hardware_renderer: false,
            export_dmabuf: true,
            stride_align: 64,
            output_modes: Vec::new(),
            fail_output_commit: false,
            socket_prefix: "wayland-sim".to_string(),
            background: 0xff1e_1e1e,
        }
    }
}

#[derive(Debug, Default)]
struct ClientState {
    events: Vec<ClientEvent>,
}

#[derive(Debug, Clone, Copy)]
enum SurfaceRole {
    Toplevel(ToplevelId),
    Popup(PopupId),
}

#[derive(Debug)]
struct SurfaceState {
    client: ClientId,
    role: SurfaceRole,
    /// `Some(None)` detaches the buffer on commit
    pending_buffer: Option<Option<PixelBuffer>>,
    buffer: Option<PixelBuffer>,
}

#[derive(Debug, Default, Clone, Copy)]
struct PendingConfigure {
    width: i32,
    height: i32,
    states: ToplevelStates,
}

#[derive(Debug)]
struct ToplevelState {
    client: ClientId,
    surface: SurfaceId,
    title: Option<String>,
    /// Initial commit happened, the role is fully set up
    initialized: bool,
    mapped: bool,
    pending: PendingConfigure,
    /// Serial of the configure waiting for the next flush
    scheduled: Option<u32>,
    last_sent: Option<u32>,
    acked: Option<u32>,
    geometry: Option<Rect>,
    pending_geometry: Option<Rect>,
    decoration_mode: Option<DecorationMode>,
    tree: Option<NodeId>,
}

impl ToplevelState {
    fn new(client: ClientId, surface: SurfaceId) -> Self {
        Self {
            client,
            surface,
            title: None,
            initialized: false,
            mapped: false,
            pending: PendingConfigure::default(),
            scheduled: None,
            last_sent: None,
            acked: None,
            geometry: None,
            pending_geometry: None,
            decoration_mode: None,
            tree: None,
        }
    }
}

#[derive(Debug)]
struct PopupState {
    client: ClientId,
    surface: SurfaceId,
    parent: SurfaceId,
    x: i32,
    y: i32,
}

#[derive(Debug)]
struct SimOutput {
    name: String,
    modes: Vec<OutputMode>,
    render_ready: bool,
    state: Option<OutputState>,
}

#[derive(Debug)]
struct SimSceneOutput {
    output: OutputId,
    frame: Option<PixelBuffer>,
    shared: Option<File>,
}

#[derive(Debug, Default)]
struct SeatState {
    name: Option<String>,
    keymap_layout: Option<String>,
    capabilities: Capabilities,
    repeat: (i32, i32),
    keyboard_focus: Option<SurfaceId>,
    pointer_focus: Option<SurfaceId>,
    modifiers: Modifiers,
    selection: Option<(Option<SelectionSourceId>, u32)>,
    dropped_events: u64,
}

/// In-process engine with simulated clients
pub struct SimEngine {
    config: SimConfig,
    event_loop: EventLoop<'static, ()>,

    display: bool,
    socket: Option<String>,
    backend: bool,
    backend_started: bool,
    renderer: Option<RendererKind>,
    allocator: bool,
    scene_ready: bool,
    globals: bool,
    xdg_shell_version: Option<u32>,
    decoration_manager: bool,

    signals: SignalQueue,
    next_id: u32,
    next_serial: u32,
    output_counter: u32,

    outputs: BTreeMap<OutputId, SimOutput>,
    scene_outputs: HashMap<SceneOutputId, SimSceneOutput>,
    scene: SceneGraph,

    clients: BTreeMap<ClientId, ClientState>,
    surfaces: HashMap<SurfaceId, SurfaceState>,
    toplevels: BTreeMap<ToplevelId, ToplevelState>,
    popups: HashMap<PopupId, PopupState>,
    decorations: HashMap<DecorationId, ToplevelId>,
    input_devices: Vec<InputDevice>,
    seat: SeatState,

    protocol_errors: Vec<String>,
    frame_done_count: u64,
}

impl SimEngine {
    pub fn new(config: SimConfig) -> io::Result<Self> {
        let event_loop: EventLoop<'static, ()> = EventLoop::try_new().map_err(io::Error::other)?;
        let (ping, source) = make_ping()?;
        event_loop
            .handle()
            .insert_source(source, |_, _, _| {})
            .map_err(|e| io::Error::other(e.error))?;
        Ok(Self {
            config,
            event_loop,
            display: false,
            socket: None,
            backend: false,
            backend_started: false,
            renderer: None,
            allocator: false,
            scene_ready: false,
            globals: false,
            xdg_shell_version: None,
            decoration_manager: false,
            signals: SignalQueue::with_wakeup(ping),
            next_id: 1,
            next_serial: 1,
            output_counter: 0,
            outputs: BTreeMap::new(),
            scene_outputs: HashMap::new(),
            scene: SceneGraph::new(),
            clients: BTreeMap::new(),
            surfaces: HashMap::new(),
            toplevels: BTreeMap::new(),
            popups: HashMap::new(),
            decorations: HashMap::new(),
            input_devices: Vec::new(),
            seat: SeatState::default(),
            protocol_errors: Vec::new(),
            frame_done_count: 0,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn renderer(&self) -> Option<RendererKind> {
        self.renderer
    }

    /// Whether the readiness descriptor currently polls readable
    pub fn is_readable(&self) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.event_loop.as_fd().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        ret > 0 && (pfd.revents & libc::POLLIN) != 0
    }

    /// Consume the wakeup once the queue ran dry
    fn settle(&mut self) {
        if let Err(e) = self.event_loop.dispatch(Some(Duration::ZERO), &mut ()) {
            warn!("Simulated event loop: {}", e);
        }
    }

    fn next_object_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn emit(&mut self, source: ObjectId, kind: SignalKind, data: SignalData) {
        self.signals.raise(source, kind, data);
    }

    fn protocol_error(&mut self, msg: String) {
        warn!("Protocol error: {}", msg);
        self.protocol_errors.push(msg);
    }

    fn send_to_surface(&mut self, surface: SurfaceId, event: ClientEvent) -> bool {
        let Some(client) = self.surfaces.get(&surface).map(|s| s.client) else {
            return false;
        };
        match self.clients.get_mut(&client) {
            Some(state) => {
                state.events.push(event);
                true
            }
            None => false,
        }
    }

    fn send_to_toplevel_client(&mut self, toplevel: ToplevelId, event: ClientEvent) {
        let Some(client) = self.toplevels.get(&toplevel).map(|t| t.client) else {
            return;
        };
        if let Some(state) = self.clients.get_mut(&client) {
            state.events.push(event);
        }
    }

    fn schedule(&mut self, toplevel: ToplevelId) -> u32 {
        let Some(state) = self.toplevels.get_mut(&toplevel) else {
            return 0;
        };
        if let Some(serial) = state.scheduled {
            return serial;
        }
        let serial = self.next_serial;
        self.next_serial += 1;
        state.scheduled = Some(serial);
        serial
    }

    /// Pending configure state of an initialized toplevel
    fn configurable(&mut self, toplevel: ToplevelId) -> Option<&mut PendingConfigure> {
        let initialized = self.toplevels.get(&toplevel).map(|t| t.initialized)?;
        if !initialized {
            self.protocol_error(format!("{} configured before its initial commit", toplevel));
            return None;
        }
        self.toplevels.get_mut(&toplevel).map(|t| &mut t.pending)
    }

    fn destroy_toplevel_object(&mut self, toplevel: ToplevelId) {
        let Some(state) = self.toplevels.remove(&toplevel) else {
            return;
        };
        self.emit(ObjectId::Toplevel(toplevel), SignalKind::ToplevelDestroy, SignalData::None);
        if let Some(tree) = state.tree {
            self.scene.destroy(tree);
        }
        self.decorations.retain(|_, t| *t != toplevel);
        self.forget_surface(state.surface);
    }

    fn forget_surface(&mut self, surface: SurfaceId) {
        self.surfaces.remove(&surface);
        self.scene.destroy_surface_nodes(surface);
        if self.seat.keyboard_focus == Some(surface) {
            self.seat.keyboard_focus = None;
        }
        if self.seat.pointer_focus == Some(surface) {
            self.seat.pointer_focus = None;
        }

        let children: Vec<PopupId> = self
            .popups
            .iter()
            .filter(|(_, p)| p.parent == surface)
            .map(|(id, _)| *id)
            .collect();
        for popup in children {
            self.destroy_popup_object(popup);
        }
    }

    fn destroy_popup_object(&mut self, popup: PopupId) {
        let Some(state) = self.popups.remove(&popup) else {
            return;
        };
        self.emit(ObjectId::Popup(popup), SignalKind::PopupDestroy, SignalData::None);
        self.forget_surface(state.surface);
    }

    fn create_shared_buffer() -> io::Result<File> {
        let name = b"nestcomp-frame\0";
        let raw = unsafe { libc::memfd_create(name.as_ptr().cast(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { File::from_raw_fd(raw) })
    }

    fn export_frame(shared: &mut Option<File>, frame: &PixelBuffer) -> io::Result<()> {
        if shared.is_none() {
            *shared = Some(Self::create_shared_buffer()?);
        }
        if let Some(file) = shared.as_ref() {
            file.set_len(frame.data().len() as u64)?;
            file.write_all_at(frame.data(), 0)?;
        }
        Ok(())
    }
}

impl Engine for SimEngine {
    fn create_display(&mut self) -> Result<()> {
        self.display = true;
        debug!("Simulated display created");
        Ok(())
    }

    fn destroy_display(&mut self) {
        if !self.display {
            return;
        }
        let clients: Vec<ClientId> = self.clients.keys().copied().collect();
        for client in clients {
            self.disconnect_client(client);
        }
        self.signals.clear();
        self.settle();
        self.socket = None;
        self.display = false;
        debug!("Simulated display destroyed");
    }

    fn add_socket_auto(&mut self) -> Result<String> {
        if !self.display {
            return Err(EngineError::DisplayUnavailable);
        }
        if let Some(name) = &self.socket {
            return Ok(name.clone());
        }
        let n = SOCKET_COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", self.config.socket_prefix, n);
        self.socket = Some(name.clone());
        Ok(name)
    }

    fn event_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.event_loop.as_fd())
    }

    fn dispatch_pending(&mut self) {}

    fn next_signal(&mut self) -> Option<Signal> {
        let next = self.signals.pop();
        if self.signals.is_empty() {
            self.settle();
        }
        next
    }

    fn flush_clients(&mut self) {
        let scheduled: Vec<(ToplevelId, u32)> = self
            .toplevels
            .iter()
            .filter_map(|(id, t)| t.scheduled.map(|s| (*id, s)))
            .collect();
        for (toplevel, serial) in scheduled {
            let Some(state) = self.toplevels.get_mut(&toplevel) else {
                continue;
            };
            state.scheduled = None;
            state.last_sent = Some(serial);
            let pending = state.pending;
            self.send_to_toplevel_client(
                toplevel,
                ClientEvent::Configure {
                    toplevel,
                    serial,
                    width: pending.width,
                    height: pending.height,
                    states: pending.states,
                },
            );
        }
    }

    fn add_listener(&mut self, source: ObjectId, kind: SignalKind) -> ListenerId {
        self.signals.subscribe(source, kind)
    }

    fn remove_listener(&mut self, listener: ListenerId) -> Result<()> {
        if self.signals.unsubscribe(listener) {
            Ok(())
        } else {
            Err(EngineError::UnknownListener(listener))
        }
    }

    fn create_backend(&mut self) -> Result<()> {
        if !self.display {
            return Err(EngineError::DisplayUnavailable);
        }
        self.backend = true;
        Ok(())
    }

    fn destroy_backend(&mut self) {
        self.outputs.clear();
        self.scene_outputs.clear();
        self.renderer = None;
        self.allocator = false;
        self.backend_started = false;
        self.backend = false;
    }

    fn hardware_available(&self) -> bool {
        self.config.hardware_available
    }

    fn create_renderer(&mut self, kind: RendererKind) -> Result<()> {
        if !self.backend {
            return Err(EngineError::Backend("no backend".to_string()));
        }
        if kind == RendererKind::Gles2
            && (!self.config.hardware_available || self.config.fail_hardware_renderer)
        {
            return Err(EngineError::Renderer("no usable GPU".to_string()));
        }
        self.renderer = Some(kind);
        info!("Simulated renderer: {:?}", kind);
        Ok(())
    }

    fn create_allocator(&mut self) -> Result<()> {
        if self.renderer.is_none() {
            return Err(EngineError::Allocator("no renderer".to_string()));
        }
        self.allocator = true;
        Ok(())
    }

    fn create_scene(&mut self) -> Result<()> {
        self.scene_ready = true;
        Ok(())
    }

    fn create_compositor_globals(&mut self) -> Result<()> {
        if self.renderer.is_none() {
            return Err(EngineError::Subsystem("compositor needs a renderer".to_string()));
        }
        self.globals = true;
        Ok(())
    }

    fn create_xdg_shell(&mut self, version: u32) -> Result<()> {
        if !self.globals {
            return Err(EngineError::Subsystem("xdg shell needs the compositor global".to_string()));
        }
        self.xdg_shell_version = Some(version);
        Ok(())
    }

    fn create_decoration_manager(&mut self) -> Result<()> {
        if self.xdg_shell_version.is_none() {
            return Err(EngineError::Subsystem("decorations need the xdg shell".to_string()));
        }
        self.decoration_manager = true;
        Ok(())
    }

    fn create_seat(&mut self, name: &str, keymap_layout: &str) -> Result<()> {
        if !self.display {
            return Err(EngineError::DisplayUnavailable);
        }
        self.seat.name = Some(name.to_string());
        self.seat.keymap_layout = Some(keymap_layout.to_string());
        Ok(())
    }

    fn start_backend(&mut self) -> Result<()> {
        if !self.backend || self.renderer.is_none() {
            return Err(EngineError::Backend("backend not initialized".to_string()));
        }
        self.backend_started = true;
        Ok(())
    }

    fn add_virtual_output(&mut self, width: u32, height: u32) -> Result<OutputId> {
        if !self.backend_started {
            return Err(EngineError::Protocol("output added before backend start".to_string()));
        }
        let id = OutputId(self.next_object_id());
        self.output_counter += 1;
        let name = format!("HEADLESS-{}", self.output_counter);
        debug!("Virtual output {} ({}x{})", name, width, height);
        self.outputs.insert(
            id,
            SimOutput {
                name,
                modes: self.config.output_modes.clone(),
                render_ready: false,
                state: None,
            },
        );
        self.emit(ObjectId::Backend, SignalKind::NewOutput, SignalData::Output(id));
        Ok(id)
    }

    fn add_virtual_keyboard(&mut self, name: &str) -> Result<InputDeviceId> {
        if !self.backend_started {
            return Err(EngineError::Protocol("input device added before backend start".to_string()));
        }
        Ok(self.add_input_device(InputDeviceKind::Keyboard, name))
    }

    fn output_name(&self, output: OutputId) -> Option<String> {
        self.outputs.get(&output).map(|o| o.name.clone())
    }

    fn output_init_render(&mut self, output: OutputId) -> bool {
        if self.renderer.is_none() || !self.allocator {
            return false;
        }
        match self.outputs.get_mut(&output) {
            Some(o) => {
                o.render_ready = true;
                true
            }
            None => false,
        }
    }

    fn output_preferred_mode(&self, output: OutputId) -> Option<OutputMode> {
        self.outputs.get(&output).and_then(|o| o.modes.first().copied())
    }

    fn output_commit_state(&mut self, output: OutputId, state: &OutputState) -> bool {
        if self.config.fail_output_commit {
            return false;
        }
        let Some(o) = self.outputs.get_mut(&output) else {
            return false;
        };
        if !o.render_ready || state.mode.width == 0 || state.mode.height == 0 {
            return false;
        }
        o.state = Some(*state);
        true
    }

    fn scene_output_create(&mut self, output: OutputId) -> Option<SceneOutputId> {
        if !self.scene_ready || !self.outputs.contains_key(&output) {
            return None;
        }
        let id = SceneOutputId(self.next_object_id());
        self.scene_outputs.insert(
            id,
            SimSceneOutput {
                output,
                frame: None,
                shared: None,
            },
        );
        Some(id)
    }

    fn scene_output_destroy(&mut self, scene_output: SceneOutputId) {
        self.scene_outputs.remove(&scene_output);
    }

    fn scene_output_commit(&mut self, scene_output: SceneOutputId) -> bool {
        let Some(so) = self.scene_outputs.get(&scene_output) else {
            return false;
        };
        let Some(state) = self.outputs.get(&so.output).and_then(|o| o.state) else {
            return false;
        };
        if !state.enabled {
            return false;
        }

        let mut frame = PixelBuffer::new(
            state.mode.width,
            state.mode.height,
            PixelFormat::Xrgb8888,
            self.config.stride_align,
        );
        frame.fill(self.config.background);
        let surfaces = &self.surfaces;
        let drew = self
            .scene
            .render(&mut frame, &|s| surfaces.get(&s).and_then(|st| st.buffer.as_ref()));

        let export = self.renderer == Some(RendererKind::Gles2) && self.config.export_dmabuf;
        let Some(so) = self.scene_outputs.get_mut(&scene_output) else {
            return false;
        };
        // Nothing to present until a client has committed content once
        if !drew && so.frame.is_none() {
            return true;
        }
        if export {
            if let Err(e) = Self::export_frame(&mut so.shared, &frame) {
                warn!("Failed to export frame buffer: {}", e);
                so.shared = None;
            }
        }
        so.frame = Some(frame);
        true
    }

    fn scene_output_send_frame_done(&mut self, scene_output: SceneOutputId, now: Duration) {
        if !self.scene_outputs.contains_key(&scene_output) {
            return;
        }
        let time_msec = now.as_millis() as u32;
        for surface in self.scene.surfaces() {
            self.send_to_surface(surface, ClientEvent::FrameDone { surface, time_msec });
        }
        self.frame_done_count += 1;
    }

    fn scene_output_buffer(&self, scene_output: SceneOutputId) -> Option<BufferRef<'_>> {
        let so = self.scene_outputs.get(&scene_output)?;
        let frame = so.frame.as_ref()?;
        Some(BufferRef {
            width: frame.width(),
            height: frame.height(),
            pixels: Some(frame.pixel_data()),
            dmabuf: so.shared.as_ref().map(|file| DmabufAttributes {
                fd: file.as_fd(),
                width: frame.width(),
                height: frame.height(),
                stride: frame.stride(),
                offset: 0,
                format: frame.format(),
            }),
        })
    }

    fn scene_create_toplevel_tree(&mut self, toplevel: ToplevelId) -> Option<NodeId> {
        let (initialized, surface, existing) = {
            let t = self.toplevels.get(&toplevel)?;
            (t.initialized, t.surface, t.tree)
        };
        if !initialized {
            self.protocol_error(format!("scene tree for {} before its role is initialized", toplevel));
            return None;
        }
        if let Some(tree) = existing.filter(|t| self.scene.contains(*t)) {
            return Some(tree);
        }
        let root = self.scene.root();
        let tree = self.scene.create_tree(root)?;
        self.scene.create_surface(tree, surface)?;
        if let Some(t) = self.toplevels.get_mut(&toplevel) {
            t.tree = Some(tree);
        }
        Some(tree)
    }

    fn scene_create_popup_tree(&mut self, popup: PopupId, parent: NodeId) -> Option<NodeId> {
        let (surface, x, y) = {
            let p = self.popups.get(&popup)?;
            (p.surface, p.x, p.y)
        };
        let tree = self.scene.create_tree(parent)?;
        self.scene.create_surface(tree, surface)?;
        self.scene.set_position(tree, x, y);
        Some(tree)
    }

    fn scene_node_set_position(&mut self, node: NodeId, x: i32, y: i32) {
        self.scene.set_position(node, x, y);
    }

    fn scene_node_raise_to_top(&mut self, node: NodeId) {
        self.scene.raise_to_top(node);
    }

    fn scene_node_destroy(&mut self, node: NodeId) {
        self.scene.destroy(node);
        for t in self.toplevels.values_mut() {
            if t.tree == Some(node) {
                t.tree = None;
            }
        }
    }

    fn scene_hits_at(&self, x: f64, y: f64) -> Vec<SceneHit> {
        let surfaces = &self.surfaces;
        self.scene.nodes_at(x, y, &|s| {
            surfaces
                .get(&s)
                .and_then(|st| st.buffer.as_ref())
                .map(|b| (b.width(), b.height()))
        })
    }

    fn toplevel_surface(&self, toplevel: ToplevelId) -> Option<SurfaceId> {
        self.toplevels.get(&toplevel).map(|t| t.surface)
    }

    fn toplevel_from_surface(&self, surface: SurfaceId) -> Option<ToplevelId> {
        match self.surfaces.get(&surface)?.role {
            SurfaceRole::Toplevel(t) => Some(t),
            SurfaceRole::Popup(_) => None,
        }
    }

    fn toplevel_title(&self, toplevel: ToplevelId) -> Option<String> {
        self.toplevels.get(&toplevel).and_then(|t| t.title.clone())
    }

    fn toplevel_geometry(&self, toplevel: ToplevelId) -> Rect {
        let Some(t) = self.toplevels.get(&toplevel) else {
            return Rect::default();
        };
        if let Some(geometry) = t.geometry {
            return geometry;
        }
        let (w, h) = self.surface_size(t.surface);
        Rect::new(0, 0, w, h)
    }

    fn toplevel_set_size(&mut self, toplevel: ToplevelId, width: i32, height: i32) -> u32 {
        let Some(pending) = self.configurable(toplevel) else {
            return 0;
        };
        pending.width = width;
        pending.height = height;
        self.schedule(toplevel)
    }

    fn toplevel_set_fullscreen(&mut self, toplevel: ToplevelId, fullscreen: bool) -> u32 {
        let Some(pending) = self.configurable(toplevel) else {
            return 0;
        };
        pending.states.fullscreen = fullscreen;
        self.schedule(toplevel)
    }

    fn toplevel_set_activated(&mut self, toplevel: ToplevelId, activated: bool) -> u32 {
        let Some(pending) = self.configurable(toplevel) else {
            return 0;
        };
        pending.states.activated = activated;
        self.schedule(toplevel)
    }

    fn toplevel_schedule_configure(&mut self, toplevel: ToplevelId) -> u32 {
        if self.configurable(toplevel).is_none() {
            return 0;
        }
        self.schedule(toplevel)
    }

    fn toplevel_send_close(&mut self, toplevel: ToplevelId) {
        self.send_to_toplevel_client(toplevel, ClientEvent::Close { toplevel });
    }

    fn surface_size(&self, surface: SurfaceId) -> (i32, i32) {
        self.surfaces
            .get(&surface)
            .and_then(|s| s.buffer.as_ref())
            .map(|b| (b.width() as i32, b.height() as i32))
            .unwrap_or((0, 0))
    }

    fn with_surface_buffer(&self, surface: SurfaceId, f: &mut dyn FnMut(BufferRef<'_>)) -> bool {
        let Some(buffer) = self.surfaces.get(&surface).and_then(|s| s.buffer.as_ref()) else {
            return false;
        };
        f(BufferRef {
            width: buffer.width(),
            height: buffer.height(),
            pixels: Some(buffer.pixel_data()),
            dmabuf: None,
        });
        true
    }

    fn popup_parent(&self, popup: PopupId) -> Option<SurfaceId> {
        self.popups.get(&popup).map(|p| p.parent)
    }

    fn decoration_set_mode(&mut self, decoration: DecorationId, mode: DecorationMode) {
        let Some(toplevel) = self.decorations.get(&decoration).copied() else {
            return;
        };
        if let Some(t) = self.toplevels.get_mut(&toplevel) {
            t.decoration_mode = Some(mode);
        }
        self.send_to_toplevel_client(toplevel, ClientEvent::DecorationMode { toplevel, mode });
    }

    fn seat_set_capabilities(&mut self, caps: Capabilities) {
        self.seat.capabilities = caps;
    }

    fn seat_set_keyboard_repeat(&mut self, rate: i32, delay: i32) {
        self.seat.repeat = (rate, delay);
    }

    fn seat_set_selection(&mut self, source: Option<SelectionSourceId>, serial: u32) {
        self.seat.selection = Some((source, serial));
    }

    fn keyboard_notify_enter(&mut self, surface: SurfaceId, pressed: &[u32], mods: Modifiers) {
        if self.seat.keyboard_focus == Some(surface) {
            return;
        }
        if !self.surfaces.contains_key(&surface) {
            self.protocol_error(format!("keyboard enter on dead surface {}", surface));
            return;
        }
        if let Some(old) = self.seat.keyboard_focus.take() {
            self.send_to_surface(old, ClientEvent::KeyboardLeave { surface: old });
        }
        self.seat.keyboard_focus = Some(surface);
        self.seat.modifiers = mods;
        self.send_to_surface(
            surface,
            ClientEvent::KeyboardEnter {
                surface,
                keys: pressed.to_vec(),
                modifiers: mods,
            },
        );
        self.send_to_surface(surface, ClientEvent::Modifiers { surface, modifiers: mods });
    }

    fn keyboard_notify_key(&mut self, time_msec: u32, key: u32, state: KeyState) {
        match self.seat.keyboard_focus {
            Some(surface) => {
                self.send_to_surface(
                    surface,
                    ClientEvent::Key {
                        surface,
                        time_msec,
                        key,
                        state,
                    },
                );
            }
            None => self.seat.dropped_events += 1,
        }
    }

    fn keyboard_notify_modifiers(&mut self, mods: Modifiers) {
        self.seat.modifiers = mods;
        if let Some(surface) = self.seat.keyboard_focus {
            self.send_to_surface(surface, ClientEvent::Modifiers { surface, modifiers: mods });
        }
    }

    fn keyboard_clear_focus(&mut self) {
        if let Some(old) = self.seat.keyboard_focus.take() {
            self.send_to_surface(old, ClientEvent::KeyboardLeave { surface: old });
        }
    }

    fn pointer_notify_enter(&mut self, surface: SurfaceId, sx: f64, sy: f64) {
        if self.seat.pointer_focus == Some(surface) {
            return;
        }
        if !self.surfaces.contains_key(&surface) {
            self.protocol_error(format!("pointer enter on dead surface {}", surface));
            return;
        }
        if let Some(old) = self.seat.pointer_focus.take() {
            self.send_to_surface(old, ClientEvent::PointerLeave { surface: old });
        }
        self.seat.pointer_focus = Some(surface);
        self.send_to_surface(surface, ClientEvent::PointerEnter { surface, sx, sy });
    }

    fn pointer_notify_motion(&mut self, time_msec: u32, sx: f64, sy: f64) {
        match self.seat.pointer_focus {
            Some(surface) => {
                self.send_to_surface(
                    surface,
                    ClientEvent::PointerMotion {
                        surface,
                        time_msec,
                        sx,
                        sy,
                    },
                );
            }
            None => self.seat.dropped_events += 1,
        }
    }

    fn pointer_notify_button(&mut self, time_msec: u32, button: u32, state: ButtonState) {
        match self.seat.pointer_focus {
            Some(surface) => {
                self.send_to_surface(
                    surface,
                    ClientEvent::PointerButton {
                        surface,
                        time_msec,
                        button,
                        state,
                    },
                );
            }
            None => self.seat.dropped_events += 1,
        }
    }

    fn pointer_notify_axis(&mut self, time_msec: u32, event: AxisEvent) {
        match self.seat.pointer_focus {
            Some(surface) => {
                self.send_to_surface(
                    surface,
                    ClientEvent::PointerAxis {
                        surface,
                        time_msec,
                        event,
                    },
                );
            }
            None => self.seat.dropped_events += 1,
        }
    }

    fn pointer_clear_focus(&mut self) {
        if let Some(old) = self.seat.pointer_focus.take() {
            self.send_to_surface(old, ClientEvent::PointerLeave { surface: old });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started_engine(config: SimConfig) -> SimEngine {
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
    fn test_output_requires_started_backend() {
        let mut engine = SimEngine::new(SimConfig::default()).unwrap();
        engine.create_display().unwrap();
        engine.create_backend().unwrap();
        assert!(engine.add_virtual_output(1280, 720).is_err());
    }

    #[test]
    fn test_gles_renderer_needs_hardware() {
        let mut engine = SimEngine::new(SimConfig::default()).unwrap();
        engine.create_display().unwrap();
        engine.create_backend().unwrap();
        assert!(engine.create_renderer(RendererKind::Gles2).is_err());
        assert!(engine.create_renderer(RendererKind::Pixman).is_ok());
    }

    #[test]
    fn test_remove_listener_twice_fails() {
        let mut engine = SimEngine::new(SimConfig::default()).unwrap();
        let id = engine.add_listener(ObjectId::Backend, SignalKind::NewOutput);
        assert!(engine.remove_listener(id).is_ok());
        assert!(matches!(engine.remove_listener(id), Err(EngineError::UnknownListener(_))));
    }

    #[test]
    fn test_event_fd_tracks_queue() {
        let mut engine = started_engine(SimConfig::default());
        engine.add_listener(ObjectId::Backend, SignalKind::NewOutput);
        assert!(!engine.is_readable());

        engine.add_virtual_output(640, 480).unwrap();
        assert!(engine.is_readable());
        assert!(engine.next_signal().is_some());
        assert!(!engine.is_readable());
    }

    #[test]
    fn test_socket_names_unique() {
        let mut a = SimEngine::new(SimConfig::default()).unwrap();
        let mut b = SimEngine::new(SimConfig::default()).unwrap();
        a.create_display().unwrap();
        b.create_display().unwrap();
        let name_a = a.add_socket_auto().unwrap();
        let name_b = b.add_socket_auto().unwrap();
        assert_ne!(name_a, name_b);
        assert_eq!(a.add_socket_auto().unwrap(), name_a);
    }

    #[test]
    fn test_scene_output_without_content() {
        let mut engine = started_engine(SimConfig::default());
        let output = engine.add_virtual_output(64, 32).unwrap();
        assert!(engine.output_init_render(output));
        let mode = OutputMode { width: 64, height: 32, refresh_mhz: 60000 };
        assert!(engine.output_commit_state(output, &OutputState { enabled: true, mode }));
        let so = engine.scene_output_create(output).unwrap();

        assert!(engine.scene_output_commit(so));
        assert!(engine.scene_output_buffer(so).is_none());
    }

    #[test]
    fn test_scene_tree_refused_before_initial_commit() {
        let mut engine = started_engine(SimConfig::default());
        let client = engine.connect_client();
        let toplevel = engine.create_toplevel(client).unwrap();
        assert!(engine.scene_create_toplevel_tree(toplevel).is_none());
        assert_eq!(engine.protocol_errors().len(), 1);

        engine.commit(toplevel);
        assert!(engine.scene_create_toplevel_tree(toplevel).is_some());
    }

    #[test]
    fn test_key_without_focus_is_dropped() {
        let mut engine = started_engine(SimConfig::default());
        engine.keyboard_notify_key(0, 30, KeyState::Pressed);
        engine.pointer_notify_motion(0, 1.0, 1.0);
        assert_eq!(engine.dropped_input_events(), 2);
    }
}
