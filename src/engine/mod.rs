//! Protocol/scene-graph engine boundary
//!
//! The compositor core never talks to the wire protocol or the renderer
//! directly. Everything it needs from the engine is expressed by the
//! [`Engine`] trait: signals delivered through listeners, plus a set of
//! operations on outputs, scene nodes, toplevels and the seat.
//!
//! [`WaylandEngine`] implements the trait on smithay. The `sim` module holds
//! an in-process stand-in with scripted clients for tests and benches.

pub mod format;
pub mod signals;
pub mod wayland;

#[cfg(any(test, feature = "test-fixture"))]
pub mod sim;

pub use format::PixelFormat;
pub use signals::SignalQueue;
pub use wayland::{WaylandConfig, WaylandEngine};

#[cfg(any(test, feature = "test-fixture"))]
pub use sim::{ClientEvent, PixelBuffer, SimConfig, SimEngine, ToplevelStates};

use std::fmt;
use std::ops::BitOr;
use std::os::fd::BorrowedFd;
use std::time::Duration;

macro_rules! engine_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

engine_id!(
    /// Connected protocol client
    ClientId
);
engine_id!(
    /// Protocol surface
    SurfaceId
);
engine_id!(
    /// xdg toplevel role object
    ToplevelId
);
engine_id!(
    /// xdg popup role object
    PopupId
);
engine_id!(
    /// Backend output
    OutputId
);
engine_id!(
    /// Scene-graph node
    NodeId
);
engine_id!(
    /// Binding of the scene graph to one output
    SceneOutputId
);
engine_id!(
    /// Subscription to one signal of one object
    ListenerId
);
engine_id!(
    /// Input device attached to the backend
    InputDeviceId
);
engine_id!(
    /// Decoration negotiation object of one toplevel
    DecorationId
);
engine_id!(
    /// Clipboard data source offered by a client
    SelectionSourceId
);

/// Object emitting a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectId {
    Backend,
    XdgShell,
    DecorationManager,
    Seat,
    Output(OutputId),
    Surface(SurfaceId),
    Toplevel(ToplevelId),
    Popup(PopupId),
}

/// Signal kinds delivered by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    NewOutput,
    NewInput,
    NewToplevel,
    NewPopup,
    NewDecoration,
    OutputFrame,
    OutputRequestState,
    OutputDestroy,
    SurfaceMap,
    SurfaceUnmap,
    SurfaceCommit,
    ToplevelDestroy,
    PopupDestroy,
    RequestMove,
    RequestResize,
    RequestMaximize,
    RequestFullscreen,
    SetTitle,
    RequestCursor,
    RequestSetSelection,
}

/// Payload attached to a signal
#[derive(Debug, Clone, PartialEq)]
pub enum SignalData {
    None,
    Output(OutputId),
    Toplevel(ToplevelId),
    Popup(PopupId),
    Decoration(DecorationId),
    InputDevice(InputDevice),
    Commit { initial: bool },
    OutputState(OutputState),
    Resize { edges: u32 },
    Cursor { surface: Option<SurfaceId>, hotspot_x: i32, hotspot_y: i32 },
    Selection { source: Option<SelectionSourceId>, serial: u32 },
}

/// One delivery of a signal to one listener
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub listener: ListenerId,
    pub source: ObjectId,
    pub kind: SignalKind,
    pub data: SignalData,
}

/// Output video mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputMode {
    pub width: u32,
    pub height: u32,
    /// Refresh rate in mHz
    pub refresh_mhz: i32,
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{}.{:03}Hz",
            self.width,
            self.height,
            self.refresh_mhz / 1000,
            self.refresh_mhz % 1000
        )
    }
}

/// Output state committed atomically
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputState {
    pub enabled: bool,
    pub mode: OutputMode,
}

/// Axis-aligned rectangle in layout or surface coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x as f64
            && y >= self.y as f64
            && x < (self.x + self.width) as f64
            && y < (self.y + self.height) as f64
    }
}

/// Renderer implementation requested from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererKind {
    /// CPU rasterizer
    Pixman,
    /// GPU renderer with buffer sharing
    Gles2,
}

/// Seat capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    pub const POINTER: Capabilities = Capabilities(1);
    pub const KEYBOARD: Capabilities = Capabilities(2);
    pub const TOUCH: Capabilities = Capabilities(4);

    pub fn contains(&self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

/// Serialized keyboard modifier state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modifiers {
    pub depressed: u32,
    pub latched: u32,
    pub locked: u32,
    pub group: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Released,
    Pressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    Released,
    Pressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisOrientation {
    Vertical,
    Horizontal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisSource {
    Wheel,
    Finger,
    Continuous,
}

/// Scroll event forwarded to the pointer focus
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisEvent {
    pub orientation: AxisOrientation,
    pub delta: f64,
    pub discrete: i32,
    pub source: AxisSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecorationMode {
    ClientSide,
    ServerSide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDeviceKind {
    Keyboard,
    Pointer,
    Touch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDevice {
    pub id: InputDeviceId,
    pub kind: InputDeviceKind,
    pub name: String,
}

/// CPU-visible pixels of a buffer
#[derive(Debug, Clone, Copy)]
pub struct PixelData<'a> {
    pub data: &'a [u8],
    pub stride: u32,
    pub format: PixelFormat,
}

/// Buffer-sharing handle of a buffer
#[derive(Debug, Clone, Copy)]
pub struct DmabufAttributes<'a> {
    pub fd: BorrowedFd<'a>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub offset: u32,
    pub format: PixelFormat,
}

/// Borrowed view of a buffer owned by the engine
///
/// A buffer exposes CPU pixels, a sharing handle, or both.
#[derive(Debug, Clone, Copy)]
pub struct BufferRef<'a> {
    pub width: u32,
    pub height: u32,
    pub pixels: Option<PixelData<'a>>,
    pub dmabuf: Option<DmabufAttributes<'a>>,
}

/// Result of a spatial scene query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneHit {
    /// Node that was hit
    pub node: NodeId,
    /// Top-level tree containing the node
    pub tree: NodeId,
    /// Surface drawn by the node, if any
    pub surface: Option<SurfaceId>,
    /// Surface-local coordinates
    pub sx: f64,
    pub sy: f64,
}

/// Engine errors
#[derive(Debug)]
pub enum EngineError {
    /// Display object missing or already destroyed
    DisplayUnavailable,
    /// Listener is not registered (double removal)
    UnknownListener(ListenerId),
    /// Backend creation or start failed
    Backend(String),
    /// Renderer creation failed
    Renderer(String),
    /// Allocator creation failed
    Allocator(String),
    /// Global or subsystem creation failed
    Subsystem(String),
    /// Operation violates protocol ordering
    Protocol(String),
    /// Socket allocation failed
    Socket(String),
    /// OS error
    Io(std::io::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::DisplayUnavailable => write!(f, "Display is not available"),
            EngineError::UnknownListener(id) => write!(f, "Unknown listener {}", id),
            EngineError::Backend(msg) => write!(f, "Backend error: {}", msg),
            EngineError::Renderer(msg) => write!(f, "Renderer error: {}", msg),
            EngineError::Allocator(msg) => write!(f, "Allocator error: {}", msg),
            EngineError::Subsystem(msg) => write!(f, "Subsystem error: {}", msg),
            EngineError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            EngineError::Socket(msg) => write!(f, "Socket error: {}", msg),
            EngineError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Operations the compositor core needs from the protocol/scene-graph engine
///
/// Signals are pulled with [`Engine::next_signal`]. A signal reaches the
/// listeners registered for its object when it is pulled, not when it was
/// raised. Configure-style operations return the serial of the configure
/// that will carry the change.
pub trait Engine {
    // Display and event loop

    fn create_display(&mut self) -> Result<()>;
    fn destroy_display(&mut self);
    fn add_socket_auto(&mut self) -> Result<String>;
    /// Readiness descriptor; readable while client requests, timers or signals are pending
    fn event_fd(&self) -> Option<BorrowedFd<'_>>;
    /// Read client requests and fire due timers without blocking
    fn dispatch_pending(&mut self);
    fn next_signal(&mut self) -> Option<Signal>;
    fn flush_clients(&mut self);

    // Listeners

    fn add_listener(&mut self, source: ObjectId, kind: SignalKind) -> ListenerId;
    fn remove_listener(&mut self, listener: ListenerId) -> Result<()>;

    // Backend, renderer and globals

    fn create_backend(&mut self) -> Result<()>;
    fn destroy_backend(&mut self);
    fn hardware_available(&self) -> bool;
    fn create_renderer(&mut self, kind: RendererKind) -> Result<()>;
    fn create_allocator(&mut self) -> Result<()>;
    fn create_scene(&mut self) -> Result<()>;
    fn create_compositor_globals(&mut self) -> Result<()>;
    fn create_xdg_shell(&mut self, version: u32) -> Result<()>;
    fn create_decoration_manager(&mut self) -> Result<()>;
    /// Seat with keyboard and pointer; the keymap is compiled from `keymap_layout`
    fn create_seat(&mut self, name: &str, keymap_layout: &str) -> Result<()>;
    fn start_backend(&mut self) -> Result<()>;
    fn add_virtual_output(&mut self, width: u32, height: u32) -> Result<OutputId>;
    /// Keyboard device fed by the host's synthesized key events
    fn add_virtual_keyboard(&mut self, name: &str) -> Result<InputDeviceId>;

    // Outputs

    fn output_name(&self, output: OutputId) -> Option<String>;
    fn output_init_render(&mut self, output: OutputId) -> bool;
    fn output_preferred_mode(&self, output: OutputId) -> Option<OutputMode>;
    fn output_commit_state(&mut self, output: OutputId, state: &OutputState) -> bool;
    fn scene_output_create(&mut self, output: OutputId) -> Option<SceneOutputId>;
    fn scene_output_destroy(&mut self, scene_output: SceneOutputId);
    fn scene_output_commit(&mut self, scene_output: SceneOutputId) -> bool;
    fn scene_output_send_frame_done(&mut self, scene_output: SceneOutputId, now: Duration);
    /// Buffer last presented on the output, if any content was ever committed
    fn scene_output_buffer(&self, scene_output: SceneOutputId) -> Option<BufferRef<'_>>;

    // Scene graph

    fn scene_create_toplevel_tree(&mut self, toplevel: ToplevelId) -> Option<NodeId>;
    fn scene_create_popup_tree(&mut self, popup: PopupId, parent: NodeId) -> Option<NodeId>;
    fn scene_node_set_position(&mut self, node: NodeId, x: i32, y: i32);
    fn scene_node_raise_to_top(&mut self, node: NodeId);
    fn scene_node_destroy(&mut self, node: NodeId);
    /// Hits at a layout point, front-most first
    fn scene_hits_at(&self, x: f64, y: f64) -> Vec<SceneHit>;

    // Toplevels and surfaces

    fn toplevel_surface(&self, toplevel: ToplevelId) -> Option<SurfaceId>;
    fn toplevel_from_surface(&self, surface: SurfaceId) -> Option<ToplevelId>;
    fn toplevel_title(&self, toplevel: ToplevelId) -> Option<String>;
    fn toplevel_geometry(&self, toplevel: ToplevelId) -> Rect;
    fn toplevel_set_size(&mut self, toplevel: ToplevelId, width: i32, height: i32) -> u32;
    fn toplevel_set_fullscreen(&mut self, toplevel: ToplevelId, fullscreen: bool) -> u32;
    fn toplevel_set_activated(&mut self, toplevel: ToplevelId, activated: bool) -> u32;
    fn toplevel_schedule_configure(&mut self, toplevel: ToplevelId) -> u32;
    fn toplevel_send_close(&mut self, toplevel: ToplevelId);
    fn surface_size(&self, surface: SurfaceId) -> (i32, i32);
    /// Run `f` on the surface's committed buffer; false when it has none
    fn with_surface_buffer(&self, surface: SurfaceId, f: &mut dyn FnMut(BufferRef<'_>)) -> bool;
    fn popup_parent(&self, popup: PopupId) -> Option<SurfaceId>;
    fn decoration_set_mode(&mut self, decoration: DecorationId, mode: DecorationMode);

    // Seat

    fn seat_set_capabilities(&mut self, caps: Capabilities);
    fn seat_set_keyboard_repeat(&mut self, rate: i32, delay: i32);
    fn seat_set_selection(&mut self, source: Option<SelectionSourceId>, serial: u32);
    fn keyboard_notify_enter(&mut self, surface: SurfaceId, pressed: &[u32], mods: Modifiers);
    fn keyboard_notify_key(&mut self, time_msec: u32, key: u32, state: KeyState);
    fn keyboard_notify_modifiers(&mut self, mods: Modifiers);
    fn keyboard_clear_focus(&mut self);
    fn pointer_notify_enter(&mut self, surface: SurfaceId, sx: f64, sy: f64);
    fn pointer_notify_motion(&mut self, time_msec: u32, sx: f64, sy: f64);
    fn pointer_notify_button(&mut self, time_msec: u32, button: u32, state: ButtonState);
    fn pointer_notify_axis(&mut self, time_msec: u32, event: AxisEvent);
    fn pointer_clear_focus(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities() {
        let caps = Capabilities::KEYBOARD | Capabilities::POINTER;
        assert!(caps.contains(Capabilities::KEYBOARD));
        assert!(caps.contains(Capabilities::POINTER));
        assert!(!caps.contains(Capabilities::TOUCH));
        assert_eq!(caps.bits(), 3);
    }

    #[test]
    fn test_rect_contains() {
        let rect = Rect::new(50, 50, 640, 480);
        assert!(rect.contains(50.0, 50.0));
        assert!(rect.contains(689.5, 529.5));
        assert!(!rect.contains(690.0, 100.0));
        assert!(!rect.contains(49.9, 100.0));
        assert!(Rect::default().is_empty());
    }

    #[test]
    fn test_mode_display() {
        let mode = OutputMode { width: 1280, height: 720, refresh_mhz: 60000 };
        assert_eq!(mode.to_string(), "1280x720@60.000Hz");
    }
}
