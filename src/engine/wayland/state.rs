//! Protocol state of the smithay engine

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use smithay::{
    desktop::{PopupManager, Space, Window},
    input::{
        keyboard::KeyboardHandle,
        pointer::PointerHandle,
        Seat, SeatState,
    },
    output::Output,
    reexports::{
        calloop::{LoopHandle, RegistrationToken},
        wayland_server::{
            backend::{ClientData, ClientId as WlClientId, DisconnectReason, GlobalId, ObjectId as WlObjectId},
            protocol::wl_surface::WlSurface,
            DisplayHandle, Resource,
        },
    },
    utils::{Logical, Point},
    wayland::{
        compositor::{CompositorClientState, CompositorState},
        output::OutputManagerState,
        selection::data_device::DataDeviceState,
        shell::xdg::{
            decoration::XdgDecorationState, PopupSurface, ToplevelSurface, XdgShellState,
        },
        shm::ShmState,
    },
};

use super::render::SceneOutput;
use crate::engine::{
    DecorationId, NodeId, OutputId, OutputState, PopupId, SceneOutputId, SelectionSourceId,
    SignalQueue, SurfaceId, ToplevelId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SurfaceRole {
    Toplevel(ToplevelId),
    Popup(PopupId),
    /// Cursor images, subsurfaces and anything without an xdg role yet
    Plain,
}

pub(super) struct ToplevelEntry {
    pub surface_id: SurfaceId,
    pub surface: ToplevelSurface,
    pub window: Window,
    /// The client's initial commit arrived
    pub initial_committed: bool,
    pub mapped: bool,
    /// Configure serial waiting for the next flush
    pub scheduled: Option<u32>,
    pub tree: Option<NodeId>,
}

pub(super) struct PopupEntry {
    pub surface_id: SurfaceId,
    pub surface: PopupSurface,
    pub parent: Option<SurfaceId>,
    pub tree: Option<NodeId>,
}

pub(super) struct OutputEntry {
    pub output: Output,
    pub global: GlobalId,
    pub render_ready: bool,
    pub state: Option<OutputState>,
    pub frame_timer: Option<RegistrationToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SceneNode {
    Toplevel(ToplevelId),
    Popup(PopupId),
}

/// Everything the smithay handlers and the `Engine` operations share
pub struct EngineState {
    pub(super) display_handle: DisplayHandle,
    pub(super) loop_handle: LoopHandle<'static, EngineState>,
    pub(super) start_time: Instant,
    pub(super) signals: SignalQueue,

    pub(super) compositor_state: Option<CompositorState>,
    pub(super) shm_state: ShmState,
    pub(super) data_device_state: DataDeviceState,
    pub(super) output_manager_state: Option<OutputManagerState>,
    pub(super) xdg_shell_state: Option<XdgShellState>,
    pub(super) xdg_decoration_state: Option<XdgDecorationState>,
    pub(super) seat_state: SeatState<EngineState>,
    pub(super) seat: Option<Seat<EngineState>>,

    pub(super) space: Space<Window>,
    pub(super) popup_manager: PopupManager,

    next_id: u32,
    pub(super) next_serial: u32,
    pub(super) surfaces: HashMap<SurfaceId, WlSurface>,
    pub(super) surface_ids: HashMap<WlObjectId, SurfaceId>,
    pub(super) roles: HashMap<SurfaceId, SurfaceRole>,
    pub(super) toplevels: BTreeMap<ToplevelId, ToplevelEntry>,
    pub(super) popups: HashMap<PopupId, PopupEntry>,
    pub(super) decorations: HashMap<DecorationId, ToplevelId>,
    pub(super) nodes: HashMap<NodeId, SceneNode>,
    pub(super) outputs: BTreeMap<OutputId, OutputEntry>,
    pub(super) scene_outputs: HashMap<SceneOutputId, SceneOutput>,
    pub(super) selection: Option<(Option<SelectionSourceId>, u32)>,

    pub(super) pointer_focus: Option<WlSurface>,
    pub(super) pointer_location: Point<f64, Logical>,
}

impl EngineState {
    pub(super) fn new(display_handle: DisplayHandle, loop_handle: LoopHandle<'static, EngineState>, signals: SignalQueue) -> Self {
        let shm_state = ShmState::new::<Self>(&display_handle, vec![]);
        let data_device_state = DataDeviceState::new::<Self>(&display_handle);

        Self {
            display_handle,
            loop_handle,
            start_time: Instant::now(),
            signals,
            compositor_state: None,
            shm_state,
            data_device_state,
            output_manager_state: None,
            xdg_shell_state: None,
            xdg_decoration_state: None,
            seat_state: SeatState::new(),
            seat: None,
            space: Space::default(),
            popup_manager: PopupManager::default(),
            next_id: 1,
            next_serial: 1,
            surfaces: HashMap::new(),
            surface_ids: HashMap::new(),
            roles: HashMap::new(),
            toplevels: BTreeMap::new(),
            popups: HashMap::new(),
            decorations: HashMap::new(),
            nodes: HashMap::new(),
            outputs: BTreeMap::new(),
            scene_outputs: HashMap::new(),
            selection: None,
            pointer_focus: None,
            pointer_location: (0.0, 0.0).into(),
        }
    }

    pub(super) fn next_object_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Id of a protocol surface, assigned on first sight
    pub(super) fn surface_id(&mut self, surface: &WlSurface) -> SurfaceId {
        if let Some(id) = self.surface_ids.get(&surface.id()) {
            return *id;
        }
        let id = SurfaceId(self.next_object_id());
        self.surface_ids.insert(surface.id(), id);
        self.surfaces.insert(id, surface.clone());
        self.roles.insert(id, SurfaceRole::Plain);
        id
    }

    pub(super) fn known_surface_id(&self, surface: &WlSurface) -> Option<SurfaceId> {
        self.surface_ids.get(&surface.id()).copied()
    }

    pub(super) fn forget_surface(&mut self, surface: &WlSurface) {
        if let Some(id) = self.surface_ids.remove(&surface.id()) {
            self.surfaces.remove(&id);
            self.roles.remove(&id);
        }
        if self.pointer_focus.as_ref() == Some(surface) {
            self.pointer_focus = None;
        }
    }

    pub(super) fn toplevel_for(&self, surface: &WlSurface) -> Option<ToplevelId> {
        match self.roles.get(&self.known_surface_id(surface)?)? {
            SurfaceRole::Toplevel(id) => Some(*id),
            _ => None,
        }
    }

    pub(super) fn popup_for(&self, surface: &WlSurface) -> Option<PopupId> {
        match self.roles.get(&self.known_surface_id(surface)?)? {
            SurfaceRole::Popup(id) => Some(*id),
            _ => None,
        }
    }

    pub(super) fn keyboard(&self) -> Option<KeyboardHandle<EngineState>> {
        self.seat.as_ref().and_then(|s| s.get_keyboard())
    }

    pub(super) fn pointer(&self) -> Option<PointerHandle<EngineState>> {
        self.seat.as_ref().and_then(|s| s.get_pointer())
    }

    /// Serial of the configure that will carry pending toplevel changes
    pub(super) fn schedule(&mut self, toplevel: ToplevelId) -> u32 {
        let Some(entry) = self.toplevels.get_mut(&toplevel) else {
            return 0;
        };
        if let Some(serial) = entry.scheduled {
            return serial;
        }
        let serial = self.next_serial;
        self.next_serial += 1;
        entry.scheduled = Some(serial);
        serial
    }

    /// Toplevel whose role is set up far enough to take configures
    pub(super) fn configurable(&self, toplevel: ToplevelId) -> Option<&ToplevelSurface> {
        let entry = self.toplevels.get(&toplevel)?;
        if !entry.initial_committed {
            warn!("{} configured before its initial commit", toplevel);
            return None;
        }
        Some(&entry.surface)
    }

    /// Send every scheduled configure
    pub(super) fn send_scheduled_configures(&mut self) {
        for (id, entry) in self.toplevels.iter_mut() {
            if let Some(serial) = entry.scheduled.take() {
                let sent = entry.surface.send_configure();
                debug!("Configure {} for {} sent as {:?}", serial, id, sent);
            }
        }
    }

    pub(super) fn drop_scene_nodes_of(&mut self, target: SceneNode) {
        self.nodes.retain(|_, node| *node != target);
    }
}

#[derive(Default)]
pub struct ClientState {
    pub compositor_state: CompositorClientState,
}

impl ClientData for ClientState {
    fn initialized(&self, client_id: WlClientId) {
        debug!("Client {:?} connected", client_id);
    }

    fn disconnected(&self, client_id: WlClientId, reason: DisconnectReason) {
        debug!("Client {:?} disconnected: {:?}", client_id, reason);
    }
}

/// Client data attached when a connection is accepted
pub(super) fn new_client_data() -> Arc<ClientState> {
    Arc::new(ClientState::default())
}
