//! smithay protocol handlers
//!
//! Each handler keeps smithay's bookkeeping going and raises the matching
//! engine signal. Policy (sizes, focus, placement) is left to the core.

use std::sync::OnceLock;

use log::{debug, trace, warn};
use smithay::{
    backend::renderer::utils::{on_commit_buffer_handler, with_renderer_surface_state},
    delegate_compositor, delegate_data_device, delegate_output, delegate_seat, delegate_shm,
    delegate_xdg_decoration, delegate_xdg_shell,
    desktop::{
        find_popup_root_surface, get_popup_toplevel_coords, PopupKeyboardGrab, PopupKind,
        PopupPointerGrab, PopupUngrabStrategy, Window,
    },
    input::{
        pointer::{CursorImageStatus, CursorImageSurfaceData, Focus},
        Seat, SeatHandler, SeatState,
    },
    reexports::{
        wayland_protocols::xdg::{
            decoration::zv1::server::zxdg_toplevel_decoration_v1::Mode as XdgDecorationMode,
            shell::server::xdg_toplevel,
        },
        wayland_server::{
            protocol::{wl_buffer, wl_output::WlOutput, wl_seat, wl_surface::WlSurface},
            Client, Resource,
        },
    },
    utils::{Serial, SERIAL_COUNTER},
    wayland::{
        buffer::BufferHandler,
        compositor::{
            get_parent, is_sync_subsurface, with_states, CompositorClientState, CompositorHandler,
            CompositorState,
        },
        output::OutputHandler,
        selection::{
            data_device::{
                set_data_device_focus, ClientDndGrabHandler, DataDeviceHandler, DataDeviceState,
                ServerDndGrabHandler,
            },
            SelectionHandler, SelectionSource, SelectionTarget,
        },
        shell::xdg::{
            decoration::{XdgDecorationHandler, XdgDecorationState},
            PopupSurface, PositionerState, ToplevelSurface, XdgShellHandler, XdgShellState,
            XdgToplevelSurfaceData,
        },
        shm::{ShmHandler, ShmState},
    },
};

use super::state::{ClientState, EngineState, PopupEntry, SurfaceRole, ToplevelEntry};
use crate::engine::{
    DecorationId, ObjectId, PopupId, SelectionSourceId, SignalData, SignalKind, ToplevelId,
};

impl CompositorHandler for EngineState {
    fn compositor_state(&mut self) -> &mut CompositorState {
        let dh = &self.display_handle;
        self.compositor_state
            .get_or_insert_with(|| CompositorState::new::<EngineState>(dh))
    }

    fn client_compositor_state<'a>(&self, client: &'a Client) -> &'a CompositorClientState {
        static DETACHED: OnceLock<CompositorClientState> = OnceLock::new();
        match client.get_data::<ClientState>() {
            Some(data) => &data.compositor_state,
            None => DETACHED.get_or_init(CompositorClientState::default),
        }
    }

    fn new_surface(&mut self, surface: &WlSurface) {
        let id = self.surface_id(surface);
        trace!("New surface {}", id);
    }

    fn commit(&mut self, surface: &WlSurface) {
        on_commit_buffer_handler::<Self>(surface);
        if !is_sync_subsurface(surface) {
            let mut root = surface.clone();
            while let Some(parent) = get_parent(&root) {
                root = parent;
            }
            if let Some(entry) = self.toplevel_for(&root).and_then(|id| self.toplevels.get(&id)) {
                entry.window.on_commit();
            }
        }

        self.popup_manager.commit(surface);
        if let Some(PopupKind::Xdg(xdg)) = self.popup_manager.find_popup(surface) {
            if !xdg.is_initial_configure_sent() {
                if let Err(e) = xdg.send_configure() {
                    warn!("Initial popup configure failed: {:?}", e);
                }
            }
        }

        if let Some(toplevel) = self.toplevel_for(surface) {
            self.toplevel_committed(toplevel, surface);
        }
    }

    fn destroyed(&mut self, surface: &WlSurface) {
        self.forget_surface(surface);
    }
}

impl EngineState {
    /// Raise initial, map, unmap and content commits of a toplevel surface
    fn toplevel_committed(&mut self, toplevel: ToplevelId, surface: &WlSurface) {
        let has_buffer = with_renderer_surface_state(surface, |s| s.buffer().is_some()).unwrap_or(false);
        let Some(entry) = self.toplevels.get_mut(&toplevel) else {
            return;
        };
        let source = ObjectId::Surface(entry.surface_id);

        if !entry.initial_committed {
            entry.initial_committed = true;
            self.signals
                .raise(source, SignalKind::SurfaceCommit, SignalData::Commit { initial: true });
            return;
        }

        // A null-buffer commit resets the role; the client starts over
        let configure_sent = with_states(surface, |states| {
            states
                .data_map
                .get::<XdgToplevelSurfaceData>()
                .and_then(|d| d.lock().ok().map(|d| d.initial_configure_sent))
                .unwrap_or(true)
        });
        if !configure_sent {
            entry.surface.send_configure();
        }

        if has_buffer && !entry.mapped {
            entry.mapped = true;
            self.signals.raise(source, SignalKind::SurfaceMap, SignalData::None);
        } else if !has_buffer && entry.mapped {
            entry.mapped = false;
            self.signals.raise(source, SignalKind::SurfaceUnmap, SignalData::None);
        }
        self.signals
            .raise(source, SignalKind::SurfaceCommit, SignalData::Commit { initial: false });
    }

    fn unconstrain_popup(&self, popup: &PopupSurface) {
        let Ok(root) = find_popup_root_surface(&PopupKind::Xdg(popup.clone())) else {
            return;
        };
        let Some(window) = self
            .toplevel_for(&root)
            .and_then(|id| self.toplevels.get(&id))
            .map(|t| &t.window)
        else {
            return;
        };
        let Some(output_geo) = self.space.outputs().next().and_then(|o| self.space.output_geometry(o)) else {
            return;
        };
        let Some(window_geo) = self.space.element_geometry(window) else {
            return;
        };

        let mut target = output_geo;
        target.loc -= get_popup_toplevel_coords(&PopupKind::Xdg(popup.clone()));
        target.loc -= window_geo.loc;

        popup.with_pending_state(|state| {
            state.geometry = state.positioner.get_unconstrained_geometry(target);
        });
    }

    fn toplevel_signal(&mut self, surface: &ToplevelSurface, kind: SignalKind, data: SignalData) {
        match self.toplevel_for(surface.wl_surface()) {
            Some(id) => self.signals.raise(ObjectId::Toplevel(id), kind, data),
            None => debug!("{:?} for an unknown toplevel", kind),
        }
    }
}

impl BufferHandler for EngineState {
    fn buffer_destroyed(&mut self, _buffer: &wl_buffer::WlBuffer) {}
}

impl ShmHandler for EngineState {
    fn shm_state(&self) -> &ShmState {
        &self.shm_state
    }
}

delegate_compositor!(EngineState);
delegate_shm!(EngineState);

impl XdgShellHandler for EngineState {
    fn xdg_shell_state(&mut self) -> &mut XdgShellState {
        let dh = &self.display_handle;
        self.xdg_shell_state
            .get_or_insert_with(|| XdgShellState::new::<EngineState>(dh))
    }

    fn new_toplevel(&mut self, surface: ToplevelSurface) {
        let surface_id = self.surface_id(surface.wl_surface());
        let id = ToplevelId(self.next_object_id());
        self.roles.insert(surface_id, SurfaceRole::Toplevel(id));
        self.toplevels.insert(
            id,
            ToplevelEntry {
                surface_id,
                window: Window::new_wayland_window(surface.clone()),
                surface,
                initial_committed: false,
                mapped: false,
                scheduled: None,
                tree: None,
            },
        );
        debug!("New toplevel {} on {}", id, surface_id);
        self.signals
            .raise(ObjectId::XdgShell, SignalKind::NewToplevel, SignalData::Toplevel(id));
    }

    fn new_popup(&mut self, surface: PopupSurface, _positioner: PositionerState) {
        self.unconstrain_popup(&surface);
        let surface_id = self.surface_id(surface.wl_surface());
        let parent = surface.get_parent_surface().map(|p| self.surface_id(&p));
        let id = PopupId(self.next_object_id());
        self.roles.insert(surface_id, SurfaceRole::Popup(id));
        self.popups.insert(
            id,
            PopupEntry {
                surface_id,
                surface: surface.clone(),
                parent,
                tree: None,
            },
        );
        if let Err(e) = self.popup_manager.track_popup(PopupKind::Xdg(surface)) {
            warn!("Failed to track popup {}: {:?}", id, e);
        }
        self.signals
            .raise(ObjectId::XdgShell, SignalKind::NewPopup, SignalData::Popup(id));
    }

    fn reposition_request(&mut self, surface: PopupSurface, positioner: PositionerState, token: u32) {
        surface.with_pending_state(|state| {
            state.geometry = positioner.get_geometry();
            state.positioner = positioner;
        });
        self.unconstrain_popup(&surface);
        surface.send_repositioned(token);
    }

    fn grab(&mut self, surface: PopupSurface, seat: wl_seat::WlSeat, serial: Serial) {
        let Some(seat) = Seat::<EngineState>::from_resource(&seat) else {
            return;
        };
        let kind = PopupKind::Xdg(surface);
        let Some(root) = find_popup_root_surface(&kind)
            .ok()
            .filter(|root| self.toplevel_for(root).is_some())
        else {
            return;
        };

        let Ok(mut grab) = self.popup_manager.grab_popup(root, kind, &seat, serial) else {
            return;
        };
        if let Some(keyboard) = seat.get_keyboard() {
            if keyboard.is_grabbed()
                && !(keyboard.has_grab(serial) || keyboard.has_grab(grab.previous_serial().unwrap_or(serial)))
            {
                grab.ungrab(PopupUngrabStrategy::All);
                return;
            }
            keyboard.set_focus(self, grab.current_grab(), serial);
            keyboard.set_grab(self, PopupKeyboardGrab::new(&grab), serial);
        }
        if let Some(pointer) = seat.get_pointer() {
            if pointer.is_grabbed()
                && !(pointer.has_grab(serial)
                    || pointer.has_grab(grab.previous_serial().unwrap_or_else(|| grab.serial())))
            {
                grab.ungrab(PopupUngrabStrategy::All);
                return;
            }
            pointer.set_grab(self, PopupPointerGrab::new(&grab), serial, Focus::Keep);
        }
    }

    fn move_request(&mut self, surface: ToplevelSurface, _seat: wl_seat::WlSeat, _serial: Serial) {
        self.toplevel_signal(&surface, SignalKind::RequestMove, SignalData::None);
    }

    fn resize_request(
        &mut self,
        surface: ToplevelSurface,
        _seat: wl_seat::WlSeat,
        _serial: Serial,
        edges: xdg_toplevel::ResizeEdge,
    ) {
        let edges = u32::from(edges);
        self.toplevel_signal(&surface, SignalKind::RequestResize, SignalData::Resize { edges });
    }

    fn maximize_request(&mut self, surface: ToplevelSurface) {
        self.toplevel_signal(&surface, SignalKind::RequestMaximize, SignalData::None);
    }

    fn fullscreen_request(&mut self, surface: ToplevelSurface, _output: Option<WlOutput>) {
        self.toplevel_signal(&surface, SignalKind::RequestFullscreen, SignalData::None);
    }

    fn title_changed(&mut self, surface: ToplevelSurface) {
        self.toplevel_signal(&surface, SignalKind::SetTitle, SignalData::None);
    }

    fn toplevel_destroyed(&mut self, surface: ToplevelSurface) {
        let Some(id) = self.toplevel_for(surface.wl_surface()) else {
            return;
        };
        if let Some(entry) = self.toplevels.remove(&id) {
            self.space.unmap_elem(&entry.window);
            self.roles.insert(entry.surface_id, SurfaceRole::Plain);
        }
        self.drop_scene_nodes_of(super::state::SceneNode::Toplevel(id));
        self.decorations.retain(|_, t| *t != id);
        debug!("Toplevel {} destroyed", id);
        self.signals
            .raise(ObjectId::Toplevel(id), SignalKind::ToplevelDestroy, SignalData::None);
    }

    fn popup_destroyed(&mut self, surface: PopupSurface) {
        let Some(id) = self.popup_for(surface.wl_surface()) else {
            return;
        };
        if let Some(entry) = self.popups.remove(&id) {
            self.roles.insert(entry.surface_id, SurfaceRole::Plain);
        }
        self.drop_scene_nodes_of(super::state::SceneNode::Popup(id));
        self.signals
            .raise(ObjectId::Popup(id), SignalKind::PopupDestroy, SignalData::None);
    }
}

delegate_xdg_shell!(EngineState);

impl XdgDecorationHandler for EngineState {
    fn new_decoration(&mut self, toplevel: ToplevelSurface) {
        let Some(owner) = self.toplevel_for(toplevel.wl_surface()) else {
            return;
        };
        let id = DecorationId(self.next_object_id());
        self.decorations.insert(id, owner);
        self.signals.raise(
            ObjectId::DecorationManager,
            SignalKind::NewDecoration,
            SignalData::Decoration(id),
        );
    }

    fn request_mode(&mut self, toplevel: ToplevelSurface, _mode: XdgDecorationMode) {
        self.keep_decoration_mode(&toplevel);
    }

    fn unset_mode(&mut self, toplevel: ToplevelSurface) {
        self.keep_decoration_mode(&toplevel);
    }
}

impl EngineState {
    /// Client preferences never override the mode the core picked
    fn keep_decoration_mode(&mut self, toplevel: &ToplevelSurface) {
        toplevel.with_pending_state(|state| {
            state.decoration_mode.get_or_insert(XdgDecorationMode::ServerSide);
        });
        if let Some(id) = self.toplevel_for(toplevel.wl_surface()) {
            if self.toplevels.get(&id).is_some_and(|t| t.initial_committed) {
                self.schedule(id);
            }
        }
    }
}

delegate_xdg_decoration!(EngineState);

impl SeatHandler for EngineState {
    type KeyboardFocus = WlSurface;
    type PointerFocus = WlSurface;
    type TouchFocus = WlSurface;

    fn seat_state(&mut self) -> &mut SeatState<EngineState> {
        &mut self.seat_state
    }

    fn cursor_image(&mut self, _seat: &Seat<Self>, image: CursorImageStatus) {
        let data = match image {
            CursorImageStatus::Surface(surface) => {
                let hotspot = with_states(&surface, |states| {
                    states
                        .data_map
                        .get::<CursorImageSurfaceData>()
                        .and_then(|d| d.lock().ok().map(|attrs| attrs.hotspot))
                })
                .unwrap_or_default();
                SignalData::Cursor {
                    surface: Some(self.surface_id(&surface)),
                    hotspot_x: hotspot.x,
                    hotspot_y: hotspot.y,
                }
            }
            CursorImageStatus::Hidden => SignalData::Cursor {
                surface: None,
                hotspot_x: 0,
                hotspot_y: 0,
            },
            // Named cursors are the host's default arrow
            CursorImageStatus::Named(_) => return,
        };
        self.signals.raise(ObjectId::Seat, SignalKind::RequestCursor, data);
    }

    fn focus_changed(&mut self, seat: &Seat<Self>, focused: Option<&WlSurface>) {
        let dh = &self.display_handle;
        let client = focused.and_then(|s| dh.get_client(s.id()).ok());
        set_data_device_focus(dh, seat, client);
    }
}

delegate_seat!(EngineState);

impl SelectionHandler for EngineState {
    type SelectionUserData = ();

    fn new_selection(&mut self, ty: SelectionTarget, source: Option<SelectionSource>, _seat: Seat<Self>) {
        if ty != SelectionTarget::Clipboard {
            return;
        }
        let source = source.map(|s| {
            trace!("Selection offers {:?}", s.mime_types());
            SelectionSourceId(self.next_object_id())
        });
        // smithay has already validated the request serial
        let serial = u32::from(SERIAL_COUNTER.next_serial());
        self.signals.raise(
            ObjectId::Seat,
            SignalKind::RequestSetSelection,
            SignalData::Selection { source, serial },
        );
    }
}

impl DataDeviceHandler for EngineState {
    fn data_device_state(&self) -> &DataDeviceState {
        &self.data_device_state
    }
}

impl ClientDndGrabHandler for EngineState {}
impl ServerDndGrabHandler for EngineState {}

delegate_data_device!(EngineState);

impl OutputHandler for EngineState {}
delegate_output!(EngineState);

/// Decoration manager global, created on demand
pub(super) fn decoration_state(state: &mut EngineState) -> &mut XdgDecorationState {
    let dh = &state.display_handle;
    state
        .xdg_decoration_state
        .get_or_insert_with(|| XdgDecorationState::new::<EngineState>(dh))
}
