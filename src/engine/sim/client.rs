//! Simulated protocol clients
//!
//! Drives the simulated engine the way a real client would drive a display
//! server: create toplevels, commit, acknowledge configures, attach buffers.
//! Everything the server sends back is appended to a per-client event log.

use super::{SimEngine, PopupState, SurfaceRole, SurfaceState, ToplevelState};
use crate::engine::{
    AxisEvent, ButtonState, ClientId, DecorationId, DecorationMode, InputDevice, InputDeviceId,
    InputDeviceKind, KeyState, Modifiers, NodeId, ObjectId, OutputId, OutputMode, OutputState,
    PixelBuffer, PixelFormat, PopupId, Rect, SelectionSourceId, SignalData, SignalKind, SurfaceId,
    ToplevelId,
};
use log::{debug, warn};

/// Toplevel state flags carried by a configure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ToplevelStates {
    pub activated: bool,
    pub fullscreen: bool,
    pub maximized: bool,
    pub resizing: bool,
}

/// Event received by a simulated client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Configure {
        toplevel: ToplevelId,
        serial: u32,
        width: i32,
        height: i32,
        states: ToplevelStates,
    },
    Close {
        toplevel: ToplevelId,
    },
    DecorationMode {
        toplevel: ToplevelId,
        mode: DecorationMode,
    },
    KeyboardEnter {
        surface: SurfaceId,
        keys: Vec<u32>,
        modifiers: Modifiers,
    },
    KeyboardLeave {
        surface: SurfaceId,
    },
    Key {
        surface: SurfaceId,
        time_msec: u32,
        key: u32,
        state: KeyState,
    },
    Modifiers {
        surface: SurfaceId,
        modifiers: Modifiers,
    },
    PointerEnter {
        surface: SurfaceId,
        sx: f64,
        sy: f64,
    },
    PointerLeave {
        surface: SurfaceId,
    },
    PointerMotion {
        surface: SurfaceId,
        time_msec: u32,
        sx: f64,
        sy: f64,
    },
    PointerButton {
        surface: SurfaceId,
        time_msec: u32,
        button: u32,
        state: ButtonState,
    },
    PointerAxis {
        surface: SurfaceId,
        time_msec: u32,
        event: AxisEvent,
    },
    FrameDone {
        surface: SurfaceId,
        time_msec: u32,
    },
}

/// Size a client picks when the configure leaves it up to the client
const CLIENT_DEFAULT_SIZE: (i32, i32) = (640, 480);

impl SimEngine {
    pub fn connect_client(&mut self) -> ClientId {
        let id = ClientId(self.next_object_id());
        self.clients.insert(id, Default::default());
        debug!("Client {} connected", id);
        id
    }

    /// Abrupt client exit: toplevels are destroyed without a prior unmap
    pub fn disconnect_client(&mut self, client: ClientId) {
        let toplevels: Vec<ToplevelId> = self
            .toplevels
            .iter()
            .filter(|(_, t)| t.client == client)
            .map(|(id, _)| *id)
            .collect();
        for toplevel in toplevels {
            self.destroy_toplevel_object(toplevel);
        }

        let popups: Vec<PopupId> = self
            .popups
            .iter()
            .filter(|(_, p)| p.client == client)
            .map(|(id, _)| *id)
            .collect();
        for popup in popups {
            self.destroy_popup_object(popup);
        }

        self.clients.remove(&client);
        debug!("Client {} disconnected", client);
    }

    pub fn create_toplevel(&mut self, client: ClientId) -> Option<ToplevelId> {
        if !self.clients.contains_key(&client) {
            warn!("create_toplevel: unknown client {}", client);
            return None;
        }
        let surface = SurfaceId(self.next_object_id());
        let toplevel = ToplevelId(self.next_object_id());
        self.surfaces.insert(
            surface,
            SurfaceState {
                client,
                role: SurfaceRole::Toplevel(toplevel),
                pending_buffer: None,
                buffer: None,
            },
        );
        self.toplevels.insert(toplevel, ToplevelState::new(client, surface));
        self.emit(ObjectId::XdgShell, SignalKind::NewToplevel, SignalData::Toplevel(toplevel));
        Some(toplevel)
    }

    pub fn set_title(&mut self, toplevel: ToplevelId, title: &str) {
        if let Some(state) = self.toplevels.get_mut(&toplevel) {
            state.title = Some(title.to_string());
            self.emit(ObjectId::Toplevel(toplevel), SignalKind::SetTitle, SignalData::None);
        }
    }

    /// Window geometry applied on the next commit
    pub fn set_window_geometry(&mut self, toplevel: ToplevelId, geometry: Rect) {
        if let Some(state) = self.toplevels.get_mut(&toplevel) {
            state.pending_geometry = Some(geometry);
        }
    }

    /// Attach a buffer (or `None` to detach) for the next commit
    pub fn attach_buffer(&mut self, toplevel: ToplevelId, buffer: Option<PixelBuffer>) {
        let Some(surface) = self.toplevels.get(&toplevel).map(|t| t.surface) else {
            return;
        };
        if let Some(state) = self.surfaces.get_mut(&surface) {
            state.pending_buffer = Some(buffer);
        }
    }

    /// Acknowledge a configure the server sent
    pub fn ack_configure(&mut self, toplevel: ToplevelId, serial: u32) -> bool {
        let Some(state) = self.toplevels.get_mut(&toplevel) else {
            return false;
        };
        match state.last_sent {
            Some(sent) if serial <= sent && serial > 0 => {
                state.acked = Some(serial);
                true
            }
            _ => {
                self.protocol_errors
                    .push(format!("{} acked unknown configure {}", toplevel, serial));
                false
            }
        }
    }

    /// Commit the toplevel's surface state
    pub fn commit(&mut self, toplevel: ToplevelId) {
        let Some(state) = self.toplevels.get_mut(&toplevel) else {
            return;
        };
        let surface = state.surface;

        if !state.initialized {
            state.initialized = true;
            if let Some(s) = self.surfaces.get_mut(&surface) {
                if let Some(Some(_)) = s.pending_buffer.take() {
                    self.protocol_errors
                        .push(format!("{} attached a buffer before the initial configure", toplevel));
                }
            }
            self.emit(
                ObjectId::Surface(surface),
                SignalKind::SurfaceCommit,
                SignalData::Commit { initial: true },
            );
            return;
        }

        if let Some(geometry) = state.pending_geometry.take() {
            state.geometry = Some(geometry);
        }
        let acked = state.acked.is_some();
        let was_mapped = state.mapped;

        let Some(s) = self.surfaces.get_mut(&surface) else {
            return;
        };
        if let Some(pending) = s.pending_buffer.take() {
            s.buffer = pending;
        }
        let has_buffer = s.buffer.is_some();

        if !was_mapped && has_buffer {
            if !acked {
                s.buffer = None;
                self.protocol_errors
                    .push(format!("{} committed a buffer before acking a configure", toplevel));
                return;
            }
            if let Some(t) = self.toplevels.get_mut(&toplevel) {
                t.mapped = true;
            }
            self.emit(ObjectId::Surface(surface), SignalKind::SurfaceMap, SignalData::None);
        } else if was_mapped && !has_buffer {
            if let Some(t) = self.toplevels.get_mut(&toplevel) {
                t.mapped = false;
            }
            self.emit(ObjectId::Surface(surface), SignalKind::SurfaceUnmap, SignalData::None);
        }

        self.emit(
            ObjectId::Surface(surface),
            SignalKind::SurfaceCommit,
            SignalData::Commit { initial: false },
        );
    }

    /// Latest configure received for a toplevel: (serial, width, height, states)
    pub fn latest_configure(&self, toplevel: ToplevelId) -> Option<(u32, i32, i32, ToplevelStates)> {
        let client = self.toplevels.get(&toplevel)?.client;
        self.clients.get(&client)?.events.iter().rev().find_map(|event| match event {
            ClientEvent::Configure {
                toplevel: t,
                serial,
                width,
                height,
                states,
            } if *t == toplevel => Some((*serial, *width, *height, *states)),
            _ => None,
        })
    }

    /// Ack the latest configure and commit a buffer of the configured size
    pub fn map_toplevel(&mut self, toplevel: ToplevelId, argb: u32) -> bool {
        let Some((serial, width, height, _)) = self.latest_configure(toplevel) else {
            return false;
        };
        let width = if width > 0 { width } else { CLIENT_DEFAULT_SIZE.0 };
        let height = if height > 0 { height } else { CLIENT_DEFAULT_SIZE.1 };
        self.ack_configure(toplevel, serial);
        self.attach_buffer(
            toplevel,
            Some(PixelBuffer::solid(width as u32, height as u32, argb, PixelFormat::Argb8888)),
        );
        self.commit(toplevel);
        self.toplevels.get(&toplevel).map(|t| t.mapped).unwrap_or(false)
    }

    /// Ack the latest configure and commit a buffer of an explicit size
    pub fn commit_sized(&mut self, toplevel: ToplevelId, width: u32, height: u32, argb: u32) {
        if let Some((serial, ..)) = self.latest_configure(toplevel) {
            self.ack_configure(toplevel, serial);
        }
        self.attach_buffer(toplevel, Some(PixelBuffer::solid(width, height, argb, PixelFormat::Argb8888)));
        self.commit(toplevel);
    }

    pub fn unmap_toplevel(&mut self, toplevel: ToplevelId) {
        self.attach_buffer(toplevel, None);
        self.commit(toplevel);
    }

    /// Graceful destroy: unmapped first when still mapped
    pub fn destroy_toplevel(&mut self, toplevel: ToplevelId) {
        let Some(state) = self.toplevels.get(&toplevel) else {
            return;
        };
        if state.mapped {
            let surface = state.surface;
            if let Some(t) = self.toplevels.get_mut(&toplevel) {
                t.mapped = false;
            }
            self.emit(ObjectId::Surface(surface), SignalKind::SurfaceUnmap, SignalData::None);
        }
        self.destroy_toplevel_object(toplevel);
    }

    pub fn request_move(&mut self, toplevel: ToplevelId) {
        self.emit(ObjectId::Toplevel(toplevel), SignalKind::RequestMove, SignalData::None);
    }

    pub fn request_resize(&mut self, toplevel: ToplevelId, edges: u32) {
        self.emit(
            ObjectId::Toplevel(toplevel),
            SignalKind::RequestResize,
            SignalData::Resize { edges },
        );
    }

    pub fn request_maximize(&mut self, toplevel: ToplevelId) {
        self.emit(ObjectId::Toplevel(toplevel), SignalKind::RequestMaximize, SignalData::None);
    }

    pub fn request_fullscreen(&mut self, toplevel: ToplevelId) {
        self.emit(ObjectId::Toplevel(toplevel), SignalKind::RequestFullscreen, SignalData::None);
    }

    /// Client asks for a decoration object on a toplevel
    pub fn create_decoration(&mut self, toplevel: ToplevelId) -> Option<DecorationId> {
        if !self.toplevels.contains_key(&toplevel) {
            return None;
        }
        let id = DecorationId(self.next_object_id());
        self.decorations.insert(id, toplevel);
        self.emit(
            ObjectId::DecorationManager,
            SignalKind::NewDecoration,
            SignalData::Decoration(id),
        );
        Some(id)
    }

    /// Popup with an already committed buffer, placed relative to its parent
    pub fn create_popup(
        &mut self,
        parent: ToplevelId,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        argb: u32,
    ) -> Option<PopupId> {
        let (client, parent_surface) = {
            let p = self.toplevels.get(&parent)?;
            (p.client, p.surface)
        };
        let surface = SurfaceId(self.next_object_id());
        let popup = PopupId(self.next_object_id());
        self.surfaces.insert(
            surface,
            SurfaceState {
                client,
                role: SurfaceRole::Popup(popup),
                pending_buffer: None,
                buffer: Some(PixelBuffer::solid(width, height, argb, PixelFormat::Argb8888)),
            },
        );
        self.popups.insert(
            popup,
            PopupState {
                client,
                surface,
                parent: parent_surface,
                x,
                y,
            },
        );
        self.emit(ObjectId::XdgShell, SignalKind::NewPopup, SignalData::Popup(popup));
        Some(popup)
    }

    /// Client destroys a popup
    pub fn destroy_popup(&mut self, popup: PopupId) {
        self.destroy_popup_object(popup);
    }

    pub fn popup_surface(&self, popup: PopupId) -> Option<SurfaceId> {
        self.popups.get(&popup).map(|p| p.surface)
    }

    pub fn add_input_device(&mut self, kind: InputDeviceKind, name: &str) -> InputDeviceId {
        let device = InputDevice {
            id: InputDeviceId(self.next_object_id()),
            kind,
            name: name.to_string(),
        };
        let id = device.id;
        self.input_devices.push(device.clone());
        self.emit(ObjectId::Backend, SignalKind::NewInput, SignalData::InputDevice(device));
        id
    }

    /// Emit the frame signal of an output, as a display refresh would
    pub fn schedule_frame(&mut self, output: OutputId) {
        if self.outputs.contains_key(&output) {
            self.emit(ObjectId::Output(output), SignalKind::OutputFrame, SignalData::None);
        }
    }

    pub fn schedule_frame_all(&mut self) {
        let outputs: Vec<OutputId> = self.outputs.keys().copied().collect();
        for output in outputs {
            self.schedule_frame(output);
        }
    }

    /// Backend asks for a new output mode (e.g. the host window resized)
    pub fn request_output_mode(&mut self, output: OutputId, mode: OutputMode) {
        self.emit(
            ObjectId::Output(output),
            SignalKind::OutputRequestState,
            SignalData::OutputState(OutputState { enabled: true, mode }),
        );
    }

    pub fn remove_output(&mut self, output: OutputId) {
        if self.outputs.remove(&output).is_none() {
            return;
        }
        self.scene_outputs.retain(|_, so| so.output != output);
        self.emit(ObjectId::Output(output), SignalKind::OutputDestroy, SignalData::None);
    }

    pub fn request_set_cursor(&mut self, surface: Option<SurfaceId>, hotspot_x: i32, hotspot_y: i32) {
        self.emit(
            ObjectId::Seat,
            SignalKind::RequestCursor,
            SignalData::Cursor {
                surface,
                hotspot_x,
                hotspot_y,
            },
        );
    }

    pub fn offer_selection(&mut self, serial: u32) -> SelectionSourceId {
        let source = SelectionSourceId(self.next_object_id());
        self.emit(
            ObjectId::Seat,
            SignalKind::RequestSetSelection,
            SignalData::Selection {
                source: Some(source),
                serial,
            },
        );
        source
    }

    /// Solid rectangle above all windows, e.g. a software cursor
    pub fn add_cursor_plane(&mut self, x: i32, y: i32, width: u32, height: u32) -> Option<NodeId> {
        let root = self.scene.root();
        let node = self.scene.create_rect(root, width, height, 0xffff_ffff)?;
        self.scene.set_position(node, x, y);
        Some(node)
    }

    // Inspection

    pub fn client_events(&self, client: ClientId) -> &[ClientEvent] {
        self.clients.get(&client).map(|c| c.events.as_slice()).unwrap_or(&[])
    }

    pub fn take_client_events(&mut self, client: ClientId) -> Vec<ClientEvent> {
        self.clients
            .get_mut(&client)
            .map(|c| std::mem::take(&mut c.events))
            .unwrap_or_default()
    }

    pub fn configure_count(&self, toplevel: ToplevelId) -> usize {
        let Some(client) = self.toplevels.get(&toplevel).map(|t| t.client) else {
            return 0;
        };
        self.client_events(client)
            .iter()
            .filter(|e| matches!(e, ClientEvent::Configure { toplevel: t, .. } if *t == toplevel))
            .count()
    }

    pub fn toplevel_client(&self, toplevel: ToplevelId) -> Option<ClientId> {
        self.toplevels.get(&toplevel).map(|t| t.client)
    }

    pub fn toplevel_states(&self, toplevel: ToplevelId) -> Option<ToplevelStates> {
        self.toplevels.get(&toplevel).map(|t| t.pending.states)
    }

    pub fn is_toplevel_mapped(&self, toplevel: ToplevelId) -> bool {
        self.toplevels.get(&toplevel).map(|t| t.mapped).unwrap_or(false)
    }

    pub fn seat_name(&self) -> Option<&str> {
        self.seat.name.as_deref()
    }

    pub fn has_decoration_manager(&self) -> bool {
        self.decoration_manager
    }

    pub fn keyboard_focus(&self) -> Option<SurfaceId> {
        self.seat.keyboard_focus
    }

    pub fn pointer_focus(&self) -> Option<SurfaceId> {
        self.seat.pointer_focus
    }

    pub fn capabilities(&self) -> crate::engine::Capabilities {
        self.seat.capabilities
    }

    pub fn keyboard_repeat(&self) -> (i32, i32) {
        self.seat.repeat
    }

    pub fn selection(&self) -> Option<(Option<SelectionSourceId>, u32)> {
        self.seat.selection
    }

    pub fn decoration_mode(&self, toplevel: ToplevelId) -> Option<DecorationMode> {
        self.toplevels.get(&toplevel).and_then(|t| t.decoration_mode)
    }

    /// Input events the seat had nowhere to deliver
    pub fn dropped_input_events(&self) -> u64 {
        self.seat.dropped_events
    }

    pub fn protocol_errors(&self) -> &[String] {
        &self.protocol_errors
    }

    pub fn listener_count(&self) -> usize {
        self.signals.listener_count()
    }

    pub fn pending_signals(&self) -> usize {
        self.signals.pending()
    }

    pub fn outputs(&self) -> Vec<OutputId> {
        self.outputs.keys().copied().collect()
    }

    pub fn output_current_state(&self, output: OutputId) -> Option<OutputState> {
        self.outputs.get(&output).and_then(|o| o.state)
    }

    pub fn scene(&self) -> &crate::engine::sim::scene::SceneGraph {
        &self.scene
    }

    pub fn frame_done_count(&self) -> u64 {
        self.frame_done_count
    }

    pub fn socket_name(&self) -> Option<&str> {
        self.socket.as_deref()
    }

    pub fn input_devices(&self) -> &[InputDevice] {
        &self.input_devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, Signal};

    fn engine_with_shell() -> SimEngine {
        let mut engine = SimEngine::new(Default::default()).unwrap();
        engine.create_display().unwrap();
        engine
    }

    fn drain(engine: &mut SimEngine) -> Vec<Signal> {
        std::iter::from_fn(|| engine.next_signal()).collect()
    }

    #[test]
    fn test_unheard_signals_are_skipped() {
        let mut engine = engine_with_shell();
        let client = engine.connect_client();
        engine.create_toplevel(client).unwrap();
        assert_eq!(engine.pending_signals(), 1);
        assert!(drain(&mut engine).is_empty());

        engine.add_listener(ObjectId::XdgShell, SignalKind::NewToplevel);
        let toplevel = engine.create_toplevel(client).unwrap();
        let signals = drain(&mut engine);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].data, SignalData::Toplevel(toplevel));
    }

    #[test]
    fn test_commit_before_listener_is_delivered() {
        let mut engine = engine_with_shell();
        engine.add_listener(ObjectId::XdgShell, SignalKind::NewToplevel);
        let client = engine.connect_client();
        let toplevel = engine.create_toplevel(client).unwrap();
        engine.commit(toplevel);

        // Subscribing while handling the creation, as the view layer does
        let first = engine.next_signal().unwrap();
        assert_eq!(first.kind, SignalKind::NewToplevel);
        let surface = engine.toplevel_surface(toplevel).unwrap();
        engine.add_listener(ObjectId::Surface(surface), SignalKind::SurfaceCommit);

        let signals = drain(&mut engine);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].data, SignalData::Commit { initial: true });
    }

    #[test]
    fn test_destroy_popup_signals_once() {
        let mut engine = engine_with_shell();
        let client = engine.connect_client();
        let toplevel = engine.create_toplevel(client).unwrap();
        let popup = engine.create_popup(toplevel, 4, 4, 10, 10, 0xff00_ff00).unwrap();
        engine.add_listener(ObjectId::Popup(popup), SignalKind::PopupDestroy);

        engine.destroy_popup(popup);
        engine.destroy_popup(popup);
        let kinds: Vec<SignalKind> = drain(&mut engine).iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SignalKind::PopupDestroy]);
        assert!(engine.popup_surface(popup).is_none());
    }

    #[test]
    fn test_map_sequence() {
        let mut engine = engine_with_shell();
        let client = engine.connect_client();
        let toplevel = engine.create_toplevel(client).unwrap();
        let surface = engine.toplevel_surface(toplevel).unwrap();
        engine.add_listener(ObjectId::Surface(surface), SignalKind::SurfaceMap);
        engine.add_listener(ObjectId::Surface(surface), SignalKind::SurfaceCommit);

        engine.commit(toplevel);
        let signals = drain(&mut engine);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].data, SignalData::Commit { initial: true });

        engine.toplevel_set_size(toplevel, 320, 200);
        engine.flush_clients();
        assert_eq!(engine.configure_count(toplevel), 1);

        assert!(engine.map_toplevel(toplevel, 0xff00_00ff));
        let kinds: Vec<SignalKind> = drain(&mut engine).iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SignalKind::SurfaceMap, SignalKind::SurfaceCommit]);
        assert_eq!(engine.surface_size(surface), (320, 200));
    }

    #[test]
    fn test_buffer_before_ack_is_rejected() {
        let mut engine = engine_with_shell();
        let client = engine.connect_client();
        let toplevel = engine.create_toplevel(client).unwrap();
        engine.commit(toplevel);

        engine.attach_buffer(toplevel, Some(PixelBuffer::solid(4, 4, 0, PixelFormat::Argb8888)));
        engine.commit(toplevel);

        assert!(!engine.is_toplevel_mapped(toplevel));
        assert_eq!(engine.protocol_errors().len(), 1);
    }

    #[test]
    fn test_configures_coalesce_until_flush() {
        let mut engine = engine_with_shell();
        let client = engine.connect_client();
        let toplevel = engine.create_toplevel(client).unwrap();
        engine.commit(toplevel);

        let a = engine.toplevel_set_size(toplevel, 100, 100);
        let b = engine.toplevel_set_fullscreen(toplevel, true);
        assert_eq!(a, b);
        engine.flush_clients();
        engine.flush_clients();

        assert_eq!(engine.configure_count(toplevel), 1);
        let (serial, w, h, states) = engine.latest_configure(toplevel).unwrap();
        assert_eq!((serial, w, h), (a, 100, 100));
        assert!(states.fullscreen);
    }

    #[test]
    fn test_disconnect_skips_unmap() {
        let mut engine = engine_with_shell();
        let client = engine.connect_client();
        let toplevel = engine.create_toplevel(client).unwrap();
        let surface = engine.toplevel_surface(toplevel).unwrap();
        engine.commit(toplevel);
        engine.toplevel_schedule_configure(toplevel);
        engine.flush_clients();
        engine.map_toplevel(toplevel, 0xffff_ffff);

        engine.add_listener(ObjectId::Surface(surface), SignalKind::SurfaceUnmap);
        engine.add_listener(ObjectId::Toplevel(toplevel), SignalKind::ToplevelDestroy);
        engine.disconnect_client(client);

        let kinds: Vec<SignalKind> = drain(&mut engine).iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SignalKind::ToplevelDestroy]);
        assert!(engine.toplevel_surface(toplevel).is_none());
    }
}
