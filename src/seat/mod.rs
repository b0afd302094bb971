//! Seat: keyboard and pointer focus
//!
//! Input must be preceded by a focus transfer: keys only go to a surface that
//! received keyboard-enter, motion only to a surface that received
//! pointer-enter. The seat keeps its own view of both foci and only talks to
//! the engine when they actually change.

pub mod keyboard;

use crate::config::{InputConfig, SeatConfig};
use crate::engine::{
    AxisEvent, AxisOrientation, AxisSource, ButtonState, Capabilities, Engine, InputDevice,
    InputDeviceKind, KeyState, Modifiers, ObjectId, SelectionSourceId, SignalKind, SurfaceId,
};
use crate::listeners::ListenerSet;
use crate::view::{ViewId, ViewManager};
use keyboard::{KeyboardState, KeymapError};
use log::{debug, info, trace};
use std::time::Instant;

/// A pointer hit on a view's surface
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewHit {
    pub view: ViewId,
    pub surface: SurfaceId,
    pub sx: f64,
    pub sy: f64,
}

pub struct Seat {
    name: String,
    keyboard: KeyboardState,
    cursor: (f64, f64),
    focused_view: Option<ViewId>,
    keyboard_focus: Option<SurfaceId>,
    pointer_view: Option<ViewId>,
    pointer_focus: Option<SurfaceId>,
    capabilities: Capabilities,
    repeat: (i32, i32),
    scroll_step: f64,
    listeners: ListenerSet,
    initialized: bool,
    start_time: Instant,
    keyboard_enters: u64,
}

impl Seat {
    /// Fails when the configured layout does not compile to a keymap
    pub fn new(seat: &SeatConfig, input: &InputConfig) -> Result<Self, KeymapError> {
        Ok(Self {
            name: seat.name.clone(),
            keyboard: KeyboardState::new(&seat.keymap_layout)?,
            cursor: (0.0, 0.0),
            focused_view: None,
            keyboard_focus: None,
            pointer_view: None,
            pointer_focus: None,
            capabilities: Capabilities::NONE,
            repeat: (seat.repeat_rate, seat.repeat_delay),
            scroll_step: input.scroll_step,
            listeners: ListenerSet::new(),
            initialized: false,
            start_time: Instant::now(),
            keyboard_enters: 0,
        })
    }

    /// Create the protocol seat; clients need keyboard capability from the start
    pub fn init(&mut self, engine: &mut dyn Engine) -> crate::engine::Result<()> {
        engine.create_seat(&self.name, self.keyboard.layout())?;
        self.capabilities = Capabilities::KEYBOARD | Capabilities::POINTER;
        engine.seat_set_capabilities(self.capabilities);

        self.listeners.add(engine, ObjectId::Backend, SignalKind::NewInput);
        self.listeners.add(engine, ObjectId::Seat, SignalKind::RequestCursor);
        self.listeners.add(engine, ObjectId::Seat, SignalKind::RequestSetSelection);

        self.initialized = true;
        info!(
            "Seat {} initialized with keyboard and pointer capabilities (layout {})",
            self.name,
            self.keyboard.layout()
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn now_msec(&self) -> u32 {
        self.start_time.elapsed().as_millis() as u32
    }

    /// Device attachment only widens capabilities; focus is left alone
    pub fn new_input_device(&mut self, engine: &mut dyn Engine, device: &InputDevice) {
        info!("New input device: {} ({:?})", device.name, device.kind);
        match device.kind {
            InputDeviceKind::Keyboard => {
                engine.seat_set_keyboard_repeat(self.repeat.0, self.repeat.1);
                self.capabilities = self.capabilities | Capabilities::KEYBOARD | Capabilities::POINTER;
            }
            InputDeviceKind::Pointer => {
                self.capabilities = self.capabilities | Capabilities::POINTER;
            }
            InputDeviceKind::Touch => return,
        }
        engine.seat_set_capabilities(self.capabilities);
    }

    pub fn request_cursor(&mut self, surface: Option<SurfaceId>, hotspot_x: i32, hotspot_y: i32) {
        // The parent display draws the cursor
        debug!("Cursor request: {:?} hotspot ({}, {})", surface, hotspot_x, hotspot_y);
    }

    pub fn set_selection(&mut self, engine: &mut dyn Engine, source: Option<SelectionSourceId>, serial: u32) {
        trace!("Selection {:?} serial {}", source, serial);
        engine.seat_set_selection(source, serial);
    }

    /// Give keyboard focus to a view, or clear it with `None`
    ///
    /// Returns true when focus moved to a new surface.
    pub fn focus_view(&mut self, engine: &mut dyn Engine, views: &mut ViewManager, view: Option<ViewId>) -> bool {
        let Some((id, toplevel, surface)) = view
            .and_then(|id| views.get(id))
            .filter(|v| v.is_mapped())
            .map(|v| (v.id, v.toplevel, v.surface))
        else {
            self.clear_keyboard_focus(engine, views);
            return false;
        };

        if self.keyboard_focus == Some(surface) {
            return false;
        }

        if let Some(previous) = self.focused_view.take() {
            if let Some(prev) = views.get(previous) {
                engine.toplevel_set_activated(prev.toplevel, false);
            }
        }

        views.raise(engine, id);
        engine.toplevel_set_activated(toplevel, true);
        engine.keyboard_notify_enter(surface, self.keyboard.pressed_keys(), self.keyboard.modifiers());

        self.focused_view = Some(id);
        self.keyboard_focus = Some(surface);
        self.keyboard_enters += 1;
        debug!("Keyboard focus on {}", id);
        true
    }

    fn clear_keyboard_focus(&mut self, engine: &mut dyn Engine, views: &ViewManager) {
        if let Some(previous) = self.focused_view.take() {
            if let Some(prev) = views.get(previous) {
                engine.toplevel_set_activated(prev.toplevel, false);
            }
        }
        if self.keyboard_focus.take().is_some() {
            engine.keyboard_clear_focus();
            debug!("Keyboard focus cleared");
        }
    }

    /// A view is going away: drop any focus still pointing at it
    pub fn view_gone(&mut self, engine: &mut dyn Engine, view: ViewId) {
        if self.focused_view == Some(view) {
            self.focused_view = None;
            if self.keyboard_focus.take().is_some() {
                engine.keyboard_clear_focus();
            }
            debug!("Keyboard focus cleared with {}", view);
        }
        if self.pointer_view == Some(view) {
            self.pointer_view = None;
            if self.pointer_focus.take().is_some() {
                engine.pointer_clear_focus();
            }
        }
    }

    pub fn send_key(&mut self, engine: &mut dyn Engine, code: u32, pressed: bool) -> bool {
        let modifiers_changed = self.keyboard.update_key(code, pressed);
        if self.keyboard_focus.is_none() {
            trace!("Key {} dropped, no keyboard focus", code);
            return false;
        }
        let state = if pressed { KeyState::Pressed } else { KeyState::Released };
        engine.keyboard_notify_key(self.now_msec(), code, state);
        if modifiers_changed {
            engine.keyboard_notify_modifiers(self.keyboard.modifiers());
        }
        true
    }

    pub fn send_modifiers(&mut self, engine: &mut dyn Engine, depressed: u32, latched: u32, locked: u32, group: u32) {
        let mods = Modifiers {
            depressed,
            latched,
            locked,
            group,
        };
        self.keyboard.set_modifiers(mods);
        if self.keyboard_focus.is_some() {
            engine.keyboard_notify_modifiers(mods);
        }
    }

    /// Front-most view surface under a point
    ///
    /// Hits whose tree belongs to no view (cursor planes and the like) are skipped.
    pub fn view_at(&self, engine: &dyn Engine, views: &ViewManager, x: f64, y: f64) -> Option<ViewHit> {
        engine.scene_hits_at(x, y).into_iter().find_map(|hit| {
            let view = views.view_at_tree(hit.tree)?;
            let surface = hit.surface?;
            Some(ViewHit {
                view,
                surface,
                sx: hit.sx,
                sy: hit.sy,
            })
        })
    }

    pub fn send_pointer_motion(&mut self, engine: &mut dyn Engine, views: &ViewManager, x: f64, y: f64) -> bool {
        self.cursor = (x, y);
        match self.view_at(engine, views, x, y) {
            Some(hit) => {
                if self.pointer_focus != Some(hit.surface) {
                    engine.pointer_notify_enter(hit.surface, hit.sx, hit.sy);
                    self.pointer_focus = Some(hit.surface);
                }
                self.pointer_view = Some(hit.view);
                engine.pointer_notify_motion(self.now_msec(), hit.sx, hit.sy);
                true
            }
            None => {
                self.pointer_view = None;
                if self.pointer_focus.take().is_some() {
                    engine.pointer_clear_focus();
                }
                false
            }
        }
    }

    /// Forward a button; a press also focuses the view under the cursor
    pub fn send_pointer_button(&mut self, engine: &mut dyn Engine, views: &mut ViewManager, button: u32, pressed: bool) {
        if self.pointer_focus.is_some() {
            let state = if pressed { ButtonState::Pressed } else { ButtonState::Released };
            engine.pointer_notify_button(self.now_msec(), button, state);
        } else {
            trace!("Button {} dropped, no pointer focus", button);
        }

        if pressed {
            let (x, y) = self.cursor;
            if let Some(hit) = self.view_at(engine, views, x, y) {
                self.focus_view(engine, views, Some(hit.view));
            }
        }
    }

    pub fn send_pointer_axis(&mut self, engine: &mut dyn Engine, horizontal: bool, value: f64) -> bool {
        if self.pointer_focus.is_none() {
            trace!("Axis dropped, no pointer focus");
            return false;
        }
        let event = AxisEvent {
            orientation: if horizontal {
                AxisOrientation::Horizontal
            } else {
                AxisOrientation::Vertical
            },
            delta: value,
            discrete: (value / self.scroll_step).round() as i32,
            source: AxisSource::Wheel,
        };
        engine.pointer_notify_axis(self.now_msec(), event);
        true
    }

    pub fn cursor(&self) -> (f64, f64) {
        self.cursor
    }

    pub fn focused_view(&self) -> Option<ViewId> {
        self.focused_view
    }

    pub fn keyboard_focus(&self) -> Option<SurfaceId> {
        self.keyboard_focus
    }

    pub fn pointer_focus(&self) -> Option<SurfaceId> {
        self.pointer_focus
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn modifiers(&self) -> Modifiers {
        self.keyboard.modifiers()
    }

    pub fn scroll_step(&self) -> f64 {
        self.scroll_step
    }

    /// Number of keyboard focus transfers
    pub fn keyboard_enters(&self) -> u64 {
        self.keyboard_enters
    }

    /// Safe to call more than once
    pub fn finish(&mut self, engine: &mut dyn Engine) {
        if !self.initialized {
            return;
        }
        self.listeners.remove_all(engine);
        self.initialized = false;
        debug!("Seat {} finished", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ClientEvent, SimConfig, SimEngine, RendererKind, SignalData, ToplevelId};
    use crate::view::ViewPolicy;

    struct Fixture {
        engine: SimEngine,
        views: ViewManager,
        seat: Seat,
    }

    impl Fixture {
        fn new() -> Self {
            let mut engine = SimEngine::new(SimConfig::default()).unwrap();
            engine.create_display().unwrap();
            engine.create_backend().unwrap();
            engine.create_renderer(RendererKind::Pixman).unwrap();
            engine.create_scene().unwrap();
            engine.create_compositor_globals().unwrap();
            engine.create_xdg_shell(6).unwrap();
            let mut views = ViewManager::new(ViewPolicy {
                fullscreen: crate::view::FullscreenPolicy::Never,
                ..Default::default()
            });
            views.init(&mut engine);
            let mut seat = Seat::new(&SeatConfig::default(), &InputConfig::default()).unwrap();
            seat.init(&mut engine).unwrap();
            Self { engine, views, seat }
        }

        fn pump(&mut self) {
            while let Some(signal) = self.engine.next_signal() {
                let view = self.views.view_for_source(signal.source);
                match (signal.kind, signal.data, view) {
                    (SignalKind::NewToplevel, SignalData::Toplevel(t), _) => {
                        self.views.handle_new_toplevel(&mut self.engine, t);
                    }
                    (SignalKind::SurfaceCommit, SignalData::Commit { initial }, Some(id)) => {
                        self.views.handle_commit(&mut self.engine, id, initial);
                    }
                    (SignalKind::SurfaceMap, _, Some(id)) => {
                        if self.views.handle_map(&mut self.engine, id) {
                            self.seat.focus_view(&mut self.engine, &mut self.views, Some(id));
                        }
                    }
                    (SignalKind::ToplevelDestroy, _, Some(id)) => {
                        self.seat.view_gone(&mut self.engine, id);
                        self.views.handle_destroy(&mut self.engine, id);
                    }
                    _ => {}
                }
            }
            self.engine.flush_clients();
        }

        /// Mapped 100x100 window at (x, y)
        fn window(&mut self, x: i32, y: i32) -> (ToplevelId, ViewId) {
            let client = self.engine.connect_client();
            let toplevel = self.engine.create_toplevel(client).unwrap();
            self.engine.commit(toplevel);
            self.pump();
            let id = self.views.view_by_surface(self.engine.toplevel_surface(toplevel).unwrap()).unwrap();
            self.views.set_position(&mut self.engine, id, x, y);
            self.engine.commit_sized(toplevel, 100, 100, 0xff80_8080);
            self.pump();
            (toplevel, id)
        }

        fn events(&self, toplevel: ToplevelId) -> Vec<ClientEvent> {
            let client = self.engine.toplevel_client(toplevel).unwrap();
            self.engine.client_events(client).to_vec()
        }
    }

    #[test]
    fn test_one_enter_per_transfer() {
        let mut f = Fixture::new();
        let (a, view_a) = f.window(0, 0);
        assert_eq!(f.seat.focused_view(), Some(view_a));
        assert_eq!(f.seat.keyboard_enters(), 1);

        for code in [30, 31, 32] {
            f.seat.send_key(&mut f.engine, code, true);
            f.seat.send_key(&mut f.engine, code, false);
        }
        // Refocusing the focused view is a no-op
        assert!(!f.seat.focus_view(&mut f.engine, &mut f.views, Some(view_a)));

        let enters = f
            .events(a)
            .iter()
            .filter(|e| matches!(e, ClientEvent::KeyboardEnter { .. }))
            .count();
        assert_eq!(enters, 1);
        let keys = f.events(a).iter().filter(|e| matches!(e, ClientEvent::Key { .. })).count();
        assert_eq!(keys, 6);
    }

    #[test]
    fn test_focus_transfer_deactivates_previous() {
        let mut f = Fixture::new();
        let (a, view_a) = f.window(0, 0);
        let (b, view_b) = f.window(200, 0);
        assert_eq!(f.seat.focused_view(), Some(view_b));

        assert!(f.seat.focus_view(&mut f.engine, &mut f.views, Some(view_a)));
        f.engine.flush_clients();
        assert_eq!(f.engine.keyboard_focus(), f.engine.toplevel_surface(a));
        assert_eq!(f.views.order()[0], view_a);
        assert!(f.engine.toplevel_states(a).unwrap().activated);
        assert!(!f.engine.toplevel_states(b).unwrap().activated);
        assert_eq!(f.seat.keyboard_enters(), 3);
    }

    #[test]
    fn test_enter_precedes_motion() {
        let mut f = Fixture::new();
        let (a, _) = f.window(0, 0);
        let (b, _) = f.window(200, 0);

        assert!(f.seat.send_pointer_motion(&mut f.engine, &f.views, 10.0, 10.0));
        assert!(f.seat.send_pointer_motion(&mut f.engine, &f.views, 20.0, 10.0));
        assert!(f.seat.send_pointer_motion(&mut f.engine, &f.views, 250.0, 10.0));

        let events_b = f.events(b);
        let enter = events_b
            .iter()
            .position(|e| matches!(e, ClientEvent::PointerEnter { .. }))
            .unwrap();
        let motion = events_b
            .iter()
            .position(|e| matches!(e, ClientEvent::PointerMotion { .. }))
            .unwrap();
        assert!(enter < motion);
        assert!(f.events(a).iter().any(|e| matches!(e, ClientEvent::PointerLeave { .. })));
        let enters_a = f
            .events(a)
            .iter()
            .filter(|e| matches!(e, ClientEvent::PointerEnter { .. }))
            .count();
        assert_eq!(enters_a, 1);

        // Empty space clears pointer focus
        assert!(!f.seat.send_pointer_motion(&mut f.engine, &f.views, 500.0, 500.0));
        assert_eq!(f.seat.pointer_focus(), None);
        assert_eq!(f.engine.pointer_focus(), None);
    }

    #[test]
    fn test_cursor_plane_is_not_a_view() {
        let mut f = Fixture::new();
        let (a, _) = f.window(0, 0);
        f.engine.add_cursor_plane(0, 0, 16, 16).unwrap();

        assert!(f.seat.send_pointer_motion(&mut f.engine, &f.views, 5.0, 5.0));
        assert_eq!(f.seat.pointer_focus(), f.engine.toplevel_surface(a));
    }

    #[test]
    fn test_axis_uses_scroll_step() {
        let mut f = Fixture::new();
        let (a, _) = f.window(0, 0);
        assert!(!f.seat.send_pointer_axis(&mut f.engine, false, 15.0));

        f.seat.send_pointer_motion(&mut f.engine, &f.views, 10.0, 10.0);
        assert!(f.seat.send_pointer_axis(&mut f.engine, true, -30.0));
        let axis = f.events(a).into_iter().find_map(|e| match e {
            ClientEvent::PointerAxis { event, .. } => Some(event),
            _ => None,
        });
        let axis = axis.unwrap();
        assert_eq!(axis.orientation, AxisOrientation::Horizontal);
        assert_eq!(axis.discrete, -2);
        assert_eq!(axis.source, AxisSource::Wheel);
    }

    #[test]
    fn test_modifier_changes_are_forwarded() {
        let mut f = Fixture::new();
        let (a, _) = f.window(0, 0);
        f.seat.send_key(&mut f.engine, 42, true);
        f.seat.send_key(&mut f.engine, 30, true);
        let modifier_events = f
            .events(a)
            .iter()
            .filter(|e| matches!(e, ClientEvent::Modifiers { .. }))
            .count();
        // One with the enter, one for shift
        assert_eq!(modifier_events, 2);

        f.seat.send_modifiers(&mut f.engine, 0, 0, 2, 0);
        assert_eq!(f.seat.modifiers().locked, 2);
    }

    #[test]
    fn test_input_device_widens_capabilities() {
        let mut f = Fixture::new();
        let (_, view_a) = f.window(0, 0);
        let device = InputDevice {
            id: crate::engine::InputDeviceId(99),
            kind: InputDeviceKind::Keyboard,
            name: "virtual keyboard".to_string(),
        };
        f.seat.new_input_device(&mut f.engine, &device);
        assert!(f.seat.capabilities().contains(Capabilities::KEYBOARD | Capabilities::POINTER));
        assert_eq!(f.engine.keyboard_repeat(), (25, 600));
        assert_eq!(f.seat.focused_view(), Some(view_a));
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut f = Fixture::new();
        let before = f.engine.listener_count();
        f.seat.finish(&mut f.engine);
        assert_eq!(f.engine.listener_count(), before - 3);
        f.seat.finish(&mut f.engine);
        assert_eq!(f.engine.listener_count(), before - 3);
        assert!(!f.seat.is_initialized());
    }
}
