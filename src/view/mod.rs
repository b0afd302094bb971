//! Toplevel view lifecycle
//!
//! One `View` per client toplevel. The manager keeps the live views in focus
//! order (front first) plus side tables from engine handles back to views,
//! so signals and scene hits resolve without walking the scene graph.

use crate::engine::{
    DecorationId, DecorationMode, Engine, ListenerId, NodeId, ObjectId, PopupId, Rect, SignalKind,
    SurfaceId, ToplevelId,
};
use crate::listeners::ListenerSet;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Stable handle of a view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub u32);

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    /// Waiting for the client's initial commit
    Created,
    /// Initial configure sent
    Configured,
    Mapped,
    Unmapped,
    Destroyed,
}

impl fmt::Display for ViewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViewState::Created => "created",
            ViewState::Configured => "configured",
            ViewState::Mapped => "mapped",
            ViewState::Unmapped => "unmapped",
            ViewState::Destroyed => "destroyed",
        };
        write!(f, "{}", s)
    }
}

/// Whether configures force the fullscreen state on clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FullscreenPolicy {
    #[default]
    Always,
    Never,
}

impl FullscreenPolicy {
    pub fn fullscreen(&self) -> bool {
        matches!(self, FullscreenPolicy::Always)
    }
}

/// Placement and sizing applied to new views
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewPolicy {
    pub default_x: i32,
    pub default_y: i32,
    pub initial_width: i32,
    pub initial_height: i32,
    pub fullscreen: FullscreenPolicy,
}

impl Default for ViewPolicy {
    fn default() -> Self {
        Self {
            default_x: 50,
            default_y: 50,
            initial_width: 640,
            initial_height: 480,
            fullscreen: FullscreenPolicy::Always,
        }
    }
}

#[derive(Debug)]
pub struct View {
    pub id: ViewId,
    pub toplevel: ToplevelId,
    pub surface: SurfaceId,
    pub x: i32,
    pub y: i32,
    state: ViewState,
    pending_configure: bool,
    configure_serial: u32,
    tree: Option<NodeId>,
    title: Option<String>,
    listeners: ListenerSet,
}

impl View {
    pub fn state(&self) -> ViewState {
        self.state
    }

    pub fn is_mapped(&self) -> bool {
        self.state == ViewState::Mapped
    }

    /// Scene subtree; present only while mapped
    pub fn tree(&self) -> Option<NodeId> {
        self.tree
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn pending_configure(&self) -> bool {
        self.pending_configure
    }

    pub fn configure_serial(&self) -> u32 {
        self.configure_serial
    }

    pub fn listeners_active(&self) -> bool {
        self.listeners.is_active()
    }
}

/// What a surface commit meant for a view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// First commit answered with the initial configure
    Configured(u32),
    /// Content of a mapped view changed
    FrameCommitted,
    Ignored,
}

/// Popup placed under a mapped view
struct PopupSlot {
    parent: NodeId,
    tree: NodeId,
    on_destroy: Option<ListenerId>,
}

#[derive(Default)]
pub struct ViewManager {
    views: HashMap<ViewId, View>,
    /// Live views, most recently focused first
    order: Vec<ViewId>,
    by_toplevel: HashMap<ToplevelId, ViewId>,
    by_surface: HashMap<SurfaceId, ViewId>,
    by_tree: HashMap<NodeId, ViewId>,
    popups: HashMap<PopupId, PopupSlot>,
    listeners: ListenerSet,
    policy: ViewPolicy,
    next_id: u32,
}

impl ViewManager {
    pub fn new(policy: ViewPolicy) -> Self {
        Self {
            policy,
            next_id: 1,
            ..Default::default()
        }
    }

    pub fn policy(&self) -> &ViewPolicy {
        &self.policy
    }

    /// Subscribe to new toplevels, popups and decoration requests
    pub fn init(&mut self, engine: &mut dyn Engine) {
        self.listeners.add(engine, ObjectId::XdgShell, SignalKind::NewToplevel);
        self.listeners.add(engine, ObjectId::XdgShell, SignalKind::NewPopup);
        self.listeners.add(engine, ObjectId::DecorationManager, SignalKind::NewDecoration);
    }

    pub fn handle_new_toplevel(&mut self, engine: &mut dyn Engine, toplevel: ToplevelId) -> Option<ViewId> {
        if self.by_toplevel.contains_key(&toplevel) {
            return self.by_toplevel.get(&toplevel).copied();
        }
        let Some(surface) = engine.toplevel_surface(toplevel) else {
            warn!("New toplevel {} has no surface", toplevel);
            return None;
        };

        let id = ViewId(self.next_id);
        self.next_id += 1;

        let mut listeners = ListenerSet::new();
        let surface_source = ObjectId::Surface(surface);
        let toplevel_source = ObjectId::Toplevel(toplevel);
        for kind in [SignalKind::SurfaceMap, SignalKind::SurfaceUnmap, SignalKind::SurfaceCommit] {
            listeners.add(engine, surface_source, kind);
        }
        for kind in [
            SignalKind::ToplevelDestroy,
            SignalKind::RequestMove,
            SignalKind::RequestResize,
            SignalKind::RequestMaximize,
            SignalKind::RequestFullscreen,
            SignalKind::SetTitle,
        ] {
            listeners.add(engine, toplevel_source, kind);
        }

        let title = engine.toplevel_title(toplevel);
        debug!(
            "New toplevel {} as {}: {}",
            toplevel,
            id,
            title.as_deref().unwrap_or("(untitled)")
        );

        self.views.insert(
            id,
            View {
                id,
                toplevel,
                surface,
                x: self.policy.default_x,
                y: self.policy.default_y,
                state: ViewState::Created,
                pending_configure: false,
                configure_serial: 0,
                tree: None,
                title,
                listeners,
            },
        );
        self.order.insert(0, id);
        self.by_toplevel.insert(toplevel, id);
        self.by_surface.insert(surface, id);
        Some(id)
    }

    /// View owning a per-view signal source
    pub fn view_for_source(&self, source: ObjectId) -> Option<ViewId> {
        match source {
            ObjectId::Surface(surface) => self.by_surface.get(&surface).copied(),
            ObjectId::Toplevel(toplevel) => self.by_toplevel.get(&toplevel).copied(),
            _ => None,
        }
    }

    pub fn handle_commit(&mut self, engine: &mut dyn Engine, id: ViewId, initial: bool) -> CommitOutcome {
        let Some(view) = self.views.get_mut(&id) else {
            return CommitOutcome::Ignored;
        };

        if initial && view.state == ViewState::Created {
            let policy = self.policy;
            engine.toplevel_set_size(view.toplevel, policy.initial_width, policy.initial_height);
            let serial = engine.toplevel_set_fullscreen(view.toplevel, policy.fullscreen.fullscreen());
            view.pending_configure = true;
            view.configure_serial = serial;
            view.state = ViewState::Configured;
            debug!(
                "Initial configure {} for {} ({}x{}, fullscreen {})",
                serial,
                id,
                policy.initial_width,
                policy.initial_height,
                policy.fullscreen.fullscreen()
            );
            return CommitOutcome::Configured(serial);
        }

        if view.is_mapped() {
            trace!("Frame committed on {}", id);
            CommitOutcome::FrameCommitted
        } else {
            CommitOutcome::Ignored
        }
    }

    /// Attach the scene subtree; the caller focuses and announces the view
    pub fn handle_map(&mut self, engine: &mut dyn Engine, id: ViewId) -> bool {
        let Some(view) = self.views.get_mut(&id) else {
            return false;
        };
        if view.is_mapped() {
            return false;
        }
        let Some(tree) = engine.scene_create_toplevel_tree(view.toplevel) else {
            warn!("Failed to create scene tree for {}", id);
            return false;
        };
        engine.scene_node_set_position(tree, view.x, view.y);
        view.tree = Some(tree);
        view.state = ViewState::Mapped;
        view.pending_configure = false;
        self.by_tree.insert(tree, id);
        info!("{} mapped: {}", id, view.title.as_deref().unwrap_or("(untitled)"));
        true
    }

    /// Detach the scene subtree; returns false when the view was not mapped
    pub fn handle_unmap(&mut self, engine: &mut dyn Engine, id: ViewId) -> bool {
        let Some(view) = self.views.get_mut(&id) else {
            return false;
        };
        if !view.is_mapped() {
            return false;
        }
        view.state = ViewState::Unmapped;
        if let Some(tree) = view.tree.take() {
            self.by_tree.remove(&tree);
            self.drop_popups_under(engine, tree);
            engine.scene_node_destroy(tree);
        }
        info!("{} unmapped", id);
        true
    }

    /// Drop the view; listener teardown runs at most once
    pub fn handle_destroy(&mut self, engine: &mut dyn Engine, id: ViewId) -> Option<View> {
        let mut view = self.views.remove(&id)?;
        self.order.retain(|v| *v != id);
        self.by_toplevel.remove(&view.toplevel);
        self.by_surface.remove(&view.surface);
        if let Some(tree) = view.tree.take() {
            self.by_tree.remove(&tree);
            self.drop_popups_under(engine, tree);
        }
        view.listeners.remove_all(engine);
        view.state = ViewState::Destroyed;
        debug!("{} destroyed", id);
        Some(view)
    }

    /// Move, resize, maximize and fullscreen requests only get a fresh configure
    pub fn handle_request(&mut self, engine: &mut dyn Engine, id: ViewId, kind: SignalKind) {
        let Some(view) = self.views.get(&id) else {
            return;
        };
        debug!("{:?} requested by {}", kind, id);
        if view.state == ViewState::Created {
            return;
        }
        engine.toplevel_schedule_configure(view.toplevel);
    }

    pub fn handle_set_title(&mut self, engine: &mut dyn Engine, id: ViewId) {
        if let Some(view) = self.views.get_mut(&id) {
            view.title = engine.toplevel_title(view.toplevel);
            debug!("{} title: {}", id, view.title.as_deref().unwrap_or("(null)"));
        }
    }

    /// Place a popup's subtree under its parent view
    pub fn handle_new_popup(&mut self, engine: &mut dyn Engine, popup: PopupId) -> bool {
        let Some(parent) = engine.popup_parent(popup) else {
            warn!("Popup {} has no parent surface", popup);
            return false;
        };
        let Some(parent_tree) = self
            .by_surface
            .get(&parent)
            .and_then(|id| self.views.get(id))
            .and_then(|v| v.tree)
        else {
            debug!("Popup {} parent {} has no scene tree", popup, parent);
            return false;
        };
        let Some(tree) = engine.scene_create_popup_tree(popup, parent_tree) else {
            return false;
        };
        let on_destroy = Some(engine.add_listener(ObjectId::Popup(popup), SignalKind::PopupDestroy));
        self.popups.insert(
            popup,
            PopupSlot {
                parent: parent_tree,
                tree,
                on_destroy,
            },
        );
        true
    }

    /// Forget a destroyed popup; returns false for popups never placed
    pub fn handle_popup_destroy(&mut self, engine: &mut dyn Engine, popup: PopupId) -> bool {
        let Some(slot) = self.popups.remove(&popup) else {
            return false;
        };
        Self::release_popup(engine, slot);
        debug!("Popup {} destroyed", popup);
        true
    }

    pub fn popup_count(&self) -> usize {
        self.popups.len()
    }

    fn drop_popups_under(&mut self, engine: &mut dyn Engine, parent: NodeId) {
        let doomed: Vec<PopupId> = self
            .popups
            .iter()
            .filter(|(_, slot)| slot.parent == parent)
            .map(|(id, _)| *id)
            .collect();
        for popup in doomed {
            if let Some(slot) = self.popups.remove(&popup) {
                Self::release_popup(engine, slot);
            }
        }
    }

    fn release_popup(engine: &mut dyn Engine, slot: PopupSlot) {
        if let Some(listener) = slot.on_destroy {
            if let Err(e) = engine.remove_listener(listener) {
                trace!("Popup listener already gone: {}", e);
            }
        }
        engine.scene_node_destroy(slot.tree);
    }

    /// Decorations are always server-side, i.e. drawn by nobody
    pub fn handle_new_decoration(&mut self, engine: &mut dyn Engine, decoration: DecorationId) {
        debug!("Decoration {} set to server-side", decoration);
        engine.decoration_set_mode(decoration, DecorationMode::ServerSide);
    }

    /// Host-requested size; non-positive sizes are ignored
    pub fn request_size(&mut self, engine: &mut dyn Engine, id: ViewId, width: i32, height: i32) -> bool {
        if width <= 0 || height <= 0 {
            return false;
        }
        let Some(view) = self.views.get_mut(&id) else {
            return false;
        };
        if view.state == ViewState::Created {
            return false;
        }
        engine.toplevel_set_size(view.toplevel, width, height);
        let serial = engine.toplevel_set_fullscreen(view.toplevel, self.policy.fullscreen.fullscreen());
        view.pending_configure = true;
        view.configure_serial = serial;
        true
    }

    pub fn close(&mut self, engine: &mut dyn Engine, id: ViewId) -> bool {
        match self.views.get(&id) {
            Some(view) => {
                engine.toplevel_send_close(view.toplevel);
                true
            }
            None => false,
        }
    }

    pub fn set_position(&mut self, engine: &mut dyn Engine, id: ViewId, x: i32, y: i32) -> bool {
        let Some(view) = self.views.get_mut(&id) else {
            return false;
        };
        view.x = x;
        view.y = y;
        if let Some(tree) = view.tree {
            engine.scene_node_set_position(tree, x, y);
        }
        true
    }

    /// Raise the view's node and move it to the front of the list
    pub fn raise(&mut self, engine: &mut dyn Engine, id: ViewId) {
        let Some(view) = self.views.get(&id) else {
            return;
        };
        if let Some(tree) = view.tree {
            engine.scene_node_raise_to_top(tree);
        }
        self.order.retain(|v| *v != id);
        self.order.insert(0, id);
    }

    /// Window geometry, falling back to the committed surface size
    pub fn geometry(&self, engine: &dyn Engine, id: ViewId) -> Option<Rect> {
        let view = self.views.get(&id)?;
        let geometry = engine.toplevel_geometry(view.toplevel);
        if !geometry.is_empty() {
            return Some(geometry);
        }
        let (width, height) = engine.surface_size(view.surface);
        Some(Rect::new(0, 0, width, height))
    }

    pub fn get(&self, id: ViewId) -> Option<&View> {
        self.views.get(&id)
    }

    pub fn view_at_tree(&self, tree: NodeId) -> Option<ViewId> {
        self.by_tree.get(&tree).copied()
    }

    pub fn view_by_surface(&self, surface: SurfaceId) -> Option<ViewId> {
        self.by_surface.get(&surface).copied()
    }

    /// Live views, front first
    pub fn order(&self) -> &[ViewId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn mapped_count(&self) -> usize {
        self.views.values().filter(|v| v.is_mapped()).count()
    }

    /// Remove every subscription; the views stay until their destroy signal
    pub fn finish(&mut self, engine: &mut dyn Engine) {
        self.listeners.remove_all(engine);
        for view in self.views.values_mut() {
            view.listeners.remove_all(engine);
        }
        for (_, slot) in self.popups.drain() {
            Self::release_popup(engine, slot);
        }
    }
}
