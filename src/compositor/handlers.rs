//! Engine signal handlers
//!
//! One plain function per signal kind, looked up by `dispatch_events`.
//! Per-view signals resolve their view through the source object; signals
//! for objects that are already gone fall through as no-ops.

use super::state::Compositor;
use crate::engine::{Engine, ObjectId, Signal, SignalData, SignalKind};
use crate::view::{CommitOutcome, ViewId};
use log::{debug, trace};
use std::collections::HashMap;

pub(super) type SignalHandler<E> = fn(&mut Compositor<E>, &Signal);

pub(super) fn registry<E: Engine>() -> HashMap<SignalKind, SignalHandler<E>> {
    let mut handlers: HashMap<SignalKind, SignalHandler<E>> = HashMap::new();

    // Outputs
    handlers.insert(SignalKind::NewOutput, new_output);
    handlers.insert(SignalKind::OutputFrame, output_frame);
    handlers.insert(SignalKind::OutputRequestState, output_request_state);
    handlers.insert(SignalKind::OutputDestroy, output_destroy);

    // Seat
    handlers.insert(SignalKind::NewInput, new_input);
    handlers.insert(SignalKind::RequestCursor, request_cursor);
    handlers.insert(SignalKind::RequestSetSelection, request_set_selection);

    // Views
    handlers.insert(SignalKind::NewToplevel, new_toplevel);
    handlers.insert(SignalKind::NewPopup, new_popup);
    handlers.insert(SignalKind::PopupDestroy, popup_destroy);
    handlers.insert(SignalKind::NewDecoration, new_decoration);
    handlers.insert(SignalKind::SurfaceCommit, surface_commit);
    handlers.insert(SignalKind::SurfaceMap, surface_map);
    handlers.insert(SignalKind::SurfaceUnmap, surface_unmap);
    handlers.insert(SignalKind::ToplevelDestroy, toplevel_destroy);
    handlers.insert(SignalKind::SetTitle, set_title);
    for kind in [
        SignalKind::RequestMove,
        SignalKind::RequestResize,
        SignalKind::RequestMaximize,
        SignalKind::RequestFullscreen,
    ] {
        handlers.insert(kind, view_request);
    }

    handlers
}

fn new_output<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    let SignalData::Output(id) = signal.data else {
        return;
    };
    if c.outputs.handle_new_output(&mut c.engine, id) {
        c.reset_hasher();
    }
}

fn output_frame<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    let ObjectId::Output(id) = signal.source else {
        return;
    };
    if !c.outputs.handle_frame(&mut c.engine, id) {
        return;
    }
    let primary = c
        .outputs
        .primary()
        .filter(|o| o.id == id)
        .and_then(|o| o.scene_output);
    if let Some(scene_output) = primary {
        c.emit_frame(scene_output);
    }
}

fn output_request_state<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    let (ObjectId::Output(id), SignalData::OutputState(state)) = (signal.source, &signal.data) else {
        return;
    };
    c.outputs.handle_request_state(&mut c.engine, id, state);
    c.reset_hasher();
}

fn output_destroy<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    let ObjectId::Output(id) = signal.source else {
        return;
    };
    c.outputs.handle_destroy(&mut c.engine, id);
    c.reset_hasher();
}

fn new_input<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    if let SignalData::InputDevice(device) = &signal.data {
        c.seat.new_input_device(&mut c.engine, device);
    }
}

fn request_cursor<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    if let SignalData::Cursor {
        surface,
        hotspot_x,
        hotspot_y,
    } = signal.data
    {
        c.seat.request_cursor(surface, hotspot_x, hotspot_y);
    }
}

fn request_set_selection<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    if let SignalData::Selection { source, serial } = signal.data {
        c.seat.set_selection(&mut c.engine, source, serial);
    }
}

fn new_toplevel<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    if let SignalData::Toplevel(toplevel) = signal.data {
        c.views.handle_new_toplevel(&mut c.engine, toplevel);
    }
}

fn new_popup<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    if let SignalData::Popup(popup) = signal.data {
        c.views.handle_new_popup(&mut c.engine, popup);
    }
}

fn popup_destroy<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    if let ObjectId::Popup(popup) = signal.source {
        c.views.handle_popup_destroy(&mut c.engine, popup);
    }
}

fn new_decoration<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    if let SignalData::Decoration(decoration) = signal.data {
        c.views.handle_new_decoration(&mut c.engine, decoration);
    }
}

fn source_view<E: Engine>(c: &Compositor<E>, signal: &Signal) -> Option<ViewId> {
    let view = c.views.view_for_source(signal.source);
    if view.is_none() {
        trace!("{:?} for unknown source {:?}", signal.kind, signal.source);
    }
    view
}

fn surface_commit<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    let Some(id) = source_view(c, signal) else {
        return;
    };
    let initial = matches!(signal.data, SignalData::Commit { initial: true });
    match c.views.handle_commit(&mut c.engine, id, initial) {
        CommitOutcome::Configured(serial) => debug!("{} configured with serial {}", id, serial),
        CommitOutcome::FrameCommitted => c.notify_frame_commit(),
        CommitOutcome::Ignored => {}
    }
}

fn surface_map<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    let Some(id) = source_view(c, signal) else {
        return;
    };
    if !c.views.handle_map(&mut c.engine, id) {
        return;
    }
    c.seat.focus_view(&mut c.engine, &mut c.views, Some(id));
    c.view_added(id);
}

fn surface_unmap<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    let Some(id) = source_view(c, signal) else {
        return;
    };
    if !c.views.get(id).is_some_and(|v| v.is_mapped()) {
        return;
    }
    c.view_removed(id);
    c.seat.view_gone(&mut c.engine, id);
    c.views.handle_unmap(&mut c.engine, id);
}

fn toplevel_destroy<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    let Some(id) = source_view(c, signal) else {
        return;
    };
    // Destroy may arrive without a preceding unmap
    c.view_removed(id);
    c.seat.view_gone(&mut c.engine, id);
    c.views.handle_destroy(&mut c.engine, id);
}

fn set_title<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    if let Some(id) = source_view(c, signal) {
        c.views.handle_set_title(&mut c.engine, id);
    }
}

fn view_request<E: Engine>(c: &mut Compositor<E>, signal: &Signal) {
    if let Some(id) = source_view(c, signal) {
        c.views.handle_request(&mut c.engine, id, signal.kind);
    }
}
