use super::Compositor as EngineCompositor;
use crate::config::Config;
use crate::engine::{
    ClientEvent, ClientId, Engine, SimConfig, SimEngine, OutputMode, Rect, SurfaceId,
    ToplevelId,
};
use crate::error::CompositorError;
use crate::render::{RenderError, RenderMode};
use crate::view::{FullscreenPolicy, ViewId};
use std::cell::RefCell;
use std::rc::Rc;

const RED: u32 = 0xffcc_2222;
const BLUE: u32 = 0xff22_44cc;

type Compositor = EngineCompositor<SimEngine>;

fn create(config: Config) -> Compositor {
    Compositor::with_engine(SimEngine::new(SimConfig::default()).unwrap(), config).unwrap()
}

fn config() -> Config {
    let mut config = Config::default();
    config.views.fullscreen_policy = FullscreenPolicy::Never;
    config
}

fn started(config: Config) -> Compositor {
    let mut c = create(config);
    assert_eq!(c.init_backend(RenderMode::Software).unwrap(), RenderMode::Software);
    c.start().unwrap();
    c
}

/// Connect a client, run the configure handshake and map a 200x200 window at (x, y)
fn open_window(c: &mut Compositor, x: i32, y: i32, argb: u32) -> (ClientId, ToplevelId, SurfaceId) {
    let client = c.engine_mut().connect_client();
    let toplevel = c.engine_mut().create_toplevel(client).unwrap();
    c.dispatch_events();
    c.engine_mut().commit(toplevel);
    c.dispatch_events();
    c.engine_mut().commit_sized(toplevel, 200, 200, argb);
    c.dispatch_events();

    let index = c.view_count() - 1;
    c.set_view_position(index, x, y).unwrap();
    let surface = c.engine().toplevel_surface(toplevel).unwrap();
    (client, toplevel, surface)
}

fn keys_for(c: &Compositor, client: ClientId) -> Vec<u32> {
    c.engine()
        .client_events(client)
        .iter()
        .filter_map(|e| match e {
            ClientEvent::Key { key, .. } => Some(*key),
            _ => None,
        })
        .collect()
}

#[test]
fn test_software_when_hardware_missing() {
    let mut c = create(Config::default());
    let mode = c.init_backend(RenderMode::Hardware).unwrap();
    assert_eq!(mode, RenderMode::Software);
    assert_eq!(c.render_mode(), Some(RenderMode::Software));
}

#[test]
fn test_hardware_when_available() {
    let engine = SimEngine::new(SimConfig {
        hardware_available: true,
        ..Default::default()
    })
    .unwrap();
    let mut c = Compositor::with_engine(engine, config()).unwrap();
    assert_eq!(c.init_backend(RenderMode::Hardware).unwrap(), RenderMode::Hardware);
    c.start().unwrap();
    open_window(&mut c, 0, 0, RED);

    assert!(c.render_and_notify());
    let frame = c.capture_frame().unwrap();
    assert!(frame.is_zero_copy());
    assert_eq!((frame.width, frame.height), (1280, 720));
}

#[test]
fn test_backend_from_env_falls_back() {
    // Whatever NESTCOMP_HARDWARE says, the in-process engine has no GPU by default
    let mut c = create(config());
    assert_eq!(c.init_backend_from_env().unwrap(), RenderMode::Software);
    c.start().unwrap();
    assert!(c.is_started());
}

#[test]
fn test_unknown_keymap_layout_fails_creation() {
    let mut config = Config::default();
    config.seat.keymap_layout = "no-such-layout".to_string();
    let engine = SimEngine::new(SimConfig::default()).unwrap();
    let err = Compositor::with_engine(engine, config).err().unwrap();
    assert!(matches!(err, CompositorError::Init("keymap", _)));
}

#[test]
fn test_init_order_errors() {
    let mut c = create(Config::default());
    assert!(matches!(c.start(), Err(CompositorError::NotInitialized)));
    c.init_backend(RenderMode::Software).unwrap();
    assert!(matches!(
        c.init_backend(RenderMode::Software),
        Err(CompositorError::AlreadyInitialized)
    ));
    c.start().unwrap();
    assert!(matches!(c.start(), Err(CompositorError::AlreadyStarted)));
}

#[test]
fn test_start_sets_up_output_and_keyboard() {
    let c = started(Config::default());
    assert!(c.socket_name().is_some());
    assert_eq!(c.output_size(), Some((1280, 720)));
    assert_eq!(c.engine().keyboard_repeat(), (25, 600));
    assert!(c.event_fd().is_some());
    assert_eq!(c.engine().seat_name(), Some("seat0"));
    assert!(c.engine().has_decoration_manager());
}

#[test]
fn test_initial_commit_then_map() {
    let mut c = started(config());
    let added: Rc<RefCell<Vec<(ViewId, bool)>>> = Rc::default();
    let log = added.clone();
    c.set_view_callback(move |id, mapped| log.borrow_mut().push((id, mapped)));

    let client = c.engine_mut().connect_client();
    let toplevel = c.engine_mut().create_toplevel(client).unwrap();
    c.dispatch_events();
    assert_eq!(c.engine().configure_count(toplevel), 0);

    c.engine_mut().commit(toplevel);
    c.dispatch_events();
    assert_eq!(c.engine().configure_count(toplevel), 1);
    let (_, width, height, states) = c.engine().latest_configure(toplevel).unwrap();
    assert_eq!((width, height), (640, 480));
    assert!(!states.activated);
    assert_eq!(c.view_count(), 0);

    // A second empty commit does not configure again
    c.engine_mut().commit(toplevel);
    c.dispatch_events();
    assert_eq!(c.engine().configure_count(toplevel), 1);

    assert!(c.engine_mut().map_toplevel(toplevel, RED));
    c.dispatch_events();
    assert_eq!(c.view_count(), 1);
    assert_eq!(added.borrow().len(), 1);
    assert!(added.borrow()[0].1);
    assert!(c.view_is_mapped(0).unwrap());
    assert_eq!(c.view_title(0).unwrap(), "(untitled)");
    assert!(c.engine().protocol_errors().is_empty());
}

#[test]
fn test_commit_before_first_dispatch() {
    let mut c = started(config());
    let client = c.engine_mut().connect_client();
    let toplevel = c.engine_mut().create_toplevel(client).unwrap();
    // The view does not exist yet when the initial commit is raised
    c.engine_mut().commit(toplevel);
    c.dispatch_events();
    assert_eq!(c.engine().configure_count(toplevel), 1);

    assert!(c.engine_mut().map_toplevel(toplevel, RED));
    c.dispatch_events();
    assert!(c.view_is_mapped(0).unwrap());
}

#[test]
fn test_popup_destroy_clears_view_state() {
    let mut c = started(config());
    let (_, toplevel, _) = open_window(&mut c, 0, 0, RED);
    let listeners = c.engine().listener_count();

    let popup = c.engine_mut().create_popup(toplevel, 10, 10, 20, 20, BLUE).unwrap();
    c.dispatch_events();
    assert_eq!(c.engine().listener_count(), listeners + 1);

    c.engine_mut().destroy_popup(popup);
    c.dispatch_events();
    assert_eq!(c.engine().listener_count(), listeners);
}

#[test]
fn test_fullscreen_policy_in_initial_configure() {
    let mut c = started(Config::default());
    let client = c.engine_mut().connect_client();
    let toplevel = c.engine_mut().create_toplevel(client).unwrap();
    c.dispatch_events();
    c.engine_mut().commit(toplevel);
    c.dispatch_events();
    let (_, _, _, states) = c.engine().latest_configure(toplevel).unwrap();
    assert!(states.fullscreen);
}

#[test]
fn test_click_transfers_focus() {
    let mut c = started(config());
    let (client1, toplevel1, _) = open_window(&mut c, 0, 0, RED);
    let (client2, toplevel2, surface2) = open_window(&mut c, 400, 0, BLUE);

    c.focus_view(0).unwrap();
    c.dispatch_events();
    assert_eq!(c.focused_view(), Some(c.view_id(0).unwrap()));

    assert!(c.send_pointer_motion(450.0, 50.0));
    c.send_pointer_button(0x110, true);
    c.send_pointer_button(0x110, false);
    c.dispatch_events();

    assert_eq!(c.focused_view(), Some(c.view_id(1).unwrap()));
    assert_eq!(c.engine().pointer_focus(), Some(surface2));
    assert_eq!(c.engine().keyboard_focus(), Some(surface2));
    assert!(!c.engine().toplevel_states(toplevel1).unwrap().activated);
    assert!(c.engine().toplevel_states(toplevel2).unwrap().activated);

    c.engine_mut().take_client_events(client1);
    c.engine_mut().take_client_events(client2);
    assert!(c.send_key(30, true));
    assert!(c.send_key(30, false));
    assert!(keys_for(&c, client1).is_empty());
    assert_eq!(keys_for(&c, client2), vec![30, 30]);
}

#[test]
fn test_click_on_empty_space_keeps_focus() {
    let mut c = started(config());
    open_window(&mut c, 0, 0, RED);
    let focused = c.focused_view();
    assert!(focused.is_some());

    assert!(!c.send_pointer_motion(1000.0, 600.0));
    c.send_pointer_button(0x110, true);
    assert_eq!(c.focused_view(), focused);
}

#[test]
fn test_focused_view_destroyed_without_unmap() {
    let mut c = started(config());
    let events: Rc<RefCell<Vec<(ViewId, bool)>>> = Rc::default();
    let log = events.clone();
    c.set_view_callback(move |id, mapped| log.borrow_mut().push((id, mapped)));

    let listeners_before = c.engine().listener_count();
    let (client, _, _) = open_window(&mut c, 0, 0, RED);
    let id = c.view_id(0).unwrap();
    assert_eq!(c.focused_view(), Some(id));

    c.engine_mut().disconnect_client(client);
    c.dispatch_events();

    assert_eq!(c.view_count(), 0);
    assert_eq!(c.focused_view(), None);
    assert_eq!(c.engine().keyboard_focus(), None);
    assert_eq!(*events.borrow(), vec![(id, true), (id, false)]);
    assert!(c.views().is_empty());
    assert_eq!(c.engine().listener_count(), listeners_before);

    // Nothing left over for the next round
    assert_eq!(c.dispatch_events(), 0);
    assert!(!c.send_key(30, true));
}

#[test]
fn test_capture_before_any_commit() {
    let mut c = started(Config::default());
    let before = c.frame_dimensions().unwrap();
    match c.capture_frame() {
        Err(CompositorError::Render(RenderError::NoFrameAvailable)) => {}
        other => panic!("unexpected capture result: {:?}", other.map(|f| f.width)),
    }
    assert_eq!(c.frame_dimensions().unwrap(), before);

    // Presenting an empty scene still has nothing to hand out
    c.render_and_notify();
    assert!(c.capture_frame().is_err());
}

#[test]
fn test_scene_node_only_while_mapped() {
    let mut c = started(config());
    let (_, toplevel, _) = open_window(&mut c, 10, 10, RED);
    let id = c.view_id(0).unwrap();
    let tree = c.views().get(id).unwrap().tree().unwrap();
    assert!(c.engine().scene().contains(tree));

    c.engine_mut().unmap_toplevel(toplevel);
    c.dispatch_events();
    assert_eq!(c.view_count(), 0);
    let view = c.views().get(id).unwrap();
    assert!(view.tree().is_none());
    assert!(!view.is_mapped());
    assert!(!c.engine().scene().contains(tree));

    // Remapping brings it back with a fresh subtree
    c.engine_mut().commit_sized(toplevel, 200, 200, RED);
    c.dispatch_events();
    assert_eq!(c.view_count(), 1);
    assert!(c.views().get(id).unwrap().tree().is_some());
}

#[test]
fn test_one_keyboard_enter_per_transfer() {
    let mut c = started(config());
    let (client, _, _) = open_window(&mut c, 0, 0, RED);
    open_window(&mut c, 300, 0, BLUE);

    c.engine_mut().take_client_events(client);
    assert!(c.focus_view(0).unwrap());
    assert!(!c.focus_view(0).unwrap());
    let enters = c
        .engine()
        .client_events(client)
        .iter()
        .filter(|e| matches!(e, ClientEvent::KeyboardEnter { .. }))
        .count();
    assert_eq!(enters, 1);
}

#[test]
fn test_pointer_enter_before_motion() {
    let mut c = started(config());
    let (client, _, surface) = open_window(&mut c, 100, 100, RED);
    c.engine_mut().take_client_events(client);

    assert!(c.send_pointer_motion(150.0, 120.0));
    assert!(c.send_pointer_motion(151.0, 121.0));
    let events = c.engine().client_events(client);
    let enter = events
        .iter()
        .position(|e| matches!(e, ClientEvent::PointerEnter { surface: s, .. } if *s == surface))
        .unwrap();
    let motion = events
        .iter()
        .position(|e| matches!(e, ClientEvent::PointerMotion { .. }))
        .unwrap();
    assert!(enter < motion);
    let enters = events
        .iter()
        .filter(|e| matches!(e, ClientEvent::PointerEnter { .. }))
        .count();
    assert_eq!(enters, 1);
    match events[enter] {
        ClientEvent::PointerEnter { sx, sy, .. } => assert_eq!((sx, sy), (50.0, 20.0)),
        _ => unreachable!(),
    }
}

#[test]
fn test_resize_visible_after_next_commit() {
    let mut c = started(config());
    let (_, toplevel, _) = open_window(&mut c, 0, 0, RED);
    assert_eq!(c.view_geometry(0).unwrap(), Rect::new(0, 0, 200, 200));

    assert!(c.resize_view(0, 300, 150).unwrap());
    c.flush_clients();
    let (_, width, height, _) = c.engine().latest_configure(toplevel).unwrap();
    assert_eq!((width, height), (300, 150));
    // Not applied until the client commits
    assert_eq!(c.view_geometry(0).unwrap(), Rect::new(0, 0, 200, 200));

    c.engine_mut().commit_sized(toplevel, 300, 150, RED);
    c.dispatch_events();
    assert_eq!(c.view_geometry(0).unwrap(), Rect::new(0, 0, 300, 150));

    assert!(!c.resize_view(0, 0, 100).unwrap());
}

#[test]
fn test_invalid_view_index() {
    let mut c = started(config());
    assert!(matches!(c.view_id(0), Err(CompositorError::InvalidViewIndex(0))));
    assert!(matches!(c.focus_view(3), Err(CompositorError::InvalidViewIndex(3))));
    assert!(c.view_title(0).unwrap_err().is_transient());
    assert!(c.close_view(1).is_err());
}

#[test]
fn test_title_and_close() {
    let mut c = started(config());
    let (client, toplevel, _) = open_window(&mut c, 0, 0, RED);
    c.engine_mut().set_title(toplevel, "terminal");
    c.dispatch_events();
    assert_eq!(c.view_title(0).unwrap(), "terminal");

    assert!(c.close_view(0).unwrap());
    assert!(c
        .engine()
        .client_events(client)
        .iter()
        .any(|e| matches!(e, ClientEvent::Close { toplevel: t } if *t == toplevel)));
}

#[test]
fn test_host_list_in_added_order() {
    let mut c = started(config());
    open_window(&mut c, 0, 0, RED);
    open_window(&mut c, 300, 0, BLUE);
    let first = c.view_id(0).unwrap();
    let second = c.view_id(1).unwrap();

    // Focus changes stacking order, not the host list
    c.focus_view(0).unwrap();
    assert_eq!(c.views().order()[0], first);
    assert_eq!(c.view_id(0).unwrap(), first);
    assert_eq!(c.view_id(1).unwrap(), second);
}

#[test]
fn test_frame_callback_on_output_frame() {
    let mut c = started(config());
    let frames = Rc::new(RefCell::new(Vec::new()));
    let log = frames.clone();
    c.set_frame_callback(move |frame| {
        log.borrow_mut().push((frame.width, frame.height, frame.stride));
    });

    open_window(&mut c, 0, 0, RED);
    let handed_out = frames.borrow().len();
    let done_before = c.engine().frame_done_count();
    c.engine_mut().schedule_frame_all();
    c.dispatch_events();

    assert_eq!(c.engine().frame_done_count(), done_before + 1);
    let frames = frames.borrow();
    assert_eq!(frames.len(), handed_out + 1);
    let (width, height, stride) = frames[handed_out];
    assert_eq!((width, height), (1280, 720));
    assert!(stride >= width * 4);
}

#[test]
fn test_notify_frame_commit_fires_callbacks() {
    let mut c = started(config());
    let commits = Rc::new(RefCell::new(0));
    let frames = Rc::new(RefCell::new(0));
    let (commit_log, frame_log) = (commits.clone(), frames.clone());
    c.set_commit_callback(move || *commit_log.borrow_mut() += 1);
    c.set_frame_callback(move |_| *frame_log.borrow_mut() += 1);

    c.notify_frame_commit();
    assert_eq!(*commits.borrow(), 1);
    assert_eq!(*frames.borrow(), 0);

    // The mapping commit presents the first frame
    let (_, toplevel, _) = open_window(&mut c, 0, 0, RED);
    assert_eq!(*commits.borrow(), 2);
    assert_eq!(*frames.borrow(), 1);

    c.engine_mut().commit_sized(toplevel, 200, 200, BLUE);
    c.dispatch_events();
    assert_eq!(*commits.borrow(), 3);
    assert_eq!(*frames.borrow(), 2);

    // Commits before the initial configure never reach the host
    let client = c.engine_mut().connect_client();
    let pending = c.engine_mut().create_toplevel(client).unwrap();
    c.engine_mut().commit(pending);
    c.dispatch_events();
    assert_eq!(*commits.borrow(), 3);
}

#[test]
fn test_unchanged_frames_suppressed() {
    let mut config = config();
    config.render.skip_unchanged_frames = true;
    let mut c = started(config);
    let frames = Rc::new(RefCell::new(0));
    let log = frames.clone();
    c.set_frame_callback(move |_| *log.borrow_mut() += 1);

    // Mapped at the default position, then moved to the origin
    let (_, toplevel, _) = open_window(&mut c, 0, 0, RED);
    assert_eq!(*frames.borrow(), 1);
    for _ in 0..3 {
        assert!(c.render_and_notify());
    }
    assert_eq!(*frames.borrow(), 2);
    assert_eq!(c.frames_skipped(), 2);

    c.engine_mut().commit_sized(toplevel, 200, 200, BLUE);
    c.dispatch_events();
    assert_eq!(*frames.borrow(), 3);
    c.render_and_notify();
    assert_eq!(*frames.borrow(), 3);
    assert_eq!(c.frames_skipped(), 3);
}

#[test]
fn test_render_frame_into_host_buffer() {
    let mut c = started(config());
    let (width, height) = (320u32, 240u32);
    let stride = width * 4 + 32;
    let mut dst = vec![0u8; (stride * height) as usize];

    assert!(matches!(
        c.render_frame(&mut dst, width, height, stride),
        Err(CompositorError::Render(RenderError::NoFrameAvailable))
    ));

    open_window(&mut c, 0, 0, RED);
    c.render_frame(&mut dst, width, height, stride).unwrap();
    let px = 10 * stride as usize + 10 * 4;
    assert_eq!(&dst[px..px + 3], &RED.to_le_bytes()[..3]);
    // Padding bytes are left alone
    assert!(dst[(width * 4) as usize..stride as usize].iter().all(|b| *b == 0));

    let mut small = vec![0u8; 16];
    assert!(matches!(
        c.render_frame(&mut small, width, height, stride),
        Err(CompositorError::BufferTooSmall { .. })
    ));
}

#[test]
fn test_view_frame_copy() {
    let mut c = started(config());
    open_window(&mut c, 0, 0, BLUE);
    let mut dst = vec![0u8; 200 * 200 * 4];
    c.view_frame_copy(0, &mut dst, 200, 200, 800).unwrap();
    assert_eq!(&dst[..3], &BLUE.to_le_bytes()[..3]);
    assert!(c.view_frame_copy(1, &mut dst, 200, 200, 800).is_err());
}

#[test]
fn test_output_mode_request() {
    let mut c = started(config());
    let output = c.outputs().primary().unwrap().id;
    c.engine_mut().request_output_mode(
        output,
        OutputMode {
            width: 800,
            height: 600,
            refresh_mhz: 60_000,
        },
    );
    c.dispatch_events();
    assert_eq!(c.output_size(), Some((800, 600)));
}

#[test]
fn test_output_removed() {
    let mut c = started(config());
    let output = c.outputs().primary().unwrap().id;
    c.engine_mut().remove_output(output);
    c.dispatch_events();
    assert_eq!(c.output_size(), None);
    assert!(!c.render_and_notify());
    assert!(matches!(c.capture_frame(), Err(CompositorError::NoOutput)));
}

#[test]
fn test_keys_without_focus_dropped() {
    let mut c = started(config());
    assert!(!c.send_key(42, true));
    // Modifier state is still tracked for the next focus
    assert_eq!(c.seat().modifiers().depressed, crate::seat::keyboard::MOD_SHIFT);
}

#[test]
fn test_axis_goes_to_pointer_focus() {
    let mut c = started(config());
    let (client, _, _) = open_window(&mut c, 0, 0, RED);
    assert!(!c.send_pointer_axis(false, 15.0));
    c.send_pointer_motion(20.0, 20.0);
    assert!(c.send_pointer_axis(false, 30.0));
    let discrete = c.engine().client_events(client).iter().find_map(|e| match e {
        ClientEvent::PointerAxis { event, .. } => Some(event.discrete),
        _ => None,
    });
    assert_eq!(discrete, Some(2));
}

#[test]
fn test_destroy_is_idempotent() {
    let mut c = started(config());
    open_window(&mut c, 0, 0, RED);
    open_window(&mut c, 300, 0, BLUE);

    c.destroy();
    assert!(c.is_destroyed());
    assert_eq!(c.engine().listener_count(), 0);
    assert_eq!(c.view_count(), 0);
    assert!(c.event_fd().is_none());

    c.destroy();
    assert_eq!(c.dispatch_events(), 0);
    assert!(matches!(c.capture_frame(), Err(CompositorError::Destroyed)));
    assert!(matches!(
        c.init_backend(RenderMode::Software),
        Err(CompositorError::Destroyed)
    ));
    // Drop runs destroy a third time
    drop(c);
}

#[test]
fn test_instances_are_independent() {
    let mut a = started(config());
    let mut b = started(config());
    open_window(&mut a, 0, 0, RED);
    assert_eq!(a.view_count(), 1);
    assert_eq!(b.view_count(), 0);
    assert_ne!(a.socket_name(), b.socket_name());
    b.destroy();
    assert_eq!(a.dispatch_events(), 0);
    assert_eq!(a.view_count(), 1);
}
