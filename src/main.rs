//! nestcomp - demo host
//!
//! Embeds the nested compositor the way a host application would: a calloop
//! loop watches the compositor's event descriptor, dispatches, ticks at the
//! configured frame rate and consumes frames through the frame callback.
//! Clients connect to the listening socket; `--spawn` launches some with
//! WAYLAND_DISPLAY pointing at it.

mod args;

use args::Args;
use calloop::generic::Generic;
use calloop::signals::{Signal, Signals};
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, Interest, LoopSignal, Mode, PostAction};
use clap::Parser;
use image::ImageEncoder;
use log::{debug, error, info, trace, warn};
use nestcomp::config::{render_mode_from_env, Config};
use nestcomp::display::DisplayDetector;
use nestcomp::Compositor;
use std::cell::Cell;
use std::path::Path;
use std::process::{Child, Command};
use std::rc::Rc;
use std::time::Duration;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// State handed to every host loop callback
struct Host {
    compositor: Compositor,
    stop: LoopSignal,
    ticks: u64,
    frame_limit: Option<u64>,
    stats_every: u64,
    frames: Rc<Cell<u64>>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match args.load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config {:?}: {}, using defaults", args.config, e);
            Config::default()
        }
    };
    if let Some(mode) = render_mode_from_env() {
        config.render.mode = mode;
    }
    args.apply(&mut config);

    env_logger::Builder::new()
        .parse_filters(&std::env::var("NESTCOMP_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .init();

    info!("nestcomp v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    if args.no_parent_check {
        debug!("Parent display check skipped");
    } else {
        match DisplayDetector::detect() {
            Ok(parent) => info!("Nested in {}", parent),
            Err(e) => {
                error!("{}", e);
                return Err(e.into());
            }
        }
    }

    let mut compositor = Compositor::create(config.clone())?;
    let mode = compositor.init_backend(config.render.mode)?;
    info!("Render path: {}", mode);
    compositor.start()?;

    let Some(socket) = compositor.socket_name().map(str::to_owned) else {
        compositor.destroy();
        return Err("compositor started without a listening socket".into());
    };
    info!("Clients can connect to {}", socket);

    let frames = Rc::new(Cell::new(0u64));
    let frame_count = frames.clone();
    compositor.set_frame_callback(move |frame| {
        frame_count.set(frame_count.get() + 1);
        trace!("{}", frame);
    });
    compositor.set_view_callback(|view, added| {
        if added {
            info!("{} added", view);
        } else {
            info!("{} removed", view);
        }
    });

    let mut children = spawn_clients(&args.spawn, &socket);

    let mut event_loop: EventLoop<Host> = EventLoop::try_new()?;
    let mut host = Host {
        compositor,
        stop: event_loop.get_signal(),
        ticks: 0,
        frame_limit: args.frames,
        stats_every: u64::from(config.render.frame_rate) * 5,
        frames,
    };

    let result = run(&mut event_loop, &mut host, &config);

    for child in children.iter_mut() {
        if let Err(e) = child.kill() {
            debug!("Client {} already gone: {}", child.id(), e);
        }
        let _ = child.wait();
    }

    if result.is_ok() {
        if let Some(path) = &args.dump_frame {
            if let Err(e) = dump_frame(&mut host.compositor, path) {
                warn!("Frame dump failed: {}", e);
            }
        }
    }
    host.compositor.destroy();
    result
}

fn run(event_loop: &mut EventLoop<Host>, host: &mut Host, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let handle = event_loop.handle();

    let Some(fd) = host.compositor.event_fd() else {
        return Err("compositor has no event descriptor".into());
    };
    let fd = fd.try_clone_to_owned()?;
    handle.insert_source(Generic::new(fd, Interest::READ, Mode::Level), |_, _, host: &mut Host| {
        host.compositor.dispatch_events();
        Ok(PostAction::Continue)
    })
    .map_err(|e| e.error)?;

    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])?;
    handle.insert_source(signals, |event, _, host: &mut Host| {
        info!("Received {:?}, shutting down", event.signal());
        host.stop.stop();
    })
    .map_err(|e| e.error)?;

    // Engine timers only run while the engine loop is dispatched
    let interval = Duration::from_micros(1_000_000 / u64::from(config.render.frame_rate));
    handle.insert_source(Timer::from_duration(interval), move |_, _, host: &mut Host| {
        host.compositor.dispatch_events();
        host.ticks += 1;

        if host.stats_every > 0 && host.ticks % host.stats_every == 0 {
            if let Some(stats) = host.compositor.frame_stats() {
                info!(
                    "{} ({} handed out, {} skipped, {} views)",
                    stats,
                    host.frames.get(),
                    host.compositor.frames_skipped(),
                    host.compositor.view_count()
                );
            }
        }
        if host.frame_limit.is_some_and(|limit| host.ticks >= limit) {
            host.stop.stop();
            return TimeoutAction::Drop;
        }
        TimeoutAction::ToDuration(interval)
    })
    .map_err(|e| e.error)?;

    event_loop.run(None, host, |_| {})?;

    info!("{} host ticks, {} frames handed to the host", host.ticks, host.frames.get());
    Ok(())
}

/// Launch each command through the shell, connected to our socket
fn spawn_clients(commands: &[String], socket: &str) -> Vec<Child> {
    let mut children = Vec::new();
    for cmd in commands {
        match Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .env("WAYLAND_DISPLAY", socket)
            .env_remove("DISPLAY")
            .spawn()
        {
            Ok(child) => {
                info!("Launched '{}' as pid {}", cmd, child.id());
                children.push(child);
            }
            Err(e) => warn!("Failed to launch '{}': {}", cmd, e),
        }
    }
    children
}

fn dump_frame(compositor: &mut Compositor, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let Some((width, height)) = compositor.output_size() else {
        warn!("No output to dump");
        return Ok(());
    };
    let stride = width * 4;
    let mut xrgb = vec![0u8; (stride * height) as usize];
    compositor.render_frame(&mut xrgb, width, height, stride)?;

    // XRGB8888 is stored B, G, R, X in memory
    let mut rgba = Vec::with_capacity(xrgb.len());
    for px in xrgb.chunks_exact(4) {
        rgba.extend_from_slice(&[px[2], px[1], px[0], 0xff]);
    }

    let file = std::io::BufWriter::new(std::fs::File::create(path)?);
    let encoder = image::codecs::png::PngEncoder::new(file);
    encoder.write_image(&rgba, width, height, image::ColorType::Rgba8)?;
    info!("Last frame written to {}", path.display());
    Ok(())
}
