//! Pixman rendering of the space into per-output offscreen images

use log::warn;
use pixman::Image;
use smithay::{
    backend::{
        allocator::Fourcc,
        renderer::{
            damage::OutputDamageTracker, element::surface::WaylandSurfaceRenderElement,
            pixman::PixmanRenderer, Bind, ExportMem, Offscreen,
        },
    },
    desktop::{space::render_output, Space, Window},
    output::Output,
    utils::{Rectangle, Size},
};

use crate::engine::{OutputId, PixelFormat};

/// Last frame presented on an output
pub(super) struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn stride(&self) -> u32 {
        self.width * PixelFormat::Xrgb8888.bytes_per_pixel()
    }
}

/// Render target bound to one output
pub(super) struct SceneOutput {
    pub output: OutputId,
    target: Option<Target>,
    pub frame: Option<Frame>,
}

struct Target {
    buffer: Image<'static, 'static>,
    damage_tracker: OutputDamageTracker,
    width: u32,
    height: u32,
}

impl SceneOutput {
    pub fn new(output: OutputId) -> Self {
        Self {
            output,
            target: None,
            frame: None,
        }
    }

    /// Render the space and keep a copy of the pixels
    pub fn render(
        &mut self,
        renderer: &mut PixmanRenderer,
        output: &Output,
        space: &Space<Window>,
        width: u32,
        height: u32,
        background: [f32; 4],
    ) -> bool {
        let Some(target) = ensure_target(&mut self.target, renderer, output, width, height) else {
            return false;
        };

        let mut framebuffer = match renderer.bind(&mut target.buffer) {
            Ok(fb) => fb,
            Err(e) => {
                warn!("Failed to bind framebuffer: {:?}", e);
                return false;
            }
        };

        // Full redraw every commit; the caller decides when a frame is due
        let rendered = render_output::<_, WaylandSurfaceRenderElement<PixmanRenderer>, _, _>(
            output,
            renderer,
            &mut framebuffer,
            1.0,
            0,
            [space],
            &[],
            &mut target.damage_tracker,
            background,
        );
        if let Err(e) = rendered {
            warn!("Render output failed: {:?}", e);
            return false;
        }

        let region = Rectangle::new((0, 0).into(), Size::from((width as i32, height as i32)));
        let mapping = match renderer.copy_framebuffer(&framebuffer, region, Fourcc::Xrgb8888) {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to copy framebuffer: {:?}", e);
                return false;
            }
        };
        let pixels = match renderer.map_texture(&mapping) {
            Ok(pixels) => pixels,
            Err(e) => {
                warn!("Failed to map texture: {:?}", e);
                return false;
            }
        };

        let frame = self.frame.get_or_insert_with(|| Frame {
            data: Vec::new(),
            width,
            height,
        });
        frame.data.clear();
        frame.data.extend_from_slice(pixels);
        frame.width = width;
        frame.height = height;
        true
    }
}

/// (Re)allocate the offscreen image when the output size changed
fn ensure_target<'a>(
    slot: &'a mut Option<Target>,
    renderer: &mut PixmanRenderer,
    output: &Output,
    width: u32,
    height: u32,
) -> Option<&'a mut Target> {
    let stale = slot
        .as_ref()
        .map_or(true, |t| t.width != width || t.height != height);
    if stale {
        let size = Size::from((width as i32, height as i32));
        let buffer: Image<'static, 'static> = match renderer.create_buffer(Fourcc::Xrgb8888, size) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!("Failed to create offscreen buffer: {:?}", e);
                return None;
            }
        };
        *slot = Some(Target {
            buffer,
            damage_tracker: OutputDamageTracker::from_output(output),
            width,
            height,
        });
    }
    slot.as_mut()
}
