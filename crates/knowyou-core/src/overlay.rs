//! Overlay rendering: one labeled box per detected face.
//!
//! A [`Canvas`] is the drawing surface laid over the video. Every cycle
//! clears it and draws the current detections, scaled from frame
//! coordinates to the canvas size.

use crate::matcher::Matcher;
use crate::types::{BoundingBox, DetectedFace, FaceMatch};
use ab_glyph::{FontArc, PxScale};
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgba, RgbImage, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const BOX_COLOR: Rgba<u8> = Rgba([0, 0, 255, 255]);
const BOX_LINE_WIDTH: u32 = 2;
const LABEL_BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 128]);
const LABEL_TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const LABEL_FONT_SIZE: f32 = 14.0;
const LABEL_PADDING: u32 = 4;
const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("failed to read font {}: {source}", .path.display())]
    FontRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid font file {}", .0.display())]
    InvalidFont(PathBuf),
    #[error("failed to write overlay image: {0}")]
    Write(#[from] image::ImageError),
}

/// Text drawn next to a face: a greeting for known people.
pub fn greeting(m: &FaceMatch) -> String {
    match &m.name {
        Some(name) => format!("hey, {name}!"),
        None => "i don't know you".to_string(),
    }
}

/// Rescale a box from frame coordinates to display coordinates.
pub fn resize_box(bbox: &BoundingBox, from: (u32, u32), to: (u32, u32)) -> BoundingBox {
    if from.0 == 0 || from.1 == 0 {
        return bbox.clone();
    }
    bbox.scaled(to.0 as f32 / from.0 as f32, to.1 as f32 / from.1 as f32)
}

/// A drawing surface sized to the display.
pub trait Canvas {
    /// (width, height) in pixels.
    fn size(&self) -> (u32, u32);

    /// Remove everything drawn so far.
    fn clear(&mut self);

    fn draw_box(&mut self, bbox: &BoundingBox, text: &str);
}

/// One rendered detection, in display coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub bbox: BoundingBox,
    pub label: String,
    pub distance: f32,
    pub text: String,
}

/// Clear the canvas, then match and draw every detection.
///
/// `frame_size` is the size of the frame the detections were found in.
pub fn render_detections(
    canvas: &mut dyn Canvas,
    matcher: &dyn Matcher,
    faces: &[DetectedFace],
    frame_size: (u32, u32),
) -> Vec<Annotation> {
    canvas.clear();
    let display_size = canvas.size();

    faces
        .iter()
        .map(|face| {
            let bbox = resize_box(&face.bbox, frame_size, display_size);
            let m = matcher.find_best_match(&face.descriptor);
            let text = greeting(&m);
            canvas.draw_box(&bbox, &text);
            Annotation {
                bbox,
                label: m.label().to_string(),
                distance: m.distance,
                text,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrawCommand {
    pub bbox: BoundingBox,
    pub text: String,
}

/// Canvas that remembers draw calls instead of rasterizing them.
#[derive(Debug, Clone)]
pub struct RecordingCanvas {
    width: u32,
    height: u32,
    commands: Vec<DrawCommand>,
    clears: usize,
}

impl RecordingCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            commands: Vec::new(),
            clears: 0,
        }
    }

    /// Boxes currently on the surface.
    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    pub fn clear_count(&self) -> usize {
        self.clears
    }
}

impl Canvas for RecordingCanvas {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn clear(&mut self) {
        self.commands.clear();
        self.clears += 1;
    }

    fn draw_box(&mut self, bbox: &BoundingBox, text: &str) {
        self.commands.push(DrawCommand {
            bbox: bbox.clone(),
            text: text.to_string(),
        });
    }
}

/// Transparent RGBA surface that boxes and labels are painted onto.
pub struct RasterCanvas {
    surface: RgbaImage,
    font: Option<FontArc>,
}

impl RasterCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            surface: RgbaImage::from_pixel(width, height, TRANSPARENT),
            font: None,
        }
    }

    /// Label text is only rasterized when a font is set; without one the
    /// label field is still drawn so the box stays identifiable.
    pub fn with_font(mut self, font: FontArc) -> Self {
        self.font = Some(font);
        self
    }

    pub fn load_font(path: &Path) -> Result<FontArc, OverlayError> {
        let bytes = std::fs::read(path).map_err(|source| OverlayError::FontRead {
            path: path.to_path_buf(),
            source,
        })?;
        FontArc::try_from_vec(bytes).map_err(|_| OverlayError::InvalidFont(path.to_path_buf()))
    }

    pub fn surface(&self) -> &RgbaImage {
        &self.surface
    }

    /// Blend the overlay over `frame`, scaling the frame to the canvas size.
    pub fn composite(&self, frame: &RgbImage) -> RgbImage {
        let (w, h) = self.size();
        let base = if frame.dimensions() == (w, h) {
            frame.clone()
        } else {
            imageops::resize(frame, w, h, FilterType::Triangle)
        };
        let mut rgba = DynamicImage::ImageRgb8(base).to_rgba8();
        imageops::overlay(&mut rgba, &self.surface, 0, 0);
        DynamicImage::ImageRgba8(rgba).to_rgb8()
    }

    /// Write the composited frame to `path` (format from the extension).
    pub fn save_composite(&self, frame: &RgbImage, path: &Path) -> Result<(), OverlayError> {
        self.composite(frame).save(path)?;
        Ok(())
    }

    /// Clip a box to the surface; `None` when nothing of it is visible.
    fn clip(&self, x: f32, y: f32, w: f32, h: f32) -> Option<Rect> {
        let (sw, sh) = (self.surface.width() as f32, self.surface.height() as f32);
        let x0 = x.max(0.0).round();
        let y0 = y.max(0.0).round();
        let x1 = (x + w).min(sw).round();
        let y1 = (y + h).min(sh).round();
        if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
            return None;
        }
        Some(Rect::at(x0 as i32, y0 as i32).of_size((x1 - x0) as u32, (y1 - y0) as u32))
    }

    fn label_size(&self, text: &str) -> (u32, u32) {
        match &self.font {
            Some(font) => text_size(PxScale::from(LABEL_FONT_SIZE), font, text),
            None => (
                (text.chars().count() as f32 * LABEL_FONT_SIZE * 0.6).ceil() as u32,
                LABEL_FONT_SIZE as u32,
            ),
        }
    }
}

impl Canvas for RasterCanvas {
    fn size(&self) -> (u32, u32) {
        self.surface.dimensions()
    }

    fn clear(&mut self) {
        for p in self.surface.pixels_mut() {
            *p = TRANSPARENT;
        }
    }

    fn draw_box(&mut self, bbox: &BoundingBox, text: &str) {
        let Some(outer) = self.clip(bbox.x, bbox.y, bbox.width, bbox.height) else {
            return;
        };
        for inset in 0..BOX_LINE_WIDTH {
            let (w, h) = (outer.width(), outer.height());
            if w <= 2 * inset || h <= 2 * inset {
                break;
            }
            let rect = Rect::at(outer.left() + inset as i32, outer.top() + inset as i32)
                .of_size(w - 2 * inset, h - 2 * inset);
            draw_hollow_rect_mut(&mut self.surface, rect, BOX_COLOR);
        }

        if text.is_empty() {
            return;
        }

        // Label field hangs below the box's bottom-left corner, pushed back
        // inside the surface when the box touches the bottom edge.
        let (text_w, text_h) = self.label_size(text);
        let field_w = (text_w + 2 * LABEL_PADDING) as f32;
        let field_h = (text_h + 2 * LABEL_PADDING) as f32;
        let field_y = (outer.bottom() as f32 + 1.0).min(self.surface.height() as f32 - field_h);
        let Some(field) = self.clip(outer.left() as f32, field_y, field_w, field_h) else {
            return;
        };
        draw_filled_rect_mut(&mut self.surface, field, LABEL_BACKGROUND);

        if let Some(font) = &self.font {
            draw_text_mut(
                &mut self.surface,
                LABEL_TEXT_COLOR,
                field.left() + LABEL_PADDING as i32,
                field.top() + LABEL_PADDING as i32,
                PxScale::from(LABEL_FONT_SIZE),
                font,
                text,
            );
        }
    }
}
