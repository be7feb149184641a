//! Annotation compositor: turns pointer gestures over a background raster into
//! a replayable shape log and a flattened image.
//!
//! Gesture points arrive in display space and are mapped to the background's
//! native pixel space before they are stored.

pub mod render;

use anyhow::Result;
use image::RgbaImage;

use crate::image_data::EncodedImage;
use crate::models::{Color, Point, Shape, ShapeKind};

pub const DEFAULT_STROKE_WIDTH: f64 = 3.0;

/// Source of label text for the text tool. Returning `None` or an empty
/// string cancels the label.
pub trait TextPrompt: Send {
    fn request_text(&mut self, at: Point) -> Option<String>;
}

impl<F> TextPrompt for F
where
    F: FnMut(Point) -> Option<String> + Send,
{
    fn request_text(&mut self, at: Point) -> Option<String> {
        self(at)
    }
}

/// Renders `shapes` in order on top of a copy of `background`.
pub fn composite(background: &RgbaImage, shapes: &[Shape]) -> RgbaImage {
    let mut out = background.clone();
    for shape in shapes {
        render::draw_shape(&mut out, shape);
    }
    out
}

/// Flattens a background and shape log into an encoded PNG.
pub fn flatten_onto(background: &EncodedImage, shapes: &[Shape]) -> Result<EncodedImage> {
    let raster = background.decode_rgba()?;
    EncodedImage::encode_png(&composite(&raster, shapes))
}

pub struct Compositor {
    background: RgbaImage,
    display_size: (f64, f64),
    tool: ShapeKind,
    color: Color,
    stroke_width: f64,
    shapes: Vec<Shape>,
    in_progress: Option<Shape>,
    preview: RgbaImage,
    text_prompt: Option<Box<dyn TextPrompt>>,
}

impl Compositor {
    /// Creates a compositor whose display size equals the native size.
    pub fn new(background: RgbaImage) -> Self {
        let display_size = (f64::from(background.width()), f64::from(background.height()));
        let preview = background.clone();
        Self {
            background,
            display_size,
            tool: ShapeKind::Arrow,
            color: Color::default(),
            stroke_width: DEFAULT_STROKE_WIDTH,
            shapes: Vec::new(),
            in_progress: None,
            preview,
            text_prompt: None,
        }
    }

    pub fn from_encoded(background: &EncodedImage) -> Result<Self> {
        Ok(Self::new(background.decode_rgba()?))
    }

    pub fn with_text_prompt(mut self, prompt: impl TextPrompt + 'static) -> Self {
        self.set_text_prompt(prompt);
        self
    }

    pub fn set_text_prompt(&mut self, prompt: impl TextPrompt + 'static) {
        self.text_prompt = Some(Box::new(prompt));
    }

    /// Size the background is shown at on screen. Non-positive sizes are ignored.
    pub fn set_display_size(&mut self, width: f64, height: f64) {
        if width > 0.0 && height > 0.0 {
            self.display_size = (width, height);
        }
    }

    pub fn native_size(&self) -> (u32, u32) {
        self.background.dimensions()
    }

    pub fn set_tool(&mut self, kind: ShapeKind) {
        self.tool = kind;
    }

    pub fn set_color(&mut self, color: Color) {
        self.color = color;
    }

    pub fn set_stroke_width(&mut self, width: f64) {
        if width > 0.0 && width.is_finite() {
            self.stroke_width = width;
        } else {
            log::warn!("Ignoring non-positive stroke width {}", width);
        }
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    /// Background with committed shapes and the in-progress gesture.
    pub fn preview(&self) -> &RgbaImage {
        &self.preview
    }

    pub fn is_drawing(&self) -> bool {
        self.in_progress.is_some()
    }

    fn to_native(&self, display: Point) -> Point {
        let (native_w, native_h) = self.background.dimensions();
        Point::new(
            display.x * f64::from(native_w) / self.display_size.0,
            display.y * f64::from(native_h) / self.display_size.1,
        )
    }

    pub fn begin_gesture(&mut self, display_point: Point) {
        let point = self.to_native(display_point);
        if self.tool == ShapeKind::TextLabel {
            self.in_progress = None;
            let text = self
                .text_prompt
                .as_mut()
                .and_then(|prompt| prompt.request_text(point))
                .filter(|t| !t.is_empty());
            let Some(text) = text else {
                log::debug!("Text label cancelled at ({:.1}, {:.1})", point.x, point.y);
                return;
            };
            self.commit(Shape {
                kind: ShapeKind::TextLabel,
                points: vec![point],
                color: self.color,
                stroke_width: self.stroke_width,
                text: Some(text),
            });
            return;
        }

        self.in_progress = Some(Shape {
            kind: self.tool,
            points: vec![point],
            color: self.color,
            stroke_width: self.stroke_width,
            text: None,
        });
        self.render_preview();
    }

    pub fn update_gesture(&mut self, display_point: Point) {
        let point = self.to_native(display_point);
        let Some(shape) = self.in_progress.as_mut() else {
            return;
        };
        shape.points.push(point);
        self.render_preview();
    }

    pub fn end_gesture(&mut self, display_point: Point) {
        let point = self.to_native(display_point);
        let Some(mut shape) = self.in_progress.take() else {
            return;
        };
        if shape.points.last() != Some(&point) {
            shape.points.push(point);
        }
        if shape.points.len() < shape.kind.min_points() {
            log::debug!("Dropping {:?} gesture with {} point(s)", shape.kind, shape.points.len());
            self.render_preview();
            return;
        }
        self.commit(shape);
    }

    fn commit(&mut self, shape: Shape) {
        log::debug!("Committed {:?} with {} point(s)", shape.kind, shape.points.len());
        self.shapes.push(shape);
        self.render_preview();
    }

    pub fn undo(&mut self) {
        if self.shapes.pop().is_some() {
            self.render_preview();
        }
    }

    pub fn clear(&mut self) {
        self.shapes.clear();
        self.in_progress = None;
        self.render_preview();
    }

    fn render_preview(&mut self) {
        let mut preview = composite(&self.background, &self.shapes);
        if let Some(shape) = &self.in_progress {
            render::draw_shape(&mut preview, shape);
        }
        self.preview = preview;
    }

    /// Background plus committed shapes at native resolution, PNG encoded.
    pub fn flatten(&self) -> Result<EncodedImage> {
        EncodedImage::encode_png(&composite(&self.background, &self.shapes))
    }

    /// Hands back the committed shape log, consuming the compositor.
    pub fn into_shapes(self) -> Vec<Shape> {
        self.shapes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn background() -> RgbaImage {
        RgbaImage::from_fn(64, 48, |x, y| Rgba([(x * 3) as u8, (y * 5) as u8, 90, 255]))
    }

    fn drag(c: &mut Compositor, points: &[(f64, f64)]) {
        let (first, rest) = points.split_first().unwrap();
        c.begin_gesture(Point::new(first.0, first.1));
        let (last, middle) = rest.split_last().unwrap();
        for p in middle {
            c.update_gesture(Point::new(p.0, p.1));
        }
        c.end_gesture(Point::new(last.0, last.1));
    }

    #[test]
    fn flatten_is_idempotent() {
        let mut c = Compositor::new(background());
        c.set_tool(ShapeKind::Freehand);
        drag(&mut c, &[(1.0, 1.0), (10.0, 12.0), (30.0, 8.0)]);
        c.set_tool(ShapeKind::Highlight);
        drag(&mut c, &[(5.0, 5.0), (40.0, 30.0)]);

        assert_eq!(c.flatten().unwrap(), c.flatten().unwrap());
    }

    #[test]
    fn two_point_shapes_ignore_intermediate_points() {
        for kind in [ShapeKind::Arrow, ShapeKind::Rectangle, ShapeKind::Highlight] {
            let mut direct = Compositor::new(background());
            direct.set_tool(kind);
            drag(&mut direct, &[(4.0, 6.0), (50.0, 40.0)]);

            let mut wandering = Compositor::new(background());
            wandering.set_tool(kind);
            drag(&mut wandering, &[(4.0, 6.0), (60.0, 2.0), (1.0, 44.0), (50.0, 40.0)]);

            assert_eq!(wandering.shapes()[0].points.len(), 4, "drag points are recorded");
            assert_eq!(direct.flatten().unwrap(), wandering.flatten().unwrap(), "{:?}", kind);
        }
    }

    #[test]
    fn undo_matches_log_without_last_shape() {
        let mut c = Compositor::new(background());
        c.undo();
        assert!(c.shapes().is_empty());

        c.set_tool(ShapeKind::Rectangle);
        drag(&mut c, &[(2.0, 2.0), (20.0, 20.0)]);
        let expected = c.flatten().unwrap();

        c.set_color(Color::rgb(0, 200, 0));
        c.set_tool(ShapeKind::Arrow);
        drag(&mut c, &[(30.0, 30.0), (60.0, 10.0)]);
        assert_ne!(c.flatten().unwrap(), expected);

        c.undo();
        assert_eq!(c.shapes().len(), 1);
        assert_eq!(c.flatten().unwrap(), expected);
    }

    #[test]
    fn clear_restores_background() {
        let mut c = Compositor::new(background());
        c.set_tool(ShapeKind::Highlight);
        drag(&mut c, &[(0.0, 0.0), (63.0, 47.0)]);
        c.clear();
        assert!(c.shapes().is_empty());
        assert_eq!(c.preview(), &background());
        assert_eq!(c.flatten().unwrap().decode_rgba().unwrap(), background());
    }

    #[test]
    fn click_without_drag_is_dropped_for_two_point_tools() {
        let mut c = Compositor::new(background());
        c.set_tool(ShapeKind::Arrow);
        c.begin_gesture(Point::new(10.0, 10.0));
        c.end_gesture(Point::new(10.0, 10.0));
        assert!(c.shapes().is_empty());

        c.set_tool(ShapeKind::Freehand);
        c.begin_gesture(Point::new(10.0, 10.0));
        c.end_gesture(Point::new(10.0, 10.0));
        assert_eq!(c.shapes().len(), 1);
    }

    #[test]
    fn preview_shows_in_progress_shape_without_committing() {
        let mut c = Compositor::new(background());
        c.set_tool(ShapeKind::Rectangle);
        c.begin_gesture(Point::new(5.0, 5.0));
        c.update_gesture(Point::new(30.0, 30.0));
        assert!(c.is_drawing());
        assert!(c.shapes().is_empty());
        assert_ne!(c.preview(), &background());
    }

    #[test]
    fn display_points_are_mapped_to_native_pixels() {
        let mut c = Compositor::new(background());
        c.set_display_size(32.0, 24.0);
        c.set_tool(ShapeKind::Rectangle);
        drag(&mut c, &[(1.0, 2.0), (16.0, 12.0)]);
        assert_eq!(c.shapes()[0].points, vec![Point::new(2.0, 4.0), Point::new(32.0, 24.0)]);
    }

    #[test]
    fn text_tool_commits_single_point_label() {
        let mut c = Compositor::new(background())
            .with_text_prompt(|_at: Point| Some("Bug here".to_string()));
        c.set_tool(ShapeKind::TextLabel);
        c.begin_gesture(Point::new(3.0, 4.0));
        assert_eq!(c.shapes().len(), 1);
        assert_eq!(c.shapes()[0].points, vec![Point::new(3.0, 4.0)]);
        assert_eq!(c.shapes()[0].text.as_deref(), Some("Bug here"));
        assert!(!c.is_drawing());
    }

    #[test]
    fn empty_label_text_commits_nothing() {
        let mut c = Compositor::new(background()).with_text_prompt(|_at: Point| Some(String::new()));
        c.set_tool(ShapeKind::TextLabel);
        c.begin_gesture(Point::new(3.0, 4.0));
        assert!(c.shapes().is_empty());

        let mut no_prompt = Compositor::new(background());
        no_prompt.set_tool(ShapeKind::TextLabel);
        no_prompt.begin_gesture(Point::new(3.0, 4.0));
        assert!(no_prompt.shapes().is_empty());
    }

    #[test]
    fn flatten_onto_replays_log() {
        let mut c = Compositor::new(background());
        c.set_tool(ShapeKind::Arrow);
        drag(&mut c, &[(4.0, 40.0), (50.0, 8.0)]);
        let raw = EncodedImage::encode_png(&background()).unwrap();
        assert_eq!(flatten_onto(&raw, c.shapes()).unwrap(), c.flatten().unwrap());
    }
}
