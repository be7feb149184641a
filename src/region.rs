//! Region extractor: lets the user drag a rectangle over a full-screen capture
//! and crops the capture to it at native resolution.

use anyhow::{Context, Result};
use image::imageops;

use crate::image_data::EncodedImage;
use crate::models::{DisplayRect, Point};

/// Drags smaller than this on either axis (display pixels) are treated as clicks.
pub const MIN_REGION_SIZE: f64 = 20.0;

type SelectCallback = Box<dyn FnMut(DisplayRect) + Send>;
type CancelCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
pub struct RegionSelector {
    drag_start: Option<Point>,
    drag_current: Option<Point>,
    on_select: Option<SelectCallback>,
    on_cancel: Option<CancelCallback>,
}

impl RegionSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_select(mut self, callback: impl FnMut(DisplayRect) + Send + 'static) -> Self {
        self.on_select = Some(Box::new(callback));
        self
    }

    pub fn on_cancel(mut self, callback: impl FnMut() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(callback));
        self
    }

    pub fn begin_drag(&mut self, point: Point) {
        self.drag_start = Some(point);
        self.drag_current = Some(point);
    }

    pub fn update_drag(&mut self, point: Point) {
        if self.drag_start.is_some() {
            self.drag_current = Some(point);
        }
    }

    /// Rectangle currently being dragged, for drawing the selection overlay.
    pub fn pending_rect(&self) -> Option<DisplayRect> {
        Some(DisplayRect::from_corners(self.drag_start?, self.drag_current?))
    }

    /// Finishes a drag and routes the spanned rectangle through [`select`](Self::select).
    pub fn end_drag(&mut self, point: Point) -> Option<DisplayRect> {
        let start = self.drag_start.take()?;
        self.drag_current = None;
        let rect = DisplayRect::from_corners(start, point);
        self.select(rect).then_some(rect)
    }

    /// Fires `on_select` for rectangles at least [`MIN_REGION_SIZE`] on both
    /// axes. Returns whether the selection was accepted.
    pub fn select(&mut self, rect: DisplayRect) -> bool {
        if rect.width < MIN_REGION_SIZE || rect.height < MIN_REGION_SIZE {
            log::debug!(
                "Ignoring {:.0}x{:.0} region, below the {}px minimum",
                rect.width,
                rect.height,
                MIN_REGION_SIZE
            );
            return false;
        }
        if let Some(callback) = self.on_select.as_mut() {
            callback(rect);
        }
        true
    }

    pub fn cancel(&mut self) {
        self.drag_start = None;
        self.drag_current = None;
        if let Some(callback) = self.on_cancel.as_mut() {
            callback();
        }
    }
}

/// Crops `raw` to `rect`, given in a display of `display_width` x `display_height`.
/// Each axis is scaled independently from display to native pixels.
pub fn crop(raw: &EncodedImage, rect: DisplayRect, display_width: f64, display_height: f64) -> Result<EncodedImage> {
    if display_width <= 0.0 || display_height <= 0.0 {
        anyhow::bail!("Display size must be positive, got {}x{}", display_width, display_height);
    }
    let image = raw.decode().context("Failed to decode capture for cropping")?;
    let (native_w, native_h) = (image.width(), image.height());
    let scale_x = f64::from(native_w) / display_width;
    let scale_y = f64::from(native_h) / display_height;

    let x0 = (rect.x * scale_x).round().clamp(0.0, f64::from(native_w)) as u32;
    let y0 = (rect.y * scale_y).round().clamp(0.0, f64::from(native_h)) as u32;
    let x1 = ((rect.x + rect.width) * scale_x).round().clamp(0.0, f64::from(native_w)) as u32;
    let y1 = ((rect.y + rect.height) * scale_y).round().clamp(0.0, f64::from(native_h)) as u32;
    if x1 <= x0 || y1 <= y0 {
        anyhow::bail!("Crop region lies outside the captured image");
    }

    log::info!(
        "Cropping {}x{} capture to {}x{} at ({}, {})",
        native_w,
        native_h,
        x1 - x0,
        y1 - y0,
        x0,
        y0
    );
    let rgba = image.to_rgba8();
    let cropped = imageops::crop_imm(&rgba, x0, y0, x1 - x0, y1 - y0).to_image();
    EncodedImage::encode_png(&cropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use std::sync::{Arc, Mutex};

    fn capture(width: u32, height: u32) -> (RgbaImage, EncodedImage) {
        let img = RgbaImage::from_fn(width, height, |x, y| Rgba([(x % 256) as u8, (y % 256) as u8, 7, 255]));
        let encoded = EncodedImage::encode_png(&img).unwrap();
        (img, encoded)
    }

    #[test]
    fn small_drags_do_not_select() {
        let selected = Arc::new(Mutex::new(Vec::new()));
        let sink = selected.clone();
        let mut selector = RegionSelector::new().on_select(move |rect| sink.lock().unwrap().push(rect));

        selector.begin_drag(Point::new(100.0, 100.0));
        assert_eq!(selector.end_drag(Point::new(115.0, 115.0)), None);
        assert!(selected.lock().unwrap().is_empty());

        selector.begin_drag(Point::new(300.0, 250.0));
        selector.update_drag(Point::new(150.0, 150.0));
        let rect = selector.end_drag(Point::new(100.0, 100.0)).unwrap();
        assert_eq!(rect, DisplayRect::new(100.0, 100.0, 200.0, 150.0));
        assert_eq!(selected.lock().unwrap().as_slice(), &[rect]);
    }

    #[test]
    fn cancel_fires_callback_and_discards_drag() {
        let cancelled = Arc::new(Mutex::new(0));
        let counter = cancelled.clone();
        let mut selector = RegionSelector::new().on_cancel(move || *counter.lock().unwrap() += 1);
        selector.begin_drag(Point::new(1.0, 1.0));
        selector.cancel();
        assert_eq!(*cancelled.lock().unwrap(), 1);
        assert!(selector.pending_rect().is_none());
        assert_eq!(selector.end_drag(Point::new(90.0, 90.0)), None);
    }

    #[test]
    fn full_display_crop_reproduces_capture() {
        let (img, encoded) = capture(80, 60);
        let cropped = crop(&encoded, DisplayRect::new(0.0, 0.0, 40.0, 30.0), 40.0, 30.0).unwrap();
        assert_eq!(cropped.decode_rgba().unwrap(), img);
    }

    #[test]
    fn crop_scales_to_native_resolution() {
        let (img, encoded) = capture(800, 600);
        let rect = DisplayRect::new(100.0, 50.0, 200.0, 150.0);
        let cropped = crop(&encoded, rect, 400.0, 300.0).unwrap().decode_rgba().unwrap();
        assert_eq!(cropped.dimensions(), (400, 300));
        assert_eq!(cropped.get_pixel(0, 0), img.get_pixel(200, 100));
    }

    #[test]
    fn crop_handles_non_uniform_scale() {
        let (_, encoded) = capture(300, 100);
        let cropped = crop(&encoded, DisplayRect::new(0.0, 0.0, 50.0, 50.0), 100.0, 100.0)
            .unwrap()
            .decode_rgba()
            .unwrap();
        assert_eq!(cropped.dimensions(), (150, 50));
    }

    #[test]
    fn crop_outside_image_fails() {
        let (_, encoded) = capture(10, 10);
        assert!(crop(&encoded, DisplayRect::new(20.0, 20.0, 5.0, 5.0), 10.0, 10.0).is_err());
    }
}
