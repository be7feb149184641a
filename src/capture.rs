//! Capture input boundary and the single live capture surface.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::annotate::Compositor;
use crate::image_data::EncodedImage;
use crate::models::{DisplayRect, Screenshot};
use crate::region::{self, RegionSelector};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    Fullscreen,
    Region,
}

/// What the platform capture mechanism hands over.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CaptureInput {
    pub raw_image_data_uri: String,
    pub mode: CaptureMode,
}

pub enum SurfacePhase {
    SelectingRegion(RegionSelector),
    Annotating(Compositor),
}

pub struct CaptureSurface {
    raw_image: EncodedImage,
    display_size: (f64, f64),
    crop_region: Option<DisplayRect>,
    phase: SurfacePhase,
}

impl CaptureSurface {
    pub fn open(input: &CaptureInput, display_width: f64, display_height: f64) -> Result<Self> {
        let raw_image = EncodedImage::from_data_uri(&input.raw_image_data_uri)?;
        let phase = match input.mode {
            CaptureMode::Region => SurfacePhase::SelectingRegion(RegionSelector::new()),
            CaptureMode::Fullscreen => {
                let mut compositor = Compositor::from_encoded(&raw_image)?;
                compositor.set_display_size(display_width, display_height);
                SurfacePhase::Annotating(compositor)
            }
        };
        Ok(Self {
            raw_image,
            display_size: (display_width, display_height),
            crop_region: None,
            phase,
        })
    }

    pub fn phase(&self) -> &SurfacePhase {
        &self.phase
    }

    pub fn selector_mut(&mut self) -> Option<&mut RegionSelector> {
        match &mut self.phase {
            SurfacePhase::SelectingRegion(selector) => Some(selector),
            SurfacePhase::Annotating(_) => None,
        }
    }

    pub fn compositor_mut(&mut self) -> Option<&mut Compositor> {
        match &mut self.phase {
            SurfacePhase::Annotating(compositor) => Some(compositor),
            SurfacePhase::SelectingRegion(_) => None,
        }
    }

    /// Accepts a region and moves to annotation over the cropped raster, which
    /// becomes the native image for all later coordinates. Returns `Ok(false)`
    /// when the selector rejects the rectangle.
    pub fn select_region(&mut self, rect: DisplayRect) -> Result<bool> {
        let Some(selector) = self.selector_mut() else {
            return Ok(false);
        };
        if !selector.select(rect) {
            return Ok(false);
        }
        let (display_w, display_h) = self.display_size;
        let cropped = region::crop(&self.raw_image, rect, display_w, display_h)?;
        let mut compositor = Compositor::from_encoded(&cropped)?;
        compositor.set_display_size(rect.width, rect.height);
        self.raw_image = cropped;
        self.crop_region = Some(rect);
        self.phase = SurfacePhase::Annotating(compositor);
        Ok(true)
    }

    /// Produces the screenshot for the next user message. Flattening happens
    /// later, when the message is sent.
    pub fn finish(self) -> Screenshot {
        let shapes = match self.phase {
            SurfacePhase::Annotating(compositor) => compositor.into_shapes(),
            SurfacePhase::SelectingRegion(_) => Vec::new(),
        };
        Screenshot {
            raw_image: self.raw_image,
            shapes,
            flattened_image: None,
            captured_at: Utc::now(),
            crop_region: self.crop_region,
        }
    }
}

/// Keeps at most one capture surface alive.
#[derive(Default)]
pub struct CaptureManager {
    active: Option<CaptureSurface>,
}

impl CaptureManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a surface for `input`, tearing down any surface still open.
    pub fn open(&mut self, input: &CaptureInput, display_width: f64, display_height: f64) -> Result<&mut CaptureSurface> {
        if self.active.take().is_some() {
            log::info!("Closing previous capture surface before opening a new one");
        }
        let surface = CaptureSurface::open(input, display_width, display_height)?;
        log::info!("Opened {:?} capture surface", input.mode);
        Ok(self.active.insert(surface))
    }

    pub fn active_mut(&mut self) -> Option<&mut CaptureSurface> {
        self.active.as_mut()
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    pub fn close(&mut self) {
        if let Some(mut surface) = self.active.take() {
            if let Some(selector) = surface.selector_mut() {
                selector.cancel();
            }
        }
    }

    /// Closes the active surface and returns its screenshot.
    pub fn finish(&mut self) -> Option<Screenshot> {
        self.active.take().map(CaptureSurface::finish)
    }
}
