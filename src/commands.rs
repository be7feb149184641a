// Command handlers exposed to the host (CLI today). Errors are flattened to
// user-facing strings here; the layers below keep typed errors.

use crate::annotate::Compositor;
use crate::capture::{CaptureInput, CaptureManager, CaptureMode};
use crate::chat::{ConversationAssembler, OutgoingMessage, TurnEvent, TurnOutcome};
use crate::image_data::EncodedImage;
use crate::models::{Conversation, DisplayRect, Point, ProviderId, Screenshot, Shape, ShapeKind};
use anyhow::{Context, Result};
use image::GenericImageView;
use std::path::Path;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

// List all conversations, newest first
pub async fn list_conversations(assembler: &ConversationAssembler) -> Result<Vec<Conversation>, String> {
    log::info!("Host requested to list conversations");
    match assembler.state().storage.list_conversations().await {
        Ok(conversations) => Ok(conversations),
        Err(e) => {
            log::error!("Failed to list conversations: {:?}", e);
            Err(format!("Failed to load conversations: {}", e))
        }
    }
}

pub async fn create_conversation(
    assembler: &ConversationAssembler,
    provider: Option<ProviderId>,
    project_id: Option<Uuid>,
) -> Result<Conversation, String> {
    match assembler.create_conversation(provider, project_id).await {
        Ok(conversation) => {
            log::info!("Created conversation {}", conversation.id);
            Ok(conversation)
        }
        Err(e) => {
            log::error!("Failed to create conversation: {:?}", e);
            Err(format!("Failed to create conversation: {}", e))
        }
    }
}

pub async fn get_conversation(assembler: &ConversationAssembler, conversation_id: Uuid) -> Result<Conversation, String> {
    log::info!("Host requested conversation ID: {}", conversation_id);
    match assembler.state().storage.get_conversation(conversation_id).await {
        Ok(Some(conversation)) => Ok(conversation),
        Ok(None) => Err(format!("Conversation {} not found", conversation_id)),
        Err(e) => {
            log::error!("Failed to get conversation {}: {:?}", conversation_id, e);
            Err(format!("Failed to load conversation: {}", e))
        }
    }
}

pub async fn delete_conversation(assembler: &ConversationAssembler, conversation_id: Uuid) -> Result<(), String> {
    log::warn!("[CMD] Host requested to delete conversation ID: {}", conversation_id);
    match assembler.state().storage.delete_conversation(conversation_id).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(format!("Conversation {} not found", conversation_id)),
        Err(e) => {
            log::error!("[CMD] Failed to delete conversation {}: {:?}", conversation_id, e);
            Err(format!("Failed to delete conversation: {}", e))
        }
    }
}

/// Sends a message, creating a conversation first when `conversation_id` is
/// `None`. Progress is reported through `events`.
pub async fn send_message(
    assembler: &ConversationAssembler,
    conversation_id: Option<Uuid>,
    provider: Option<ProviderId>,
    outgoing: OutgoingMessage,
    events: Option<UnboundedSender<TurnEvent>>,
) -> Result<TurnOutcome, String> {
    let conversation_id = match conversation_id {
        Some(id) => id,
        None => create_conversation(assembler, provider, None).await?.id,
    };
    log::info!("Host requested to send message to conversation ID: {}", conversation_id);

    // --- Trigger the turn in background ---
    let handle = assembler.spawn_send(conversation_id, outgoing, events);
    match handle.await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => {
            log::error!("Failed to send message to {}: {}", conversation_id, e);
            Err(format!("Failed to send message: {}", e))
        }
        Err(e) => {
            log::error!("Turn task for {} did not complete: {:?}", conversation_id, e);
            Err(format!("Failed to send message: {}", e))
        }
    }
}

/// Where and how a captured image is shown, plus what to do with it.
#[derive(Clone, Debug, Default)]
pub struct CaptureRequest {
    /// Crop rectangle in display coordinates; switches to region mode.
    pub region: Option<DisplayRect>,
    /// Size the full capture is shown at; defaults to its native size.
    pub display_size: Option<(f64, f64)>,
    /// Annotation gestures, in display coordinates of the annotation surface.
    pub annotations: Vec<Shape>,
}

/// Runs a captured image through the capture surface: optional region crop,
/// then the annotation gestures replayed on the compositor.
pub fn capture_screenshot(image: EncodedImage, request: &CaptureRequest) -> Result<Screenshot> {
    let (native_w, native_h) = image.decode()?.dimensions();
    let (display_w, display_h) = request
        .display_size
        .unwrap_or((f64::from(native_w), f64::from(native_h)));
    let input = CaptureInput {
        raw_image_data_uri: image.to_data_uri(),
        mode: if request.region.is_some() {
            CaptureMode::Region
        } else {
            CaptureMode::Fullscreen
        },
    };

    let mut manager = CaptureManager::new();
    let surface = manager.open(&input, display_w, display_h)?;
    if let Some(rect) = request.region {
        if !surface.select_region(rect)? {
            anyhow::bail!(
                "Region {}x{} is below the minimum selectable size",
                rect.width,
                rect.height
            );
        }
    }

    let compositor = surface
        .compositor_mut()
        .context("Capture surface is not ready for annotation")?;
    for shape in &request.annotations {
        compositor.set_tool(shape.kind);
        compositor.set_color(shape.color);
        compositor.set_stroke_width(shape.stroke_width);
        replay_gesture(compositor, shape);
    }
    if compositor.shapes().len() != request.annotations.len() {
        log::warn!(
            "{} of {} annotations were dropped as incomplete",
            request.annotations.len() - compositor.shapes().len(),
            request.annotations.len()
        );
    }

    manager.finish().context("Capture surface closed unexpectedly")
}

fn replay_gesture(compositor: &mut Compositor, shape: &Shape) {
    let Some((&first, rest)) = shape.points.split_first() else {
        return;
    };
    if shape.kind == ShapeKind::TextLabel {
        let text = shape.text.clone();
        compositor.set_text_prompt(move |_: Point| text.clone());
        compositor.begin_gesture(first);
        return;
    }
    compositor.begin_gesture(first);
    let Some((&last, middle)) = rest.split_last() else {
        compositor.end_gesture(first);
        return;
    };
    for &point in middle {
        compositor.update_gesture(point);
    }
    compositor.end_gesture(last);
}

/// Reads an image file and tags it with a MIME type from its content.
pub fn load_image_file(path: &Path) -> Result<EncodedImage> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read image '{}'", path.display()))?;
    let format = image::guess_format(&bytes).with_context(|| format!("Unrecognised image format in '{}'", path.display()))?;
    Ok(EncodedImage::from_bytes(format.to_mime_type(), &bytes))
}

pub fn load_annotations(path: &Path) -> Result<Vec<Shape>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read annotations '{}'", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse annotations '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::models::Color;
    use crate::state::AppState;
    use crate::storage::SqliteStore;
    use image::{Rgba, RgbaImage};
    use std::sync::Arc;

    fn png(width: u32, height: u32) -> EncodedImage {
        EncodedImage::encode_png(&RgbaImage::from_pixel(width, height, Rgba([240, 240, 240, 255]))).unwrap()
    }

    fn shape(kind: ShapeKind, points: &[(f64, f64)], text: Option<&str>) -> Shape {
        Shape {
            kind,
            points: points.iter().map(|&(x, y)| Point::new(x, y)).collect(),
            color: Color::RED,
            stroke_width: 2.0,
            text: text.map(str::to_string),
        }
    }

    #[test]
    fn capture_replays_annotations_in_order() {
        let request = CaptureRequest {
            region: None,
            display_size: Some((50.0, 40.0)),
            annotations: vec![
                shape(ShapeKind::Arrow, &[(1.0, 1.0), (5.0, 5.0), (20.0, 20.0)], None),
                shape(ShapeKind::TextLabel, &[(10.0, 10.0)], Some("here")),
                shape(ShapeKind::Rectangle, &[(3.0, 3.0)], None),
            ],
        };
        let shot = capture_screenshot(png(100, 80), &request).unwrap();

        // Display is half the native size, so points double
        assert_eq!(shot.shapes.len(), 2);
        assert_eq!(shot.shapes[0].points.len(), 3);
        assert_eq!(shot.shapes[0].points[2], Point::new(40.0, 40.0));
        assert_eq!(shot.shapes[1].text.as_deref(), Some("here"));
        assert_eq!(shot.shapes[1].points, vec![Point::new(20.0, 20.0)]);
        assert!(shot.crop_region.is_none());
    }

    #[test]
    fn capture_with_region_crops_first() {
        let request = CaptureRequest {
            region: Some(DisplayRect::new(10.0, 10.0, 30.0, 20.0)),
            display_size: None,
            annotations: Vec::new(),
        };
        let shot = capture_screenshot(png(100, 80), &request).unwrap();
        assert_eq!(shot.raw_image.decode_rgba().unwrap().dimensions(), (30, 20));
        assert_eq!(shot.crop_region, request.region);

        let tiny = CaptureRequest {
            region: Some(DisplayRect::new(0.0, 0.0, 15.0, 15.0)),
            ..CaptureRequest::default()
        };
        assert!(capture_screenshot(png(100, 80), &tiny).is_err());
    }

    #[test]
    fn annotations_file_and_image_file_load() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("shot.png");
        std::fs::write(&image_path, png(4, 4).bytes().unwrap()).unwrap();
        let loaded = load_image_file(&image_path).unwrap();
        assert_eq!(loaded.mime_type, "image/png");

        let annotations_path = dir.path().join("shapes.json");
        std::fs::write(
            &annotations_path,
            r##"[{"kind": "highlight", "points": [{"x": 0, "y": 0}, {"x": 2, "y": 2}], "color": "#ffcc00", "stroke_width": 1}]"##,
        )
        .unwrap();
        let shapes = load_annotations(&annotations_path).unwrap();
        assert_eq!(shapes[0].kind, ShapeKind::Highlight);
        assert_eq!(shapes[0].color, Color::rgb(255, 204, 0));
    }

    #[tokio::test]
    async fn conversation_commands_report_missing_ids() {
        let store = SqliteStore::in_memory().await.unwrap();
        let assembler = ConversationAssembler::new(AppState::new(Arc::new(store), Settings::default()));

        let conv = create_conversation(&assembler, None, None).await.unwrap();
        assert_eq!(conv.provider, ProviderId::Ollama);
        assert_eq!(list_conversations(&assembler).await.unwrap().len(), 1);

        delete_conversation(&assembler, conv.id).await.unwrap();
        let err = delete_conversation(&assembler, conv.id).await.unwrap_err();
        assert!(err.contains("not found"));
        assert!(get_conversation(&assembler, conv.id).await.is_err());
    }
}
