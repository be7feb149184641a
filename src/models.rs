use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::image_data::EncodedImage;

/// Titles longer than this are cut and suffixed with [`TITLE_ELLIPSIS`].
pub const TITLE_MAX_CHARS: usize = 60;
pub const TITLE_ELLIPSIS: &str = "...";

// A point in image-pixel space (native resolution of the background).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Arrow,
    Rectangle,
    Highlight,
    Freehand,
    TextLabel,
}

impl ShapeKind {
    /// Minimum number of captured points for a gesture of this kind to be committed.
    pub fn min_points(self) -> usize {
        match self {
            ShapeKind::Arrow | ShapeKind::Rectangle | ShapeKind::Highlight => 2,
            ShapeKind::Freehand | ShapeKind::TextLabel => 1,
        }
    }
}

/// RGBA color. Serialized as a `#rrggbb` / `#rrggbbaa` hex string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const RED: Color = Color::rgb(255, 59, 48);
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const WHITE: Color = Color::rgb(255, 255, 255);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub fn with_alpha(self, a: u8) -> Self {
        Self { a, ..self }
    }

    /// Relative luminance in `0.0..=1.0`.
    pub fn luma(self) -> f64 {
        (0.2126 * f64::from(self.r) + 0.7152 * f64::from(self.g) + 0.0722 * f64::from(self.b))
            / 255.0
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::RED
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid color: {0}")]
pub struct ParseColorError(String);

impl FromStr for Color {
    type Err = ParseColorError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let s = raw.trim();
        let invalid = || ParseColorError(raw.to_string());
        let hex_byte = |h: &str| u8::from_str_radix(h, 16).map_err(|_| invalid());

        if let Some(hex) = s.strip_prefix('#') {
            if !hex.is_ascii() {
                return Err(invalid());
            }
            return match hex.len() {
                3 => {
                    let mut channels = [0u8; 3];
                    for (i, ch) in hex.chars().enumerate() {
                        let v = ch.to_digit(16).ok_or_else(invalid)? as u8;
                        channels[i] = v * 17;
                    }
                    Ok(Color::rgb(channels[0], channels[1], channels[2]))
                }
                6 => Ok(Color::rgb(
                    hex_byte(&hex[0..2])?,
                    hex_byte(&hex[2..4])?,
                    hex_byte(&hex[4..6])?,
                )),
                8 => Ok(Color {
                    r: hex_byte(&hex[0..2])?,
                    g: hex_byte(&hex[2..4])?,
                    b: hex_byte(&hex[4..6])?,
                    a: hex_byte(&hex[6..8])?,
                }),
                _ => Err(invalid()),
            };
        }

        let lower = s.to_ascii_lowercase();
        let body = lower
            .strip_prefix("rgba(")
            .or_else(|| lower.strip_prefix("rgb("))
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(invalid)?;
        let parts: Vec<f64> = body
            .split(',')
            .map(|p| p.trim().parse::<f64>().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?;
        let channel = |v: f64| v.round().clamp(0.0, 255.0) as u8;
        match parts.as_slice() {
            [r, g, b] => Ok(Color::rgb(channel(*r), channel(*g), channel(*b))),
            [r, g, b, a] => {
                // CSS alpha is 0..1, but accept 0..255 as well
                let alpha = if *a <= 1.0 { channel(a * 255.0) } else { channel(*a) };
                Ok(Color {
                    r: channel(*r),
                    g: channel(*g),
                    b: channel(*b),
                    a: alpha,
                })
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.a == 255 {
            write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            write!(f, "#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
        }
    }
}

impl Serialize for Color {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One committed annotation. Arrow, Rectangle and Highlight only use the first
/// and last point for geometry; the intermediate drag points are kept as recorded.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Shape {
    pub kind: ShapeKind,
    pub points: Vec<Point>,
    pub color: Color,
    pub stroke_width: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Shape {
    pub fn is_valid(&self) -> bool {
        if self.points.len() < self.kind.min_points() || self.stroke_width <= 0.0 {
            return false;
        }
        match self.kind {
            ShapeKind::TextLabel => self.text.as_deref().is_some_and(|t| !t.is_empty()),
            _ => self.text.is_none(),
        }
    }

    /// First and last point, the only geometry two-point shapes depend on.
    pub fn endpoints(&self) -> Option<(Point, Point)> {
        Some((*self.points.first()?, *self.points.last()?))
    }
}

/// A rectangle in display (on-screen) coordinates.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct DisplayRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl DisplayRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle spanned by two corners dragged in any direction.
    pub fn from_corners(a: Point, b: Point) -> Self {
        Self {
            x: a.x.min(b.x),
            y: a.y.min(b.y),
            width: (a.x - b.x).abs(),
            height: (a.y - b.y).abs(),
        }
    }
}

// A captured image and the annotations drawn over it
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Screenshot {
    pub raw_image: EncodedImage,
    #[serde(default)]
    pub shapes: Vec<Shape>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flattened_image: Option<EncodedImage>,
    #[serde(default = "Utc::now")]
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_region: Option<DisplayRect>,
}

impl Screenshot {
    pub fn new(raw_image: EncodedImage, shapes: Vec<Shape>) -> Self {
        Self {
            raw_image,
            shapes,
            flattened_image: None,
            captured_at: Utc::now(),
            crop_region: None,
        }
    }

    /// The image sent to a provider: the flattened composite, or the raw capture
    /// when nothing has been flattened yet.
    pub fn outgoing_image(&self) -> &EncodedImage {
        self.flattened_image.as_ref().unwrap_or(&self.raw_image)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(anyhow::anyhow!("Unknown message role: {}", other)),
        }
    }
}

// Represents a single message in a conversation
/// How a turn ended. Stored on the assistant reply; user messages are always
/// `Completed`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    #[default]
    Completed,
    /// Provider disabled or missing credentials; no request was made.
    NotConfigured,
    /// The request or stream failed.
    Failed,
}

impl TurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnStatus::Completed => "completed",
            TurnStatus::NotConfigured => "not_configured",
            TurnStatus::Failed => "failed",
        }
    }
}

impl FromStr for TurnStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(TurnStatus::Completed),
            "not_configured" => Ok(TurnStatus::NotConfigured),
            "failed" => Ok(TurnStatus::Failed),
            other => Err(anyhow::anyhow!("Unknown turn status: {}", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    #[serde(default = "Uuid::new_v4")] // Generate a new UUID if missing during deserialization
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    // Only user messages carry a screenshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<Screenshot>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_used: Option<ProviderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(default)]
    pub status: TurnStatus,
}

impl Message {
    pub fn user(text: impl Into<String>, screenshot: Option<Screenshot>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            text: text.into(),
            screenshot,
            timestamp: Utc::now(),
            provider_used: None,
            model_used: None,
            status: TurnStatus::Completed,
        }
    }

    pub fn assistant(text: impl Into<String>, provider: ProviderId, model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Assistant,
            text: text.into(),
            screenshot: None,
            timestamp: Utc::now(),
            provider_used: Some(provider),
            model_used: Some(model.into()),
            status: TurnStatus::Completed,
        }
    }

    /// Error and not-configured replies describe a failure to the user; they
    /// are not the model's words and stay out of provider history.
    pub fn belongs_in_history(&self) -> bool {
        self.status == TurnStatus::Completed
    }

    /// Encoded image to attach when sending this message to a provider.
    pub fn image(&self) -> Option<&EncodedImage> {
        self.screenshot.as_ref().map(Screenshot::outgoing_image)
    }
}

// Represents a conversation thread and its messages
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Conversation {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    // Set once from the first user-authored text, never overwritten
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub provider: ProviderId,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("New conversation")
    }
}

/// Derives a conversation title from user text. Returns `None` for blank text.
pub fn derive_title(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        return Some(trimmed.to_string());
    }
    let cut: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    Some(format!("{}{}", cut.trim_end(), TITLE_ELLIPSIS))
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Anthropic,
    OpenAi,
    Gemini,
    Groq,
    OpenRouter,
    Ollama,
}

impl ProviderId {
    pub const ALL: [ProviderId; 6] = [
        ProviderId::Anthropic,
        ProviderId::OpenAi,
        ProviderId::Gemini,
        ProviderId::Groq,
        ProviderId::OpenRouter,
        ProviderId::Ollama,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::Anthropic => "anthropic",
            ProviderId::OpenAi => "openai",
            ProviderId::Gemini => "gemini",
            ProviderId::Groq => "groq",
            ProviderId::OpenRouter => "openrouter",
            ProviderId::Ollama => "ollama",
        }
    }

    /// Self-hosted providers run without credentials.
    pub fn requires_api_key(self) -> bool {
        !matches!(self, ProviderId::Ollama)
    }

    pub fn default_model(self) -> &'static str {
        match self {
            ProviderId::Anthropic => "claude-3-5-sonnet-latest",
            ProviderId::OpenAi => "gpt-4o-mini",
            ProviderId::Gemini => "gemini-1.5-flash",
            ProviderId::Groq => "llama-3.2-90b-vision-preview",
            ProviderId::OpenRouter => "openai/gpt-4o-mini",
            ProviderId::Ollama => "llava",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderId::Anthropic => "https://api.anthropic.com",
            ProviderId::OpenAi => "https://api.openai.com/v1",
            ProviderId::Gemini => "https://generativelanguage.googleapis.com",
            ProviderId::Groq => "https://api.groq.com/openai/v1",
            ProviderId::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderId::Ollama => "http://localhost:11434",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderId::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("Unknown provider: {}", s))
    }
}

// Represents a configured provider endpoint/model
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProviderConfig {
    pub provider_id: ProviderId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    // Reference to a key stored elsewhere: 'keyring' or 'env:MY_API_KEY'
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_ref: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub enabled: bool,
}

impl ProviderConfig {
    pub fn new(provider_id: ProviderId) -> Self {
        Self {
            provider_id,
            api_key: None,
            api_key_ref: None,
            model: provider_id.default_model().to_string(),
            base_url: None,
            enabled: false,
        }
    }

    pub fn effective_model(&self) -> &str {
        if self.model.trim().is_empty() {
            self.provider_id.default_model()
        } else {
            self.model.trim()
        }
    }

    pub fn effective_base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| self.provider_id.default_base_url())
            .trim_end_matches('/')
    }
}
