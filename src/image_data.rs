use std::io::Cursor;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::{DynamicImage, ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};

pub const PNG_MIME: &str = "image/png";

/// An encoded raster carried as base64 with its mime type.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime_type: String,
    /// Base64 payload without the `data:` prefix.
    pub data: String,
}

impl EncodedImage {
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: BASE64.encode(bytes),
        }
    }

    /// Parses a `data:<mime>;base64,<payload>` URI.
    pub fn from_data_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .trim()
            .strip_prefix("data:")
            .context("Image data URI must start with 'data:'")?;
        let (header, payload) = rest
            .split_once(',')
            .context("Image data URI is missing the ',' separator")?;
        let mime_type = header
            .strip_suffix(";base64")
            .context("Only base64 image data URIs are supported")?;
        if !mime_type.starts_with("image/") {
            anyhow::bail!("Data URI does not carry an image: {}", mime_type);
        }
        Ok(Self {
            mime_type: mime_type.to_string(),
            data: payload.to_string(),
        })
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(self.data.as_bytes())
            .context("Failed to decode base64 image payload")
    }

    pub fn decode(&self) -> Result<DynamicImage> {
        let bytes = self.bytes()?;
        let format = ImageFormat::from_mime_type(&self.mime_type);
        let image = match format {
            Some(format) => image::load_from_memory_with_format(&bytes, format),
            None => image::load_from_memory(&bytes),
        };
        image.context(format!("Failed to decode {} image", self.mime_type))
    }

    pub fn decode_rgba(&self) -> Result<RgbaImage> {
        Ok(self.decode()?.to_rgba8())
    }

    /// Encodes a raster as PNG.
    pub fn encode_png(image: &RgbaImage) -> Result<Self> {
        let mut buf = Cursor::new(Vec::new());
        image
            .write_to(&mut buf, ImageFormat::Png)
            .context("Failed to encode image as PNG")?;
        Ok(Self::from_bytes(PNG_MIME, &buf.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn data_uri_roundtrips_through_png() {
        let img = RgbaImage::from_pixel(3, 2, Rgba([10, 20, 30, 255]));
        let encoded = EncodedImage::encode_png(&img).unwrap();
        assert_eq!(encoded.mime_type, PNG_MIME);

        let uri = encoded.to_data_uri();
        assert!(uri.starts_with("data:image/png;base64,"));
        let parsed = EncodedImage::from_data_uri(&uri).unwrap();
        assert_eq!(parsed, encoded);
        assert_eq!(parsed.decode_rgba().unwrap(), img);
    }

    #[test]
    fn rejects_non_image_data_uris() {
        assert!(EncodedImage::from_data_uri("data:text/plain;base64,aGk=").is_err());
        assert!(EncodedImage::from_data_uri("image/png;base64,aGk=").is_err());
        assert!(EncodedImage::from_data_uri("data:image/png,raw").is_err());
    }
}
