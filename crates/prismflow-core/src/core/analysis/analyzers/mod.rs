//! Built-in Analyzers
//!
//! - Color: quantised colour histogram (real)
//! - Objects: dimension-based labels (heuristic)
//! - Text: OCR placeholder, reports no text
//! - Metadata: dimensions, format, colour mode (real)

mod color;
mod metadata;
mod objects;
mod text;

pub use color::ColorAnalyzer;
pub use metadata::MetadataAnalyzer;
pub use objects::ObjectAnalyzer;
pub use text::TextAnalyzer;

use std::io::Cursor;

use image::{ColorType, ImageDecoder, ImageFormat, ImageReader};

use super::AnalyzerError;

/// Header-level facts about an encoded image
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ImageHeader {
    pub width: u32,
    pub height: u32,
    pub format: Option<ImageFormat>,
    pub color_type: ColorType,
}

/// Reads dimensions, format and colour type without decoding pixels
pub(crate) fn read_header(bytes: &[u8]) -> Result<ImageHeader, AnalyzerError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| AnalyzerError::Unsupported(e.to_string()))?;
    let format = reader.format();
    let decoder = reader
        .into_decoder()
        .map_err(|e| AnalyzerError::Unsupported(e.to_string()))?;
    let (width, height) = decoder.dimensions();

    Ok(ImageHeader {
        width,
        height,
        format,
        color_type: decoder.color_type(),
    })
}

/// Upper-case format name, e.g. `JPEG`
pub(crate) fn format_name(format: Option<ImageFormat>) -> String {
    match format {
        Some(ImageFormat::Jpeg) => "JPEG".to_string(),
        Some(ImageFormat::Png) => "PNG".to_string(),
        Some(ImageFormat::Gif) => "GIF".to_string(),
        Some(ImageFormat::Bmp) => "BMP".to_string(),
        Some(ImageFormat::WebP) => "WEBP".to_string(),
        Some(ImageFormat::Tiff) => "TIFF".to_string(),
        Some(other) => format!("{:?}", other).to_uppercase(),
        None => "Unknown".to_string(),
    }
}

/// Short colour mode name, e.g. `RGB`, `RGBA`, `L`
pub(crate) fn color_mode(color_type: ColorType) -> &'static str {
    match color_type {
        ColorType::L8 | ColorType::L16 => "L",
        ColorType::La8 | ColorType::La16 => "LA",
        ColorType::Rgb8 | ColorType::Rgb16 | ColorType::Rgb32F => "RGB",
        ColorType::Rgba8 | ColorType::Rgba16 | ColorType::Rgba32F => "RGBA",
        _ => "Unknown",
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Cursor;

    use image::{ImageFormat, RgbImage};

    /// Encodes an RGB image in memory
    pub fn encode(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), format)
            .unwrap();
        bytes
    }
}
