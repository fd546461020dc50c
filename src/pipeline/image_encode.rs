use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use tracing::warn;

pub const MAX_DIMENSION: u32 = 1600;
pub const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub base64: String,
    pub mime: String,
    pub transcoded: bool,
}

impl EncodedImage {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.base64)
    }
}

/// Shrinks decodable images to fit `MAX_DIMENSION` and re-encodes them as
/// JPEG. Anything the codec cannot read is sent as the original bytes.
pub fn encode_image_bytes(path: &Path, bytes: &[u8]) -> EncodedImage {
    match transcode_for_vision(path, bytes, MAX_DIMENSION, JPEG_QUALITY) {
        Ok(Some(jpeg)) => EncodedImage {
            base64: BASE64_STANDARD.encode(jpeg.as_slice()),
            mime: String::from("image/jpeg"),
            transcoded: true,
        },
        Ok(None) => raw_encoding(path, bytes),
        Err(error) => {
            warn!(
                path = %path.display(),
                %error,
                "image optimization failed; sending original bytes"
            );
            raw_encoding(path, bytes)
        }
    }
}

/// `Ok(None)` when no codec is available for the file.
pub fn transcode_for_vision(
    path: &Path,
    bytes: &[u8],
    max_dimension: u32,
    quality: u8,
) -> Result<Option<Vec<u8>>, image::ImageError> {
    let Some(format) = codec_format(path, bytes) else {
        return Ok(None);
    };
    let decoded = image::load_from_memory_with_format(bytes, format)?;
    let flattened = match decoded {
        DynamicImage::ImageRgb8(_) | DynamicImage::ImageLuma8(_) => decoded,
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    };
    let resized = if flattened.width() > max_dimension || flattened.height() > max_dimension {
        flattened.thumbnail(max_dimension, max_dimension)
    } else {
        flattened
    };

    let mut out = Vec::new();
    resized.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))?;
    Ok(Some(out))
}

fn codec_format(path: &Path, bytes: &[u8]) -> Option<ImageFormat> {
    let format = image::guess_format(bytes)
        .ok()
        .or_else(|| ImageFormat::from_path(path).ok())?;
    format.reading_enabled().then_some(format)
}

fn raw_encoding(path: &Path, bytes: &[u8]) -> EncodedImage {
    EncodedImage {
        base64: BASE64_STANDARD.encode(bytes),
        mime: mime_for_path(path),
        transcoded: false,
    }
}

pub fn mime_for_path(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|v| v.to_str())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => String::from("image/png"),
        "webp" => String::from("image/webp"),
        "bmp" => String::from("image/bmp"),
        "tif" | "tiff" => String::from("image/tiff"),
        "gif" => String::from("image/gif"),
        "heic" | "heif" => String::from("image/heif"),
        _ => String::from("image/jpeg"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, Rgba};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgba([(x % 255) as u8, (y % 255) as u8, 128u8, 200u8])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .expect("png should encode");
        out.into_inner()
    }

    fn decode_base64(encoded: &EncodedImage) -> DynamicImage {
        let bytes = BASE64_STANDARD
            .decode(encoded.base64.as_bytes())
            .expect("payload should be base64");
        image::load_from_memory(bytes.as_slice()).expect("payload should decode")
    }

    #[test]
    fn large_images_are_downscaled_to_jpeg() {
        let img = ImageBuffer::from_pixel(2000, 1000, Rgb([10u8, 20, 30]));
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut bytes, ImageFormat::Png)
            .expect("png should encode");

        let encoded = encode_image_bytes(Path::new("/photos/wide.png"), bytes.get_ref());

        assert!(encoded.transcoded);
        assert_eq!(encoded.mime, "image/jpeg");
        assert!(encoded.data_url().starts_with("data:image/jpeg;base64,"));
        let decoded = decode_base64(&encoded);
        assert_eq!((decoded.width(), decoded.height()), (1600, 800));
    }

    #[test]
    fn small_images_keep_their_size_and_lose_alpha() {
        let encoded = encode_image_bytes(Path::new("/photos/icon.png"), png_bytes(64, 48).as_slice());

        let decoded = decode_base64(&encoded);
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
        assert!(!decoded.color().has_alpha());
    }

    #[test]
    fn unknown_formats_are_sent_raw_with_extension_mime() {
        let bytes = b"not really an image";

        let raw = encode_image_bytes(Path::new("/photos/IMG_1.CR3"), bytes);
        assert!(!raw.transcoded);
        assert_eq!(raw.mime, "image/jpeg");
        assert_eq!(raw.base64, BASE64_STANDARD.encode(bytes));

        let broken_png = encode_image_bytes(Path::new("/photos/broken.png"), bytes);
        assert!(!broken_png.transcoded);
        assert_eq!(broken_png.mime, "image/png");
    }

    #[test]
    fn mime_lookup_defaults_to_jpeg() {
        assert_eq!(mime_for_path(Path::new("a.WEBP")), "image/webp");
        assert_eq!(mime_for_path(Path::new("a.nef")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("noext")), "image/jpeg");
    }
}
