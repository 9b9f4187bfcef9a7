use image::ImageFormat;
use thiserror::Error;

pub const WEBP_MIME: &str = "image/webp";

const WEBP_EXTENSION: &str = "webp";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("webp encoder rejected raster: {0}")]
    UnsupportedRaster(String),
}

/// 8-bit RGBA pixels at the image's natural dimensions, row-major.
#[derive(Debug, Clone)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Decodes raw image bytes into an RGBA raster.
///
/// The declared mime type picks the decoder when it names a known
/// format; otherwise the format is sniffed from the bytes.
pub fn decode_raster(bytes: &[u8], mime_type: &str) -> Result<Raster, CodecError> {
    let decoded = match ImageFormat::from_mime_type(mime_type) {
        Some(format) => image::load_from_memory_with_format(bytes, format)?,
        None => image::load_from_memory(bytes)?,
    };

    let rgba = decoded.to_rgba8();
    Ok(Raster {
        width: rgba.width(),
        height: rgba.height(),
        rgba: rgba.into_raw(),
    })
}

/// Lossy WebP compression. Quality is handed to libwebp uninterpreted;
/// its own validation governs out-of-range values.
pub fn compress_webp(raster: &Raster, quality: u8) -> Result<Vec<u8>, CodecError> {
    let encoder = webp::Encoder::from_rgba(&raster.rgba, raster.width, raster.height);
    let output = encoder
        .encode_simple(false, f32::from(quality))
        .map_err(|error| CodecError::UnsupportedRaster(format!("{error:?}")))?;
    Ok(output.to_vec())
}

/// Replaces the input file's extension with `.webp`. Names without an
/// extension, and dotfiles, get the extension appended instead.
pub fn webp_file_name(name: &str) -> String {
    match name.rfind('.') {
        Some(0) | None => format!("{name}.{WEBP_EXTENSION}"),
        Some(index) => format!("{}.{}", &name[..index], WEBP_EXTENSION),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_fixture(width: u32, height: u32) -> Vec<u8> {
        let mut raster = image::RgbaImage::new(width, height);
        for (x, y, pixel) in raster.enumerate_pixels_mut() {
            *pixel = image::Rgba([(x % 256) as u8, (y % 256) as u8, 0x40, 0xff]);
        }

        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(raster)
            .write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
            .expect("encode png fixture");
        bytes
    }

    #[test]
    fn decodes_png_at_natural_dimensions() {
        let bytes = png_fixture(12, 7);
        let raster = decode_raster(&bytes, "image/png").expect("decode fixture");

        assert_eq!(raster.width, 12);
        assert_eq!(raster.height, 7);
        assert_eq!(raster.rgba.len(), 12 * 7 * 4);
    }

    #[test]
    fn sniffs_format_for_unknown_mime() {
        let bytes = png_fixture(4, 4);
        let raster = decode_raster(&bytes, "application/octet-stream").expect("sniffed decode");
        assert_eq!((raster.width, raster.height), (4, 4));
    }

    #[test]
    fn declared_mime_governs_decoding() {
        let bytes = png_fixture(4, 4);
        assert!(decode_raster(&bytes, "image/jpeg").is_err());
    }

    #[test]
    fn rejects_undecodable_bytes() {
        let error = decode_raster(b"definitely not an image", "image/png").unwrap_err();
        assert!(matches!(error, CodecError::Decode(_)));
    }

    #[test]
    fn compresses_raster_to_webp() {
        let bytes = png_fixture(16, 16);
        let raster = decode_raster(&bytes, "image/png").expect("decode fixture");
        let output = compress_webp(&raster, 75).expect("compress fixture");

        assert!(!output.is_empty());
        // RIFF container magic.
        assert_eq!(&output[..4], b"RIFF");
        assert_eq!(&output[8..12], b"WEBP");
    }

    #[test]
    fn derives_webp_file_names() {
        assert_eq!(webp_file_name("photo.png"), "photo.webp");
        assert_eq!(webp_file_name("archive.tar.gz"), "archive.tar.webp");
        assert_eq!(webp_file_name("noext"), "noext.webp");
        assert_eq!(webp_file_name(".hidden"), ".hidden.webp");
    }

    #[test]
    fn file_name_derivation_is_unicode_safe() {
        assert_eq!(webp_file_name("köln.jpeg"), "köln.webp");
        assert_eq!(webp_file_name("写真"), "写真.webp");
    }
}
