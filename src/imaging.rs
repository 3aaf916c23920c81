use std::{io::Cursor, path::Path};

use image::{ImageFormat, RgbImage, imageops::FilterType};

use crate::{error::ServiceError, export::write_atomically};

/// Edge length of the square raster fed to the image-to-3D pipeline.
pub const SHAPE_IMAGE_SIZE: u32 = 256;

/// Decodes an uploaded image and normalizes it to a 256x256 RGB raster.
pub fn decode_upload(bytes: &[u8]) -> Result<RgbImage, ServiceError> {
    if bytes.is_empty() {
        return Err(ServiceError::BadRequest("Empty file received".into()));
    }

    let decoded = image::load_from_memory(bytes)
        .map_err(|e| ServiceError::BadRequest(format!("Invalid image format: {e}")))?;

    Ok(image::imageops::resize(
        &decoded.to_rgb8(),
        SHAPE_IMAGE_SIZE,
        SHAPE_IMAGE_SIZE,
        FilterType::CatmullRom,
    ))
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, ServiceError> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Saves `image` as a PNG at `path`.
pub fn write_png(image: &RgbImage, path: &Path) -> Result<(), ServiceError> {
    let bytes = encode_png(image)?;
    write_atomically(path, &bytes)
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    #[test]
    fn empty_upload_is_a_client_error() {
        let err = decode_upload(&[]).unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(ref msg) if msg == "Empty file received"));
    }

    #[test]
    fn garbage_upload_is_a_client_error() {
        let err = decode_upload(b"definitely not an image").unwrap_err();
        match err {
            ServiceError::BadRequest(msg) => assert!(msg.starts_with("Invalid image format")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn uploads_are_resized_to_a_fixed_rgb_raster() {
        let source = RgbImage::from_pixel(640, 120, Rgb([200, 10, 30]));
        let png = encode_png(&source).unwrap();

        let decoded = decode_upload(&png).unwrap();
        assert_eq!(decoded.dimensions(), (SHAPE_IMAGE_SIZE, SHAPE_IMAGE_SIZE));
        assert_eq!(decoded.get_pixel(128, 128), &Rgb([200, 10, 30]));
    }

    #[test]
    fn png_round_trips_through_disk() {
        let path = std::env::temp_dir().join(format!("texture-{}.png", uuid::Uuid::new_v4()));
        let texture = RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]));
        write_png(&texture, &path).unwrap();

        let reloaded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(reloaded, texture);
        std::fs::remove_file(path).unwrap();
    }
}
