//! Input preparation: encoded bytes to a normalized grayscale tensor.

use std::path::Path;

use image::{imageops::FilterType, DynamicImage, GrayImage, Luma};
use ndarray::Array4;

use crate::error::{Error, Result};

use super::{ImageTensor, IMAGE_SIZE, INPUT_CHANNELS, NORM_MEAN, NORM_STD};

/// Resampling filter for the unconditional resize to 256x256.
///
/// `Triangle` is bilinear interpolation whose support widens when
/// downsampling, which matches the antialiased bilinear resize the generator
/// was trained with. Aspect ratio is not preserved.
pub const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// Decode image bytes and convert them to a normalized tensor.
///
/// The image is:
/// 1. Decoded (format guessed from the content)
/// 2. Converted to single-channel 8-bit luminance; 16-bit inputs are rescaled
///    to 8 bits over their full range, not clipped at 255
/// 3. Resized to 256x256 with [`RESIZE_FILTER`]
/// 4. Scaled to [0, 1], then normalized with mean 0.5 and std 0.5 to [-1, 1]
/// 5. Returned as NCHW tensor (1, 1, 256, 256)
///
/// # Errors
///
/// Returns [`Error::Decode`] if the bytes are not a supported image.
pub fn prepare(bytes: &[u8]) -> Result<ImageTensor> {
    let img = image::load_from_memory(bytes).map_err(|source| Error::Decode { source })?;

    tracing::debug!(
        width = img.width(),
        height = img.height(),
        color = ?img.color(),
        "decoded input image"
    );

    Ok(image_to_tensor(&img))
}

/// Read an image file and convert it with [`prepare`].
///
/// # Errors
///
/// Returns an error if the file cannot be read or decoded.
pub fn prepare_file<P: AsRef<Path>>(path: P) -> Result<ImageTensor> {
    let bytes = std::fs::read(path.as_ref())?;
    prepare(&bytes)
}

/// Convert a `DynamicImage` to a normalized single-channel NCHW tensor.
#[allow(clippy::cast_possible_truncation)]
fn image_to_tensor(img: &DynamicImage) -> ImageTensor {
    let gray = to_grayscale(img);

    let resized = if gray.dimensions() == (IMAGE_SIZE, IMAGE_SIZE) {
        gray
    } else {
        image::imageops::resize(&gray, IMAGE_SIZE, IMAGE_SIZE, RESIZE_FILTER)
    };

    let size = IMAGE_SIZE as usize;

    Array4::from_shape_fn((1, INPUT_CHANNELS, size, size), |(_, _, y, x)| {
        // Safe: x and y are bounded by IMAGE_SIZE (256) which fits in u32
        normalize(resized.get_pixel(x as u32, y as u32)[0])
    })
}

/// Reduce any color representation to 8-bit luminance.
///
/// Color pixels use the ITU-R 601-2 weights in fixed point, so gray inputs
/// stored as RGB map back to their original value. Wider samples (16-bit or
/// float) go through `to_rgb8`, which rescales `0..=65535` onto `0..=255`.
fn to_grayscale(img: &DynamicImage) -> GrayImage {
    if let DynamicImage::ImageLuma8(gray) = img {
        return gray.clone();
    }

    let rgb = img.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        Luma([luma_601(r, g, b)])
    })
}

/// `L = 0.299 R + 0.587 G + 0.114 B`, rounded.
#[inline]
#[allow(clippy::cast_possible_truncation)]
fn luma_601(r: u8, g: u8, b: u8) -> u8 {
    let l = 19_595 * u32::from(r) + 38_470 * u32::from(g) + 7_471 * u32::from(b) + 0x8000;
    // Safe: weights sum to 65536, so the shifted value is at most 255
    (l >> 16) as u8
}

/// Map an 8-bit pixel to the normalized [-1, 1] range.
#[inline]
fn normalize(value: u8) -> f32 {
    (f32::from(value) / 255.0 - NORM_MEAN) / NORM_STD
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, RgbImage};
    use std::io::Cursor;

    fn encode(img: &DynamicImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_tensor_shape() {
        let img = DynamicImage::new_rgb8(100, 60);
        let tensor = prepare(&encode(&img)).unwrap();

        assert_eq!(tensor.shape(), &[1, 1, 256, 256]);
    }

    #[test]
    fn test_mid_gray_is_near_zero() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(256, 256, Luma([128])));
        let tensor = prepare(&encode(&img)).unwrap();

        for &v in &tensor {
            assert!(v.abs() < 0.01, "expected ~0.0, got {v}");
        }
    }

    #[test]
    fn test_normalization_range() {
        let img = DynamicImage::new_rgb8(100, 100);
        let tensor = image_to_tensor(&img);

        let min = tensor.iter().copied().fold(f32::INFINITY, f32::min);
        let max = tensor.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        // Black image should be all -1.0
        assert!((min - (-1.0)).abs() < 1e-6);
        assert!((max - (-1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_white_maps_to_one() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(31, 47, image::Rgb([255, 255, 255])));
        let tensor = image_to_tensor(&img);

        assert!(tensor.iter().all(|&v| (v - 1.0).abs() < 0.01));
    }

    #[test]
    fn test_gray_stored_as_rgb_keeps_value() {
        for v in [0u8, 1, 77, 128, 200, 255] {
            assert_eq!(luma_601(v, v, v), v);
        }
    }

    #[test]
    fn test_luma_weights() {
        assert_eq!(luma_601(255, 0, 0), 76);
        assert_eq!(luma_601(0, 255, 0), 150);
        assert_eq!(luma_601(0, 0, 255), 29);
    }

    #[test]
    fn test_sixteen_bit_gray_is_rescaled() {
        let cases = [(0u16, 0u8), (0x8080, 128), (u16::MAX, 255)];
        for (raw, expected) in cases {
            let img = DynamicImage::ImageLuma16(ImageBuffer::from_pixel(64, 32, Luma([raw])));
            let tensor = prepare(&encode(&img)).unwrap();

            let want = normalize(expected);
            assert!(
                tensor.iter().all(|&v| (v - want).abs() < 1e-6),
                "{raw:#06x} should map to {expected}"
            );
        }
    }

    #[test]
    fn test_corrupt_bytes_fail_to_decode() {
        let err = prepare(b"definitely not an image").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
        assert!(err.is_client_error());
    }
}
