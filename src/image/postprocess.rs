//! Output conversion: generator tensor to encoded RGB image.

use std::path::Path;

use image::{codecs::png::PngEncoder, DynamicImage, ImageBuffer, Rgb, RgbImage};

use crate::error::{Error, Result};

use super::{ImageTensor, NORM_MEAN, NORM_STD, OUTPUT_CHANNELS};

/// Convert a generator output tensor to PNG bytes.
///
/// The tensor is:
/// 1. Stripped of its batch dimension (must be 1)
/// 2. Denormalized with `x * 0.5 + 0.5` and clamped to [0, 1]
/// 3. Quantized to 8-bit RGB
/// 4. Encoded as PNG
///
/// # Errors
///
/// Returns an error if the tensor is not `(1, 3, H, W)` or encoding fails.
pub fn postprocess(tensor: &ImageTensor) -> Result<Vec<u8>> {
    let img = tensor_to_image(tensor)?;
    encode_png(&img)
}

/// Encode an RGB image as PNG bytes.
///
/// # Errors
///
/// Returns an error if the encoder fails.
pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let encoder = PngEncoder::new(&mut bytes);
    img.write_with_encoder(encoder)
        .map_err(|source| Error::Encode { source })?;
    Ok(bytes)
}

/// Save a tensor as an image file.
///
/// The format is inferred from the extension; JPEG output uses `quality`.
///
/// # Errors
///
/// Returns an error if the tensor has the wrong shape or the image cannot be saved.
pub fn save_image<P: AsRef<Path>>(tensor: &ImageTensor, path: P, quality: u8) -> Result<()> {
    let path = path.as_ref();

    let img = DynamicImage::ImageRgb8(tensor_to_image(tensor)?);

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("png")
        .to_lowercase();

    match extension.as_str() {
        "jpg" | "jpeg" => {
            let mut output = std::fs::File::create(path)?;
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut output, quality);
            img.write_with_encoder(encoder)
                .map_err(|source| Error::ImageSave {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        _ => {
            img.save(path).map_err(|source| Error::ImageSave {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }

    Ok(())
}

/// Convert a normalized NCHW tensor to an RGB image.
#[allow(clippy::cast_possible_truncation)]
fn tensor_to_image(tensor: &ImageTensor) -> Result<ImageBuffer<Rgb<u8>, Vec<u8>>> {
    let (batch, channels, height, width) = tensor.dim();

    if batch != 1 || channels != OUTPUT_CHANNELS {
        return Err(Error::ShapeMismatch {
            expected: format!("[1, {OUTPUT_CHANNELS}, H, W]"),
            actual: format!("{:?}", tensor.shape()),
        });
    }

    let (w, h) = match (u32::try_from(width), u32::try_from(height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => {
            return Err(Error::ShapeMismatch {
                expected: "spatial dimensions that fit in u32".to_string(),
                actual: format!("{width}x{height}"),
            })
        }
    };

    Ok(ImageBuffer::from_fn(w, h, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            denormalize(tensor[[0, 0, y, x]]),
            denormalize(tensor[[0, 1, y, x]]),
            denormalize(tensor[[0, 2, y, x]]),
        ])
    }))
}

/// Denormalize a value from [-1, 1] to [0, 255] with clamping.
///
/// The scaled value is truncated, not rounded, so 0.0 maps to 127.
#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn denormalize(value: f32) -> u8 {
    // Safe: clamped to [0, 1] before scaling, NaN casts to 0
    (value.mul_add(NORM_STD, NORM_MEAN).clamp(0.0, 1.0) * 255.0) as u8
}
