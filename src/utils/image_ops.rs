use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine};
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{
    DynamicImage, GrayAlphaImage, GrayImage, ImageBuffer, ImageDecoder, ImageFormat, ImageReader,
    ImageResult, LumaA, Pixel,
};
use std::io::Cursor;
use std::path::Path;

/// Decode an image and apply its EXIF orientation, like PIL's `exif_transpose`.
///
/// Formats without orientation metadata decode unchanged.
pub fn decode_oriented(bytes: &[u8]) -> ImageResult<DynamicImage> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder
        .orientation()
        .unwrap_or(Orientation::NoTransforms);
    let mut img = DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);
    Ok(img)
}

/// 8-bit luma conversion. Any alpha channel is dropped.
pub fn to_grayscale(img: &DynamicImage) -> GrayImage {
    img.to_luma8()
}

/// Combine a grayscale image with a same-sized mask used as alpha.
pub fn attach_alpha(gray: &GrayImage, mask: &GrayImage) -> Result<GrayAlphaImage> {
    anyhow::ensure!(
        gray.dimensions() == mask.dimensions(),
        "mask is {}x{}, image is {}x{}",
        mask.width(),
        mask.height(),
        gray.width(),
        gray.height()
    );
    Ok(ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        LumaA([gray.get_pixel(x, y)[0], mask.get_pixel(x, y)[0]])
    }))
}

/// Resize to exactly `width`x`height`, ignoring aspect ratio.
pub fn resize_exact<P>(
    img: &ImageBuffer<P, Vec<u8>>,
    width: u32,
    height: u32,
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    image::imageops::resize(img, width, height, FilterType::Lanczos3)
}

/// Take a `width`x`height` window starting at (`x`, `y`).
///
/// The window may extend past the source on any side; uncovered pixels get `fill`.
pub fn crop_or_pad<P>(
    img: &ImageBuffer<P, Vec<u8>>,
    x: i64,
    y: i64,
    width: u32,
    height: u32,
    fill: P,
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8>,
{
    let mut out = ImageBuffer::from_pixel(width, height, fill);
    image::imageops::replace(&mut out, img, -x, -y);
    out
}

/// Pick the on-disk format for an output path.
///
/// Keeps the extension's format when it can hold the image, otherwise PNG.
pub fn output_format(path: &Path, has_alpha: bool) -> ImageFormat {
    match ImageFormat::from_path(path) {
        Ok(ImageFormat::Png) => ImageFormat::Png,
        Ok(ImageFormat::Tiff) if !has_alpha => ImageFormat::Tiff,
        Ok(format @ (ImageFormat::Jpeg | ImageFormat::Bmp)) if !has_alpha => format,
        _ => ImageFormat::Png,
    }
}

/// Output file name for a processed input: `processed_<stem>.<ext>`.
pub fn processed_name(filename: &str, has_alpha: bool) -> String {
    let path = Path::new(filename);
    let format = output_format(path, has_alpha);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("image");

    let keeps_extension = ImageFormat::from_path(path).ok() == Some(format);
    match (keeps_extension, path.extension().and_then(|e| e.to_str())) {
        (true, Some(ext)) => format!("processed_{}.{}", stem, ext),
        _ => format!(
            "processed_{}.{}",
            stem,
            format.extensions_str().first().copied().unwrap_or("png")
        ),
    }
}

/// Write an image, choosing the format from the path.
pub fn save_image(img: &DynamicImage, path: &Path) -> ImageResult<()> {
    let format = output_format(path, img.color().has_alpha());
    img.save_with_format(path, format)
}

/// Encode an image as PNG bytes.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut png_bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
        .context("Failed to encode image as PNG")?;
    Ok(png_bytes)
}

/// Inline PNG bytes as a `data:` URL.
pub fn to_data_url(png_bytes: &[u8]) -> String {
    format!(
        "data:image/png;base64,{}",
        general_purpose::STANDARD.encode(png_bytes)
    )
}
