pub mod archive;
pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use archive::{extract_zip, is_zip, secure_filename, ExtractLimits};
pub use image_ops::{
    attach_alpha, crop_or_pad, decode_oriented, encode_png, output_format,
    processed_name, resize_exact, save_image, to_data_url, to_grayscale,
};
pub use metrics::{Metrics, Stage};
