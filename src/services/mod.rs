pub mod background;
pub mod classifier;
pub mod onnx_builder; // Shared ONNX session builder and pool

// Re-export commonly used services
pub use background::BackgroundRemover;
pub use classifier::LandmarkClassifier;
pub use onnx_builder::{Backend, SessionPool};
