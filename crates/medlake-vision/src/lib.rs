//! Object-detection vocabulary and the fixed category taxonomy used to label
//! channel images.

pub mod coco;
pub mod errors;
pub mod model;
mod policy;

pub use errors::VisionError;
pub use model::{ImageCategory, ImageClassification, MediaFileName, ObjectDetection};
pub use policy::{best_detection, categorize, classify, has_person, has_product};
