use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VisionError {
    #[error("confidence {value} for class {class_id} is outside [0, 1]")]
    InvalidConfidence { class_id: u32, value: f64 },

    #[error("media file name '{name}' is not a record identifier: {reason}")]
    UnparseableFileName { name: String, reason: String },

    #[error("unknown image category '{0}'")]
    UnknownCategory(String),
}
