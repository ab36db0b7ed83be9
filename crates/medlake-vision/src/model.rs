use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::coco;
use crate::errors::VisionError;

/// One object found in an image by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDetection {
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f64,
}

impl ObjectDetection {
    /// Builds a detection, resolving the class name from the COCO table when
    /// the detector did not supply one.
    pub fn new(
        class_id: u32,
        class_name: Option<String>,
        confidence: f64,
    ) -> Result<Self, VisionError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(VisionError::InvalidConfidence {
                class_id,
                value: confidence,
            });
        }

        let class_name = class_name
            .filter(|name| !name.trim().is_empty())
            .or_else(|| coco::class_name(class_id).map(str::to_string))
            .unwrap_or_else(|| format!("class_{class_id}"));

        Ok(Self {
            class_id,
            class_name,
            confidence,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageCategory {
    Promotional,
    ProductDisplay,
    Lifestyle,
    Other,
}

impl ImageCategory {
    pub const ALL: [ImageCategory; 4] = [
        ImageCategory::Promotional,
        ImageCategory::ProductDisplay,
        ImageCategory::Lifestyle,
        ImageCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageCategory::Promotional => "promotional",
            ImageCategory::ProductDisplay => "product_display",
            ImageCategory::Lifestyle => "lifestyle",
            ImageCategory::Other => "other",
        }
    }
}

impl fmt::Display for ImageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageCategory {
    type Err = VisionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "promotional" => Ok(Self::Promotional),
            "product_display" => Ok(Self::ProductDisplay),
            "lifestyle" => Ok(Self::Lifestyle),
            "other" => Ok(Self::Other),
            other => Err(VisionError::UnknownCategory(other.to_string())),
        }
    }
}

/// The labelled outcome for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageClassification {
    pub detected_class: Option<String>,
    pub confidence_score: f64,
    pub category: ImageCategory,
}

impl ImageClassification {
    pub fn empty() -> Self {
        Self {
            detected_class: None,
            confidence_score: 0.0,
            category: ImageCategory::Other,
        }
    }
}

/// Identity encoded in a downloaded media file's path relative to the
/// images directory: `<channel>/<record_id>.<ext>`, or `<record_id>.<ext>`
/// for files kept at the top level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFileName {
    pub channel_name: Option<String>,
    pub record_id: i64,
}

impl MediaFileName {
    pub fn parse(relative: &Path) -> Result<Self, VisionError> {
        let display = relative.display().to_string();
        let unparseable = |reason: String| VisionError::UnparseableFileName {
            name: display.clone(),
            reason,
        };

        let stem = relative
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| unparseable("missing file stem".into()))?;

        let record_id: i64 = stem
            .parse()
            .map_err(|_| unparseable(format!("'{stem}' is not a decimal integer")))?;
        if record_id <= 0 {
            return Err(unparseable("record identifiers are positive".into()));
        }

        let mut dirs = relative.parent().map(Path::components).into_iter().flatten();
        let channel_name = match (dirs.next(), dirs.next()) {
            (None, _) => None,
            (Some(Component::Normal(dir)), None) => Some(
                dir.to_str()
                    .ok_or_else(|| unparseable("channel directory is not UTF-8".into()))?
                    .to_string(),
            ),
            _ => {
                return Err(unparseable(
                    "expected at most one channel directory above the file".into(),
                ))
            }
        };

        Ok(Self {
            channel_name,
            record_id,
        })
    }
}
