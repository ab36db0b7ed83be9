use crate::coco;
use crate::model::{ImageCategory, ImageClassification, ObjectDetection};

pub fn has_person(detections: &[ObjectDetection]) -> bool {
    detections.iter().any(|d| d.class_id == coco::PERSON)
}

pub fn has_product(detections: &[ObjectDetection]) -> bool {
    detections.iter().any(|d| coco::is_container(d.class_id))
}

/// Category is a function of the detection set only; order never matters.
pub fn categorize(detections: &[ObjectDetection]) -> ImageCategory {
    match (has_person(detections), has_product(detections)) {
        (true, true) => ImageCategory::Promotional,
        (false, true) => ImageCategory::ProductDisplay,
        (true, false) => ImageCategory::Lifestyle,
        (false, false) => ImageCategory::Other,
    }
}

/// Highest-confidence detection; the earliest one wins a tie.
pub fn best_detection(detections: &[ObjectDetection]) -> Option<&ObjectDetection> {
    let mut best: Option<&ObjectDetection> = None;
    for detection in detections {
        match best {
            Some(current) if detection.confidence <= current.confidence => {}
            _ => best = Some(detection),
        }
    }
    best
}

pub fn classify(detections: &[ObjectDetection]) -> ImageClassification {
    let Some(best) = best_detection(detections) else {
        return ImageClassification::empty();
    };

    ImageClassification {
        detected_class: Some(best.class_name.clone()),
        confidence_score: best.confidence,
        category: categorize(detections),
    }
}
