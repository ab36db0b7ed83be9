//! COCO class ids as emitted by YOLO-family detectors.

pub const PERSON: u32 = 0;
pub const BOTTLE: u32 = 39;
pub const WINE_GLASS: u32 = 40;
pub const CUP: u32 = 41;
pub const BOWL: u32 = 45;

/// Classes treated as product containers.
pub const CONTAINER_CLASSES: [u32; 4] = [BOTTLE, WINE_GLASS, CUP, BOWL];

static CLASS_NAMES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

pub fn class_name(class_id: u32) -> Option<&'static str> {
    CLASS_NAMES.get(class_id as usize).copied()
}

pub fn class_id(name: &str) -> Option<u32> {
    CLASS_NAMES
        .iter()
        .position(|candidate| candidate.eq_ignore_ascii_case(name))
        .map(|idx| idx as u32)
}

pub fn is_container(class_id: u32) -> bool {
    CONTAINER_CLASSES.contains(&class_id)
}
