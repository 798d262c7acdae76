use serde::{Deserialize, Serialize};

/// Label the classifier uses for "nothing anomalous".
pub const NORMAL_LABEL: &str = "Normal Videos";

/// Label taxonomy of the UCF-Crime fine-tuned video classifier.
pub const UCF_CRIME_LABELS: &[&str] = &[
    "Abuse",
    "Arrest",
    "Arson",
    "Assault",
    "Burglary",
    "Explosion",
    "Fighting",
    "Normal Videos",
    "RoadAccidents",
    "Robbery",
    "Shooting",
    "Shoplifting",
    "Stealing",
    "Vandalism",
];

/// One classifier verdict for a clip: top label and its probability in [0, 1].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

impl Prediction {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn is_label(&self, label: &str) -> bool {
        self.label == label
    }
}
