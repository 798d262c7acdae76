mod backend;
pub mod backends;
mod registry;
mod result;

pub use backend::ClipClassifier;
pub use backends::StubClassifier;
#[cfg(feature = "backend-tract")]
pub use backends::TractClassifier;
pub use registry::{ClassifierRegistry, SharedClassifier};
pub use result::{Prediction, NORMAL_LABEL, UCF_CRIME_LABELS};
