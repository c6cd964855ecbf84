pub mod backbone;
pub mod checkpoint;
pub mod distance;
pub mod error;
pub mod gem;
pub mod heads;
pub mod layers;
pub mod model;
pub mod net;
pub mod pipeline;
pub mod preprocess;
pub mod schedule;

// Re-export commonly used types
pub use backbone::{Backbone, ConvStem};
pub use checkpoint::{Checkpoint, StateDict};
pub use distance::{compute_distance_matrix, Metric};
pub use error::ModelError;
pub use heads::{LossModule, MarginParams};
pub use model::OnnxBackbone;
pub use net::{MiewIdNet, Mode, NetConfig, Output};
pub use pipeline::Pipeline;
pub use preprocess::{ImageInput, Preprocess};
pub use schedule::LrSchedule;
