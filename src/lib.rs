pub mod annotation;
pub mod cache;
pub mod config;
pub mod eval;
pub mod identify;
pub mod matcher;
pub mod storage;

pub use annotation::{Aid, Annotation, AnnotationSet};
pub use cache::EmbeddingCache;
pub use eval::{eval_onevsall, RankReport};
pub use identify::{Embedder, Identifier};
pub use matcher::{distance_to_score, PairScore};

// Re-export the network side for convenience
pub use miewid_vision::{Checkpoint, MiewIdNet, Pipeline};
