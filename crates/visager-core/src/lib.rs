//! visager-core — Identity matching and photo routing.
//!
//! Holds the identity store, the cosine nearest-neighbour matcher and the
//! folder layout that encodes classification outcomes. Face detection
//! itself lives behind the [`FaceBackend`] trait.

pub mod backend;
pub mod library;
pub mod matcher;
pub mod router;
pub mod store;
pub mod types;

pub use backend::{DetectError, FaceBackend};
pub use matcher::{CosineMatcher, MatchResult, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use router::{classify, Classification, FileRouter, RouteError};
pub use store::{IdentityRecord, IdentityStore, StoreError};
pub use types::{BoundingBox, Embedding, FaceObservation};
