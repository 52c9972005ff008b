#![allow(clippy::missing_docs_in_private_items)]

pub mod chunker;
pub mod index;
pub mod service;

pub use index::{IndexStats, SurrealVectorIndex, VectorIndex, VectorMatch, VectorMetadata, VectorRecord};
pub use service::{DocumentToEmbed, SearchResult, UpsertStats, VectorService};
