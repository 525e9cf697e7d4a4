//! Persistent, named collections of chunks and their embeddings.
//!
//! Storage is LanceDB (one `chunks` and one `vectors` table per collection)
//! with an `index.json` summary; reads are served from an in-memory mirror.

pub mod collection;
pub mod index_file;
pub mod schema;
pub mod similarity;
pub mod store;
pub mod table;

pub use collection::{CollectionState, UpsertReport};
pub use similarity::cosine_similarity;
pub use store::{validate_name, CollectionHandle, VectorStore};
