pub mod database;
pub mod vector_store;

pub use database::{DatabaseManager, DbStats, NewDocument};
pub use vector_store::{PointPayload, PointRecord, ScoredPoint, VectorStoreClient};
