pub mod cache;
pub mod eviction;
pub mod job;
pub mod storage;
