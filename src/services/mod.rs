pub mod ingest;
pub mod processing;
pub mod recognition;
pub mod storage;
pub mod trigger;
