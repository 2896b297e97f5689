pub mod ingest;
pub mod work_item;
