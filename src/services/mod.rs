pub mod batch_ingest;
pub mod broadcaster;
pub mod mqtt_ingest;
pub mod query;
pub mod resolver;
pub mod response_cache;
