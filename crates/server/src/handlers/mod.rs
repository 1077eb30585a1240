//! HTTP request handlers.

pub mod monitoring;
pub mod uploads;

pub use monitoring::{health_check, monitoring_stats};
pub use uploads::{complete_upload, delete_upload, init_upload, upload_chunk, upload_status};
