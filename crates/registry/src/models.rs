//! Database row model and record conversion.

use crate::error::{RegistryError, RegistryResult};
use gantry_core::{ChunkBitmap, Declared, Failure, FinalObject, SessionRecord, SessionStatus};
use sqlx::FromRow;
use std::path::PathBuf;
use time::OffsetDateTime;
use uuid::Uuid;

/// Session record as stored in the `sessions` table.
#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub handle: Uuid,
    pub file_name: String,
    pub file_size: i64,
    pub media_type: String,
    pub total_chunks: i64,
    pub chunk_size: i64,
    /// Byte-packed received bitmap.
    pub received: Vec<u8>,
    pub bytes_received: i64,
    pub status: String,
    pub created_at: OffsetDateTime,
    pub last_activity_at: OffsetDateTime,
    pub first_chunk_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub failure_kind: Option<String>,
    pub failure_message: Option<String>,
    pub final_name: Option<String>,
    pub final_size: Option<i64>,
    pub final_assembled_at: Option<OffsetDateTime>,
    pub final_path: Option<String>,
}

impl SessionRow {
    /// Flatten a domain record into a row.
    pub fn from_record(record: &SessionRecord) -> Self {
        Self {
            handle: *record.handle.as_uuid(),
            file_name: record.declared.file_name.clone(),
            file_size: record.declared.file_size as i64,
            media_type: record.declared.media_type.clone(),
            total_chunks: i64::from(record.declared.total_chunks),
            chunk_size: record.chunk_size as i64,
            received: record.received.as_raw().to_vec(),
            bytes_received: record.bytes_received as i64,
            status: record.status.as_str().to_string(),
            created_at: record.created_at,
            last_activity_at: record.last_activity_at,
            first_chunk_at: record.first_chunk_at,
            completed_at: record.completed_at,
            failure_kind: record.failure.as_ref().map(|f| f.kind.clone()),
            failure_message: record.failure.as_ref().map(|f| f.message.clone()),
            final_name: record.final_object.as_ref().map(|o| o.name.clone()),
            final_size: record.final_object.as_ref().map(|o| o.size as i64),
            final_assembled_at: record.final_object.as_ref().map(|o| o.assembled_at),
            final_path: record
                .final_object
                .as_ref()
                .map(|o| o.storage_path.to_string_lossy().into_owned()),
        }
    }

    /// Rebuild the domain record from a row.
    pub fn into_record(self) -> RegistryResult<SessionRecord> {
        let status = SessionStatus::parse(&self.status)
            .map_err(|e| RegistryError::Corrupt(e.to_string()))?;
        let total_chunks = u32::try_from(self.total_chunks)
            .map_err(|_| RegistryError::Corrupt(format!("total_chunks {}", self.total_chunks)))?;

        let failure = match (self.failure_kind, self.failure_message) {
            (Some(kind), Some(message)) => Some(Failure { kind, message }),
            (None, None) => None,
            _ => {
                return Err(RegistryError::Corrupt(
                    "failure kind and message must be set together".to_string(),
                ));
            }
        };

        let final_object = match (
            self.final_name,
            self.final_size,
            self.final_assembled_at,
            self.final_path,
        ) {
            (Some(name), Some(size), Some(assembled_at), Some(path)) => Some(FinalObject {
                name,
                size: size as u64,
                media_type: self.media_type.clone(),
                assembled_at,
                storage_path: PathBuf::from(path),
            }),
            (None, None, None, None) => None,
            _ => {
                return Err(RegistryError::Corrupt(
                    "partial final object columns".to_string(),
                ));
            }
        };

        Ok(SessionRecord {
            handle: gantry_core::UploadId::parse(&self.handle.to_string())
                .map_err(|e| RegistryError::Corrupt(e.to_string()))?,
            declared: Declared {
                file_name: self.file_name,
                file_size: self.file_size as u64,
                media_type: self.media_type,
                total_chunks,
            },
            chunk_size: self.chunk_size as u64,
            received: ChunkBitmap::from_raw(total_chunks, &self.received),
            bytes_received: self.bytes_received as u64,
            status,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            first_chunk_at: self.first_chunk_at,
            completed_at: self.completed_at,
            failure,
            final_object,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::UploadId;

    fn sample_record() -> SessionRecord {
        let mut record = SessionRecord::new(
            Declared {
                file_name: "a.jpg".to_string(),
                file_size: 2 * 1024 * 1024,
                media_type: "image/jpeg".to_string(),
                total_chunks: 2,
            },
            1024 * 1024,
            OffsetDateTime::now_utc(),
        );
        record.received.set(1);
        record.bytes_received = 1024 * 1024;
        record.status = SessionStatus::Receiving;
        record
    }

    #[test]
    fn row_roundtrip() {
        let record = sample_record();
        let row = SessionRow::from_record(&record);
        let restored = row.into_record().unwrap();

        assert_eq!(restored.handle, record.handle);
        assert_eq!(restored.declared, record.declared);
        assert_eq!(restored.received, record.received);
        assert_eq!(restored.bytes_received, record.bytes_received);
        assert_eq!(restored.status, record.status);
        assert!(restored.failure.is_none());
        assert!(restored.final_object.is_none());
    }

    #[test]
    fn row_roundtrip_with_terminal_fields() {
        let mut record = sample_record();
        record.status = SessionStatus::Completed;
        record.completed_at = Some(OffsetDateTime::now_utc());
        record.final_object = Some(FinalObject {
            name: "a.jpg".to_string(),
            size: 2 * 1024 * 1024,
            media_type: "image/jpeg".to_string(),
            assembled_at: OffsetDateTime::now_utc(),
            storage_path: PathBuf::from("/data/final/a.jpg"),
        });

        let restored = SessionRow::from_record(&record).into_record().unwrap();
        let object = restored.final_object.unwrap();
        assert_eq!(object.name, "a.jpg");
        assert_eq!(object.media_type, "image/jpeg");
        assert_eq!(object.storage_path, PathBuf::from("/data/final/a.jpg"));
    }

    #[test]
    fn corrupt_status_rejected() {
        let record = sample_record();
        let mut row = SessionRow::from_record(&record);
        row.status = "open".to_string();
        assert!(matches!(
            row.into_record(),
            Err(RegistryError::Corrupt(_))
        ));
    }

    #[test]
    fn partial_failure_columns_rejected() {
        let record = sample_record();
        let mut row = SessionRow::from_record(&record);
        row.failure_kind = Some("io_failure".to_string());
        assert!(matches!(row.into_record(), Err(RegistryError::Corrupt(_))));
    }

    #[test]
    fn handle_survives_roundtrip_as_uuid() {
        let record = sample_record();
        let row = SessionRow::from_record(&record);
        assert_eq!(
            UploadId::parse(&row.handle.to_string()).unwrap(),
            record.handle
        );
    }
}
