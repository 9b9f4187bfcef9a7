use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One encode job. The byte buffer moves into the request when it is
/// sent; the submitter must not touch it again.
#[derive(Debug, Serialize, Deserialize)]
pub struct EncodeRequest {
    pub id: Uuid,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub quality: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodeStage {
    Loading,
    Encoding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeSuccess {
    pub id: Uuid,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub duration_ms: u64,
}

/// Every response echoes the id of the request it answers. `Status`
/// is informational and never terminal; `Success` and `Error` end the
/// request they belong to.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerResponse {
    Status { id: Uuid, stage: EncodeStage },
    Success(EncodeSuccess),
    Error { id: Uuid, message: String },
}

impl WorkerResponse {
    pub fn request_id(&self) -> Uuid {
        match self {
            WorkerResponse::Status { id, .. } => *id,
            WorkerResponse::Success(success) => success.id,
            WorkerResponse::Error { id, .. } => *id,
        }
    }
}
