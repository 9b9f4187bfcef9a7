//! Worker-mediated WebP encoding: a single-flight request/response
//! protocol between a controlling client and an isolated executor
//! thread, plus the serial batch orchestrator built on top of it.

mod batch;
mod client;
mod protocol;
mod worker;

pub use batch::{run_batch, BatchItem, BatchReport, CancelFlag, ConversionStats, ItemState};
pub use client::{EncodeClient, EncodeInput, EncodeJobError, EncodeTicket};
pub use protocol::{EncodeRequest, EncodeStage, EncodeSuccess, WorkerResponse};
