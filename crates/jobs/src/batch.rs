use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::client::{EncodeClient, EncodeInput};
use crate::protocol::EncodeSuccess;

/// Cooperative cancellation flag observed between batch items. Clones
/// share the flag, so one can live in a signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    pub fn request_cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything worth reporting about a finished conversion; the output
/// bytes themselves go to the sink, not the report.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionStats {
    pub file_name: String,
    pub width: u32,
    pub height: u32,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub duration_ms: u64,
}

impl From<&EncodeSuccess> for ConversionStats {
    fn from(success: &EncodeSuccess) -> Self {
        ConversionStats {
            file_name: success.file_name.clone(),
            width: success.width,
            height: success.height,
            input_bytes: success.input_bytes,
            output_bytes: success.output_bytes,
            duration_ms: success.duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ItemState {
    Queued,
    Processing,
    Done(ConversionStats),
    Failed { message: String },
    Cancelled,
}

#[derive(Debug, Serialize)]
pub struct BatchItem {
    pub file_name: String,
    pub mime_type: String,
    #[serde(skip)]
    bytes: Option<Vec<u8>>,
    pub state: ItemState,
}

impl BatchItem {
    pub fn new(file_name: String, mime_type: String, bytes: Vec<u8>) -> Self {
        BatchItem {
            file_name,
            mime_type,
            bytes: Some(bytes),
            state: ItemState::Queued,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Headline message: the first failure seen in the batch.
    pub first_error: Option<String>,
    /// Total input minus output bytes over done items; negative when
    /// conversion grew the files.
    pub saved_bytes: i64,
    pub avg_duration_ms: u64,
}

impl BatchReport {
    fn collect(items: &[BatchItem], first_error: Option<String>) -> Self {
        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut cancelled = 0usize;
        let mut saved_bytes = 0i64;
        let mut total_duration_ms = 0u64;

        for item in items {
            match &item.state {
                ItemState::Done(stats) => {
                    completed += 1;
                    saved_bytes += stats.input_bytes as i64 - stats.output_bytes as i64;
                    total_duration_ms += stats.duration_ms;
                }
                ItemState::Failed { .. } => failed += 1,
                ItemState::Cancelled => cancelled += 1,
                ItemState::Queued | ItemState::Processing => {}
            }
        }

        let avg_duration_ms = if completed > 0 {
            total_duration_ms / completed as u64
        } else {
            0
        };

        BatchReport {
            completed,
            failed,
            cancelled,
            first_error,
            saved_bytes,
            avg_duration_ms,
        }
    }
}

/// Runs the queue strictly one item at a time against a single
/// client. A failed item is recorded and the batch moves on; a
/// cancellation (flag between items, or a concurrent `cancel()` on
/// the shared client mid-job) stops the batch and marks every
/// still-queued item `Cancelled`. The sink receives each item's
/// output bytes; a sink error counts as that item failing.
///
/// The client lock is held only while submitting, never while
/// waiting, so another thread can cancel an in-flight job.
pub fn run_batch(
    client: &Mutex<EncodeClient>,
    items: &mut [BatchItem],
    quality: u8,
    flag: &CancelFlag,
    mut sink: impl FnMut(usize, EncodeSuccess) -> Result<(), String>,
) -> BatchReport {
    let mut first_error: Option<String> = None;

    for index in 0..items.len() {
        if flag.is_cancelled() {
            debug!("batch cancelled before item {index}");
            mark_queued_as_cancelled(&mut items[index..]);
            break;
        }

        let Some(bytes) = items[index].bytes.take() else {
            continue;
        };
        items[index].state = ItemState::Processing;
        info!(file = %items[index].file_name, "converting");

        let ticket = client.lock().encode(EncodeInput {
            file_name: items[index].file_name.clone(),
            mime_type: items[index].mime_type.clone(),
            bytes,
            quality,
        });

        match ticket.wait() {
            Ok(success) => {
                let stats = ConversionStats::from(&success);
                items[index].state = match sink(index, success) {
                    Ok(()) => ItemState::Done(stats),
                    Err(message) => {
                        if first_error.is_none() {
                            first_error = Some(message.clone());
                        }
                        ItemState::Failed { message }
                    }
                };
            }
            Err(error) if error.is_cancellation() => {
                items[index].state = ItemState::Cancelled;
                mark_queued_as_cancelled(&mut items[index + 1..]);
                break;
            }
            Err(error) => {
                let message = error.to_string();
                if first_error.is_none() {
                    first_error = Some(message.clone());
                }
                items[index].state = ItemState::Failed { message };
            }
        }
    }

    BatchReport::collect(items, first_error)
}

fn mark_queued_as_cancelled(items: &mut [BatchItem]) {
    for item in items {
        if matches!(item.state, ItemState::Queued) {
            item.state = ItemState::Cancelled;
        }
    }
}
