use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

use crate::protocol::{EncodeRequest, EncodeStage, EncodeSuccess, WorkerResponse};

/// Handle to one executor instance. Dropping it disconnects the
/// request channel, which is as close to termination as a thread
/// allows: the worker finishes any in-flight job and exits, and its
/// late responses are dropped by the client's id guard.
pub(crate) struct WorkerHandle {
    pub(crate) requests: Sender<EncodeRequest>,
    _thread: JoinHandle<()>,
}

pub(crate) fn spawn_worker(responses: Sender<WorkerResponse>) -> WorkerHandle {
    let (requests_tx, requests_rx) = unbounded::<EncodeRequest>();
    let thread = thread::spawn(move || worker_loop(requests_rx, responses));

    WorkerHandle {
        requests: requests_tx,
        _thread: thread,
    }
}

/// Processes exactly one request at a time. A per-job failure is
/// reported as an `Error` response and the loop stays available for
/// the next request; only channel disconnection ends it.
fn worker_loop(requests: Receiver<EncodeRequest>, responses: Sender<WorkerResponse>) {
    while let Ok(request) = requests.recv() {
        let id = request.id;
        match run_job(request, &responses) {
            Ok(success) => {
                let _ = responses.send(WorkerResponse::Success(success));
            }
            Err(error) => {
                let _ = responses.send(WorkerResponse::Error {
                    id,
                    message: error.to_string(),
                });
            }
        }
    }

    debug!("encode worker shutting down");
}

fn run_job(
    request: EncodeRequest,
    responses: &Sender<WorkerResponse>,
) -> Result<EncodeSuccess, codec::CodecError> {
    let started = Instant::now();
    let input_bytes = request.bytes.len() as u64;

    let _ = responses.send(WorkerResponse::Status {
        id: request.id,
        stage: EncodeStage::Loading,
    });
    let raster = codec::decode_raster(&request.bytes, &request.mime_type)?;

    let _ = responses.send(WorkerResponse::Status {
        id: request.id,
        stage: EncodeStage::Encoding,
    });
    let output = codec::compress_webp(&raster, request.quality)?;

    Ok(EncodeSuccess {
        id: request.id,
        file_name: codec::webp_file_name(&request.file_name),
        output_bytes: output.len() as u64,
        bytes: output,
        width: raster.width,
        height: raster.height,
        input_bytes,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}
