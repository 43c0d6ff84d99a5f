use std::sync::Arc;

use partway_protocol::{PartOutcome, UploadSession};
use partway_staging::StagedSource;
use tokio::sync::mpsc;
use tracing::debug;

use crate::authorizer::PartAuthorizer;
use crate::backend::PartTransport;
use crate::error::UploadError;
use crate::orchestrator::Msg;
use crate::session::SessionRuntime;

/// Shared handles a part transfer needs besides the session itself.
pub(crate) struct PumpContext {
    pub(crate) transport: Arc<dyn PartTransport>,
    pub(crate) msg_tx: mpsc::Sender<Msg>,
    pub(crate) parts_per_session: usize,
}

/// Fill the session's in-flight window from the queue, lowest part first.
///
/// Each dispatched part runs as its own task and reports back through the
/// coordinator queue, so this never blocks.
pub(crate) fn pump(runtime: &mut SessionRuntime, ctx: &PumpContext) {
    while runtime.tracker.in_flight_count() < ctx.parts_per_session {
        let Some(part) = runtime.tracker.next_to_dispatch() else {
            break;
        };
        runtime.tracker.mark_dispatched(part);
        debug!(session = %runtime.session.id, part, "dispatching part");
        spawn_part(runtime, part, ctx);
    }
}

fn spawn_part(runtime: &SessionRuntime, part: u32, ctx: &PumpContext) {
    let session = runtime.session.clone();
    let source = runtime.source.clone();
    let authorizer = runtime.authorizer.clone();
    let transport = ctx.transport.clone();
    let msg_tx = ctx.msg_tx.clone();
    let generation = runtime.generation;

    tokio::spawn(async move {
        let session_id = session.id.clone();
        let result =
            transfer_part(&session, &source, &authorizer, transport.as_ref(), part).await;
        let _ = msg_tx
            .send(Msg::PartDone {
                session_id,
                generation,
                part_number: part,
                result,
            })
            .await;
    });
}

/// Authorize, read and ship one part.
async fn transfer_part(
    session: &UploadSession,
    source: &StagedSource,
    authorizer: &PartAuthorizer,
    transport: &dyn PartTransport,
    part: u32,
) -> Result<PartOutcome, UploadError> {
    let auth = authorizer.authorize(part).await?;
    let (start, end) = session.part_range(part);
    let body = source.read_range(start, end).await?;
    let size = body.len() as u64;
    let etag = transport.put_part(auth.url, body).await?;
    Ok(PartOutcome {
        etag,
        part_number: part,
        size,
    })
}
