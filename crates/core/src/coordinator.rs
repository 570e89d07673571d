// clueweb22 is a toolkit for scanning and extracting the ClueWeb22 web corpus.
// Copyright (C) 2024 clueweb22 authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! The coordinator owns the file database and hands out batches of container
//! files to an unknown number of remote worker pools. A second socket takes
//! operator commands: shutting the coordinator down, or resetting the leases
//! of a job that died (there is deliberately no lease timeout; recovery is a
//! human decision).

use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::CoordinatorConfig;
use crate::rpc::{Reply, Request, Server, ServerConnection};
use crate::store::FileDatabase;

/// How long to wait on each socket before giving the other one a turn.
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Sleep between scheduler iterations when both sockets were quiet.
const IDLE_SLEEP: Duration = Duration::from_millis(500);

/// Maximum time a connected peer gets to deliver its request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

enum Flow {
    Continue,
    Exit,
}

struct Coordinator {
    db: FileDatabase,
}

impl Coordinator {
    async fn read_request(conn: &mut ServerConnection) -> Option<crate::rpc::IncomingRequest<'_>> {
        match tokio::time::timeout(REQUEST_TIMEOUT, conn.request()).await {
            Ok(Ok(req)) => Some(req),
            Ok(Err(e)) => {
                warn!("failed to read request: {e}");
                None
            }
            Err(_) => {
                warn!("peer connected but sent no request");
                None
            }
        }
    }

    async fn handle_jobs(&mut self, mut conn: ServerConnection) {
        let Some(req) = Self::read_request(&mut conn).await else {
            return;
        };

        let reply = match req.body() {
            Request::NewJob { job, count } => {
                info!("received a request for {count} files from {job}");
                let (_, paths) = self.db.get_next_batch(job, *count);
                info!("returning {} files to {job}", paths.len());
                Reply::Ack(Some(paths))
            }
            Request::Finished { job, count, ok } => {
                if *ok {
                    info!("[{job}] finished processing {count} files, updating database");
                    self.db.complete_batch(job);
                } else {
                    error!("[{job}] failed to complete successfully!");
                }
                Reply::Ack(None)
            }
            other => {
                warn!("unknown message type {other:?}");
                Reply::Ack(None)
            }
        };

        if let Err(e) = req.respond(reply).await {
            warn!("failed to respond to request: {e}");
        }
    }

    async fn handle_control(&mut self, mut conn: ServerConnection) -> Flow {
        let Some(req) = Self::read_request(&mut conn).await else {
            return Flow::Continue;
        };

        let mut flow = Flow::Continue;
        let reply = match req.body() {
            Request::Exit => {
                warn!("coordinator received exit message, will exit");
                flow = Flow::Exit;
                Reply::Ack(None)
            }
            Request::ResetJob { job } => {
                let result = self.db.clear_batch(job);
                warn!("clearing state for job {job}, result={result}");
                Reply::Ack(None)
            }
            other => {
                warn!("unknown message type {other:?}");
                Reply::Ack(None)
            }
        };

        if let Err(e) = req.respond(reply).await {
            warn!("failed to respond to request: {e}");
        }

        flow
    }
}

/// Run the scheduler loop until an `Exit` control message arrives. Job
/// messages are polled ahead of control messages each turn; one request is
/// handled to completion before the next is accepted, so the file database
/// never sees concurrent callers from this process.
pub async fn run(config: CoordinatorConfig) -> crate::Result<()> {
    let db = FileDatabase::open(&config.database)?;

    let jobs = Server::bind(("0.0.0.0", config.port)).await?;
    let control = Server::bind(("0.0.0.0", config.ctrl_port)).await?;
    info!(
        "listening on ports {} (jobs), {} (control)",
        config.port, config.ctrl_port
    );

    let mut coordinator = Coordinator { db };

    loop {
        if let Ok(conn) = tokio::time::timeout(ACCEPT_POLL, jobs.accept()).await {
            match conn {
                Ok(conn) => coordinator.handle_jobs(conn).await,
                Err(e) => warn!("jobs socket accept failed: {e}"),
            }
            continue;
        }

        if let Ok(conn) = tokio::time::timeout(ACCEPT_POLL, control.accept()).await {
            match conn {
                Ok(conn) => match coordinator.handle_control(conn).await {
                    Flow::Exit => break,
                    Flow::Continue => {}
                },
                Err(e) => warn!("control socket accept failed: {e}"),
            }
            continue;
        }

        tokio::time::sleep(IDLE_SLEEP).await;
    }

    Ok(())
}
