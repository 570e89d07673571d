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

//! Static-mode scanning: lease one batch of container files from a remote
//! coordinator at startup, scan it with a local worker pool, then report the
//! outcome so the coordinator can advance the batch to done.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use tracing::{error, info};

use crate::config::StaticWorkerConfig;
use crate::rpc::{retry::ExponentialBackoff, Connection, Reply, Request};

use super::worker::{Command, ErrorPolicy, Event, Worker};
use super::{fmt_timespan, ShardWriter};

async fn coordinator_request(config: &StaticWorkerConfig, request: &Request) -> crate::Result<Reply> {
    let retry = ExponentialBackoff::from_millis(1_000).with_limit(Duration::from_secs(10));

    let mut conn = Connection::create_with_timeout_retry(
        (config.remote_address.clone(), config.remote_port),
        Duration::from_secs(60),
        retry,
    )
    .await?;

    Ok(conn.send(request).await?)
}

fn dispatch(
    worker: usize,
    sender: &Sender<Command>,
    next: &mut impl Iterator<Item = String>,
    dispatched: &mut usize,
) {
    match next.next() {
        Some(path) => {
            let _ = sender.send(Command::Assign(PathBuf::from(path)));
            *dispatched += 1;
        }
        None => {
            tracing::info!("worker {worker} requested a file, but none remain");
            let _ = sender.send(Command::Stop);
        }
    }
}

pub fn run(config: StaticWorkerConfig) -> crate::Result<()> {
    info!(
        "[{}] requesting {} files from {}:{}",
        config.name, config.count, config.remote_address, config.remote_port
    );

    let reply = crate::block_on(coordinator_request(
        &config,
        &Request::NewJob {
            job: config.name.clone(),
            count: config.count,
        },
    ))?;

    let paths = match reply {
        Reply::Ack(Some(paths)) => paths,
        Reply::Ack(None) => {
            info!("[{}] negative reply from coordinator, exiting", config.name);
            return Ok(());
        }
    };

    info!("[{}] retrieved {} files", config.name, paths.len());

    let (event_tx, events) = unbounded();
    let mut senders = Vec::new();
    let mut handles = Vec::new();

    for i in 0..config.procs {
        let (cmd_tx, commands) = unbounded();
        let shard = ShardWriter::create(&config.output, &format!("{}-w{i}", config.name))?;

        let worker = Worker {
            id: i,
            commands,
            events: event_tx.clone(),
            shard,
            on_error: ErrorPolicy::Abort,
            allow_unsorted: config.allow_unsorted,
        };

        handles.push(std::thread::spawn(move || worker.run()));
        senders.push(cmd_tx);
    }
    drop(event_tx);

    info!("[{}] starting {} workers", config.name, senders.len());

    let started = Instant::now();
    let total = paths.len();
    let mut next = paths.into_iter();
    let mut dispatched = 0;

    // one file outstanding per worker; further handoffs follow each Scanned
    for (i, sender) in senders.iter().enumerate() {
        dispatch(i, sender, &mut next, &mut dispatched);
    }

    let mut finished = 0;
    let mut successful = 0;

    while finished < senders.len() {
        match events.recv() {
            Ok(Event::Scanned { worker, .. }) => {
                dispatch(worker, &senders[worker], &mut next, &mut dispatched);

                if dispatched > 0 && dispatched % 25 == 0 && dispatched <= total {
                    let elapsed = started.elapsed().as_secs_f64();
                    let remaining =
                        (total - dispatched) as f64 / (dispatched as f64 / elapsed);
                    info!(
                        "[{}] has dispatched {dispatched}/{total} files ({:.1}%), etc={}",
                        config.name,
                        100.0 * dispatched as f64 / total as f64,
                        fmt_timespan(remaining)
                    );
                }
            }
            Ok(Event::Progress { worker, files }) => {
                info!("[{}] worker {worker} has scanned {files} files", config.name);
            }
            Ok(Event::Finished { worker, ok }) => {
                finished += 1;
                if ok {
                    successful += 1;
                }
                info!(
                    "[{}] worker {worker} is finished with result {ok} ({finished}/{})",
                    config.name,
                    senders.len()
                );
            }
            Err(_) => break,
        }
    }

    info!("[{}] all workers finished, joining", config.name);
    for handle in handles {
        let _ = handle.join();
    }

    info!(
        "[{}] total time: {}",
        config.name,
        fmt_timespan(started.elapsed().as_secs_f64())
    );

    let ok = successful == senders.len();
    let reply = crate::block_on(coordinator_request(
        &config,
        &Request::Finished {
            job: config.name.clone(),
            count: config.count,
            ok,
        },
    ));

    if let Err(e) = reply {
        // the lease stays in progress; the operator resets the job
        error!("[{}] failed to report completion: {e:#}", config.name);
        return Err(e);
    }

    Ok(())
}
