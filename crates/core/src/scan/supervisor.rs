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

//! Dynamic-mode scanning: one supervisor process drives a fixed pool of
//! local workers, leasing files one at a time straight from the file
//! database. Workers start paused and are woken and parked again through a
//! control socket, so the I/O load can be adjusted while a scan runs.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;
use crate::rpc::{Reply, Request, Server};
use crate::store::FileDatabase;

use super::worker::{Command, ErrorPolicy, Event, Worker};
use super::{fmt_timespan, ShardWriter};

/// Pause/resume commands forwarded from the control socket into the
/// supervisor loop. They take effect at the targeted worker's next handoff.
#[derive(Debug, Clone, Copy)]
pub enum PoolCommand {
    Pause(usize),
    Resume(usize),
}

struct WorkerHandle {
    commands: Sender<Command>,
    active: bool,
    live: bool,
    last_assigned: Option<String>,
}

struct Supervisor {
    db: FileDatabase,
    job_id: String,
    workers: Vec<WorkerHandle>,
    events: Receiver<Event>,
    control: Receiver<PoolCommand>,
    reset_failed: bool,
    dispatched: u64,
    started: Instant,
}

impl Supervisor {
    fn worker_job(&self, worker: usize) -> String {
        format!("{}-worker{worker}", self.job_id)
    }

    fn num_active(&self) -> usize {
        self.workers.iter().filter(|w| w.active).count()
    }

    fn num_live(&self) -> usize {
        self.workers.iter().filter(|w| w.live).count()
    }

    /// Lease the next file and hand it to `worker`, or tell the worker to
    /// stop when the catalogue is exhausted. Leasing and dispatch happen
    /// back to back in the single supervisor loop, so a paused worker can
    /// never be granted a lease.
    fn lease_and_send(&mut self, worker: usize) -> bool {
        let job = self.worker_job(worker);
        let (_, files) = self.db.get_next_batch(&job, 1);

        match files.into_iter().next() {
            Some(path) => {
                self.workers[worker].last_assigned = Some(path.clone());
                let _ = self.workers[worker]
                    .commands
                    .send(Command::Assign(PathBuf::from(path)));
                self.dispatched += 1;
                true
            }
            None => {
                info!("worker {worker} requested a file, but none remain");
                let _ = self.workers[worker].commands.send(Command::Stop);
                false
            }
        }
    }

    fn handle_control(&mut self, cmd: PoolCommand) {
        match cmd {
            PoolCommand::Resume(worker) => {
                if worker >= self.workers.len() {
                    error!("invalid worker ID: {worker}");
                    return;
                }
                if !self.workers[worker].live {
                    warn!("worker {worker} has already exited");
                    return;
                }

                let was_active = std::mem::replace(&mut self.workers[worker].active, true);
                info!("resuming worker {worker} (active={})", self.num_active());

                // an already-active worker has a file outstanding; waking it
                // again would break the one-file-per-worker bound
                if !was_active {
                    self.lease_and_send(worker);
                }
            }
            PoolCommand::Pause(worker) => {
                if worker >= self.workers.len() {
                    error!("invalid worker ID: {worker}");
                    return;
                }

                self.workers[worker].active = false;
                info!("pausing worker {worker} (active={})", self.num_active());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Scanned { worker, path } => {
                match path {
                    Some(path) => {
                        self.db
                            .complete_batch_files(&[path.to_string_lossy().into_owned()]);
                    }
                    None => {
                        let failed = self.workers[worker].last_assigned.take();
                        if self.reset_failed {
                            if let Some(path) = failed {
                                info!("returning {path} to the unscanned state");
                                self.db.clear_files(&[path]);
                            }
                        }
                        // otherwise the lease stays with the failed job for
                        // an operator reset
                    }
                }

                if self.workers[worker].active {
                    if self.lease_and_send(worker)
                        && self.dispatched > 0
                        && self.dispatched % 25 == 0
                    {
                        let elapsed = self.started.elapsed().as_secs_f64();
                        let per_minute = self.dispatched as f64 / (elapsed / 60.0);
                        info!(
                            "dispatched {} files in {}, files/min={per_minute:.1}",
                            self.dispatched,
                            fmt_timespan(elapsed)
                        );
                    }
                } else {
                    info!("worker {worker} is requesting a file, but has been paused");
                    let _ = self.workers[worker].commands.send(Command::Pause);
                }
            }
            Event::Progress { worker, files } => {
                info!("worker {worker} has scanned {files} files");
            }
            Event::Finished { worker, ok } => {
                self.workers[worker].live = false;
                info!(
                    "worker {worker} is finished with result {ok} ({} still running)",
                    self.num_live()
                );
            }
        }
    }

    fn run_loop(&mut self) {
        while self.num_live() > 0 {
            while let Ok(cmd) = self.control.try_recv() {
                self.handle_control(cmd);
            }

            match self.events.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

async fn control_server(port: u16, commands: Sender<PoolCommand>) {
    let server = match Server::bind(("0.0.0.0", port)).await {
        Ok(server) => server,
        Err(e) => {
            error!("failed to bind control socket on port {port}: {e}");
            return;
        }
    };

    info!("listening for control messages on port {port}");

    loop {
        let mut conn = match server.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("control socket accept failed: {e}");
                continue;
            }
        };

        let req = match tokio::time::timeout(Duration::from_secs(5), conn.request()).await {
            Ok(Ok(req)) => req,
            Ok(Err(e)) => {
                warn!("failed to read control request: {e}");
                continue;
            }
            Err(_) => continue,
        };

        match req.body() {
            Request::PauseWorker { worker } => {
                let _ = commands.send(PoolCommand::Pause(*worker));
            }
            Request::ResumeWorker { worker } => {
                let _ = commands.send(PoolCommand::Resume(*worker));
            }
            other => warn!("unknown message type {other:?}"),
        }

        if let Err(e) = req.respond(Reply::Ack(None)).await {
            warn!("failed to respond to control request: {e}");
        }
    }
}

pub fn run(config: SupervisorConfig) -> crate::Result<()> {
    let db = FileDatabase::open(&config.database)?;

    let (ctrl_tx, control) = unbounded();
    let control_port = config.control_port;
    std::thread::spawn(move || crate::block_on(control_server(control_port, ctrl_tx)));

    let (event_tx, events) = unbounded();
    let mut workers = Vec::new();
    let mut handles = Vec::new();

    for i in 0..config.procs {
        let (cmd_tx, commands) = unbounded();
        let shard = ShardWriter::create(&config.output, &format!("{}-worker{i}", config.job_name))?;

        let worker = Worker {
            id: i,
            commands,
            events: event_tx.clone(),
            shard,
            on_error: ErrorPolicy::Report,
            allow_unsorted: config.allow_unsorted,
        };

        handles.push(std::thread::spawn(move || worker.run()));
        workers.push(WorkerHandle {
            commands: cmd_tx,
            active: false,
            live: true,
            last_assigned: None,
        });
    }
    drop(event_tx);

    info!("starting {} workers, all paused", config.procs);

    let mut supervisor = Supervisor {
        db,
        job_id: config.job_name,
        workers,
        events,
        control,
        reset_failed: config.reset_failed,
        dispatched: 0,
        started: Instant::now(),
    };

    supervisor.run_loop();

    info!("all workers finished, joining");
    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}
