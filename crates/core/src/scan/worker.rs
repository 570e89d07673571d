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

use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, warn};

use super::{scan_file, ShardWriter};

const PROGRESS_INTERVAL: u64 = 25;

/// Dispatcher-to-worker handoffs. The worker's blocking receive on this
/// channel is what implements pausing.
#[derive(Debug, Clone)]
pub enum Command {
    /// Scan this container next.
    Assign(PathBuf),

    /// Re-block on the channel without exiting.
    Pause,

    /// No files remain; finalize the shard and exit.
    Stop,
}

/// Worker-to-dispatcher reports.
#[derive(Debug, Clone)]
pub enum Event {
    /// A container was handled; `None` means the scan failed.
    Scanned { worker: usize, path: Option<PathBuf> },

    /// Emitted every [`PROGRESS_INTERVAL`] scanned files.
    Progress { worker: usize, files: u64 },

    /// The worker exited; `ok` is false when any scan or the final shard
    /// order check failed.
    Finished { worker: usize, ok: bool },
}

/// What to do when a container fails to scan. Static pools abort the whole
/// worker and leave the batch for an operator reset; the dynamic supervisor
/// is told about the failure and keeps the worker running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    Abort,
    Report,
}

pub struct Worker {
    pub id: usize,
    pub commands: Receiver<Command>,
    pub events: Sender<Event>,
    pub shard: ShardWriter,
    pub on_error: ErrorPolicy,
    pub allow_unsorted: bool,
}

impl Worker {
    pub fn run(self) {
        let Worker {
            id,
            commands,
            events,
            mut shard,
            on_error,
            allow_unsorted,
        } = self;

        let mut ok = true;
        let mut files = 0u64;

        loop {
            match commands.recv() {
                Ok(Command::Assign(path)) => match scan_file(&path, &mut shard) {
                    Ok(records) => {
                        info!("worker {id} scanned {}, {records} records", path.display());
                        files += 1;

                        let _ = events.send(Event::Scanned {
                            worker: id,
                            path: Some(path),
                        });

                        if files % PROGRESS_INTERVAL == 0 {
                            let _ = events.send(Event::Progress { worker: id, files });
                        }
                    }
                    Err(e) => {
                        error!(
                            "worker {id} encountered an error: {e:#} on file {}",
                            path.display()
                        );
                        ok = false;

                        match on_error {
                            ErrorPolicy::Abort => break,
                            ErrorPolicy::Report => {
                                std::thread::sleep(Duration::from_secs(1));
                                let _ = events.send(Event::Scanned {
                                    worker: id,
                                    path: None,
                                });
                            }
                        }
                    }
                },
                Ok(Command::Pause) => {
                    info!("worker {id} is in paused state");
                    continue;
                }
                Ok(Command::Stop) | Err(_) => {
                    info!("worker {id} has no files to process, exiting");
                    break;
                }
            }
        }

        match shard.finish() {
            Ok(path) => {
                if let Err(e) = super::check_shard_sorted(&path) {
                    if allow_unsorted {
                        warn!("{e:#}; shard must be sorted individually before merging");
                    } else {
                        error!("{e:#}");
                        ok = false;
                    }
                }
            }
            Err(e) => {
                error!("worker {id} failed to finalize its shard: {e:#}");
                ok = false;
            }
        }

        let _ = events.send(Event::Finished { worker: id, ok });
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;

    use crate::scan::tests::{container, record_json};

    use super::*;

    fn spawn_worker(
        dir: &std::path::Path,
        on_error: ErrorPolicy,
    ) -> (Sender<Command>, Receiver<Event>, std::thread::JoinHandle<()>) {
        let (cmd_tx, commands) = unbounded();
        let (events_tx, events) = unbounded();

        let shard = ShardWriter::create(dir, "job-w0").unwrap();
        let worker = Worker {
            id: 0,
            commands,
            events: events_tx,
            shard,
            on_error,
            allow_unsorted: false,
        };

        let handle = std::thread::spawn(move || worker.run());

        (cmd_tx, events, handle)
    }

    #[test]
    fn assign_scan_stop() {
        let dir = tempfile::tempdir().unwrap();

        let data = container(&[record_json("clueweb22-en0000-00-00000", "a\n", "h0", "en")]);
        let container_path = dir.path().join("en0000-00.json.gz");
        std::fs::write(&container_path, data).unwrap();

        let (commands, events, handle) = spawn_worker(dir.path(), ErrorPolicy::Abort);

        commands.send(Command::Assign(container_path.clone())).unwrap();
        commands.send(Command::Stop).unwrap();

        match events.recv().unwrap() {
            Event::Scanned { worker: 0, path } => assert_eq!(path, Some(container_path)),
            other => panic!("unexpected event: {other:?}"),
        }
        match events.recv().unwrap() {
            Event::Finished { worker: 0, ok } => assert!(ok),
            other => panic!("unexpected event: {other:?}"),
        }

        handle.join().unwrap();

        let rows = std::fs::read_to_string(dir.path().join("job-w0.csv")).unwrap();
        assert_eq!(rows, "clueweb22-en0000-00-00000,a,h0,en\n");
    }

    #[test]
    fn pause_does_not_exit_the_worker() {
        let dir = tempfile::tempdir().unwrap();

        let data = container(&[record_json("clueweb22-en0000-00-00000", "a\n", "h0", "en")]);
        let container_path = dir.path().join("en0000-00.json.gz");
        std::fs::write(&container_path, data).unwrap();

        let (commands, events, handle) = spawn_worker(dir.path(), ErrorPolicy::Report);

        commands.send(Command::Pause).unwrap();
        commands.send(Command::Assign(container_path)).unwrap();
        commands.send(Command::Stop).unwrap();

        assert!(matches!(
            events.recv().unwrap(),
            Event::Scanned { path: Some(_), .. }
        ));
        assert!(matches!(events.recv().unwrap(), Event::Finished { ok: true, .. }));

        handle.join().unwrap();
    }

    #[test]
    fn abort_policy_stops_on_first_error() {
        let dir = tempfile::tempdir().unwrap();

        let (commands, events, handle) = spawn_worker(dir.path(), ErrorPolicy::Abort);

        commands
            .send(Command::Assign(dir.path().join("missing.json.gz")))
            .unwrap();

        // the worker exits without reporting the failed file
        assert!(matches!(
            events.recv().unwrap(),
            Event::Finished { ok: false, .. }
        ));

        handle.join().unwrap();
        drop(commands);
    }

    #[test]
    fn report_policy_keeps_the_worker_alive() {
        let dir = tempfile::tempdir().unwrap();

        let (commands, events, handle) = spawn_worker(dir.path(), ErrorPolicy::Report);

        commands
            .send(Command::Assign(dir.path().join("missing.json.gz")))
            .unwrap();
        commands.send(Command::Stop).unwrap();

        assert!(matches!(
            events.recv().unwrap(),
            Event::Scanned { path: None, .. }
        ));
        assert!(matches!(
            events.recv().unwrap(),
            Event::Finished { ok: false, .. }
        ));

        handle.join().unwrap();
    }
}
