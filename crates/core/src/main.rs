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

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use clueweb22::config::{
    defaults, CoordinatorConfig, CounterConfig, ExtractorConfig, StaticWorkerConfig,
    SupervisorConfig,
};
use clueweb22::id::Datatype;
use clueweb22::rpc::{send_once, Request};
use clueweb22::store::FileDatabase;
use clueweb22::{coordinator, counter, extract, merge, scan};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the file database for a corpus: one row per container file,
    /// with the record count the corpus declares for it.
    GenerateDb {
        #[clap(long)]
        clueweb_root: PathBuf,

        #[clap(long)]
        output_filename: PathBuf,
    },

    /// Run the coordinator that leases batches of container files to remote
    /// worker pools.
    Coordinator {
        #[clap(long)]
        database: PathBuf,

        #[clap(long, default_value_t = defaults::Coordinator::port())]
        port: u16,

        #[clap(long, default_value_t = defaults::Coordinator::ctrl_port())]
        ctrl_port: u16,
    },

    /// Scan one batch of container files leased from a remote coordinator.
    Worker {
        /// Number of container files to request.
        #[clap(long)]
        count: usize,

        /// Directory for the per-worker CSV shards.
        #[clap(long)]
        output: PathBuf,

        /// Size of the worker pool.
        #[clap(long)]
        procs: usize,

        /// Job name; becomes the lease token and the shard file prefix.
        #[clap(long)]
        name: String,

        #[clap(long)]
        remote_address: String,

        #[clap(long, default_value_t = defaults::Coordinator::port())]
        remote_port: u16,

        /// Demote a failed shard order check from an error to a warning.
        #[clap(long)]
        allow_unsorted: bool,
    },

    /// Run the dynamic supervisor: a local worker pool that leases files
    /// straight from the database, with live pause/resume over the control
    /// socket.
    Supervisor {
        #[clap(long)]
        database: PathBuf,

        /// Directory for the per-worker CSV shards.
        #[clap(long)]
        output: PathBuf,

        /// Size of the worker pool; all workers start paused.
        #[clap(long)]
        procs: usize,

        #[clap(long, default_value_t = defaults::Supervisor::control_port())]
        control_port: u16,

        #[clap(long, default_value_t = defaults::Supervisor::job_name())]
        job_name: String,

        /// Return a file to the unscanned state when its scan fails, instead
        /// of leaving the lease for an operator reset.
        #[clap(long)]
        reset_failed: bool,

        /// Demote a failed shard order check from an error to a warning.
        #[clap(long)]
        allow_unsorted: bool,
    },

    /// Pause or resume one worker of a running supervisor.
    Ctrl {
        #[clap(long)]
        address: String,

        #[clap(long, default_value_t = defaults::Supervisor::control_port())]
        port: u16,

        /// Worker index to pause.
        #[clap(long)]
        pause: Option<usize>,

        /// Worker index to resume.
        #[clap(long)]
        resume: Option<usize>,
    },

    /// Tell a running coordinator to exit or to reset a job's leases.
    CoordinatorCtrl {
        #[clap(long)]
        address: String,

        #[clap(long, default_value_t = defaults::Coordinator::ctrl_port())]
        port: u16,

        #[clap(long)]
        exit: bool,

        /// Job whose files go back to the unscanned state.
        #[clap(long)]
        reset_job: Option<String>,
    },

    /// Extract individual records from their containers through the offset
    /// tables.
    Extract {
        /// File with one ClueWeb22-ID per line.
        #[clap(long)]
        records_file: PathBuf,

        /// Corpus root directory.
        #[clap(long)]
        root: PathBuf,

        /// Either "txt" or "html".
        #[clap(long)]
        datatype: Datatype,

        #[clap(long)]
        output_path: PathBuf,

        /// Recompress records from gzip to bzip2.
        #[clap(long)]
        bzip2: bool,

        #[clap(long, default_value_t = defaults::Extractor::workers())]
        workers: usize,
    },

    /// Sort each CSV shard with coreutils sort, producing the merge inputs.
    SortShards {
        #[clap(long)]
        input: PathBuf,

        #[clap(long)]
        output: PathBuf,

        #[clap(long, default_value_t = defaults::Sort::cores())]
        cores: usize,

        #[clap(long, default_value_t = defaults::Sort::buffer_gb())]
        buffer_gb: usize,
    },

    /// Merge a directory of sorted shards into one globally sorted file.
    Merge {
        #[clap(long)]
        input: PathBuf,

        #[clap(long)]
        output: PathBuf,
    },

    /// Check shard line counts against the record counts in the database.
    Count {
        #[clap(long)]
        database: PathBuf,

        #[clap(long, default_value = "counts.db")]
        counts_database: PathBuf,

        /// Directory of CSV shards produced by the scanner tools.
        #[clap(long)]
        results: PathBuf,
    },

    /// Print scan progress from the file database.
    CheckProgress {
        #[clap(long)]
        database: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive("clueweb22=info".parse().unwrap())
                .from_env_lossy(),
        )
        .with_target(false)
        .finish()
        .init();

    let args = Args::parse();

    match args.command {
        Commands::GenerateDb {
            clueweb_root,
            output_filename,
        } => {
            FileDatabase::generate(&clueweb_root, &output_filename)?;
        }
        Commands::Coordinator {
            database,
            port,
            ctrl_port,
        } => {
            let config = CoordinatorConfig {
                database,
                port,
                ctrl_port,
            };

            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(coordinator::run(config))?;
        }
        Commands::Worker {
            count,
            output,
            procs,
            name,
            remote_address,
            remote_port,
            allow_unsorted,
        } => {
            scan::pool::run(StaticWorkerConfig {
                count,
                output,
                procs,
                name,
                remote_address,
                remote_port,
                allow_unsorted,
            })?;
        }
        Commands::Supervisor {
            database,
            output,
            procs,
            control_port,
            job_name,
            reset_failed,
            allow_unsorted,
        } => {
            scan::supervisor::run(SupervisorConfig {
                database,
                output,
                procs,
                control_port,
                job_name,
                reset_failed,
                allow_unsorted,
            })?;
        }
        Commands::Ctrl {
            address,
            port,
            pause,
            resume,
        } => {
            let request = match (pause, resume) {
                (Some(worker), None) => {
                    info!("pausing worker {worker}");
                    Request::PauseWorker { worker }
                }
                (None, Some(worker)) => {
                    info!("resuming worker {worker}");
                    Request::ResumeWorker { worker }
                }
                _ => anyhow::bail!("must give exactly one of --pause/--resume"),
            };

            clueweb22::block_on(send_once((address.as_str(), port), &request))?;
        }
        Commands::CoordinatorCtrl {
            address,
            port,
            exit,
            reset_job,
        } => {
            let request = match (exit, reset_job) {
                (true, None) => Request::Exit,
                (false, Some(job)) => {
                    info!("resetting job {job}");
                    Request::ResetJob { job }
                }
                _ => anyhow::bail!("must give exactly one of --exit/--reset-job"),
            };

            clueweb22::block_on(send_once((address.as_str(), port), &request))?;
        }
        Commands::Extract {
            records_file,
            root,
            datatype,
            output_path,
            bzip2,
            workers,
        } => {
            extract::run(&ExtractorConfig {
                records_file,
                root,
                datatype,
                output_path,
                bzip2,
                workers,
            })?;
        }
        Commands::SortShards {
            input,
            output,
            cores,
            buffer_gb,
        } => {
            let sorted = merge::sort_shards(&input, &output, cores, buffer_gb)?;
            info!("sorted {sorted} files");
        }
        Commands::Merge { input, output } => {
            merge::merge_sorted_shards(&input, &output)?;
        }
        Commands::Count {
            database,
            counts_database,
            results,
        } => {
            let summary = counter::run(&CounterConfig {
                database,
                counts_database,
                results,
            })?;

            if summary.mismatched > 0 {
                warn!("{} shards disagree with the database", summary.mismatched);
            }
        }
        Commands::CheckProgress { database } => {
            let db = FileDatabase::open(&database)?;
            let (done, total) = db.check_progress()?;
            let percent = if total == 0 {
                0.0
            } else {
                100.0 * done as f64 / total as f64
            };
            println!("Completed {done}/{total}, {percent:.2}%");
        }
    }

    Ok(())
}
