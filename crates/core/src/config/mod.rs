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

pub mod defaults;

use std::path::PathBuf;

#[derive(Debug, serde::Deserialize, Clone)]
pub struct CoordinatorConfig {
    pub database: PathBuf,

    #[serde(default = "defaults::Coordinator::port")]
    pub port: u16,

    #[serde(default = "defaults::Coordinator::ctrl_port")]
    pub ctrl_port: u16,
}

#[derive(Debug, serde::Deserialize, Clone)]
pub struct StaticWorkerConfig {
    /// Number of container files to lease from the coordinator.
    pub count: usize,

    /// Directory the per-worker CSV shards are written to.
    pub output: PathBuf,

    /// Size of the worker pool.
    pub procs: usize,

    /// Job name, used as the lease token and the shard file prefix.
    pub name: String,

    pub remote_address: String,

    #[serde(default = "defaults::Coordinator::port")]
    pub remote_port: u16,

    #[serde(default)]
    pub allow_unsorted: bool,
}

#[derive(Debug, serde::Deserialize, Clone)]
pub struct SupervisorConfig {
    pub database: PathBuf,

    /// Directory the per-worker CSV shards are written to.
    pub output: PathBuf,

    /// Size of the worker pool; workers start paused and are woken through
    /// the control socket.
    pub procs: usize,

    #[serde(default = "defaults::Supervisor::control_port")]
    pub control_port: u16,

    #[serde(default = "defaults::Supervisor::job_name")]
    pub job_name: String,

    /// Reset a failed file back to the unscanned state instead of leaving
    /// its lease for an operator to clear.
    #[serde(default)]
    pub reset_failed: bool,

    #[serde(default)]
    pub allow_unsorted: bool,
}

#[derive(Debug, serde::Deserialize, Clone)]
pub struct ExtractorConfig {
    /// File listing one ClueWeb22-ID per line.
    pub records_file: PathBuf,

    /// Corpus root directory.
    pub root: PathBuf,

    pub datatype: crate::id::Datatype,

    pub output_path: PathBuf,

    /// Recompress each record from gzip to bzip2 instead of copying the raw
    /// compressed bytes.
    #[serde(default)]
    pub bzip2: bool,

    /// Size of the extraction thread pool.
    #[serde(default = "defaults::Extractor::workers")]
    pub workers: usize,
}

#[derive(Debug, serde::Deserialize, Clone)]
pub struct CounterConfig {
    pub database: PathBuf,

    #[serde(default = "defaults::Counter::counts_database")]
    pub counts_database: PathBuf,

    /// Directory of `.csv` shards produced by the scanner tools.
    pub results: PathBuf,
}
