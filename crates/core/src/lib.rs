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

//! Tools for scanning the ClueWeb22 corpus into a per-record metadata index
//! and for extracting individual records through the companion offset tables.

use std::path::PathBuf;
use thiserror::Error;

pub mod config;
pub mod coordinator;
pub mod counter;
pub mod extract;
pub mod id;
pub mod merge;
pub mod offsets;
pub mod rpc;
pub mod scan;
pub mod store;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed ClueWeb22-ID: {0}")]
    MalformedId(String),

    #[error("missing container file: {0}")]
    MissingContainer(PathBuf),

    #[error("missing offset file: {0}")]
    MissingOffsets(PathBuf),

    #[error("offset table truncated: expected {expected} bytes, got {got}")]
    TruncatedOffsets { expected: usize, got: usize },

    #[error("offset table entry is not a pair of ASCII integers")]
    InvalidOffsets,

    #[error("refusing to overwrite existing shard: {0}")]
    ShardExists(PathBuf),

    #[error("refusing to overwrite existing database: {0}")]
    DatabaseExists(PathBuf),

    #[error("shard is not sorted by record id: {0}")]
    UnsortedShard(PathBuf),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

static BLOCK_ON_RUNTIME: std::sync::LazyLock<tokio::runtime::Runtime> =
    std::sync::LazyLock::new(|| {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    });

/// Run a future to completion on a shared current-thread runtime. Used by the
/// otherwise synchronous tools when they need to speak the wire protocol.
pub fn block_on<F>(f: F) -> F::Output
where
    F: std::future::Future,
{
    BLOCK_ON_RUNTIME.block_on(f)
}

pub fn free_socket_addr() -> std::net::SocketAddr {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap()
}

// taken from https://docs.rs/sled/0.34.7/src/sled/config.rs.html#445
pub fn gen_temp_path() -> PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    static SALT_COUNTER: AtomicUsize = AtomicUsize::new(0);

    let seed = SALT_COUNTER.fetch_add(1, Ordering::SeqCst) as u128;

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos()
        << 48;

    let pid = u128::from(std::process::id());

    let salt = (pid << 16) + now + seed;

    std::env::temp_dir().join(format!("clueweb.tmp.{salt}"))
}
