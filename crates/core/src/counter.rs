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

//! Cross-checks scan output against the record counts the corpus declares:
//! one CSV row per record means a shard's line count must equal the summed
//! record counts of the files its job scanned. Purely diagnostic; the file
//! database is only read.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use tracing::{info, warn};

use crate::config::CounterConfig;
use crate::store::FileDatabase;

const BUF_SIZE: usize = 8 * 1024 * 1024;

/// Cache of shard line counts keyed by file name, so reruns skip the
/// multi-gigabyte recounts.
pub struct CountCache {
    conn: Connection,
}

impl CountCache {
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS counts (filename TEXT UNIQUE, count INTEGER)",
            [],
        )?;

        Ok(CountCache { conn })
    }

    pub fn get(&self, filename: &str) -> Option<u64> {
        self.conn
            .query_row(
                "SELECT count FROM counts WHERE filename = ?1",
                params![filename],
                |row| row.get::<_, i64>(0),
            )
            .ok()
            .map(|count| count as u64)
    }

    pub fn insert(&self, filename: &str, count: u64) -> crate::Result<()> {
        self.conn.execute(
            "INSERT INTO counts VALUES (?1, ?2)",
            params![filename, count as i64],
        )?;

        Ok(())
    }
}

/// Count lines by scanning buffered reads for newline bytes. Counts are
/// cached by file name and never recomputed.
pub fn count_lines(path: &Path, cache: &CountCache) -> crate::Result<u64> {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();

    if let Some(count) = cache.get(name) {
        return Ok(count);
    }

    info!("counting lines in {}", path.display());

    let mut file = File::open(path)?;
    let mut buf = vec![0u8; BUF_SIZE];
    let mut lines = 0u64;
    let mut buffers = 0u64;

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }

        lines += bytecount::count(&buf[..n], b'\n') as u64;
        buffers += 1;

        if buffers % 200 == 0 {
            info!(
                "{}: {:.3}GB",
                path.display(),
                (buffers * BUF_SIZE as u64) as f64 / f64::from(1 << 30)
            );
        }
    }

    info!("{} has {lines} lines", path.display());
    cache.insert(name, lines)?;

    Ok(lines)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CountSummary {
    pub matched: usize,
    pub mismatched: usize,
    pub skipped: usize,
}

/// Compare every `<job>.csv` shard under the results directory against the
/// record count the file database attributes to that job.
pub fn run(config: &CounterConfig) -> crate::Result<CountSummary> {
    let db = FileDatabase::open(&config.database)?;
    let cache = CountCache::open(&config.counts_database)?;

    let mut shards = Vec::new();
    collect_shards(&config.results, &mut shards)?;

    let mut summary = CountSummary::default();

    for path in shards {
        let Some(job) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string)
        else {
            continue;
        };

        let db_count = db.get_record_count_for_job(&job);
        let file_count = count_lines(&path, &cache)?;

        if file_count == 0 {
            info!("{job}: skipping empty file");
            summary.skipped += 1;
        } else if db_count == file_count {
            info!("{job}: db={db_count}, files={file_count}");
            summary.matched += 1;
        } else {
            warn!("{job}: db={db_count}, files={file_count} ***");
            summary.mismatched += 1;
        }
    }

    Ok(summary)
}

fn collect_shards(dir: &Path, out: &mut Vec<PathBuf>) -> crate::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if entry.file_type()?.is_dir() {
            collect_shards(&path, out)?;
            continue;
        }

        if path.extension().and_then(|e| e.to_str()) == Some("csv") {
            out.push(path);
        }
    }

    out.sort();

    Ok(())
}
