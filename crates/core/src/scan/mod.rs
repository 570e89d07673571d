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

//! Scanning container files into per-record metadata shards: one CSV row
//! `ClueWeb22-ID,URL,URL-hash,Language` per record.

pub mod pool;
pub mod supervisor;
pub mod worker;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use serde::Deserialize;

use crate::Error;

/// The metadata fields of one corpus record. Everything else in the record,
/// most notably the document text, is skipped during deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct Record {
    #[serde(rename = "ClueWeb22-ID")]
    pub id: String,

    #[serde(rename = "URL")]
    pub url: String,

    #[serde(rename = "URL-hash")]
    pub url_hash: String,

    #[serde(rename = "Language")]
    pub language: String,
}

/// CSV shard owned by a single worker for the lifetime of that worker.
#[derive(Debug)]
pub struct ShardWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl ShardWriter {
    /// Open a new shard named `<stem>.csv` under `dir`. An existing shard is
    /// a hard error: appending to stale output from an earlier run would
    /// silently corrupt the later merge.
    pub fn create(dir: &Path, stem: &str) -> crate::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{stem}.csv"));

        if path.exists() {
            return Err(Error::ShardExists(path).into());
        }

        let writer = csv::Writer::from_path(&path)?;

        Ok(ShardWriter { path, writer })
    }

    pub fn write_record(&mut self, record: &Record) -> crate::Result<()> {
        // URLs in the corpus carry a trailing newline
        self.writer.write_record([
            record.id.as_str(),
            record.url.trim_end(),
            record.url_hash.as_str(),
            record.language.as_str(),
        ])?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the shard, returning its path.
    pub fn finish(mut self) -> crate::Result<PathBuf> {
        self.writer.flush()?;
        Ok(self.path)
    }
}

/// Scan one container: stream its gzip members, parse each JSON line and
/// append the metadata row to the shard. Returns the number of records.
pub fn scan_file(path: &Path, shard: &mut ShardWriter) -> crate::Result<u64> {
    let file = File::open(path)?;
    let reader = BufReader::new(MultiGzDecoder::new(BufReader::new(file)));

    let mut records = 0;
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }

        let record: Record = serde_json::from_str(&line)?;
        shard.write_record(&record)?;
        records += 1;
    }

    Ok(records)
}

/// Verify that the first CSV field never decreases across the shard.
///
/// Shards inherit their order from the lease order of the file database. A
/// reset that fragments the id space can break this, and merging an unsorted
/// shard would silently corrupt the global order, so violations surface here
/// before the shard is handed on.
pub fn check_shard_sorted(path: &Path) -> crate::Result<()> {
    let reader = BufReader::new(File::open(path)?);

    let mut prev: Option<String> = None;
    for line in reader.lines() {
        let line = line?;
        let key = line.split(',').next().unwrap_or(&line);

        if let Some(prev) = &prev {
            if key < prev.as_str() {
                return Err(Error::UnsortedShard(path.to_path_buf()).into());
            }
        }

        prev = Some(key.to_string());
    }

    Ok(())
}

pub(crate) fn fmt_timespan(t_secs: f64) -> String {
    if t_secs < 0.0 {
        "0".to_string()
    } else if t_secs < 60.0 {
        format!("{t_secs:.0} secs")
    } else if t_secs < 3600.0 {
        format!("{:.1} mins", t_secs / 60.0)
    } else {
        format!("{:.1} hours", t_secs / 3600.0)
    }
}
