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

//! External merge of the per-worker shards into one globally sorted stream.
//! The corpus index is far too large to sort in memory, so each shard is
//! sorted on its own (by coreutils `sort`, which we only drive) and a
//! min-heap then interleaves the sorted shards line by line.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::process::Command;

use tracing::{info, warn};

/// One merge input: the line most recently read from a shard, keyed by its
/// first comma-delimited field (the ClueWeb22-ID), plus the reader it came
/// from. Orders by key alone; lines with equal keys come out in whatever
/// order the heap yields them.
struct Head {
    key: String,
    line: String,
    reader: BufReader<File>,
}

impl Head {
    fn new(mut reader: BufReader<File>) -> Option<Self> {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }

        Some(Head {
            key: key_of(&line),
            line,
            reader,
        })
    }
}

fn key_of(line: &str) -> String {
    line.split(',').next().unwrap_or(line).to_string()
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for Head {}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.key.eq(&other.key)
    }
}

/// Merge every `*.csv.sorted` file directly inside `input_dir` into a single
/// sorted `output` file. Inputs must already be sorted ascending by their
/// first field; the merge conserves every line and never deduplicates.
/// Memory use is one line per open input, and inputs are dropped as they run
/// dry. Returns the number of lines written.
pub fn merge_sorted_shards(input_dir: &Path, output: &Path) -> crate::Result<u64> {
    let mut heap = BinaryHeap::new();
    let mut inputs = 0;

    for entry in std::fs::read_dir(input_dir)? {
        let entry = entry?;
        let name = entry.file_name();

        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(".csv.sorted") || !entry.file_type()?.is_file() {
            continue;
        }

        inputs += 1;
        let reader = BufReader::new(File::open(entry.path())?);
        if let Some(head) = Head::new(reader) {
            heap.push(Reverse(head));
        } else {
            info!("skipping empty input {name}");
        }
    }

    info!("opened {inputs} files");

    let mut out = BufWriter::new(File::create(output)?);
    let mut written = 0u64;

    while let Some(Reverse(mut head)) = heap.pop() {
        out.write_all(head.line.as_bytes())?;
        written += 1;

        if written % 1_000_000 == 0 {
            info!("written={written}, heap length={}", heap.len() + 1);
        }

        let mut next = String::new();
        if head.reader.read_line(&mut next)? > 0 {
            head.key = key_of(&next);
            head.line = next;
            heap.push(Reverse(head));
        }
        // at EOF the head is dropped here, closing the file
    }

    out.flush()?;
    info!("merged {written} lines from {inputs} files");

    Ok(written)
}

/// Sort each `*.csv` under `src` into `<dst>/<name>.csv.sorted` using the
/// coreutils `sort` tool, which parallelises and spills to disk on its own.
/// Sorting only touches the first comma-delimited field. Outputs whose size
/// already matches their input are skipped so interrupted runs can resume.
/// Returns the number of files successfully sorted.
pub fn sort_shards(src: &Path, dst: &Path, cores: usize, buffer_gb: usize) -> crate::Result<usize> {
    std::fs::create_dir_all(dst)?;

    let mut successful = 0;

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();

        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(".csv") || !entry.file_type()?.is_file() {
            continue;
        }

        let input = entry.path();
        let output = dst.join(format!("{name}.sorted"));

        let input_size = entry.metadata()?.len();
        if let Ok(meta) = output.metadata() {
            // a sorted file is a permutation of its input, so equal sizes
            // mean this one is already done
            if meta.len() == input_size {
                info!("skipping existing file {}, sizes match", output.display());
                successful += 1;
                continue;
            }
            warn!("incomplete existing file found, will overwrite");
        }

        info!("sorting {} into {}", input.display(), output.display());

        // sorting is on ClueWeb22-IDs, which are plain ASCII; LC_ALL=C keeps
        // the byte order and makes sort considerably faster
        let status = Command::new("sort")
            .env("LC_ALL", "C")
            .arg("-t")
            .arg(",")
            .arg("-k")
            .arg("1,1")
            .arg(format!("--parallel={cores}"))
            .arg("-S")
            .arg(format!("{buffer_gb}G"))
            .arg("-o")
            .arg(&output)
            .arg(&input)
            .status()?;

        if !status.success() {
            warn!("sort failed on {} ({status})", input.display());
            continue;
        }

        if output.metadata()?.len() == input_size {
            successful += 1;
        }
    }

    Ok(successful)
}
