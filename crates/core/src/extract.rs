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

//! Random-access record extraction. Containers store one gzip member per
//! record, and the companion offset table gives each record's byte range, so
//! a record can be pulled out without decompressing the rest of the file.
//! Requests are grouped so every container is opened at most once per run,
//! and containers are spread over a thread pool since the bottleneck is
//! parallel disk reads.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use bzip2::write::BzEncoder;
use crossbeam_channel::unbounded;
use flate2::read::GzDecoder;
use tracing::{error, info, warn};

use crate::config::ExtractorConfig;
use crate::id::{Datatype, RecordId};
use crate::offsets;
use crate::Error;

/// Every record requested from one container, in request order.
struct ContainerTask {
    container: PathBuf,
    offsets_path: PathBuf,
    records: Vec<RecordId>,
}

fn read_records_file(path: &Path) -> crate::Result<Vec<RecordId>> {
    let file = File::open(path)
        .with_context(|| format!("missing records file: {}", path.display()))?;

    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.parse::<RecordId>() {
            Ok(id) => records.push(id),
            Err(e) => warn!("skipping line: {e}"),
        }
    }

    if records.is_empty() {
        anyhow::bail!("failed to parse any record IDs from {}", path.display());
    }

    Ok(records)
}

fn group_by_container(
    records: &[RecordId],
    root: &Path,
    datatype: Datatype,
) -> crate::Result<Vec<ContainerTask>> {
    let mut tasks: Vec<ContainerTask> = Vec::new();
    let mut by_container: HashMap<PathBuf, usize> = HashMap::new();

    for id in records {
        let container = id.container_path(root, datatype);

        match by_container.get(&container) {
            Some(&task) => tasks[task].records.push(id.clone()),
            None => {
                by_container.insert(container.clone(), tasks.len());
                tasks.push(ContainerTask {
                    offsets_path: id.offset_path(root, datatype),
                    container,
                    records: vec![id.clone()],
                });
            }
        }
    }

    // fail before any extraction starts rather than partway through
    for task in &tasks {
        if !task.container.exists() {
            return Err(Error::MissingContainer(task.container.clone()).into());
        }
        if !task.offsets_path.exists() {
            return Err(Error::MissingOffsets(task.offsets_path.clone()).into());
        }
    }

    Ok(tasks)
}

/// Output file mirroring the container's `<lang>/<stream>/<subdir>/<file>`
/// tail. Recompressed outputs swap the trailing `.gz` for `.bz2`.
fn output_path(task: &ContainerTask, out_root: &Path, bzip2: bool) -> PathBuf {
    let id = &task.records[0];

    let name = task
        .container
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let name = if bzip2 {
        match name.strip_suffix(".gz") {
            Some(stem) => format!("{stem}.bz2"),
            None => name.to_string(),
        }
    } else {
        name.to_string()
    };

    out_root
        .join(id.language())
        .join(id.stream())
        .join(id.subdir())
        .join(name)
}

fn extract_container(task: &ContainerTask, out_root: &Path, bzip2: bool) -> crate::Result<usize> {
    let output = output_path(task, out_root, bzip2);
    if output.exists() {
        info!("skipping existing output {}", output.display());
        return Ok(0);
    }

    // ascending lookups keep both the offset table and the container
    // seeking forward only
    let mut indices: Vec<u64> = task
        .records
        .iter()
        .map(|id| u64::from(id.record()))
        .collect();
    indices.sort_unstable();
    indices.dedup();

    let mut offsets_file = File::open(&task.offsets_path)?;
    let ranges = offsets::read_offsets(&mut offsets_file, &indices)?;

    let mut container = File::open(&task.container)?;
    let mut slices: HashMap<u64, Vec<u8>> = HashMap::new();

    for (&index, &(start, end)) in indices.iter().zip(ranges.iter()) {
        if end < start {
            return Err(Error::InvalidOffsets.into());
        }

        container.seek(SeekFrom::Start(start))?;
        let mut slice = vec![0u8; (end - start) as usize];
        container.read_exact(&mut slice)?;
        slices.insert(index, slice);
    }

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if bzip2 {
        // one running compressor per output file; each record's gzip member
        // is unpacked and fed straight through
        let mut encoder = BzEncoder::new(
            BufWriter::new(File::create(&output)?),
            bzip2::Compression::best(),
        );

        for id in &task.records {
            let slice = &slices[&u64::from(id.record())];
            let mut decoder = GzDecoder::new(&slice[..]);
            std::io::copy(&mut decoder, &mut encoder)?;
        }

        encoder.finish()?.flush()?;
    } else {
        let mut out = BufWriter::new(File::create(&output)?);

        for id in &task.records {
            out.write_all(&slices[&u64::from(id.record())])?;
        }

        out.flush()?;
    }

    Ok(task.records.len())
}

pub fn run(config: &ExtractorConfig) -> crate::Result<()> {
    let record_ids = read_records_file(&config.records_file)?;
    let tasks = group_by_container(&record_ids, &config.root, config.datatype)?;

    let total = record_ids.len();
    info!("{total} IDs to extract from {} files", tasks.len());

    let out_root = config.output_path.join(config.datatype.as_str());
    std::fs::create_dir_all(&out_root)?;

    let (task_tx, task_rx) = unbounded();
    for task in tasks {
        task_tx.send(task).unwrap();
    }
    drop(task_tx);

    let (done_tx, done_rx) = unbounded();

    let mut extracted = 0usize;
    let mut last_logged = 0usize;

    std::thread::scope(|s| {
        for _ in 0..config.workers.max(1) {
            let task_rx = task_rx.clone();
            let done_tx = done_tx.clone();
            let out_root = out_root.clone();
            let bzip2 = config.bzip2;

            s.spawn(move || {
                while let Ok(task) = task_rx.recv() {
                    match extract_container(&task, &out_root, bzip2) {
                        Ok(records) => {
                            let _ = done_tx.send(records);
                        }
                        Err(e) => {
                            // other containers keep going
                            error!(
                                "extraction failed for {}: {e:#}",
                                task.container.display()
                            );
                            let _ = done_tx.send(0);
                        }
                    }
                }
            });
        }
        drop(done_tx);

        for records in done_rx.iter() {
            extracted += records;
            if extracted - last_logged > 100 {
                info!("extracted {extracted}/{total}");
                last_logged = extracted;
            }
        }
    });

    info!("extracted {extracted} of {total} requested records");

    Ok(())
}

#[cfg(test)]
mod tests {
    use bzip2::read::BzDecoder;

    use crate::scan::tests::gzip_member;

    use super::*;

    /// Lay out `<root>/txt/en/en00/en0003/en0003-18.json.gz` with one gzip
    /// member per record plus its offset table, and return the members.
    fn build_corpus(root: &Path, records: usize) -> Vec<Vec<u8>> {
        let dir = root.join("txt/en/en00/en0003");
        std::fs::create_dir_all(&dir).unwrap();

        let mut members = Vec::new();
        let mut container = Vec::new();
        let mut table = String::new();

        for i in 0..records {
            let member = gzip_member(format!("{{\"i\":{i}}}\n").as_bytes());
            let start = container.len();
            let end = start + member.len();
            table.push_str(&format!("{start:010}\n{end:010}\n"));
            container.extend_from_slice(&member);
            members.push(member);
        }

        std::fs::write(dir.join("en0003-18.json.gz"), container).unwrap();
        std::fs::write(dir.join("en0003-18.offset"), table).unwrap();

        members
    }

    fn list_files(dir: &Path, out: &mut Vec<PathBuf>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_dir() {
                list_files(&entry.path(), out);
            } else {
                out.push(entry.path());
            }
        }
    }

    fn config(root: &Path, records_file: &Path, output: &Path, bzip2: bool) -> ExtractorConfig {
        ExtractorConfig {
            records_file: records_file.to_path_buf(),
            root: root.to_path_buf(),
            datatype: Datatype::Txt,
            output_path: output.to_path_buf(),
            bzip2,
            workers: 2,
        }
    }

    #[test]
    fn passthrough_extraction_in_request_order() {
        let dir = tempfile::tempdir().unwrap();
        let members = build_corpus(dir.path(), 43);

        let records_file = dir.path().join("records.txt");
        std::fs::write(
            &records_file,
            "clueweb22-en0003-18-00042\nclueweb22-en0003-18-00001\n",
        )
        .unwrap();

        let output = dir.path().join("out");
        run(&config(dir.path(), &records_file, &output, false)).unwrap();

        let mut produced = Vec::new();
        list_files(&output, &mut produced);
        assert_eq!(
            produced,
            vec![output.join("txt/en/en00/en0003/en0003-18.json.gz")]
        );

        let bytes = std::fs::read(&produced[0]).unwrap();
        let mut expected = members[42].clone();
        expected.extend_from_slice(&members[1]);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn bzip2_recompression_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        build_corpus(dir.path(), 43);

        let records_file = dir.path().join("records.txt");
        std::fs::write(
            &records_file,
            "clueweb22-en0003-18-00042\nclueweb22-en0003-18-00001\n",
        )
        .unwrap();

        let output = dir.path().join("out");
        run(&config(dir.path(), &records_file, &output, true)).unwrap();

        let path = output.join("txt/en/en00/en0003/en0003-18.json.bz2");
        let mut decoded = String::new();
        BzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();

        assert_eq!(decoded, "{\"i\":42}\n{\"i\":1}\n");
    }

    #[test]
    fn missing_container_fails_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        build_corpus(dir.path(), 1);

        let records_file = dir.path().join("records.txt");
        std::fs::write(&records_file, "clueweb22-de0000-00-00000\n").unwrap();

        let output = dir.path().join("out");
        let err = run(&config(dir.path(), &records_file, &output, false)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::MissingContainer(_))
        ));
    }

    #[test]
    fn truncated_offset_table_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        build_corpus(dir.path(), 2);

        let records_file = dir.path().join("records.txt");
        std::fs::write(&records_file, "clueweb22-en0003-18-00040\n").unwrap();

        let output = dir.path().join("out");
        // the run itself succeeds; the failed container is logged and skipped
        run(&config(dir.path(), &records_file, &output, false)).unwrap();

        let mut produced = Vec::new();
        if output.join("txt").exists() {
            list_files(&output.join("txt"), &mut produced);
        }
        assert!(produced.is_empty());
    }
}
