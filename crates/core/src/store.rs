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

//! Durable catalogue of container files and their scan state. This database
//! is the single arbiter of progress: batches of files are leased to jobs
//! from here, and nothing else may infer progress from side effects.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use itertools::Itertools;
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{error, info, warn};

use crate::Error;

/// Scan state of a container file. Rows only move along
/// `NotStarted -> InProgress -> Done`, with a reset edge back to `NotStarted`
/// for crash recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotStarted = 0,
    InProgress = 1,
    Done = 2,
}

#[derive(Debug)]
pub struct FileDatabase {
    conn: Connection,
}

impl FileDatabase {
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(30))?;

        Ok(FileDatabase { conn })
    }

    /// Create a new, empty database. Refuses to overwrite an existing file.
    pub fn create<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            return Err(Error::DatabaseExists(path.to_path_buf()).into());
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS files (
                id INTEGER NOT NULL PRIMARY KEY,
                path TEXT UNIQUE,
                records INTEGER,
                state INTEGER,
                job TEXT,
                started TEXT,
                finished TEXT
            )",
            [],
        )?;

        Ok(FileDatabase { conn })
    }

    /// Insert rows in the given order inside a single transaction. Row ids
    /// follow insertion order, and batches are leased in ascending id order,
    /// so inserting in path-sorted order is what keeps worker shards sorted.
    pub fn insert_files<I>(&mut self, files: I) -> crate::Result<usize>
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;

        {
            let mut stmt =
                tx.prepare("INSERT INTO files VALUES (NULL, ?1, ?2, ?3, NULL, NULL, NULL)")?;

            for (path, records) in files {
                stmt.execute(params![path, records as i64, State::NotStarted as i64])?;
                inserted += 1;
            }
        }

        tx.commit()?;

        Ok(inserted)
    }

    /// Build the database for a corpus: walk `<root>/txt` for `*.json.gz`
    /// containers, pick up the expected record counts from
    /// `<root>/record_counts/txt`, and insert everything in path-sorted order.
    pub fn generate(clueweb_root: &Path, output: &Path) -> crate::Result<()> {
        // refuse up front, before the (long) corpus walk
        if output.exists() {
            return Err(Error::DatabaseExists(output.to_path_buf()).into());
        }

        let data_root = clueweb_root.join("txt");
        info!("looking for ClueWeb txt data files under {}", data_root.display());

        let mut files: BTreeMap<String, (PathBuf, u64)> = BTreeMap::new();
        collect_data_files(&data_root, &mut files)?;
        info!("built list of {} data files", files.len());

        read_record_counts(&clueweb_root.join("record_counts").join("txt"), &mut files)?;
        info!("extracted all record counts");

        let mut db = Self::create(output)?;
        let rows = db.insert_files(
            files
                .into_values()
                .map(|(path, records)| (path.to_string_lossy().into_owned(), records)),
        )?;

        info!("database with {rows} rows generated");

        Ok(())
    }

    /// Atomically lease up to `count` unscanned files to `job_id`, in
    /// ascending id order. Returns the row ids and paths; both empty once the
    /// catalogue is exhausted or on a database error.
    pub fn get_next_batch(&mut self, job_id: &str, count: usize) -> (Vec<i64>, Vec<String>) {
        match self.try_get_next_batch(job_id, count) {
            Ok(batch) => batch,
            Err(e) => {
                error!("get_next_batch: database error occurred: {e}");
                (Vec::new(), Vec::new())
            }
        }
    }

    fn try_get_next_batch(
        &mut self,
        job_id: &str,
        count: usize,
    ) -> rusqlite::Result<(Vec<i64>, Vec<String>)> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut ids = Vec::new();
        let mut paths = Vec::new();

        {
            let mut stmt =
                tx.prepare("SELECT id, path FROM files WHERE state = ?1 ORDER BY id ASC LIMIT ?2")?;
            let rows = stmt.query_map(
                params![State::NotStarted as i64, count as i64],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )?;

            for row in rows {
                let (id, path) = row?;
                ids.push(id);
                paths.push(path);
            }
        }

        if !ids.is_empty() {
            tx.execute(
                &format!(
                    "UPDATE files SET state = ?1, job = ?2, started = ?3 WHERE id IN ({})",
                    ids.iter().join(",")
                ),
                params![State::InProgress as i64, job_id, timestamp()],
            )?;
        }

        tx.commit()?;

        Ok((ids, paths))
    }

    /// Sum of the declared record counts over every file leased by `job_id`.
    pub fn get_record_count_for_job(&self, job_id: &str) -> u64 {
        let res = self.conn.query_row(
            "SELECT COALESCE(SUM(records), 0) FROM files WHERE job = ?1",
            params![job_id],
            |row| row.get::<_, i64>(0),
        );

        match res {
            Ok(count) => count as u64,
            Err(e) => {
                error!("get_record_count_for_job: database error occurred: {e}");
                0
            }
        }
    }

    /// Return every file leased by `job_id` to `NotStarted` and drop the
    /// lease, so the files can be handed out again.
    pub fn clear_batch(&mut self, job_id: &str) -> bool {
        let res = self.conn.execute(
            "UPDATE files SET state = ?1, job = NULL WHERE job = ?2",
            params![State::NotStarted as i64, job_id],
        );

        if let Err(e) = res {
            error!("clear_batch: database error occurred: {e}");
            return false;
        }

        true
    }

    /// Per-file variant of [`clear_batch`](Self::clear_batch), used when a
    /// single scan fails and the error policy asks for an immediate retry.
    pub fn clear_files(&mut self, paths: &[String]) -> bool {
        let res: rusqlite::Result<()> = (|| {
            let tx = self.conn.transaction()?;

            {
                let mut stmt =
                    tx.prepare("UPDATE files SET state = ?1, job = NULL WHERE path = ?2")?;
                for path in paths {
                    let changed = stmt.execute(params![State::NotStarted as i64, path])?;
                    if changed == 0 {
                        warn!("{path} is not present in the database");
                    }
                }
            }

            tx.commit()
        })();

        if let Err(e) = res {
            error!("clear_files: database error occurred: {e}");
            return false;
        }

        true
    }

    /// Mark every file leased by `job_id` as scanned.
    pub fn complete_batch(&mut self, job_id: &str) -> bool {
        let res = self.conn.execute(
            "UPDATE files SET state = ?1, finished = ?2 WHERE job = ?3",
            params![State::Done as i64, timestamp(), job_id],
        );

        if let Err(e) = res {
            error!("complete_batch: database error occurred: {e}");
            return false;
        }

        true
    }

    /// Mark the listed files as scanned. Paths that are not in the catalogue
    /// are logged and skipped.
    pub fn complete_batch_files(&mut self, paths: &[String]) -> bool {
        let res: rusqlite::Result<()> = (|| {
            let tx = self.conn.transaction()?;

            {
                let mut stmt =
                    tx.prepare("UPDATE files SET state = ?1, finished = ?2 WHERE path = ?3")?;
                for path in paths {
                    let changed =
                        stmt.execute(params![State::Done as i64, timestamp(), path])?;
                    if changed == 0 {
                        warn!("{path} is not present in the database");
                    }
                }
            }

            tx.commit()
        })();

        if let Err(e) = res {
            error!("complete_batch_files: database error occurred: {e}");
            return false;
        }

        true
    }

    /// Number of scanned files and the total number of files.
    pub fn check_progress(&self) -> crate::Result<(u64, u64)> {
        let done: i64 = self.conn.query_row(
            "SELECT COUNT(state) FROM files WHERE state = ?1",
            params![State::Done as i64],
            |row| row.get(0),
        )?;
        let total: i64 =
            self.conn
                .query_row("SELECT COUNT(state) FROM files", [], |row| row.get(0))?;

        Ok((done as u64, total as u64))
    }
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn collect_data_files(
    dir: &Path,
    files: &mut BTreeMap<String, (PathBuf, u64)>,
) -> crate::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if entry.file_type()?.is_dir() {
            collect_data_files(&path, files)?;
            continue;
        }

        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        if let Some(stem) = name.strip_suffix(".json.gz") {
            files.insert(stem.to_string(), (path, 0));

            if files.len() % 10_000 == 0 {
                info!("files found: {}", files.len());
            }
        }
    }

    Ok(())
}

fn read_record_counts(
    dir: &Path,
    files: &mut BTreeMap<String, (PathBuf, u64)>,
) -> crate::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if entry.file_type()?.is_dir() {
            read_record_counts(&path, files)?;
            continue;
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&path)?;

        for record in reader.records() {
            let record = record?;
            let (Some(file_id), Some(count)) = (record.get(0), record.get(1)) else {
                anyhow::bail!("malformed record count row in {}", path.display());
            };

            match files.get_mut(file_id) {
                Some(entry) => entry.1 = count.trim().parse()?,
                // should never happen for a valid copy of the dataset
                None => warn!("could not find {file_id} in data files ({})", path.display()),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(rows: &[(&str, u64)]) -> FileDatabase {
        let mut db = FileDatabase::create(crate::gen_temp_path()).unwrap();
        db.insert_files(
            rows.iter()
                .map(|(path, records)| (path.to_string(), *records)),
        )
        .unwrap();
        db
    }

    fn five_files() -> FileDatabase {
        fixture(&[
            ("en0000-00.json.gz", 10),
            ("en0000-01.json.gz", 20),
            ("en0000-02.json.gz", 30),
            ("en0000-03.json.gz", 40),
            ("en0000-04.json.gz", 50),
        ])
    }

    #[test]
    fn batch_leasing_and_reset() {
        let mut db = five_files();

        let (ids, paths) = db.get_next_batch("A", 3);
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(
            paths,
            vec!["en0000-00.json.gz", "en0000-01.json.gz", "en0000-02.json.gz"]
        );

        let (ids, _) = db.get_next_batch("B", 3);
        assert_eq!(ids, vec![4, 5]);

        assert!(db.clear_batch("A"));

        let (ids, _) = db.get_next_batch("B", 5);
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn clear_batch_is_idempotent() {
        let mut db = five_files();

        db.get_next_batch("A", 5);
        assert!(db.clear_batch("A"));
        assert!(db.clear_batch("A"));

        let (ids, _) = db.get_next_batch("B", 5);
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn exhausted_database_returns_empty_batches() {
        let mut db = fixture(&[("a.json.gz", 1)]);

        let (ids, _) = db.get_next_batch("A", 5);
        assert_eq!(ids, vec![1]);

        let (ids, paths) = db.get_next_batch("A", 5);
        assert!(ids.is_empty());
        assert!(paths.is_empty());
    }

    #[test]
    fn concurrent_leases_never_overlap() {
        let path = crate::gen_temp_path();
        {
            let mut db = FileDatabase::create(&path).unwrap();
            db.insert_files((0..10).map(|i| (format!("en0000-{i:02}.json.gz"), 1)))
                .unwrap();
        }

        let mut handles = Vec::new();
        for job in ["A", "B"] {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                let mut db = FileDatabase::open(path).unwrap();
                let (ids, _) = db.get_next_batch(job, 3);
                ids
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }

        all.sort_unstable();
        assert_eq!(all, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn completion_and_progress() {
        let mut db = five_files();

        let (_, paths) = db.get_next_batch("A", 2);
        assert_eq!(db.get_record_count_for_job("A"), 30);

        assert!(db.complete_batch("A"));
        assert_eq!(db.check_progress().unwrap(), (2, 5));

        // still attributed to the job after completion
        assert_eq!(db.get_record_count_for_job("A"), 30);

        assert!(db.complete_batch_files(&paths));
        assert_eq!(db.check_progress().unwrap(), (2, 5));
    }

    #[test]
    fn complete_batch_files_ignores_unknown_paths() {
        let mut db = five_files();

        db.get_next_batch("A", 1);
        assert!(db.complete_batch_files(&[
            "en0000-00.json.gz".to_string(),
            "missing.json.gz".to_string(),
        ]));

        assert_eq!(db.check_progress().unwrap(), (1, 5));
    }

    #[test]
    fn clear_files_returns_single_rows() {
        let mut db = five_files();

        let (_, paths) = db.get_next_batch("A", 2);
        assert!(db.clear_files(&paths[..1]));

        let (ids, paths) = db.get_next_batch("B", 5);
        assert_eq!(ids, vec![1, 3, 4, 5]);
        assert_eq!(paths[0], "en0000-00.json.gz");
    }

    #[test]
    fn create_refuses_to_overwrite() {
        let path = crate::gen_temp_path();
        FileDatabase::create(&path).unwrap();

        let err = FileDatabase::create(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::DatabaseExists(_))
        ));
    }

    #[test]
    fn generate_walks_the_corpus() {
        let root = tempfile::tempdir().unwrap();
        let subdir = root.path().join("txt/en/en00/en0000");
        std::fs::create_dir_all(&subdir).unwrap();
        std::fs::write(subdir.join("en0000-01.json.gz"), b"").unwrap();
        std::fs::write(subdir.join("en0000-00.json.gz"), b"").unwrap();
        std::fs::write(subdir.join("en0000-00.offset"), b"").unwrap();

        let counts = root.path().join("record_counts/txt");
        std::fs::create_dir_all(&counts).unwrap();
        std::fs::write(counts.join("en00_counts.csv"), "en0000-00,3\nen0000-01,5\n").unwrap();

        let output = root.path().join("files.db");
        FileDatabase::generate(root.path(), &output).unwrap();

        let mut db = FileDatabase::open(&output).unwrap();
        assert_eq!(db.check_progress().unwrap(), (0, 2));

        // inserted in sorted order, offset files ignored
        let (ids, paths) = db.get_next_batch("A", 10);
        assert_eq!(ids, vec![1, 2]);
        assert!(paths[0].ends_with("en0000-00.json.gz"));
        assert!(paths[1].ends_with("en0000-01.json.gz"));

        assert_eq!(db.get_record_count_for_job("A"), 8);
    }
}
