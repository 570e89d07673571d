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

use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::Error;

/// The two per-record layouts of the corpus. Text containers hold JSON-Lines
/// records, html containers hold WARC records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Txt,
    Html,
}

impl Datatype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::Txt => "txt",
            Datatype::Html => "html",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Datatype::Txt => "json.gz",
            Datatype::Html => "warc.gz",
        }
    }
}

impl FromStr for Datatype {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "txt" => Ok(Datatype::Txt),
            "html" => Ok(Datatype::Html),
            other => anyhow::bail!("datatype must be \"txt\" or \"html\", got \"{other}\""),
        }
    }
}

/// A parsed ClueWeb22 document identifier.
///
/// IDs have the form `clueweb22-<subdir>-<fileseq>-<recordseq>` with an
/// optional prefix; `en0003-18-00042` names record 42 of the container
/// `en0003-18`. The subdir starts with a language code of one or more
/// non-digit characters, and the first two digits after it form the stream id
/// (`en00` for `en0003`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordId {
    subdir: String,
    fileseq: String,
    record: u32,
}

impl FromStr for RecordId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let id = s.trim();
        let id = id.strip_prefix("clueweb22-").unwrap_or(id);

        let mut parts = id.split('-');
        let (Some(subdir), Some(fileseq), Some(recordseq), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::MalformedId(s.to_string()));
        };

        let lang_len = subdir
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(subdir.len());

        // a language code plus at least the two stream digits
        if lang_len == 0 || subdir.len() < lang_len + 2 {
            return Err(Error::MalformedId(s.to_string()));
        }

        if fileseq.is_empty() || !fileseq.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::MalformedId(s.to_string()));
        }

        if recordseq.len() != 5 || !recordseq.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::MalformedId(s.to_string()));
        }

        Ok(RecordId {
            subdir: subdir.to_string(),
            fileseq: fileseq.to_string(),
            record: recordseq.parse().map_err(|_| Error::MalformedId(s.to_string()))?,
        })
    }
}

impl RecordId {
    fn lang_len(&self) -> usize {
        self.subdir
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(self.subdir.len())
    }

    pub fn language(&self) -> &str {
        &self.subdir[..self.lang_len()]
    }

    pub fn stream(&self) -> &str {
        &self.subdir[..self.lang_len() + 2]
    }

    pub fn subdir(&self) -> &str {
        &self.subdir
    }

    /// Container file name without its extension, e.g. `en0003-18`.
    pub fn file_stem(&self) -> String {
        format!("{}-{}", self.subdir, self.fileseq)
    }

    /// Index of this record in the container's offset table.
    pub fn record(&self) -> u32 {
        self.record
    }

    pub fn container_path(&self, root: &Path, datatype: Datatype) -> PathBuf {
        root.join(datatype.as_str())
            .join(self.language())
            .join(self.stream())
            .join(&self.subdir)
            .join(format!("{}.{}", self.file_stem(), datatype.extension()))
    }

    /// Path of the offset table next to the container. Text containers are
    /// named `<stem>.json.gz` / `<stem>.offset`, html containers
    /// `<stem>.warc.gz` / `<stem>.warc.offset`.
    pub fn offset_path(&self, root: &Path, datatype: Datatype) -> PathBuf {
        let name = match datatype {
            Datatype::Txt => format!("{}.offset", self.file_stem()),
            Datatype::Html => format!("{}.warc.offset", self.file_stem()),
        };

        root.join(datatype.as_str())
            .join(self.language())
            .join(self.stream())
            .join(&self.subdir)
            .join(name)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn decode_txt() {
        let id: RecordId = "clueweb22-en0003-18-00042".parse().unwrap();

        assert_eq!(id.language(), "en");
        assert_eq!(id.stream(), "en00");
        assert_eq!(id.subdir(), "en0003");
        assert_eq!(id.file_stem(), "en0003-18");
        assert_eq!(id.record(), 42);

        let root = Path::new("/corpus");
        assert_eq!(
            id.container_path(root, Datatype::Txt),
            Path::new("/corpus/txt/en/en00/en0003/en0003-18.json.gz")
        );
        assert_eq!(
            id.offset_path(root, Datatype::Txt),
            Path::new("/corpus/txt/en/en00/en0003/en0003-18.offset")
        );
    }

    #[test]
    fn decode_html() {
        let id: RecordId = "de0509-93-00001".parse().unwrap();

        let root = Path::new("/corpus");
        assert_eq!(
            id.container_path(root, Datatype::Html),
            Path::new("/corpus/html/de/de05/de0509/de0509-93.warc.gz")
        );
        assert_eq!(
            id.offset_path(root, Datatype::Html),
            Path::new("/corpus/html/de/de05/de0509/de0509-93.warc.offset")
        );
    }

    #[test]
    fn prefix_is_optional() {
        let a: RecordId = "clueweb22-ja0000-00-00000".parse().unwrap();
        let b: RecordId = "ja0000-00-00000".parse().unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn malformed_ids() {
        for bad in [
            "",
            "clueweb22-",
            "en0003-18",
            "en0003-18-00042-extra",
            "0003-18-00042",
            "en-18-00042",
            "en0-18-00042",
            "en0003-x8-00042",
            "en0003-18-0042",
            "en0003-18-000421",
            "en0003-18-0004x",
        ] {
            assert!(
                bad.parse::<RecordId>().is_err(),
                "expected {bad:?} to be rejected"
            );
        }
    }

    proptest! {
        #[test]
        fn roundtrip(
            lang in "[a-z]{2,5}",
            subdir in 0u32..10_000,
            fileseq in 0u32..100,
            record in 0u32..100_000,
        ) {
            let raw = format!("clueweb22-{lang}{subdir:04}-{fileseq:02}-{record:05}");
            let id: RecordId = raw.parse().unwrap();

            prop_assert_eq!(id.language(), lang.as_str());
            let subdir_str = format!("{lang}{subdir:04}");
            prop_assert_eq!(id.subdir(), subdir_str.as_str());
            let stream_str = format!("{lang}{}", format!("{subdir:04}").get(..2).unwrap());
            prop_assert_eq!(id.stream(), stream_str.as_str());
            prop_assert_eq!(id.record(), record);

            let path = id.container_path(Path::new("/r"), Datatype::Txt);
            let prefix = format!("/r/txt/{}/", lang);
            prop_assert!(path.starts_with(&prefix));
        }
    }
}
