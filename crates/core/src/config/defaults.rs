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

pub struct Coordinator;

impl Coordinator {
    pub fn port() -> u16 {
        23456
    }

    pub fn ctrl_port() -> u16 {
        23457
    }
}

pub struct Supervisor;

impl Supervisor {
    pub fn control_port() -> u16 {
        23456
    }

    pub fn job_name() -> String {
        "scan".to_string()
    }
}

pub struct Extractor;

impl Extractor {
    pub fn workers() -> usize {
        8
    }
}

pub struct Counter;

impl Counter {
    pub fn counts_database() -> PathBuf {
        PathBuf::from("counts.db")
    }
}

pub struct Sort;

impl Sort {
    pub fn cores() -> usize {
        8
    }

    pub fn buffer_gb() -> usize {
        10
    }
}
