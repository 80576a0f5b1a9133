// trit is a password-authenticated, end-to-end encrypted LAN file transfer tool.
// Copyright (C) 2025  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! The persistent registry of files staged for the next transfer.
//!
//! The registry lives in a hidden `.trit` directory inside the working
//! directory and holds absolute paths. Staged files that disappear between
//! invocations are dropped with a notice on load.

use crate::error::{Error, Result};

use std::fs;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

const STAGING_DIR: &str = ".trit";
const STAGING_FILE: &str = "staged.toml";

/// The outcome of staging a set of patterns.
#[derive(Debug, Default)]
pub struct StageOutcome {
    /// Files newly added to the registry.
    pub added: Vec<PathBuf>,
    /// Matching files that were staged before this invocation.
    pub already_staged: Vec<PathBuf>,
}

/// A `StagingArea` is the set of absolute file paths selected for transfer.
#[derive(Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StagingArea {
    files: Vec<PathBuf>,
}

impl StagingArea {
    fn registry_path(root: &Path) -> PathBuf {
        root.join(STAGING_DIR).join(STAGING_FILE)
    }

    /// Loads the registry of the working directory `root`,
    /// silently starting empty if none exists yet.
    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::registry_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }

        let mut area: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        area.files.retain(|file| {
            let present = file.is_file();
            if !present {
                eprintln!("staged file {} no longer exists", file.display());
            }
            present
        });

        Ok(area)
    }

    /// Saves the registry beneath the working directory `root`.
    pub fn save(&self, root: &Path) -> Result<()> {
        let path = Self::registry_path(root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Deletes the registry file. Returns whether one existed.
    pub fn clear(root: &Path) -> Result<bool> {
        let path = Self::registry_path(root);
        if !path.exists() {
            return Ok(false);
        }

        fs::remove_file(path)?;
        Ok(true)
    }

    /// The staged files in sorted order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Stages every file beneath `root` matching one of `patterns`.
    /// Files that are already staged are reported, not duplicated.
    pub fn add(&mut self, root: &Path, patterns: &[String]) -> Result<StageOutcome> {
        let globs = build_globset(root, patterns)?;
        let mut outcome = StageOutcome::default();

        for path in files_beneath(root) {
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            if !globs.is_match(relative) {
                continue;
            }

            if self.files.contains(&path) {
                outcome.already_staged.push(path);
            } else {
                debug!("staging {}", path.display());
                self.files.push(path.clone());
                outcome.added.push(path);
            }
        }

        self.files.sort();
        Ok(outcome)
    }

    /// Unstages every staged file matching one of `patterns`.
    /// Returns the removed paths.
    pub fn drop_matching(&mut self, root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
        let globs = build_globset(root, patterns)?;

        let mut dropped = Vec::new();
        self.files.retain(|path| {
            let matched = path
                .strip_prefix(root)
                .map(|relative| globs.is_match(relative))
                .unwrap_or(false);
            if matched {
                dropped.push(path.clone());
            }
            !matched
        });

        Ok(dropped)
    }
}

/// Formats `path` relative to `root` for display, falling back to the
/// absolute path for anything outside of it.
pub fn display_relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}

// Pattern syntax follows globset with literal separators: `*` and `?` stay
// within one path segment, `**` recurses. Naming an existing directory
// stages everything beneath it.
fn build_globset(root: &Path, patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();

    for pattern in patterns {
        let pattern = if root.join(pattern).is_dir() {
            format!("{}/**", pattern.trim_end_matches('/'))
        } else {
            pattern.clone()
        };

        let glob = GlobBuilder::new(&pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| Error::BadPattern {
                pattern: pattern.clone(),
                source: e,
            })?;
        builder.add(glob);
    }

    builder.build().map_err(|e| Error::BadPattern {
        pattern: patterns.join(" "),
        source: e,
    })
}

// Every regular file beneath `root`, skipping the registry directory itself.
fn files_beneath(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != STAGING_DIR)
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}
