// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Durable, generation-numbered JSON documents.
//!
//! A [`Ledger`] wraps a serializable value and commits it to one or more
//! paths.  Values carry a [`Generation`] so that, when several copies exist,
//! the newest committed copy wins on load.  Commits write to a temporary
//! sibling file and rename it into place, so a crash mid-write can never
//! truncate a previously committed document.

use camino::{Utf8Path, Utf8PathBuf};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use slog::{Logger, debug, warn};
use tokio::io::AsyncWriteExt;

/// A monotonically increasing generation number.
///
/// Generations begin at one and are bumped by [`Ledger::commit`] through
/// [`Ledgerable::generation_bump`].
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct Generation(u64);

impl Generation {
    pub const fn new() -> Self {
        Generation(1)
    }

    pub fn next(&self) -> Self {
        // u64 generations do not overflow in any plausible deployment.
        Generation(
            self.0.checked_add(1).expect("generation number overflowed"),
        )
    }
}

impl Default for Generation {
    fn default() -> Self {
        Generation::new()
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cannot serialize ledger contents")]
    Serialize(#[source] serde_json::Error),

    #[error("cannot write ledger to {path}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("no ledger path accepted the write")]
    FailedToCommit,
}

/// A value that can be stored in a [`Ledger`].
pub trait Ledgerable: DeserializeOwned + Serialize + Send + Sync {
    /// Returns true if this value should be preferred over `other` when
    /// multiple committed copies are found.
    fn is_newer_than(&self, other: &Self) -> bool;

    /// Bumps the generation number in preparation for a commit.
    fn generation_bump(&mut self);
}

/// Manages the durable copies of a [`Ledgerable`] value.
pub struct Ledger<T> {
    log: Logger,
    ledger: T,
    paths: Vec<Utf8PathBuf>,
}

impl<T: Ledgerable> Ledger<T> {
    /// Reads the newest committed copy of `T` from `paths`.
    ///
    /// Unreadable or unparseable copies are skipped with a warning; if no
    /// usable copy exists at all, returns `None`.  This is how "no prior
    /// state" is distinguished from the value's own defaults: the caller
    /// decides what an absent ledger means.
    pub async fn new(log: &Logger, paths: Vec<Utf8PathBuf>) -> Option<Self> {
        let mut ledger: Option<T> = None;
        for path in &paths {
            if let Some(found) = Self::read_from(log, path).await {
                let replace = match &ledger {
                    None => true,
                    Some(existing) => found.is_newer_than(existing),
                };
                if replace {
                    ledger.replace(found);
                }
            }
        }
        ledger.map(|ledger| Self { log: log.clone(), ledger, paths })
    }

    /// Creates a ledger holding `default`, not yet committed anywhere.
    pub fn new_with(
        log: &Logger,
        paths: Vec<Utf8PathBuf>,
        default: T,
    ) -> Self {
        Self { log: log.clone(), ledger: default, paths }
    }

    pub fn data(&self) -> &T {
        &self.ledger
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.ledger
    }

    pub fn into_inner(self) -> T {
        self.ledger
    }

    /// Writes the value back to all paths, bumping its generation first.
    ///
    /// The commit succeeds if at least one path accepts the write; paths
    /// that fail are logged and skipped.
    pub async fn commit(&mut self) -> Result<(), Error> {
        self.ledger.generation_bump();
        let serialized = serde_json::to_string_pretty(&self.ledger)
            .map_err(Error::Serialize)?;

        let mut one_successful_write = false;
        for path in &self.paths {
            debug!(self.log, "writing ledger"; "path" => %path);
            match write_atomically(path, serialized.as_bytes()).await {
                Ok(()) => one_successful_write = true,
                Err(err) => {
                    warn!(
                        self.log,
                        "failed to write ledger";
                        "path" => %path,
                        "err" => %err,
                    );
                }
            }
        }

        if !one_successful_write {
            return Err(Error::FailedToCommit);
        }
        Ok(())
    }

    async fn read_from(log: &Logger, path: &Utf8Path) -> Option<T> {
        if !path.exists() {
            debug!(log, "no ledger present"; "path" => %path);
            return None;
        }
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(ledger) => Some(ledger),
                Err(err) => {
                    warn!(
                        log,
                        "cannot parse ledger as JSON";
                        "path" => %path,
                        "err" => %err,
                    );
                    None
                }
            },
            Err(err) => {
                warn!(
                    log,
                    "cannot read ledger";
                    "path" => %path,
                    "err" => %err,
                );
                None
            }
        }
    }
}

fn temporary_sibling(path: &Utf8Path) -> Utf8PathBuf {
    // "deployment.json" commits through "deployment.json.tmp" in the same
    // directory, so the rename below stays on one filesystem.
    let mut name = path.file_name().unwrap_or("ledger").to_string();
    name.push_str(".tmp");
    path.with_file_name(name)
}

async fn write_atomically(
    path: &Utf8Path,
    contents: &[u8],
) -> Result<(), Error> {
    let tmp_path = temporary_sibling(path);
    let write = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, path).await
    };
    write.await.map_err(|err| Error::Write { path: path.to_owned(), err })
}
