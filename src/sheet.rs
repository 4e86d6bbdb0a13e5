//! Sheet orchestration.
//!
//! Interprets both sides of a sheet through the worker pool concurrently and
//! decides castability from the pair.

use crate::castability::{Castability, decide};
use crate::entry::SIDECAR_SUFFIX;
use crate::error::{JobError, Result};
use crate::interpretation::{ImageDescriptor, PageInterpretation};
use crate::worker::{ShutdownHandle, WorkerPool, WorkerPoolStats};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Pool of page interpreters.
pub type PagePool = WorkerPool<ImageDescriptor, PageInterpretation>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SheetSide {
    Front,
    Back,
}

impl fmt::Display for SheetSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Front => write!(f, "front"),
            Self::Back => write!(f, "back"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SheetError {
    #[error("Failed to interpret {side} page: {source}")]
    Page {
        side: SheetSide,
        #[source]
        source: JobError,
    },
}

impl SheetError {
    pub fn side(&self) -> SheetSide {
        match self {
            Self::Page { side, .. } => *side,
        }
    }
}

/// Both page interpretations of a sheet and the decision made from them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SheetInterpretation {
    pub front: PageInterpretation,
    pub back: PageInterpretation,
    pub castability: Castability,
}

/// Front and back images of one physical sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetImages {
    pub front: ImageDescriptor,
    pub back: ImageDescriptor,
}

impl SheetImages {
    pub fn from_paths(front: impl Into<PathBuf>, back: impl Into<PathBuf>) -> Self {
        Self {
            front: ImageDescriptor::from_path(front),
            back: ImageDescriptor::from_path(back),
        }
    }
}

/// Find the sheets in a scan directory.
///
/// A sheet is a pair of files named `<name>-front.<ext>` and
/// `<name>-back.<ext>`. Recorded interpretation sidecars are skipped, as are
/// images missing their other side. Sheets are returned sorted by name.
pub fn discover_sheets(dir: &Path) -> Result<Vec<(String, SheetImages)>> {
    let mut fronts = BTreeMap::new();
    let mut backs = BTreeMap::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if file_name.ends_with(SIDECAR_SUFFIX) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(name) = stem.strip_suffix("-front") {
            fronts.insert(name.to_string(), path.clone());
        } else if let Some(name) = stem.strip_suffix("-back") {
            backs.insert(name.to_string(), path.clone());
        }
    }

    let mut sheets = Vec::with_capacity(fronts.len());
    for (name, front) in fronts {
        match backs.remove(&name) {
            Some(back) => sheets.push((name, SheetImages::from_paths(front, back))),
            None => warn!(sheet = %name, "Front image has no matching back, skipping"),
        }
    }
    for name in backs.keys() {
        warn!(sheet = %name, "Back image has no matching front, skipping");
    }
    Ok(sheets)
}

/// Turns scanned sheets into castability decisions using a page pool.
pub struct SheetInterpreter {
    pool: PagePool,
}

impl SheetInterpreter {
    pub fn new(pool: PagePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    /// Interpret both sides concurrently.
    ///
    /// Fails if either page job fails; the error names the side. When both
    /// fail the front is reported.
    #[instrument(level = "debug", skip(self, sheet), fields(front = %sheet.front.path.display()))]
    pub async fn interpret(
        &self,
        sheet: SheetImages,
    ) -> std::result::Result<SheetInterpretation, SheetError> {
        let front = self.pool.submit(sheet.front);
        let back = self.pool.submit(sheet.back);
        let (front, back) = futures::join!(front, back);

        let front = front.map_err(|source| SheetError::Page {
            side: SheetSide::Front,
            source,
        })?;
        let back = back.map_err(|source| SheetError::Page {
            side: SheetSide::Back,
            source,
        })?;

        let castability = decide(&front, &back);
        debug!(%castability, "Sheet interpreted");
        Ok(SheetInterpretation {
            front,
            back,
            castability,
        })
    }

    /// Blocking form of [`Self::interpret`].
    pub fn interpret_blocking(
        &self,
        sheet: SheetImages,
    ) -> std::result::Result<SheetInterpretation, SheetError> {
        crate::worker::wait_blocking(self.interpret(sheet))
    }

    /// Interpret many sheets, keeping every page job in the pool's queue at
    /// once. Results are in input order.
    pub async fn interpret_batch(
        &self,
        sheets: Vec<SheetImages>,
    ) -> Vec<std::result::Result<SheetInterpretation, SheetError>> {
        info!(sheets = sheets.len(), workers = self.pool.size(), "Interpreting batch");
        let pending = sheets.into_iter().map(|sheet| self.interpret(sheet));
        futures::future::join_all(pending).await
    }

    pub fn stats(&self) -> WorkerPoolStats {
        self.pool.stats()
    }

    pub fn shutdown(&self) -> ShutdownHandle {
        self.pool.shutdown()
    }
}
