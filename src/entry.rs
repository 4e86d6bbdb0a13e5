//! Built-in interpretation entry points.
//!
//! The replay entry point stands in for a computer-vision interpreter: it
//! returns the interpretation recorded in a JSON sidecar next to the image,
//! `<image>.interpretation.json`.

use crate::interpretation::{ImageDescriptor, PageInterpretation};
use crate::worker::EntryPoint;
use anyhow::{Context, bail};
use clap::ValueEnum;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Suffix appended to an image path to find its recorded interpretation.
pub const SIDECAR_SUFFIX: &str = ".interpretation.json";

/// Entry points the `worker` subcommand can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EntryName {
    /// Replay recorded interpretations from sidecar files.
    Replay,
}

impl EntryName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replay => "replay",
        }
    }
}

/// Path of the sidecar recording for `image`.
pub fn sidecar_path(image: &Path) -> PathBuf {
    let mut path = OsString::from(image.as_os_str());
    path.push(SIDECAR_SUFFIX);
    PathBuf::from(path)
}

/// Interpret one page by replaying its recording.
///
/// A page with no recording is unreadable. A descriptor naming an image that
/// does not exist, with no bytes attached, is an error.
pub fn interpret_replay(image: &ImageDescriptor) -> anyhow::Result<PageInterpretation> {
    let sidecar = sidecar_path(&image.path);
    if sidecar.is_file() {
        let raw = std::fs::read_to_string(&sidecar)
            .with_context(|| format!("Failed to read {}", sidecar.display()))?;
        let page = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid recorded interpretation in {}", sidecar.display()))?;
        debug!(image = %image.path.display(), "Replayed recorded interpretation");
        return Ok(page);
    }

    match &image.data {
        Some(data) if data.is_empty() => Ok(PageInterpretation::unreadable("empty image data")),
        Some(_) => Ok(PageInterpretation::unreadable("no recorded interpretation")),
        None if image.path.exists() => {
            Ok(PageInterpretation::unreadable("no recorded interpretation"))
        }
        None => bail!("Image not found: {}", image.path.display()),
    }
}

/// [`EntryPoint`] wrapper around [`interpret_replay`].
#[derive(Debug, Default)]
pub struct ReplayEntryPoint {
    pages: u64,
}

impl EntryPoint for ReplayEntryPoint {
    type Input = ImageDescriptor;
    type Output = PageInterpretation;

    fn call(&mut self, input: ImageDescriptor) -> anyhow::Result<PageInterpretation> {
        self.pages += 1;
        debug!(page = self.pages, image = %input.path.display(), "Interpreting page");
        interpret_replay(&input)
    }
}
