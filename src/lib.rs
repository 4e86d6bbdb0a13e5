//! ballot-interp - ballot sheet interpretation
//!
//! Interprets scanned ballot pages in a pool of isolated worker processes and
//! decides, for each two-sided sheet, whether it may be cast.
//!
//! - [`codec`]: JSON wire encoding for values crossing the process boundary
//! - [`worker`]: the worker pool and the worker process harness
//! - [`interpretation`]: what a page was interpreted as
//! - [`castability`]: the per-sheet decision
//! - [`sheet`]: front/back orchestration over a pool

pub mod castability;
pub mod codec;
pub mod entry;
pub mod error;
pub mod interpretation;
pub mod logging;
pub mod sheet;
pub mod worker;

pub use castability::{Castability, decide};
pub use error::{InterpError, JobError, Result};
pub use interpretation::{ImageDescriptor, PageInterpretation};
pub use sheet::{SheetInterpretation, SheetInterpreter};
