// SPDX-License-Identifier: Apache-2.0

//! Log file discovery and tailing.
//!
//! A [`Supervisor`] runs one [`discoverer::Discoverer`] per [`PatternGroup`].
//! Discoverers spawn a [`tailer::Tailer`] per file identity; Tailers push
//! line [`Event`]s onto one bounded queue owned by the caller. The caller
//! acknowledges delivered events through [`Supervisor::acknowledger`], and
//! only acknowledged offsets are recorded in the [`Registry`] and persisted.
//! Delivery is at-least-once across crashes.

pub mod config;
pub mod discoverer;
pub mod error;
pub mod event;
pub mod input;
pub mod offset_committer;
pub mod registry;
pub mod supervisor;
pub mod tailer;

pub use config::{CrawlerConfig, PartialLinePolicy, PatternGroup};
pub use error::{Error, Result};
pub use event::{Acknowledgement, Event, FailureKind, FailureReport};
pub use input::{FileId, Fingerprint};
pub use registry::{FileState, Registry};
pub use supervisor::{LifecycleState, Supervisor};
