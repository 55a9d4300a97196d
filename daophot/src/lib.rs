//! Automation of the DAOPHOT and ALLSTAR stellar photometry tools.
//!
//! The tools are interactive Fortran programs that ask one question at a
//! time. This crate answers for the operator:
//!
//! - [`process`] - spawn a tool and exchange text with it under timeouts
//! - [`tools`] - the scripted DAOPHOT and ALLSTAR dialogues as state machines
//! - [`table`] - read and rewrite the `.ap` and `.als` tables they produce
//! - [`validity`] - flag over-subtracted stars in the residual image
//! - [`image`] - image access, FITS files behind the `fits` feature
//! - [`config`] - JSON pipeline configuration
//! - [`pipeline`] - one image through the whole reduction
//!
//! # Features
//!
//! - `fits` - FITS image I/O and the `daophot_run` binary

pub mod config;
pub mod image;
pub mod pipeline;
pub mod process;
pub mod table;
pub mod tools;
pub mod validity;

pub use config::PipelineConfig;
pub use pipeline::{PhotometryPipeline, PipelineError, PipelineReport};
