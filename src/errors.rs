// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Common `Error` and `Result` types used throughout the library and application. Serves as a reference for all that can go wrong.
use crate::config::ConfigError;
use crate::ingest::PipelineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] ConfigError),

    #[error("ingestion failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("{0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, Error>;
