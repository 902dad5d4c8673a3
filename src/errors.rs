//! Error types shared by every component of the engine.
//!
//! Independent failures found while processing a batch (several bad rules,
//! several malformed instance records) are collected and surfaced together
//! as a [`MultiError`] instead of stopping at the first one.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FwError {
    #[error("{0}")]
    Validation(String),

    #[error("unknown {kind} \"{id}\"")]
    NotFound { kind: &'static str, id: String },

    #[error("{0}")]
    InvalidRequest(String),

    #[error("store I/O error on {}: {source}", path.display())]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed store entry {}: {source}", path.display())]
    StoreFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("filter control failed for instance \"{instance}\": {message}")]
    ExternalTool { instance: String, message: String },

    #[error(transparent)]
    Multi(MultiError),
}

impl FwError {
    pub fn validation(msg: impl Into<String>) -> Self {
        FwError::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        FwError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn store_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FwError::StoreIo {
            path: path.into(),
            source,
        }
    }

    /// Collapses a list of errors into one value. A single error is returned
    /// as-is; several are wrapped in [`FwError::Multi`]. Nested aggregates are
    /// flattened.
    pub fn from_many(mut errs: Vec<FwError>) -> Self {
        match errs.len() {
            0 => FwError::validation("unknown error"),
            1 => errs.remove(0),
            _ => {
                let flat = errs.into_iter().flat_map(FwError::into_errors).collect();
                FwError::Multi(MultiError { errors: flat })
            }
        }
    }

    /// Returns `Ok(())` for an empty list, otherwise the aggregate error.
    pub fn check(errs: Vec<FwError>) -> Result<(), FwError> {
        if errs.is_empty() {
            Ok(())
        } else {
            Err(FwError::from_many(errs))
        }
    }

    /// The flat list of underlying errors (one element for a plain error).
    pub fn errors(&self) -> Vec<&FwError> {
        match self {
            FwError::Multi(multi) => multi.errors.iter().collect(),
            other => vec![other],
        }
    }

    fn into_errors(self) -> Vec<FwError> {
        match self {
            FwError::Multi(multi) => multi.errors,
            other => vec![other],
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FwError::NotFound { .. })
    }
}

/// Several independent errors found in one batch.
#[derive(Debug)]
pub struct MultiError {
    errors: Vec<FwError>,
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: ", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

pub type Result<T, E = FwError> = std::result::Result<T, E>;
