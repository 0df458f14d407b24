// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reading classification.
//!
//! Maps a decoded `value` onto the table family it belongs to. Only
//! integers and reals are stored; everything else is rejected.

use crate::codec::ReadingValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Destination table family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Integer,
    Real,
}

impl TableKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Integer => "INT",
            Self::Real => "FLOAT",
        }
    }
}

/// A reading accepted for storage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TypedValue {
    Integer(i64),
    Real(f64),
}

impl TypedValue {
    /// Table family this value is routed to.
    pub fn table(self) -> TableKind {
        match self {
            Self::Integer(_) => TableKind::Integer,
            Self::Real(_) => TableKind::Real,
        }
    }
}

impl std::fmt::Display for TypedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{}", v),
            Self::Real(v) => write!(f, "{}", v),
        }
    }
}

/// The value has a shape no table accepts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported data type: {type_name}")]
pub struct ClassificationMismatch {
    pub type_name: &'static str,
}

/// Classify a decoded value.
///
/// Classification follows the JSON source type, never the numeric value:
/// `true` is not an integer and `3.0` is not an integer either.
pub fn classify(value: &ReadingValue) -> Result<TypedValue, ClassificationMismatch> {
    match value {
        ReadingValue::Integer(v) => Ok(TypedValue::Integer(*v)),
        ReadingValue::Real(v) => Ok(TypedValue::Real(*v)),
        other => Err(ClassificationMismatch {
            type_name: other.type_name(),
        }),
    }
}
