use std::path::PathBuf;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

use crate::domain::IdKind;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("missing config file kira-repo.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid generation name: {0}")]
    InvalidGeneration(String),

    #[error("invalid provenance class: {0}")]
    InvalidProvenance(String),

    #[error("identity service request failed: {0}")]
    IdentityHttp(String),

    #[error("identity service returned status {status}: {message}")]
    IdentityStatus { status: u16, message: String },

    #[error("barcode service request failed: {0}")]
    BarcodeHttp(String),

    #[error("barcode service returned status {status}: {message}")]
    BarcodeStatus { status: u16, message: String },

    #[error("index request failed: {0}")]
    IndexHttp(String),

    #[error("index returned status {status}: {message}")]
    IndexStatus { status: u16, message: String },

    #[error("source request failed: {0}")]
    SourceHttp(String),

    #[error("source returned status {status}: {message}")]
    SourceStatus { status: u16, message: String },

    #[error("malformed source payload: {0}")]
    SourceParse(String),

    #[error("notification failed: {0}")]
    Notify(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// An archive could not be read or its payload could not be mapped.
#[derive(Debug, Clone, Error, Serialize)]
#[error("extraction from {source_code} failed: {message}")]
pub struct ExtractionError {
    pub source_code: String,
    pub message: String,
}

/// Linkage of a single donor failed; the record still publishes.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("could not assign {kind} id for submitted id {submitted_id} in project {project_code}: {message}")]
pub struct IdentityAssignmentError {
    pub kind: IdKind,
    pub submitted_id: String,
    pub project_code: String,
    pub message: String,
}

#[derive(Debug, Clone, Error, Serialize)]
#[error("publication policy failed for record {record_id}: {message}")]
pub struct PublicationPolicyError {
    pub record_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Error, Diagnostic, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum PublishError {
    #[error("failed to create generation {generation}: {message}")]
    Create { generation: String, message: String },

    #[error("failed to install schema for {doc_type} on {generation}: {message}")]
    Schema {
        generation: String,
        doc_type: String,
        message: String,
    },

    #[error("failed to build documents for {generation}: {message}")]
    Documents { generation: String, message: String },

    #[error("bulk indexing into {generation} failed: {message}")]
    Bulk { generation: String, message: String },

    #[error("alias {alias} reassignment to {generation} failed: {message}")]
    Alias {
        alias: String,
        generation: String,
        message: String,
    },

    #[error("alias {alias} is held by {holders:?} after reassignment to {generation}")]
    #[diagnostic(help("no rollback is attempted; point the alias at a single generation manually"))]
    AliasInconsistent {
        alias: String,
        generation: String,
        holders: Vec<String>,
    },
}

impl PublishError {
    /// Alias failures leave the public alias in an unknown state.
    pub fn is_alias_failure(&self) -> bool {
        matches!(
            self,
            PublishError::Alias { .. } | PublishError::AliasInconsistent { .. }
        )
    }
}
