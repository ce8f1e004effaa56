//! Error types for the shared cache loader.
//!
//! This module provides error handling for every loader subsystem: cache
//! discovery, memory mapping, VM reads, slide info processing, Mach-O
//! parsing, export trie traversal and metadata persistence.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for shared cache loader operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing file '{path}'")]
    FileMissing { path: PathBuf },

    #[error("failed to memory map file '{path}': {source}")]
    MmapFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read of {length:#x} bytes at offset {offset:#x} is outside file '{path}' ({file_length:#x} bytes)")]
    ReadOutOfRange {
        path: PathBuf,
        offset: u64,
        length: u64,
        file_length: u64,
    },

    // ==================== Cache Format Errors ====================
    #[error("invalid magic at {addr:#x}: {magic:#x}")]
    UnknownMagic { addr: u64, magic: u32 },

    #[error("unsupported slide info version {version} at offset {offset:#x}")]
    UnknownSlideInfoVersion { version: u32, offset: u64 },

    // ==================== VM Errors ====================
    #[error("mapping at {address:#x} (size {size:#x}) is not aligned to the {page_size:#x} byte page size")]
    MappingPageAlignment {
        address: u64,
        size: u64,
        page_size: u64,
    },

    #[error("address {addr:#x} is not mapped")]
    MappingRead { addr: u64 },

    // ==================== Mach-O Errors ====================
    #[error("unsupported load command {cmd:#x} at offset {offset:#x}")]
    UnsupportedCommand { cmd: u32, offset: u64 },

    #[error("malformed load command at offset {offset:#x}")]
    LoadCommandOverflow { offset: u64 },

    // ==================== Export Trie Errors ====================
    #[error("malformed export trie node at offset {offset:#x}")]
    TrieRead { offset: u64 },

    #[error("invalid ULEB128 at offset {offset:#x}")]
    InvalidUleb128 { offset: u64 },

    // ==================== Metadata Errors ====================
    #[error("metadata version mismatch: found {found}, expected {expected}")]
    MetadataVersionMismatch { found: u32, expected: u32 },

    #[error("no serialized metadata present")]
    MetadataMissing,

    #[error("metadata (de)serialization failed: {0}")]
    Metadata(#[from] serde_json::Error),

    // ==================== Image Errors ====================
    #[error("image not found: {name}")]
    ImageNotFound { name: String },
}

/// A specialized Result type for shared cache loader operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error indicates a recoverable condition.
    ///
    /// Recoverable errors are logged and skipped: a torn slide chain or a
    /// missing optional sub-cache must not abort the surrounding operation.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MappingRead { .. }
                | Error::ReadOutOfRange { .. }
                | Error::FileMissing { .. }
                | Error::TrieRead { .. }
        )
    }

    /// Creates a file-missing error.
    #[inline]
    pub fn file_missing(path: impl Into<PathBuf>) -> Self {
        Error::FileMissing { path: path.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable() {
        assert!(Error::MappingRead { addr: 0x1000 }.is_recoverable());
        assert!(Error::file_missing("/tmp/nope").is_recoverable());
        assert!(!Error::MetadataMissing.is_recoverable());
        assert!(!Error::UnknownSlideInfoVersion {
            version: 4,
            offset: 0
        }
        .is_recoverable());
    }
}
