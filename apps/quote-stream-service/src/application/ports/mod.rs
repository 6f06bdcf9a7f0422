//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `QuoteSource`: Supplies the ordered quote texts the catalog is built from
//!
//! The transport that drives the delivery engine is an inbound adapter in
//! `infrastructure::transport` and needs no port of its own.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Quote texts bundled with the service.
const BUNDLED_QUOTES: &str = include_str!("../../../data/zippyisms.txt");

/// Errors raised while reading seed data.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The backing file could not be read.
    #[error("failed to read quote file {path}: {source}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Supplies the ordered seed data for the quote catalog.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Load all quote texts in catalog order.
    async fn load(&self) -> Result<Vec<String>, SourceError>;

    /// Short description of where the quotes come from, for logging.
    fn describe(&self) -> String;
}

// =============================================================================
// File Source
// =============================================================================

/// Reads quotes from a UTF-8 text file, one quote per line.
///
/// Trailing whitespace is trimmed and blank lines are skipped.
#[derive(Debug, Clone)]
pub struct FileQuoteSource {
    path: PathBuf,
}

impl FileQuoteSource {
    /// Create a source backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl QuoteSource for FileQuoteSource {
    async fn load(&self) -> Result<Vec<String>, SourceError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })?;

        Ok(parse_lines(&contents))
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

// =============================================================================
// Static Source
// =============================================================================

/// In-memory quote list.
#[derive(Debug, Clone, Default)]
pub struct StaticQuoteSource {
    quotes: Vec<String>,
}

impl StaticQuoteSource {
    /// Create a source from an ordered list of quotes.
    #[must_use]
    pub const fn new(quotes: Vec<String>) -> Self {
        Self { quotes }
    }

    /// The Zippy th' Pinhead quotes bundled with the service.
    #[must_use]
    pub fn zippy() -> Self {
        Self::new(parse_lines(BUNDLED_QUOTES))
    }
}

#[async_trait]
impl QuoteSource for StaticQuoteSource {
    async fn load(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.quotes.clone())
    }

    fn describe(&self) -> String {
        format!("static:{}", self.quotes.len())
    }
}

fn parse_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
