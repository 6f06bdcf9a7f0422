//! Quote Catalog
//!
//! Immutable, ordered collection of quotes loaded once at startup.
//!
//! # Design
//!
//! Quote ids are dense indices into the catalog: the quote at position
//! `i` of the seed sequence has id `i`. The catalog is never mutated after
//! construction, so it is shared behind an `Arc` and read without locking.

use serde::{Deserialize, Serialize};

use crate::application::ports::{QuoteSource, SourceError};

// =============================================================================
// Types
// =============================================================================

/// Dense index of a quote in the catalog.
pub type QuoteId = u32;

/// A single quote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Quote {
    /// Position of the quote in the catalog.
    pub id: QuoteId,
    /// Quote text.
    pub text: String,
}

impl Quote {
    /// Create a new quote.
    #[must_use]
    pub fn new(id: QuoteId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Catalog lookup and load errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// Requested id is outside `[0, count)`.
    #[error("quote id {id} out of range (catalog holds {count} quotes)")]
    OutOfRange {
        /// Requested id.
        id: QuoteId,
        /// Number of quotes in the catalog.
        count: usize,
    },

    /// Seed data contained no quotes.
    #[error("quote source produced no quotes")]
    Empty,

    /// Seed data could not be read.
    #[error("failed to load quotes: {0}")]
    Source(String),
}

impl From<SourceError> for CatalogError {
    fn from(err: SourceError) -> Self {
        Self::Source(err.to_string())
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// Read-only, ordered quote storage.
///
/// # Example
///
/// ```rust
/// use quote_stream_service::domain::quote::QuoteCatalog;
///
/// let catalog = QuoteCatalog::from_texts(["Q0", "Q1", "Q2"]);
///
/// assert_eq!(catalog.count(), 3);
/// assert_eq!(catalog.get(1).unwrap().text, "Q1");
/// assert!(catalog.get(3).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct QuoteCatalog {
    quotes: Vec<Quote>,
}

impl QuoteCatalog {
    /// Build a catalog from an ordered sequence of quote texts.
    ///
    /// Ids are assigned in input order starting at zero.
    #[must_use]
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let quotes = texts
            .into_iter()
            .zip(0..)
            .map(|(text, id)| Quote::new(id, text))
            .collect();

        Self { quotes }
    }

    /// Load a catalog from a seed data source.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::Source` if the source cannot be read and
    /// `CatalogError::Empty` if it yields no quotes.
    pub async fn load(source: &dyn QuoteSource) -> Result<Self, CatalogError> {
        let texts = source.load().await?;
        if texts.is_empty() {
            return Err(CatalogError::Empty);
        }

        let catalog = Self::from_texts(texts);
        tracing::info!(
            source = %source.describe(),
            count = catalog.count(),
            "Quote catalog loaded"
        );
        Ok(catalog)
    }

    /// Look up a quote by id.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::OutOfRange` if `id` is not in `[0, count)`.
    pub fn get(&self, id: QuoteId) -> Result<Quote, CatalogError> {
        usize::try_from(id)
            .ok()
            .and_then(|index| self.quotes.get(index))
            .cloned()
            .ok_or(CatalogError::OutOfRange {
                id,
                count: self.quotes.len(),
            })
    }

    /// Total number of quotes.
    #[must_use]
    pub fn count(&self) -> usize {
        self.quotes.len()
    }

    /// Check if the catalog holds no quotes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    /// Iterate quotes in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Quote> {
        self.quotes.iter()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::StaticQuoteSource;

    #[test]
    fn ids_follow_input_order() {
        let catalog = QuoteCatalog::from_texts(["a", "b", "c"]);

        let ids: Vec<QuoteId> = catalog.iter().map(|q| q.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(catalog.get(2).unwrap(), Quote::new(2, "c"));
    }

    #[test]
    fn get_out_of_range() {
        let catalog = QuoteCatalog::from_texts(["a", "b"]);

        let err = catalog.get(2).unwrap_err();
        assert_eq!(err, CatalogError::OutOfRange { id: 2, count: 2 });
    }

    #[test]
    fn get_on_empty_catalog() {
        let catalog = QuoteCatalog::default();

        assert!(catalog.is_empty());
        assert!(matches!(
            catalog.get(0),
            Err(CatalogError::OutOfRange { id: 0, count: 0 })
        ));
    }

    #[test]
    fn count_is_stable() {
        let catalog = QuoteCatalog::from_texts(["a", "b", "c", "d"]);

        assert_eq!(catalog.count(), 4);
        let _ = catalog.get(1);
        let _ = catalog.get(99);
        assert_eq!(catalog.count(), 4);
    }

    #[tokio::test]
    async fn load_from_source() {
        let source = StaticQuoteSource::new(vec!["x".to_string(), "y".to_string()]);

        let catalog = QuoteCatalog::load(&source).await.unwrap();

        assert_eq!(catalog.count(), 2);
        assert_eq!(catalog.get(0).unwrap().text, "x");
    }

    #[tokio::test]
    async fn load_rejects_empty_source() {
        let source = StaticQuoteSource::new(vec![]);

        let err = QuoteCatalog::load(&source).await.unwrap_err();
        assert_eq!(err, CatalogError::Empty);
    }

    #[test]
    fn quote_serializes_with_id_and_text() {
        let json = serde_json::to_value(Quote::new(3, "Yow!")).unwrap();
        assert_eq!(json, serde_json::json!({"id": 3, "text": "Yow!"}));
    }
}
