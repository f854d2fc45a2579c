//! Core traits and types for the record store.

use serde::{de::DeserializeOwned, Serialize};

/// A named record collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
  Catalog,
  Reviews,
}

impl Collection {
  pub fn as_str(&self) -> &'static str {
    match self {
      Collection::Catalog => "catalog",
      Collection::Reviews => "reviews",
    }
  }

  /// Secondary indexes declared for this collection
  pub fn indexes(&self) -> &'static [&'static str] {
    match self {
      Collection::Catalog => &["neighborhood", "cuisine_type"],
      Collection::Reviews => &["restaurant_id"],
    }
  }
}

/// Trait for records that can live in the store.
///
/// Implementors provide a unique key within their collection and the values
/// for each secondary index the collection declares.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Collection this record type belongs to
  const COLLECTION: Collection;

  /// Primary key, unique within the collection
  fn key(&self) -> String;

  /// `(index name, value)` pairs, one per declared index
  fn index_values(&self) -> Vec<(&'static str, String)>;
}

/// Access mode of a store transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  ReadOnly,
  ReadWrite,
}

/// Identifies a population unit for first-load reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PopulationKey {
  /// The whole catalog
  Catalog,
  /// Reviews belonging to one catalog record
  Reviews(u64),
}

impl PopulationKey {
  pub fn as_key(&self) -> String {
    match self {
      PopulationKey::Catalog => "catalog".to_string(),
      PopulationKey::Reviews(id) => format!("reviews:{}", id),
    }
  }

  pub fn collection(&self) -> Collection {
    match self {
      PopulationKey::Catalog => Collection::Catalog,
      PopulationKey::Reviews(_) => Collection::Reviews,
    }
  }
}
