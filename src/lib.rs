pub mod cli;
pub mod config;
pub mod database_ops;
pub mod error;
pub mod logging;
pub mod normalization;

pub mod util {
    pub mod env;
    pub mod retry;
}

pub use database_ops::image_index::{ImageIndex, ImageRecord, UnparsedImage};
pub use database_ops::resolver::{CatalogVariant, MatchResult, MatchTier, Resolver, ResolverConfig};
pub use error::{ReconcileError, StoreError};
pub use normalization::equivalence::{ColorMatcher, MatchReason};
pub use normalization::filename::{FilenameParser, ParseConfidence, ParseFailure};
pub use normalization::synonyms::SynonymTable;
