pub mod color;
pub mod equivalence;
pub mod filename;
pub mod synonyms;
