pub mod audit;
pub mod db;
pub mod image_index;
pub mod index_builder;
pub mod index_store;
pub mod listing;
pub mod resolver;
