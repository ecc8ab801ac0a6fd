pub mod blob_store;
pub mod navigator;
