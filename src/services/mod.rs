//! Clients of the systems the gateway depends on.

pub mod blob_store;
