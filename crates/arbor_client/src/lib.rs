//! Client-side transaction proxy core for the Arbor tree store.
//!
//! This crate provides the per-shard transaction proxy used by the datastore
//! front end. The API surface is intentionally small: a parent history
//! supplies the connection seam through [`proxy::ProxyParent`], constructs
//! proxies, and drives transactions through [`proxy::ProxyTransaction`].

pub mod proxy;
