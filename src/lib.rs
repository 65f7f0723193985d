//! An Envoy xDS control-plane library: an in-memory snapshot cache with
//! watch-based long-polling, plus the gRPC discovery services that stream
//! state-of-the-world configuration to connected proxies.

pub mod cache;
pub mod service;
pub mod snapshot;
