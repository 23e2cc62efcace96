//! Integration tests for meshstore
//!
//! Drives sync channels end to end against the in-process authority:
//! reconciliation, storage planning, chunk reconstruction and sibling
//! convergence.

mod integration;
