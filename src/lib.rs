//! Arbiter - Admission Control Decision Engine
//!
//! This crate decides, per incoming request, whether to allow, deny or
//! challenge it. Rules (rate limits, IP filters and pluggable detectors) are
//! evaluated locally against a TTL counter store, and the verdict can be
//! reconciled with a remote decision service over gRPC.

pub mod config;
pub mod decision;
pub mod error;
pub mod grpc;
pub mod ratelimit;
