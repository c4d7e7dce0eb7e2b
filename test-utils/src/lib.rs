//! Shared test utilities for service-common.
//!
//! This crate provides:
//! - Test doubles for the token validator, HTTP transport and interceptors
//! - Proptest generators for policies, scopes and caller keys
//! - Fixtures with sample validations and retry policies

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod mocks;

pub use generators::*;
