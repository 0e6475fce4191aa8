// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Data model shared by the network-boot test engine and its callers.
//!
//! Everything here is plain serde data: the persisted shape of a provisioned
//! environment, the declarative scenario a run executes, and the verdicts a
//! run produces.

#![forbid(unsafe_code)]

mod infra;
mod result;
mod scenario;
pub mod serde_helpers;

pub use infra::*;
pub use result::*;
pub use scenario::*;
