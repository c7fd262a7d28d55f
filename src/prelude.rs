//! Prelude module for convenient imports.
//!
//! ```
//! use kinder_client::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`ApiClient`] - The executor and its configuration
//! - [`QueryEndpoint`], [`MutationEndpoint`], [`RequestSpec`], [`Tag`] - Endpoint declarations
//! - [`QueryResult`], [`MutationResult`] - What subscribers observe
//! - [`ApiError`] - The error every operation resolves with

pub use crate::client::{
    ApiClient, MutationResult, MutationState, QueryResult, QueryState, QueryStream,
};
pub use crate::config::{ClientConfig, QueryConfig};
pub use crate::endpoint::{Method, MutationEndpoint, QueryEndpoint, RequestSpec, Tag};
pub use crate::error::ApiError;
pub use crate::session::{CredentialPair, SessionEvent};
