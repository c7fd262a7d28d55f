//! # kinder-client
//!
//! Typed client for the kindergarten suggestion API: a query cache keyed by
//! endpoint and parameters, invalidated by tags, in front of a transport that
//! refreshes expired credentials once and replays the failed request.
//!
//! ## Architecture
//!
//! Requests flow top to bottom:
//!
//! 1. **Executor** ([`ApiClient`]): de-duplicates fetches, feeds the cache,
//!    purges tags after mutations
//! 2. **Cache** ([`cache::Cache`]): one watch channel per entry, with provider tags
//! 3. **Reauth** ([`reauth::ReauthPolicy`]): attaches credentials, one shared
//!    refresh per expiry, exactly one replay
//! 4. **Transport** ([`transport::Transport`]): a single HTTP exchange
//!
//! Credentials live in the [`session::TokenStore`], optionally mirrored into a
//! [`persist::StateStore`] so a session survives restarts.
//!
//! ## Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use kinder_client::kindergarten::endpoints;
//! use kinder_client::kindergarten::models::{LoginRequest, SchoolId};
//! use kinder_client::{ApiClient, ClientConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ApiClient::builder()
//!     .config(ClientConfig::from_env()?)
//!     .build()?;
//!
//! client
//!     .mutate(&endpoints::login(), LoginRequest::new("kim", "secret"))
//!     .await?;
//!
//! // Publishing school 42 refetches every subscribed query tagged `School:42`.
//! let mut school = client.query(&endpoints::school(), SchoolId(42));
//! client.mutate(&endpoints::publish_school(), SchoolId(42)).await?;
//! while let Some(result) = school.next().await {
//!     println!("{:?}", result.data().map(|school| school.status));
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod kindergarten;
pub mod persist;
pub mod prelude;
pub mod reauth;
pub mod session;
pub mod transport;

pub use crate::client::{ApiClient, ApiClientBuilder};
pub use crate::config::{ClientConfig, QueryConfig};
pub use crate::error::ApiError;
