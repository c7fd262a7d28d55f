//! The kindergarten suggestion service: wire types, the endpoint catalog and
//! small formatting helpers.

pub mod endpoints;
pub mod models;
pub mod phone;

/// Name of the persisted slice holding the current-user profile.
pub const PROFILE_SLICE: &str = "user";
