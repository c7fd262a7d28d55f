//! Mutation state for callers that render write progress.
//!
//! [`ApiClient::mutate`](super::ApiClient::mutate) resolves once with the
//! result. [`ApiClient::mutate_tracked`](super::ApiClient::mutate_tracked)
//! instead yields `Loading` followed by `Success` or `Error`, which maps
//! directly onto a submit button.

use crate::error::ApiError;

/// The state of a mutation result.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationState<T> {
    /// Mutation is idle (not yet started).
    Idle,
    /// Mutation is in progress.
    Loading,
    /// Mutation succeeded with a result.
    Success(T),
    /// Mutation failed with an error.
    Error(ApiError),
}

/// A mutation result containing the current state.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult<T> {
    /// The current state of the mutation.
    pub state: MutationState<T>,
}

impl<T> MutationResult<T> {
    pub const fn idle() -> Self {
        Self {
            state: MutationState::Idle,
        }
    }

    pub const fn loading() -> Self {
        Self {
            state: MutationState::Loading,
        }
    }

    /// Returns the result data if the mutation succeeded, otherwise `None`.
    pub const fn data(&self) -> Option<&T> {
        match &self.state {
            MutationState::Success(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the error if the mutation failed.
    pub const fn error(&self) -> Option<&ApiError> {
        match &self.state {
            MutationState::Error(error) => Some(error),
            _ => None,
        }
    }

    /// Returns `true` if the mutation is currently loading.
    pub const fn is_loading(&self) -> bool {
        matches!(self.state, MutationState::Loading)
    }

    /// Returns `true` if the mutation succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self.state, MutationState::Success(_))
    }

    /// Returns `true` if the mutation failed.
    pub const fn is_error(&self) -> bool {
        matches!(self.state, MutationState::Error(_))
    }
}

impl<T> Default for MutationResult<T> {
    fn default() -> Self {
        Self::idle()
    }
}

impl<T> From<Result<T, ApiError>> for MutationResult<T> {
    fn from(result: Result<T, ApiError>) -> Self {
        let state = match result {
            Ok(data) => MutationState::Success(data),
            Err(error) => MutationState::Error(error),
        };
        Self { state }
    }
}
