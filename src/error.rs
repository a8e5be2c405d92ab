// Copyright the vpn-broker contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use reqwest::StatusCode;

/// An error returned by the panel API.
#[derive(Debug, Clone, thiserror::Error)]
#[error("panel API error: {status_code}: {message}")]
pub struct ApiError {
    /// The HTTP status code of the response.
    pub status_code: StatusCode,
    /// The error message reported by the panel, if any.
    pub message: String,
}

/// An upstream resource the broker cannot currently allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// A selectable server.
    Server,
    /// A server group on the panel.
    Squad,
    /// The squad trial users are placed in.
    TrialSquad,
}

impl Resource {
    fn as_str(&self) -> &'static str {
        match self {
            Resource::Server => "server",
            Resource::Squad => "squad",
            Resource::TrialSquad => "trial_squad",
        }
    }
}

/// Who an error is for, which determines how callers surface it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The user can fix this themselves (e.g. top up and retry).
    UserRecoverable,
    /// User-visible and terminal for the attempted intent.
    UserVisible,
    /// Transient upstream trouble; the operation may be retried later.
    Transient,
    /// A bug or unexpected state; admins are alerted.
    Internal,
}

/// The closed set of errors the broker produces.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The user's balance does not cover the attempted debit.
    #[error("insufficient funds: {missing_kopeks} kopeks missing")]
    InsufficientFunds {
        /// How many kopeks short the balance is.
        missing_kopeks: i64,
    },
    /// A request carried an invalid field.
    #[error("validation failed for {field}: {reason}")]
    Validation {
        /// The offending field.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// The user already consumed their trial.
    #[error("trial already used")]
    TrialAlreadyUsed,
    /// The user is not eligible for a trial.
    #[error("not eligible for a trial")]
    TrialIneligible,
    /// An upstream resource is unavailable; not retried.
    #[error("resource unavailable: {}", .0.as_str())]
    ResourceUnavailable(Resource),
    /// A completed payment with this external ID already exists.
    ///
    /// Treated as success by the top-up path.
    #[error("duplicate payment: {external_id}")]
    DuplicatePayment {
        /// The provider-assigned payment ID.
        external_id: String,
    },
    /// Price inputs changed between quoting and committing a checkout.
    #[error("order changed between quote and commit")]
    OrderChanged,
    /// The pricing engine produced an inconsistent quote. A bug, not a
    /// user error.
    #[error("pricing inconsistency: expected {expected_kopeks}, computed {computed_kopeks}")]
    PricingInconsistent {
        expected_kopeks: i64,
        computed_kopeks: i64,
    },
    /// A webhook signature failed verification.
    #[error("invalid {provider} webhook signature")]
    InvalidSignature {
        /// The provider whose webhook failed verification.
        provider: &'static str,
    },
    /// The panel rejected a request with a 4xx status.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// An error occurred in the transport to the panel. Retried inside
    /// the adapter; transient when it leaks out.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The panel returned a response with an unexpected shape.
    #[error("unexpected panel response: {detail}")]
    UnexpectedResponse {
        /// Details about the unexpected response.
        detail: String,
    },
    /// A database error.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    /// A serialization error (draft snapshots, event payloads).
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// An I/O error (log rotation, archives).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// An unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a [`Error::Validation`].
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Error {
        Error::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// A stable machine-readable code for each error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InsufficientFunds { .. } => "insufficient_funds",
            Error::Validation { .. } => "validation_failure",
            Error::TrialAlreadyUsed => "trial_already_used",
            Error::TrialIneligible => "trial_ineligible",
            Error::ResourceUnavailable(_) => "resource_unavailable",
            Error::DuplicatePayment { .. } => "duplicate_payment",
            Error::OrderChanged => "order_changed",
            Error::PricingInconsistent { .. } => "pricing_inconsistent",
            Error::InvalidSignature { .. } => "invalid_signature",
            Error::Api(api) => {
                if api.status_code.is_server_error() {
                    "panel_transient"
                } else {
                    "panel_permanent"
                }
            }
            Error::Transport(_) => "panel_transient",
            Error::UnexpectedResponse { .. } => "panel_unexpected",
            Error::Db(_) => "database",
            Error::Serde(_) => "serialization",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
        }
    }

    /// How callers should surface this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InsufficientFunds { .. } | Error::OrderChanged => {
                ErrorCategory::UserRecoverable
            }
            Error::Validation { .. }
            | Error::TrialAlreadyUsed
            | Error::TrialIneligible
            | Error::ResourceUnavailable(_)
            | Error::InvalidSignature { .. } => ErrorCategory::UserVisible,
            Error::DuplicatePayment { .. } => ErrorCategory::UserVisible,
            Error::Transport(_) => ErrorCategory::Transient,
            Error::Api(api) => {
                if api.status_code.is_server_error() {
                    ErrorCategory::Transient
                } else {
                    ErrorCategory::Internal
                }
            }
            Error::UnexpectedResponse { .. }
            | Error::Db(_)
            | Error::Serde(_)
            | Error::Io(_)
            | Error::PricingInconsistent { .. }
            | Error::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether retrying later may succeed without operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            Error::InsufficientFunds { missing_kopeks: 1 }.code(),
            "insufficient_funds"
        );
        assert_eq!(
            Error::ResourceUnavailable(Resource::TrialSquad).code(),
            "resource_unavailable"
        );
    }

    #[test]
    fn insufficient_funds_is_user_recoverable() {
        let err = Error::InsufficientFunds { missing_kopeks: 100 };
        assert_eq!(err.category(), ErrorCategory::UserRecoverable);
        assert!(!err.is_transient());
    }
}
