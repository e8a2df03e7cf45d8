use thiserror::Error;

/// Typed failure of a single provider call, after the client's own retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{provider}: daily request budget exhausted")]
    QuotaExhausted { provider: String },

    #[error("{provider}: request rejected ({status}): {body}")]
    Rejected {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider}: malformed payload: {detail}")]
    Malformed { provider: String, detail: String },

    #[error("{provider}: transient failure after retries: {detail}")]
    Transient { provider: String, detail: String },

    #[error("{provider}: deadline exceeded")]
    Timeout { provider: String },

    #[error("{provider}: no mapping for competition {competition}")]
    UnknownCompetition {
        provider: String,
        competition: String,
    },

    #[error("{provider}: no provider id for team {team_key}")]
    UnknownTeam { provider: String, team_key: String },

    #[error("{provider}: operation not supported")]
    Unsupported { provider: String },
}

impl ProviderError {
    pub fn provider(&self) -> &str {
        match self {
            ProviderError::QuotaExhausted { provider }
            | ProviderError::Rejected { provider, .. }
            | ProviderError::Malformed { provider, .. }
            | ProviderError::Transient { provider, .. }
            | ProviderError::Timeout { provider }
            | ProviderError::UnknownCompetition { provider, .. }
            | ProviderError::UnknownTeam { provider, .. }
            | ProviderError::Unsupported { provider } => provider,
        }
    }

    /// Failures that may clear up on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient { .. }
                | ProviderError::Timeout { .. }
                | ProviderError::QuotaExhausted { .. }
        )
    }

    /// Misconfiguration: logged at error level and surfaced in health.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ProviderError::Rejected { .. })
    }
}

/// The engine refused to produce a record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("no form data for either team of {fixture_key} and neutral priors are disabled")]
    NoFormData { fixture_key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let quota = ProviderError::QuotaExhausted { provider: "p".into() };
        let rejected = ProviderError::Rejected {
            provider: "p".into(),
            status: 403,
            body: "forbidden".into(),
        };
        assert!(quota.is_transient());
        assert!(!rejected.is_transient());
        assert!(rejected.is_rejection());
        assert_eq!(rejected.provider(), "p");
        assert_eq!(
            rejected.to_string(),
            "p: request rejected (403): forbidden"
        );
    }

    #[test]
    fn test_unsupported_is_neither_transient_nor_rejection() {
        let unsupported = ProviderError::Unsupported { provider: "p".into() };
        assert!(!unsupported.is_transient());
        assert!(!unsupported.is_rejection());
        assert_eq!(unsupported.to_string(), "p: operation not supported");
    }
}
