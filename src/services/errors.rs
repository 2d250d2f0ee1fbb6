use thiserror::Error;

/// Spec section 9's redesign flag: "exceptions for retry control → explicit
/// variants". The worker's "throw to request a retry" pattern becomes this
/// result type instead; the queue adapter maps `Outcome::Retry` to its
/// backoff schedule and `Outcome::Fatal` to a terminal ledger write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Retry,
    Throttled,
    Failed,
    Fatal,
}

/// The six-row error taxonomy from spec section 7.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    #[error("throttled: {0}")]
    Throttle(String),

    #[error("permanent recipient error: {0}")]
    PermanentRecipient(String),

    #[error("config missing: {0}")]
    ConfigMissing(String),

    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    #[error("locally throttled: {0}")]
    ThrottleHint(String),
}

impl DeliveryError {
    /// Whether a 550/553-style permanent recipient failure bypasses the
    /// attempt cap immediately, per the `PERMANENT_RECIPIENT_BYPASSES_ATTEMPTS`
    /// config knob (spec section 7 / section 9 open question; resolved in
    /// DESIGN.md).
    pub fn classify(&self, permanent_bypasses_attempts: bool) -> Outcome {
        match self {
            DeliveryError::TransientTransport(_) => Outcome::Retry,
            DeliveryError::Throttle(_) => Outcome::Throttled,
            DeliveryError::PermanentRecipient(_) => {
                if permanent_bypasses_attempts {
                    Outcome::Fatal
                } else {
                    Outcome::Retry
                }
            }
            DeliveryError::ConfigMissing(_) => Outcome::Retry,
            DeliveryError::DataIntegrity(_) => Outcome::Fatal,
            DeliveryError::ThrottleHint(_) => Outcome::Throttled,
        }
    }

    /// Classifies a raw SMTP failure (status code + body text) into the
    /// taxonomy, per spec sections 4.2 and 7.
    pub fn from_smtp(code: Option<u16>, body: &str) -> Self {
        let lower = body.to_ascii_lowercase();
        let throttle_phrase = ["rate limit", "throttl", "too many", "blocked", "limit exceeded", "try again later"]
            .iter()
            .any(|p| lower.contains(p));
        let throttle_code = matches!(code, Some(421) | Some(450) | Some(451) | Some(452) | Some(429));

        if throttle_code || throttle_phrase {
            return DeliveryError::Throttle(format!("{}: {}", code.map(|c| c.to_string()).unwrap_or_default(), body));
        }
        match code {
            Some(550) | Some(553) => DeliveryError::PermanentRecipient(format!("{code:?}: {body}")),
            Some(c) if (400..500).contains(&c) => DeliveryError::TransientTransport(format!("{c}: {body}")),
            _ => DeliveryError::TransientTransport(body.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_throttle_codes() {
        for code in [421, 450, 451, 452, 429] {
            assert!(matches!(DeliveryError::from_smtp(Some(code), "x"), DeliveryError::Throttle(_)));
        }
    }

    #[test]
    fn classifies_throttle_phrases_case_insensitively() {
        assert!(matches!(
            DeliveryError::from_smtp(Some(250), "Please Try Again Later"),
            DeliveryError::Throttle(_)
        ));
    }

    #[test]
    fn classifies_permanent_bounce() {
        assert!(matches!(
            DeliveryError::from_smtp(Some(550), "no such user"),
            DeliveryError::PermanentRecipient(_)
        ));
    }

    #[test]
    fn permanent_bypasses_attempts_when_configured() {
        let e = DeliveryError::PermanentRecipient("550".into());
        assert_eq!(e.classify(true), Outcome::Fatal);
        assert_eq!(e.classify(false), Outcome::Retry);
    }
}
