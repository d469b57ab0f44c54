//! One-time code policy

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::config::LendingConfig;
use crate::error::AppError;
use crate::models::IssuedOtp;

/// Shape, lifetime and retry budget of claim and return codes
#[derive(Debug, Clone)]
pub struct OtpPolicy {
    pub length: usize,
    pub ttl: Duration,
    pub max_attempts: u32,
}

impl OtpPolicy {
    pub fn from_config(config: &LendingConfig) -> Self {
        Self {
            length: config.otp_length.max(1),
            ttl: Duration::minutes(config.otp_ttl_minutes),
            max_attempts: config.otp_max_attempts.max(1),
        }
    }

    /// Random numeric code of `length` digits
    pub fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.length)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect()
    }

    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.ttl
    }

    /// Up to `max_attempts` fresh codes, all expiring `ttl` after `now`.
    /// Callers insert each until one does not collide with a live code.
    pub fn candidates(&self, now: DateTime<Utc>) -> impl Iterator<Item = IssuedOtp> + '_ {
        let expires_at = self.expires_at(now);
        (0..self.max_attempts).map(move |_| IssuedOtp {
            code: self.generate(),
            expires_at,
        })
    }

    pub fn exhausted(&self) -> AppError {
        AppError::OtpGenerationExhausted(self.max_attempts)
    }
}

impl Default for OtpPolicy {
    fn default() -> Self {
        Self::from_config(&LendingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_numeric_with_configured_length() {
        let policy = OtpPolicy::default();
        for _ in 0..50 {
            let code = policy.generate();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn candidates_respect_attempt_budget() {
        let policy = OtpPolicy {
            length: 4,
            ttl: Duration::minutes(5),
            max_attempts: 3,
        };
        let now = Utc::now();
        let candidates: Vec<_> = policy.candidates(now).collect();
        assert_eq!(candidates.len(), 3);
        assert!(candidates.iter().all(|c| c.expires_at == now + Duration::minutes(5)));
        assert!(matches!(policy.exhausted(), AppError::OtpGenerationExhausted(3)));
    }

    #[test]
    fn code_is_live_until_expiry() {
        let policy = OtpPolicy::default();
        let now = Utc::now();
        let otp = policy.candidates(now).next().unwrap();
        assert!(otp.is_live(now));
        assert!(!otp.is_live(otp.expires_at));
    }
}
