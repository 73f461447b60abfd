//! Backend reachability and link quality.

use std::time::Duration;

use chrono::Utc;

use crate::backend::ConsoleBackend;
use crate::config::QualityConfig;
use crate::error::ConsoleError;
use crate::types::{ProbeResult, QualitySample, QualityTier};

/// Map a probe latency onto a quality tier.
pub fn classify(latency: Duration, cfg: &QualityConfig) -> QualityTier {
    let ms = latency.as_millis();
    if ms < u128::from(cfg.excellent_below_ms) {
        QualityTier::Excellent
    } else if ms < u128::from(cfg.good_below_ms) {
        QualityTier::Good
    } else {
        QualityTier::Poor
    }
}

/// Probe the backend and fail with `Unreachable` unless it answered.
/// Rejected credentials pass through as `AuthExpired`.
pub async fn ensure_reachable(backend: &dyn ConsoleBackend) -> Result<ProbeResult, ConsoleError> {
    match backend.probe_availability().await {
        Ok(probe) if probe.reachable => Ok(probe),
        Ok(probe) => Err(ConsoleError::Unreachable {
            message: format!(
                "availability probe answered negatively after {}ms",
                probe.latency.as_millis()
            ),
        }),
        Err(err @ (ConsoleError::Unreachable { .. } | ConsoleError::AuthExpired { .. })) => {
            Err(err)
        }
        Err(other) => Err(ConsoleError::Unreachable {
            message: other.to_string(),
        }),
    }
}

/// Outcome of one probe as seen by the link monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeReading {
    Reachable(QualitySample),
    Unreachable(String),
}

impl std::fmt::Display for ProbeReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reachable(sample) => {
                write!(f, "{} ({}ms)", sample.tier, sample.latency.as_millis())
            }
            Self::Unreachable(detail) => write!(f, "unreachable: {detail}"),
        }
    }
}

/// Tracks the most recent quality sample.
#[derive(Debug, Clone)]
pub struct QualityEstimator {
    cfg: QualityConfig,
    latest: Option<QualitySample>,
}

impl QualityEstimator {
    pub fn new(cfg: QualityConfig) -> Self {
        Self { cfg, latest: None }
    }

    pub fn latest(&self) -> Option<&QualitySample> {
        self.latest.as_ref()
    }

    pub fn record(&mut self, probe: Result<ProbeResult, ConsoleError>) -> ProbeReading {
        match probe {
            Ok(result) if result.reachable => {
                let sample = QualitySample {
                    latency: result.latency,
                    tier: classify(result.latency, &self.cfg),
                    measured_at: Utc::now(),
                };
                self.latest = Some(sample);
                ProbeReading::Reachable(sample)
            }
            Ok(_) => ProbeReading::Unreachable("backend reported unavailable".into()),
            Err(err) => ProbeReading::Unreachable(err.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn tier_boundaries() {
        let cfg = QualityConfig::default();
        assert_eq!(classify(ms(0), &cfg), QualityTier::Excellent);
        assert_eq!(classify(ms(99), &cfg), QualityTier::Excellent);
        assert_eq!(classify(ms(100), &cfg), QualityTier::Good);
        assert_eq!(classify(ms(399), &cfg), QualityTier::Good);
        assert_eq!(classify(ms(400), &cfg), QualityTier::Poor);
        assert_eq!(classify(ms(5_000), &cfg), QualityTier::Poor);
    }

    #[test]
    fn estimator_keeps_last_reachable_sample() {
        let mut est = QualityEstimator::new(QualityConfig::default());
        assert!(est.latest().is_none());

        let reading = est.record(Ok(ProbeResult {
            reachable: true,
            latency: ms(250),
        }));
        match reading {
            ProbeReading::Reachable(sample) => assert_eq!(sample.tier, QualityTier::Good),
            other => panic!("expected reachable, got {other:?}"),
        }

        let reading = est.record(Err(ConsoleError::Unreachable {
            message: "connection refused".into(),
        }));
        assert!(matches!(reading, ProbeReading::Unreachable(_)));
        assert_eq!(est.latest().map(|s| s.latency), Some(ms(250)));
    }

    #[test]
    fn negative_probe_is_unreachable() {
        let mut est = QualityEstimator::new(QualityConfig::default());
        let reading = est.record(Ok(ProbeResult {
            reachable: false,
            latency: ms(3),
        }));
        assert!(matches!(reading, ProbeReading::Unreachable(_)));
    }
}
