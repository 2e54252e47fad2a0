// Auto recovery
//
// A periodic health pass computes five metrics against fixed thresholds.
// Warnings are only logged; any critical metric enqueues a priority-1
// deferred sync request of the matching kind, and mempool recovery also
// purges transactions older than two hours. Every intervention is recorded
// in the recovery log.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;

use stratos_common::time::{get_current_time_in_millis, TimestampMillis};

use crate::{
    config::{
        CONNECTIVITY_CRITICAL_RATIO, CONNECTIVITY_WARNING_RATIO, FAILED_EVENTS_CRITICAL,
        HEIGHT_DELTA_CRITICAL, HEIGHT_DELTA_WARNING, MEMPOOL_OLD_TX_SECS, MEMPOOL_WARNING_RATIO,
        OLD_TX_ESCALATION_COUNT, PENDING_EVENTS_CRITICAL, PENDING_EVENTS_WARNING,
    },
    core::{blockchain::Blockchain, error::BlockchainError, storage::Storage},
    p2p::rate_limiter::{RateLimiter, SyncKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricStatus {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthMetric {
    HeightDelta,
    TransactionDelta,
    MempoolPressure,
    ConnectivityRatio,
    EventBacklog,
}

/// One recovery-log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEntry {
    pub node_id: String,
    pub metric: HealthMetric,
    pub actions: Vec<String>,
    pub started_at: TimestampMillis,
    pub completed_at: TimestampMillis,
    pub success: bool,
}

/// Inputs of one health pass, gathered by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryMetrics {
    pub local_height: u64,
    pub network_height: u64,
    pub local_tx_count: u64,
    pub network_tx_count: u64,
    pub mempool_size: usize,
    pub old_tx_count: usize,
    pub connectivity_ratio: f64,
    pub pending_events: u64,
    pub failed_events: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricReading {
    pub metric: HealthMetric,
    pub status: MetricStatus,
    pub value: f64,
}

/// Pure threshold evaluation so the table can be asserted in tests.
pub fn evaluate(metrics: &RecoveryMetrics, mempool_max: usize) -> Vec<MetricReading> {
    let mut readings = Vec::with_capacity(5);

    let height_delta = metrics.network_height.saturating_sub(metrics.local_height);
    readings.push(MetricReading {
        metric: HealthMetric::HeightDelta,
        status: if height_delta >= HEIGHT_DELTA_CRITICAL {
            MetricStatus::Critical
        } else if height_delta >= HEIGHT_DELTA_WARNING {
            MetricStatus::Warning
        } else {
            MetricStatus::Ok
        },
        value: height_delta as f64,
    });

    let tx_delta = metrics
        .network_tx_count
        .saturating_sub(metrics.local_tx_count);
    let tx_warning = (mempool_max as u64 * 5 / 100).max(10);
    let tx_critical = (mempool_max as u64 * 15 / 100).max(50);
    readings.push(MetricReading {
        metric: HealthMetric::TransactionDelta,
        status: if tx_delta >= tx_critical {
            MetricStatus::Critical
        } else if tx_delta >= tx_warning {
            MetricStatus::Warning
        } else {
            MetricStatus::Ok
        },
        value: tx_delta as f64,
    });

    let mempool_warning = (mempool_max as f64 * MEMPOOL_WARNING_RATIO) as usize;
    let mut mempool_status = if metrics.mempool_size >= mempool_max {
        MetricStatus::Critical
    } else if metrics.mempool_size >= mempool_warning {
        MetricStatus::Warning
    } else {
        MetricStatus::Ok
    };
    // a backlog of stale transactions escalates the pressure reading
    if metrics.old_tx_count > OLD_TX_ESCALATION_COUNT && mempool_status == MetricStatus::Warning {
        mempool_status = MetricStatus::Critical;
    }
    readings.push(MetricReading {
        metric: HealthMetric::MempoolPressure,
        status: mempool_status,
        value: metrics.mempool_size as f64,
    });

    readings.push(MetricReading {
        metric: HealthMetric::ConnectivityRatio,
        status: if metrics.connectivity_ratio < CONNECTIVITY_CRITICAL_RATIO {
            MetricStatus::Critical
        } else if metrics.connectivity_ratio < CONNECTIVITY_WARNING_RATIO {
            MetricStatus::Warning
        } else {
            MetricStatus::Ok
        },
        value: metrics.connectivity_ratio,
    });

    readings.push(MetricReading {
        metric: HealthMetric::EventBacklog,
        status: if metrics.pending_events > PENDING_EVENTS_CRITICAL
            || metrics.failed_events > FAILED_EVENTS_CRITICAL
        {
            MetricStatus::Critical
        } else if metrics.pending_events > PENDING_EVENTS_WARNING {
            MetricStatus::Warning
        } else {
            MetricStatus::Ok
        },
        value: metrics.pending_events as f64,
    });

    readings
}

fn sync_kind_for(metric: HealthMetric) -> SyncKind {
    match metric {
        HealthMetric::HeightDelta => SyncKind::BlockSync,
        HealthMetric::TransactionDelta => SyncKind::TxSync,
        HealthMetric::MempoolPressure => SyncKind::MempoolSync,
        // re-bootstrapping connectivity means a full resync pass
        HealthMetric::ConnectivityRatio => SyncKind::FullSync,
        HealthMetric::EventBacklog => SyncKind::TxSync,
    }
}

pub struct AutoRecovery<S: Storage> {
    node_id: String,
    mempool_max: usize,
    limiter: Arc<RateLimiter<S>>,
    storage: Arc<RwLock<S>>,
}

impl<S: Storage> AutoRecovery<S> {
    pub fn new(
        node_id: String,
        mempool_max: usize,
        limiter: Arc<RateLimiter<S>>,
        storage: Arc<RwLock<S>>,
    ) -> Self {
        AutoRecovery {
            node_id,
            mempool_max,
            limiter,
            storage,
        }
    }

    /// Run one health pass: log warnings, escalate criticals to priority-1
    /// deferred sync requests, and record interventions. Returns the kinds
    /// escalated.
    pub async fn run_check(
        &self,
        metrics: RecoveryMetrics,
        chain: &Blockchain<S>,
    ) -> Result<Vec<SyncKind>, BlockchainError> {
        let readings = evaluate(&metrics, self.mempool_max);
        let mut triggered = Vec::new();

        for reading in readings {
            match reading.status {
                MetricStatus::Ok => continue,
                MetricStatus::Warning => {
                    warn!(
                        "health metric {:?} in warning state (value {})",
                        reading.metric, reading.value
                    );
                    continue;
                }
                MetricStatus::Critical => {}
            }

            let started_at = get_current_time_in_millis();
            let kind = sync_kind_for(reading.metric);
            let mut actions = vec![format!("enqueue_{}", kind)];

            self.limiter
                .enqueue(
                    kind,
                    json!({
                        "metric": reading.metric,
                        "value": reading.value,
                        "local_height": metrics.local_height,
                        "network_height": metrics.network_height,
                    }),
                    None,
                    1,
                    0,
                )
                .await?;

            if reading.metric == HealthMetric::MempoolPressure {
                let cutoff =
                    get_current_time_in_millis().saturating_sub(MEMPOOL_OLD_TX_SECS * 1000);
                let purged = chain.purge_old_mempool(cutoff).await;
                actions.push(format!("purged_{}_old_txs", purged));
            }

            info!(
                "critical {:?} (value {}): escalated {} sync",
                reading.metric, reading.value, kind
            );
            let entry = RecoveryEntry {
                node_id: self.node_id.clone(),
                metric: reading.metric,
                actions,
                started_at,
                completed_at: get_current_time_in_millis(),
                success: true,
            };
            self.storage
                .write()
                .await
                .append_recovery_entry(&entry)
                .await?;
            triggered.push(kind);
        }
        Ok(triggered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_metrics() -> RecoveryMetrics {
        RecoveryMetrics {
            connectivity_ratio: 1.0,
            ..RecoveryMetrics::default()
        }
    }

    fn status_of(readings: &[MetricReading], metric: HealthMetric) -> MetricStatus {
        readings
            .iter()
            .find(|reading| reading.metric == metric)
            .unwrap()
            .status
    }

    #[test]
    fn test_height_delta_thresholds() {
        for (delta, expected) in [
            (0, MetricStatus::Ok),
            (9, MetricStatus::Ok),
            (10, MetricStatus::Warning),
            (49, MetricStatus::Warning),
            (50, MetricStatus::Critical),
        ] {
            let metrics = RecoveryMetrics {
                network_height: delta,
                ..base_metrics()
            };
            assert_eq!(
                status_of(&evaluate(&metrics, 1000), HealthMetric::HeightDelta),
                expected,
                "delta {}",
                delta
            );
        }
    }

    #[test]
    fn test_transaction_delta_scales_with_mempool_max() {
        // max=1000: warn at max(10, 50)=50, crit at max(50, 150)=150
        let warning = RecoveryMetrics {
            network_tx_count: 50,
            ..base_metrics()
        };
        assert_eq!(
            status_of(&evaluate(&warning, 1000), HealthMetric::TransactionDelta),
            MetricStatus::Warning
        );
        let critical = RecoveryMetrics {
            network_tx_count: 150,
            ..base_metrics()
        };
        assert_eq!(
            status_of(&evaluate(&critical, 1000), HealthMetric::TransactionDelta),
            MetricStatus::Critical
        );
        // tiny pool falls back to the absolute floors
        let floor = RecoveryMetrics {
            network_tx_count: 10,
            ..base_metrics()
        };
        assert_eq!(
            status_of(&evaluate(&floor, 20), HealthMetric::TransactionDelta),
            MetricStatus::Warning
        );
    }

    #[test]
    fn test_mempool_pressure_and_old_tx_escalation() {
        let warning = RecoveryMetrics {
            mempool_size: 800,
            ..base_metrics()
        };
        assert_eq!(
            status_of(&evaluate(&warning, 1000), HealthMetric::MempoolPressure),
            MetricStatus::Warning
        );

        let full = RecoveryMetrics {
            mempool_size: 1000,
            ..base_metrics()
        };
        assert_eq!(
            status_of(&evaluate(&full, 1000), HealthMetric::MempoolPressure),
            MetricStatus::Critical
        );

        // stale backlog escalates a warning to critical
        let stale = RecoveryMetrics {
            mempool_size: 800,
            old_tx_count: 11,
            ..base_metrics()
        };
        assert_eq!(
            status_of(&evaluate(&stale, 1000), HealthMetric::MempoolPressure),
            MetricStatus::Critical
        );
    }

    #[test]
    fn test_connectivity_thresholds() {
        for (ratio, expected) in [
            (1.0, MetricStatus::Ok),
            (0.5, MetricStatus::Ok),
            (0.49, MetricStatus::Warning),
            (0.25, MetricStatus::Warning),
            (0.24, MetricStatus::Critical),
        ] {
            let metrics = RecoveryMetrics {
                connectivity_ratio: ratio,
                ..base_metrics()
            };
            assert_eq!(
                status_of(&evaluate(&metrics, 1000), HealthMetric::ConnectivityRatio),
                expected,
                "ratio {}",
                ratio
            );
        }
    }

    #[test]
    fn test_event_backlog_thresholds() {
        let warning = RecoveryMetrics {
            pending_events: 101,
            ..base_metrics()
        };
        assert_eq!(
            status_of(&evaluate(&warning, 1000), HealthMetric::EventBacklog),
            MetricStatus::Warning
        );
        let critical = RecoveryMetrics {
            pending_events: 501,
            ..base_metrics()
        };
        assert_eq!(
            status_of(&evaluate(&critical, 1000), HealthMetric::EventBacklog),
            MetricStatus::Critical
        );
        let failed = RecoveryMetrics {
            failed_events: 51,
            ..base_metrics()
        };
        assert_eq!(
            status_of(&evaluate(&failed, 1000), HealthMetric::EventBacklog),
            MetricStatus::Critical
        );
    }
}
