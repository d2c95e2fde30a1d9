//! 可观测性
//!
//! tracing 初始化与全局指标：模型调用次数/延迟/错误率、动作执行、重规划计数。
//! 缓存与记忆分页的计数在各自组件内（stats()），此处只聚合跨组件的调用面。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日志初始化：默认 info，RUST_LOG 可覆盖
pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}

/// 全局指标收集器
#[derive(Debug, Default)]
pub struct Metrics {
    pub model: ModelMetrics,
    pub actions: ActionMetrics,
    pub plan: PlanMetrics,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static Metrics {
        static INSTANCE: OnceLock<Metrics> = OnceLock::new();
        INSTANCE.get_or_init(Metrics::new)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "model": {
                "total_calls": self.model.total_calls.load(Ordering::Relaxed),
                "failed_calls": self.model.failed_calls.load(Ordering::Relaxed),
                "total_latency_ms": self.model.total_latency_ms.load(Ordering::Relaxed),
                "average_latency_ms": self.model.average_latency_ms(),
                "error_rate": self.model.error_rate(),
            },
            "actions": {
                "total_executions": self.actions.total_executions.load(Ordering::Relaxed),
                "failed_executions": self.actions.failed_executions.load(Ordering::Relaxed),
                "total_execution_time_ms": self.actions.total_execution_time_ms.load(Ordering::Relaxed),
            },
            "plan": {
                "replans": self.plan.replans.load(Ordering::Relaxed),
            }
        })
    }
}

/// 模型调用指标
#[derive(Debug, Default)]
pub struct ModelMetrics {
    pub total_calls: AtomicU64,
    pub failed_calls: AtomicU64,
    pub total_latency_ms: AtomicU64,
}

impl ModelMetrics {
    pub fn record_call(&self, success: bool, latency: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn average_latency_ms(&self) -> f64 {
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        let count = self.total_calls.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.total_calls.load(Ordering::Relaxed);
        let failed = self.failed_calls.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        }
    }
}

/// 动作执行指标
#[derive(Debug, Default)]
pub struct ActionMetrics {
    pub total_executions: AtomicU64,
    pub failed_executions: AtomicU64,
    pub total_execution_time_ms: AtomicU64,
}

impl ActionMetrics {
    pub fn record_execution(&self, success: bool, duration: Duration) {
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_executions.fetch_add(1, Ordering::Relaxed);
        }
        self.total_execution_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }
}

/// 规划指标
#[derive(Debug, Default)]
pub struct PlanMetrics {
    pub replans: AtomicU64,
}

impl PlanMetrics {
    pub fn record_replan(&self) {
        self.replans.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_metrics() {
        let metrics = ModelMetrics::default();
        metrics.record_call(true, Duration::from_millis(100));
        metrics.record_call(false, Duration::from_millis(200));

        assert_eq!(metrics.total_calls.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.failed_calls.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.error_rate(), 0.5);
        assert_eq!(metrics.average_latency_ms(), 150.0);
    }

    #[test]
    fn test_metrics_to_json() {
        let metrics = Metrics::new();
        metrics.model.record_call(true, Duration::from_millis(10));
        metrics.plan.record_replan();

        let json = metrics.to_json();
        assert_eq!(json["model"]["total_calls"].as_u64(), Some(1));
        assert_eq!(json["plan"]["replans"].as_u64(), Some(1));
    }
}
