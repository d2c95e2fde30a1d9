//! 时钟抽象
//!
//! 审计记录与检查点的时间戳通过 Clock 注入：生产用 SystemClock（chrono），
//! 测试用 ManualClock，使确定性后端下两次运行产出逐字节一致的审计日志。

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// 毫秒时间戳来源
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// 系统时钟（UTC 毫秒）
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// 手动时钟：固定或步进的毫秒值，供确定性测试使用
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            ms: AtomicI64::new(start_ms),
        }
    }

    pub fn shared(start_ms: i64) -> Arc<Self> {
        Arc::new(Self::new(start_ms))
    }

    pub fn set(&self, ms: i64) {
        self.ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.ms.load(Ordering::SeqCst)
    }
}
