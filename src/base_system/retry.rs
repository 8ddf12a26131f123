//! 冷却/退避重试策略。
//!
//! 分页 tab 对齐是全流程里唯一会主动重试的地方：固定请求预算 + 每次请求前的随机退避。

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_BASE: Duration = Duration::from_millis(600);
pub const DEFAULT_CAP: Duration = Duration::from_secs(3);

/// 计数 + 休眠的退避器，由调用方持有，不放在全局状态里。
#[derive(Debug, Clone)]
pub struct SpinWithBackoff {
    nth: usize,
    base: Duration,
    cap: Duration,
    jitter_max: f64,
}

impl Default for SpinWithBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_CAP)
    }
}

impl SpinWithBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            nth: 0,
            base,
            cap,
            jitter_max: 0.4,
        }
    }

    /// 已经休眠（即已经发出请求）的次数。
    pub fn nth(&self) -> usize {
        self.nth
    }

    pub fn next_delay(&self) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }
        let exp = self.nth.min(16) as u32;
        let backoff = self.base.saturating_mul(1u32 << exp);
        let jitter = Duration::from_secs_f64(jitter_seconds(self.jitter_max));
        (backoff + jitter).min(self.cap)
    }

    pub fn sleep(&mut self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.nth += 1;
    }
}

pub(crate) fn jitter_seconds(max: f64) -> f64 {
    if max <= 0.0 {
        return 0.0;
    }
    // 用时间戳制造一个轻量抖动（避免引入 rand 依赖）
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    let bucket = (nanos % 10_000) as f64 / 10_000.0; // [0,1)
    bucket * max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_each_sleep() {
        let mut spin = SpinWithBackoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(spin.nth(), 0);
        spin.sleep();
        spin.sleep();
        assert_eq!(spin.nth(), 2);
    }

    #[test]
    fn delay_is_capped() {
        let mut spin = SpinWithBackoff::new(Duration::from_millis(1), Duration::from_millis(5));
        for _ in 0..10 {
            spin.nth += 1;
        }
        assert!(spin.next_delay() <= Duration::from_millis(5));
    }

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..32 {
            let j = jitter_seconds(0.4);
            assert!((0.0..0.4).contains(&j));
        }
    }
}
