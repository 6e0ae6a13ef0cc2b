use std::sync::atomic::{AtomicI64, Ordering};

/// 生成本地会话 ID（客户端生成，会话生命周期内不变）
pub fn generate_local_id() -> String {
    format!("local-{}", uuid::Uuid::new_v4().simple())
}

/// 生成请求的 operationID，服务端日志以此关联
pub fn generate_operation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 当前毫秒时间戳
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 单调递增的毫秒时钟
///
/// 同一毫秒内的多次写入依次 +1，保证后写入的 `updated_at` 不会早于先写入的。
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> i64 {
        let wall = now_millis();
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let next = if wall > prev { wall } else { prev + 1 };
            match self
                .last
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_never_repeats() {
        let clock = MonotonicClock::new();
        let mut last = 0;
        for _ in 0..1000 {
            let t = clock.now();
            assert!(t > last);
            last = t;
        }
    }

    #[test]
    fn local_ids_are_unique() {
        assert_ne!(generate_local_id(), generate_local_id());
        assert!(generate_local_id().starts_with("local-"));
    }
}
