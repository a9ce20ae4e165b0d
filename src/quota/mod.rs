//! 每日配额仲裁
//!
//! 本地维护一个按日期划分的配额预估。远端不提供调用前的剩余配额查询，
//! 所以这里只是尽力而为的估计：上传前预留，未实际消耗时释放。

use anyhow::Result;
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 持久化的配额状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaBudget {
    pub date: NaiveDate,
    pub consumed_units: u64,
    pub daily_limit: u64,
}

/// 配额使用情况快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub date: NaiveDate,
    pub consumed: u64,
    pub limit: u64,
}

impl QuotaUsage {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.consumed)
    }
}

/// 配额状态存储
///
/// 调用发生在仲裁器的锁内，实现必须是短小的本地操作。
pub trait QuotaStore: Send + Sync {
    fn load(&self) -> Result<Option<QuotaBudget>>;
    fn save(&self, budget: &QuotaBudget) -> Result<()>;
}

/// 进程内存储，不跨进程保留
#[derive(Default)]
pub struct MemoryQuotaStore {
    budget: Mutex<Option<QuotaBudget>>,
}

impl QuotaStore for MemoryQuotaStore {
    fn load(&self) -> Result<Option<QuotaBudget>> {
        Ok(self.budget.lock().clone())
    }

    fn save(&self, budget: &QuotaBudget) -> Result<()> {
        *self.budget.lock() = Some(budget.clone());
        Ok(())
    }
}

type Clock = Box<dyn Fn() -> NaiveDate + Send + Sync>;

/// 配额仲裁器
///
/// 每次调用都在一个临界区内完成：日期滚动、检查、修改、持久化。
pub struct QuotaArbiter {
    budget: Mutex<QuotaBudget>,
    store: Arc<dyn QuotaStore>,
    today: Clock,
}

impl QuotaArbiter {
    /// 使用本地日期创建
    pub fn new(daily_limit: u64, store: Arc<dyn QuotaStore>) -> Result<Self> {
        Self::with_clock(daily_limit, store, || Local::now().date_naive())
    }

    /// 仅内存、本地日期
    pub fn in_memory(daily_limit: u64) -> Result<Self> {
        Self::new(daily_limit, Arc::new(MemoryQuotaStore::default()))
    }

    /// 注入日期来源
    ///
    /// 配置中的 `daily_limit` 优先于存储中的旧值。
    pub fn with_clock<F>(daily_limit: u64, store: Arc<dyn QuotaStore>, today: F) -> Result<Self>
    where
        F: Fn() -> NaiveDate + Send + Sync + 'static,
    {
        let date = today();
        let budget = match store.load()? {
            Some(stored) if stored.date >= date => QuotaBudget {
                daily_limit,
                ..stored
            },
            _ => QuotaBudget {
                date,
                consumed_units: 0,
                daily_limit,
            },
        };
        store.save(&budget)?;
        debug!(
            "配额状态已加载: date={}, consumed={}/{}",
            budget.date, budget.consumed_units, budget.daily_limit
        );

        Ok(Self {
            budget: Mutex::new(budget),
            store,
            today: Box::new(today),
        })
    }

    /// 日期前进时重置已用配额
    fn rolled(&self, budget: &QuotaBudget) -> QuotaBudget {
        let today = (self.today)();
        if today > budget.date {
            info!("配额日期滚动: {} -> {}", budget.date, today);
            QuotaBudget {
                date: today,
                consumed_units: 0,
                daily_limit: budget.daily_limit,
            }
        } else {
            budget.clone()
        }
    }

    /// 预留配额
    ///
    /// 剩余足够时增加已用量并返回 true，否则不做任何修改并返回 false。
    pub fn reserve(&self, units: u64) -> Result<bool> {
        let mut budget = self.budget.lock();
        let mut next = self.rolled(&budget);

        let Some(total) = next.consumed_units.checked_add(units) else {
            return Ok(false);
        };
        if total > next.daily_limit {
            if next != *budget {
                self.store.save(&next)?;
                *budget = next;
            }
            debug!(
                "配额不足: 需要 {}, 已用 {}/{}",
                units, budget.consumed_units, budget.daily_limit
            );
            return Ok(false);
        }

        next.consumed_units = total;
        self.store.save(&next)?;
        *budget = next;
        Ok(true)
    }

    /// 归还未实际消耗的预留
    pub fn release(&self, units: u64) -> Result<()> {
        let mut budget = self.budget.lock();
        let mut next = self.rolled(&budget);
        if next.date != budget.date {
            // 预留属于前一天，新的一天无需归还
            self.store.save(&next)?;
            *budget = next;
            return Ok(());
        }
        if units > next.consumed_units {
            warn!("归还量 {} 超过已用量 {}", units, next.consumed_units);
        }
        next.consumed_units = next.consumed_units.saturating_sub(units);
        self.store.save(&next)?;
        *budget = next;
        Ok(())
    }

    /// 远端报告配额耗尽时，将当日预估标记为用满
    pub fn exhaust(&self) -> Result<()> {
        let mut budget = self.budget.lock();
        let mut next = self.rolled(&budget);
        next.consumed_units = next.daily_limit;
        self.store.save(&next)?;
        *budget = next;
        warn!("远端配额已耗尽，今日不再预留");
        Ok(())
    }

    /// 记入未经预留、已在远端发生的消耗（例如会话过期后重建），不超过每日上限
    pub fn charge(&self, units: u64) -> Result<()> {
        let mut budget = self.budget.lock();
        let mut next = self.rolled(&budget);
        next.consumed_units = next.consumed_units.saturating_add(units).min(next.daily_limit);
        self.store.save(&next)?;
        *budget = next;
        debug!("追加配额消耗 {}, 已用 {}/{}", units, budget.consumed_units, budget.daily_limit);
        Ok(())
    }

    pub fn current_usage(&self) -> Result<QuotaUsage> {
        let mut budget = self.budget.lock();
        let next = self.rolled(&budget);
        if next != *budget {
            self.store.save(&next)?;
            *budget = next;
        }
        Ok(QuotaUsage {
            date: budget.date,
            consumed: budget.consumed_units,
            limit: budget.daily_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, d).unwrap()
    }

    #[test]
    fn test_reserve_and_release() {
        let arbiter = QuotaArbiter::with_clock(
            3_200,
            Arc::new(MemoryQuotaStore::default()),
            || day(1),
        )
        .unwrap();

        assert!(arbiter.reserve(1_600).unwrap());
        assert!(arbiter.reserve(1_600).unwrap());
        assert!(!arbiter.reserve(1_600).unwrap());
        assert_eq!(arbiter.current_usage().unwrap().consumed, 3_200);

        arbiter.release(1_600).unwrap();
        let usage = arbiter.current_usage().unwrap();
        assert_eq!(usage.consumed, 1_600);
        assert_eq!(usage.remaining(), 1_600);
    }

    #[test]
    fn test_charge_is_capped_at_limit() {
        let arbiter = QuotaArbiter::with_clock(
            4_000,
            Arc::new(MemoryQuotaStore::default()),
            || day(2),
        )
        .unwrap();

        assert!(arbiter.reserve(1_600).unwrap());
        arbiter.charge(1_600).unwrap();
        assert_eq!(arbiter.current_usage().unwrap().consumed, 3_200);

        arbiter.charge(1_600).unwrap();
        assert_eq!(arbiter.current_usage().unwrap().consumed, 4_000);
        assert!(!arbiter.reserve(1).unwrap());
    }

    #[test]
    fn test_date_rollover_resets_usage() {
        let offset = Arc::new(AtomicI64::new(0));
        let clock_offset = offset.clone();
        let arbiter = QuotaArbiter::with_clock(
            1_600,
            Arc::new(MemoryQuotaStore::default()),
            move || day(1) + chrono::Duration::days(clock_offset.load(Ordering::SeqCst)),
        )
        .unwrap();

        assert!(arbiter.reserve(1_600).unwrap());
        assert!(!arbiter.reserve(1).unwrap());

        offset.store(1, Ordering::SeqCst);
        let usage = arbiter.current_usage().unwrap();
        assert_eq!(usage.date, day(2));
        assert_eq!(usage.consumed, 0);
        assert!(arbiter.reserve(1_600).unwrap());
    }

    #[test]
    fn test_state_survives_reload() {
        let store: Arc<dyn QuotaStore> = Arc::new(MemoryQuotaStore::default());
        {
            let arbiter = QuotaArbiter::with_clock(10_000, store.clone(), || day(3)).unwrap();
            arbiter.reserve(1_600).unwrap();
            arbiter.exhaust().unwrap();
        }

        let reloaded = QuotaArbiter::with_clock(10_000, store.clone(), || day(3)).unwrap();
        assert_eq!(reloaded.current_usage().unwrap().consumed, 10_000);

        let next_day = QuotaArbiter::with_clock(10_000, store, || day(4)).unwrap();
        assert_eq!(next_day.current_usage().unwrap().consumed, 0);
    }

    #[test]
    fn test_concurrent_reserve_only_one_fits() {
        let arbiter = Arc::new(QuotaArbiter::in_memory(1_600).unwrap());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let arbiter = arbiter.clone();
                std::thread::spawn(move || arbiter.reserve(1_600).unwrap())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|g| *g)
            .count();

        assert_eq!(granted, 1);
        assert_eq!(arbiter.current_usage().unwrap().consumed, 1_600);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve(u64),
        Release(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..4_000).prop_map(Op::Reserve),
            (1u64..4_000).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn prop_consumed_never_exceeds_limit(
            limit in 1u64..20_000,
            ops in prop::collection::vec(op_strategy(), 1..64),
        ) {
            let arbiter = QuotaArbiter::with_clock(
                limit,
                Arc::new(MemoryQuotaStore::default()),
                || day(9),
            ).unwrap();

            for op in ops {
                let before = arbiter.current_usage().unwrap().consumed;
                match op {
                    Op::Reserve(units) => {
                        let granted = arbiter.reserve(units).unwrap();
                        let after = arbiter.current_usage().unwrap().consumed;
                        prop_assert_eq!(granted, before + units <= limit);
                        if !granted {
                            prop_assert_eq!(after, before);
                        }
                    }
                    Op::Release(units) => arbiter.release(units).unwrap(),
                }
                prop_assert!(arbiter.current_usage().unwrap().consumed <= limit);
            }
        }
    }
}
