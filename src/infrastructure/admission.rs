//! 厂商并发准入控制 - 基础设施层
//!
//! 每个厂商（按 provider_id）一个可在运行中调整容量的计数信号量。
//!
//! - 首次访问某厂商时按调用方给出的上限创建；
//! - 之后每次访问都比较记录的容量和调用方刚从配置库读到的上限：
//!   - 变大：立即放出差值个许可；
//!   - 变小：只下调记录的容量，已发出的许可照常执行完，归还时被吞掉，
//!     直到实际并发收敛到新的上限；
//! - 等待许可发生在 map 锁之外，一个厂商的排队不会阻塞其他厂商的记账。
//!
//! 不变量：`可用许可 + 使用中 - 待回收 = 容量`，且只有待回收为 0 时才可能有可用许可，
//! 所以新发放许可时使用中的数量不会超过当时的容量。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// 单个厂商的准入状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    pub capacity: usize,
    pub in_use: usize,
    pub available: usize,
}

#[derive(Debug)]
struct SlotState {
    capacity: usize,
    in_use: usize,
    /// 缩容后还需要吞掉的许可数
    debt: usize,
}

#[derive(Debug)]
struct AdmissionSlot {
    semaphore: Arc<Semaphore>,
    state: Mutex<SlotState>,
}

impl AdmissionSlot {
    fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            state: Mutex::new(SlotState {
                capacity,
                in_use: 0,
                debt: 0,
            }),
        }
    }

    /// 调整容量。扩容放出许可，缩容只改上限（先回收空闲许可，不够的记为待回收）
    fn resize(&self, new_capacity: usize, provider_name: &str) {
        let mut state = self.state.lock();
        let old_capacity = state.capacity;
        if new_capacity == old_capacity {
            return;
        }

        if new_capacity > old_capacity {
            let mut grow = new_capacity - old_capacity;
            let repaid = grow.min(state.debt);
            state.debt -= repaid;
            grow -= repaid;
            if grow > 0 {
                self.semaphore.add_permits(grow);
            }
            info!(
                "[并发控制] [{}] 并发扩容: {} -> {}",
                provider_name, old_capacity, new_capacity
            );
        } else {
            let shrink = old_capacity - new_capacity;
            let mut reclaimed = 0;
            while reclaimed < shrink {
                match self.semaphore.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        reclaimed += 1;
                    }
                    Err(_) => break,
                }
            }
            state.debt += shrink - reclaimed;
            info!(
                "[并发控制] [{}] 并发缩容: {} -> {} (将在任务释放后生效)",
                provider_name, old_capacity, new_capacity
            );
        }

        state.capacity = new_capacity;
    }

    fn release(&self, permit: OwnedSemaphorePermit) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        if state.debt > 0 {
            state.debt -= 1;
            permit.forget();
        } else {
            drop(permit);
        }
    }

    fn snapshot(&self) -> AdmissionSnapshot {
        let state = self.state.lock();
        AdmissionSnapshot {
            capacity: state.capacity,
            in_use: state.in_use,
            available: self.semaphore.available_permits(),
        }
    }
}

/// 准入许可，离开作用域时自动归还（无论成功还是出错）
#[derive(Debug)]
pub struct AdmissionPermit {
    slot: Arc<AdmissionSlot>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.slot.release(permit);
        }
    }
}

/// 厂商并发准入控制器
///
/// 所有班级、所有批改线程共享一个实例。
#[derive(Debug, Default)]
pub struct ProviderAdmission {
    slots: Mutex<HashMap<i64, Arc<AdmissionSlot>>>,
}

impl ProviderAdmission {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取（必要时创建）厂商的信号量，并按最新上限完成扩缩容记账
    fn slot_for(&self, provider_id: i64, provider_name: &str, declared_limit: usize) -> Arc<AdmissionSlot> {
        let declared_limit = declared_limit.max(1);
        let mut slots = self.slots.lock();
        match slots.get(&provider_id) {
            Some(slot) => {
                slot.resize(declared_limit, provider_name);
                Arc::clone(slot)
            }
            None => {
                info!(
                    "[并发控制] 初始化厂商 [{}] (ID:{}) 并发锁: {}",
                    provider_name, provider_id, declared_limit
                );
                let slot = Arc::new(AdmissionSlot::new(declared_limit));
                slots.insert(provider_id, Arc::clone(&slot));
                slot
            }
        }
    }

    /// 只做扩缩容，不申请许可
    pub fn resize(&self, provider_id: i64, provider_name: &str, declared_limit: usize) {
        self.slot_for(provider_id, provider_name, declared_limit);
    }

    /// 申请一个许可，没有空闲许可时挂起等待
    pub async fn acquire(
        &self,
        provider_id: i64,
        provider_name: &str,
        declared_limit: usize,
    ) -> AdmissionPermit {
        let slot = self.slot_for(provider_id, provider_name, declared_limit);

        debug!("[并发控制] [{}] 正在等待许可...", provider_name);
        let permit = match Arc::clone(&slot.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("admission semaphores are never closed"),
        };
        slot.state.lock().in_use += 1;
        debug!("[并发控制] [{}] 已获得许可", provider_name);

        AdmissionPermit {
            slot,
            permit: Some(permit),
        }
    }

    /// 在准入许可保护下执行一段异步操作
    pub async fn run<F, T>(
        &self,
        provider_id: i64,
        provider_name: &str,
        declared_limit: usize,
        fut: F,
    ) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire(provider_id, provider_name, declared_limit).await;
        fut.await
    }

    pub fn snapshot(&self, provider_id: i64) -> Option<AdmissionSnapshot> {
        let slots = self.slots.lock();
        slots.get(&provider_id).map(|slot| slot.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_first_use_creates_slot_with_declared_limit() {
        let admission = ProviderAdmission::new();
        assert!(admission.snapshot(1).is_none());

        let permit = admission.acquire(1, "volc", 3).await;
        assert_eq!(
            admission.snapshot(1),
            Some(AdmissionSnapshot {
                capacity: 3,
                in_use: 1,
                available: 2
            })
        );
        drop(permit);
        assert_eq!(admission.snapshot(1).unwrap().available, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_grants_never_exceed_capacity() {
        let admission = Arc::new(ProviderAdmission::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let admission = Arc::clone(&admission);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = admission.acquire(7, "openai", 2).await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(admission.snapshot(7).unwrap().in_use, 0);
    }

    #[tokio::test]
    async fn test_grow_releases_exactly_delta_waiters() {
        let admission = Arc::new(ProviderAdmission::new());
        let holder = admission.acquire(1, "volc", 1).await;

        let granted = Arc::new(AtomicUsize::new(0));
        let (release_tx, _) = tokio::sync::broadcast::channel::<()>(1);
        let mut handles = Vec::new();
        for _ in 0..3 {
            let admission = Arc::clone(&admission);
            let granted = Arc::clone(&granted);
            let mut release_rx = release_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let _permit = admission.acquire(1, "volc", 1).await;
                granted.fetch_add(1, Ordering::SeqCst);
                let _ = release_rx.recv().await;
            }));
        }
        settle().await;
        assert_eq!(granted.load(Ordering::SeqCst), 0);

        // 1 -> 3，放出 2 个许可，3 个等待者中恰好 2 个被唤醒
        admission.resize(1, "volc", 3);
        settle().await;
        assert_eq!(granted.load(Ordering::SeqCst), 2);
        assert_eq!(admission.snapshot(1).unwrap().in_use, 3);

        drop(holder);
        settle().await;
        assert_eq!(granted.load(Ordering::SeqCst), 3);

        release_tx.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        let snapshot = admission.snapshot(1).unwrap();
        assert_eq!(snapshot.available, 3);
        assert_eq!(snapshot.in_use, 0);
    }

    #[tokio::test]
    async fn test_shrink_converges_as_permits_return() {
        let admission = Arc::new(ProviderAdmission::new());
        let p1 = admission.acquire(2, "volc", 3).await;
        let p2 = admission.acquire(2, "volc", 3).await;
        let p3 = admission.acquire(2, "volc", 3).await;

        // 3 -> 1：已发出的许可不收回
        admission.resize(2, "volc", 1);
        assert_eq!(
            admission.snapshot(2),
            Some(AdmissionSnapshot {
                capacity: 1,
                in_use: 3,
                available: 0
            })
        );

        let waiter = {
            let admission = Arc::clone(&admission);
            tokio::spawn(async move {
                let _permit = admission.acquire(2, "volc", 1).await;
            })
        };

        drop(p1);
        settle().await;
        assert!(!waiter.is_finished());
        drop(p2);
        settle().await;
        assert!(!waiter.is_finished());

        drop(p3);
        waiter.await.unwrap();
        assert_eq!(admission.snapshot(2).unwrap().available, 1);
    }

    #[tokio::test]
    async fn test_shrink_reclaims_idle_permits_immediately() {
        let admission = ProviderAdmission::new();
        admission.resize(5, "idle", 4);
        admission.resize(5, "idle", 2);
        assert_eq!(admission.snapshot(5).unwrap().available, 2);

        // 再扩回去
        admission.resize(5, "idle", 4);
        assert_eq!(admission.snapshot(5).unwrap().available, 4);
    }

    #[tokio::test]
    async fn test_third_call_waits_for_a_release() {
        let admission = Arc::new(ProviderAdmission::new());
        let started = Instant::now();

        let mut handles = Vec::new();
        for hold_ms in [80u64, 120, 10] {
            let admission = Arc::clone(&admission);
            handles.push(tokio::spawn(async move {
                admission
                    .run(9, "slow", 2, async move {
                        let begin = started.elapsed();
                        tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                        (begin, started.elapsed())
                    })
                    .await
            }));
            // 保证按顺序到达
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut spans = Vec::new();
        for handle in handles {
            spans.push(handle.await.unwrap());
        }
        let first_release = spans[0].1.min(spans[1].1);
        assert!(spans[2].0 >= first_release);
    }

    #[test]
    fn test_zero_limit_is_treated_as_one() {
        tokio_test::block_on(async {
            let admission = ProviderAdmission::new();
            let _permit = admission.acquire(3, "zero", 0).await;
            assert_eq!(admission.snapshot(3).unwrap().capacity, 1);
        });
    }
}
