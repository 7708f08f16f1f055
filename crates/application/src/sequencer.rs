use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use domain::{ChatId, Timestamp};
use tokio::sync::{Mutex, OwnedMutexGuard};

type Lanes = Arc<StdMutex<HashMap<ChatId, Arc<Mutex<LaneState>>>>>;

/// 每个会话一条写入通道
///
/// 同一会话的追加操作串行执行：持有通道期间分配时间戳并写入存储，
/// 因此存储中的消息顺序与时间戳顺序一致。不同会话之间互不阻塞。
/// 最后一个持有者释放后通道即被回收，下次使用前需用存储中的最后时间戳补种。
#[derive(Default)]
pub struct ChatSequencer {
    lanes: Lanes,
}

#[derive(Debug, Default)]
pub struct LaneState {
    last_timestamp: Option<Timestamp>,
}

/// 持有期间独占该会话的写入顺序
pub struct SequenceSlot {
    chat_id: ChatId,
    lanes: Lanes,
    guard: OwnedMutexGuard<LaneState>,
}

impl SequenceSlot {
    /// 新建的通道还不知道该会话之前的时间戳
    pub fn is_unseeded(&self) -> bool {
        self.guard.last_timestamp.is_none()
    }

    /// 用存储中已有的最后时间戳初始化通道
    pub fn seed(&mut self, last: Option<Timestamp>) {
        if self.guard.last_timestamp.is_none() {
            self.guard.last_timestamp = last;
        }
    }

    /// 给出不早于上一条消息的时间戳（防止时钟回拨破坏顺序）
    pub fn next_timestamp(&self, now: Timestamp) -> Timestamp {
        match self.guard.last_timestamp {
            Some(previous) if previous > now => previous,
            _ => now,
        }
    }

    /// 消息写入成功后记录其时间戳
    pub fn commit(&mut self, timestamp: Timestamp) {
        self.guard.last_timestamp = Some(timestamp);
    }
}

impl Drop for SequenceSlot {
    fn drop(&mut self) {
        // 表中一份、本守卫一份：没有其他等待者，回收通道
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = lanes.get(&self.chat_id).is_some_and(|lane| {
            Arc::ptr_eq(lane, OwnedMutexGuard::mutex(&self.guard)) && Arc::strong_count(lane) == 2
        });
        if idle {
            lanes.remove(&self.chat_id);
        }
    }
}

impl ChatSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, chat_id: &ChatId) -> SequenceSlot {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            lanes.entry(chat_id.clone()).or_default().clone()
        };
        SequenceSlot {
            chat_id: chat_id.clone(),
            lanes: self.lanes.clone(),
            guard: lane.lock_owned().await,
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn timestamps_never_go_backwards() {
        let sequencer = ChatSequencer::new();
        let chat = ChatId::parse("c-1").unwrap();
        let now = Utc::now();

        let mut slot = sequencer.acquire(&chat).await;
        let first = slot.next_timestamp(now);
        slot.commit(first);

        let skewed = slot.next_timestamp(now - Duration::seconds(30));
        assert_eq!(skewed, first);
    }

    #[tokio::test]
    async fn fresh_lane_is_seeded_from_stored_timestamp() {
        let sequencer = ChatSequencer::new();
        let chat = ChatId::parse("c-1").unwrap();
        let stored = Utc::now();

        let mut slot = sequencer.acquire(&chat).await;
        assert!(slot.is_unseeded());
        slot.seed(Some(stored));
        assert!(!slot.is_unseeded());
        assert_eq!(slot.next_timestamp(stored - Duration::seconds(5)), stored);
    }

    #[tokio::test]
    async fn lanes_serialize_per_chat_only() {
        let sequencer = ChatSequencer::new();
        let c1 = ChatId::parse("c-1").unwrap();
        let c2 = ChatId::parse("c-2").unwrap();

        let _held = sequencer.acquire(&c1).await;
        let other = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            sequencer.acquire(&c2),
        )
        .await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            sequencer.acquire(&c1),
        )
        .await;
        assert!(same.is_err());
    }

    #[tokio::test]
    async fn idle_lanes_are_reclaimed() {
        let sequencer = ChatSequencer::new();
        for i in 0..1000 {
            let chat = ChatId::parse(format!("c-{i}")).unwrap();
            drop(sequencer.acquire(&chat).await);
        }
        assert_eq!(sequencer.lane_count(), 0);
    }

    #[tokio::test]
    async fn lane_survives_while_someone_waits() {
        let sequencer = Arc::new(ChatSequencer::new());
        let chat = ChatId::parse("c-1").unwrap();
        let now = Utc::now();

        let mut held = sequencer.acquire(&chat).await;
        let waiter = tokio::spawn({
            let sequencer = sequencer.clone();
            let chat = chat.clone();
            async move {
                let slot = sequencer.acquire(&chat).await;
                slot.next_timestamp(now - Duration::seconds(30))
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        held.commit(now);
        drop(held);

        // 等待者拿到的是同一条通道，时间戳不回退
        assert_eq!(waiter.await.unwrap(), now);
        assert_eq!(sequencer.lane_count(), 0);
    }
}
