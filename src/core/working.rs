//! Working 标志守卫
//!
//! set_working(true) 时（重新）启动看门狗；若 Run 在超时前没有调用 set_working(false)，
//! 看门狗强制清除标志，避免后端不给终止事件时 UI 一直显示「正在工作」。每次实际变更都上报遥测。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;

use crate::core::StateStore;
use crate::observability::Telemetry;

pub struct WorkingGuard {
    store: StateStore,
    telemetry: Arc<dyn Telemetry>,
    timeout: Duration,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    /// 每次 set_working 递增；看门狗只在代数未变时生效
    generation: Arc<AtomicU64>,
}

impl WorkingGuard {
    pub fn new(store: StateStore, telemetry: Arc<dyn Telemetry>, timeout: Duration) -> Self {
        Self {
            store,
            telemetry,
            timeout,
            watchdog: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_working(&self) -> bool {
        self.store.is_working()
    }

    /// 当前是否有未触发的看门狗
    pub fn has_watchdog(&self) -> bool {
        self.watchdog
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    pub fn set_working(&self, chat_id: &str, is_working: bool) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.store.update(|s| {
            let chat = s.chat_entry(chat_id);
            std::mem::replace(&mut chat.is_working, is_working)
        });
        self.after_set(chat_id, previous, is_working, generation);
    }

    /// 仅当没有任何对话在工作时置为 true（检查与写入在同一次原子更新内），返回是否成功
    pub fn try_start(&self, chat_id: &str) -> bool {
        let started = self.store.update(|s| {
            if s.is_working() {
                return None;
            }
            s.chat_entry(chat_id).is_working = true;
            Some(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
        });
        match started {
            Some(generation) => {
                self.after_set(chat_id, false, true, generation);
                true
            }
            None => false,
        }
    }

    fn after_set(&self, chat_id: &str, previous: bool, is_working: bool, generation: u64) {
        if let Ok(mut slot) = self.watchdog.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
            if is_working {
                *slot = Some(self.spawn_watchdog(chat_id.to_string(), generation));
            }
        }

        if previous != is_working {
            tracing::debug!(chat_id, previous, new = is_working, "working flag changed");
            self.telemetry.capture(
                "agent_working_changed",
                json!({ "chat_id": chat_id, "previous": previous, "new": is_working }),
            );
        }
    }

    fn spawn_watchdog(&self, chat_id: String, generation: u64) -> JoinHandle<()> {
        let store = self.store.clone();
        let telemetry = self.telemetry.clone();
        let current = self.generation.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            let cleared = store.update(|s| match s.chat_mut(&chat_id) {
                Some(chat) if chat.is_working => {
                    chat.is_working = false;
                    true
                }
                _ => false,
            });
            if cleared {
                tracing::warn!(
                    chat_id = %chat_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "run did not finish in time, clearing working flag"
                );
                telemetry.capture(
                    "agent_working_timeout",
                    json!({ "chat_id": chat_id, "timeout_ms": timeout.as_millis() as u64 }),
                );
                telemetry.capture(
                    "agent_working_changed",
                    json!({ "chat_id": chat_id, "previous": true, "new": false }),
                );
            }
        })
    }
}

impl Drop for WorkingGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.watchdog.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[derive(Default)]
    struct RecordingTelemetry {
        events: Mutex<Vec<(String, Value)>>,
    }

    impl Telemetry for RecordingTelemetry {
        fn capture(&self, event: &str, properties: Value) {
            self.events.lock().unwrap().push((event.to_string(), properties));
        }

        fn capture_exception(&self, _error: &dyn std::error::Error) {}
    }

    fn guard(timeout_ms: u64) -> (WorkingGuard, StateStore, Arc<RecordingTelemetry>) {
        let store = StateStore::default();
        let telemetry = Arc::new(RecordingTelemetry::default());
        let guard = WorkingGuard::new(
            store.clone(),
            telemetry.clone(),
            Duration::from_millis(timeout_ms),
        );
        (guard, store, telemetry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_force_clears_flag() {
        let (guard, store, telemetry) = guard(1_000);
        guard.set_working("c1", true);
        assert!(store.is_working());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!store.is_working());
        let events = telemetry.events.lock().unwrap();
        assert!(events.iter().any(|(e, _)| e == "agent_working_timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_false_cancels_watchdog() {
        let (guard, store, _) = guard(1_000);
        guard.set_working("c1", true);
        guard.set_working("c1", false);
        assert!(!guard.has_watchdog());

        // 新的 Run 开始后，旧看门狗不应清掉它
        guard.set_working("c1", true);
        tokio::time::sleep(Duration::from_millis(600)).await;
        guard.set_working("c1", true);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(store.is_working());
    }

    #[tokio::test]
    async fn test_set_false_twice_is_idempotent() {
        let (guard, store, telemetry) = guard(1_000);
        guard.set_working("c1", true);
        guard.set_working("c1", false);
        let after_once = (store.get_state(), telemetry.events.lock().unwrap().len());

        guard.set_working("c1", false);
        let after_twice = (store.get_state(), telemetry.events.lock().unwrap().len());

        assert_eq!(after_once, after_twice);
        assert!(!guard.has_watchdog());
        assert!(!guard.is_working());
    }

    #[tokio::test]
    async fn test_try_start_refuses_while_another_chat_works() {
        let (guard, store, _) = guard(1_000);
        assert!(guard.try_start("c1"));
        assert!(!guard.try_start("c2"));
        assert!(store.chat("c2").map_or(true, |c| !c.is_working));
        guard.set_working("c1", false);
        assert!(guard.try_start("c2"));
    }

    #[tokio::test]
    async fn test_transitions_emit_previous_and_new() {
        let (guard, _, telemetry) = guard(1_000);
        guard.set_working("c1", true);
        guard.set_working("c1", false);
        let events = telemetry.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].1["previous"], false);
        assert_eq!(events[0].1["new"], true);
        assert_eq!(events[1].1["previous"], true);
        assert_eq!(events[1].1["new"], false);
    }
}
