//! 共享状态：AppState 与事务式 StateStore
//!
//! 所有对话写入都经过 StateStore 的读-改-写原语（watch::Sender::send_modify，同进程内原子），
//! 远端 UI 通过 subscribe() 拿到的 watch::Receiver 观察每次变更。编排核心自身不保存历史副本。

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::watch;

use crate::chat::{Chat, ChatId};

/// 进程内全部对话状态
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AppState {
    pub chats: BTreeMap<ChatId, Chat>,
}

impl AppState {
    pub fn chat(&self, id: &str) -> Option<&Chat> {
        self.chats.get(id)
    }

    pub fn chat_mut(&mut self, id: &str) -> Option<&mut Chat> {
        self.chats.get_mut(id)
    }

    /// 不存在则创建空对话
    pub fn chat_entry(&mut self, id: &str) -> &mut Chat {
        self.chats
            .entry(id.to_string())
            .or_insert_with(|| Chat::new(id))
    }

    /// 进程级 working 标志：任一对话正在运行
    pub fn is_working(&self) -> bool {
        self.chats.values().any(|c| c.is_working)
    }
}

/// 事务式共享状态存储
#[derive(Clone, Debug)]
pub struct StateStore {
    tx: watch::Sender<AppState>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(AppState::default())
    }
}

impl StateStore {
    pub fn new(initial: AppState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// 原子地应用 mutator 并返回新状态
    pub fn set_state<F>(&self, mutator: F) -> AppState
    where
        F: FnOnce(&mut AppState),
    {
        self.tx.send_modify(mutator);
        self.tx.borrow().clone()
    }

    /// 原子地应用 f 并返回其结果（不克隆整个状态）
    pub fn update<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut AppState) -> R,
    {
        let mut out = None;
        self.tx.send_modify(|state| out = Some(f(state)));
        match out {
            Some(r) => r,
            // send_modify 总会同步调用闭包
            None => unreachable!("send_modify did not run the mutator"),
        }
    }

    pub fn get_state(&self) -> AppState {
        self.tx.borrow().clone()
    }

    pub fn chat(&self, id: &str) -> Option<Chat> {
        self.tx.borrow().chat(id).cloned()
    }

    pub fn is_working(&self) -> bool {
        self.tx.borrow().is_working()
    }

    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Message;

    #[test]
    fn test_set_state_returns_new_state() {
        let store = StateStore::default();
        let state = store.set_state(|s| {
            s.chat_entry("c1").messages.push(Message::user("hi"));
        });
        assert_eq!(state.chat("c1").unwrap().messages.len(), 1);
        assert_eq!(store.get_state(), state);
    }

    #[tokio::test]
    async fn test_subscribers_observe_updates() {
        let store = StateStore::default();
        let mut rx = store.subscribe();
        store.update(|s| s.chat_entry("c1").is_working = true);
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_working());
    }
}
