//! 会话监管：进程级取消令牌与一次性中止处理器
//!
//! 用户中止时：先取出当前 Run 注册的中止处理器，触发令牌（打断模型流与工具），执行处理器做清理，
//! 最后换上新令牌，保证之后的 Run 仍可被取消。

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// 中止时执行一次的清理逻辑
pub type AbortHandler = Box<dyn FnOnce() + Send>;

pub struct SessionSupervisor {
    cancel_token: Mutex<CancellationToken>,
    abort_handler: Mutex<Option<AbortHandler>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: Mutex::new(CancellationToken::new()),
            abort_handler: Mutex::new(None),
        }
    }

    /// 当前令牌的克隆；Run 开始时取一次并一直持有
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    /// 注册中止处理器，替换之前未触发的
    pub fn on_abort(&self, handler: AbortHandler) {
        if let Ok(mut slot) = self.abort_handler.lock() {
            *slot = Some(handler);
        }
    }

    /// Run 正常结束时撤销处理器
    pub fn clear_abort_handler(&self) {
        if let Ok(mut slot) = self.abort_handler.lock() {
            slot.take();
        }
    }

    /// 触发取消（用户 Stop），返回是否有处理器被执行
    pub fn cancel(&self) -> bool {
        let handler = self.abort_handler.lock().ok().and_then(|mut slot| slot.take());
        if let Ok(mut token) = self.cancel_token.lock() {
            token.cancel();
            *token = CancellationToken::new();
        }
        match handler {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_cancel_fires_old_token_and_installs_fresh_one() {
        let supervisor = SessionSupervisor::new();
        let old = supervisor.cancel_token();
        supervisor.cancel();
        assert!(old.is_cancelled());
        assert!(!supervisor.cancel_token().is_cancelled());
    }

    #[test]
    fn test_abort_handler_runs_once() {
        let supervisor = SessionSupervisor::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        supervisor.on_abort(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(supervisor.cancel());
        assert!(!supervisor.cancel());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleared_handler_does_not_run() {
        let supervisor = SessionSupervisor::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        supervisor.on_abort(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        supervisor.clear_abort_handler();
        supervisor.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
