//! 带鉴权重试的模型客户端
//!
//! 后端返回鉴权失效时：在预算内（默认 2 次）通过 TokenProvider 刷新凭证、用 ClientFactory 重建底层客户端，
//! 再原样重发同一请求。重试计数在整个进程内按「逻辑 Run」累计，任何一次成功都会清零。

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::{ErrorClassifier, ErrorKind};
use crate::llm::{CompletionRequest, CompletionStream, LlmClient, LlmError, LlmMessage};
use crate::observability::Telemetry;

/// 调用模型所需的凭证
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("api_key", &"***").finish()
    }
}

/// 凭证提供方：取当前凭证 / 强制刷新
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self) -> anyhow::Result<Option<Credentials>>;

    async fn refresh(&self) -> anyhow::Result<Credentials>;
}

/// 从环境变量读取 API Key；refresh 时重新读取（支持外部轮换密钥）
#[derive(Debug, Clone)]
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn get_token(&self) -> anyhow::Result<Option<Credentials>> {
        Ok(std::env::var(&self.var)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(|api_key| Credentials { api_key }))
    }

    async fn refresh(&self) -> anyhow::Result<Credentials> {
        self.get_token()
            .await?
            .ok_or_else(|| anyhow::anyhow!("environment variable {} is not set", self.var))
    }
}

/// 用新凭证构建底层客户端
pub type ClientFactory = Arc<dyn Fn(&Credentials) -> Arc<dyn LlmClient> + Send + Sync>;

pub struct AuthAwareClient {
    inner: RwLock<Arc<dyn LlmClient>>,
    factory: ClientFactory,
    tokens: Arc<dyn TokenProvider>,
    max_retries: u32,
    retries: AtomicU32,
    telemetry: Arc<dyn Telemetry>,
}

impl AuthAwareClient {
    pub fn new(
        inner: Arc<dyn LlmClient>,
        factory: ClientFactory,
        tokens: Arc<dyn TokenProvider>,
        max_retries: u32,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            inner: RwLock::new(inner),
            factory,
            tokens,
            max_retries,
            retries: AtomicU32::new(0),
            telemetry,
        }
    }

    /// 已消耗的鉴权重试次数
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    /// 新的逻辑 Run 开始时清零
    pub fn reset_retries(&self) {
        self.retries.store(0, Ordering::SeqCst);
    }

    /// 当前底层客户端；辅助调用（如标题生成）直接使用，不参与鉴权重试计数
    pub async fn current(&self) -> Arc<dyn LlmClient> {
        self.inner.read().await.clone()
    }

    /// 流式调用；鉴权失效时按预算刷新凭证并重发同一请求
    pub async fn invoke(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream, LlmError> {
        loop {
            let client = self.inner.read().await.clone();
            match client.stream_completion(request, cancel.clone()).await {
                Ok(stream) => {
                    self.reset_retries();
                    return Ok(stream);
                }
                Err(e) if is_auth_error(&e) => self.recover_auth(e).await?,
                Err(e) => return Err(e),
            }
        }
    }

    async fn recover_auth(&self, err: LlmError) -> Result<(), LlmError> {
        let used = self.retries.load(Ordering::SeqCst);
        if used >= self.max_retries {
            tracing::warn!(retries = used, "authentication retry budget exhausted");
            return Err(err);
        }
        self.retries.store(used + 1, Ordering::SeqCst);
        tracing::warn!(attempt = used + 1, max = self.max_retries, "authentication expired, refreshing credentials");
        self.telemetry
            .capture("llm_auth_retry", json!({ "attempt": used + 1, "max": self.max_retries }));

        let credentials = self.tokens.refresh().await.map_err(|e| {
            self.telemetry.capture_exception(e.as_ref());
            LlmError::Unauthorized(format!("credential refresh failed: {e}"))
        })?;
        let rebuilt = (self.factory)(&credentials);
        *self.inner.write().await = rebuilt;
        Ok(())
    }
}

fn is_auth_error(err: &LlmError) -> bool {
    ErrorClassifier::classify_llm(err).kind == ErrorKind::AuthenticationExpired
}

#[async_trait]
impl LlmClient for AuthAwareClient {
    async fn complete(&self, messages: &[LlmMessage]) -> Result<String, LlmError> {
        loop {
            let client = self.inner.read().await.clone();
            match client.complete(messages).await {
                Ok(text) => {
                    self.reset_retries();
                    return Ok(text);
                }
                Err(e) if is_auth_error(&e) => self.recover_auth(e).await?,
                Err(e) => return Err(e),
            }
        }
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream, LlmError> {
        self.invoke(request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, MockResponse};
    use crate::observability::NoopTelemetry;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingTokens {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl TokenProvider for CountingTokens {
        async fn get_token(&self) -> anyhow::Result<Option<Credentials>> {
            Ok(Some(Credentials { api_key: "k0".into() }))
        }

        async fn refresh(&self) -> anyhow::Result<Credentials> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Credentials { api_key: format!("k{n}") })
        }
    }

    fn unauthorized() -> MockResponse {
        MockResponse::Error(LlmError::Unauthorized("expired".into()))
    }

    /// 所有重建出来的客户端共享同一个脚本，便于统计总尝试次数
    fn client_with(script: Vec<MockResponse>, tokens: Arc<CountingTokens>) -> (AuthAwareClient, Arc<MockLlmClient>) {
        let mock = Arc::new(MockLlmClient::with_script(script));
        let shared = mock.clone();
        let factory: ClientFactory = Arc::new(move |_creds| shared.clone() as Arc<dyn LlmClient>);
        let client = AuthAwareClient::new(
            mock.clone(),
            factory,
            tokens,
            2,
            Arc::new(NoopTelemetry),
        );
        (client, mock)
    }

    #[tokio::test]
    async fn test_auth_budget_exhausted_after_three_attempts() {
        let tokens = Arc::new(CountingTokens::default());
        let (client, mock) = client_with(
            vec![unauthorized(), unauthorized(), unauthorized(), MockResponse::text("never")],
            tokens.clone(),
        );
        let result = client
            .invoke(&CompletionRequest::default(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(LlmError::Unauthorized(_))));
        assert_eq!(mock.stream_calls(), 3);
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_success_after_refresh_resets_counter() {
        let tokens = Arc::new(CountingTokens::default());
        let (client, mock) = client_with(
            vec![unauthorized(), MockResponse::text("ok")],
            tokens.clone(),
        );
        let result = client
            .invoke(&CompletionRequest::default(), CancellationToken::new())
            .await;
        assert!(result.is_ok());
        assert_eq!(mock.stream_calls(), 2);
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(client.retries(), 0);
    }

    #[tokio::test]
    async fn test_non_auth_error_is_not_retried() {
        let tokens = Arc::new(CountingTokens::default());
        let (client, mock) = client_with(
            vec![MockResponse::Error(LlmError::Network("down".into()))],
            tokens.clone(),
        );
        let result = client
            .invoke(&CompletionRequest::default(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(LlmError::Network(_))));
        assert_eq!(mock.stream_calls(), 1);
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 0);
    }
}
