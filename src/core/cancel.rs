//! 取消传播：把调用方的 CancellationToken 接到任意慢调用（LLM、检索、工具）上

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::core::AgentError;

/// 在 token 被取消前等待 fut 完成；取消时丢弃 fut 并返回 AgentError::Cancelled
pub async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T, AgentError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        let out = cancellable(&token, async { 42 }).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_slow_future() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            child.cancel();
        });
        let res = cancellable(&token, tokio::time::sleep(Duration::from_secs(30))).await;
        assert!(matches!(res, Err(AgentError::Cancelled)));
    }
}
