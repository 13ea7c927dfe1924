//! OnCall 命令行
//!
//! 从标准输入逐行读取问题，以流式方式打印每个步骤的进度。输入 quit / exit 或 Ctrl+C 退出。

use std::io::Write;

use anyhow::Context;
use oncall::agent::{build_agent, ChatRequest};
use oncall::config::load_config;
use oncall::core::{ShutdownManager, ShutdownReason};
use oncall::observability;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    observability::init(&cfg.log);

    let agent = build_agent(&cfg).await.context("Failed to create agent")?;

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();
    let cleanup = agent
        .sessions()
        .start_cleanup(cfg.session.cleanup_interval(), shutdown.token());

    let user_id = std::env::var("USER").unwrap_or_else(|_| "local".to_string());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("OnCall 已就绪，输入问题开始排查（quit 退出）");
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let line = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input, "quit" | "exit") {
            shutdown.shutdown(ShutdownReason::UserInitiated);
            break;
        }

        let req = ChatRequest::new(user_id.as_str(), "cli", input);
        let cancel = shutdown.child_token();
        let result = agent
            .chat_stream(&req, &cancel, &mut |chunk: &str| {
                print!("{}", chunk);
                std::io::stdout().flush().ok();
            })
            .await;
        if let Err(e) = result {
            tracing::debug!(code = e.code(), "request failed: {}", e);
        }
        println!();
    }

    shutdown.shutdown(ShutdownReason::UserInitiated);
    cleanup.await.ok();
    Ok(())
}
