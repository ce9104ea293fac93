//! Hive - 编码智能体回合编排核心
//!
//! 入口：初始化日志、构建编排器与命令循环，从 stdin 读取输入（行式 REPL），并在每次 Run 结束时打印新消息。

use std::sync::Arc;

use anyhow::Context;
use hive::chat::{new_id, Message, Part, Role, ToolCallState};
use hive::core::{create_orchestrator_builder, spawn_command_loop, AppState, Command};
use hive::observability;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{oneshot, watch};

const HELP: &str = "commands: /undo  /retry  /abort  /answer <tool_call_id> <text>  /quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let builder = create_orchestrator_builder(None).context("Failed to prepare orchestrator")?;
    let orchestrator = Arc::new(builder.build());
    let chat_id = new_id();

    let (cmd_tx, loop_handle) = spawn_command_loop(orchestrator.clone(), chat_id.clone());
    let printer = tokio::spawn(print_updates(orchestrator.store().subscribe(), chat_id.clone()));

    println!("hive ready. {HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let command = match line.split_once(' ').map_or((line, ""), |(c, rest)| (c, rest.trim())) {
            ("/quit", _) => {
                let _ = cmd_tx.send(Command::Quit);
                break;
            }
            ("/abort", _) => Command::Abort,
            ("/retry", _) => Command::Retry,
            ("/undo", _) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                cmd_tx
                    .send(Command::Undo(reply_tx))
                    .context("Command loop stopped")?;
                match reply_rx.await.context("Command loop dropped undo reply")? {
                    Ok(Some(text)) => println!("(rolled back to: {text})"),
                    Ok(None) => println!("(nothing to undo)"),
                    Err(e) => println!("(undo failed: {e})"),
                }
                continue;
            }
            ("/answer", rest) => match rest.split_once(' ') {
                Some((tool_call_id, text)) => Command::SubmitToolResult {
                    tool_call_id: tool_call_id.to_string(),
                    output: serde_json::Value::String(text.trim().to_string()),
                },
                None => {
                    println!("usage: /answer <tool_call_id> <text>");
                    continue;
                }
            },
            (cmd, _) if cmd.starts_with('/') => {
                println!("unknown command. {HELP}");
                continue;
            }
            _ => Command::Submit(line.to_string()),
        };
        cmd_tx.send(command).context("Command loop stopped")?;
    }

    drop(cmd_tx);
    loop_handle.await.context("Command loop panicked")?;
    printer.abort();
    Ok(())
}

/// 对话空闲时打印新增消息与新出现的错误
async fn print_updates(mut rx: watch::Receiver<AppState>, chat_id: String) {
    let mut printed = 0usize;
    let mut last_error = None;
    let mut title_shown = false;

    while rx.changed().await.is_ok() {
        let Some(chat) = rx.borrow_and_update().chat(&chat_id).cloned() else {
            continue;
        };
        if !title_shown {
            if let Some(title) = &chat.title {
                println!("# {title}");
                title_shown = true;
            }
        }
        // 撤销会截断历史
        printed = printed.min(chat.messages.len());
        if chat.is_working {
            continue;
        }

        for message in &chat.messages[printed..] {
            print_message(message);
        }
        printed = chat.messages.len();

        let error = chat.error.map(|e| e.message);
        if error.is_some() && error != last_error {
            println!("! {}", error.as_deref().unwrap_or_default());
        }
        last_error = error;
    }
}

fn print_message(message: &Message) {
    if message.role == Role::User {
        return;
    }
    for part in &message.parts {
        match part {
            Part::Text { text } => println!("{text}"),
            Part::Reasoning { text } => println!("(thinking) {text}"),
            Part::File { url, .. } => println!("[file] {url}"),
            Part::ToolCall(tc) => match &tc.state {
                ToolCallState::OutputAvailable { output } => {
                    println!("[{} {}] {}", tc.tool_name, tc.tool_call_id, output)
                }
                ToolCallState::OutputError { error_text } => {
                    println!("[{} {}] error: {}", tc.tool_name, tc.tool_call_id, error_text)
                }
                ToolCallState::InputAvailable | ToolCallState::InputStreaming => println!(
                    "[{} {}] waiting: {}  (reply with /answer {} <text>)",
                    tc.tool_name, tc.tool_call_id, tc.input, tc.tool_call_id
                ),
            },
        }
    }
}
