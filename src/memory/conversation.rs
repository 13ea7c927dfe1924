//! 对话消息
//!
//! Message 一旦追加到会话即不可变；会话内按追加顺序排列，只追加不重排。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// 格式化为 `[role]: content` 行，供摘要 / 规划 prompt 使用
pub fn format_messages(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("[{}]: {}\n", m.role.as_str(), m.content))
        .collect()
}

/// 粗略估算 token 数（按字节数 / 2，中英文混排时偏保守）
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_messages() {
        let msgs = vec![Message::user("hello"), Message::assistant("hi")];
        assert_eq!(format_messages(&msgs), "[user]: hello\n[assistant]: hi\n");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::system("x")).unwrap();
        assert!(json.contains(r#""role":"system""#));
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("abcdefgh"), 4);
        assert_eq!(estimate_tokens(""), 0);
    }
}
