//! 记忆层：对话消息、会话存储、滑动窗口摘要、知识库检索

pub mod conversation;
pub mod rag;
pub mod session;
pub mod tokenizer;
pub mod window;

pub use conversation::{estimate_tokens, format_messages, Message, Role};
pub use rag::{
    format_context, split_into_chunks, Document, InMemoryVectorStore, KeywordReranker,
    RagService, Reranker, Retriever, VectorStore,
};
pub use session::{Session, SessionKey, SessionStore};
pub use window::{LlmSummarizer, MemoryContext, SlidingWindowMemory, Summarizer};
