//! RAG（检索增强）
//!
//! 知识库文档分块 → 向量化 → 存入向量库；对话时按用户问题检索相关片段，拼进规划上下文。
//! 检索是尽力而为的：Agent 把检索失败当作“没有额外上下文”。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::AgentError;
use crate::llm::EmbeddingProvider;
use crate::memory::tokenizer::tokenize;

/// 检索到的文档片段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub score: f32,
}

impl Document {
    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").map(String::as_str)
    }
}

/// 检索协作方：Agent 只依赖这个 trait
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Document>, AgentError>;
}

/// 按字符切块，相邻块重叠 overlap 个字符。chunk_size 为 0 时整段返回
pub fn split_into_chunks(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    if chunk_size == 0 || chars.len() <= chunk_size {
        return vec![text.to_string()];
    }

    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// 余弦相似度；维度不一致或零向量时为 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// 向量库
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn insert(&self, doc: Document, embedding: Vec<f32>) -> Result<(), String>;

    /// 按相似度降序返回最多 top_k 条，score 为相似度
    async fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<Document>, String>;

    /// 删除某来源的全部片段，返回删除条数
    async fn delete_by_source(&self, source: &str) -> Result<usize, String>;

    async fn len(&self) -> usize;
}

/// 进程内向量库：线性扫描 + 余弦相似度；超过 max_entries 时淘汰最早写入的条目
pub struct InMemoryVectorStore {
    entries: RwLock<Vec<(Document, Vec<f32>)>>,
    max_entries: usize,
}

impl InMemoryVectorStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            max_entries: max_entries.max(1),
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn insert(&self, doc: Document, embedding: Vec<f32>) -> Result<(), String> {
        if embedding.is_empty() {
            return Err(format!("empty embedding for {}", doc.id));
        }
        let mut entries = self.entries.write().await;
        entries.retain(|(d, _)| d.id != doc.id);
        entries.push((doc, embedding));
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(0..excess);
        }
        Ok(())
    }

    async fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<Document>, String> {
        let entries = self.entries.read().await;
        let mut scored: Vec<Document> = entries
            .iter()
            .map(|(doc, emb)| Document {
                score: cosine_similarity(embedding, emb),
                ..doc.clone()
            })
            .filter(|doc| doc.score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn delete_by_source(&self, source: &str) -> Result<usize, String> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(d, _)| d.source() != Some(source));
        Ok(before - entries.len())
    }

    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// 重排器：对向量召回的候选重新排序
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, docs: Vec<Document>) -> Result<Vec<Document>, String>;
}

/// 关键词重排：命中查询词比例与向量分数各占一半
#[derive(Debug, Default, Clone)]
pub struct KeywordReranker;

#[async_trait]
impl Reranker for KeywordReranker {
    async fn rerank(&self, query: &str, mut docs: Vec<Document>) -> Result<Vec<Document>, String> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Ok(docs);
        }
        for doc in &mut docs {
            let content = doc.content.to_lowercase();
            let hits = terms.iter().filter(|t| content.contains(t.as_str())).count();
            let overlap = hits as f32 / terms.len() as f32;
            doc.score = 0.5 * doc.score + 0.5 * overlap;
        }
        docs.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(docs)
    }
}

fn collect_text_files(dir: &Path) -> Result<Vec<PathBuf>, AgentError> {
    if !dir.is_dir() {
        return Err(AgentError::RetrievalFailed(format!(
            "knowledge dir {} not found",
            dir.display()
        )));
    }
    Ok(walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            matches!(
                e.path().extension().and_then(|x| x.to_str()),
                Some("md") | Some("txt")
            )
        })
        .map(|e| e.into_path())
        .collect())
}

/// 检索服务：分块 + 向量化 + 向量库 + 可选重排
pub struct RagService {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    reranker: Option<Arc<dyn Reranker>>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl RagService {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            embedder,
            store,
            reranker: None,
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }

    pub fn with_chunking(mut self, chunk_size: usize, chunk_overlap: usize) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_overlap = chunk_overlap;
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// 索引一篇文档，返回写入的片段数。同一来源重复索引时先删旧片段
    pub async fn index_document(
        &self,
        content: &str,
        metadata: HashMap<String, String>,
    ) -> Result<usize, AgentError> {
        let mut metadata = metadata;
        let source = metadata
            .entry("source".to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();

        let chunks = split_into_chunks(content, self.chunk_size, self.chunk_overlap);
        if chunks.is_empty() {
            return Ok(0);
        }

        let embeddings = self
            .embedder
            .embed_batch(&chunks)
            .await
            .map_err(AgentError::RetrievalFailed)?;
        if embeddings.len() != chunks.len() {
            return Err(AgentError::RetrievalFailed(format!(
                "embedding count mismatch: {} chunks, {} vectors",
                chunks.len(),
                embeddings.len()
            )));
        }

        self.store
            .delete_by_source(&source)
            .await
            .map_err(AgentError::RetrievalFailed)?;

        let count = chunks.len();
        for (i, (chunk, embedding)) in chunks.into_iter().zip(embeddings).enumerate() {
            let mut meta = metadata.clone();
            meta.insert("chunk_index".to_string(), i.to_string());
            let doc = Document {
                id: format!("{}_{}", source, i),
                content: chunk,
                metadata: meta,
                score: 0.0,
            };
            self.store
                .insert(doc, embedding)
                .await
                .map_err(AgentError::RetrievalFailed)?;
        }

        tracing::debug!(source = %source, chunks = count, "document indexed");
        Ok(count)
    }

    /// 递归索引目录下的 .md / .txt 文件（跳过隐藏目录），source 为相对路径。单个文件失败只记录日志
    pub async fn index_dir(&self, dir: &Path) -> Result<usize, AgentError> {
        let root = dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || collect_text_files(&root))
            .await
            .map_err(|e| AgentError::RetrievalFailed(e.to_string()))??;

        let mut indexed = 0;
        for path in files {
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("skip {}: {}", path.display(), e);
                    continue;
                }
            };
            let source = path
                .strip_prefix(dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            let metadata = HashMap::from([("source".to_string(), source)]);
            match self.index_document(&content, metadata).await {
                Ok(_) => indexed += 1,
                Err(e) => tracing::warn!("index {} failed: {}", path.display(), e),
            }
        }

        tracing::info!(files = indexed, dir = %dir.display(), "knowledge base indexed");
        Ok(indexed)
    }

    /// 召回 2*top_k 条候选，重排（失败则保持向量顺序），截断到 top_k
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Document>, AgentError> {
        if query.trim().is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(AgentError::RetrievalFailed)?;
        let mut docs = self
            .store
            .search(&embedding, top_k * 2)
            .await
            .map_err(AgentError::RetrievalFailed)?;

        if let Some(reranker) = &self.reranker {
            match reranker.rerank(query, docs.clone()).await {
                Ok(reranked) => docs = reranked,
                Err(e) => tracing::warn!("rerank failed, using vector order: {}", e),
            }
        }

        docs.truncate(top_k);
        Ok(docs)
    }
}

#[async_trait]
impl Retriever for RagService {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Document>, AgentError> {
        RagService::retrieve(self, query, top_k).await
    }
}

/// 检索结果拼成上下文文本：`[i] content` + 缩进的 source 行
pub fn format_context(docs: &[Document]) -> String {
    let mut out = String::new();
    for (i, doc) in docs.iter().enumerate() {
        out.push_str(&format!("[{}] {}\n", i + 1, doc.content));
        if let Some(source) = doc.source() {
            out.push_str(&format!("   source: {}\n", source));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 按关键词出现与否生成固定维度向量
    struct BagOfWordsEmbedder;

    const VOCAB: [&str; 4] = ["redis", "mysql", "timeout", "disk"];

    #[async_trait]
    impl EmbeddingProvider for BagOfWordsEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
            let lower = text.to_lowercase();
            Ok(VOCAB
                .iter()
                .map(|w| if lower.contains(w) { 1.0 } else { 0.0 })
                .chain(std::iter::once(0.1))
                .collect())
        }
    }

    struct FailingReranker;

    #[async_trait]
    impl Reranker for FailingReranker {
        async fn rerank(&self, _: &str, _: Vec<Document>) -> Result<Vec<Document>, String> {
            Err("reranker down".to_string())
        }
    }

    fn service() -> RagService {
        RagService::new(
            Arc::new(BagOfWordsEmbedder),
            Arc::new(InMemoryVectorStore::new(100)),
        )
        .with_chunking(1000, 0)
    }

    fn meta(source: &str) -> HashMap<String, String> {
        HashMap::from([("source".to_string(), source.to_string())])
    }

    #[test]
    fn test_split_into_chunks_overlap() {
        let chunks = split_into_chunks("0123456789abcdefghij", 10, 2);
        assert_eq!(chunks, vec!["0123456789", "89abcdefgh", "ghij"]);
    }

    #[test]
    fn test_split_into_chunks_edge_cases() {
        assert!(split_into_chunks("", 10, 2).is_empty());
        assert_eq!(split_into_chunks("short", 10, 2), vec!["short"]);
        assert_eq!(split_into_chunks("abcdef", 0, 0), vec!["abcdef"]);
        // overlap >= size 时仍能前进
        assert_eq!(split_into_chunks("abcd", 2, 5).len(), 3);
        // 按字符而非字节切分
        assert_eq!(split_into_chunks("数据库连接超时", 4, 1), vec!["数据库连", "连接超时"]);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_index_and_retrieve() {
        let rag = service();
        rag.index_document("Redis timeout: check maxclients", meta("redis.md"))
            .await
            .unwrap();
        rag.index_document("Disk full on mysql host", meta("disk.md"))
            .await
            .unwrap();

        let docs = rag.retrieve("redis timeout", 1).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "redis.md_0");
        assert_eq!(docs[0].source(), Some("redis.md"));
    }

    #[tokio::test]
    async fn test_reindex_same_source_replaces() {
        let rag = service().with_chunking(10, 0);
        let n = rag
            .index_document("redis redis redis redis", meta("a.md"))
            .await
            .unwrap();
        assert_eq!(n, 3);
        rag.index_document("disk", meta("a.md")).await.unwrap();
        assert_eq!(rag.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_rerank_failure_falls_back_to_vector_order() {
        let rag = service().with_reranker(Arc::new(FailingReranker));
        rag.index_document("mysql timeout", meta("m.md")).await.unwrap();
        let docs = rag.retrieve("mysql", 5).await.unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn test_keyword_reranker_prefers_term_hits() {
        let docs = vec![
            Document {
                id: "a".into(),
                content: "nothing relevant".into(),
                score: 0.6,
                ..Default::default()
            },
            Document {
                id: "b".into(),
                content: "payment-api latency".into(),
                score: 0.5,
                ..Default::default()
            },
        ];
        let out = KeywordReranker.rerank("payment-api latency", docs).await.unwrap();
        assert_eq!(out[0].id, "b");
    }

    #[tokio::test]
    async fn test_keyword_reranker_segments_chinese_query() {
        let docs = vec![
            Document {
                id: "a".into(),
                content: "磁盘空间不足".into(),
                score: 0.55,
                ..Default::default()
            },
            Document {
                id: "b".into(),
                content: "数据库连接超时：检查连接池".into(),
                score: 0.5,
                ..Default::default()
            },
        ];
        let out = KeywordReranker.rerank("数据库连接超时怎么办", docs).await.unwrap();
        assert_eq!(out[0].id, "b");
        assert!(out[0].score > out[1].score);
    }

    #[tokio::test]
    async fn test_empty_query_returns_nothing() {
        let rag = service();
        rag.index_document("redis", meta("r.md")).await.unwrap();
        assert!(rag.retrieve("  ", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_dir_only_text_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("redis.md"), "redis runbook").unwrap();
        std::fs::create_dir(dir.path().join("db")).unwrap();
        std::fs::write(dir.path().join("db").join("mysql.txt"), "mysql runbook").unwrap();
        std::fs::write(dir.path().join("image.png"), [0u8, 1, 2]).unwrap();

        let rag = service();
        assert_eq!(rag.index_dir(dir.path()).await.unwrap(), 2);
        let docs = rag.retrieve("mysql", 1).await.unwrap();
        assert!(docs[0].source().unwrap().ends_with("mysql.txt"));
    }

    #[tokio::test]
    async fn test_index_dir_skips_hidden_and_rejects_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git").join("notes.md"), "secret").unwrap();
        std::fs::write(dir.path().join("api.md"), "api runbook").unwrap();

        let rag = service();
        assert_eq!(rag.index_dir(dir.path()).await.unwrap(), 1);
        assert!(rag.index_dir(&dir.path().join("absent")).await.is_err());
    }

    #[test]
    fn test_format_context() {
        let docs = vec![Document {
            id: "x_0".into(),
            content: "restart the pod".into(),
            metadata: meta("k8s.md"),
            score: 0.9,
        }];
        assert_eq!(
            format_context(&docs),
            "[1] restart the pod\n   source: k8s.md\n\n"
        );
        assert_eq!(format_context(&[]), "");
    }
}
