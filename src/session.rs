//! Document sessions.
//!
//! A [`Session`] owns one uploaded document at a time and answers questions
//! about it. Everything the session returns is a user-facing string:
//! failures become descriptive messages rather than errors, and the index
//! is left intact when a question fails.
//!
//! Uploads are written to a per-session temporary directory that is removed
//! when the session is dropped. The session's index lives in the shared
//! registry under `session:{id}` and is removed by [`Session::close`].

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use tempfile::TempDir;
use tokio::sync::RwLock;
use tracing::Instrument;

use docqa_core::prompt::join_context;
use docqa_core::stream::TextStream;

use crate::answer::NO_RESPONSE;
use crate::extract::extract_file;
use crate::pipeline::RagPipeline;

/// Returned by `ask` and `ask_stream` before any document was ingested.
pub const NO_DOCUMENT: &str = "Please upload and process a document before asking a question.";

/// Returned by `ingest` when extraction yields only whitespace.
pub const NO_TEXT: &str = "The document contains no extractable text.";

/// Returned by an `ingest` that was still running when the session closed.
pub const SESSION_CLOSED: &str = "Session was closed before the document was indexed.";

/// The currently indexed document.
#[derive(Debug, Clone)]
struct Document {
    file_name: String,
    text: String,
    chunk_count: usize,
    model: String,
}

pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    index_key: String,
    pipeline: Arc<RagPipeline>,
    workdir: TempDir,
    document: RwLock<Option<Document>>,
    closed: AtomicBool,
}

impl Session {
    /// Start a session with a fresh id and temporary directory.
    pub fn new(pipeline: Arc<RagPipeline>) -> std::io::Result<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        let workdir = tempfile::Builder::new()
            .prefix(&format!("docqa-{}-", id))
            .tempdir()?;
        tracing::debug!(session = %id, dir = %workdir.path().display(), "session started");
        Ok(Self {
            index_key: format!("session:{}", id),
            id,
            created_at: Utc::now(),
            pipeline,
            workdir,
            document: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn index_key(&self) -> &str {
        &self.index_key
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark the session closed and drop its index. An ingest that is still
    /// running sees the flag after its own `put` and removes the entry again.
    fn release(&self) -> bool {
        self.closed.store(true, Ordering::SeqCst);
        self.pipeline.registry().remove(&self.index_key)
    }

    /// Name of the ingested document, if any.
    pub async fn document_name(&self) -> Option<String> {
        self.document.read().await.as_ref().map(|d| d.file_name.clone())
    }

    /// Character count of the ingested document's text.
    pub async fn document_chars(&self) -> Option<usize> {
        self.document.read().await.as_ref().map(|d| d.text.chars().count())
    }

    /// Store, extract, split, embed and index an upload, replacing the
    /// previous document. Returns a status message.
    pub async fn ingest(&self, file_name: &str, bytes: &[u8]) -> String {
        let file_name = Path::new(file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .unwrap_or("upload")
            .to_string();
        let span = tracing::info_span!("ingest", session = %self.id, file = %file_name);
        self.ingest_document(file_name, bytes).instrument(span).await
    }

    async fn ingest_document(&self, file_name: String, bytes: &[u8]) -> String {
        if self.is_closed() {
            return SESSION_CLOSED.to_string();
        }
        let path = self.workdir.path().join(&file_name);
        if let Err(e) = tokio::fs::write(&path, bytes).await {
            return format!("Error saving upload: {}", e);
        }

        let extract_path = path.clone();
        let extracted = tokio::task::spawn_blocking(move || extract_file(&extract_path)).await;
        // The upload is only needed for extraction.
        let _ = tokio::fs::remove_file(&path).await;
        let text = match extracted {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return format!("Error reading document: {}", e),
            Err(e) => return format!("Error reading document: {}", e),
        };
        if text.trim().is_empty() {
            tracing::warn!("document has no extractable text");
            return NO_TEXT.to_string();
        }

        let embedded = match self.pipeline.chunk_and_embed(&text, None, None, None).await {
            Ok(embedded) => embedded,
            Err(e) => return format!("Error processing document: {}", e),
        };
        let model = embedded.model;
        let chunk_count = match self
            .pipeline
            .build_index(&self.index_key, embedded.chunks, embedded.vectors)
            .await
        {
            Ok(n) => n,
            Err(e) => return format!("Error processing document: {}", e),
        };
        if self.is_closed() {
            self.pipeline.registry().remove(&self.index_key);
            tracing::info!("session closed during ingest; index dropped");
            return SESSION_CLOSED.to_string();
        }

        *self.document.write().await = Some(Document {
            file_name,
            text,
            chunk_count,
            model,
        });
        tracing::info!(chunks = chunk_count, "document indexed");
        format!(
            "Document uploaded and indexed successfully! {} chunks processed.",
            chunk_count
        )
    }

    /// Retrieve context for `question`: the joined matches, or a message.
    async fn context_for(&self, question: &str, top_k: Option<usize>) -> Result<String, String> {
        let model = match self.document.read().await.as_ref() {
            Some(doc) => doc.model.clone(),
            None => return Err(NO_DOCUMENT.to_string()),
        };
        let found = self
            .pipeline
            .query_index(&self.index_key, question, top_k, Some(&model))
            .await
            .map_err(|e| format!("Error fetching context: {}", e))?;
        Ok(join_context(&found.matches))
    }

    /// Answer `question` in one piece.
    pub async fn ask(&self, question: &str, top_k: Option<usize>) -> String {
        let context = match self.context_for(question, top_k).await {
            Ok(context) => context,
            Err(message) => return message,
        };
        match self.pipeline.generator().answer_text(&context, question).await {
            Ok(text) => text,
            Err(message) => format!("Error handling question: {}", message),
        }
    }

    /// Answer `question` incrementally. Each item is the full answer so far;
    /// the stream is finite and ends after at most one error item.
    pub async fn ask_stream(&self, question: &str, top_k: Option<usize>) -> BoxStream<'static, String> {
        let context = match self.context_for(question, top_k).await {
            Ok(context) => context,
            Err(message) => return stream::once(async move { message }).boxed(),
        };
        match self.pipeline.generator().answer_stream(&context, question).await {
            Ok(deltas) => {
                let mut answers = TextStream::cumulative(deltas).peekable();
                // An answer that never produced text still gets one item.
                if std::pin::Pin::new(&mut answers).peek().await.is_none() {
                    return stream::once(async { NO_RESPONSE.to_string() }).boxed();
                }
                answers.boxed()
            }
            Err(message) => stream::once(async move { format!("Streaming error: {}", message) }).boxed(),
        }
    }

    /// Drop the session's index. The temporary directory goes with `self`.
    pub fn close(self) {
        let removed = self.release();
        let chunks = self
            .document
            .try_read()
            .ok()
            .and_then(|d| d.as_ref().map(|d| d.chunk_count));
        tracing::info!(session = %self.id, index_removed = removed, chunks, "session closed");
    }
}

/// Live sessions by id, for the HTTP server.
#[derive(Default)]
pub struct SessionStore {
    sessions: StdRwLock<HashMap<String, Arc<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a new session.
    pub fn open(&self, pipeline: Arc<RagPipeline>) -> std::io::Result<Arc<Session>> {
        let session = Arc::new(Session::new(pipeline)?);
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id().to_string(), Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Unregister a session and release its index. In-flight requests
    /// holding the session keep it alive until they finish; the temporary
    /// directory is removed when the last one does.
    pub fn close(&self, id: &str) -> bool {
        let session = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match session {
            Some(session) => {
                match Arc::try_unwrap(session) {
                    Ok(session) => session.close(),
                    Err(shared) => {
                        shared.release();
                    }
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
