//! Citation rewriting over a live token stream.
//!
//! The model cites passages inline as `<cite>N</cite>` or `<cite>N, p. M</cite>`.
//! [`CitationProcessor::process_chunk`] replaces each marker with a link to
//! the N-th context, holding back any partial marker in the caller-owned
//! [`CitationState`] until the rest of it arrives. Output is the same no
//! matter how the stream is split into chunks.

use crate::conversation::ContextWithMetadata;
use crate::error::{QuillError, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

const OPEN_TAG: &str = "<cite>";
const CLOSE_TAG: &str = "</cite>";

/// A marker whose closing tag does not start within this many bytes of the
/// body is not a marker; its opening tag is emitted as plain text.
const MAX_MARKER_BODY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CitationMode {
    #[default]
    Normal,
    /// `carry` starts with an opening tag whose closing tag hasn't arrived.
    InMarker,
}

/// Per-stream scanner state. Create a fresh one for every stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CitationState {
    pub mode: CitationMode,
    /// Text received but not yet emitted.
    pub carry: String,
}

impl CitationState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Turns a document storage path into a link a reader can open.
#[async_trait]
pub trait LinkSigner: Send + Sync {
    async fn sign(&self, storage_path: &str) -> Result<String>;
}

/// Links stored documents under a fixed file-serving base URL.
pub struct BaseUrlSigner {
    base: Url,
}

impl BaseUrlSigner {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| QuillError::Config(format!("Invalid file base URL '{}': {}", base_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { base })
    }
}

#[async_trait]
impl LinkSigner for BaseUrlSigner {
    async fn sign(&self, storage_path: &str) -> Result<String> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| QuillError::Citation(format!("Base URL cannot hold a path: {}", self.base)))?
            .pop_if_empty()
            .extend(storage_path.split('/').filter(|s| !s.is_empty()));
        Ok(url.to_string())
    }
}

/// Resolves citation markers against one run's ordered context list.
pub struct CitationProcessor {
    contexts: Vec<ContextWithMetadata>,
    signer: Option<Arc<dyn LinkSigner>>,
    /// Link per 1-based index, computed on first use.
    links: HashMap<usize, Option<String>>,
    marker_body: Regex,
}

impl CitationProcessor {
    pub fn new(contexts: Vec<ContextWithMetadata>, signer: Option<Arc<dyn LinkSigner>>) -> Self {
        let marker_body = Regex::new(r"^\s*(\d+)\s*(?:,\s*(?:p\.?|page)\s*(\d+)\s*)?$").expect("Invalid regex");

        Self {
            contexts,
            signer,
            links: HashMap::new(),
            marker_body,
        }
    }

    /// Rewrite one chunk of the raw stream. Partial markers stay in `state`.
    pub async fn process_chunk(&mut self, chunk: &str, state: &mut CitationState) -> String {
        state.carry.push_str(chunk);
        self.drain(state, false).await
    }

    /// Flush whatever `state` still holds at end of stream. Unterminated
    /// markers come out as literal text.
    pub async fn finish(&mut self, state: &mut CitationState) -> String {
        self.drain(state, true).await
    }

    async fn drain(&mut self, state: &mut CitationState, at_end: bool) -> String {
        let mut out = String::new();
        let mut buf = std::mem::take(&mut state.carry);

        loop {
            match state.mode {
                CitationMode::Normal => {
                    if let Some(pos) = buf.find(OPEN_TAG) {
                        out.push_str(&buf[..pos]);
                        buf.drain(..pos);
                        state.mode = CitationMode::InMarker;
                        continue;
                    }

                    let hold = if at_end { 0 } else { partial_tag_len(&buf, OPEN_TAG) };
                    let split = buf.len() - hold;
                    out.push_str(&buf[..split]);
                    state.carry = buf.split_off(split);
                    return out;
                }
                CitationMode::InMarker => {
                    let body = &buf[OPEN_TAG.len()..];
                    let mut window = body.len().min(MAX_MARKER_BODY + CLOSE_TAG.len());
                    while !body.is_char_boundary(window) {
                        window -= 1;
                    }

                    if let Some(close) = body[..window].find(CLOSE_TAG) {
                        // A stray open tag: the marker starts at the last one.
                        if let Some(restart) = body[..close].rfind(OPEN_TAG) {
                            let stray = OPEN_TAG.len() + restart;
                            out.push_str(&buf[..stray]);
                            buf.drain(..stray);
                            continue;
                        }

                        let marker_len = OPEN_TAG.len() + close + CLOSE_TAG.len();
                        let inner = body[..close].to_string();
                        match self.resolve(&inner).await {
                            Some(citation) => out.push_str(&citation),
                            None => {
                                warn!("Unresolvable citation marker: {}", &buf[..marker_len]);
                                out.push_str(&buf[..marker_len]);
                            }
                        }
                        buf.drain(..marker_len);
                        state.mode = CitationMode::Normal;
                        continue;
                    }

                    if at_end || body.len() >= MAX_MARKER_BODY + CLOSE_TAG.len() {
                        out.push_str(OPEN_TAG);
                        buf.drain(..OPEN_TAG.len());
                        state.mode = CitationMode::Normal;
                        continue;
                    }

                    state.carry = buf;
                    return out;
                }
            }
        }
    }

    /// Resolve a marker body like `2` or `2, p. 14`. `None` if malformed or out of range.
    pub async fn resolve(&mut self, body: &str) -> Option<String> {
        let caps = self.marker_body.captures(body)?;
        let index: usize = caps.get(1)?.as_str().parse().ok()?;
        let page_override: Option<u32> = match caps.get(2) {
            Some(page) => Some(page.as_str().parse().ok()?),
            None => None,
        };

        let context = self.contexts.get(index.checked_sub(1)?)?;
        let filename = context.readable_filename.clone();
        let page = page_override.or(context.pagenumber);

        let label = match page {
            Some(page) => format!("{}, p. {}", filename, page),
            None => filename,
        };

        Some(match self.link_for(index).await {
            Some(link) => format!("[{}]({})", label, link),
            None => format!("[{}]", label),
        })
    }

    async fn link_for(&mut self, index: usize) -> Option<String> {
        if let Some(link) = self.links.get(&index) {
            return link.clone();
        }

        let context = self.contexts.get(index - 1)?;
        let link = match (&context.url, &context.s3_path, &self.signer) {
            (Some(url), _, _) => Some(url.clone()),
            (None, Some(path), Some(signer)) => match signer.sign(path).await {
                Ok(link) => Some(link),
                Err(e) => {
                    warn!("Failed to link citation {}: {}", index, e);
                    None
                }
            },
            _ => None,
        };

        debug!("Resolved link for citation {}", index);
        self.links.insert(index, link.clone());
        link
    }
}

/// Length of the longest proper prefix of `tag` that `text` ends with.
fn partial_tag_len(text: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&k| text.ends_with(&tag[..k]))
        .unwrap_or(0)
}
