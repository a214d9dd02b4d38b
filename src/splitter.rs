use std::fs;
use std::path::{Path, PathBuf};

use regex::RegexBuilder;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::classifier::keyword_in_text;
use crate::errors::{PipelineError, Result};
use crate::types::DocumentType;

const DEFAULT_MINIMUM_SCORE: f64 = 0.3;

/// anchor signature as declared in signatures.yaml
#[derive(Debug, Clone, Deserialize)]
pub struct AnchorSignature {
    pub doc_type: String,
    #[serde(default)]
    pub required_keywords: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub regex_patterns: Vec<String>,
    #[serde(default = "default_minimum_score")]
    pub minimum_score: f64,
}

fn default_minimum_score() -> f64 {
    DEFAULT_MINIMUM_SCORE
}

#[derive(Debug, Deserialize)]
struct SignatureFile {
    signatures: Vec<AnchorSignature>,
}

struct CompiledSignature {
    doc_type: DocumentType,
    required_keywords: Vec<String>,
    keywords: Vec<String>,
    patterns: Vec<regex::Regex>,
    minimum_score: f64,
}

/// loaded anchor signature table
pub struct SignatureSet {
    signatures: Vec<CompiledSignature>,
}

impl SignatureSet {
    /// load and compile signatures.yaml; unknown doc types and bad patterns
    /// are registration-time errors
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::SignaturesMissing {
                path: path.to_path_buf(),
            });
        }
        let raw = fs::read_to_string(path)?;
        let file: SignatureFile = serde_yaml::from_str(&raw)?;
        let mut signatures = Vec::with_capacity(file.signatures.len());
        for sig in file.signatures {
            let doc_type = DocumentType::from_label(&sig.doc_type).ok_or_else(|| {
                PipelineError::UnknownSignatureType {
                    doc_type: sig.doc_type.clone(),
                    path: path.to_path_buf(),
                }
            })?;
            let mut patterns = Vec::with_capacity(sig.regex_patterns.len());
            for pattern in &sig.regex_patterns {
                let re = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| PipelineError::InvalidPattern {
                        pattern: pattern.clone(),
                        message: e.to_string(),
                    })?;
                patterns.push(re);
            }
            signatures.push(CompiledSignature {
                doc_type,
                required_keywords: sig.required_keywords,
                keywords: sig.keywords,
                patterns,
                minimum_score: sig.minimum_score,
            });
        }
        debug!(count = signatures.len(), path = %path.display(), "loaded anchor signatures");
        Ok(Self { signatures })
    }

    /// score page text against every signature; highest score above its
    /// minimum wins
    pub fn match_page(&self, text: &str) -> Option<(DocumentType, f64)> {
        if text.trim().is_empty() {
            return None;
        }
        let text_lower = text.to_lowercase();

        let mut best: Option<(DocumentType, f64)> = None;
        for sig in &self.signatures {
            if !sig.required_keywords.is_empty()
                && !sig
                    .required_keywords
                    .iter()
                    .all(|kw| keyword_in_text(kw, &text_lower))
            {
                continue;
            }
            let keyword_hits = sig
                .keywords
                .iter()
                .filter(|kw| keyword_in_text(kw, &text_lower))
                .count();
            let regex_hits = sig.patterns.iter().filter(|re| re.is_match(text)).count();

            let total_possible = sig.keywords.len() + sig.patterns.len() * 2;
            if total_possible == 0 {
                continue;
            }
            let score = (keyword_hits + regex_hits * 2) as f64 / total_possible as f64;
            if score >= sig.minimum_score && best.map_or(true, |(_, s)| score > s) {
                best = Some((sig.doc_type, score));
            }
        }
        best
    }
}

/// per-page text access for a loaded pdf; the pdf library stays behind this port
pub trait PageSource {
    fn page_count(&self) -> usize;
    /// native (embedded) text of a page
    fn native_text(&self, index: usize) -> Result<String>;
    /// ocr of the top 30% of the rendered page; empty when no ocr backend
    fn ocr_header_text(&self, index: usize) -> Result<String>;
}

/// chunk pdf writer port
pub trait ChunkSink {
    fn write_chunk(&mut self, index: usize, doc_type: DocumentType, pages: &[usize])
        -> Result<PathBuf>;
}

/// one contiguous page group belonging to a single document type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageGroup {
    pub doc_type: DocumentType,
    pub pages: Vec<usize>,
}

/// "anchor & continuity" multi-document splitter
pub struct DocumentSplitter {
    signatures: SignatureSet,
    min_text_len: usize,
}

impl DocumentSplitter {
    pub fn new(signatures: SignatureSet, min_text_len: usize) -> Self {
        Self {
            signatures,
            min_text_len,
        }
    }

    fn page_text(&self, source: &dyn PageSource, index: usize) -> Result<(String, &'static str)> {
        let text = source.native_text(index)?;
        if text.trim().len() >= self.min_text_len {
            return Ok((text, "native"));
        }
        let ocr = source.ocr_header_text(index)?;
        if ocr.trim().is_empty() {
            if text.trim().is_empty() {
                Ok((text, "empty"))
            } else {
                Ok((text, "native"))
            }
        } else {
            Ok((ocr, "ocr"))
        }
    }

    /// partition pages into contiguous typed groups
    ///
    /// every page lands in exactly one group, order preserved; an unmatched
    /// first page opens an Unknown group
    pub fn group_pages(&self, source: &dyn PageSource) -> Result<Vec<PageGroup>> {
        let total = source.page_count();
        info!(pages = total, "scanning for anchors");

        let mut groups: Vec<PageGroup> = Vec::new();
        for index in 0..total {
            let (text, method) = self.page_text(source, index)?;
            match self.signatures.match_page(&text) {
                Some((doc_type, score)) => {
                    info!(page = index, doc_type = %doc_type, score, method, "anchor");
                    groups.push(PageGroup {
                        doc_type,
                        pages: vec![index],
                    });
                }
                None => match groups.last_mut() {
                    Some(group) => {
                        debug!(page = index, doc_type = %group.doc_type, "continuation");
                        group.pages.push(index);
                    }
                    None => {
                        warn!(page = index, "no anchor on first page, opening Unknown group");
                        groups.push(PageGroup {
                            doc_type: DocumentType::Unknown,
                            pages: vec![index],
                        });
                    }
                },
            }
        }
        Ok(groups)
    }

    /// split into chunk pdfs through the sink; returns chunk paths in order
    pub fn split(&self, source: &dyn PageSource, sink: &mut dyn ChunkSink) -> Result<Vec<PathBuf>> {
        let groups = self.group_pages(source)?;
        let mut paths = Vec::with_capacity(groups.len());
        for (i, group) in groups.iter().enumerate() {
            let path = sink.write_chunk(i, group.doc_type, &group.pages)?;
            info!(chunk = i, doc_type = %group.doc_type,
                  pages = ?group.pages, path = %path.display(), "chunk written");
            paths.push(path);
        }
        Ok(paths)
    }

    /// fast mega-pdf heuristic: sample up to 5 evenly-spaced pages and look
    /// for more than one matched document type
    pub fn is_mega(&self, source: &dyn PageSource) -> Result<bool> {
        let total = source.page_count();
        if total <= 1 {
            return Ok(false);
        }
        let sample: Vec<usize> = if total <= 5 {
            (0..total).collect()
        } else {
            let mut indices = vec![0, total / 4, total / 2, 3 * total / 4, total - 1];
            indices.sort_unstable();
            indices.dedup();
            indices
        };

        let mut detected: Vec<DocumentType> = Vec::new();
        for index in sample {
            let (text, _) = self.page_text(source, index)?;
            if let Some((doc_type, score)) = self.signatures.match_page(&text) {
                debug!(page = index, doc_type = %doc_type, score, "mega sample hit");
                if !detected.contains(&doc_type) {
                    detected.push(doc_type);
                }
            }
        }
        Ok(detected.len() > 1)
    }
}

/// chunk sink writing placeholder chunk files into a directory
///
/// real deployments implement `ChunkSink` over their pdf library; this sink
/// records the page partition so downstream stages can re-read it
pub struct DirectoryChunkSink {
    dir: PathBuf,
}

impl DirectoryChunkSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ChunkSink for DirectoryChunkSink {
    fn write_chunk(
        &mut self,
        index: usize,
        doc_type: DocumentType,
        pages: &[usize],
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let filename = format!("chunk_{index:03}_{}.pdf", doc_type.safe_name());
        let path = self.dir.join(filename);
        let listing: Vec<String> = pages.iter().map(|p| p.to_string()).collect();
        fs::write(&path, listing.join(","))?;
        Ok(path)
    }
}
