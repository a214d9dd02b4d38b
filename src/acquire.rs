use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{info, warn};

use crate::classifier::{is_image, is_pdf};
use crate::errors::{PipelineError, Result};
use crate::types::RecommendedExtractor;

/// structured markdown renderer port (table fences preserved)
pub trait StructuredRenderer {
    fn render_markdown(&self, pdf: &Path) -> Result<String>;
}

/// ocr renderer port (line-oriented text with table markers)
pub trait OcrRenderer {
    fn render_text(&self, pdf: &Path) -> Result<String>;
}

/// image-to-pdf conversion port
pub trait ImageToPdf {
    fn convert(&self, image: &Path, out: &Path) -> Result<()>;
}

/// shape of acquired text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextShape {
    Markdown,
    OcrText,
}

/// acquisition outcome with its method marker
#[derive(Debug, Clone)]
pub struct AcquiredText {
    pub text: String,
    pub shape: TextShape,
    pub method: &'static str,
}

/// converts inputs to pdf and renders text through the configured backends
///
/// owns a process-scoped temp directory for converted images; the directory
/// is removed when the acquirer is dropped, success or failure
pub struct TextAcquirer {
    temp: TempDir,
    min_text_len: usize,
    image_to_pdf: Option<Box<dyn ImageToPdf>>,
    structured: Option<Box<dyn StructuredRenderer>>,
    ocr: Option<Box<dyn OcrRenderer>>,
}

impl TextAcquirer {
    pub fn new(min_text_len: usize) -> Result<Self> {
        Ok(Self {
            temp: TempDir::new()?,
            min_text_len,
            image_to_pdf: None,
            structured: None,
            ocr: None,
        })
    }

    pub fn with_image_to_pdf(mut self, converter: Box<dyn ImageToPdf>) -> Self {
        self.image_to_pdf = Some(converter);
        self
    }

    pub fn with_structured(mut self, renderer: Box<dyn StructuredRenderer>) -> Self {
        self.structured = Some(renderer);
        self
    }

    pub fn with_ocr(mut self, renderer: Box<dyn OcrRenderer>) -> Self {
        self.ocr = Some(renderer);
        self
    }

    /// ensure the input is a pdf, converting images into the temp directory
    ///
    /// pdfs pass through untouched; unsupported extensions and missing files
    /// fail the run
    pub fn ensure_pdf(&self, path: &Path) -> Result<PathBuf> {
        if !path.exists() {
            return Err(PipelineError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        if is_pdf(path) {
            return Ok(path.to_path_buf());
        }
        if is_image(path) {
            let converter =
                self.image_to_pdf
                    .as_ref()
                    .ok_or_else(|| PipelineError::RendererUnavailable {
                        concern: "image-to-pdf conversion".to_string(),
                    })?;
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "converted".to_string());
            let out = self.temp.path().join(format!("{stem}.pdf"));
            converter.convert(path, &out)?;
            info!(input = %path.display(), output = %out.display(), "converted image to pdf");
            return Ok(out);
        }
        Err(PipelineError::UnsupportedFileType {
            extension: path
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default(),
        })
    }

    /// acquire text for an already-pdf input
    ///
    /// the structured path is taken only when recommended and the document is
    /// not image-sourced; a low structured yield retries with ocr; a missing
    /// ocr backend degrades to empty text with the `no-renderer` marker
    pub fn acquire(
        &self,
        pdf: &Path,
        recommendation: RecommendedExtractor,
        image_sourced: bool,
    ) -> Result<AcquiredText> {
        if recommendation == RecommendedExtractor::Structured && !image_sourced {
            if let Some(renderer) = &self.structured {
                let markdown = renderer.render_markdown(pdf)?;
                if markdown.trim().len() >= self.min_text_len {
                    return Ok(AcquiredText {
                        text: markdown,
                        shape: TextShape::Markdown,
                        method: "structured",
                    });
                }
                warn!(path = %pdf.display(), "structured extraction below minimum yield, retrying with ocr");
            }
        }

        match &self.ocr {
            Some(renderer) => {
                let text = renderer.render_text(pdf)?;
                let method = if text.trim().is_empty() { "ocr-empty" } else { "ocr" };
                Ok(AcquiredText {
                    text,
                    shape: TextShape::OcrText,
                    method,
                })
            }
            None => {
                warn!(path = %pdf.display(), "no ocr renderer configured, returning empty text");
                Ok(AcquiredText {
                    text: String::new(),
                    shape: TextShape::OcrText,
                    method: "no-renderer",
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct FixedMarkdown(String);

    impl StructuredRenderer for FixedMarkdown {
        fn render_markdown(&self, _pdf: &Path) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct FixedOcr(String);

    impl OcrRenderer for FixedOcr {
        fn render_text(&self, _pdf: &Path) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct CopyConverter;

    impl ImageToPdf for CopyConverter {
        fn convert(&self, image: &Path, out: &Path) -> Result<()> {
            fs::copy(image, out)?;
            Ok(())
        }
    }

    fn temp_file(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, b"stub").unwrap();
        path
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let acquirer = TextAcquirer::new(50).unwrap();
        let err = acquirer.ensure_pdf(Path::new("/nonexistent/file.pdf")).unwrap_err();
        assert!(matches!(err, PipelineError::FileNotFound { .. }));
    }

    #[test]
    fn test_unsupported_extension_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = temp_file(&dir, "notes.docx");
        let acquirer = TextAcquirer::new(50).unwrap();
        let err = acquirer.ensure_pdf(&path).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFileType { .. }));
    }

    #[test]
    fn test_pdf_passthrough() {
        let dir = TempDir::new().unwrap();
        let path = temp_file(&dir, "doc.pdf");
        let acquirer = TextAcquirer::new(50).unwrap();
        assert_eq!(acquirer.ensure_pdf(&path).unwrap(), path);
    }

    #[test]
    fn test_image_converted_into_temp_dir() {
        let dir = TempDir::new().unwrap();
        let path = temp_file(&dir, "scan.jpg");
        let acquirer = TextAcquirer::new(50)
            .unwrap()
            .with_image_to_pdf(Box::new(CopyConverter));
        let out = acquirer.ensure_pdf(&path).unwrap();
        assert!(out.exists());
        assert_eq!(out.extension().unwrap(), "pdf");
        assert_ne!(out, path);
    }

    #[test]
    fn test_structured_path_selected() {
        let markdown = "| A | B |\n|---|---|\n| 1 | 2 |\nplenty of markdown content here".to_string();
        let acquirer = TextAcquirer::new(10)
            .unwrap()
            .with_structured(Box::new(FixedMarkdown(markdown.clone())))
            .with_ocr(Box::new(FixedOcr("ocr text".to_string())));
        let acquired = acquirer
            .acquire(Path::new("x.pdf"), RecommendedExtractor::Structured, false)
            .unwrap();
        assert_eq!(acquired.shape, TextShape::Markdown);
        assert_eq!(acquired.method, "structured");
        assert_eq!(acquired.text, markdown);
    }

    #[test]
    fn test_low_yield_falls_back_to_ocr() {
        let acquirer = TextAcquirer::new(50)
            .unwrap()
            .with_structured(Box::new(FixedMarkdown("tiny".to_string())))
            .with_ocr(Box::new(FixedOcr("real ocr body".to_string())));
        let acquired = acquirer
            .acquire(Path::new("x.pdf"), RecommendedExtractor::Structured, false)
            .unwrap();
        assert_eq!(acquired.shape, TextShape::OcrText);
        assert_eq!(acquired.method, "ocr");
    }

    #[test]
    fn test_image_sourced_never_uses_structured() {
        let acquirer = TextAcquirer::new(10)
            .unwrap()
            .with_structured(Box::new(FixedMarkdown("markdown markdown markdown".to_string())))
            .with_ocr(Box::new(FixedOcr("ocr body".to_string())));
        let acquired = acquirer
            .acquire(Path::new("x.pdf"), RecommendedExtractor::Structured, true)
            .unwrap();
        assert_eq!(acquired.shape, TextShape::OcrText);
    }

    #[test]
    fn test_missing_ocr_degrades_to_no_renderer() {
        let acquirer = TextAcquirer::new(50).unwrap();
        let acquired = acquirer
            .acquire(Path::new("x.pdf"), RecommendedExtractor::Ocr, false)
            .unwrap();
        assert_eq!(acquired.method, "no-renderer");
        assert!(acquired.text.is_empty());
    }
}
