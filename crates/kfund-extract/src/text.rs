//! Plain-text extraction from detail markup and downloaded attachments.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kfund_core::DetailCapture;
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::hwpx::hwpx_to_text;
use crate::ExtractError;

const INPUT_PLACEHOLDER: &str = "{input}";

/// Visible text of an HTML document, one line per text node.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut lines = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|el| matches!(el.value().name(), "script" | "style" | "noscript" | "head"));
        if hidden {
            continue;
        }
        let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines.join("\n")
}

/// External command that prints a document's text on stdout. `{input}` in `args` is
/// replaced by the file path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverterCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ConverterCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn args_for(&self, input: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        self.args.iter().map(|a| a.replace(INPUT_PLACEHOLDER, &input)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct TextExtractorConfig {
    /// Keyed by lowercase extension without the dot.
    pub converters: HashMap<String, ConverterCommand>,
    pub timeout: Duration,
    pub max_concurrent: usize,
}

impl Default for TextExtractorConfig {
    fn default() -> Self {
        let mut converters = HashMap::new();
        converters.insert("pdf".into(), ConverterCommand::new("pdftotext", &["-layout", "{input}", "-"]));
        converters.insert("hwp".into(), ConverterCommand::new("hwp5txt", &["{input}"]));
        converters.insert("docx".into(), ConverterCommand::new("pandoc", &["-t", "plain", "{input}"]));
        Self {
            converters,
            timeout: Duration::from_secs(60),
            max_concurrent: 2,
        }
    }
}

/// Text assembled from one capture: detail page first, then each attachment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EligibilityDocument {
    pub text: String,
    /// Attachment filenames whose text was included.
    pub sources: Vec<String>,
    /// `filename: error` for attachments that could not be converted.
    pub failures: Vec<String>,
}

impl EligibilityDocument {
    pub fn has_attachment_text(&self) -> bool {
        !self.sources.is_empty()
    }
}

pub struct TextExtractor {
    config: TextExtractorConfig,
    permits: Arc<Semaphore>,
}

impl TextExtractor {
    pub fn new(config: TextExtractorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self { config, permits }
    }

    pub async fn extract_file(&self, path: &Path) -> Result<String, ExtractError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "html" | "htm" => {
                let bytes = tokio::fs::read(path).await?;
                Ok(html_to_text(&String::from_utf8_lossy(&bytes)))
            }
            "txt" | "csv" | "md" => {
                let bytes = tokio::fs::read(path).await?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            // hwp5txt only reads binary HWP 5; HWPX is a zip of XML sections.
            "hwpx" if !self.config.converters.contains_key("hwpx") => {
                let bytes = tokio::fs::read(path).await?;
                tokio::task::spawn_blocking(move || hwpx_to_text(&bytes))
                    .await
                    .map_err(|e| ExtractError::Conversion {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    })?
                    .map_err(|e| ExtractError::Conversion {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    })
            }
            other => match self.config.converters.get(other) {
                Some(command) => self.run_converter(command, path).await,
                None => Err(ExtractError::Conversion {
                    path: path.to_path_buf(),
                    message: format!("no converter for .{other}"),
                }),
            },
        }
    }

    async fn run_converter(&self, command: &ConverterCommand, path: &Path) -> Result<String, ExtractError> {
        let _permit = self.permits.acquire().await.map_err(|e| ExtractError::Conversion {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        debug!(program = %command.program, path = %path.display(), "running document converter");

        let output = tokio::time::timeout(
            self.config.timeout,
            Command::new(&command.program)
                .args(command.args_for(path))
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ExtractError::ConversionTimeout {
            path: path.to_path_buf(),
        })?
        .map_err(|e| ExtractError::Conversion {
            path: path.to_path_buf(),
            message: format!("{}: {e}", command.program),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::Conversion {
                path: path.to_path_buf(),
                message: format!("{} exited with {}: {}", command.program, output.status, stderr.trim()),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Concatenate detail text and every attachment that converts. A failed
    /// attachment is recorded and skipped.
    pub async fn build_document(&self, detail: &DetailCapture, attachments: &[PathBuf]) -> EligibilityDocument {
        let mut document = EligibilityDocument::default();
        let mut sections = Vec::new();

        let detail_text = if detail.raw_html.trim().is_empty() {
            [detail.description.as_deref(), detail.support_target.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            html_to_text(&detail.raw_html)
        };
        if !detail_text.trim().is_empty() {
            sections.push(detail_text);
        }

        for path in attachments {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            match self.extract_file(path).await {
                Ok(text) if !text.trim().is_empty() => {
                    sections.push(format!("[첨부: {name}]\n{}", text.trim()));
                    document.sources.push(name);
                }
                Ok(_) => debug!(file = %name, "attachment produced no text"),
                Err(e) => {
                    warn!(file = %name, error = %e, "attachment text extraction failed");
                    document.failures.push(format!("{name}: {e}"));
                }
            }
        }

        document.text = sections.join("\n\n");
        document
    }
}
