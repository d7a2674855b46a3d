use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{json, Map, Value};
use tokio::process::Command;

use crate::models::SourceDocument;

const FORM_FEED: char = '\u{000C}';

/// One document per non-empty page, with `{source, page}` metadata and 0-based pages.
pub async fn load_pdf_pages(pdf_path: &Path) -> Result<Vec<SourceDocument>> {
    let source = pdf_path.display().to_string();

    if has_command("pdftotext").await {
        let page_count = get_pdf_page_count(pdf_path).await.unwrap_or(0);
        if page_count > 0 {
            let mut pages = Vec::new();
            for page in 1..=page_count {
                let output = Command::new("pdftotext")
                    .arg("-f")
                    .arg(page.to_string())
                    .arg("-l")
                    .arg(page.to_string())
                    .arg("-layout")
                    .arg("-nopgbrk")
                    .arg(pdf_path)
                    .arg("-")
                    .output()
                    .await
                    .with_context(|| format!("failed to run pdftotext for page {}", page))?;

                if !output.status.success() {
                    continue;
                }

                let text = clean_page_text(&String::from_utf8_lossy(&output.stdout));
                if text.is_empty() {
                    continue;
                }

                pages.push(page_document(text, &source, (page - 1) as i64));
            }

            if !pages.is_empty() {
                return Ok(pages);
            }
        }
    }

    let owned_path = pdf_path.to_path_buf();
    let extracted = tokio::task::spawn_blocking(move || pdf_extract::extract_text(&owned_path))
        .await
        .context("PDF extraction task panicked")?
        .with_context(|| format!("failed to extract text from {}", source))?;

    Ok(split_extracted_pages(&extracted, &source))
}

/// pdf-extract separates pages with form feeds.
fn split_extracted_pages(extracted: &str, source: &str) -> Vec<SourceDocument> {
    extracted
        .split(FORM_FEED)
        .enumerate()
        .filter_map(|(index, raw)| {
            let text = clean_page_text(raw);
            (!text.is_empty()).then(|| page_document(text, source, index as i64))
        })
        .collect()
}

fn page_document(text: String, source: &str, page: i64) -> SourceDocument {
    let mut metadata = Map::new();
    metadata.insert("source".to_string(), json!(source));
    metadata.insert("page".to_string(), Value::from(page));
    SourceDocument {
        page_content: text,
        metadata,
    }
}

// Line structure is kept for the splitter; only trailing blanks and odd spaces go.
fn clean_page_text(raw: &str) -> String {
    raw.replace('\u{00A0}', " ")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

async fn get_pdf_page_count(pdf_path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(pdf_path)
        .output()
        .await
        .context("failed to run pdfinfo")?;

    if !output.status.success() {
        return Err(anyhow::anyhow!("pdfinfo exited with non-zero status"));
    }

    parse_page_count(&String::from_utf8_lossy(&output.stdout))
}

fn parse_page_count(pdfinfo_stdout: &str) -> Result<usize> {
    let regex = Regex::new(r"(?m)^Pages:\s+(\d+)\s*$")?;
    regex
        .captures(pdfinfo_stdout)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .ok_or_else(|| anyhow::anyhow!("unable to parse page count from pdfinfo"))
}

async fn has_command(binary: &str) -> bool {
    Command::new("which")
        .arg(binary)
        .output()
        .await
        .map(|out| out.status.success() && !out.stdout.is_empty())
        .unwrap_or(false)
}
