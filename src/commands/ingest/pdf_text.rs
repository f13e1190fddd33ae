use std::fmt;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;

use anyhow::{Result, anyhow, bail};

const FORM_FEED: char = '\u{000C}';

/// One page of a report's text layer, numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PageText<'a> {
    number: usize,
    text: &'a str,
}

impl fmt::Display for PageText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- PAGE {} ---", self.number)?;
        writeln!(f, "{}", self.text.trim_end())
    }
}

/// Text layer of the first `max_pages` pages of a PDF, one block per page.
pub fn extract_leading_pages_text(pdf_path: &Path, max_pages: usize) -> Result<String> {
    let max_pages = max_pages.max(1);
    let layer = read_text_layer(pdf_path, max_pages)?;
    let pages = leading_pages(&layer, max_pages);

    if pages.is_empty() {
        bail!(
            "no extractable text in the first {max_pages} pages of {}",
            pdf_path.display()
        );
    }

    Ok(pages.iter().map(PageText::to_string).collect())
}

/// Raw `pdftotext` output for the page range, NUL bytes removed.
fn read_text_layer(pdf_path: &Path, max_pages: usize) -> Result<String> {
    let last_page = max_pages.to_string();
    let output = Command::new("pdftotext")
        .args(["-enc", "UTF-8", "-f", "1", "-l", last_page.as_str()])
        .arg(pdf_path)
        .arg("-")
        .output()
        .map_err(|err| match err.kind() {
            ErrorKind::NotFound => anyhow!("pdftotext is not installed (poppler-utils)"),
            _ => anyhow!("could not run pdftotext on {}: {err}", pdf_path.display()),
        })?;

    if !output.status.success() {
        bail!(
            "pdftotext failed on {} ({}): {}",
            pdf_path.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).replace('\0', ""))
}

/// Pages of `layer` up to the last one carrying text, capped at `max_pages`.
fn leading_pages(layer: &str, max_pages: usize) -> Vec<PageText<'_>> {
    let mut pages: Vec<PageText<'_>> = layer
        .split(FORM_FEED)
        .take(max_pages)
        .enumerate()
        .map(|(index, text)| PageText {
            number: index + 1,
            text,
        })
        .collect();

    let keep = pages
        .iter()
        .rposition(|page| !page.text.trim().is_empty())
        .map_or(0, |last| last + 1);
    pages.truncate(keep);
    pages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_pages_stop_at_last_page_with_text() {
        let pages = leading_pages("first\u{000C}\u{000C}third\u{000C}  \n\u{000C}", 10);
        let numbers: Vec<usize> = pages.iter().map(|page| page.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(pages[2].text, "third");

        assert!(leading_pages(" \n\u{000C}\u{000C}", 10).is_empty());
    }

    #[test]
    fn leading_pages_respect_the_page_cap() {
        let pages = leading_pages("a\u{000C}b\u{000C}c", 2);
        assert_eq!(
            pages,
            vec![
                PageText { number: 1, text: "a" },
                PageText { number: 2, text: "b" },
            ]
        );
    }

    #[test]
    fn page_blocks_carry_their_number() {
        let rendered: String = leading_pages("alpha\n\u{000C}beta", 5)
            .iter()
            .map(PageText::to_string)
            .collect();
        assert_eq!(rendered, "--- PAGE 1 ---\nalpha\n--- PAGE 2 ---\nbeta\n");
    }
}
