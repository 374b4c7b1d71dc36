use anyhow::{Context, Result};

use super::docx::normalize_text;

/// Extracts the text layer of a PDF. Line structure is kept so headings stay
/// on their own lines; whitespace inside each line is collapsed.
pub fn extract_pdf_text(bytes: &[u8]) -> Result<String> {
    // pdf-extract panics on some malformed inputs
    let extracted = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| anyhow::anyhow!("PDF extraction panicked"))?
        .context("failed to extract text from PDF")?;

    let lines = extracted
        .split(['\n', '\u{000C}'])
        .map(normalize_text)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_bytes_are_an_error() {
        assert!(extract_pdf_text(b"%PDF-1.7 this is not really a pdf").is_err());
    }
}
