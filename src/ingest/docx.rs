use std::io::{Cursor, Read};

use anyhow::{Context, Result};
use roxmltree::{Document, Node};
use zip::ZipArchive;

/// Flattens `word/document.xml` into one line per paragraph.
///
/// Heading styles are rendered as markdown markers (`Title` as `#`,
/// `Heading1` as `##`, and so on) and list paragraphs as `- ` bullets, so the
/// outline parser sees the document's own structure.
pub fn extract_docx_text(bytes: &[u8]) -> Result<String> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).context("DOCX is not a valid ZIP archive")?;

    let mut document_xml = String::new();
    archive
        .by_name("word/document.xml")
        .context("DOCX missing word/document.xml")?
        .read_to_string(&mut document_xml)
        .context("failed to read word/document.xml")?;

    let doc = Document::parse(&document_xml).context("failed to parse DOCX XML")?;

    let mut lines = Vec::new();
    for paragraph in doc
        .descendants()
        .filter(|node| node.is_element() && node.tag_name().name() == "p")
    {
        let text = paragraph
            .descendants()
            .filter(|node| node.is_element() && node.tag_name().name() == "t")
            .filter_map(|node| node.text())
            .collect::<Vec<_>>()
            .join("");

        let normalized = normalize_text(&text);
        if normalized.is_empty() {
            continue;
        }

        let line = match heading_depth(paragraph_style(&paragraph).as_deref()) {
            Some(depth) => format!("{} {}", "#".repeat(depth), normalized),
            None if is_list_paragraph(&paragraph) => format!("- {normalized}"),
            None => normalized,
        };
        lines.push(line);
    }

    Ok(lines.join("\n"))
}

fn paragraph_style(paragraph: &Node) -> Option<String> {
    paragraph
        .descendants()
        .find(|node| node.is_element() && node.tag_name().name() == "pStyle")
        .and_then(|node| {
            node.attributes()
                .find(|attr| attr.name().ends_with("val"))
                .map(|attr| attr.value().to_string())
        })
}

fn heading_depth(style: Option<&str>) -> Option<usize> {
    let style = style?.to_ascii_lowercase().replace([' ', '-', '_'], "");
    if style == "title" {
        return Some(1);
    }
    let level = style.strip_prefix("heading")?;
    let level: usize = level.parse().unwrap_or(1);
    Some((level + 1).min(6))
}

fn is_list_paragraph(paragraph: &Node) -> bool {
    paragraph
        .descendants()
        .any(|node| node.is_element() && node.tag_name().name() == "numPr")
}

pub(crate) fn normalize_text(input: &str) -> String {
    input
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace('\u{00A0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn docx_with_body(body: &str) -> Vec<u8> {
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}</w:body></w:document>"#
        );
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn headings_become_markdown_markers() {
        let body = r#"
<w:p><w:pPr><w:pStyle w:val="Title"/></w:pPr><w:r><w:t>Thesis Guide</w:t></w:r></w:p>
<w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Introduction</w:t></w:r></w:p>
<w:p><w:r><w:t xml:space="preserve">State the   </w:t></w:r><w:r><w:t>problem.</w:t></w:r></w:p>
<w:p><w:pPr><w:numPr><w:ilvl w:val="0"/></w:numPr></w:pPr><w:r><w:t>Cite sources</w:t></w:r></w:p>
<w:p><w:pPr><w:pStyle w:val="Heading2"/></w:pPr><w:r><w:t>Aims</w:t></w:r></w:p>"#;
        let text = extract_docx_text(&docx_with_body(body)).unwrap();
        assert_eq!(
            text,
            "# Thesis Guide\n## Introduction\nState the problem.\n- Cite sources\n### Aims"
        );
    }

    #[test]
    fn archive_without_document_is_an_error() {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            zip.start_file("other.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"<x/>").unwrap();
            zip.finish().unwrap();
        }
        assert!(extract_docx_text(&cursor.into_inner()).is_err());
    }
}
