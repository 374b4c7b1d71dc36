pub mod docx;
pub mod pdf;

use sha2::{Digest, Sha256};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const PDF_MAGIC: &[u8] = b"%PDF";

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("could not read DOCX document: {0}")]
    Docx(String),
    #[error("could not read PDF document: {0}")]
    Pdf(String),
    #[error("document bytes are neither UTF-8 nor BOM-marked UTF-16 text")]
    Undecodable,
}

/// Turns uploaded guide bytes into plain text.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractionError>;
}

/// Sniffs the container format from magic bytes: ZIP is read as DOCX, `%PDF`
/// as PDF, anything else is decoded as text.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentExtractor;

impl TextExtractor for DocumentExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractionError> {
        if bytes.starts_with(ZIP_MAGIC) {
            return docx::extract_docx_text(bytes)
                .map_err(|err| ExtractionError::Docx(format!("{err:#}")));
        }
        if bytes.starts_with(PDF_MAGIC) {
            return pdf::extract_pdf_text(bytes)
                .map_err(|err| ExtractionError::Pdf(format!("{err:#}")));
        }
        decode_text(bytes)
    }
}

/// UTF-8 (BOM optional) first, then UTF-16 when a byte-order mark says so.
pub fn decode_text(bytes: &[u8]) -> Result<String, ExtractionError> {
    let without_bom = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    if let Ok(text) = std::str::from_utf8(without_bom) {
        return Ok(text.to_string());
    }

    let (body, little_endian) = if let Some(body) = bytes.strip_prefix(b"\xFF\xFE") {
        (body, true)
    } else if let Some(body) = bytes.strip_prefix(b"\xFE\xFF") {
        (body, false)
    } else {
        return Err(ExtractionError::Undecodable);
    };

    if body.len() % 2 != 0 {
        return Err(ExtractionError::Undecodable);
    }
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| {
            if little_endian {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16(&units).map_err(|_| ExtractionError::Undecodable)
}

pub fn source_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
