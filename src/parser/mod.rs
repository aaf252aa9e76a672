pub mod fields;
pub mod normalize;
pub mod registry;
pub mod sections;

use scraper::Html;

use crate::error::ParseError;

/// One parsed source document. Owned by the worker handling its ID.
pub struct Document {
    html: Html,
}

impl Document {
    pub fn html(&self) -> &Html {
        &self.html
    }
}

/// Bytes → document tree. Non-UTF-8 input is read as Latin-1.
pub fn parse_document(bytes: &[u8]) -> Result<Document, ParseError> {
    let text = match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    };
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    if !text.contains('<') {
        return Err(ParseError::NotMarkup);
    }
    Ok(Document {
        html: Html::parse_document(&text),
    })
}
