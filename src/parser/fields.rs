//! Anchor-token field extraction.
//!
//! A block of loosely-structured text is split on the alternation of all
//! anchor tokens, keeping the tokens in the resulting sequence. The sequence
//! always alternates `segment, token, segment, token, ..., segment`, so the
//! value after an anchor sits at `index + offset`.

use std::sync::{LazyLock, OnceLock};

use chrono::NaiveDate;
use regex::Regex;
use rusqlite::types::Value;
use tracing::warn;

use super::normalize::{self, name_key, Normalize, DEFAULT_PIPELINE};
use crate::db::Record;
use crate::error::FieldExtractionError;

static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(1[89]\d{2}|20\d{2})\b").unwrap());

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    /// First four-digit year found in the value.
    Year,
    Date,
}

impl FieldKind {
    fn label(self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Year => "year",
            FieldKind::Date => "date",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Anchor {
    pub token: String,
    pub offset: usize,
    pub field: String,
    pub kind: FieldKind,
}

/// Immutable extraction configuration for one kind of sub-block.
#[derive(Debug, Clone, Default)]
pub struct AnchorSpec {
    lead: Option<(String, FieldKind)>,
    anchors: Vec<Anchor>,
    separators: Vec<String>,
    pipeline: Option<Vec<Normalize>>,
    splitter: OnceLock<Option<Regex>>,
}

impl AnchorSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the text before the first anchor as `field`.
    pub fn lead(mut self, field: &str) -> Self {
        self.lead = Some((field.to_string(), FieldKind::Text));
        self
    }

    pub fn text(self, field: &str, token: &str, offset: usize) -> Self {
        self.field(field, token, offset, FieldKind::Text)
    }

    pub fn integer(self, field: &str, token: &str, offset: usize) -> Self {
        self.field(field, token, offset, FieldKind::Integer)
    }

    pub fn year(self, field: &str, token: &str, offset: usize) -> Self {
        self.field(field, token, offset, FieldKind::Year)
    }

    pub fn date(self, field: &str, token: &str, offset: usize) -> Self {
        self.field(field, token, offset, FieldKind::Date)
    }

    pub fn field(mut self, field: &str, token: &str, offset: usize, kind: FieldKind) -> Self {
        self.anchors.push(Anchor {
            token: token.to_string(),
            offset: offset.max(1),
            field: field.to_string(),
            kind,
        });
        self
    }

    /// Split on `token` without reading a field after it, so offsets that
    /// step over it stay stable.
    pub fn split_on(mut self, token: &str) -> Self {
        self.separators.push(token.to_string());
        self
    }

    pub fn normalize(mut self, pipeline: &[Normalize]) -> Self {
        self.pipeline = Some(pipeline.to_vec());
        self
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    fn pipeline(&self) -> &[Normalize] {
        self.pipeline.as_deref().unwrap_or(DEFAULT_PIPELINE)
    }

    fn splitter(&self) -> Option<&Regex> {
        self.splitter
            .get_or_init(|| {
                let mut tokens: Vec<&str> = self
                    .anchors
                    .iter()
                    .map(|a| a.token.as_str())
                    .chain(self.separators.iter().map(String::as_str))
                    .collect();
                if tokens.is_empty() {
                    return None;
                }
                // longest first so "Nombre en citaciones" beats "Nombre"
                tokens.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
                tokens.dedup();
                let alternation = tokens
                    .iter()
                    .map(|t| regex::escape(t))
                    .collect::<Vec<_>>()
                    .join("|");
                match Regex::new(&alternation) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(error = %e, "Anchor alternation rejected; block read as a single segment");
                        None
                    }
                }
            })
            .as_ref()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub fields: Record,
    pub warnings: Vec<FieldExtractionError>,
}

#[derive(Debug, Clone, Copy)]
struct Part<'t> {
    text: &'t str,
    anchor: bool,
}

fn split_keep<'t>(text: &'t str, splitter: Option<&Regex>) -> Vec<Part<'t>> {
    let Some(re) = splitter else {
        return vec![Part { text, anchor: false }];
    };
    let mut parts = Vec::new();
    let mut last = 0;
    for m in re.find_iter(text) {
        parts.push(Part { text: &text[last..m.start()], anchor: false });
        parts.push(Part { text: m.as_str(), anchor: true });
        last = m.end();
    }
    parts.push(Part { text: &text[last..], anchor: false });
    parts
}

/// Extract every configured field from `text`.
///
/// Never fails: absent anchors are omitted, and a field that cannot be read
/// becomes a warning while the remaining fields are still extracted.
pub fn extract(text: &str, spec: &AnchorSpec) -> Extraction {
    let parts = split_keep(text, spec.splitter());
    let pipeline = spec.pipeline();
    let mut out = Extraction::default();

    if let Some((field, kind)) = &spec.lead {
        // parts[0] is always the segment before the first anchor
        out.put(field, parts[0].text, *kind, pipeline);
    }

    for anchor in &spec.anchors {
        if out.fields.contains_key(&anchor.field) {
            continue;
        }
        let Some(idx) = parts.iter().position(|p| p.anchor && p.text == anchor.token) else {
            continue;
        };
        match parts.get(idx + anchor.offset) {
            Some(part) => out.put(&anchor.field, part.text, anchor.kind, pipeline),
            None => out.warnings.push(FieldExtractionError::OffsetOutOfRange {
                field: anchor.field.clone(),
                anchor: anchor.token.clone(),
                offset: anchor.offset,
            }),
        }
    }

    out
}

impl Extraction {
    fn put(&mut self, field: &str, raw: &str, kind: FieldKind, pipeline: &[Normalize]) {
        match convert(field, raw, kind, pipeline) {
            Ok(Some(value)) => {
                self.fields.insert(field.to_string(), value);
            }
            Ok(None) => {}
            Err(e) => self.warnings.push(e),
        }
    }
}

fn convert(
    field: &str,
    raw: &str,
    kind: FieldKind,
    pipeline: &[Normalize],
) -> Result<Option<Value>, FieldExtractionError> {
    let value = normalize::apply(raw, pipeline);
    if value.is_empty() {
        return Ok(None);
    }
    let parsed = match kind {
        FieldKind::Text => Some(Value::Text(value.clone())),
        FieldKind::Integer => value.parse::<i64>().ok().map(Value::Integer),
        FieldKind::Year => YEAR_RE
            .captures(&value)
            .and_then(|c| c[1].parse::<i64>().ok())
            .map(Value::Integer),
        FieldKind::Date => DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(&value, fmt).ok())
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string())),
    };
    parsed.map(Some).ok_or_else(|| FieldExtractionError::TypeParse {
        field: field.to_string(),
        value,
        kind: kind.label(),
    })
}

/// Attributes a role to the subject among several listed participants.
#[derive(Debug, Clone)]
pub struct RoleRule {
    pub name_token: String,
    pub role_token: String,
    pub field: String,
}

impl RoleRule {
    pub fn new(name_token: &str, role_token: &str, field: &str) -> Self {
        Self {
            name_token: name_token.to_string(),
            role_token: role_token.to_string(),
            field: field.to_string(),
        }
    }

    /// The role listed next to `subject`, if the subject is among the participants.
    pub fn role_of(&self, text: &str, subject: &str) -> Option<String> {
        let wanted = name_key(subject);
        text.split(self.name_token.as_str()).skip(1).find_map(|chunk| {
            let (name, role) = chunk.split_once(self.role_token.as_str())?;
            if name_key(name) != wanted {
                return None;
            }
            let role = normalize::apply(role, DEFAULT_PIPELINE);
            (!role.is_empty()).then_some(role)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(e: &Extraction, field: &str) -> Option<String> {
        match e.fields.get(field) {
            Some(Value::Text(s)) => Some(s.clone()),
            _ => None,
        }
    }

    #[test]
    fn quoted_title_and_place() {
        let spec = AnchorSpec::new().text("titulo", "Titulo:", 1).text("lugar", "En:", 1);
        let e = extract("JUAN PEREZ, Titulo: \"X\" En: Colombia, 2019", &spec);
        assert_eq!(text(&e, "titulo").as_deref(), Some("X"));
        assert_eq!(text(&e, "lugar").as_deref(), Some("Colombia, 2019"));
        assert!(e.warnings.is_empty());
    }

    #[test]
    fn lead_is_text_before_first_anchor() {
        let spec = AnchorSpec::new().lead("autores").text("titulo", "Titulo:", 1);
        let e = extract("JUAN PEREZ, MARIA LOPEZ, Titulo: \"X\"", &spec);
        assert_eq!(text(&e, "autores").as_deref(), Some("JUAN PEREZ, MARIA LOPEZ"));
    }

    #[test]
    fn missing_anchor_is_omitted_without_warning() {
        let spec = AnchorSpec::new().text("titulo", "Titulo:", 1).text("doi", "DOI:", 1);
        let e = extract("Titulo: X", &spec);
        assert_eq!(e.fields.len(), 1);
        assert!(!e.fields.contains_key("doi"));
        assert!(e.warnings.is_empty());
    }

    #[test]
    fn offset_out_of_range_keeps_other_fields() {
        let spec = AnchorSpec::new()
            .text("titulo", "Titulo:", 1)
            .text("revista", "Revista:", 3);
        let e = extract("Titulo: X Revista: Y", &spec);
        assert_eq!(text(&e, "titulo").as_deref(), Some("X"));
        assert_eq!(e.warnings.len(), 1);
        assert!(matches!(
            &e.warnings[0],
            FieldExtractionError::OffsetOutOfRange { field, offset: 3, .. } if field == "revista"
        ));
    }

    #[test]
    fn first_occurrence_wins() {
        let spec = AnchorSpec::new().text("titulo", "Titulo:", 1).text("lugar", "En:", 1);
        let e = extract("Titulo: primero En: A Titulo: segundo", &spec);
        assert_eq!(text(&e, "titulo").as_deref(), Some("primero"));
    }

    #[test]
    fn offset_can_skip_over_the_next_anchor() {
        let spec = AnchorSpec::new()
            .text("ciudad", "En:", 1)
            .text("sede", "En:", 3)
            .text("pais", "Sede:", 1);
        let e = extract("En: Bogotá Sede: Colombia", &spec);
        assert_eq!(text(&e, "ciudad").as_deref(), Some("Bogotá"));
        assert_eq!(text(&e, "sede").as_deref(), Some("Colombia"));
        assert_eq!(text(&e, "pais").as_deref(), Some("Colombia"));
    }

    #[test]
    fn separator_tokens_split_without_a_field() {
        let spec = AnchorSpec::new()
            .year("ano_inicio", "Inicio:", 1)
            .year("ano_fin", "Inicio:", 3)
            .split_on("Fin:");
        let e = extract("Inicio: 2019 Fin: 2021", &spec);
        assert_eq!(e.fields.get("ano_inicio"), Some(&Value::Integer(2019)));
        assert_eq!(e.fields.get("ano_fin"), Some(&Value::Integer(2021)));
        assert_eq!(e.fields.len(), 2);

        let e = extract("Inicio: 2019", &spec);
        assert_eq!(e.fields.get("ano_inicio"), Some(&Value::Integer(2019)));
        assert_eq!(e.warnings.len(), 1);
    }

    #[test]
    fn longer_token_wins_over_its_prefix() {
        let spec = AnchorSpec::new()
            .text("nombre", "Nombre", 1)
            .text("nombre_citaciones", "Nombre en citaciones", 1);
        let e = extract("Nombre JUAN PEREZ Nombre en citaciones PEREZ, J", &spec);
        assert_eq!(text(&e, "nombre").as_deref(), Some("JUAN PEREZ"));
        assert_eq!(text(&e, "nombre_citaciones").as_deref(), Some("PEREZ, J"));
    }

    #[test]
    fn typed_fields() {
        let spec = AnchorSpec::new()
            .integer("volumen", "Volumen:", 1)
            .year("ano", "Año:", 1)
            .date("fecha", "Fecha:", 1);
        let e = extract("Volumen: 12 Año: publicado en 2019 Fecha: 03/05/2019", &spec);
        assert_eq!(e.fields.get("volumen"), Some(&Value::Integer(12)));
        assert_eq!(e.fields.get("ano"), Some(&Value::Integer(2019)));
        assert_eq!(e.fields.get("fecha"), Some(&Value::Text("2019-05-03".into())));
    }

    #[test]
    fn type_parse_failure_is_a_warning() {
        let spec = AnchorSpec::new().integer("volumen", "Volumen:", 1).text("titulo", "Titulo:", 1);
        let e = extract("Volumen: doce Titulo: X", &spec);
        assert!(!e.fields.contains_key("volumen"));
        assert_eq!(text(&e, "titulo").as_deref(), Some("X"));
        assert!(matches!(
            &e.warnings[0],
            FieldExtractionError::TypeParse { kind: "integer", .. }
        ));
    }

    #[test]
    fn garbage_input_never_panics() {
        let spec = AnchorSpec::new().lead("a").text("b", "B:", 5).year("c", "C:", 1);
        for input in ["", "B:", "C:", "B:B:B:", "\u{0}\u{1}C: ????", "C:C:"] {
            let _ = extract(input, &spec);
        }
    }

    #[test]
    fn extraction_is_reproducible() {
        let spec = AnchorSpec::new().lead("autores").text("titulo", "Titulo:", 1).year("ano", "Año:", 1);
        let input = "A, B, Titulo: \u{201C}Y\u{201D} Año: 2020";
        assert_eq!(extract(input, &spec), extract(input, &spec));
    }

    #[test]
    fn no_anchors_only_lead() {
        let spec = AnchorSpec::new().lead("linea");
        let e = extract("  Ecología de suelos ,", &spec);
        assert_eq!(text(&e, "linea").as_deref(), Some("Ecología de suelos"));
    }

    #[test]
    fn custom_pipeline_keeps_trailing_period() {
        let spec = AnchorSpec::new()
            .text("resumen", "Resumen:", 1)
            .normalize(&[Normalize::CollapseWhitespace, Normalize::StripQuotes]);
        let e = extract("Resumen:  Estudio   de suelos. ", &spec);
        assert_eq!(text(&e, "resumen").as_deref(), Some("Estudio de suelos."));
    }

    #[test]
    fn role_of_subject_among_participants() {
        let rule = RoleRule::new("Nombre:", "Rol en el evento:", "rol");
        let block = "Participantes Nombre: MARIA LOPEZ Rol en el evento: Asistente , \
                     Nombre: Juan  Perez Rol en el evento: Ponente ,";
        assert_eq!(rule.role_of(block, "JUAN PEREZ").as_deref(), Some("Ponente"));
        assert_eq!(rule.role_of(block, "PEDRO GOMEZ"), None);
    }
}
