use std::collections::VecDeque;
use std::sync::LazyLock;

use rusqlite::types::Value;
use scraper::{ElementRef, Selector};
use tracing::debug;

use super::fields::{self, Extraction};
use super::normalize::collapse_whitespace;
use super::registry::{BlockShape, Registry, SectionSpec};
use super::Document;
use crate::db::Record;
use crate::entity::EntityId;
use crate::error::{EmptyDocument, FieldExtractionError};

static HEADINGS: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1, h2, h3, h4, h5, h6").unwrap());
static LIST_ITEMS: LazyLock<Selector> = LazyLock::new(|| Selector::parse("li").unwrap());
static BLOCKQUOTES: LazyLock<Selector> = LazyLock::new(|| Selector::parse("blockquote").unwrap());
static TABLE_ROWS: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());

/// One extracted record, tagged with its destination table.
#[derive(Debug, Clone)]
pub struct RoutedRecord {
    pub table: String,
    pub record: Record,
    pub key_columns: Option<Vec<String>>,
    pub warnings: Vec<FieldExtractionError>,
    fields_found: usize,
}

impl RoutedRecord {
    /// False when the block produced nothing beyond the entity ID.
    pub fn has_data(&self) -> bool {
        self.fields_found > 0
    }
}

pub struct Router<'r> {
    registry: &'r Registry,
    entity_column: String,
}

impl<'r> Router<'r> {
    pub fn new(registry: &'r Registry, entity_column: &str) -> Self {
        Self {
            registry,
            entity_column: entity_column.to_string(),
        }
    }

    /// Run identification, then stream the records of every registered section.
    ///
    /// Fails with [`EmptyDocument`] when identification yields no subject name;
    /// in that case nothing else is routed.
    pub fn route<'d>(&'d self, doc: &'d Document, id: EntityId) -> Result<Routing<'d>, EmptyDocument> {
        let ident = self.registry.identification();
        let heading = doc
            .html()
            .select(&HEADINGS)
            .find(|h| heading_text(h) == ident.heading)
            .ok_or(EmptyDocument)?;

        let record = self
            .section_records(heading, ident, id, None)
            .into_iter()
            .next()
            .ok_or(EmptyDocument)?;
        let subject = match record.record.get(self.registry.subject_field()) {
            Some(Value::Text(name)) if !name.is_empty() => name.clone(),
            _ => return Err(EmptyDocument),
        };

        Ok(Routing {
            router: self,
            id,
            subject,
            identification: heading,
            headings: doc.html().select(&HEADINGS),
            pending: VecDeque::from([record]),
        })
    }

    fn section_records(
        &self,
        heading: ElementRef<'_>,
        spec: &SectionSpec,
        id: EntityId,
        subject: Option<&str>,
    ) -> Vec<RoutedRecord> {
        let container = container_of(heading);
        blocks(container, heading, spec.shape)
            .iter()
            .map(|text| {
                let Extraction { fields: mut record, warnings } = fields::extract(text, &spec.anchors);
                if let (Some(rule), Some(subject)) = (&spec.subject_role, subject) {
                    if let Some(role) = rule.role_of(text, subject) {
                        record.entry(rule.field.clone()).or_insert(Value::Text(role));
                    }
                }
                let fields_found = record.len();
                record.insert(self.entity_column.clone(), Value::Text(id.to_string()));
                RoutedRecord {
                    table: spec.table.clone(),
                    record,
                    key_columns: spec.key_columns.clone(),
                    warnings,
                    fields_found,
                }
            })
            .collect()
    }
}

/// Lazy, single pass over a document's headings.
pub struct Routing<'d> {
    router: &'d Router<'d>,
    id: EntityId,
    subject: String,
    identification: ElementRef<'d>,
    headings: scraper::html::Select<'d, 'static>,
    pending: VecDeque<RoutedRecord>,
}

impl Routing<'_> {
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl Iterator for Routing<'_> {
    type Item = RoutedRecord;

    fn next(&mut self) -> Option<RoutedRecord> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Some(record);
            }
            let heading = self.headings.next()?;
            if heading.id() == self.identification.id() {
                continue;
            }
            let text = heading_text(&heading);
            let Some(spec) = self.router.registry.lookup(&text) else {
                debug!(cvlac_id = %self.id, heading = %text, "No handler for section");
                continue;
            };
            let records = self
                .router
                .section_records(heading, spec, self.id, Some(&self.subject));
            self.pending.extend(records);
        }
    }
}

fn heading_text(heading: &ElementRef<'_>) -> String {
    collapse_whitespace(&heading.text().collect::<String>())
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ")
}

/// Nearest enclosing table, else the heading's parent element.
fn container_of(heading: ElementRef<'_>) -> ElementRef<'_> {
    heading
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "table")
        .or_else(|| heading.parent().and_then(ElementRef::wrap))
        .unwrap_or(heading)
}

fn blocks(container: ElementRef<'_>, heading: ElementRef<'_>, shape: BlockShape) -> Vec<String> {
    let texts: Vec<String> = match shape {
        BlockShape::Whole => vec![element_text(container)],
        BlockShape::ListItems => container.select(&LIST_ITEMS).map(element_text).collect(),
        BlockShape::Blockquotes => container.select(&BLOCKQUOTES).map(element_text).collect(),
        BlockShape::TableRows => container
            .select(&TABLE_ROWS)
            .filter(|row| !heading.ancestors().any(|a| a.id() == row.id()))
            .map(element_text)
            .collect(),
    };
    texts.into_iter().filter(|t| !t.trim().is_empty()).collect()
}

// ── Tests ──
