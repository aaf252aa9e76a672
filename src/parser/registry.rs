//! Heading text → section handler configuration.
//!
//! Each entry names the target table, the repeating sub-block shape and the
//! anchor table used on every sub-block. Adding a section is a data change.

use std::collections::HashMap;
use std::sync::LazyLock;

use super::fields::{AnchorSpec, RoleRule};
use super::normalize::Normalize;

/// How a section's container is cut into sub-blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockShape {
    ListItems,
    Blockquotes,
    TableRows,
    /// The whole container is a single block.
    Whole,
}

#[derive(Debug, Clone)]
pub struct SectionSpec {
    pub heading: String,
    pub table: String,
    pub shape: BlockShape,
    pub anchors: AnchorSpec,
    pub key_columns: Option<Vec<String>>,
    pub subject_role: Option<RoleRule>,
}

impl SectionSpec {
    pub fn new(heading: &str, table: &str, shape: BlockShape, anchors: AnchorSpec) -> Self {
        Self {
            heading: heading.to_string(),
            table: table.to_string(),
            shape,
            anchors,
            key_columns: None,
            subject_role: None,
        }
    }

    pub fn keys(mut self, columns: &[&str]) -> Self {
        self.key_columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn subject_role(mut self, rule: RoleRule) -> Self {
        self.subject_role = Some(rule);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    identification: SectionSpec,
    subject_field: String,
    sections: HashMap<String, SectionSpec>,
}

impl Registry {
    /// `subject_field` is the identification field holding the subject's full name.
    pub fn new(identification: SectionSpec, subject_field: &str) -> Self {
        Self {
            identification,
            subject_field: subject_field.to_string(),
            sections: HashMap::new(),
        }
    }

    pub fn with(mut self, spec: SectionSpec) -> Self {
        self.sections.insert(spec.heading.clone(), spec);
        self
    }

    pub fn identification(&self) -> &SectionSpec {
        &self.identification
    }

    pub fn subject_field(&self) -> &str {
        &self.subject_field
    }

    pub fn lookup(&self, heading: &str) -> Option<&SectionSpec> {
        self.sections.get(heading)
    }

    pub fn tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = std::iter::once(&self.identification)
            .chain(self.sections.values())
            .map(|s| s.table.as_str())
            .collect();
        tables.sort_unstable();
        tables
    }
}

pub static CVLAC: LazyLock<Registry> = LazyLock::new(cvlac);

fn cvlac() -> Registry {
    let identification = SectionSpec::new(
        "Datos generales",
        "identificacion",
        BlockShape::Whole,
        AnchorSpec::new()
            .text("nombre", "Nombre", 1)
            .text("nombre_citaciones", "Nombre en citaciones", 1)
            .text("nacionalidad", "Nacionalidad", 1)
            .text("sexo", "Sexo", 1)
            .text("categoria", "Categoría", 1),
    )
    .keys(&["cvlac_id"]);

    Registry::new(identification, "nombre")
        .with(SectionSpec::new(
            "Formación Académica",
            "formacion_academica",
            BlockShape::TableRows,
            AnchorSpec::new()
                .text("nivel", "Nivel:", 1)
                .text("institucion", "Institución:", 1)
                .text("programa", "Programa:", 1)
                .year("ano_inicio", "Inicio:", 1)
                .year("ano_fin", "Fin:", 1)
                .text("tesis", "Tesis:", 1),
        ))
        .with(SectionSpec::new(
            "Experiencia profesional",
            "experiencia",
            BlockShape::TableRows,
            AnchorSpec::new()
                .text("institucion", "Institución:", 1)
                .text("cargo", "Cargo:", 1)
                .text("dedicacion", "Dedicación:", 1)
                .year("ano_inicio", "Inicio:", 1)
                .year("ano_fin", "Fin:", 1),
        ))
        .with(SectionSpec::new(
            "Idiomas",
            "idiomas",
            BlockShape::TableRows,
            AnchorSpec::new()
                .text("idioma", "Idioma:", 1)
                .text("habla", "Habla:", 1)
                .text("escribe", "Escribe:", 1)
                .text("lee", "Lee:", 1)
                .text("entiende", "Entiende:", 1),
        ))
        .with(SectionSpec::new(
            "Áreas de actuación",
            "areas_actuacion",
            BlockShape::ListItems,
            AnchorSpec::new().lead("area"),
        ))
        .with(SectionSpec::new(
            "Líneas de investigación",
            "lineas_investigacion",
            BlockShape::ListItems,
            AnchorSpec::new().lead("linea").text("activa", "Activa:", 1),
        ))
        .with(SectionSpec::new(
            "Premios y reconocimientos",
            "premios",
            BlockShape::ListItems,
            AnchorSpec::new()
                .lead("nombre")
                .text("entidad", "Otorgado por:", 1)
                .date("fecha", "Fecha:", 1),
        ))
        .with(SectionSpec::new(
            "Artículos",
            "articulos",
            BlockShape::Blockquotes,
            AnchorSpec::new()
                .lead("autores")
                .text("titulo", "Titulo:", 1)
                .text("pais", "En:", 1)
                .text("revista", "Revista:", 1)
                .text("issn", "ISSN:", 1)
                .integer("volumen", "Volumen:", 1)
                .text("fasciculo", "Fasciculo:", 1)
                .text("paginas", "Paginas:", 1)
                .year("ano", "Año:", 1)
                .text("doi", "DOI:", 1),
        ))
        .with(SectionSpec::new(
            "Libros",
            "libros",
            BlockShape::Blockquotes,
            AnchorSpec::new()
                .lead("autores")
                .text("titulo", "Titulo:", 1)
                .text("pais", "En:", 1)
                .text("editorial", "Editorial:", 1)
                .text("isbn", "ISBN:", 1)
                .year("ano", "Año:", 1),
        ))
        .with(SectionSpec::new(
            "Capitulos de libro",
            "capitulos_libro",
            BlockShape::Blockquotes,
            AnchorSpec::new()
                .lead("autores")
                .text("titulo_capitulo", "Capitulo:", 1)
                .text("titulo_libro", "Libro:", 1)
                .text("pais", "En:", 1)
                .text("editorial", "Editorial:", 1)
                .text("isbn", "ISBN:", 1)
                .text("paginas", "Paginas:", 1)
                .year("ano", "Año:", 1),
        ))
        .with(
            SectionSpec::new(
                "Eventos científicos",
                "eventos",
                BlockShape::Blockquotes,
                AnchorSpec::new()
                    .text("nombre_evento", "Nombre del evento:", 1)
                    .text("tipo", "Tipo de evento:", 1)
                    .text("ambito", "Ámbito:", 1)
                    .date("fecha", "Realizado el:", 1)
                    .text("lugar", "en:", 1)
                    .split_on("Participantes"),
            )
            .subject_role(RoleRule::new("Nombre:", "Rol en el evento:", "rol")),
        )
        .with(SectionSpec::new(
            "Proyectos",
            "proyectos",
            BlockShape::Blockquotes,
            // the end year is read positionally, two tokens past "Inicio:"
            AnchorSpec::new()
                .text("tipo", "Tipo de proyecto:", 1)
                .text("titulo", "Titulo:", 1)
                .year("ano_inicio", "Inicio:", 1)
                .year("ano_fin", "Inicio:", 3)
                .split_on("Fin:")
                .text("resumen", "Resumen:", 1)
                .normalize(&[
                    Normalize::StripControl,
                    Normalize::NormalizeQuotes,
                    Normalize::CollapseWhitespace,
                    Normalize::StripQuotes,
                ]),
        ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookup_is_exact() {
        assert!(CVLAC.lookup("Artículos").is_some());
        assert!(CVLAC.lookup("artículos").is_none());
        assert!(CVLAC.lookup("Datos generales").is_none());
        assert_eq!(CVLAC.identification().table, "identificacion");
    }

    #[test]
    fn catalog_tables_are_distinct() {
        let tables = CVLAC.tables();
        let mut deduped = tables.clone();
        deduped.dedup();
        assert_eq!(tables, deduped);
        assert_eq!(tables.len(), 12);
    }

    #[test]
    fn every_anchored_section_names_distinct_fields() {
        for table in CVLAC.tables() {
            let spec = if table == "identificacion" {
                CVLAC.identification()
            } else {
                CVLAC.sections.values().find(|s| s.table == table).unwrap()
            };
            let mut fields: Vec<&str> = spec.anchors.anchors().iter().map(|a| a.field.as_str()).collect();
            let n = fields.len();
            fields.sort_unstable();
            fields.dedup();
            assert_eq!(fields.len(), n, "duplicate field in {}", table);
        }
    }
}
