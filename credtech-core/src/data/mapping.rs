//! Versioned alias table mapping raw column sets onto canonical fields.
//!
//! Each family has several vintages: the column sets published by the source
//! over time. Resolution keeps the vintages whose required fields are all
//! present and picks the one covering the most fields; ties go to the newest.

use super::coerce::NumberLocale;
use crate::domain::{Dimension, Family};

/// Canonical field a raw column can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalField {
    ReferenceMonth,
    Segment,
    Modality,
    Dimension(Dimension),
    Balance,
    Contracts,
    Overdue15d,
    Defaulted,
    ProblemAssets,
    Date,
    Value,
}

#[derive(Debug, Clone)]
pub struct FieldBinding {
    pub field: CanonicalField,
    /// Normalized header aliases.
    pub aliases: Vec<&'static str>,
    pub required: bool,
    /// Column index used when no header alias matches.
    pub position: Option<usize>,
}

impl FieldBinding {
    fn required(field: CanonicalField, aliases: &[&'static str]) -> Self {
        Self {
            field,
            aliases: aliases.to_vec(),
            required: true,
            position: None,
        }
    }

    fn optional(field: CanonicalField, aliases: &[&'static str]) -> Self {
        Self {
            required: false,
            ..Self::required(field, aliases)
        }
    }

    fn at(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }
}

/// One published column layout of a source family.
#[derive(Debug, Clone)]
pub struct Vintage {
    pub family: Family,
    pub name: &'static str,
    /// Higher is newer.
    pub version: u32,
    pub locale: NumberLocale,
    /// Positional bindings apply only to files with exactly this many columns.
    pub positional_width: Option<usize>,
    pub fields: Vec<FieldBinding>,
}

/// Chosen vintage plus the raw column index of every bound field.
#[derive(Debug, Clone)]
pub struct ResolvedMapping {
    pub vintage: &'static str,
    pub version: u32,
    pub locale: NumberLocale,
    pub columns: Vec<(CanonicalField, usize)>,
}

impl ResolvedMapping {
    pub fn index(&self, field: CanonicalField) -> Option<usize> {
        self.columns
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, i)| *i)
    }

    pub fn dimensions(&self) -> impl Iterator<Item = (Dimension, usize)> + '_ {
        self.columns.iter().filter_map(|(f, i)| match f {
            CanonicalField::Dimension(d) => Some((*d, *i)),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown source schema for {family}: no vintage matches columns [{}]", .headers.join(", "))]
pub struct UnknownSourceSchema {
    pub family: Family,
    pub headers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MappingTable {
    vintages: Vec<Vintage>,
}

impl MappingTable {
    pub fn new(vintages: Vec<Vintage>) -> Self {
        Self { vintages }
    }

    /// Known BACEN SCR and SGS layouts.
    pub fn builtin() -> Self {
        use CanonicalField as F;

        let scr_dimensions = [
            (Dimension::Uf, &["uf"][..]),
            (Dimension::Tcb, &["tcb"][..]),
            (Dimension::Sr, &["sr"][..]),
            (Dimension::Occupation, &["ocupacao"][..]),
            (Dimension::CnaeSection, &["cnae_secao"][..]),
            (Dimension::CnaeSubclass, &["cnae_subclasse"][..]),
            (Dimension::Size, &["porte"][..]),
            (Dimension::Origin, &["origem"][..]),
            (Dimension::Indexer, &["indexador"][..]),
        ];

        // Early extracts: no risk breakdown, state only.
        let scr_2012 = Vintage {
            family: Family::Credit,
            name: "scr-2012",
            version: 1,
            locale: NumberLocale::PtBr,
            positional_width: None,
            fields: vec![
                FieldBinding::required(F::ReferenceMonth, &["data_base", "database", "data"]),
                FieldBinding::required(F::Segment, &["cliente", "segmento", "tipo_cliente"]),
                FieldBinding::required(F::Modality, &["modalidade"]),
                FieldBinding::required(F::Balance, &["carteira_ativa", "saldo", "carteira"]),
                FieldBinding::required(
                    F::Contracts,
                    &["numero_de_operacoes", "qtd_operacoes", "operacoes"],
                ),
                FieldBinding::optional(F::Dimension(Dimension::Uf), &["uf"]),
                FieldBinding::optional(F::Overdue15d, &["vencido_acima_de_15_dias"]),
            ],
        };

        let mut scr_2023_fields = vec![
            FieldBinding::required(F::ReferenceMonth, &["data_base"]),
            FieldBinding::required(F::Segment, &["cliente"]),
            FieldBinding::required(F::Modality, &["modalidade"]),
            FieldBinding::required(F::Balance, &["carteira_ativa"]),
            FieldBinding::required(F::Contracts, &["numero_de_operacoes"]),
            FieldBinding::optional(F::Overdue15d, &["vencido_acima_de_15_dias"]),
            FieldBinding::optional(F::Defaulted, &["carteira_inadimplida_arrastada"]),
            FieldBinding::optional(F::ProblemAssets, &["ativo_problematico"]),
        ];
        for (dim, aliases) in scr_dimensions {
            let binding = FieldBinding::optional(F::Dimension(dim), aliases);
            scr_2023_fields.push(FieldBinding {
                required: matches!(dim, Dimension::Uf | Dimension::Tcb | Dimension::Size),
                ..binding
            });
        }
        let scr_2023 = Vintage {
            family: Family::Credit,
            name: "scr-2023",
            version: 2,
            locale: NumberLocale::PtBr,
            positional_width: None,
            fields: scr_2023_fields,
        };

        // Headerless-style two column dump (`col0;col1`), renamed by position.
        let sgs_positional = Vintage {
            family: Family::Indicator,
            name: "sgs-positional",
            version: 1,
            locale: NumberLocale::PtBr,
            positional_width: Some(2),
            fields: vec![
                FieldBinding::required(F::Date, &[]).at(0),
                FieldBinding::required(F::Value, &[]).at(1),
            ],
        };

        let sgs_export = Vintage {
            family: Family::Indicator,
            name: "sgs-export",
            version: 2,
            locale: NumberLocale::Dot,
            positional_width: None,
            fields: vec![
                FieldBinding::required(F::Date, &["date"]),
                FieldBinding::required(F::Value, &["value"]),
            ],
        };

        let sgs_bcdata = Vintage {
            family: Family::Indicator,
            name: "sgs-bcdata",
            version: 3,
            locale: NumberLocale::PtBr,
            positional_width: None,
            fields: vec![
                FieldBinding::required(F::Date, &["data", "data_referencia"]),
                FieldBinding::required(F::Value, &["valor"]),
            ],
        };

        Self::new(vec![scr_2012, scr_2023, sgs_positional, sgs_export, sgs_bcdata])
    }

    pub fn vintages(&self, family: Family) -> impl Iterator<Item = &Vintage> {
        self.vintages.iter().filter(move |v| v.family == family)
    }

    /// Select the best vintage for a raw header row.
    pub fn resolve(
        &self,
        family: Family,
        headers: &[String],
    ) -> Result<ResolvedMapping, UnknownSourceSchema> {
        let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();

        let mut best: Option<(usize, u32, ResolvedMapping)> = None;
        for vintage in self.vintages(family) {
            let Some(columns) = bind(vintage, &normalized) else {
                continue;
            };
            let score = (columns.len(), vintage.version);
            if best
                .as_ref()
                .map_or(true, |(n, v, _)| score > (*n, *v))
            {
                best = Some((
                    columns.len(),
                    vintage.version,
                    ResolvedMapping {
                        vintage: vintage.name,
                        version: vintage.version,
                        locale: vintage.locale,
                        columns,
                    },
                ));
            }
        }

        best.map(|(_, _, mapping)| mapping).ok_or_else(|| UnknownSourceSchema {
            family,
            headers: headers.to_vec(),
        })
    }
}

/// Bind every field of a vintage; `None` when a required field is missing.
fn bind(vintage: &Vintage, headers: &[String]) -> Option<Vec<(CanonicalField, usize)>> {
    let positional = vintage.positional_width == Some(headers.len());
    let mut columns = Vec::new();
    for binding in &vintage.fields {
        let by_alias = binding
            .aliases
            .iter()
            .find_map(|alias| headers.iter().position(|h| h == alias));
        let index = by_alias.or(if positional { binding.position } else { None });
        match index {
            Some(i) => columns.push((binding.field, i)),
            None if binding.required => return None,
            None => {}
        }
    }
    Some(columns)
}

/// Lowercase, strip accents, collapse whitespace and dashes to `_`.
pub fn normalize_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        let c = match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' | 'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' | 'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' => 'u',
            'ç' | 'Ç' => 'c',
            c if c.is_whitespace() || c == '-' => '_',
            c => c.to_ascii_lowercase(),
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalizes_case_accents_and_spacing() {
        assert_eq!(normalize_header(" Ocupação "), "ocupacao");
        assert_eq!(normalize_header("Número de  Operações"), "numero_de_operacoes");
        assert_eq!(normalize_header("CNAE-Seção"), "cnae_secao");
    }

    #[test]
    fn full_extract_resolves_to_newest_vintage() {
        let table = MappingTable::builtin();
        let cols = headers(&[
            "data_base", "uf", "tcb", "sr", "cliente", "ocupacao", "cnae_secao",
            "cnae_subclasse", "porte", "modalidade", "origem", "indexador",
            "numero_de_operacoes", "vencido_acima_de_15_dias", "carteira_ativa",
            "carteira_inadimplida_arrastada", "ativo_problematico",
        ]);
        let mapping = table.resolve(Family::Credit, &cols).unwrap();
        assert_eq!(mapping.vintage, "scr-2023");
        assert_eq!(mapping.index(CanonicalField::Balance), Some(14));
        assert_eq!(mapping.dimensions().count(), 9);
    }

    #[test]
    fn reduced_extract_falls_back_to_older_vintage() {
        let table = MappingTable::builtin();
        let cols = headers(&["Data Base", "Segmento", "Modalidade", "Qtd Operacoes", "Saldo"]);
        let mapping = table.resolve(Family::Credit, &cols).unwrap();
        assert_eq!(mapping.vintage, "scr-2012");
        assert_eq!(mapping.index(CanonicalField::Segment), Some(1));
    }

    #[test]
    fn indicator_named_columns_beat_positional() {
        let table = MappingTable::builtin();
        let named = table
            .resolve(Family::Indicator, &headers(&["data", "valor"]))
            .unwrap();
        assert_eq!(named.vintage, "sgs-bcdata");

        let positional = table
            .resolve(Family::Indicator, &headers(&["col0", "col1"]))
            .unwrap();
        assert_eq!(positional.vintage, "sgs-positional");
        assert_eq!(positional.index(CanonicalField::Value), Some(1));
    }

    #[test]
    fn unknown_columns_are_rejected() {
        let table = MappingTable::builtin();
        let err = table
            .resolve(Family::Credit, &headers(&["foo", "bar", "baz"]))
            .unwrap_err();
        assert_eq!(err.family, Family::Credit);
        assert!(table
            .resolve(Family::Indicator, &headers(&["a", "b", "c"]))
            .is_err());
    }
}
