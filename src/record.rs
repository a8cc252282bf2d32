//! Input records: the data one generated document is built from.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use tracing::warn;

use crate::error::SynthesisError;

pub const MAX_SEGMENTS: usize = 6;
pub const MAX_SUB_SEGMENTS: usize = 10;
pub const MAX_COMPANIES: usize = 10;

/// Flat key/value form of a record, as submitted by callers
/// (`market_name`, `Segment1`, `Segment1Sub-segment1`, `Company1`, ...).
pub type FlatRecord = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub enum TemplateClass {
    Global,
    Regional,
    Country,
}

impl TemplateClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "Global",
            Self::Regional => "Regional",
            Self::Country => "Country",
        }
    }
}

impl fmt::Display for TemplateClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateClass {
    type Err = SynthesisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Global" => Ok(Self::Global),
            "Regional" => Ok(Self::Regional),
            "Country" => Ok(Self::Country),
            other => Err(SynthesisError::InvalidTemplateType(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Region {
    NorthAmerica,
    Europe,
    AsiaPacific,
    MiddleEastAfrica,
    LatinAmerica,
}

impl Region {
    pub const ALL: [Region; 5] = [
        Region::NorthAmerica,
        Region::Europe,
        Region::AsiaPacific,
        Region::MiddleEastAfrica,
        Region::LatinAmerica,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::NorthAmerica => "North America",
            Self::Europe => "Europe",
            Self::AsiaPacific => "Asia Pacific",
            Self::MiddleEastAfrica => "Middle East & Africa",
            Self::LatinAmerica => "Latin America",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Region {
    type Err = SynthesisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Region::ALL
            .into_iter()
            .find(|r| r.label() == s)
            .ok_or_else(|| SynthesisError::InvalidRegion(s.to_string()))
    }
}

/// Geographic scope of a document, tied to its template class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    Global,
    Regional(Region),
    Country(String),
}

impl Scope {
    pub fn class(&self) -> TemplateClass {
        match self {
            Self::Global => TemplateClass::Global,
            Self::Regional(_) => TemplateClass::Regional,
            Self::Country(_) => TemplateClass::Country,
        }
    }

    /// Text the scope placeholders are replaced with.
    pub fn label(&self) -> &str {
        match self {
            Self::Global => "Global",
            Self::Regional(r) => r.label(),
            Self::Country(c) => c,
        }
    }

    pub fn region(&self) -> Option<Region> {
        match self {
            Self::Regional(r) => Some(*r),
            _ => None,
        }
    }
}

/// One taxonomy segment. A segment submitted with a blank name keeps its
/// position in the numbering but is not present in the document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub sub_segments: Vec<String>,
}

impl Segment {
    pub fn is_present(&self) -> bool {
        !self.name.trim().is_empty()
    }
}

/// One validated input record. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputRecord {
    market_name: String,
    scope: Scope,
    segments: Vec<Segment>,
    companies: Vec<String>,
}

impl InputRecord {
    /// Builds a record, keeping at most six segments, ten sub-segments per
    /// segment and ten companies.
    pub fn new(
        market_name: impl Into<String>,
        scope: Scope,
        mut segments: Vec<Segment>,
        mut companies: Vec<String>,
    ) -> Self {
        if segments.len() > MAX_SEGMENTS {
            warn!(count = segments.len(), "only the first {MAX_SEGMENTS} segments are used");
            segments.truncate(MAX_SEGMENTS);
        }
        for seg in &mut segments {
            if seg.sub_segments.len() > MAX_SUB_SEGMENTS {
                warn!(segment = %seg.name, "only the first {MAX_SUB_SEGMENTS} sub-segments are used");
                seg.sub_segments.truncate(MAX_SUB_SEGMENTS);
            }
        }
        if companies.len() > MAX_COMPANIES {
            warn!(count = companies.len(), "only the first {MAX_COMPANIES} companies are used");
            companies.truncate(MAX_COMPANIES);
        }
        Self {
            market_name: market_name.into(),
            scope,
            segments,
            companies,
        }
    }

    /// Parses the flat submission format.
    ///
    /// A missing `template_type` means Global. Segments and sub-segments are
    /// read from index 1 up to the first missing (or blank) entry; companies
    /// keep their numbered positions, with gaps left empty.
    pub fn from_flat(flat: &FlatRecord) -> Result<Self, SynthesisError> {
        let class = match value(flat, "template_type") {
            Some(v) => v.parse::<TemplateClass>()?,
            None => TemplateClass::Global,
        };
        let scope = match class {
            TemplateClass::Global => Scope::Global,
            TemplateClass::Regional => {
                let region = value(flat, "region").ok_or(SynthesisError::MissingScopeField {
                    class: class.to_string(),
                    field: "region",
                })?;
                Scope::Regional(region.parse()?)
            }
            TemplateClass::Country => {
                let country = value(flat, "country").ok_or(SynthesisError::MissingScopeField {
                    class: class.to_string(),
                    field: "country",
                })?;
                Scope::Country(country.trim().to_string())
            }
        };

        let market_name = flat.get("market_name").cloned().unwrap_or_default();
        let segments = materialize(flat);

        let mut companies: Vec<String> = Vec::new();
        for i in 1..=MAX_COMPANIES {
            if let Some(c) = value(flat, &company_key(i)) {
                companies.resize(i - 1, String::new());
                companies.push(c.to_string());
            }
        }

        Ok(Self::new(market_name, scope, segments, companies))
    }

    pub fn market_name(&self) -> &str {
        &self.market_name
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn template_class(&self) -> TemplateClass {
        self.scope.class()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// 1-based numbers of the segments that carry a name.
    pub fn present_segments(&self) -> Vec<usize> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_present())
            .map(|(i, _)| i + 1)
            .collect()
    }

    pub fn companies(&self) -> &[String] {
        &self.companies
    }

    /// `{Region|Country|Global} {market_name} Market.docx`
    pub fn file_name(&self) -> String {
        format!("{} {} Market.docx", self.scope.label(), self.market_name)
    }

    /// Flat form of this record, as stored alongside generated documents.
    pub fn to_flat(&self) -> FlatRecord {
        let mut flat = FlatRecord::new();
        flat.insert("template_type".into(), self.template_class().to_string());
        flat.insert("market_name".into(), self.market_name.clone());
        match &self.scope {
            Scope::Global => {}
            Scope::Regional(r) => {
                flat.insert("region".into(), r.label().to_string());
            }
            Scope::Country(c) => {
                flat.insert("country".into(), c.clone());
            }
        }
        for (i, seg) in self.segments.iter().enumerate() {
            flat.insert(segment_key(i + 1), seg.name.clone());
            for (j, sub) in seg.sub_segments.iter().enumerate() {
                flat.insert(sub_segment_key(i + 1, j + 1), sub.clone());
            }
        }
        for (i, c) in self.companies.iter().enumerate() {
            if !c.is_empty() {
                flat.insert(company_key(i + 1), c.clone());
            }
        }
        flat
    }
}

/// Reads the ordered segment list out of flat fields, stopping at the first
/// missing key for segments and, per segment, for sub-segments. A key that
/// is present with a blank value keeps its slot.
pub fn materialize(flat: &FlatRecord) -> Vec<Segment> {
    let mut segments = Vec::new();
    for i in 1..=MAX_SEGMENTS {
        let Some(name) = flat.get(&segment_key(i)) else {
            break;
        };
        let mut sub_segments = Vec::new();
        for j in 1..=MAX_SUB_SEGMENTS {
            match flat.get(&sub_segment_key(i, j)) {
                Some(sub) => sub_segments.push(sub.trim().to_string()),
                None => break,
            }
        }
        segments.push(Segment {
            name: name.trim().to_string(),
            sub_segments,
        });
    }
    segments
}

pub fn segment_key(i: usize) -> String {
    format!("Segment{i}")
}

pub fn sub_segment_key(i: usize, j: usize) -> String {
    format!("Segment{i}Sub-segment{j}")
}

pub fn company_key(i: usize) -> String {
    format!("Company{i}")
}

fn value<'a>(flat: &'a FlatRecord, key: &str) -> Option<&'a str> {
    flat.get(key)
        .map(|v| v.as_str())
        .filter(|v| !v.trim().is_empty())
}

/// Converts a JSON object into the flat record form. Scalars are rendered as
/// text; nulls are dropped.
pub fn flat_from_json(value: &serde_json::Value) -> anyhow::Result<FlatRecord> {
    let obj = value
        .as_object()
        .ok_or_else(|| anyhow!("record must be a JSON object"))?;
    let mut flat = FlatRecord::new();
    for (k, v) in obj {
        let text = match v {
            serde_json::Value::Null => continue,
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Bool(_) | serde_json::Value::Number(_) => v.to_string(),
            _ => return Err(anyhow!("field {k} must be a scalar")),
        };
        flat.insert(k.clone(), text);
    }
    Ok(flat)
}
