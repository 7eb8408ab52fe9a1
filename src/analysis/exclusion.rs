use crate::analysis::units::convert_to_bytes;
use crate::config::{ConfigError, ExclusionFileSnafu};
use crate::models::{QualifiedName, WastedSpace};
use snafu::ResultExt;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// Per-object override that keeps an object out of reports.
///
/// Both ceilings at zero exclude the object unconditionally. Otherwise the
/// object stays excluded while its waste is within every nonzero ceiling; a
/// zero ceiling next to a nonzero one does not bound that dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct ExclusionRule {
    pub object: QualifiedName,
    pub max_wasted_bytes: i64,
    pub max_wasted_percent: f64,
}

impl ExclusionRule {
    pub fn unconditional(object: QualifiedName) -> Self {
        Self {
            object,
            max_wasted_bytes: 0,
            max_wasted_percent: 0.0,
        }
    }

    pub fn is_unconditional(&self) -> bool {
        self.max_wasted_bytes == 0 && self.max_wasted_percent == 0.0
    }

    pub fn excludes(&self, waste: &WastedSpace) -> bool {
        if self.is_unconditional() {
            return true;
        }
        let within_bytes = self.max_wasted_bytes == 0 || waste.wasted_bytes <= self.max_wasted_bytes;
        let within_percent =
            self.max_wasted_percent == 0.0 || waste.wasted_percent <= self.max_wasted_percent;
        within_bytes && within_percent
    }
}

/// Exclusion rules keyed by exact qualified name.
#[derive(Debug, Clone, Default)]
pub struct ExclusionList {
    rules: HashMap<QualifiedName, ExclusionRule>,
}

impl ExclusionList {
    pub fn new(rules: Vec<ExclusionRule>) -> Result<Self, ConfigError> {
        let mut list = Self::default();
        for rule in rules {
            list.insert(rule)?;
        }
        Ok(list)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let reader = csv_reader()
            .from_path(path)
            .context(ExclusionFileSnafu { path })?;
        Self::from_csv(reader, path)
    }

    pub fn from_reader<R: Read>(input: R) -> Result<Self, ConfigError> {
        Self::from_csv(csv_reader().from_reader(input), Path::new("<input>"))
    }

    fn from_csv<R: Read>(mut reader: csv::Reader<R>, path: &Path) -> Result<Self, ConfigError> {
        let mut list = Self::default();
        for record in reader.records() {
            let record = record.context(ExclusionFileSnafu { path })?;
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            list.insert(parse_rule(&record, line)?)?;
        }
        Ok(list)
    }

    fn insert(&mut self, rule: ExclusionRule) -> Result<(), ConfigError> {
        if self.rules.contains_key(&rule.object) {
            return Err(ConfigError::DuplicateExclusion {
                object: rule.object.to_string(),
            });
        }
        self.rules.insert(rule.object.clone(), rule);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn get(&self, object: &QualifiedName) -> Option<&ExclusionRule> {
        self.rules.get(object)
    }

    /// Check usable before sampling: only zero-ceiling rules can answer
    /// without measurements.
    pub fn excludes_unconditionally(&self, object: &QualifiedName) -> bool {
        self.get(object).is_some_and(ExclusionRule::is_unconditional)
    }

    pub fn should_exclude(&self, object: &QualifiedName, waste: &WastedSpace) -> bool {
        self.get(object).is_some_and(|rule| rule.excludes(waste))
    }
}

fn csv_reader() -> csv::ReaderBuilder {
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All);
    builder
}

fn parse_rule(record: &csv::StringRecord, line: u64) -> Result<ExclusionRule, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidExclusionRule { line, reason };

    let raw_name = record.get(0).unwrap_or_default();
    let object = QualifiedName::parse(raw_name)
        .ok_or_else(|| invalid(format!("object '{raw_name}' must be schema qualified")))?;

    let max_wasted_bytes = match record.get(1).filter(|v| !v.is_empty()) {
        None => 0,
        Some(value) => convert_to_bytes(value)
            .as_i64()
            .ok_or_else(|| invalid(format!("invalid wasted bytes ceiling '{value}'")))?,
    };

    let max_wasted_percent = match record.get(2).filter(|v| !v.is_empty()) {
        None => 0.0,
        Some(value) => value
            .parse::<f64>()
            .map_err(|_| invalid(format!("invalid wasted percent ceiling '{value}'")))?,
    };

    Ok(ExclusionRule {
        object,
        max_wasted_bytes,
        max_wasted_percent,
    })
}
