//! Validator
//!
//! Applies each field's [`ValidationRule`]s to the resolved values. Findings
//! are data, never errors: an invalid form is an expected outcome.

use chrono::{Datelike, NaiveDate, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::LazyLock;

use crate::resolver::ResolvedField;
use crate::schema::{FieldDefinition, FormSchema, ValidationRule};

/// SSNs that are well-formed but never issued
pub const PLACEHOLDER_SSNS: [&str; 3] = ["000-00-0000", "123-45-6789", "111-11-1111"];

const FILING_STATUSES: [&str; 6] = [
    "single",
    "married filing jointly",
    "married filing separately",
    "head of household",
    "qualifying widow(er)",
    "qualifying surviving spouse",
];

static SSN_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{3}-\d{2}-\d{4}$").expect("valid regex"));
static EIN_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{2}-\d{7}$").expect("valid regex"));
static ZIP_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{5}(?:-\d{4})?$").expect("valid regex"));
static NAME_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z .,'&\-]*[A-Za-z.]$").expect("valid regex"));
static YEAR_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}$").expect("valid regex"));

const DATE_FORMATS: [&str; 3] = ["%m/%d/%Y", "%m-%d-%Y", "%Y-%m-%d"];

/// Validator tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Bound values extracted below this confidence get a warning
    pub low_confidence_threshold: f64,
    /// Years and dates before this year get a warning
    pub earliest_year: i32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            low_confidence_threshold: 0.6,
            earliest_year: 1900,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub field: String,
    pub severity: Severity,
    /// Rule identifier, `required` or `low_confidence`
    pub rule: String,
    pub reason: String,
}

impl ValidationFinding {
    pub fn error(field: &str, rule: &str, reason: impl Into<String>) -> Self {
        Self::new(field, Severity::Error, rule, reason)
    }

    pub fn warning(field: &str, rule: &str, reason: impl Into<String>) -> Self {
        Self::new(field, Severity::Warning, rule, reason)
    }

    fn new(field: &str, severity: Severity, rule: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            severity,
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }
}

/// Validator's categorical judgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Valid,
    ValidWithWarnings,
    Invalid,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::ValidWithWarnings => "valid_with_warnings",
            Self::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub findings: Vec<ValidationFinding>,
    pub verdict: Verdict,
}

impl ValidationResult {
    pub fn from_findings(findings: Vec<ValidationFinding>) -> Self {
        let verdict = if findings.iter().any(|f| f.severity == Severity::Error) {
            Verdict::Invalid
        } else if findings.is_empty() {
            Verdict::Valid
        } else {
            Verdict::ValidWithWarnings
        };
        Self { findings, verdict }
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationFinding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationFinding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
    }

    pub fn findings_for<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a ValidationFinding> {
        self.findings.iter().filter(move |f| f.field == field)
    }
}

/// Parse `$1,234.56`, `1234` or `-12.00` into a decimal
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | ',') && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned).ok()
}

fn value_of<'a>(fields: &'a [ResolvedField], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|f| f.name == name)
        .and_then(|f| f.value_str())
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw.trim(), fmt).ok())
}

#[derive(Debug, Clone)]
pub struct Validator {
    config: ValidatorConfig,
    today: Option<NaiveDate>,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            config,
            today: None,
        }
    }

    /// Pin the date future-date checks compare against
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    pub fn validate(&self, schema: &FormSchema, fields: &[ResolvedField]) -> ValidationResult {
        let mut findings = Vec::new();
        for def in &schema.fields {
            let resolved = fields.iter().find(|f| f.name == def.name);
            let Some((field, value)) = resolved.and_then(|f| f.value_str().map(|v| (f, v))) else {
                if def.required {
                    findings.push(ValidationFinding::error(
                        &def.name,
                        "required",
                        "Required field is missing",
                    ));
                }
                continue;
            };

            if field.confidence < self.config.low_confidence_threshold {
                findings.push(ValidationFinding::warning(
                    &def.name,
                    "low_confidence",
                    format!(
                        "Extraction confidence {:.2} is below {:.2}",
                        field.confidence, self.config.low_confidence_threshold
                    ),
                ));
            }

            for rule in &def.rules {
                if let Some(finding) = self.apply(def, rule, value, fields) {
                    findings.push(finding);
                }
            }
        }

        let result = ValidationResult::from_findings(findings);
        tracing::debug!(
            form_type = %schema.form_type,
            verdict = %result.verdict,
            findings = result.findings.len(),
            "Validated fields"
        );
        result
    }

    fn apply(
        &self,
        def: &FieldDefinition,
        rule: &ValidationRule,
        value: &str,
        fields: &[ResolvedField],
    ) -> Option<ValidationFinding> {
        let field = def.name.as_str();
        let id = rule.id();
        match rule {
            ValidationRule::Ssn => {
                if !SSN_FORMAT.is_match(value) {
                    Some(ValidationFinding::error(field, id, "Invalid SSN format, expected XXX-XX-XXXX"))
                } else if PLACEHOLDER_SSNS.contains(&value) {
                    Some(ValidationFinding::warning(field, id, "SSN looks like a placeholder"))
                } else {
                    None
                }
            }
            ValidationRule::Ein => (!EIN_FORMAT.is_match(value)).then(|| {
                ValidationFinding::error(field, id, "Invalid EIN format, expected XX-XXXXXXX")
            }),
            ValidationRule::ZipCode => (!ZIP_FORMAT.is_match(value)).then(|| {
                ValidationFinding::error(field, id, "Invalid ZIP code, expected XXXXX or XXXXX-XXXX")
            }),
            ValidationRule::Name => (!NAME_FORMAT.is_match(value.trim())).then(|| {
                ValidationFinding::error(field, id, format!("'{}' is not a valid name", value))
            }),
            ValidationRule::FilingStatus => {
                let normalized = value.trim().to_lowercase();
                (!FILING_STATUSES.contains(&normalized.as_str())).then(|| {
                    ValidationFinding::error(field, id, format!("Unknown filing status '{}'", value))
                })
            }
            ValidationRule::TaxYear => {
                let year = YEAR_FORMAT
                    .is_match(value.trim())
                    .then(|| value.trim().parse::<i32>().ok())
                    .flatten();
                match year {
                    None => Some(ValidationFinding::error(
                        field,
                        id,
                        format!("'{}' is not a four-digit year", value),
                    )),
                    Some(y) => self.year_warning(field, id, y),
                }
            }
            ValidationRule::Date => match parse_date(value) {
                None => Some(ValidationFinding::error(
                    field,
                    id,
                    format!("'{}' is not a valid date", value),
                )),
                Some(date) if date > self.today() => Some(ValidationFinding::warning(
                    field,
                    id,
                    format!("Date {} is in the future", date),
                )),
                Some(date) => self.year_warning(field, id, date.year()),
            },
            ValidationRule::AmountRange { min, max } => match parse_amount(value) {
                None => Some(ValidationFinding::error(
                    field,
                    id,
                    format!("'{}' is not a valid amount", value),
                )),
                Some(amount) if amount < *min => Some(ValidationFinding::error(
                    field,
                    id,
                    format!("Amount {} is below minimum {}", amount, min),
                )),
                Some(amount) if amount > *max => Some(ValidationFinding::warning(
                    field,
                    id,
                    format!("Amount {} exceeds expected maximum {}", amount, max),
                )),
                Some(_) => None,
            },
            ValidationRule::SumOf { parts, tolerance } => {
                let total = parse_amount(value)?;
                let present: Vec<Decimal> = parts
                    .iter()
                    .filter_map(|p| value_of(fields, p).and_then(parse_amount))
                    .collect();
                if present.is_empty() {
                    return None;
                }
                let sum: Decimal = present.into_iter().sum();
                ((total - sum).abs() > *tolerance).then(|| {
                    ValidationFinding::error(
                        field,
                        id,
                        format!(
                            "{} does not equal the sum of {} ({})",
                            total,
                            parts.join(" + "),
                            sum
                        ),
                    )
                })
            }
            ValidationRule::NotExceeding { field: other } => {
                let own = parse_amount(value)?;
                let limit = value_of(fields, other).and_then(parse_amount)?;
                (own > limit).then(|| {
                    ValidationFinding::error(
                        field,
                        id,
                        format!("{} exceeds {} ({})", own, other, limit),
                    )
                })
            }
        }
    }

    fn year_warning(&self, field: &str, rule: &str, year: i32) -> Option<ValidationFinding> {
        if year > self.today().year() {
            Some(ValidationFinding::warning(
                field,
                rule,
                format!("Year {} is in the future", year),
            ))
        } else if year < self.config.earliest_year {
            Some(ValidationFinding::warning(
                field,
                rule,
                format!("Year {} is before {}", year, self.config.earliest_year),
            ))
        } else {
            None
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}
