//! Form Schemas
//!
//! A [`FormSchema`] names one tax form, the signature phrases that identify
//! it, and the ordered fields a complete record of that form carries. Each
//! field declares the entity type it expects, the label anchors it is written
//! under, and the validation rules applied to it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::entity::EntityType;

/// Supported tax forms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FormType {
    #[serde(rename = "1040")]
    Form1040,
    #[serde(rename = "W2")]
    W2,
    #[serde(rename = "1099-NEC")]
    Form1099Nec,
}

impl FormType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Form1040 => "1040",
            Self::W2 => "W2",
            Self::Form1099Nec => "1099-NEC",
        }
    }

    /// Official form title
    pub fn title(&self) -> &'static str {
        match self {
            Self::Form1040 => "U.S. Individual Income Tax Return",
            Self::W2 => "Wage and Tax Statement",
            Self::Form1099Nec => "Nonemployee Compensation",
        }
    }
}

impl std::fmt::Display for FormType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FormType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .trim()
            .to_uppercase()
            .trim_start_matches("FORM")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match key.as_str() {
            "1040" => Ok(Self::Form1040),
            "W2" => Ok(Self::W2),
            "1099" | "1099NEC" => Ok(Self::Form1099Nec),
            _ => Err(format!("Unknown form type: {}", s)),
        }
    }
}

/// Validation rule attached to a field. `id()` is the stable rule identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum ValidationRule {
    /// `ddd-dd-dddd`, warns on known placeholder numbers
    Ssn,
    /// `dd-ddddddd`
    Ein,
    ZipCode,
    /// Letters and name punctuation only
    Name,
    FilingStatus,
    /// Four-digit year, warns when in the future or before 1900
    TaxYear,
    /// `m/d/yyyy`, `m-d-yyyy` or `yyyy-mm-dd`, warns when in the future or before 1900
    Date,
    /// Below `min` is an error, above `max` is a warning
    AmountRange { min: Decimal, max: Decimal },
    /// Value must equal the sum of the present `parts` within `tolerance`
    SumOf {
        parts: Vec<String>,
        tolerance: Decimal,
    },
    /// Value must not exceed the named field
    NotExceeding { field: String },
}

impl ValidationRule {
    pub fn id(&self) -> &'static str {
        match self {
            Self::Ssn => "ssn_format",
            Self::Ein => "ein_format",
            Self::ZipCode => "zip_code_format",
            Self::Name => "name_format",
            Self::FilingStatus => "filing_status",
            Self::TaxYear => "tax_year",
            Self::Date => "date",
            Self::AmountRange { .. } => "amount_range",
            Self::SumOf { .. } => "sum_of",
            Self::NotExceeding { .. } => "not_exceeding",
        }
    }

    /// Other fields this rule reads
    pub fn referenced_fields(&self) -> Vec<&str> {
        match self {
            Self::SumOf { parts, .. } => parts.iter().map(String::as_str).collect(),
            Self::NotExceeding { field } => vec![field.as_str()],
            _ => Vec::new(),
        }
    }
}

/// One field of a form schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub entity_type: EntityType,
    pub required: bool,
    /// Caption phrases the value is written under. Empty accepts any label.
    #[serde(default)]
    pub anchors: Vec<String>,
    #[serde(default)]
    pub rules: Vec<ValidationRule>,
}

impl FieldDefinition {
    pub fn required(name: impl Into<String>, entity_type: EntityType) -> Self {
        Self::new(name, entity_type, true)
    }

    pub fn optional(name: impl Into<String>, entity_type: EntityType) -> Self {
        Self::new(name, entity_type, false)
    }

    fn new(name: impl Into<String>, entity_type: EntityType, required: bool) -> Self {
        Self {
            name: name.into(),
            entity_type,
            required,
            anchors: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn anchored(mut self, anchors: &[&str]) -> Self {
        self.anchors = anchors.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn rule(mut self, rule: ValidationRule) -> Self {
        self.rules.push(rule);
        self
    }
}

/// Weighted phrase whose presence suggests a form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub phrase: String,
    pub weight: f64,
}

impl Signature {
    pub fn new(phrase: impl Into<String>, weight: f64) -> Self {
        Self {
            phrase: phrase.into(),
            weight,
        }
    }
}

/// A named tax form with its signature and ordered field definitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSchema {
    pub form_type: FormType,
    pub signatures: Vec<Signature>,
    pub fields: Vec<FieldDefinition>,
}

impl FormSchema {
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.required)
    }

    /// Form 1040, U.S. Individual Income Tax Return
    pub fn form_1040() -> Self {
        Self {
            form_type: FormType::Form1040,
            signatures: vec![
                Signature::new("form 1040", 3.0),
                Signature::new("individual income tax return", 3.0),
                Signature::new("filing status", 1.0),
                Signature::new("standard deduction", 1.0),
                Signature::new("taxable income", 1.0),
                Signature::new("adjusted gross income", 1.0),
                Signature::new("total income", 1.0),
            ],
            fields: vec![
                FieldDefinition::required("name", EntityType::Name)
                    .anchored(&["name", "your first name and last name", "taxpayer name"])
                    .rule(ValidationRule::Name),
                FieldDefinition::required("ssn", EntityType::Ssn)
                    .anchored(&["social security number", "your social security number", "ssn"])
                    .rule(ValidationRule::Ssn),
                FieldDefinition::required("filing_status", EntityType::FilingStatus)
                    .anchored(&["filing status"])
                    .rule(ValidationRule::FilingStatus),
                FieldDefinition::optional("tax_year", EntityType::TaxYear)
                    .anchored(&["tax year"])
                    .rule(ValidationRule::TaxYear),
                FieldDefinition::optional("wages", EntityType::Amount)
                    .anchored(&["wages"])
                    .rule(amount_range(0, 5_000_000)),
                FieldDefinition::optional("interest", EntityType::Amount)
                    .anchored(&["taxable interest", "interest"])
                    .rule(amount_range(0, 10_000_000)),
                FieldDefinition::optional("dividends", EntityType::Amount)
                    .anchored(&["ordinary dividends", "dividends"])
                    .rule(amount_range(0, 10_000_000)),
                FieldDefinition::required("total_income", EntityType::Amount)
                    .anchored(&["total income"])
                    .rule(amount_range(0, 10_000_000))
                    .rule(ValidationRule::SumOf {
                        parts: vec![
                            "wages".to_string(),
                            "interest".to_string(),
                            "dividends".to_string(),
                        ],
                        tolerance: Decimal::new(100, 2),
                    }),
                FieldDefinition::optional("federal_tax_withheld", EntityType::Amount)
                    .anchored(&["federal income tax withheld"])
                    .rule(amount_range(0, 5_000_000)),
                FieldDefinition::optional("spouse_name", EntityType::Name)
                    .anchored(&["spouse's name", "spouse name"])
                    .rule(ValidationRule::Name),
                FieldDefinition::optional("spouse_ssn", EntityType::Ssn)
                    .anchored(&["spouse's social security number", "spouse ssn"])
                    .rule(ValidationRule::Ssn),
            ],
        }
    }

    /// Form W-2, Wage and Tax Statement
    pub fn w2() -> Self {
        Self {
            form_type: FormType::W2,
            signatures: vec![
                Signature::new("form w-2", 3.0),
                Signature::new("wage and tax statement", 3.0),
                Signature::new("employer identification number", 1.0),
                Signature::new("wages, tips, other compensation", 1.0),
                Signature::new("federal income tax withheld", 1.0),
                Signature::new("social security wages", 1.0),
                Signature::new("employee", 0.5),
            ],
            fields: vec![
                FieldDefinition::required("employee_name", EntityType::Name)
                    .anchored(&["employee's name", "employee name"])
                    .rule(ValidationRule::Name),
                FieldDefinition::required("employee_ssn", EntityType::Ssn)
                    .anchored(&[
                        "employee's social security number",
                        "employee ssn",
                        "social security number",
                        "ssn",
                    ])
                    .rule(ValidationRule::Ssn),
                FieldDefinition::optional("employer_name", EntityType::Name)
                    .anchored(&["employer's name", "employer name"])
                    .rule(ValidationRule::Name),
                FieldDefinition::required("employer_ein", EntityType::Ein)
                    .anchored(&["employer identification number", "employer ein", "ein"])
                    .rule(ValidationRule::Ein),
                FieldDefinition::required("wages", EntityType::Amount)
                    .anchored(&["wages"])
                    .rule(amount_range(0, 5_000_000)),
                FieldDefinition::optional("federal_tax_withheld", EntityType::Amount)
                    .anchored(&["federal income tax withheld"])
                    .rule(amount_range(0, 2_000_000))
                    .rule(ValidationRule::NotExceeding {
                        field: "wages".to_string(),
                    }),
                FieldDefinition::optional("social_security_wages", EntityType::Amount)
                    .anchored(&["social security wages"])
                    .rule(amount_range(0, 5_000_000)),
                FieldDefinition::optional("state_wages", EntityType::Amount)
                    .anchored(&["state wages"])
                    .rule(amount_range(0, 5_000_000)),
                FieldDefinition::optional("state_tax_withheld", EntityType::Amount)
                    .anchored(&["state income tax", "state tax withheld"])
                    .rule(amount_range(0, 2_000_000)),
                FieldDefinition::optional("tax_year", EntityType::TaxYear)
                    .anchored(&["tax year"])
                    .rule(ValidationRule::TaxYear),
            ],
        }
    }

    /// Form 1099-NEC, Nonemployee Compensation
    pub fn form_1099_nec() -> Self {
        Self {
            form_type: FormType::Form1099Nec,
            signatures: vec![
                Signature::new("form 1099", 2.0),
                Signature::new("nonemployee compensation", 3.0),
                Signature::new("miscellaneous income", 1.0),
                Signature::new("payer", 0.5),
                Signature::new("recipient", 0.5),
            ],
            fields: vec![
                FieldDefinition::required("payer_name", EntityType::Name)
                    .anchored(&["payer's name", "payer name"])
                    .rule(ValidationRule::Name),
                FieldDefinition::required("payer_tin", EntityType::Ein)
                    .anchored(&["payer's tin", "payer tin", "payer's federal identification number"])
                    .rule(ValidationRule::Ein),
                FieldDefinition::required("recipient_name", EntityType::Name)
                    .anchored(&["recipient's name", "recipient name"])
                    .rule(ValidationRule::Name),
                FieldDefinition::required("recipient_tin", EntityType::Ssn)
                    .anchored(&["recipient's tin", "recipient tin", "recipient's identification number"])
                    .rule(ValidationRule::Ssn),
                FieldDefinition::required("nonemployee_compensation", EntityType::Amount)
                    .anchored(&["nonemployee compensation"])
                    .rule(amount_range(0, 10_000_000)),
                FieldDefinition::optional("federal_tax_withheld", EntityType::Amount)
                    .anchored(&["federal income tax withheld"])
                    .rule(amount_range(0, 5_000_000))
                    .rule(ValidationRule::NotExceeding {
                        field: "nonemployee_compensation".to_string(),
                    }),
                FieldDefinition::optional("tax_year", EntityType::TaxYear)
                    .anchored(&["tax year"])
                    .rule(ValidationRule::TaxYear),
            ],
        }
    }
}

fn amount_range(min: i64, max: i64) -> ValidationRule {
    ValidationRule::AmountRange {
        min: Decimal::from(min),
        max: Decimal::from(max),
    }
}

/// Schema loading and consistency errors
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Schema YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Form {0} is defined more than once")]
    DuplicateForm(FormType),

    #[error("Form {form} defines field '{field}' more than once")]
    DuplicateField { form: FormType, field: String },

    #[error("Form {form} field '{field}' references unknown field '{referenced}'")]
    UnknownFieldReference {
        form: FormType,
        field: String,
        referenced: String,
    },

    #[error("Schema registry is empty")]
    Empty,
}

/// The set of schemas the classifier chooses from, in priority order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRegistry {
    schemas: Vec<FormSchema>,
}

impl SchemaRegistry {
    pub fn new(schemas: Vec<FormSchema>) -> Result<Self, SchemaError> {
        let registry = Self { schemas };
        registry.check()?;
        Ok(registry)
    }

    /// 1040, W2 and 1099-NEC
    pub fn builtin() -> Self {
        Self {
            schemas: vec![
                FormSchema::form_1040(),
                FormSchema::w2(),
                FormSchema::form_1099_nec(),
            ],
        }
    }

    /// Load schemas from a YAML list of [`FormSchema`]
    pub fn from_yaml(yaml: &str) -> Result<Self, SchemaError> {
        let schemas: Vec<FormSchema> = serde_yaml::from_str(yaml)?;
        Self::new(schemas)
    }

    pub fn get(&self, form_type: FormType) -> Option<&FormSchema> {
        self.schemas.iter().find(|s| s.form_type == form_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FormSchema> {
        self.schemas.iter()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    fn check(&self) -> Result<(), SchemaError> {
        if self.schemas.is_empty() {
            return Err(SchemaError::Empty);
        }
        for (i, schema) in self.schemas.iter().enumerate() {
            if self.schemas[..i]
                .iter()
                .any(|s| s.form_type == schema.form_type)
            {
                return Err(SchemaError::DuplicateForm(schema.form_type));
            }
            for (j, field) in schema.fields.iter().enumerate() {
                if schema.fields[..j].iter().any(|f| f.name == field.name) {
                    return Err(SchemaError::DuplicateField {
                        form: schema.form_type,
                        field: field.name.clone(),
                    });
                }
                for rule in &field.rules {
                    if let Some(missing) = rule
                        .referenced_fields()
                        .into_iter()
                        .find(|r| !schema.has_field(r))
                    {
                        return Err(SchemaError::UnknownFieldReference {
                            form: schema.form_type,
                            field: field.name.clone(),
                            referenced: missing.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_type_parsing() {
        assert_eq!("W-2".parse::<FormType>().unwrap(), FormType::W2);
        assert_eq!("w2".parse::<FormType>().unwrap(), FormType::W2);
        assert_eq!("Form 1040".parse::<FormType>().unwrap(), FormType::Form1040);
        assert_eq!("1099-nec".parse::<FormType>().unwrap(), FormType::Form1099Nec);
        assert!("941".parse::<FormType>().is_err());
    }

    #[test]
    fn test_builtin_registry_is_consistent() {
        let registry = SchemaRegistry::builtin();
        assert!(registry.check().is_ok());
        assert_eq!(registry.len(), 3);

        let w2 = registry.get(FormType::W2).unwrap();
        let required: Vec<&str> = w2.required_fields().map(|f| f.name.as_str()).collect();
        assert_eq!(
            required,
            vec!["employee_name", "employee_ssn", "employer_ein", "wages"]
        );
    }

    #[test]
    fn test_1040_requires_total_income() {
        let schema = FormSchema::form_1040();
        let total = schema.field("total_income").unwrap();
        assert!(total.required);
        assert_eq!(total.entity_type, EntityType::Amount);
        assert!(total.rules.iter().any(|r| r.id() == "sum_of"));
    }

    #[test]
    fn test_registry_from_yaml() {
        let yaml = r#"
- form_type: W2
  signatures:
    - phrase: wage and tax statement
      weight: 3.0
  fields:
    - name: wages
      entity_type: amount
      required: true
      anchors: [wages]
      rules:
        - rule: amount_range
          min: "0"
          max: "1000000"
    - name: federal_tax_withheld
      entity_type: amount
      required: false
      rules:
        - rule: not_exceeding
          field: wages
"#;
        let registry = SchemaRegistry::from_yaml(yaml).unwrap();
        let schema = registry.get(FormType::W2).unwrap();
        assert_eq!(schema.fields.len(), 2);
        assert_eq!(
            schema.fields[0].rules[0],
            ValidationRule::AmountRange {
                min: Decimal::ZERO,
                max: Decimal::from(1_000_000),
            }
        );
    }

    #[test]
    fn test_registry_rejects_dangling_reference() {
        let mut schema = FormSchema::w2();
        schema.fields.retain(|f| f.name != "wages");
        let err = SchemaRegistry::new(vec![schema]).unwrap_err();
        assert!(matches!(
            err,
            SchemaError::UnknownFieldReference { ref referenced, .. } if referenced == "wages"
        ));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let err = SchemaRegistry::new(vec![FormSchema::w2(), FormSchema::w2()]).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateForm(FormType::W2)));
        assert!(matches!(
            SchemaRegistry::new(Vec::new()),
            Err(SchemaError::Empty)
        ));
    }
}
