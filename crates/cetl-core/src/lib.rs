//! Core domain model for the customer ETL pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cetl-core";

/// Suffix appended to a target table name to form its staging relation.
pub const STAGING_SUFFIX: &str = "_temp";

/// PostgreSQL truncates identifiers beyond this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Age bracket derived from a record's `age`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgeGroup {
    Youth,
    Adult,
    Senior,
}

impl AgeGroup {
    /// Lower bounds are inclusive: 30 is `Adult`, 40 is `Senior`.
    pub fn from_age(age: i32) -> Self {
        if age < 30 {
            AgeGroup::Youth
        } else if age < 40 {
            AgeGroup::Adult
        } else {
            AgeGroup::Senior
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgeGroup::Youth => "Youth",
            AgeGroup::Adult => "Adult",
            AgeGroup::Senior => "Senior",
        }
    }
}

impl fmt::Display for AgeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One extracted customer row with its derived age bracket.
///
/// Fields are read-only so `age_group` always matches `age`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    id: i32,
    name: Option<String>,
    age: i32,
    age_group: AgeGroup,
}

impl Record {
    pub fn new(id: i32, name: Option<String>, age: i32) -> Self {
        Self {
            id,
            name,
            age,
            age_group: AgeGroup::from_age(age),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn age(&self) -> i32 {
        self.age
    }

    pub fn age_group(&self) -> AgeGroup {
        self.age_group
    }
}

/// Ordered records produced by one extract/transform cycle. May be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Batch {
    records: Vec<Record>,
}

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

impl FromIterator<Record> for Batch {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier {name:?} is longer than {max} bytes")]
    TooLong { name: String, max: usize },
    #[error("identifier {name:?} must start with a letter or underscore")]
    LeadingDigit { name: String },
    #[error("identifier {name:?} contains {ch:?}; only ASCII letters, digits and '_' are allowed")]
    InvalidChar { name: String, ch: char },
}

/// A validated SQL identifier. Always rendered double-quoted, so it is
/// case-sensitive in the database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    pub fn parse(name: &str) -> Result<Self, IdentifierError> {
        validate_identifier(name, MAX_IDENTIFIER_LEN)?;
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a target table. Leaves room for [`STAGING_SUFFIX`] so the staging
/// relation name never gets truncated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(Identifier);

impl TableName {
    pub const MAX_LEN: usize = MAX_IDENTIFIER_LEN - STAGING_SUFFIX.len();

    pub fn parse(name: &str) -> Result<Self, IdentifierError> {
        validate_identifier(name, Self::MAX_LEN)?;
        Ok(Self(Identifier(name.to_string())))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn staging_name(&self) -> Identifier {
        Identifier(format!("{}{}", self.0.as_str(), STAGING_SUFFIX))
    }

    pub fn qualified(&self, schema: &Identifier) -> QualifiedTable {
        QualifiedTable {
            schema: schema.clone(),
            table: self.0.clone(),
        }
    }

    pub fn staging_in(&self, schema: &Identifier) -> QualifiedTable {
        QualifiedTable {
            schema: schema.clone(),
            table: self.staging_name(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// `schema.table`, rendered as `"schema"."table"` for interpolation into SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedTable {
    pub schema: Identifier,
    pub table: Identifier,
}

impl QualifiedTable {
    /// Unquoted `schema.table`, for log lines.
    pub fn display_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl fmt::Display for QualifiedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema.quoted(), self.table.quoted())
    }
}

fn validate_identifier(name: &str, max: usize) -> Result<(), IdentifierError> {
    if name.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if name.len() > max {
        return Err(IdentifierError::TooLong {
            name: name.to_string(),
            max,
        });
    }
    if let Some(ch) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        return Err(IdentifierError::InvalidChar {
            name: name.to_string(),
            ch,
        });
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(IdentifierError::LeadingDigit {
            name: name.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_brackets_are_inclusive_on_lower_bound() {
        assert_eq!(AgeGroup::from_age(-5), AgeGroup::Youth);
        assert_eq!(AgeGroup::from_age(0), AgeGroup::Youth);
        assert_eq!(AgeGroup::from_age(29), AgeGroup::Youth);
        assert_eq!(AgeGroup::from_age(30), AgeGroup::Adult);
        assert_eq!(AgeGroup::from_age(39), AgeGroup::Adult);
        assert_eq!(AgeGroup::from_age(40), AgeGroup::Senior);
        assert_eq!(AgeGroup::from_age(i32::MAX), AgeGroup::Senior);
        assert_eq!(AgeGroup::from_age(i32::MIN), AgeGroup::Youth);
    }

    #[test]
    fn age_group_serializes_as_label() {
        let json = serde_json::to_string(&AgeGroup::Senior).unwrap();
        assert_eq!(json, "\"Senior\"");
        assert_eq!(AgeGroup::Adult.to_string(), "Adult");
    }

    #[test]
    fn record_derives_age_group() {
        let record = Record::new(7, Some("Alice".into()), 28);
        assert_eq!(record.age_group(), AgeGroup::Youth);
        assert_eq!(record.name(), Some("Alice"));
    }

    #[test]
    fn table_names_are_validated() {
        assert!(TableName::parse("customers").is_ok());
        assert!(TableName::parse("_Customers_2024").is_ok());
        assert_eq!(TableName::parse(""), Err(IdentifierError::Empty));
        assert!(matches!(
            TableName::parse("1customers"),
            Err(IdentifierError::LeadingDigit { .. })
        ));
        assert!(matches!(
            TableName::parse("customers; DROP TABLE x"),
            Err(IdentifierError::InvalidChar { ch: ';', .. })
        ));
        assert!(matches!(
            TableName::parse("cu\"stomers"),
            Err(IdentifierError::InvalidChar { ch: '"', .. })
        ));
    }

    #[test]
    fn table_name_leaves_room_for_staging_suffix() {
        let longest = "t".repeat(TableName::MAX_LEN);
        let table = TableName::parse(&longest).unwrap();
        assert_eq!(table.staging_name().as_str().len(), MAX_IDENTIFIER_LEN);
        assert!(matches!(
            TableName::parse(&format!("{longest}x")),
            Err(IdentifierError::TooLong { .. })
        ));
        assert!(Identifier::parse(&format!("{longest}x")).is_ok());
    }

    #[test]
    fn qualified_names_are_quoted() {
        let schema = Identifier::parse("public").unwrap();
        let table = TableName::parse("customers").unwrap();
        assert_eq!(table.qualified(&schema).to_string(), "\"public\".\"customers\"");
        assert_eq!(
            table.staging_in(&schema).to_string(),
            "\"public\".\"customers_temp\""
        );
        assert_eq!(table.qualified(&schema).display_name(), "public.customers");
    }
}
