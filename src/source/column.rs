//! Column metadata reported by data sources.
//!
//! A [`ColumnInfo`] describes a single result column (ordinal, name,
//! declared type and nullability). These descriptors travel unchanged from
//! the driver to the client, which uses them to render the results grid.

use serde::{Deserialize, Serialize};

/// Column name SQL Server style engines use for `FOR XML` output.
pub const XML_COLUMN_NAME: &str = "XML_F52E2B61-18A1-11d1-B105-00805F49916B";

/// Column name SQL Server style engines use for `FOR JSON` output.
pub const JSON_COLUMN_NAME: &str = "JSON_F52E2B61-18A1-11d1-B105-00805F49916B";

/// Columns of SQLite's `EXPLAIN QUERY PLAN` output.
pub const QUERY_PLAN_COLUMNS: [&str; 4] = ["id", "parent", "notused", "detail"];

/// Metadata describing a result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    /// Zero-based position within the result set.
    pub ordinal: usize,
    /// Column name (or alias). May be empty for unnamed expressions.
    pub name: String,
    /// Declared type as reported by the driver (e.g. `INTEGER`), or empty.
    pub data_type_name: String,
    /// Whether the column may contain NULL. Drivers that cannot tell report `true`.
    pub allow_null: bool,
}

impl ColumnInfo {
    /// Creates a nullable column with the given position, name and declared type.
    pub fn new(ordinal: usize, name: impl Into<String>, data_type_name: impl Into<String>) -> Self {
        Self {
            ordinal,
            name: name.into(),
            data_type_name: data_type_name.into(),
            allow_null: true,
        }
    }

    /// Returns the display name for this column.
    ///
    /// Unnamed columns render as `(No column name)`.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "(No column name)"
        } else {
            &self.name
        }
    }

    /// Returns true if this is the single column of a `FOR XML` result.
    pub fn is_xml_result(&self) -> bool {
        self.name == XML_COLUMN_NAME
    }

    /// Returns true if this is the single column of a `FOR JSON` result.
    pub fn is_json_result(&self) -> bool {
        self.name == JSON_COLUMN_NAME
    }
}

/// Returns true if the columns have the shape of a query plan listing.
pub fn is_query_plan(columns: &[ColumnInfo]) -> bool {
    columns.len() == QUERY_PLAN_COLUMNS.len()
        && columns
            .iter()
            .zip(QUERY_PLAN_COLUMNS)
            .all(|(column, name)| column.name.eq_ignore_ascii_case(name))
}
