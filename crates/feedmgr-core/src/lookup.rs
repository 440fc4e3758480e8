//! Typed property lookups and feed table registration planning.

use serde::Serialize;

use crate::error::{FeedMgrError, Result};
use crate::types::Property;

/// A looked-up value plus whether the fallback was used to produce it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup<T> {
    pub value: T,
    pub defaulted: bool,
}

/// First property named `name` with a non-empty value, else `default`.
pub fn lookup_or(properties: &[Property], name: &str, default: &str) -> Lookup<String> {
    match properties
        .iter()
        .filter(|p| p.name == name)
        .find_map(|p| p.value.as_deref().filter(|v| !v.trim().is_empty()))
    {
        Some(v) => Lookup {
            value: v.to_string(),
            defaulted: false,
        },
        None => Lookup {
            value: default.to_string(),
            defaulted: true,
        },
    }
}

// ---------------------------------------------------------------------------
// Table registration
// ---------------------------------------------------------------------------

pub const TABLE_TYPE: &str = "Table Type";
pub const FIELD_SPECIFICATION: &str = "Field Specification";
pub const PARTITION_SPECIFICATION: &str = "Partition Specification";
pub const FEED_FORMAT_SPECIFICATION: &str = "Feed Table Storage Format";
pub const TARGET_FORMAT_SPECIFICATION: &str = "Target Table Storage Format";
pub const TARGET_TABLE_PROPERTIES: &str = "Target Table Properties";

/// Value of [`TABLE_TYPE`] selecting the full standard table set.
pub const ALL_TABLES: &str = "ALL";

const DEFAULT_STORAGE_FORMAT: &str = "STORED AS ORC";
const DEFAULT_FEED_FORMAT_OPTIONS: &str = "ROW FORMAT DELIMITED FIELDS TERMINATED BY ',' LINES TERMINATED BY '\\n' STORED AS TEXTFILE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    Feed,
    Valid,
    Invalid,
    Profile,
    Master,
}

impl TableType {
    pub const STANDARD: [TableType; 5] = [
        TableType::Feed,
        TableType::Valid,
        TableType::Invalid,
        TableType::Profile,
        TableType::Master,
    ];

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FEED" => Some(TableType::Feed),
            "VALID" => Some(TableType::Valid),
            "INVALID" => Some(TableType::Invalid),
            "PROFILE" => Some(TableType::Profile),
            "MASTER" => Some(TableType::Master),
            _ => None,
        }
    }
}

impl std::fmt::Display for TableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TableType::Feed => "feed",
            TableType::Valid => "valid",
            TableType::Invalid => "invalid",
            TableType::Profile => "profile",
            TableType::Master => "master",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: String,
}

/// Parse `name|type` entries, one per line or comma-separated.
fn parse_columns(spec: &str) -> Vec<ColumnSpec> {
    spec.split(['\n', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(2, '|');
            let name = parts.next().unwrap_or("").trim().to_string();
            let data_type = parts.next().unwrap_or("string").trim().to_string();
            ColumnSpec { name, data_type }
        })
        .filter(|c| !c.name.is_empty())
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct TablePlan {
    pub category: String,
    pub feed: String,
    pub tables: Vec<TableType>,
    /// True when the whole standard set was selected.
    pub all_tables: bool,
    pub columns: Vec<ColumnSpec>,
    pub partitions: Vec<ColumnSpec>,
    pub feed_format: String,
    pub target_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_table_properties: Option<String>,
}

/// Decide which tables a feed registers, from its resolved properties.
pub fn plan_table_registration(
    category: &str,
    feed: &str,
    properties: &[Property],
) -> Result<TablePlan> {
    if feed.trim().is_empty() {
        return Err(FeedMgrError::TablePlan("missing feed name".into()));
    }
    if category.trim().is_empty() {
        return Err(FeedMgrError::TablePlan("missing category name".into()));
    }
    let columns = parse_columns(&lookup_or(properties, FIELD_SPECIFICATION, "").value);
    if columns.is_empty() {
        return Err(FeedMgrError::TablePlan("missing field specification".into()));
    }

    let table_type = lookup_or(properties, TABLE_TYPE, ALL_TABLES);
    let all_tables = table_type.value.eq_ignore_ascii_case(ALL_TABLES);
    let tables = if all_tables {
        TableType::STANDARD.to_vec()
    } else {
        let t = TableType::parse(&table_type.value).ok_or_else(|| {
            FeedMgrError::TablePlan(format!("unknown table type '{}'", table_type.value))
        })?;
        vec![t]
    };

    let target_table_properties = lookup_or(properties, TARGET_TABLE_PROPERTIES, "");
    Ok(TablePlan {
        category: category.to_string(),
        feed: feed.to_string(),
        tables,
        all_tables,
        columns,
        partitions: parse_columns(&lookup_or(properties, PARTITION_SPECIFICATION, "").value),
        feed_format: lookup_or(properties, FEED_FORMAT_SPECIFICATION, DEFAULT_FEED_FORMAT_OPTIONS)
            .value,
        target_format: lookup_or(properties, TARGET_FORMAT_SPECIFICATION, DEFAULT_STORAGE_FORMAT)
            .value,
        target_table_properties: (!target_table_properties.defaulted)
            .then_some(target_table_properties.value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prop(name: &str, value: &str) -> Property {
        Property::new("reg", "Register Tables", name, Some(value))
    }

    #[test]
    fn lookup_reports_default_for_missing_and_empty_values() {
        let props = vec![prop("a", "x"), prop("b", "  ")];
        assert_eq!(
            lookup_or(&props, "a", "d"),
            Lookup {
                value: "x".into(),
                defaulted: false
            }
        );
        assert!(lookup_or(&props, "b", "d").defaulted);
        assert_eq!(lookup_or(&props, "c", "d").value, "d");
    }

    #[test]
    fn table_type_defaults_to_all_standard_tables() {
        let props = vec![prop(FIELD_SPECIFICATION, "id|int\nname|string")];
        let plan = plan_table_registration("sales", "orders", &props).unwrap();
        assert!(plan.all_tables);
        assert_eq!(plan.tables.len(), 5);
        assert_eq!(plan.columns[0].data_type, "int");
        assert_eq!(plan.target_format, DEFAULT_STORAGE_FORMAT);
        assert!(plan.target_table_properties.is_none());
    }

    #[test]
    fn single_table_type_is_honored() {
        let props = vec![
            prop(FIELD_SPECIFICATION, "id|int"),
            prop(TABLE_TYPE, "profile"),
            prop(PARTITION_SPECIFICATION, "year|int"),
        ];
        let plan = plan_table_registration("sales", "orders", &props).unwrap();
        assert!(!plan.all_tables);
        assert_eq!(plan.tables, vec![TableType::Profile]);
        assert_eq!(plan.partitions.len(), 1);
    }

    #[test]
    fn missing_field_specification_is_an_error() {
        let err = plan_table_registration("sales", "orders", &[]).unwrap_err();
        assert!(err.to_string().contains("missing field specification"));
    }

    #[test]
    fn unknown_table_type_is_an_error() {
        let props = vec![prop(FIELD_SPECIFICATION, "id|int"), prop(TABLE_TYPE, "BOGUS")];
        assert!(plan_table_registration("sales", "orders", &props).is_err());
    }
}
