use indexmap::IndexMap;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::relational::transformer::{RelationalPayload, Row};

/// per-table schema constraints
#[derive(Debug, Clone, Default)]
pub struct TableSchema {
    pub required: Vec<&'static str>,
    pub defaults: IndexMap<&'static str, Value>,
    pub disallowed: Vec<&'static str>,
}

fn default_definitions() -> IndexMap<&'static str, TableSchema> {
    let mut defs = IndexMap::new();
    defs.insert(
        "applications",
        TableSchema {
            required: vec!["loan_product_id", "status"],
            defaults: IndexMap::from_iter([
                ("loan_product_id", Value::Null),
                ("status", json!("imported")),
                ("stage", json!("processing")),
            ]),
            disallowed: vec![],
        },
    );
    defs.insert(
        "customers",
        TableSchema {
            required: vec!["customer_type"],
            defaults: IndexMap::from_iter([("customer_type", json!("individual"))]),
            disallowed: vec![],
        },
    );
    defs.insert(
        "application_customers",
        TableSchema {
            required: vec!["application_id", "customer_id", "role"],
            defaults: IndexMap::from_iter([("role", json!("Borrower"))]),
            disallowed: vec![],
        },
    );
    defs.insert(
        "employments",
        TableSchema {
            required: vec![
                "customer_id",
                "application_id",
                "employment_type",
                "employer_name",
                "start_date",
            ],
            defaults: IndexMap::from_iter([
                ("employment_type", json!("W2")),
                ("start_date", Value::Null),
                ("is_current", json!(true)),
            ]),
            disallowed: vec!["metadata"],
        },
    );
    defs.insert(
        "incomes",
        TableSchema {
            required: vec![
                "customer_id",
                "application_id",
                "income_source",
                "income_type",
                "monthly_amount",
            ],
            defaults: IndexMap::from_iter([
                ("income_source", json!("Employment")),
                ("include_in_qualification", json!(true)),
            ]),
            disallowed: vec![],
        },
    );
    defs.insert(
        "demographics",
        TableSchema {
            required: vec!["customer_id", "application_id", "collection_method"],
            defaults: IndexMap::from_iter([
                ("collection_method", json!("FaceToFace")),
                ("declined_to_provide", json!(false)),
            ]),
            disallowed: vec![],
        },
    );
    defs.insert(
        "residences",
        TableSchema {
            required: vec![
                "customer_id",
                "application_id",
                "residence_type",
                "street_address",
                "city",
                "state",
                "zip_code",
            ],
            defaults: IndexMap::from_iter([
                ("residence_type", json!("Current")),
                ("city", Value::Null),
                ("state", Value::Null),
                ("zip_code", Value::Null),
                ("country", json!("US")),
            ]),
            disallowed: vec![],
        },
    );
    defs.insert(
        "assets",
        TableSchema {
            required: vec![
                "application_id",
                "asset_category",
                "asset_type",
                "cash_or_market_value",
            ],
            defaults: IndexMap::from_iter([
                ("asset_category", json!("LiquidAsset")),
                ("asset_type", json!("CheckingAccount")),
                ("cash_or_market_value", json!(0)),
                ("is_gift_or_grant", json!(false)),
                ("verification_status", json!("not_verified")),
            ]),
            disallowed: vec![],
        },
    );
    defs.insert(
        "liabilities",
        TableSchema {
            required: vec!["application_id", "liability_type", "monthly_payment"],
            defaults: IndexMap::from_iter([
                ("liability_type", json!("Other")),
                ("monthly_payment", json!(0)),
                ("to_be_paid_off_at_closing", json!(false)),
                ("will_be_subordinated", json!(false)),
                ("exclude_from_dti", json!(false)),
            ]),
            disallowed: vec![],
        },
    );
    defs.insert("properties", TableSchema::default());
    defs.insert(
        "gift_funds",
        TableSchema {
            required: vec!["application_id", "customer_id", "donor_name", "gift_amount"],
            defaults: IndexMap::from_iter([
                ("gift_letter_received", json!(false)),
                ("deposited", json!(false)),
            ]),
            disallowed: vec![],
        },
    );
    defs.insert(
        "declarations",
        TableSchema {
            required: vec!["customer_id", "application_id"],
            defaults: IndexMap::new(),
            disallowed: vec![],
        },
    );
    defs.insert(
        "real_estate_owned",
        TableSchema {
            required: vec![
                "customer_id",
                "application_id",
                "property_street_address",
                "property_city",
                "property_state",
                "property_zip_code",
            ],
            defaults: IndexMap::from_iter([
                ("property_country", json!("US")),
                ("has_mortgage", json!(false)),
                ("has_heloc", json!(false)),
                ("is_rental", json!(false)),
            ]),
            disallowed: vec![],
        },
    );
    defs
}

/// enforces destination-table schema compliance on relational payloads
///
/// adds missing required fields (from defaults or null), applies defaults for
/// absent optional fields, removes disallowed fields. unknown tables pass
/// through untouched; side-effect free per row
pub struct SchemaEnforcer {
    definitions: IndexMap<&'static str, TableSchema>,
}

impl Default for SchemaEnforcer {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaEnforcer {
    pub fn new() -> Self {
        Self {
            definitions: default_definitions(),
        }
    }

    pub fn with_definitions(definitions: IndexMap<&'static str, TableSchema>) -> Self {
        Self { definitions }
    }

    pub fn enforce(&self, payload: &RelationalPayload) -> RelationalPayload {
        let mut enforced = payload.clone();
        for (table_name, rows) in enforced.tables.iter_mut() {
            let Some(schema) = self.definitions.get(table_name.as_str()) else {
                debug!(table = %table_name, "no schema definition, passing through");
                continue;
            };
            for row in rows.iter_mut() {
                Self::enforce_row(row, schema, table_name);
            }
        }
        info!("schema enforcement complete, payload is database-ready");
        enforced
    }

    fn enforce_row(row: &mut Row, schema: &TableSchema, table_name: &str) {
        for field in &schema.disallowed {
            if row.shift_remove(*field).is_some() {
                debug!(table = table_name, field, "removed disallowed field");
            }
        }

        for field in &schema.required {
            // reference-style keys are resolved downstream: skip `x_id` when
            // the row carries the paired `_x_ref`
            if let Some(stem) = field.strip_suffix("_id") {
                if row.contains_key(&format!("_{stem}_ref")) {
                    continue;
                }
            }
            if !row.contains_key(*field) {
                let default = schema.defaults.get(*field).cloned().unwrap_or(Value::Null);
                debug!(table = table_name, field, "added missing required field");
                row.insert((*field).to_string(), default);
            }
        }

        for (field, default) in &schema.defaults {
            if !row.contains_key(*field) && !schema.required.contains(field) {
                row.insert((*field).to_string(), default.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relational::transformer::PayloadMetadata;
    use pretty_assertions::assert_eq;

    fn payload_with(table: &str, rows: Vec<Row>) -> RelationalPayload {
        let mut tables = IndexMap::new();
        tables.insert(table.to_string(), rows);
        RelationalPayload {
            metadata: PayloadMetadata {
                source: "test".into(),
                timestamp: "2024-01-15T00:00:00Z".into(),
                table_count: 1,
                total_rows: 1,
            },
            tables,
        }
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_required_fields_filled_from_defaults() {
        let payload = payload_with("employments", vec![row(&[("_ref", json!("employment_0_0"))])]);
        let enforced = SchemaEnforcer::new().enforce(&payload);
        let employment = &enforced.table("employments")[0];
        assert_eq!(employment.get("employment_type"), Some(&json!("W2")));
        assert_eq!(employment.get("start_date"), Some(&Value::Null));
        assert_eq!(employment.get("is_current"), Some(&json!(true)));
        // no paired refs on this row, so fk columns are filled with null
        assert_eq!(employment.get("customer_id"), Some(&Value::Null));
    }

    #[test]
    fn test_ref_paired_id_fields_skipped() {
        let payload = payload_with(
            "employments",
            vec![row(&[
                ("_customer_ref", json!("customer_0")),
                ("_application_ref", json!("application_0")),
                ("employer_name", json!("Initech LLC")),
            ])],
        );
        let enforced = SchemaEnforcer::new().enforce(&payload);
        let employment = &enforced.table("employments")[0];
        // resolved at insert time, not filled here
        assert!(!employment.contains_key("customer_id"));
        assert!(!employment.contains_key("application_id"));
    }

    #[test]
    fn test_disallowed_fields_removed() {
        let payload = payload_with(
            "employments",
            vec![row(&[
                ("employer_name", json!("Initech LLC")),
                ("metadata", json!({"source": "test"})),
            ])],
        );
        let enforced = SchemaEnforcer::new().enforce(&payload);
        assert!(!enforced.table("employments")[0].contains_key("metadata"));
    }

    #[test]
    fn test_optional_defaults_applied() {
        let payload = payload_with("assets", vec![row(&[("_application_ref", json!("application_0"))])]);
        let enforced = SchemaEnforcer::new().enforce(&payload);
        let asset = &enforced.table("assets")[0];
        assert_eq!(asset.get("is_gift_or_grant"), Some(&json!(false)));
        assert_eq!(asset.get("verification_status"), Some(&json!("not_verified")));
        assert_eq!(asset.get("cash_or_market_value"), Some(&json!(0)));
    }

    #[test]
    fn test_unknown_table_passes_through() {
        let original = payload_with("mystery_table", vec![row(&[("anything", json!(1))])]);
        let enforced = SchemaEnforcer::new().enforce(&original);
        assert_eq!(enforced.table("mystery_table"), original.table("mystery_table"));
    }

    #[test]
    fn test_enforcement_is_idempotent() {
        let payload = payload_with(
            "incomes",
            vec![row(&[
                ("_customer_ref", json!("customer_0")),
                ("income_type", json!("Base")),
            ])],
        );
        let enforcer = SchemaEnforcer::new();
        let once = enforcer.enforce(&payload);
        let twice = enforcer.enforce(&once);
        assert_eq!(once, twice);
    }
}
