use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::canonical::model::{
    Asset, CanonicalRecord, Employment, Individual, Party, SubjectProperty,
};
use crate::decimal::Money;
use crate::value::{clean_currency, parse_address, parse_city_state_zip, split_name, to_iso_date};

/// one relational row: column -> json value, plus internal `_ref` keys
pub type Row = IndexMap<String, Value>;

/// payload header with row/table counts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadMetadata {
    pub source: String,
    pub timestamp: String,
    pub table_count: usize,
    pub total_rows: usize,
}

/// database action payload: table name -> ordered rows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationalPayload {
    #[serde(rename = "_metadata")]
    pub metadata: PayloadMetadata,
    #[serde(flatten)]
    pub tables: IndexMap<String, Vec<Row>>,
}

impl RelationalPayload {
    pub fn table(&self, name: &str) -> &[Row] {
        self.tables.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// every `_x_ref` value must name some row's `_ref` in the payload
    pub fn unresolved_refs(&self) -> Vec<String> {
        let mut known: Vec<&str> = Vec::new();
        for rows in self.tables.values() {
            for row in rows {
                if let Some(Value::String(r)) = row.get("_ref") {
                    known.push(r);
                }
            }
        }
        let mut unresolved = Vec::new();
        for rows in self.tables.values() {
            for row in rows {
                for (key, value) in row {
                    if key == "_ref" || !(key.starts_with('_') && key.ends_with("_ref")) {
                        continue;
                    }
                    if let Value::String(target) = value {
                        if !known.contains(&target.as_str()) {
                            unresolved.push(format!("{key} -> {target}"));
                        }
                    }
                }
            }
        }
        unresolved
    }
}

fn money_value(m: Money) -> Value {
    decimal_value(m.as_decimal())
}

fn decimal_value(d: Decimal) -> Value {
    serde_json::Number::from_f64(d.to_f64().unwrap_or(0.0))
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn title_case(s: &str) -> String {
    s.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// canonical record -> relational table payload
///
/// internal `_ref` keys cross-reference rows; real identifiers are allocated
/// at insert time by the downstream client
#[derive(Debug, Default)]
pub struct RelationalTransformer;

impl RelationalTransformer {
    pub fn new() -> Self {
        Self
    }

    pub fn transform(&self, record: &CanonicalRecord, now: DateTime<Utc>) -> RelationalPayload {
        let deal = &record.deal;

        let mut properties: Vec<Row> = Vec::new();
        let mut applications: Vec<Row> = Vec::new();
        let mut customers: Vec<Row> = Vec::new();
        let mut app_customers: Vec<Row> = Vec::new();
        let mut employments: Vec<Row> = Vec::new();
        let mut incomes: Vec<Row> = Vec::new();
        let mut demographics: Vec<Row> = Vec::new();
        let mut residences: Vec<Row> = Vec::new();
        let mut assets: Vec<Row> = Vec::new();
        let mut liabilities: Vec<Row> = Vec::new();

        // property from collateral
        let subject = deal.collateral.as_ref().and_then(|c| c.subject_property.as_ref());
        let prop_ref = subject.map(|property| {
            let row = self.transform_property(property);
            let r = "property_0".to_string();
            properties.push(row);
            r
        });

        // application from transaction + disclosures + identifiers
        let mut app_row = self.transform_application(record, prop_ref.as_deref());
        let app_ref = "application_0".to_string();
        if let Some(occupancy) = subject.and_then(|s| s.occupancy_type.as_ref()) {
            app_row.insert("occupancy_type".into(), json!(occupancy.value));
        }

        let mut primary_customer_ref: Option<String> = None;

        for (idx, party) in deal.parties.iter().enumerate() {
            // lender parties map to key_information, not customers
            if party.is_lender() {
                let mut lender_info = serde_json::Map::new();
                if let Some(company) = &party.company_name {
                    lender_info.insert("lender_name".into(), json!(company));
                }
                if let Some(individual) = &party.individual {
                    if let Some(name) = &individual.full_name {
                        lender_info.insert("loan_officer_name".into(), json!(name));
                    }
                    if let Some(nmls) = &individual.nmls_id {
                        lender_info.insert("loan_officer_nmls".into(), json!(nmls));
                    }
                }
                if !lender_info.is_empty() {
                    let key_info = app_row
                        .entry("key_information".to_string())
                        .or_insert_with(|| json!({}));
                    if let Some(map) = key_info.as_object_mut() {
                        map.insert("lender".into(), Value::Object(lender_info));
                    }
                    info!("preserved lender information on application");
                }
                continue;
            }

            let cust_ref = format!("customer_{idx}");
            let has_customer_data = party.individual.is_some() || party.company_name.is_some();

            if has_customer_data {
                let individual = party.individual.clone().unwrap_or_default();
                customers.push(self.transform_customer(&individual, &cust_ref));
                if primary_customer_ref.is_none() {
                    primary_customer_ref = Some(cust_ref.clone());
                }

                let mut junction = Row::new();
                junction.insert("_ref".into(), json!(format!("app_cust_{idx}")));
                junction.insert("_operation".into(), json!("insert"));
                junction.insert("_application_ref".into(), json!(app_ref));
                junction.insert("_customer_ref".into(), json!(cust_ref));
                let role = party.role();
                junction.insert(
                    "role".into(),
                    json!(if role.is_empty() { "Borrower" } else { role }),
                );
                junction.insert("sequence".into(), json!(idx + 1));
                app_customers.push(junction);

                if let Some(demo) = self.transform_demographics(&individual, &cust_ref, &app_ref) {
                    demographics.push(demo);
                }

                for (addr_idx, address) in party.addresses.iter().enumerate() {
                    if let Some(row) =
                        self.transform_residence(address, &cust_ref, &app_ref, addr_idx)
                    {
                        residences.push(row);
                    }
                }
            } else {
                warn!(party = idx, "party has no individual/company data, related records keep placeholder ref");
            }

            for (emp_idx, employment) in party.employment.iter().enumerate() {
                let emp_ref = format!("employment_{idx}_{emp_idx}");
                employments.push(self.transform_employment(employment, &emp_ref, &cust_ref, &app_ref));

                if let Some(income) = &employment.monthly_income {
                    for (income_type, amount) in income.components() {
                        let mut row = Row::new();
                        row.insert("_ref".into(), json!(format!("income_{idx}_{emp_idx}_{income_type}")));
                        row.insert("_operation".into(), json!("insert"));
                        row.insert("_customer_ref".into(), json!(cust_ref));
                        row.insert("_application_ref".into(), json!(app_ref));
                        row.insert("_employment_ref".into(), json!(emp_ref));
                        row.insert("income_source".into(), json!("Employment"));
                        row.insert("income_type".into(), json!(title_case(income_type)));
                        row.insert("monthly_amount".into(), money_value(amount));
                        incomes.push(row);
                    }
                }
            }

            for (self_idx, self_employment) in party.self_employment.iter().enumerate() {
                let emp_ref = format!("employment_{idx}_self_{self_idx}");
                let mut row = Row::new();
                row.insert("_ref".into(), json!(emp_ref));
                row.insert("_operation".into(), json!("insert"));
                row.insert("_customer_ref".into(), json!(cust_ref));
                row.insert("_application_ref".into(), json!(app_ref));
                row.insert("employment_type".into(), json!("SelfEmployed"));
                row.insert("is_self_employed".into(), json!(true));
                row.insert("is_current".into(), json!(true));
                row.insert("start_date".into(), Value::Null);
                if let Some(name) = &self_employment.business_name {
                    row.insert("employer_name".into(), json!(name));
                }
                if let Some(phone) = &self_employment.business_phone {
                    row.insert("employer_phone".into(), json!(phone));
                }
                if let Some(street) = &self_employment.business_address_street {
                    row.insert("employer_street_address".into(), json!(street));
                }
                if let Some(city) = &self_employment.business_address_city {
                    row.insert("employer_city".into(), json!(city));
                }
                if let Some(state) = &self_employment.business_address_state {
                    row.insert("employer_state".into(), json!(state));
                }
                if let Some(zip) = &self_employment.business_address_zip {
                    row.insert("employer_zip_code".into(), json!(zip));
                }
                employments.push(row);
            }

            for (inc_idx, stream) in party.income.iter().enumerate() {
                for (key, value) in &stream.non_w2_income {
                    let Some(text) = value.to_text().filter(|t| !t.is_empty()) else {
                        continue;
                    };
                    let mut row = Row::new();
                    row.insert("_ref".into(), json!(format!("income_{idx}_generic_{inc_idx}_{key}")));
                    row.insert("_operation".into(), json!("insert"));
                    row.insert("_customer_ref".into(), json!(cust_ref));
                    row.insert("_application_ref".into(), json!(app_ref));
                    row.insert("income_source".into(), json!("Other"));
                    row.insert("income_type".into(), json!(title_case(key)));
                    row.insert("monthly_amount".into(), json!(text));
                    row.insert("include_in_qualification".into(), json!(true));
                    incomes.push(row);
                }
            }

            for (tax_idx, tax) in party.taxes.iter().enumerate() {
                if let Some(withheld) = tax.federal_withheld_amount {
                    let mut row = Row::new();
                    row.insert("_ref".into(), json!(format!("income_{idx}_tax_{tax_idx}")));
                    row.insert("_operation".into(), json!("insert"));
                    row.insert("_customer_ref".into(), json!(cust_ref));
                    row.insert("_application_ref".into(), json!(app_ref));
                    row.insert("income_source".into(), json!("TaxWithholding"));
                    row.insert("income_type".into(), json!("Federal Withheld"));
                    row.insert("monthly_amount".into(), json!("0"));
                    row.insert(
                        "metadata".into(),
                        json!({
                            "annual_withheld": money_value(withheld),
                            "is_withholding": true,
                        }),
                    );
                    incomes.push(row);
                }
            }

            for (asset_idx, asset) in party.assets.iter().enumerate() {
                assets.push(self.transform_asset(asset, &app_ref, idx, asset_idx));
            }

            if party.total_liabilities.is_some() || party.total_monthly_payments.is_some() {
                let mut row = Row::new();
                row.insert("_ref".into(), json!(format!("liability_{idx}_total")));
                row.insert("_operation".into(), json!("insert"));
                row.insert("_application_ref".into(), json!(app_ref));
                row.insert("liability_type".into(), json!("Other"));
                row.insert("creditor_name".into(), json!("URLA Reported Total"));
                row.insert(
                    "unpaid_balance".into(),
                    party.total_liabilities.map(money_value).unwrap_or(Value::Null),
                );
                row.insert(
                    "monthly_payment".into(),
                    party
                        .total_monthly_payments
                        .map(money_value)
                        .unwrap_or_else(|| json!(0)),
                );
                liabilities.push(row);
            }
        }

        // deal-level detailed liabilities (credit report)
        for (liab_idx, liability) in deal.liabilities.iter().enumerate() {
            let mut row = Row::new();
            row.insert("_ref".into(), json!(format!("liability_deal_{liab_idx}")));
            row.insert("_operation".into(), json!("insert"));
            row.insert("_application_ref".into(), json!(app_ref));
            row.insert(
                "liability_type".into(),
                json!(liability
                    .liability_type
                    .as_ref()
                    .map(|t| t.value.as_str())
                    .unwrap_or("Other")),
            );
            if let Some(creditor) = &liability.creditor_name {
                row.insert("creditor_name".into(), json!(creditor));
            }
            if let Some(account) = &liability.account_number {
                row.insert("account_number".into(), json!(account));
            }
            if let Some(balance) = liability.unpaid_balance {
                row.insert("unpaid_balance".into(), money_value(balance));
            } else if let Some(raw) = &liability.balance_raw {
                let cleaned = clean_currency(raw).unwrap_or(Money::ZERO);
                row.insert("unpaid_balance".into(), money_value(cleaned));
            }
            row.insert(
                "monthly_payment".into(),
                liability
                    .monthly_payment
                    .map(money_value)
                    .unwrap_or_else(|| json!(0)),
            );
            liabilities.push(row);
        }

        if let Some(primary) = &primary_customer_ref {
            app_row.insert("_primary_customer_ref".into(), json!(primary));
        }
        applications.push(app_row);

        let mut tables = IndexMap::new();
        tables.insert("properties".to_string(), properties);
        tables.insert("applications".to_string(), applications);
        tables.insert("customers".to_string(), customers);
        tables.insert("application_customers".to_string(), app_customers);
        tables.insert("employments".to_string(), employments);
        tables.insert("incomes".to_string(), incomes);
        tables.insert("demographics".to_string(), demographics);
        tables.insert("residences".to_string(), residences);
        tables.insert("assets".to_string(), assets);
        tables.insert("liabilities".to_string(), liabilities);

        let table_count = tables.values().filter(|rows| !rows.is_empty()).count();
        let total_rows: usize = tables.values().map(Vec::len).sum();

        self.warn_unmapped(deal.parties.as_slice(), &tables);

        info!(rows = total_rows, tables = table_count, "relational transform complete");
        RelationalPayload {
            metadata: PayloadMetadata {
                source: "RelationalTransformer".to_string(),
                timestamp: now.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
                table_count,
                total_rows,
            },
            tables,
        }
    }

    fn warn_unmapped(&self, parties: &[Party], tables: &IndexMap<String, Vec<Row>>) {
        let has_ref_prefix = |table: &str, prefix: &str| {
            tables.get(table).is_some_and(|rows| {
                rows.iter().any(|row| {
                    row.get("_ref")
                        .and_then(Value::as_str)
                        .is_some_and(|r| r.starts_with(prefix))
                })
            })
        };
        for (idx, party) in parties.iter().enumerate() {
            if !party.self_employment.is_empty()
                && !has_ref_prefix("employments", &format!("employment_{idx}_self"))
            {
                warn!(party = idx, "self_employment data not transformed");
            }
            if !party.taxes.is_empty() && !has_ref_prefix("incomes", &format!("income_{idx}_tax")) {
                warn!(party = idx, "taxes data not transformed");
            }
            if !party.income.is_empty()
                && !has_ref_prefix("incomes", &format!("income_{idx}_generic"))
            {
                warn!(party = idx, "income data exists but not transformed");
            }
        }
    }

    /// collateral.subject_property -> properties row
    fn transform_property(&self, subject: &SubjectProperty) -> Row {
        let mut row = Row::new();
        row.insert("_ref".into(), json!("property_0"));
        row.insert("_operation".into(), json!("upsert"));

        if let Some(raw) = subject.address.as_deref().filter(|s| !s.is_empty()) {
            let parts = parse_address(raw);
            let mut address = serde_json::Map::new();
            if let Some(street) = parts.street {
                address.insert("street".into(), json!(street));
            }
            if let Some(city) = parts.city {
                address.insert("city".into(), json!(city));
            }
            if let Some(state) = parts.state {
                address.insert("state".into(), json!(state));
            }
            if let Some(zip) = parts.zip {
                address.insert("zip".into(), json!(zip));
            }
            row.insert("address".into(), Value::Object(address));
        }

        if let Some(units) = subject.number_of_units {
            row.insert("metadata".into(), json!({ "number_of_units": decimal_value(units) }));
        }
        if let Some(valuation) = &subject.valuation {
            if let Some(price) = valuation.sales_price {
                row.insert("purchase_price".into(), money_value(price));
            }
            if let Some(value) = valuation.appraised_value {
                row.insert("appraised_value".into(), money_value(value));
            }
        }
        if let Some(year) = subject.year_built {
            row.insert("year_built".into(), decimal_value(year));
        }
        if let Some(bedrooms) = subject.bedroom_count {
            row.insert("bedrooms".into(), decimal_value(bedrooms));
        }
        if let Some(bathrooms) = subject.bathroom_count {
            row.insert("bathrooms".into(), decimal_value(bathrooms));
        }
        if let Some(sqft) = subject.gross_living_area_sqft {
            row.insert("square_feet".into(), decimal_value(sqft));
        }
        if let Some(zoning) = &subject.zoning_classification {
            row.insert("property_type".into(), json!(zoning));
        }
        row
    }

    /// transaction_information + disclosures + identifiers -> applications row
    fn transform_application(&self, record: &CanonicalRecord, prop_ref: Option<&str>) -> Row {
        let deal = &record.deal;
        let transaction = deal.transaction_information.as_ref();
        let disclosures = deal.disclosures_and_closing.as_ref();
        let identifiers = deal.identifiers.as_ref();

        let mut row = Row::new();
        row.insert("_ref".into(), json!("application_0"));
        row.insert("_operation".into(), json!("upsert"));
        row.insert("status".into(), json!("imported"));
        row.insert("stage".into(), json!("processing"));
        if let Some(prop) = prop_ref {
            row.insert("_property_ref".into(), json!(prop));
        }

        // loan amount: prefer final_loan_amount, fall back to note principal
        let note = disclosures.and_then(|d| d.promissory_note.as_ref());
        let loan_amount = transaction
            .and_then(|t| t.final_loan_amount)
            .or_else(|| note.and_then(|n| n.principal_amount));
        if let Some(amount) = loan_amount {
            row.insert("loan_amount".into(), money_value(amount));
        }

        if let Some(case) = identifiers.and_then(|i| i.agency_case_number.as_ref()) {
            row.insert("application_number".into(), json!(case));
        }

        let mut key_info = serde_json::Map::new();
        if let Some(tx) = transaction {
            if let Some(mortgage) = &tx.mortgage_type {
                key_info.insert("mortgage_type".into(), json!(mortgage.value));
            }
            if let Some(purpose) = &tx.loan_purpose {
                key_info.insert("loan_purpose".into(), json!(purpose.value));
            }
            if let Some(amortization) = &tx.amortization_type {
                key_info.insert("amortization_type".into(), json!(amortization.value));
            }
            if let Some(date) = &tx.application_date {
                key_info.insert("application_date".into(), json!(date));
                row.insert("submitted_at".into(), json!(to_iso_date(date)));
            }
            if let Some(amount) = tx.estimated_prepaid_items {
                key_info.insert("estimated_prepaid_items".into(), money_value(amount));
            }
            if let Some(amount) = tx.estimated_closing_costs {
                key_info.insert("estimated_closing_costs".into(), money_value(amount));
            }
            if let Some(amount) = tx.pmi_funding_fee {
                key_info.insert("pmi_funding_fee".into(), money_value(amount));
            }
        }

        if let Some(note) = note.filter(|n| !n.is_empty()) {
            key_info.insert(
                "promissory_note".into(),
                serde_json::to_value(note).unwrap_or(Value::Null),
            );
        }

        if let Some(h24) = disclosures.and_then(|d| d.loan_estimate_h24.as_ref()) {
            let h24_json: Value = Value::Object(
                h24.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            );
            if !row.contains_key("submitted_at") {
                if let Some(date) = h24.get("date_issued").and_then(|v| v.to_text()) {
                    row.insert("submitted_at".into(), json!(to_iso_date(&date)));
                    info!("mapped loan estimate date_issued to application.submitted_at");
                }
            }
            key_info.insert("loan_estimate_h24".into(), h24_json);
        }

        if let Some(ids) = identifiers.filter(|i| !i.is_empty()) {
            key_info.insert(
                "identifiers".into(),
                serde_json::to_value(ids).unwrap_or(Value::Null),
            );
        }

        if !key_info.is_empty() {
            row.insert("key_information".into(), Value::Object(key_info));
        }
        row
    }

    /// party.individual -> customers row
    fn transform_customer(&self, individual: &Individual, cust_ref: &str) -> Row {
        let mut row = Row::new();
        row.insert("_ref".into(), json!(cust_ref));
        row.insert("_operation".into(), json!("upsert"));
        row.insert("customer_type".into(), json!("individual"));

        let (first, last) = split_name(
            individual.full_name.as_deref(),
            individual.first_name.as_deref(),
            individual.last_name.as_deref(),
        );
        if let Some(first) = first {
            row.insert("first_name".into(), json!(first));
        }
        if let Some(last) = last {
            row.insert("last_name".into(), json!(last));
        }
        if let Some(ssn) = &individual.ssn {
            row.insert("ssn_encrypted".into(), json!(ssn));
        }
        if let Some(dob) = &individual.dob {
            row.insert("date_of_birth".into(), json!(to_iso_date(dob)));
        }
        if let Some(phone) = &individual.home_phone {
            row.insert("phone_home".into(), json!(phone));
        }
        if let Some(marital) = &individual.marital_status {
            row.insert("marital_status".into(), json!(marital));
        }
        if let Some(citizenship) = &individual.citizenship_residency {
            row.insert("citizenship_type".into(), json!(citizenship.value));
        }
        row
    }

    /// party.employment[] entry -> employments row
    fn transform_employment(
        &self,
        employment: &Employment,
        emp_ref: &str,
        cust_ref: &str,
        app_ref: &str,
    ) -> Row {
        let mut row = Row::new();
        row.insert("_ref".into(), json!(emp_ref));
        row.insert("_operation".into(), json!("insert"));
        row.insert("_customer_ref".into(), json!(cust_ref));
        row.insert("_application_ref".into(), json!(app_ref));
        row.insert("employment_type".into(), json!("W2"));

        if let Some(name) = &employment.employer_name {
            row.insert("employer_name".into(), json!(name));
        }
        if let Some(title) = &employment.position_title {
            row.insert("position_title".into(), json!(title));
        }
        if let Some(phone) = &employment.business_phone {
            row.insert("employer_phone".into(), json!(phone));
        }

        let is_current = employment
            .employment_status
            .as_ref()
            .map(|s| s.value.to_lowercase() == "current")
            .unwrap_or(true);
        row.insert("is_current".into(), json!(is_current));

        if employment.is_self_employed == Some(true) {
            row.insert("is_self_employed".into(), json!(true));
            row.insert("employment_type".into(), json!("SelfEmployed"));
        }

        match &employment.start_date {
            Some(date) => row.insert("start_date".into(), json!(to_iso_date(date))),
            // required by schema, filled by the enforcer if absent
            None => row.insert("start_date".into(), Value::Null),
        };
        row
    }

    /// demographics fields -> demographics row, scalars wrapped as sequences
    fn transform_demographics(
        &self,
        individual: &Individual,
        cust_ref: &str,
        app_ref: &str,
    ) -> Option<Row> {
        if individual.ethnicity.is_none() && individual.race.is_none() && individual.sex.is_none() {
            return None;
        }
        let mut row = Row::new();
        row.insert("_ref".into(), json!(format!("demo_{cust_ref}")));
        row.insert("_operation".into(), json!("insert"));
        row.insert("_customer_ref".into(), json!(cust_ref));
        row.insert("_application_ref".into(), json!(app_ref));
        row.insert("collection_method".into(), json!("FaceToFace"));
        if let Some(ethnicity) = &individual.ethnicity {
            row.insert("ethnicity".into(), json!([ethnicity]));
        }
        if let Some(race) = &individual.race {
            row.insert("race".into(), json!([race]));
        }
        if let Some(sex) = &individual.sex {
            row.insert("sex".into(), json!(sex));
        }
        Some(row)
    }

    /// party.addresses[] entry -> residences row; first address is Current
    fn transform_residence(
        &self,
        address: &crate::canonical::model::Address,
        cust_ref: &str,
        app_ref: &str,
        addr_idx: usize,
    ) -> Option<Row> {
        let street = address.street.as_deref().filter(|s| !s.is_empty())?;

        let mut row = Row::new();
        row.insert("_ref".into(), json!(format!("residence_{cust_ref}_{addr_idx}")));
        row.insert("_operation".into(), json!("insert"));
        row.insert("_customer_ref".into(), json!(cust_ref));
        row.insert("_application_ref".into(), json!(app_ref));
        row.insert(
            "residence_type".into(),
            json!(if addr_idx == 0 { "Current" } else { "Prior" }),
        );
        row.insert("street_address".into(), json!(street));

        if let Some(csz) = address.city_state_zip.as_deref().filter(|s| !s.is_empty()) {
            let (city, state, zip) = parse_city_state_zip(csz);
            if let Some(city) = city {
                row.insert("city".into(), json!(city));
            }
            if let Some(state) = state {
                row.insert("state".into(), json!(state));
            }
            if let Some(zip) = zip {
                row.insert("zip_code".into(), json!(zip));
            }
        } else {
            let parts = parse_address(street);
            if let Some(city) = parts.city {
                row.insert("city".into(), json!(city));
            }
            if let Some(state) = parts.state {
                row.insert("state".into(), json!(state));
            }
            if let Some(zip) = parts.zip {
                row.insert("zip_code".into(), json!(zip));
            }
        }
        Some(row)
    }

    /// party.assets[] entry -> assets row
    fn transform_asset(&self, asset: &Asset, app_ref: &str, party_idx: usize, asset_idx: usize) -> Row {
        let mut row = Row::new();
        row.insert("_ref".into(), json!(format!("asset_{party_idx}_{asset_idx}")));
        row.insert("_operation".into(), json!("insert"));
        row.insert("_application_ref".into(), json!(app_ref));
        row.insert("asset_category".into(), json!("LiquidAsset"));

        if let Some(name) = &asset.institution_name {
            row.insert("institution_name".into(), json!(name));
        }
        if let Some(account) = &asset.account_number {
            row.insert("account_number".into(), json!(account));
        }
        // exactly one of cash_or_market_value_amount / ending_balance contributes
        let value = asset
            .cash_or_market_value_amount
            .or(asset.ending_balance)
            .unwrap_or(Money::ZERO);
        row.insert("cash_or_market_value".into(), money_value(value));

        let asset_type = asset
            .asset_type
            .as_ref()
            .map(|t| t.value.as_str())
            .filter(|v| !v.is_empty())
            .unwrap_or("CheckingAccount");
        row.insert("asset_type".into(), json!(asset_type));
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::model::{
        Address, Collateral, Deal, DisclosuresAndClosing, Identifiers, MonthlyIncome, Party,
        PromissoryNote, TaggedValue, TransactionInformation, Valuation,
    };
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    fn urla_record() -> CanonicalRecord {
        let mut record = CanonicalRecord::default();
        record.deal = Deal {
            parties: vec![Party {
                individual: Some(Individual {
                    full_name: Some("John Q Doe".into()),
                    ssn: Some("123-45-6789".into()),
                    dob: Some("01/15/1980".into()),
                    ethnicity: Some("Not Hispanic or Latino".into()),
                    race: Some("White".into()),
                    sex: Some("Male".into()),
                    ..Individual::default()
                }),
                party_role: Some(TaggedValue::new("Borrower")),
                addresses: vec![Address {
                    street: Some("55 Oak Ave".into()),
                    city_state_zip: Some("Syracuse, NY 13224".into()),
                    ..Address::default()
                }],
                employment: vec![Employment {
                    employer_name: Some("Initech LLC".into()),
                    monthly_income: Some(MonthlyIncome {
                        base: Some(Money::from_major(10_000)),
                        overtime: Some(Money::from_major(500)),
                        total: Some(Money::from_major(10_500)),
                        ..MonthlyIncome::default()
                    }),
                    ..Employment::default()
                }],
                total_liabilities: Some(Money::from_major(25_000)),
                total_monthly_payments: Some(Money::from_major(750)),
                ..Party::default()
            }],
            collateral: Some(Collateral {
                subject_property: Some(SubjectProperty {
                    address: Some("123 Main St, Denver, CO 80202".into()),
                    occupancy_type: Some(TaggedValue::new("PrimaryResidence")),
                    valuation: Some(Valuation {
                        sales_price: Some(Money::from_major(500_000)),
                        ..Valuation::default()
                    }),
                    ..SubjectProperty::default()
                }),
            }),
            transaction_information: Some(TransactionInformation {
                loan_purpose: Some(TaggedValue::new("Purchase")),
                application_date: Some("01/10/2024".into()),
                ..TransactionInformation::default()
            }),
            disclosures_and_closing: Some(DisclosuresAndClosing {
                promissory_note: Some(PromissoryNote {
                    principal_amount: Some(Money::from_major(450_000)),
                    interest_rate: Some(dec!(6.5)),
                    loan_term_months: Some(dec!(360)),
                    ..PromissoryNote::default()
                }),
                ..DisclosuresAndClosing::default()
            }),
            identifiers: Some(Identifiers {
                agency_case_number: Some("AC-9981".into()),
                ..Identifiers::default()
            }),
            liabilities: Vec::new(),
        };
        record
    }

    #[test]
    fn test_loan_amount_falls_back_to_note_principal() {
        let payload = RelationalTransformer::new().transform(&urla_record(), now());
        let app = &payload.table("applications")[0];
        assert_eq!(app.get("loan_amount"), Some(&json!(450000.0)));
        assert_eq!(app.get("application_number"), Some(&json!("AC-9981")));
        assert_eq!(app.get("occupancy_type"), Some(&json!("PrimaryResidence")));
        assert_eq!(app.get("submitted_at"), Some(&json!("2024-01-10")));
    }

    #[test]
    fn test_property_address_parsed() {
        let payload = RelationalTransformer::new().transform(&urla_record(), now());
        let property = &payload.table("properties")[0];
        assert_eq!(property.get("_ref"), Some(&json!("property_0")));
        assert_eq!(property.get("_operation"), Some(&json!("upsert")));
        assert_eq!(
            property.get("address"),
            Some(&json!({"street": "123 Main St", "city": "Denver", "state": "CO", "zip": "80202"}))
        );
        assert_eq!(property.get("purchase_price"), Some(&json!(500000.0)));
    }

    #[test]
    fn test_customer_and_junction_rows() {
        let payload = RelationalTransformer::new().transform(&urla_record(), now());
        let customer = &payload.table("customers")[0];
        assert_eq!(customer.get("first_name"), Some(&json!("John")));
        assert_eq!(customer.get("last_name"), Some(&json!("Q Doe")));
        assert_eq!(customer.get("ssn_encrypted"), Some(&json!("123-45-6789")));
        assert_eq!(customer.get("date_of_birth"), Some(&json!("1980-01-15")));

        let junction = &payload.table("application_customers")[0];
        assert_eq!(junction.get("role"), Some(&json!("Borrower")));
        assert_eq!(junction.get("sequence"), Some(&json!(1)));

        let app = &payload.table("applications")[0];
        assert_eq!(app.get("_primary_customer_ref"), Some(&json!("customer_0")));
    }

    #[test]
    fn test_incomes_exclude_total() {
        let payload = RelationalTransformer::new().transform(&urla_record(), now());
        let incomes = payload.table("incomes");
        assert_eq!(incomes.len(), 2);
        let types: Vec<&str> = incomes
            .iter()
            .filter_map(|r| r.get("income_type").and_then(Value::as_str))
            .collect();
        assert_eq!(types, vec!["Base", "Overtime"]);
        assert!(incomes.iter().all(|r| r.get("_employment_ref") == Some(&json!("employment_0_0"))));
    }

    #[test]
    fn test_residence_current_and_parsed_csz() {
        let payload = RelationalTransformer::new().transform(&urla_record(), now());
        let residence = &payload.table("residences")[0];
        assert_eq!(residence.get("residence_type"), Some(&json!("Current")));
        assert_eq!(residence.get("city"), Some(&json!("Syracuse")));
        assert_eq!(residence.get("state"), Some(&json!("NY")));
        assert_eq!(residence.get("zip_code"), Some(&json!("13224")));
    }

    #[test]
    fn test_synthetic_liability_row() {
        let payload = RelationalTransformer::new().transform(&urla_record(), now());
        let liability = &payload.table("liabilities")[0];
        assert_eq!(liability.get("creditor_name"), Some(&json!("URLA Reported Total")));
        assert_eq!(liability.get("unpaid_balance"), Some(&json!(25000.0)));
        assert_eq!(liability.get("monthly_payment"), Some(&json!(750.0)));
    }

    #[test]
    fn test_demographics_wrapped_as_sequences() {
        let payload = RelationalTransformer::new().transform(&urla_record(), now());
        let demo = &payload.table("demographics")[0];
        assert_eq!(demo.get("ethnicity"), Some(&json!(["Not Hispanic or Latino"])));
        assert_eq!(demo.get("race"), Some(&json!(["White"])));
        assert_eq!(demo.get("sex"), Some(&json!("Male")));
    }

    #[test]
    fn test_lender_preserved_in_key_information() {
        let mut record = urla_record();
        record.deal.parties.push(Party {
            company_name: Some("Ficus Bank".into()),
            individual: Some(Individual {
                full_name: Some("Joe Smith".into()),
                nmls_id: Some("12345".into()),
                ..Individual::default()
            }),
            party_role: Some(TaggedValue::new("Lender")),
            ..Party::default()
        });
        let payload = RelationalTransformer::new().transform(&record, now());
        // no customer row for the lender
        assert_eq!(payload.table("customers").len(), 1);
        let app = &payload.table("applications")[0];
        let lender = &app["key_information"]["lender"];
        assert_eq!(lender["lender_name"], json!("Ficus Bank"));
        assert_eq!(lender["loan_officer_name"], json!("Joe Smith"));
        assert_eq!(lender["loan_officer_nmls"], json!("12345"));
    }

    #[test]
    fn test_asset_value_preference() {
        let mut record = urla_record();
        record.deal.parties[0].assets = vec![
            Asset {
                cash_or_market_value_amount: Some(Money::from_major(9_000)),
                ending_balance: Some(Money::from_major(1)),
                ..Asset::default()
            },
            Asset {
                ending_balance: Some(Money::from_major(4_200)),
                ..Asset::default()
            },
            Asset {
                institution_name: Some("Empty Bank".into()),
                ..Asset::default()
            },
        ];
        let payload = RelationalTransformer::new().transform(&record, now());
        let assets = payload.table("assets");
        assert_eq!(assets[0].get("cash_or_market_value"), Some(&json!(9000.0)));
        assert_eq!(assets[1].get("cash_or_market_value"), Some(&json!(4200.0)));
        assert_eq!(assets[2].get("cash_or_market_value"), Some(&json!(0.0)));
        assert_eq!(assets[2].get("asset_type"), Some(&json!("CheckingAccount")));
    }

    #[test]
    fn test_all_internal_refs_resolve() {
        let payload = RelationalTransformer::new().transform(&urla_record(), now());
        assert!(payload.unresolved_refs().is_empty());
        // property, application, customer, junction, employment, 2 incomes,
        // demographics, residence, synthetic liability
        assert_eq!(payload.metadata.total_rows, 10);
    }
}
