use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::value::{FieldValue, FlatMap};

/// `{value: ...}` container mirroring the MISMO enumerated-value shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaggedValue {
    pub value: String,
}

impl TaggedValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }
}

/// open key-value snapshot of a single source document's financial facts
pub type Ivf = IndexMap<String, FieldValue>;

/// canonical MISMO-aligned record rooted at `deal`
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct CanonicalRecord {
    pub deal: Deal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_metadata: Option<DocumentMetadata>,
    /// generic fallback: flat keys preserved verbatim when no strategy applies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flat_data: Option<FlatMap>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Deal {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub parties: Vec<Party>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collateral: Option<Collateral>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_information: Option<TransactionInformation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disclosures_and_closing: Option<DisclosuresAndClosing>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifiers: Option<Identifiers>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub liabilities: Vec<Liability>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct DocumentMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_document_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Party {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub individual: Option<Individual>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub party_role: Option<TaggedValue>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub addresses: Vec<Address>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub employment: Vec<Employment>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub self_employment: Vec<SelfEmployment>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub assets: Vec<Asset>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub income_verification_fragments: Vec<Ivf>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub income: Vec<IncomeStream>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub taxes: Vec<TaxRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub declarations: Option<Declarations>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_assets: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_liabilities: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_monthly_payments: Option<Money>,
}

impl Party {
    pub fn role(&self) -> &str {
        self.party_role.as_ref().map(|r| r.value.as_str()).unwrap_or("")
    }

    pub fn is_lender(&self) -> bool {
        self.role() == "Lender"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Individual {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dob: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marital_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub years_school: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ethnicity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub race: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citizenship_residency: Option<TaggedValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nmls_id: Option<String>,
}

impl Individual {
    pub fn is_empty(&self) -> bool {
        self == &Individual::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Address {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apt_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city_state_zip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_type: Option<TaggedValue>,
}

impl Address {
    pub fn is_empty(&self) -> bool {
        self == &Address::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct MonthlyIncome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overtime: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bonus: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commission: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<Money>,
}

impl MonthlyIncome {
    pub fn is_empty(&self) -> bool {
        self == &MonthlyIncome::default()
    }

    /// non-total sub-values in canonical order: (name, amount)
    pub fn components(&self) -> Vec<(&'static str, Money)> {
        let mut out = Vec::new();
        if let Some(v) = self.base {
            out.push(("base", v));
        }
        if let Some(v) = self.overtime {
            out.push(("overtime", v));
        }
        if let Some(v) = self.bonus {
            out.push(("bonus", v));
        }
        if let Some(v) = self.commission {
            out.push(("commission", v));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Employment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employer_ein: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employer_business_unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pay_rate: Option<FieldValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employment_status: Option<TaggedValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub income_type: Option<TaggedValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_income: Option<MonthlyIncome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_self_employed: Option<bool>,
}

impl Employment {
    pub fn is_empty(&self) -> bool {
        self == &Employment::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct SelfEmployment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_address_street: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_address_city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_address_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_address_zip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Asset {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub institution_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_type: Option<TaggedValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement_period_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement_period_end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beginning_balance: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ending_balance: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cash_or_market_value_amount: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_deposits: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_withdrawals: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_fees: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_checks: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_balance: Option<Money>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub transactions: Vec<FlatMap>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub withdrawal_transactions: Vec<FlatMap>,
}

impl Asset {
    pub fn is_empty(&self) -> bool {
        self == &Asset::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct IncomeStream {
    #[serde(skip_serializing_if = "IndexMap::is_empty", default)]
    pub non_w2_income: IndexMap<String, FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct TaxRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub federal_withheld_amount: Option<Money>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Declarations {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_to_occupy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Collateral {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_property: Option<SubjectProperty>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct SubjectProperty {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city_state_zip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub county: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legal_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessor_parcel_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_year: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annual_taxes: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year_built: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_age_years: Option<FieldValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_room_count: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bedroom_count: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bathroom_count: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gross_living_area_sqft: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_stories: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub design_style: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lot_dimensions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lot_size: Option<FieldValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basement_area_sqft: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basement_finish_percent: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_rating: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupancy_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neighborhood_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zoning_classification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fema_flood_zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fema_map_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_units: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupancy_type: Option<TaggedValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_type: Option<TaggedValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estate_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_held_names: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valuation: Option<Valuation>,
}

impl SubjectProperty {
    pub fn is_empty(&self) -> bool {
        self == &SubjectProperty::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Valuation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sales_price: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appraised_value: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appraisal_form_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appraisal_method: Option<TaggedValue>,
}

impl Valuation {
    pub fn is_empty(&self) -> bool {
        self == &Valuation::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct TransactionInformation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mortgage_type: Option<TaggedValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loan_purpose: Option<TaggedValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amortization_type: Option<TaggedValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_prepaid_items: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_closing_costs: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pmi_funding_fee: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_loan_amount: Option<Money>,
}

impl TransactionInformation {
    pub fn is_empty(&self) -> bool {
        self == &TransactionInformation::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct PromissoryNote {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_amount: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interest_rate: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interest_rate_raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loan_term_months: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loan_term_years: Option<Decimal>,
}

impl PromissoryNote {
    pub fn is_empty(&self) -> bool {
        self == &PromissoryNote::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct DisclosuresAndClosing {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promissory_note: Option<PromissoryNote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loan_estimate_h24: Option<Ivf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closing_disclosure_h25: Option<Ivf>,
}

impl DisclosuresAndClosing {
    pub fn is_empty(&self) -> bool {
        self == &DisclosuresAndClosing::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Identifiers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agency_case_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lender_case_number: Option<String>,
}

impl Identifiers {
    pub fn is_empty(&self) -> bool {
        self == &Identifiers::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Liability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liability_type: Option<TaggedValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creditor_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unpaid_balance: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance_raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_payment: Option<Money>,
}

// ---------------------------------------------------------------------------
// additive enrichment (merged multi-document assembly)
// ---------------------------------------------------------------------------

// fill each listed field only when the destination left it unset
macro_rules! fill_missing {
    ($dst:expr, $src:expr, $($field:ident),+ $(,)?) => {
        $( if $dst.$field.is_none() { $dst.$field = $src.$field; } )+
    };
}

// pair list elements by index, filling gaps; surplus source elements append
fn enrich_vec<T>(dst: &mut Vec<T>, src: Vec<T>, mut merge: impl FnMut(&mut T, T)) {
    let mut incoming = src.into_iter();
    for existing in dst.iter_mut() {
        match incoming.next() {
            Some(item) => merge(existing, item),
            None => break,
        }
    }
    dst.extend(incoming);
}

fn enrich_ivf(dst: &mut Ivf, src: Ivf) {
    for (key, value) in src {
        dst.entry(key).or_insert(value);
    }
}

fn enrich_individual(dst: &mut Individual, src: Individual) {
    fill_missing!(
        dst, src, full_name, first_name, middle_name, last_name, ssn, dob, marital_status,
        home_phone, years_school, ethnicity, race, sex, citizenship_residency, employee_id,
        nmls_id,
    );
}

fn enrich_address(dst: &mut Address, src: Address) {
    fill_missing!(dst, src, street, apt_number, city, state, zip_code, city_state_zip, address_type);
}

fn enrich_monthly_income(dst: &mut MonthlyIncome, src: MonthlyIncome) {
    fill_missing!(dst, src, base, overtime, bonus, commission, total);
}

fn enrich_employment(dst: &mut Employment, src: Employment) {
    match (dst.monthly_income.as_mut(), src.monthly_income) {
        (Some(existing), Some(incoming)) => enrich_monthly_income(existing, incoming),
        (None, Some(incoming)) => dst.monthly_income = Some(incoming),
        _ => {}
    }
    fill_missing!(
        dst, src, employer_name, position_title, employer_ein, business_phone,
        employer_business_unit, department, pay_rate, location, employment_status, income_type,
        start_date, end_date, is_self_employed,
    );
}

fn enrich_self_employment(dst: &mut SelfEmployment, src: SelfEmployment) {
    fill_missing!(
        dst, src, business_name, business_phone, business_address_street, business_address_city,
        business_address_state, business_address_zip,
    );
}

fn enrich_asset(dst: &mut Asset, src: Asset) {
    fill_missing!(
        dst, src, institution_name, account_number, account_type, asset_type,
        statement_period_start, statement_period_end, beginning_balance, ending_balance,
        cash_or_market_value_amount, total_deposits, total_withdrawals, service_fees,
        total_checks, average_balance,
    );
    if dst.transactions.is_empty() {
        dst.transactions = src.transactions;
    }
    if dst.withdrawal_transactions.is_empty() {
        dst.withdrawal_transactions = src.withdrawal_transactions;
    }
}

fn enrich_income_stream(dst: &mut IncomeStream, src: IncomeStream) {
    for (key, value) in src.non_w2_income {
        dst.non_w2_income.entry(key).or_insert(value);
    }
}

fn enrich_tax_record(dst: &mut TaxRecord, src: TaxRecord) {
    fill_missing!(dst, src, federal_withheld_amount);
}

fn enrich_liability(dst: &mut Liability, src: Liability) {
    fill_missing!(
        dst, src, liability_type, creditor_name, account_number, unpaid_balance, balance_raw,
        monthly_payment,
    );
}

fn enrich_party(dst: &mut Party, src: Party) {
    match (dst.individual.as_mut(), src.individual) {
        (Some(existing), Some(incoming)) => enrich_individual(existing, incoming),
        (None, Some(incoming)) => dst.individual = Some(incoming),
        _ => {}
    }
    fill_missing!(
        dst, src, company_name, party_role, declarations, total_assets, total_liabilities,
        total_monthly_payments,
    );
    enrich_vec(&mut dst.addresses, src.addresses, enrich_address);
    enrich_vec(&mut dst.employment, src.employment, enrich_employment);
    enrich_vec(&mut dst.self_employment, src.self_employment, enrich_self_employment);
    enrich_vec(&mut dst.assets, src.assets, enrich_asset);
    // each fragment is one source document's snapshot
    dst.income_verification_fragments
        .extend(src.income_verification_fragments);
    enrich_vec(&mut dst.income, src.income, enrich_income_stream);
    enrich_vec(&mut dst.taxes, src.taxes, enrich_tax_record);
}

fn enrich_valuation(dst: &mut Valuation, src: Valuation) {
    fill_missing!(dst, src, sales_price, appraised_value, appraisal_form_type, appraisal_method);
}

fn enrich_property(dst: &mut SubjectProperty, src: SubjectProperty) {
    match (dst.valuation.as_mut(), src.valuation) {
        (Some(existing), Some(incoming)) => enrich_valuation(existing, incoming),
        (None, Some(incoming)) => dst.valuation = Some(incoming),
        _ => {}
    }
    fill_missing!(
        dst, src, address, city, state, zip_code, city_state_zip, county, legal_description,
        assessor_parcel_number, tax_year, annual_taxes, year_built, effective_age_years,
        total_room_count, bedroom_count, bathroom_count, gross_living_area_sqft,
        number_of_stories, design_style, lot_dimensions, lot_size, view, basement_area_sqft,
        basement_finish_percent, condition_rating, occupancy_status, neighborhood_name,
        zoning_classification, fema_flood_zone, fema_map_number, number_of_units, occupancy_type,
        property_type, estate_type, title_held_names,
    );
}

fn enrich_transaction(dst: &mut TransactionInformation, src: TransactionInformation) {
    fill_missing!(
        dst, src, mortgage_type, loan_purpose, amortization_type, application_date,
        estimated_prepaid_items, estimated_closing_costs, pmi_funding_fee, final_loan_amount,
    );
}

fn enrich_note(dst: &mut PromissoryNote, src: PromissoryNote) {
    fill_missing!(
        dst, src, principal_amount, interest_rate, interest_rate_raw, loan_term_months,
        loan_term_years,
    );
}

fn enrich_disclosures(dst: &mut DisclosuresAndClosing, src: DisclosuresAndClosing) {
    match (dst.promissory_note.as_mut(), src.promissory_note) {
        (Some(existing), Some(incoming)) => enrich_note(existing, incoming),
        (None, Some(incoming)) => dst.promissory_note = Some(incoming),
        _ => {}
    }
    match (dst.loan_estimate_h24.as_mut(), src.loan_estimate_h24) {
        (Some(existing), Some(incoming)) => enrich_ivf(existing, incoming),
        (None, Some(incoming)) => dst.loan_estimate_h24 = Some(incoming),
        _ => {}
    }
    match (dst.closing_disclosure_h25.as_mut(), src.closing_disclosure_h25) {
        (Some(existing), Some(incoming)) => enrich_ivf(existing, incoming),
        (None, Some(incoming)) => dst.closing_disclosure_h25 = Some(incoming),
        _ => {}
    }
}

fn enrich_identifiers(dst: &mut Identifiers, src: Identifiers) {
    fill_missing!(dst, src, agency_case_number, lender_case_number);
}

fn enrich_metadata(dst: &mut DocumentMetadata, src: DocumentMetadata) {
    fill_missing!(dst, src, source_document_type, schema_version);
}

impl CanonicalRecord {
    /// additive enrichment from a secondary document's record
    ///
    /// fills values the primary left unset and appends income verification
    /// fragments; an existing primary value is never overwritten. non-lender
    /// parties pair up by ordinal, lender parties pair with the lender
    pub fn enrich_from(&mut self, other: CanonicalRecord) {
        let mut ordinal = 0usize;
        for party in other.deal.parties {
            if party.is_lender() {
                match self.deal.parties.iter_mut().find(|p| p.is_lender()) {
                    Some(existing) => enrich_party(existing, party),
                    None => self.deal.parties.push(party),
                }
                continue;
            }
            let mut seen = 0usize;
            let mut target: Option<usize> = None;
            for (i, p) in self.deal.parties.iter().enumerate() {
                if !p.is_lender() {
                    if seen == ordinal {
                        target = Some(i);
                        break;
                    }
                    seen += 1;
                }
            }
            match target {
                Some(i) => enrich_party(&mut self.deal.parties[i], party),
                None => {
                    // keep lenders last
                    let pos = self
                        .deal
                        .parties
                        .iter()
                        .position(Party::is_lender)
                        .unwrap_or(self.deal.parties.len());
                    self.deal.parties.insert(pos, party);
                }
            }
            ordinal += 1;
        }

        match (self.deal.collateral.as_mut(), other.deal.collateral) {
            (Some(existing), Some(incoming)) => {
                match (existing.subject_property.as_mut(), incoming.subject_property) {
                    (Some(d), Some(s)) => enrich_property(d, s),
                    (None, Some(s)) => existing.subject_property = Some(s),
                    _ => {}
                }
            }
            (None, Some(incoming)) => self.deal.collateral = Some(incoming),
            _ => {}
        }
        match (self.deal.transaction_information.as_mut(), other.deal.transaction_information) {
            (Some(existing), Some(incoming)) => enrich_transaction(existing, incoming),
            (None, Some(incoming)) => self.deal.transaction_information = Some(incoming),
            _ => {}
        }
        match (self.deal.disclosures_and_closing.as_mut(), other.deal.disclosures_and_closing) {
            (Some(existing), Some(incoming)) => enrich_disclosures(existing, incoming),
            (None, Some(incoming)) => self.deal.disclosures_and_closing = Some(incoming),
            _ => {}
        }
        match (self.deal.identifiers.as_mut(), other.deal.identifiers) {
            (Some(existing), Some(incoming)) => enrich_identifiers(existing, incoming),
            (None, Some(incoming)) => self.deal.identifiers = Some(incoming),
            _ => {}
        }
        enrich_vec(&mut self.deal.liabilities, other.deal.liabilities, enrich_liability);

        match (self.document_metadata.as_mut(), other.document_metadata) {
            (Some(existing), Some(incoming)) => enrich_metadata(existing, incoming),
            (None, Some(incoming)) => self.document_metadata = Some(incoming),
            _ => {}
        }
        if self.flat_data.is_none() {
            self.flat_data = other.flat_data;
        }
    }
}

impl CanonicalRecord {
    /// number of non-null scalar leaves across the record, used for reporting
    pub fn leaf_count(&self) -> usize {
        fn count(value: &serde_json::Value) -> usize {
            match value {
                serde_json::Value::Null => 0,
                serde_json::Value::Object(map) => map.values().map(count).sum(),
                serde_json::Value::Array(items) => items.iter().map(count).sum(),
                _ => 1,
            }
        }
        serde_json::to_value(self).map(|v| count(&v)).unwrap_or(0)
    }

    /// serialize to a json tree (skip-if-empty attributes applied)
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_count_ignores_nulls_and_containers() {
        let mut record = CanonicalRecord::default();
        record.deal.parties.push(Party {
            individual: Some(Individual {
                full_name: Some("Jane Roe".into()),
                ssn: Some("123-45-6789".into()),
                ..Individual::default()
            }),
            party_role: Some(TaggedValue::new("Borrower")),
            ..Party::default()
        });
        record.deal.transaction_information = Some(TransactionInformation {
            final_loan_amount: Some(Money::from_major(450_000)),
            ..TransactionInformation::default()
        });
        // full_name + ssn + party_role.value + final_loan_amount
        assert_eq!(record.leaf_count(), 4);
    }

    #[test]
    fn test_monthly_income_components_order() {
        let income = MonthlyIncome {
            base: Some(Money::from_major(5_000)),
            bonus: Some(Money::from_major(200)),
            total: Some(Money::from_major(5_200)),
            ..MonthlyIncome::default()
        };
        let names: Vec<&str> = income.components().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["base", "bonus"]); // total excluded
    }

    #[test]
    fn test_empty_containers_not_serialized() {
        let record = CanonicalRecord::default();
        let json = record.to_json();
        assert_eq!(json, serde_json::json!({"deal": {}}));
    }

    #[test]
    fn test_enrich_from_fills_without_overwriting() {
        let mut primary = CanonicalRecord::default();
        primary.deal.parties.push(Party {
            individual: Some(Individual {
                full_name: Some("Jane Smith".into()),
                ssn: Some("123-45-6789".into()),
                ..Individual::default()
            }),
            party_role: Some(TaggedValue::new("Borrower")),
            ..Party::default()
        });
        primary.deal.transaction_information = Some(TransactionInformation {
            final_loan_amount: Some(Money::from_major(450_000)),
            ..TransactionInformation::default()
        });

        let mut secondary = CanonicalRecord::default();
        let mut ivf = Ivf::new();
        ivf.insert(
            "w2_wages_annual".to_string(),
            crate::value::FieldValue::Number(rust_decimal::Decimal::from(120_000)),
        );
        secondary.deal.parties.push(Party {
            individual: Some(Individual {
                full_name: Some("JANE Q SMITH".into()),
                dob: Some("01/15/1980".into()),
                ..Individual::default()
            }),
            party_role: Some(TaggedValue::new("Borrower")),
            employment: vec![Employment {
                employer_name: Some("Initech LLC".into()),
                ..Employment::default()
            }],
            income_verification_fragments: vec![ivf],
            ..Party::default()
        });
        secondary.deal.parties.push(Party {
            company_name: Some("Ficus Bank".into()),
            party_role: Some(TaggedValue::new("Lender")),
            ..Party::default()
        });
        secondary.deal.transaction_information = Some(TransactionInformation {
            final_loan_amount: Some(Money::from_major(999_999)),
            application_date: Some("01/10/2024".into()),
            ..TransactionInformation::default()
        });

        primary.enrich_from(secondary);

        let borrower = &primary.deal.parties[0];
        let individual = borrower.individual.as_ref().unwrap();
        // primary values survive a conflicting secondary
        assert_eq!(individual.full_name.as_deref(), Some("Jane Smith"));
        assert_eq!(individual.ssn.as_deref(), Some("123-45-6789"));
        // gaps filled additively
        assert_eq!(individual.dob.as_deref(), Some("01/15/1980"));
        assert_eq!(borrower.employment[0].employer_name.as_deref(), Some("Initech LLC"));
        assert_eq!(borrower.income_verification_fragments.len(), 1);
        // secondary lender appended, kept last
        assert!(primary.deal.parties[1].is_lender());

        let tx = primary.deal.transaction_information.as_ref().unwrap();
        assert_eq!(tx.final_loan_amount, Some(Money::from_major(450_000)));
        assert_eq!(tx.application_date.as_deref(), Some("01/10/2024"));
    }
}
