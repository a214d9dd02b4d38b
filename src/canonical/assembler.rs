use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::canonical::model::{
    Address, Asset, CanonicalRecord, Collateral, Declarations, DisclosuresAndClosing,
    DocumentMetadata, Employment, Individual, Ivf, MonthlyIncome, Party, PromissoryNote,
    SubjectProperty, TaggedValue, TransactionInformation, Valuation,
};
use crate::canonical::model::Identifiers;
use crate::decimal::Money;
use crate::types::DocumentType;
use crate::value::{FieldValue, FlatMap};

fn text(flat: &FlatMap, key: &str) -> Option<String> {
    flat.get(key).and_then(|v| v.to_text()).filter(|s| !s.is_empty())
}

fn money(flat: &FlatMap, key: &str) -> Option<Money> {
    flat.get(key).and_then(|v| v.as_money())
}

fn decimal(flat: &FlatMap, key: &str) -> Option<Decimal> {
    flat.get(key).and_then(|v| v.as_number())
}

fn rows(flat: &FlatMap, key: &str) -> Option<Vec<FlatMap>> {
    flat.get(key).and_then(|v| v.as_rows()).map(|r| r.to_vec())
}

fn tagged(flat: &FlatMap, key: &str) -> Option<TaggedValue> {
    text(flat, key).map(TaggedValue::new)
}

fn ivf_put(ivf: &mut Ivf, key: &str, value: Option<FieldValue>) {
    if let Some(v) = value {
        ivf.insert(key.to_string(), v);
    }
}

fn build_party(
    ssn: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    full_name: Option<String>,
    role: &str,
) -> Party {
    let individual = Individual {
        ssn,
        first_name,
        last_name,
        full_name,
        ..Individual::default()
    };
    Party {
        individual: if individual.is_empty() { None } else { Some(individual) },
        party_role: Some(TaggedValue::new(role)),
        ..Party::default()
    }
}

fn build_metadata(flat: &FlatMap, prefix: &str) -> Option<DocumentMetadata> {
    let meta = DocumentMetadata {
        source_document_type: text(flat, &format!("{prefix}source_doc_type")),
        schema_version: text(flat, &format!("{prefix}schema_version")),
    };
    if meta.source_document_type.is_none() && meta.schema_version.is_none() {
        None
    } else {
        Some(meta)
    }
}

/// flat business keys -> deep canonical record
///
/// one strategy per document type; `merged` picks a primary by prefix census;
/// anything else falls back to the generic flat-bag carrier
#[derive(Debug, Default)]
pub struct CanonicalAssembler;

impl CanonicalAssembler {
    pub fn new() -> Self {
        Self
    }

    pub fn assemble(&self, flat: &FlatMap, doc_type: DocumentType) -> CanonicalRecord {
        let record = match doc_type {
            DocumentType::W2Form => self.w2_strategy(flat),
            DocumentType::Urla => self.urla_strategy(flat),
            DocumentType::PayStub => self.paystub_strategy(flat),
            DocumentType::BankStatement => self.bank_statement_strategy(flat),
            DocumentType::TaxReturn1040 => self.tax_return_strategy(flat),
            DocumentType::Appraisal => self.appraisal_strategy(flat),
            DocumentType::LoanEstimate => self.loan_estimate_strategy(flat),
            _ => {
                warn!(document_type = doc_type.label(), "no assembler strategy, using generic");
                self.generic_strategy(flat)
            }
        };
        info!(document_type = doc_type.label(), leaves = record.leaf_count(),
              "canonical assembly complete");
        record
    }

    /// merged multi-document assembly: urla primary when present, otherwise
    /// the most populous prefix; remaining prefixes enrich the primary record
    /// additively, never overwriting a value the primary already set
    pub fn assemble_merged(&self, flat: &FlatMap) -> CanonicalRecord {
        // enrichment order follows document priority, most authoritative first
        const PREFIX_STRATEGIES: [(&str, DocumentType); 7] = [
            ("w2_", DocumentType::W2Form),
            ("appraisal_", DocumentType::Appraisal),
            ("paystub_", DocumentType::PayStub),
            ("tax_", DocumentType::TaxReturn1040),
            ("bank_", DocumentType::BankStatement),
            ("urla_", DocumentType::Urla),
            ("le_", DocumentType::LoanEstimate),
        ];

        let mut prefix_counts: Vec<(String, usize)> = Vec::new();
        for key in flat.keys() {
            let prefix = match key.split('_').next() {
                Some(p) if !p.is_empty() => format!("{p}_"),
                _ => continue,
            };
            match prefix_counts.iter_mut().find(|(p, _)| *p == prefix) {
                Some((_, n)) => *n += 1,
                None => prefix_counts.push((prefix, 1)),
            }
        }

        let primary = if prefix_counts.iter().any(|(p, _)| p == "urla_") {
            DocumentType::Urla
        } else {
            let best = prefix_counts
                .iter()
                .max_by_key(|(_, n)| *n)
                .map(|(p, _)| p.as_str())
                .unwrap_or("urla_");
            PREFIX_STRATEGIES
                .iter()
                .find(|(prefix, _)| *prefix == best)
                .map(|(_, doc_type)| *doc_type)
                .unwrap_or(DocumentType::Urla)
        };
        info!(primary = primary.label(), "merged assembly primary selected");

        let mut record = self.assemble(flat, primary);
        for (prefix, doc_type) in PREFIX_STRATEGIES {
            if doc_type == primary {
                continue;
            }
            if !prefix_counts.iter().any(|(p, _)| p.as_str() == prefix) {
                continue;
            }
            let secondary = self.assemble(flat, doc_type);
            record.enrich_from(secondary);
        }
        record
    }

    // ================================================================
    //  strategies
    // ================================================================

    /// W-2: single party (employee), single employer
    fn w2_strategy(&self, flat: &FlatMap) -> CanonicalRecord {
        let mut party = build_party(
            text(flat, "w2_employee_ssn"),
            text(flat, "w2_employee_first_name"),
            text(flat, "w2_employee_last_name"),
            text(flat, "w2_employee_full_name"),
            &text(flat, "w2_party_role").unwrap_or_else(|| "Borrower".to_string()),
        );

        if let Some(street) = text(flat, "w2_employee_address") {
            party.addresses.push(Address {
                street: Some(street),
                ..Address::default()
            });
        }

        let employment = Employment {
            employer_name: text(flat, "w2_employer_name"),
            employer_ein: text(flat, "w2_employer_ein"),
            income_type: tagged(flat, "w2_income_type"),
            employment_status: tagged(flat, "w2_employment_status"),
            monthly_income: money(flat, "w2_wages_monthly").map(|base| MonthlyIncome {
                base: Some(base),
                ..MonthlyIncome::default()
            }),
            ..Employment::default()
        };
        if !employment.is_empty() {
            party.employment.push(employment);
        }

        let mut ivf = Ivf::new();
        for (src_key, ivf_key) in [
            ("w2_wages_annual", "w2_wages_annual"),
            ("w2_federal_tax_withheld", "federal_tax_withheld"),
            ("w2_ss_wages", "social_security_wages"),
            ("w2_ss_tax_withheld", "social_security_tax_withheld"),
            ("w2_medicare_wages", "medicare_wages"),
            ("w2_medicare_tax_withheld", "medicare_tax_withheld"),
            ("w2_ss_tips", "social_security_tips"),
            ("w2_dependent_care_benefits", "dependent_care_benefits"),
            ("w2_box12_deferred_comp", "box12_deferred_comp"),
            ("w2_state_code", "state_code"),
            ("w2_state_wages", "state_wages"),
            ("w2_state_income_tax", "state_income_tax"),
            ("w2_tax_year", "tax_year"),
        ] {
            ivf_put(&mut ivf, ivf_key, flat.get(src_key).cloned());
        }
        if !ivf.is_empty() {
            party.income_verification_fragments.push(ivf);
        }

        CanonicalRecord {
            deal: crate::canonical::model::Deal {
                parties: vec![party],
                ..Default::default()
            },
            document_metadata: build_metadata(flat, "w2_"),
            flat_data: None,
        }
    }

    /// URLA: borrower + optional co-borrower + optional originator, loan info, property
    fn urla_strategy(&self, flat: &FlatMap) -> CanonicalRecord {
        let mut parties = Vec::new();

        let mut borrower = build_party(
            text(flat, "urla_borrower_ssn"),
            None,
            None,
            text(flat, "urla_borrower_name"),
            &text(flat, "urla_borrower_party_role").unwrap_or_else(|| "Borrower".to_string()),
        );

        {
            let individual = borrower.individual.get_or_insert_with(Individual::default);
            individual.home_phone = text(flat, "urla_borrower_phone");
            individual.dob = text(flat, "urla_borrower_dob");
            individual.years_school = text(flat, "urla_borrower_years_school");
            individual.marital_status = text(flat, "urla_borrower_marital_status");
            individual.ethnicity = text(flat, "urla_borrower_ethnicity");
            individual.race = text(flat, "urla_borrower_race");
            individual.sex = text(flat, "urla_borrower_sex");
            if let Some(citizen) = text(flat, "urla_borrower_us_citizen") {
                individual.citizenship_residency = Some(TaggedValue::new(citizen));
            }
        }

        if borrower.individual.as_ref().is_some_and(Individual::is_empty) {
            borrower.individual = None;
        }

        if let Some(intent) = text(flat, "urla_borrower_primary_residence_intent") {
            borrower.declarations = Some(Declarations {
                intent_to_occupy: Some(intent),
            });
        }

        let address = Address {
            street: text(flat, "urla_borrower_present_address"),
            city_state_zip: text(flat, "urla_borrower_city_state_zip"),
            ..Address::default()
        };
        if !address.is_empty() {
            borrower.addresses.push(address);
        }

        let employment = Employment {
            employer_name: text(flat, "urla_employer_name"),
            position_title: text(flat, "urla_position_title"),
            business_phone: text(flat, "urla_business_phone"),
            monthly_income: {
                let income = MonthlyIncome {
                    base: money(flat, "urla_base_employment_income"),
                    overtime: money(flat, "urla_overtime_income"),
                    total: money(flat, "urla_total_monthly_income"),
                    ..MonthlyIncome::default()
                };
                if income.is_empty() { None } else { Some(income) }
            },
            ..Employment::default()
        };
        if !employment.is_empty() {
            borrower.employment.push(employment);
        }

        borrower.total_assets = money(flat, "urla_total_assets");
        borrower.total_liabilities = money(flat, "urla_total_liabilities");
        borrower.total_monthly_payments = money(flat, "urla_total_monthly_payments");

        parties.push(borrower);

        if text(flat, "urla_coborrower_name").is_some() || text(flat, "urla_coborrower_ssn").is_some() {
            parties.push(build_party(
                text(flat, "urla_coborrower_ssn"),
                None,
                None,
                text(flat, "urla_coborrower_name"),
                "CoBorrower",
            ));
        }

        if let Some(company) = text(flat, "urla_originator_company") {
            parties.push(Party {
                company_name: Some(company),
                party_role: Some(TaggedValue::new("Lender")),
                ..Party::default()
            });
        }

        let mut record = CanonicalRecord {
            deal: crate::canonical::model::Deal {
                parties,
                ..Default::default()
            },
            document_metadata: build_metadata(flat, "urla_"),
            flat_data: None,
        };

        let property = SubjectProperty {
            address: text(flat, "urla_property_address"),
            number_of_units: decimal(flat, "urla_number_of_units"),
            occupancy_type: tagged(flat, "urla_occupancy_type"),
            estate_type: text(flat, "urla_estate_type"),
            title_held_names: text(flat, "urla_title_held_names"),
            valuation: money(flat, "urla_purchase_price").map(|price| Valuation {
                sales_price: Some(price),
                ..Valuation::default()
            }),
            ..SubjectProperty::default()
        };
        if !property.is_empty() {
            record.deal.collateral = Some(Collateral {
                subject_property: Some(property),
            });
        }

        let tx = TransactionInformation {
            mortgage_type: tagged(flat, "urla_mortgage_type"),
            loan_purpose: tagged(flat, "urla_loan_purpose"),
            amortization_type: tagged(flat, "urla_amortization_type"),
            application_date: text(flat, "urla_application_date"),
            estimated_prepaid_items: money(flat, "urla_estimated_prepaid"),
            estimated_closing_costs: money(flat, "urla_estimated_closing_costs"),
            pmi_funding_fee: money(flat, "urla_pmi_funding_fee"),
            final_loan_amount: money(flat, "urla_final_loan_amount"),
        };
        if !tx.is_empty() {
            record.deal.transaction_information = Some(tx);
        }

        let note = PromissoryNote {
            principal_amount: money(flat, "urla_loan_amount"),
            interest_rate: decimal(flat, "urla_interest_rate"),
            loan_term_months: decimal(flat, "urla_loan_term_months"),
            ..PromissoryNote::default()
        };
        if !note.is_empty() {
            record.deal.disclosures_and_closing = Some(DisclosuresAndClosing {
                promissory_note: Some(note),
                ..DisclosuresAndClosing::default()
            });
        }

        let identifiers = Identifiers {
            agency_case_number: text(flat, "urla_agency_case_number"),
            lender_case_number: text(flat, "urla_lender_case_number"),
        };
        if !identifiers.is_empty() {
            record.deal.identifiers = Some(identifiers);
        }

        record
    }

    /// Pay Stub: single party (employee), single employer, income snapshot
    fn paystub_strategy(&self, flat: &FlatMap) -> CanonicalRecord {
        let mut party = build_party(None, None, None, None, "Borrower");

        // key_value rules store under the label text itself, so both the
        // prefixed and the label form are honored
        let employee_name = text(flat, "paystub_employee_name").or_else(|| text(flat, "Employee Name"));
        let employee_id = text(flat, "paystub_employee_id").or_else(|| text(flat, "Employee ID"));
        if employee_name.is_some() || employee_id.is_some() {
            let individual = party.individual.get_or_insert_with(Individual::default);
            individual.full_name = employee_name;
            individual.employee_id = employee_id;
        }

        let employment = Employment {
            employer_name: text(flat, "paystub_employer_name"),
            employer_business_unit: text(flat, "paystub_employer_business_unit"),
            department: text(flat, "paystub_department"),
            position_title: text(flat, "paystub_job_title"),
            pay_rate: flat.get("paystub_pay_rate").cloned(),
            location: text(flat, "paystub_location"),
            employment_status: tagged(flat, "paystub_employment_status"),
            monthly_income: money(flat, "paystub_monthly_income_base").map(|base| MonthlyIncome {
                base: Some(base),
                ..MonthlyIncome::default()
            }),
            ..Employment::default()
        };
        if !employment.is_empty() {
            party.employment.push(employment);
        }

        let mut ivf = Ivf::new();
        for (src_key, ivf_key) in [
            ("paystub_pay_period_start", "pay_period_start"),
            ("paystub_pay_period_end", "pay_period_end"),
            ("paystub_advice_date", "advice_date"),
            ("paystub_federal_tax_status", "federal_tax_status"),
            ("paystub_current_gross_pay", "current_gross_pay"),
            ("paystub_current_fed_taxable_gross", "current_fed_taxable_gross"),
            ("paystub_current_total_taxes", "current_total_taxes"),
            ("paystub_current_total_deductions", "current_total_deductions"),
            ("paystub_current_net_pay", "current_net_pay"),
            ("paystub_ytd_gross_amount", "ytd_gross_amount"),
            ("paystub_ytd_fed_taxable_gross", "ytd_fed_taxable_gross"),
            ("paystub_ytd_total_taxes", "ytd_total_taxes"),
            ("paystub_ytd_total_deductions", "ytd_total_deductions"),
            ("paystub_ytd_net_pay", "ytd_net_pay"),
            ("paystub_verified_monthly_base", "verified_monthly_base"),
        ] {
            ivf_put(&mut ivf, ivf_key, flat.get(src_key).cloned());
        }
        if let Some(source) = text(flat, "paystub_source_doc_type") {
            let mut tag = FlatMap::new();
            tag.insert("value".to_string(), FieldValue::Text(source));
            ivf.insert("source_doc".to_string(), FieldValue::Record(tag));
        }
        for list_key in [
            "paystub_earnings",
            "paystub_before_tax_deductions",
            "paystub_after_tax_deductions",
        ] {
            if let Some(value) = flat.get(list_key) {
                let name = list_key.trim_start_matches("paystub_");
                ivf.insert(name.to_string(), value.clone());
            }
        }
        if !ivf.is_empty() {
            party.income_verification_fragments.push(ivf);
        }

        CanonicalRecord {
            deal: crate::canonical::model::Deal {
                parties: vec![party],
                ..Default::default()
            },
            document_metadata: build_metadata(flat, "paystub_"),
            flat_data: None,
        }
    }

    /// Bank Statement: single party, single asset account
    fn bank_statement_strategy(&self, flat: &FlatMap) -> CanonicalRecord {
        let mut party = build_party(
            None,
            None,
            None,
            text(flat, "bank_account_holder"),
            &text(flat, "bank_party_role").unwrap_or_else(|| "Borrower".to_string()),
        );

        let asset = Asset {
            institution_name: text(flat, "bank_institution_name"),
            account_number: text(flat, "bank_account_number"),
            account_type: text(flat, "bank_account_type"),
            asset_type: tagged(flat, "bank_asset_type"),
            statement_period_start: text(flat, "bank_statement_period_start"),
            statement_period_end: text(flat, "bank_statement_period_end"),
            beginning_balance: money(flat, "bank_beginning_balance"),
            ending_balance: money(flat, "bank_ending_balance"),
            cash_or_market_value_amount: money(flat, "bank_cash_or_market_value"),
            total_deposits: money(flat, "bank_total_deposits"),
            total_withdrawals: money(flat, "bank_total_withdrawals"),
            service_fees: money(flat, "bank_service_fees"),
            total_checks: money(flat, "bank_total_checks"),
            average_balance: money(flat, "bank_average_balance"),
            transactions: rows(flat, "bank_deposit_transactions").unwrap_or_default(),
            withdrawal_transactions: rows(flat, "bank_withdrawal_transactions").unwrap_or_default(),
        };
        if !asset.is_empty() {
            party.assets.push(asset);
        }

        CanonicalRecord {
            deal: crate::canonical::model::Deal {
                parties: vec![party],
                ..Default::default()
            },
            document_metadata: build_metadata(flat, "bank_"),
            flat_data: None,
        }
    }

    /// Tax Return 1040: taxpayer + optional spouse, income line items
    fn tax_return_strategy(&self, flat: &FlatMap) -> CanonicalRecord {
        let mut parties = Vec::new();

        let mut taxpayer = build_party(
            text(flat, "tax_taxpayer_ssn"),
            text(flat, "tax_taxpayer_first_name"),
            text(flat, "tax_taxpayer_last_name"),
            None,
            &text(flat, "tax_party_role").unwrap_or_else(|| "Borrower".to_string()),
        );

        let address = Address {
            street: text(flat, "tax_taxpayer_street"),
            apt_number: text(flat, "tax_taxpayer_apt"),
            city: text(flat, "tax_taxpayer_city"),
            state: text(flat, "tax_taxpayer_state"),
            zip_code: text(flat, "tax_taxpayer_zip"),
            ..Address::default()
        };
        if !address.is_empty() {
            taxpayer.addresses.push(address);
        }

        let mut ivf = Ivf::new();
        for (src_key, ivf_key) in [
            ("tax_year", "tax_year"),
            ("tax_filing_status", "filing_status"),
            ("tax_wages_salaries_tips", "wages_salaries_tips"),
            ("tax_taxable_interest", "taxable_interest"),
            ("tax_ordinary_dividends", "ordinary_dividends"),
            ("tax_capital_gains", "capital_gains"),
            ("tax_other_income", "other_income"),
            ("tax_total_income", "total_income"),
            ("tax_adjustments_to_income", "adjustments_to_income"),
            ("tax_adjusted_gross_income", "adjusted_gross_income"),
            ("tax_deductions", "deductions"),
            ("tax_taxable_income", "taxable_income"),
            ("tax_total_tax", "total_tax"),
            ("tax_total_payments", "total_payments"),
            ("tax_refund_amount", "refund_amount"),
            ("tax_amount_owed", "amount_owed"),
        ] {
            ivf_put(&mut ivf, ivf_key, flat.get(src_key).cloned());
        }
        if !ivf.is_empty() {
            taxpayer.income_verification_fragments.push(ivf);
        }

        parties.push(taxpayer);

        if text(flat, "tax_spouse_first_name").is_some() || text(flat, "tax_spouse_ssn").is_some() {
            parties.push(build_party(
                text(flat, "tax_spouse_ssn"),
                text(flat, "tax_spouse_first_name"),
                text(flat, "tax_spouse_last_name"),
                None,
                "CoBorrower",
            ));
        }

        CanonicalRecord {
            deal: crate::canonical::model::Deal {
                parties,
                ..Default::default()
            },
            document_metadata: build_metadata(flat, "tax_"),
            flat_data: None,
        }
    }

    /// Appraisal 1004: borrower party, property details, valuation
    fn appraisal_strategy(&self, flat: &FlatMap) -> CanonicalRecord {
        let mut parties = vec![build_party(
            None,
            None,
            None,
            text(flat, "appraisal_borrower_name"),
            &text(flat, "appraisal_party_role").unwrap_or_else(|| "Borrower".to_string()),
        )];

        if let Some(lender) = text(flat, "appraisal_lender_name") {
            parties.push(Party {
                company_name: Some(lender),
                party_role: Some(TaggedValue::new("Lender")),
                ..Party::default()
            });
        }

        let valuation = Valuation {
            sales_price: money(flat, "appraisal_contract_price"),
            appraisal_form_type: text(flat, "appraisal_form_type"),
            ..Valuation::default()
        };

        let property = SubjectProperty {
            address: text(flat, "appraisal_property_address"),
            city: text(flat, "appraisal_property_city"),
            state: text(flat, "appraisal_property_state"),
            zip_code: text(flat, "appraisal_property_zip"),
            county: text(flat, "appraisal_property_county"),
            legal_description: text(flat, "appraisal_legal_description"),
            assessor_parcel_number: text(flat, "appraisal_assessor_parcel"),
            tax_year: text(flat, "appraisal_tax_year"),
            annual_taxes: money(flat, "appraisal_annual_taxes"),
            year_built: decimal(flat, "appraisal_year_built"),
            effective_age_years: flat.get("appraisal_effective_age").cloned(),
            total_room_count: decimal(flat, "appraisal_room_count"),
            bedroom_count: decimal(flat, "appraisal_bedroom_count"),
            bathroom_count: decimal(flat, "appraisal_bathroom_count"),
            gross_living_area_sqft: decimal(flat, "appraisal_gla_sqft"),
            number_of_stories: decimal(flat, "appraisal_stories"),
            design_style: text(flat, "appraisal_design_style"),
            lot_dimensions: text(flat, "appraisal_lot_dimensions"),
            lot_size: flat.get("appraisal_lot_area").cloned(),
            view: text(flat, "appraisal_view"),
            basement_area_sqft: decimal(flat, "appraisal_basement_area"),
            basement_finish_percent: decimal(flat, "appraisal_basement_finish_pct"),
            condition_rating: text(flat, "appraisal_condition_rating"),
            occupancy_status: text(flat, "appraisal_occupant_type"),
            neighborhood_name: text(flat, "appraisal_neighborhood_name"),
            zoning_classification: text(flat, "appraisal_zoning"),
            fema_flood_zone: text(flat, "appraisal_fema_flood_zone"),
            fema_map_number: text(flat, "appraisal_fema_map_number"),
            valuation: if valuation.is_empty() { None } else { Some(valuation) },
            ..SubjectProperty::default()
        };

        let mut record = CanonicalRecord {
            deal: crate::canonical::model::Deal {
                parties,
                ..Default::default()
            },
            document_metadata: build_metadata(flat, "appraisal_"),
            flat_data: None,
        };
        if !property.is_empty() {
            record.deal.collateral = Some(Collateral {
                subject_property: Some(property),
            });
        }
        if let Some(loan_number) = text(flat, "appraisal_loan_number") {
            record.deal.identifiers = Some(Identifiers {
                lender_case_number: Some(loan_number),
                ..Identifiers::default()
            });
        }
        record
    }

    /// Loan Estimate H-24: borrower, lender + loan officer, loan terms
    fn loan_estimate_strategy(&self, flat: &FlatMap) -> CanonicalRecord {
        let mut parties = vec![build_party(
            None,
            None,
            None,
            text(flat, "le_applicant_names"),
            &text(flat, "le_party_role_borrower").unwrap_or_else(|| "Borrower".to_string()),
        )];

        let lender_individual = Individual {
            full_name: text(flat, "le_loan_officer"),
            nmls_id: text(flat, "le_loan_officer_nmls"),
            ..Individual::default()
        };
        let lender = Party {
            company_name: text(flat, "le_lender_name"),
            individual: if lender_individual.is_empty() {
                None
            } else {
                Some(lender_individual)
            },
            party_role: Some(TaggedValue::new(
                text(flat, "le_party_role_lender").unwrap_or_else(|| "Lender".to_string()),
            )),
            ..Party::default()
        };
        if lender.company_name.is_some() || lender.individual.is_some() {
            parties.push(lender);
        }

        let mut record = CanonicalRecord {
            deal: crate::canonical::model::Deal {
                parties,
                ..Default::default()
            },
            document_metadata: build_metadata(flat, "le_"),
            flat_data: None,
        };

        let valuation = money(flat, "le_sale_price").map(|price| Valuation {
            sales_price: Some(price),
            ..Valuation::default()
        });
        let property = SubjectProperty {
            address: text(flat, "le_property_address"),
            city_state_zip: text(flat, "le_property_city_state_zip"),
            valuation,
            ..SubjectProperty::default()
        };
        if !property.is_empty() {
            record.deal.collateral = Some(Collateral {
                subject_property: Some(property),
            });
        }

        let tx = TransactionInformation {
            loan_purpose: tagged(flat, "le_loan_purpose"),
            mortgage_type: tagged(flat, "le_loan_type"),
            ..TransactionInformation::default()
        };
        if !tx.is_empty() {
            record.deal.transaction_information = Some(tx);
        }

        let note = PromissoryNote {
            principal_amount: money(flat, "le_principal_amount"),
            interest_rate: decimal(flat, "le_interest_rate"),
            interest_rate_raw: text(flat, "le_interest_rate_raw"),
            loan_term_years: decimal(flat, "le_loan_term_years"),
            ..PromissoryNote::default()
        };

        let mut h24 = Ivf::new();
        for (src_key, h24_key) in [
            ("le_date_issued", "date_issued"),
            ("le_product_description", "product_description"),
            ("le_rate_lock", "rate_lock_indicator"),
            ("le_rate_lock_expiration", "rate_lock_expiration_date"),
            ("le_monthly_pi", "monthly_principal_interest"),
            ("le_prepayment_penalty", "prepayment_penalty"),
            ("le_balloon_payment", "balloon_payment"),
            ("le_total_closing_costs", "total_closing_costs"),
            ("le_estimated_cash_to_close", "estimated_cash_to_close"),
            ("le_origination_charges", "origination_charges"),
            ("le_points_percent", "points_percent"),
            ("le_points_amount", "points_amount"),
            ("le_services_cannot_shop", "services_cannot_shop"),
            ("le_services_can_shop", "services_can_shop"),
            ("le_total_loan_costs", "total_loan_costs"),
            ("le_prepaid_interest_per_day", "prepaid_interest_per_day"),
            ("le_prepaid_interest_days", "prepaid_interest_days"),
            ("le_total_closing_costs_j", "total_closing_costs_j"),
            ("le_down_payment", "down_payment"),
            ("le_earnest_money_deposit", "earnest_money_deposit"),
            ("le_seller_credits", "seller_credits"),
            ("le_cash_to_close_table", "estimated_cash_to_close"),
            ("le_apr", "annual_percentage_rate"),
            ("le_total_interest_percentage", "total_interest_percentage"),
            ("le_five_year_total_paid", "five_year_total_paid"),
            ("le_five_year_principal_reduction", "five_year_principal_reduction"),
        ] {
            ivf_put(&mut h24, h24_key, flat.get(src_key).cloned());
        }

        let disclosures = DisclosuresAndClosing {
            promissory_note: if note.is_empty() { None } else { Some(note) },
            loan_estimate_h24: if h24.is_empty() { None } else { Some(h24) },
            ..DisclosuresAndClosing::default()
        };
        if !disclosures.is_empty() {
            record.deal.disclosures_and_closing = Some(disclosures);
        }

        if let Some(loan_id) = text(flat, "le_loan_id") {
            record.deal.identifiers = Some(Identifiers {
                lender_case_number: Some(loan_id),
                ..Identifiers::default()
            });
        }

        record
    }

    /// fallback: carry the flat bag verbatim
    fn generic_strategy(&self, flat: &FlatMap) -> CanonicalRecord {
        CanonicalRecord {
            deal: Default::default(),
            document_metadata: None,
            flat_data: Some(flat.clone()),
        }
    }
}
