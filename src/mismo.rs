use std::fmt::Display;
use std::sync::OnceLock;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use regex::Regex;
use tracing::{info, warn};

use crate::canonical::model::{CanonicalRecord, Deal, Party};
use crate::config::MismoConfig;
use crate::errors::{PipelineError, Result};

pub const MISMO_NAMESPACE: &str = "http://www.mismo.org/residential/2009/schemas";

fn csz_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([^,]+),\s*([A-Z]{2})\s+(\d{5}(?:-\d{4})?)").unwrap())
}

fn full_address_tail_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([^,]+),\s*([A-Z]{2})\s+(\d{5}(?:-\d{4})?)").unwrap())
}

struct XmlBuilder {
    writer: Writer<Vec<u8>>,
    open: Vec<&'static str>,
}

impl XmlBuilder {
    fn new() -> Result<Self> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(Self::wrap)?;
        Ok(Self {
            writer,
            open: Vec::new(),
        })
    }

    fn wrap(e: impl std::fmt::Debug) -> PipelineError {
        PipelineError::XmlEmission {
            message: format!("{e:?}"),
        }
    }

    fn start(&mut self, tag: &'static str) -> Result<()> {
        self.start_with(tag, &[])
    }

    fn start_with(&mut self, tag: &'static str, attrs: &[(&str, &str)]) -> Result<()> {
        let mut elem = BytesStart::new(tag);
        for (name, value) in attrs {
            elem.push_attribute((*name, *value));
        }
        self.writer.write_event(Event::Start(elem)).map_err(Self::wrap)?;
        self.open.push(tag);
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        let tag = self.open.pop().ok_or_else(|| PipelineError::XmlEmission {
            message: "unbalanced element close".to_string(),
        })?;
        self.writer
            .write_event(Event::End(BytesEnd::new(tag)))
            .map_err(Self::wrap)
    }

    /// emit `<tag>value</tag>` only when the value is non-empty after trim
    fn text_element(&mut self, tag: &'static str, value: Option<impl Display>) -> Result<()> {
        let Some(value) = value else {
            return Ok(());
        };
        let text = value.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        self.start(tag)?;
        self.writer
            .write_event(Event::Text(BytesText::new(trimmed)))
            .map_err(Self::wrap)?;
        self.end()
    }

    fn finish(mut self) -> Result<String> {
        while !self.open.is_empty() {
            self.end()?;
        }
        String::from_utf8(self.writer.into_inner()).map_err(|e| PipelineError::XmlEmission {
            message: e.to_string(),
        })
    }
}

/// canonical record -> MISMO xml
///
/// structure: MESSAGE > ABOUT_VERSIONS + DEAL_SETS > DEAL_SET > DEALS > DEAL,
/// the deal filled with PARTIES, COLLATERALS, LOANS in order. elements carry
/// text only when the source value is non-empty
pub struct MismoEmitter {
    config: MismoConfig,
}

impl MismoEmitter {
    pub fn new(config: MismoConfig) -> Self {
        Self { config }
    }

    pub fn emit(&self, record: &CanonicalRecord) -> Result<String> {
        let deal = &record.deal;
        if deal == &Deal::default() {
            warn!("no deal content in canonical record");
            return Ok(String::new());
        }

        let mut xml = XmlBuilder::new()?;
        xml.start_with("MESSAGE", &[("xmlns", MISMO_NAMESPACE)])?;

        xml.start("ABOUT_VERSIONS")?;
        xml.start("ABOUT_VERSION")?;
        xml.text_element("DataVersionIdentifier", Some(self.config.version.as_str()))?;
        xml.end()?;
        xml.end()?;

        xml.start("DEAL_SETS")?;
        xml.start("DEAL_SET")?;
        xml.start("DEALS")?;
        xml.start("DEAL")?;

        self.build_parties(&mut xml, &deal.parties)?;
        self.build_collaterals(&mut xml, deal)?;
        self.build_loans(&mut xml, deal)?;

        let output = xml.finish()?;
        info!(bytes = output.len(), version = self.config.version.as_str(), "mismo xml emitted");
        Ok(output)
    }

    fn build_parties(&self, xml: &mut XmlBuilder, parties: &[Party]) -> Result<()> {
        if parties.is_empty() {
            return Ok(());
        }
        xml.start("PARTIES")?;
        for party in parties {
            xml.start("PARTY")?;
            let individual = party.individual.clone().unwrap_or_default();
            let role = party.party_role.as_ref().map(|r| r.value.as_str());

            xml.start("INDIVIDUAL")?;
            xml.start("NAME")?;
            match individual.full_name.as_deref().filter(|s| !s.trim().is_empty()) {
                Some(full_name) => {
                    let parts: Vec<&str> = full_name.split_whitespace().collect();
                    if parts.len() >= 2 {
                        xml.text_element("FirstName", Some(parts[0]))?;
                        if parts.len() > 2 {
                            xml.text_element("MiddleName", Some(parts[1..parts.len() - 1].join(" ")))?;
                        }
                        xml.text_element("LastName", Some(parts[parts.len() - 1]))?;
                    } else {
                        xml.text_element("FirstName", Some(full_name))?;
                    }
                }
                None => {
                    xml.text_element("FirstName", individual.first_name.as_deref())?;
                    xml.text_element("MiddleName", individual.middle_name.as_deref())?;
                    xml.text_element("LastName", individual.last_name.as_deref())?;
                }
            }
            xml.end()?; // NAME

            xml.text_element("BirthDate", individual.dob.as_deref())?;
            xml.text_element("MaritalStatusType", individual.marital_status.as_deref())?;

            if let Some(ssn) = individual.ssn.as_deref().filter(|s| !s.trim().is_empty()) {
                xml.start("TAXPAYER_IDENTIFIERS")?;
                xml.start("TAXPAYER_IDENTIFIER")?;
                xml.text_element("TaxpayerIdentifierType", Some("SocialSecurityNumber"))?;
                xml.text_element("TaxpayerIdentifierValue", Some(ssn))?;
                xml.end()?;
                xml.end()?;
            }

            if let Some(phone) = individual.home_phone.as_deref().filter(|s| !s.trim().is_empty()) {
                xml.start("CONTACT_POINTS")?;
                xml.start("CONTACT_POINT")?;
                xml.start("CONTACT_POINT_TELEPHONE")?;
                xml.text_element("ContactPointTelephoneValue", Some(phone))?;
                xml.end()?;
                xml.end()?;
                xml.end()?;
            }
            xml.end()?; // INDIVIDUAL

            if !party.addresses.is_empty() {
                xml.start("ADDRESSES")?;
                for address in &party.addresses {
                    xml.start("ADDRESS")?;
                    xml.text_element("AddressLineText", address.street.as_deref())?;
                    match address.city_state_zip.as_deref().filter(|s| !s.is_empty()) {
                        Some(csz) => self.write_city_state_zip(xml, csz)?,
                        None => {
                            xml.text_element("CityName", address.city.as_deref())?;
                            xml.text_element("StateCode", address.state.as_deref())?;
                            xml.text_element("PostalCode", address.zip_code.as_deref())?;
                        }
                    }
                    xml.text_element(
                        "AddressType",
                        address.address_type.as_ref().map(|t| t.value.as_str()),
                    )?;
                    xml.end()?;
                }
                xml.end()?;
            }

            xml.start("ROLES")?;
            xml.start("ROLE")?;
            xml.start("ROLE_DETAIL")?;
            xml.text_element("PartyRoleType", Some(role.unwrap_or("Borrower")))?;
            xml.end()?; // ROLE_DETAIL

            if matches!(role, None | Some("Borrower") | Some("CoBorrower")) {
                xml.start("BORROWER")?;

                if !party.employment.is_empty() {
                    xml.start("EMPLOYERS")?;
                    for employment in &party.employment {
                        xml.start("EMPLOYER")?;
                        xml.start("LEGAL_ENTITY")?;
                        xml.text_element("FullName", employment.employer_name.as_deref())?;
                        xml.end()?;
                        xml.text_element(
                            "EmploymentPositionDescription",
                            employment.position_title.as_deref(),
                        )?;
                        xml.text_element(
                            "EmploymentStatusType",
                            employment.employment_status.as_ref().map(|s| s.value.as_str()),
                        )?;
                        xml.text_element(
                            "EmploymentSelfEmployedIndicator",
                            employment.is_self_employed.map(|b| b.to_string()),
                        )?;
                        xml.end()?; // EMPLOYER
                    }
                    xml.end()?; // EMPLOYERS

                    for employment in &party.employment {
                        let Some(income) = &employment.monthly_income else {
                            continue;
                        };
                        if income.is_empty() {
                            continue;
                        }
                        xml.start("CURRENT_INCOME")?;
                        xml.start("CURRENT_INCOME_ITEMS")?;
                        for (name, amount) in income.components() {
                            let income_type = match name {
                                "base" => "Base",
                                "overtime" => "Overtime",
                                "bonus" => "Bonus",
                                _ => "Commissions",
                            };
                            xml.start("CURRENT_INCOME_ITEM")?;
                            xml.text_element("CurrentIncomeMonthlyTotalAmount", Some(amount))?;
                            xml.text_element("IncomeType", Some(income_type))?;
                            xml.end()?;
                        }
                        xml.end()?;
                        xml.end()?;
                    }
                }

                let citizenship = individual
                    .citizenship_residency
                    .as_ref()
                    .map(|c| c.value.as_str())
                    .filter(|s| !s.is_empty());
                let intent = party
                    .declarations
                    .as_ref()
                    .and_then(|d| d.intent_to_occupy.as_deref())
                    .filter(|s| !s.is_empty());
                if citizenship.is_some() || intent.is_some() {
                    xml.start("DECLARATION")?;
                    xml.start("DECLARATION_DETAIL")?;
                    if let Some(citizenship) = citizenship {
                        let value = if citizenship.eq_ignore_ascii_case("uscitizen")
                            || citizenship.eq_ignore_ascii_case("true")
                            || citizenship.eq_ignore_ascii_case("yes")
                        {
                            "USCitizen"
                        } else {
                            citizenship
                        };
                        xml.text_element("CitizenshipResidencyType", Some(value))?;
                    }
                    if intent.is_some() {
                        xml.text_element("IntentToOccupyType", Some("Yes"))?;
                    }
                    xml.end()?;
                    xml.end()?;
                }

                xml.end()?; // BORROWER
            }

            xml.end()?; // ROLE
            xml.end()?; // ROLES
            xml.end()?; // PARTY
        }
        xml.end()?; // PARTIES
        Ok(())
    }

    fn build_collaterals(&self, xml: &mut XmlBuilder, deal: &Deal) -> Result<()> {
        let Some(property) = deal.collateral.as_ref().and_then(|c| c.subject_property.as_ref())
        else {
            return Ok(());
        };
        if property.is_empty() {
            return Ok(());
        }

        xml.start("COLLATERALS")?;
        xml.start("COLLATERAL")?;
        xml.start("SUBJECT_PROPERTY")?;

        if let Some(address) = property.address.as_deref().filter(|s| !s.trim().is_empty()) {
            xml.start("ADDRESS")?;
            xml.text_element("AddressLineText", Some(address))?;
            if let Some(c) = full_address_tail_re().captures(address) {
                xml.text_element("CityName", Some(c[1].trim()))?;
                xml.text_element("StateCode", Some(&c[2]))?;
                xml.text_element("PostalCode", Some(&c[3]))?;
            }
            xml.end()?;
        }

        xml.start("PROPERTY_DETAIL")?;
        xml.text_element(
            "PropertyCurrentUsageType",
            property.occupancy_type.as_ref().map(|t| t.value.as_str()),
        )?;
        xml.text_element(
            "ProjectDesignType",
            property.property_type.as_ref().map(|t| t.value.as_str()),
        )?;
        xml.text_element("PropertyEstateType", property.estate_type.as_deref())?;
        xml.text_element("FinancedUnitCount", property.number_of_units)?;
        xml.end()?;

        if let Some(valuation) = property.valuation.as_ref().filter(|v| !v.is_empty()) {
            xml.start("PROPERTY_VALUATIONS")?;
            xml.start("PROPERTY_VALUATION")?;
            xml.text_element("PropertyValuationAmount", valuation.appraised_value)?;
            xml.text_element("PropertyEstimatedValueAmount", valuation.sales_price)?;
            xml.text_element(
                "AppraisalMethodType",
                valuation.appraisal_method.as_ref().map(|m| m.value.as_str()),
            )?;
            xml.end()?;
            xml.end()?;
        }

        xml.end()?; // SUBJECT_PROPERTY
        xml.end()?; // COLLATERAL
        xml.end()?; // COLLATERALS
        Ok(())
    }

    fn build_loans(&self, xml: &mut XmlBuilder, deal: &Deal) -> Result<()> {
        let transaction = deal.transaction_information.as_ref();
        let note = deal
            .disclosures_and_closing
            .as_ref()
            .and_then(|d| d.promissory_note.as_ref());
        let identifiers = deal.identifiers.as_ref();

        if transaction.is_none() && note.is_none() && identifiers.is_none() {
            return Ok(());
        }

        xml.start("LOANS")?;
        xml.start("LOAN")?;

        xml.start("LOAN_IDENTIFIERS")?;
        xml.start("LOAN_IDENTIFIER")?;
        xml.text_element(
            "AgencyCaseIdentifier",
            identifiers.and_then(|i| i.agency_case_number.as_deref()),
        )?;
        xml.text_element(
            "LenderCaseIdentifier",
            identifiers.and_then(|i| i.lender_case_number.as_deref()),
        )?;
        xml.end()?;
        xml.end()?;

        let amortization = transaction
            .and_then(|t| t.amortization_type.as_ref())
            .map(|t| t.value.as_str())
            .filter(|s| !s.is_empty());
        if let Some(amortization) = amortization {
            xml.start("AMORTIZATION")?;
            xml.start("AMORTIZATION_RULE")?;
            xml.text_element("AmortizationType", Some(amortization))?;
            xml.end()?;
            xml.end()?;
        }

        xml.start("LOAN_DETAIL")?;
        xml.text_element(
            "ApplicationReceivedDate",
            transaction.and_then(|t| t.application_date.as_deref()),
        )?;
        xml.text_element(
            "MortgageType",
            transaction
                .and_then(|t| t.mortgage_type.as_ref())
                .map(|t| t.value.as_str()),
        )?;
        xml.end()?;

        xml.start("TERMS_OF_LOAN")?;
        xml.text_element("NoteAmount", note.and_then(|n| n.principal_amount))?;
        xml.text_element("NoteRatePercent", note.and_then(|n| n.interest_rate))?;
        xml.text_element("LoanMaturityPeriodCount", note.and_then(|n| n.loan_term_months))?;
        xml.end()?;

        let purpose = transaction
            .and_then(|t| t.loan_purpose.as_ref())
            .map(|t| t.value.as_str())
            .filter(|s| !s.is_empty());
        if let Some(purpose) = purpose {
            xml.start("LOAN_PURPOSE")?;
            xml.text_element("LoanPurposeType", Some(purpose))?;
            xml.end()?;
        }

        let closing = deal
            .disclosures_and_closing
            .as_ref()
            .and_then(|d| d.closing_disclosure_h25.as_ref());
        let le = deal
            .disclosures_and_closing
            .as_ref()
            .and_then(|d| d.loan_estimate_h24.as_ref());
        if closing.is_some() || le.is_some() {
            xml.start("CLOSING_INFORMATION")?;
            xml.start("CLOSING_INFORMATION_DETAIL")?;
            if let Some(closing) = closing {
                xml.text_element(
                    "CashToCloseAmount",
                    closing.get("final_cash_to_close").and_then(|v| v.to_text()),
                )?;
                xml.text_element(
                    "ClosingDate",
                    closing.get("disbursement_date").and_then(|v| v.to_text()),
                )?;
            }
            xml.end()?;
            xml.end()?;
        }

        xml.end()?; // LOAN
        xml.end()?; // LOANS
        Ok(())
    }

    fn write_city_state_zip(&self, xml: &mut XmlBuilder, csz: &str) -> Result<()> {
        match csz_re().captures(csz) {
            Some(c) => {
                xml.text_element("CityName", Some(c[1].trim()))?;
                xml.text_element("StateCode", Some(&c[2]))?;
                xml.text_element("PostalCode", Some(&c[3]))?;
            }
            None => {
                xml.text_element("CityName", Some(csz))?;
            }
        }
        Ok(())
    }
}
