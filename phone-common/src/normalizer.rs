//! # Normalizer
//!
//! Turns an arbitrary raw phone number string into digits, a country and a target-mobile flag.
//! Everything in here is pure: no I/O, no clock, no randomness.
use std::collections::HashMap;
use std::str::FromStr;

use phonenumber::country;
use thiserror::Error;

pub const UNKNOWN_COUNTRY: &str = "UNKNOWN";

/// Why a candidate was rejected. Rejections are final: normalization is deterministic, so
/// redelivering the same candidate can never produce a different outcome.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    #[error("no digits could be extracted from the input")]
    MissingInput,
    #[error("the number is not valid in its numbering plan")]
    InvalidNumber,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingInput => "missing_input",
            RejectReason::InvalidNumber => "invalid_number",
        }
    }
}

/// Enumeration of errors raised while building a `Normalizer` from configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum NormalizerConfigError {
    #[error("{0} is not a valid prefix rule, expected <digits>=<country>")]
    InvalidPrefixRule(String),
    #[error("prefix {0} is mapped to more than one country")]
    DuplicatePrefix(String),
    #[error("{0} is not a valid mobile rule, expected <country>=<digits>[|<digits>...]")]
    InvalidMobileRule(String),
    #[error("{0} is not a valid default region")]
    InvalidRegion(String),
}

/// Output of a successful normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichedFields {
    pub raw_digits: String,
    pub e164: Option<String>,
    pub country: String,
    pub is_target_mobile: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PrefixRule {
    prefix: String,
    country: String,
}

/// Digit prefix to country table, resolved with longest-prefix-match.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrefixTable {
    // Kept sorted by descending prefix length so the first match is the longest.
    rules: Vec<PrefixRule>,
}

impl PrefixTable {
    /// Returns the matched prefix and its country.
    pub fn lookup(&self, digits: &str) -> Option<(&str, &str)> {
        self.rules
            .iter()
            .find(|rule| digits.starts_with(&rule.prefix))
            .map(|rule| (rule.prefix.as_str(), rule.country.as_str()))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Parses `31=NL,55=BR,1=US`. Whitespace around entries is ignored.
impl FromStr for PrefixTable {
    type Err = NormalizerConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rules: Vec<PrefixRule> = Vec::new();

        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (prefix, country) = entry
                .split_once('=')
                .map(|(p, c)| (p.trim(), c.trim()))
                .filter(|(p, c)| is_digits(p) && is_country_code(c))
                .ok_or_else(|| NormalizerConfigError::InvalidPrefixRule(entry.to_owned()))?;

            if rules.iter().any(|rule| rule.prefix == prefix) {
                return Err(NormalizerConfigError::DuplicatePrefix(prefix.to_owned()));
            }

            rules.push(PrefixRule {
                prefix: prefix.to_owned(),
                country: country.to_ascii_uppercase(),
            });
        }

        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(PrefixTable { rules })
    }
}

/// National mobile prefixes per country. Only countries listed here can yield a target mobile.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MobilePrefixes(HashMap<String, Vec<String>>);

impl MobilePrefixes {
    pub fn is_mobile(&self, country: &str, national_number: &str) -> bool {
        !national_number.is_empty()
            && self.0.get(country).is_some_and(|prefixes| {
                prefixes
                    .iter()
                    .any(|prefix| national_number.starts_with(prefix.as_str()))
            })
    }
}

/// Parses `NL=6,BE=46|47|48`.
impl FromStr for MobilePrefixes {
    type Err = NormalizerConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rules: HashMap<String, Vec<String>> = HashMap::new();

        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let invalid = || NormalizerConfigError::InvalidMobileRule(entry.to_owned());
            let (country, prefixes) = entry.split_once('=').ok_or_else(invalid)?;
            let country = country.trim();
            if !is_country_code(country) {
                return Err(invalid());
            }

            let prefixes = prefixes
                .split('|')
                .map(str::trim)
                .map(|p| is_digits(p).then(|| p.to_owned()))
                .collect::<Option<Vec<String>>>()
                .ok_or_else(invalid)?;

            rules
                .entry(country.to_ascii_uppercase())
                .or_default()
                .extend(prefixes);
        }

        Ok(MobilePrefixes(rules))
    }
}

/// Full numbering plan validation, backed by libphonenumber metadata.
#[derive(Debug, Clone)]
pub struct NumberingPlan {
    default_region: country::Id,
}

impl NumberingPlan {
    /// `default_region` is used for numbers that did not match the prefix table, which are
    /// then assumed to be written in national format.
    pub fn new(default_region: &str) -> Result<Self, NormalizerConfigError> {
        let default_region = default_region
            .trim()
            .to_ascii_uppercase()
            .parse::<country::Id>()
            .map_err(|_| NormalizerConfigError::InvalidRegion(default_region.to_owned()))?;

        Ok(Self { default_region })
    }

    /// Returns the E.164 form and, when the library can tell, the region of the number.
    fn validate(
        &self,
        digits: &str,
        international: bool,
    ) -> Result<(String, Option<String>), RejectReason> {
        let parsed = if international {
            phonenumber::parse(None, format!("+{digits}"))
        } else {
            phonenumber::parse(Some(self.default_region), digits)
        };
        let number = parsed.map_err(|_| RejectReason::InvalidNumber)?;

        if !phonenumber::is_valid(&number) {
            return Err(RejectReason::InvalidNumber);
        }

        let e164 = number.format().mode(phonenumber::Mode::E164).to_string();
        let region = number.country().id().map(|id| format!("{id:?}"));

        Ok((e164, region))
    }
}

/// Classifies raw phone numbers. Cheap to clone and safe to share between tasks.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    countries: PrefixTable,
    mobile: MobilePrefixes,
    numbering_plan: Option<NumberingPlan>,
}

impl Normalizer {
    pub fn new(countries: PrefixTable, mobile: MobilePrefixes) -> Self {
        Self {
            countries,
            mobile,
            numbering_plan: None,
        }
    }

    /// Enable E.164 conversion. Numbers failing validation are rejected with `InvalidNumber`.
    pub fn with_numbering_plan(mut self, numbering_plan: NumberingPlan) -> Self {
        self.numbering_plan = Some(numbering_plan);
        self
    }

    pub fn normalize(&self, raw: &str) -> Result<EnrichedFields, RejectReason> {
        let raw_digits = strip_non_digits(raw);
        if raw_digits.is_empty() {
            return Err(RejectReason::MissingInput);
        }

        let (mut country, is_target_mobile) = match self.countries.lookup(&raw_digits) {
            Some((prefix, country)) => (
                country.to_owned(),
                self.mobile.is_mobile(country, &raw_digits[prefix.len()..]),
            ),
            None => (UNKNOWN_COUNTRY.to_owned(), false),
        };

        let e164 = match &self.numbering_plan {
            Some(plan) => {
                let international = country != UNKNOWN_COUNTRY;
                let (e164, region) = plan.validate(&raw_digits, international)?;
                if let (false, Some(region)) = (international, region) {
                    country = region;
                }
                Some(e164)
            }
            None => None,
        };

        Ok(EnrichedFields {
            raw_digits,
            e164,
            country,
            is_target_mobile,
        })
    }
}

/// Drop everything that is not an ASCII digit.
pub fn strip_non_digits(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_country_code(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| b.is_ascii_alphanumeric())
        && !s.eq_ignore_ascii_case(UNKNOWN_COUNTRY)
}
