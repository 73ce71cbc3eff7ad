//! # Config
//!
//! Configuration pieces shared by every binary in the pipeline.
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::normalizer::{
    MobilePrefixes, Normalizer, NormalizerConfigError, NumberingPlan, PrefixTable,
};

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.trim().to_owned()))
        }
    }
}

/// Ordered list of candidate fields that may hold the phone number.
///
/// This is a compatibility shim for producers that named the field differently
/// (`msisdn`, `phone`, ...). The first field present in a candidate wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldNames(pub Vec<String>);

impl FieldNames {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl FromStr for FieldNames {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_owned)
            .collect();

        if fields.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(FieldNames(fields))
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct NormalizerConfig {
    #[envconfig(
        default = "1=US,7=RU,20=EG,27=ZA,30=GR,31=NL,32=BE,33=FR,34=ES,36=HU,39=IT,40=RO,41=CH,43=AT,44=GB,45=DK,46=SE,47=NO,48=PL,49=DE,51=PE,52=MX,54=AR,55=BR,56=CL,57=CO,61=AU,62=ID,64=NZ,65=SG,81=JP,82=KR,86=CN,90=TR,91=IN,351=PT,352=LU,353=IE,358=FI"
    )]
    pub country_prefixes: PrefixTable,

    #[envconfig(default = "NL=6")]
    pub mobile_prefixes: MobilePrefixes,

    #[envconfig(default = "false")]
    pub validate_numbering_plan: bool,

    #[envconfig(default = "BR")]
    pub default_region: NonEmptyString,

    #[envconfig(default = "msisdn,raw,phone,number,value")]
    pub phone_fields: FieldNames,
}

impl NormalizerConfig {
    pub fn normalizer(&self) -> Result<Normalizer, NormalizerConfigError> {
        let normalizer = Normalizer::new(
            self.country_prefixes.clone(),
            self.mobile_prefixes.clone(),
        );

        if self.validate_numbering_plan {
            let plan = NumberingPlan::new(self.default_region.as_str())?;
            Ok(normalizer.with_numbering_plan(plan))
        } else {
            Ok(normalizer)
        }
    }
}
