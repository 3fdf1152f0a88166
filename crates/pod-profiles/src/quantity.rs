//! Numeric values of Kubernetes resource quantities.
//!
//! Only what is needed to compare quantities is supported: a quantity is parsed into a single
//! floating point value in base units, its suffix is not kept.

use std::{num::ParseFloatError, str::FromStr};

use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use snafu::{ResultExt, Snafu, ensure};

#[derive(Debug, PartialEq, Snafu)]
pub enum ParseQuantityError {
    #[snafu(display("input is either empty or contains non-ascii characters"))]
    InvalidFormat,

    #[snafu(display("failed to parse floating point number"))]
    InvalidFloat { source: ParseFloatError },

    #[snafu(display("failed to parse {input:?} as quantity suffix"))]
    InvalidSuffix { input: String },
}

/// A parsed quantity, in base units (bytes, cores, ...).
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct Quantity(f64);

impl Quantity {
    pub fn value(self) -> f64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0.0
    }
}

impl FromStr for Quantity {
    type Err = ParseQuantityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        ensure!(!input.is_empty() && input.is_ascii(), InvalidFormatSnafu);

        let (number, suffix) = match input.find(|c: char| c.is_ascii_alphabetic()) {
            Some(suffix_index) => input.split_at(suffix_index),
            None => (input, ""),
        };
        let value = f64::from_str(number).context(InvalidFloatSnafu)?;

        Ok(Self(value * factor(suffix)?))
    }
}

impl TryFrom<&K8sQuantity> for Quantity {
    type Error = ParseQuantityError;

    fn try_from(value: &K8sQuantity) -> Result<Self, Self::Error> {
        Self::from_str(&value.0)
    }
}

/// Byte multiples based on powers of 2.
#[derive(Clone, Copy, Debug, PartialEq, strum::EnumString)]
enum BinaryMultiple {
    #[strum(serialize = "Ki")]
    Kibi,

    #[strum(serialize = "Mi")]
    Mebi,

    #[strum(serialize = "Gi")]
    Gibi,

    #[strum(serialize = "Ti")]
    Tebi,

    #[strum(serialize = "Pi")]
    Pebi,

    #[strum(serialize = "Ei")]
    Exbi,
}

impl BinaryMultiple {
    fn factor(self) -> f64 {
        match self {
            Self::Kibi => 2f64.powi(10),
            Self::Mebi => 2f64.powi(20),
            Self::Gibi => 2f64.powi(30),
            Self::Tebi => 2f64.powi(40),
            Self::Pebi => 2f64.powi(50),
            Self::Exbi => 2f64.powi(60),
        }
    }
}

/// Multiples based on powers of 10. Kubernetes uses `k` rather than `K` for kilo.
#[derive(Clone, Copy, Debug, PartialEq, strum::EnumString)]
enum DecimalMultiple {
    #[strum(serialize = "n")]
    Nano,

    #[strum(serialize = "u")]
    Micro,

    #[strum(serialize = "m")]
    Milli,

    #[strum(serialize = "k")]
    Kilo,

    #[strum(serialize = "M")]
    Mega,

    #[strum(serialize = "G")]
    Giga,

    #[strum(serialize = "T")]
    Tera,

    #[strum(serialize = "P")]
    Peta,

    #[strum(serialize = "E")]
    Exa,
}

impl DecimalMultiple {
    fn factor(self) -> f64 {
        match self {
            Self::Nano => 10f64.powi(-9),
            Self::Micro => 10f64.powi(-6),
            Self::Milli => 10f64.powi(-3),
            Self::Kilo => 10f64.powi(3),
            Self::Mega => 10f64.powi(6),
            Self::Giga => 10f64.powi(9),
            Self::Tera => 10f64.powi(12),
            Self::Peta => 10f64.powi(15),
            Self::Exa => 10f64.powi(18),
        }
    }
}

fn factor(suffix: &str) -> Result<f64, ParseQuantityError> {
    if suffix.is_empty() {
        return Ok(1.0);
    }

    if let Ok(binary) = BinaryMultiple::from_str(suffix) {
        return Ok(binary.factor());
    }

    if let Ok(decimal) = DecimalMultiple::from_str(suffix) {
        return Ok(decimal.factor());
    }

    // Scientific notation, `E` on its own is exa
    if let Some(exponent) = suffix.strip_prefix(['e', 'E'])
        && let Ok(exponent) = f64::from_str(exponent)
    {
        return Ok(10f64.powf(exponent));
    }

    InvalidSuffixSnafu { input: suffix }.fail()
}
