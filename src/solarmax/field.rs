use crate::error::SolarMaxError;

use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// The closed set of data identifiers a SolarMax gateway understands.
///
/// Variant names follow the wire codes so that logs and frames read the
/// same.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryField {
    /// Energy today, 0.1 kWh
    KDY,
    /// Energy this year, kWh
    KYR,
    /// Energy this month, kWh
    KMT,
    /// Energy total, kWh
    KT0,
    /// AC current, 0.01 A
    IL1,
    /// DC current, 0.01 A
    IDC,
    /// AC power, 0.5 W
    PAC,
    /// Relative output, %
    PRL,
    /// System status code pair
    SYS,
    /// Alarm bitmask
    SAL,
    /// Line frequency, 0.01 Hz
    TNF,
    /// Heat sink / panel temperature, °C
    TKK,
    /// AC voltage, 0.1 V
    UL1,
    /// DC voltage, 0.1 V
    UDC,
    /// Device address
    ADR,
    /// Device type code
    TYP,
    /// Installed power, 0.5 W
    PIN,
    MAC,
    CAC,
    /// Operating hours
    KHR,
    EC00,
    EC01,
    EC02,
    EC03,
    EC04,
    EC05,
    EC06,
    EC07,
    EC08,
    BDN,
    /// Software version
    SWV,
    DIN,
    LAN,
    /// Start date/time
    SDAT,
    /// Fault / installation date/time
    FDAT,
}

impl QueryField {
    pub const ALL: [QueryField; 35] = [
        Self::KDY,
        Self::KYR,
        Self::KMT,
        Self::KT0,
        Self::IL1,
        Self::IDC,
        Self::PAC,
        Self::PRL,
        Self::SYS,
        Self::SAL,
        Self::TNF,
        Self::TKK,
        Self::UL1,
        Self::UDC,
        Self::ADR,
        Self::TYP,
        Self::PIN,
        Self::MAC,
        Self::CAC,
        Self::KHR,
        Self::EC00,
        Self::EC01,
        Self::EC02,
        Self::EC03,
        Self::EC04,
        Self::EC05,
        Self::EC06,
        Self::EC07,
        Self::EC08,
        Self::BDN,
        Self::SWV,
        Self::DIN,
        Self::LAN,
        Self::SDAT,
        Self::FDAT,
    ];

    pub fn code(&self) -> &'static str {
        use QueryField::*;

        match self {
            KDY => "KDY",
            KYR => "KYR",
            KMT => "KMT",
            KT0 => "KT0",
            IL1 => "IL1",
            IDC => "IDC",
            PAC => "PAC",
            PRL => "PRL",
            SYS => "SYS",
            SAL => "SAL",
            TNF => "TNF",
            TKK => "TKK",
            UL1 => "UL1",
            UDC => "UDC",
            ADR => "ADR",
            TYP => "TYP",
            PIN => "PIN",
            MAC => "MAC",
            CAC => "CAC",
            KHR => "KHR",
            EC00 => "EC00",
            EC01 => "EC01",
            EC02 => "EC02",
            EC03 => "EC03",
            EC04 => "EC04",
            EC05 => "EC05",
            EC06 => "EC06",
            EC07 => "EC07",
            EC08 => "EC08",
            BDN => "BDN",
            SWV => "SWV",
            DIN => "DIN",
            LAN => "LAN",
            SDAT => "SDAT",
            FDAT => "FDAT",
        }
    }
}

impl fmt::Display for QueryField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for QueryField {
    type Err = SolarMaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|f| f.code() == s)
            .copied()
            .ok_or_else(|| SolarMaxError::InvalidField(s.to_owned()))
    }
}

impl Serialize for QueryField {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.code())
    }
}
