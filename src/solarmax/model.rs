use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

// {{{ InverterType
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum InverterType {
    SolarMax2000S = 20010,
    SolarMax3000S = 20020,
    SolarMax4200S = 20030,
    SolarMax6000S = 20040,
}

impl InverterType {
    pub fn from_code(code: u64) -> Option<Self> {
        u32::try_from(code)
            .ok()
            .and_then(|c| Self::try_from(c).ok())
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::SolarMax2000S => "SolarMax 2000S",
            Self::SolarMax3000S => "SolarMax 3000S",
            Self::SolarMax4200S => "SolarMax 4200S",
            Self::SolarMax6000S => "SolarMax 6000S",
        }
    }

    /// Nameplate rating in watts.
    pub fn rated_power(&self) -> u32 {
        match self {
            Self::SolarMax2000S => 2000,
            Self::SolarMax3000S => 3000,
            Self::SolarMax4200S => 4200,
            Self::SolarMax6000S => 6000,
        }
    }
} // }}}

// {{{ SystemStatus
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum SystemStatus {
    NoCommunication = 20000,
    Running = 20001,
    IrradianceTooLow = 20002,
    Starting = 20003,
    MppOperation = 20004,
    FanRunning = 20005,
    MaximumPower = 20006,
    TemperatureLimit = 20007,
    MainsOperation = 20008,
}

pub struct StatusString;
impl StatusString {
    pub fn from_value(code: u64) -> &'static str {
        use SystemStatus::*;

        let status = u32::try_from(code)
            .ok()
            .and_then(|c| SystemStatus::try_from(c).ok());

        match status {
            Some(NoCommunication) => "No communication",
            Some(Running) => "Running",
            Some(IrradianceTooLow) => "Irradiance too low",
            Some(Starting) => "Starting",
            Some(MppOperation) => "MPP operation",
            Some(FanRunning) => "Fan running",
            Some(MaximumPower) => "Maximum power operation",
            Some(TemperatureLimit) => "Temperature limitation",
            Some(MainsOperation) => "Mains operation",
            None => "Unknown",
        }
    }
} // }}}

// {{{ AlarmString
pub struct AlarmString;
impl AlarmString {
    const BITS: u32 = 17;

    /// Every alarm set in `mask`, lowest bit first.
    pub fn from_value(mask: u64) -> Vec<&'static str> {
        (0..Self::BITS)
            .filter(|bit| mask & (1 << bit) > 0)
            .map(Self::from_bit)
            .collect()
    }

    fn from_bit(bit: u32) -> &'static str {
        match bit {
            0 => "External fault 1",
            1 => "DC insulation fault",
            2 => "Earth fault current too high",
            3 => "Earth protection fuse blown",
            4 => "External alarm 2",
            5 => "Long-term temperature limitation",
            6 => "AC supply fault",
            7 => "External alarm 4",
            8 => "Fan failure",
            9 => "Fuse blown",
            10 => "Temperature sensor failure",
            11 => "Alarm 12",
            12 => "Alarm 13",
            13 => "Alarm 14",
            14 => "Alarm 15",
            15 => "Alarm 16",
            16 => "Alarm 17",
            _ => "Unknown alarm",
        }
    }
} // }}}
