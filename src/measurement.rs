//! Measurement model for the Biral VPF-730 present weather sensor
//!
//! A [`Measurement`] is one immutable sensor reading. The JSON shape produced
//! by serde is the persistence contract for the queue blob column: keys follow
//! field declaration order and a serialize/deserialize round-trip reproduces
//! the value exactly.
//!
//! Field semantics follow the sensor manual:
//! https://www.biral.com/wp-content/uploads/2019/07/VPF-710-730-750-Manual-102186.08E.pdf

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of comma-separated fields in a VPF-730 data frame
pub const FRAME_FIELDS: usize = 17;

/// Errors raised while parsing a raw sensor frame
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("sensor frame is not valid ASCII: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("sensor frame has {got} fields, expected {}", FRAME_FIELDS)]
    FieldCount { got: usize },

    #[error("unknown precipitation type {value:?}. Must be one of: {allowed}")]
    UnknownPrecipitationType { value: String, allowed: String },

    #[error("unknown obstruction to vision type {value:?}. Must be one of: {allowed}")]
    UnknownObstruction { value: String, allowed: String },

    #[error("field {field} has invalid numeric value {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Precipitation type code reported in field 4 of the data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrecipitationType {
    #[serde(rename = "NP")]
    NoPrecipitation,
    #[serde(rename = "DZ-")]
    SlightDrizzle,
    #[serde(rename = "DZ")]
    ModerateDrizzle,
    #[serde(rename = "DZ+")]
    HeavyDrizzle,
    #[serde(rename = "RA-")]
    SlightRain,
    #[serde(rename = "RA")]
    ModerateRain,
    #[serde(rename = "RA+")]
    HeavyRain,
    #[serde(rename = "SN-")]
    SlightSnow,
    #[serde(rename = "SN")]
    ModerateSnow,
    #[serde(rename = "SN+")]
    HeavySnow,
    #[serde(rename = "UP")]
    Indeterminate,
    #[serde(rename = "GS")]
    SmallHail,
    #[serde(rename = "GR")]
    Hail,
    #[serde(rename = "X")]
    InitialOrError,
}

impl PrecipitationType {
    /// All valid wire codes, in manual order
    pub const CODES: [&'static str; 14] = [
        "NP", "DZ-", "DZ", "DZ+", "RA-", "RA", "RA+", "SN-", "SN", "SN+", "UP", "GS", "GR", "X",
    ];

    pub fn from_code(code: &str) -> Option<Self> {
        use PrecipitationType::*;
        match code {
            "NP" => Some(NoPrecipitation),
            "DZ-" => Some(SlightDrizzle),
            "DZ" => Some(ModerateDrizzle),
            "DZ+" => Some(HeavyDrizzle),
            "RA-" => Some(SlightRain),
            "RA" => Some(ModerateRain),
            "RA+" => Some(HeavyRain),
            "SN-" => Some(SlightSnow),
            "SN" => Some(ModerateSnow),
            "SN+" => Some(HeavySnow),
            "UP" => Some(Indeterminate),
            "GS" => Some(SmallHail),
            "GR" => Some(Hail),
            "X" => Some(InitialOrError),
            _ => None,
        }
    }

    /// The two/three character code as transmitted by the sensor
    pub fn code(&self) -> &'static str {
        use PrecipitationType::*;
        match self {
            NoPrecipitation => "NP",
            SlightDrizzle => "DZ-",
            ModerateDrizzle => "DZ",
            HeavyDrizzle => "DZ+",
            SlightRain => "RA-",
            ModerateRain => "RA",
            HeavyRain => "RA+",
            SlightSnow => "SN-",
            ModerateSnow => "SN",
            HeavySnow => "SN+",
            Indeterminate => "UP",
            SmallHail => "GS",
            Hail => "GR",
            InitialOrError => "X",
        }
    }

    /// Human readable description from the sensor manual
    #[allow(dead_code)] // display helper for downstream consumers
    pub fn description(&self) -> &'static str {
        use PrecipitationType::*;
        match self {
            NoPrecipitation => "No precipitation",
            SlightDrizzle => "Slight drizzle",
            ModerateDrizzle => "Moderate drizzle",
            HeavyDrizzle => "Heavy drizzle",
            SlightRain => "Slight rain",
            ModerateRain => "Moderate rain",
            HeavyRain => "Heavy rain",
            SlightSnow => "Slight snow",
            ModerateSnow => "Moderate snow",
            HeavySnow => "Heavy snow",
            Indeterminate => "Indeterminate precipitation type",
            SmallHail => "Small Hail",
            Hail => "Hail",
            InitialOrError => "Initial value or error",
        }
    }
}

/// Obstruction to vision code reported in field 5 of the data frame
///
/// An empty code means no obstruction was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Obstruction {
    #[serde(rename = "")]
    None,
    #[serde(rename = "HZ")]
    Haze,
    #[serde(rename = "FG")]
    Fog,
    #[serde(rename = "DU")]
    Dust,
    #[serde(rename = "FU")]
    Smoke,
    #[serde(rename = "BR")]
    Mist,
}

impl Obstruction {
    /// All valid wire codes (the empty string means no obstruction)
    pub const CODES: [&'static str; 6] = ["", "HZ", "FG", "DU", "FU", "BR"];

    pub fn from_code(code: &str) -> Option<Self> {
        use Obstruction::*;
        match code {
            "" => Some(None),
            "HZ" => Some(Haze),
            "FG" => Some(Fog),
            "DU" => Some(Dust),
            "FU" => Some(Smoke),
            "BR" => Some(Mist),
            _ => Option::None,
        }
    }

    pub fn code(&self) -> &'static str {
        use Obstruction::*;
        match self {
            None => "",
            Haze => "HZ",
            Fog => "FG",
            Dust => "DU",
            Smoke => "FU",
            Mist => "BR",
        }
    }

    /// Human readable description from the sensor manual
    #[allow(dead_code)] // display helper for downstream consumers
    pub fn description(&self) -> &'static str {
        use Obstruction::*;
        match self {
            None => "No obstruction",
            Haze => "Haze",
            Fog => "Fog",
            Dust => "Dust",
            Smoke => "Smoke",
            Mist => "Mist",
        }
    }
}

/// One reading from the VPF-730 sensor
///
/// Field order matters: serde emits JSON keys in declaration order and the
/// local measurements table mirrors the same order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Timestamp in milliseconds since the Unix epoch (UTC)
    pub timestamp: i64,
    /// Sensor identification number set by the user
    pub sensor_id: u16,
    /// Last measurement period in seconds
    pub last_measurement_period: u32,
    /// Time since this report was generated in seconds
    pub time_since_report: u32,
    /// Meteorological optical range in km
    pub optical_range: f64,
    /// Precipitation type message
    pub precipitation_type_msg: PrecipitationType,
    /// Obstruction to vision message
    pub obstruction_to_vision: Obstruction,
    /// Receiver background illumination
    pub receiver_bg_illumination: f64,
    /// Amount of water in precipitation in the last measurement period in mm
    pub water_in_precip: f64,
    /// Temperature in degrees Celsius
    pub temp: f64,
    /// Number of precipitation particles detected in the last measurement period
    pub nr_precip_particles: u32,
    /// Transmissometer equivalent EXCO in km^-1
    pub transmission_eq: f64,
    /// EXCO less precipitation particle component in km^-1
    pub exco_less_precip_particle: f64,
    /// Backscatter EXCO in km^-1
    pub backscatter_exco: f64,
    /// Self-test and monitoring status (three characters, see manual 4.2)
    pub self_test: String,
    /// Total EXCO in km^-1
    pub total_exco: f64,
}

fn parse_num<T: std::str::FromStr>(value: &str, field: &'static str) -> Result<T, FormatError> {
    value.parse().map_err(|_| FormatError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

impl Measurement {
    /// Parse a raw data frame read from the sensor, e.g.
    ///
    /// ```text
    /// PW01,0060,0000,001.19 KM,NP ,HZ,00.06,00.0000,+020.5 C,0000,002.51,002.51,+011.10,  0000,000,OOO,002.51
    /// ```
    ///
    /// The timestamp is stamped from the wall clock at parse time. Fields 13
    /// and 14 are transmitted by the sensor but not consumed.
    pub fn from_frame(frame: &[u8]) -> Result<Measurement, FormatError> {
        // checksum transmission is off by default
        let text = std::str::from_utf8(frame)?;
        let fields: Vec<&str> = text.trim().split(',').collect();
        if fields.len() < FRAME_FIELDS {
            return Err(FormatError::FieldCount { got: fields.len() });
        }

        let precip_code = fields[4].trim();
        let precipitation_type_msg = PrecipitationType::from_code(precip_code).ok_or_else(|| {
            FormatError::UnknownPrecipitationType {
                value: precip_code.to_string(),
                allowed: PrecipitationType::CODES.join(", "),
            }
        })?;

        let obstruction_code = fields[5].trim();
        let obstruction_to_vision =
            Obstruction::from_code(obstruction_code).ok_or_else(|| FormatError::UnknownObstruction {
                value: obstruction_code.to_string(),
                allowed: Obstruction::CODES.join(", "),
            })?;

        // strip the PW message header to get the sensor id
        let header = fields[0].trim();
        let sensor_id = parse_num(header.strip_prefix("PW").unwrap_or(header), "sensor_id")?;

        Ok(Measurement {
            timestamp: Utc::now().timestamp_millis(),
            sensor_id,
            last_measurement_period: parse_num(fields[1].trim(), "last_measurement_period")?,
            time_since_report: parse_num(fields[2].trim(), "time_since_report")?,
            optical_range: parse_num(
                fields[3].trim().trim_end_matches("KM").trim(),
                "optical_range",
            )?,
            precipitation_type_msg,
            obstruction_to_vision,
            receiver_bg_illumination: parse_num(fields[6].trim(), "receiver_bg_illumination")?,
            water_in_precip: parse_num(fields[7].trim(), "water_in_precip")?,
            temp: parse_num(fields[8].trim().trim_end_matches('C').trim(), "temp")?,
            nr_precip_particles: parse_num(fields[9].trim(), "nr_precip_particles")?,
            transmission_eq: parse_num(fields[10].trim(), "transmission_eq")?,
            exco_less_precip_particle: parse_num(fields[11].trim(), "exco_less_precip_particle")?,
            backscatter_exco: parse_num(fields[12].trim(), "backscatter_exco")?,
            self_test: fields[15].trim().to_string(),
            total_exco: parse_num(fields[16].trim(), "total_exco")?,
        })
    }
}

/// Fixed measurement used as a fixture across the test suite
#[cfg(test)]
pub(crate) fn test_measurement() -> Measurement {
    Measurement {
        timestamp: 1658758977000,
        sensor_id: 1,
        last_measurement_period: 60,
        time_since_report: 0,
        optical_range: 1.19,
        precipitation_type_msg: PrecipitationType::NoPrecipitation,
        obstruction_to_vision: Obstruction::Haze,
        receiver_bg_illumination: 0.06,
        water_in_precip: 0.0,
        temp: 20.5,
        nr_precip_particles: 0,
        transmission_eq: 2.51,
        exco_less_precip_particle: 2.51,
        backscatter_exco: 11.1,
        self_test: "OOO".to_string(),
        total_exco: 2.51,
    }
}
