use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{CoreResult, LoggerError};
use crate::types::Reading;

/// Lines with fewer comma-separated fields are rejected
pub const MIN_FIELDS: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected at least 4 fields, found {found}")]
    TooFewFields { found: usize },

    /// Only reported to the debug log; the field is coerced to 0.0
    #[error("field {index} is not a numeric literal")]
    BadNumericField { index: usize },
}

/// Decoded numeric fields of one line, in line order
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    fields: Vec<f64>,
}

impl RawSample {
    pub fn fields(&self) -> &[f64] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, index: FieldIndex) -> Option<f64> {
        index
            .resolve(self.fields.len())
            .and_then(|i| self.fields.get(i).copied())
    }
}

/// Split a line on `,` and convert every field to a number.
///
/// Only a short line fails; a field that is not a plain decimal literal
/// becomes `0.0`.
pub fn parse_line(raw: &str) -> Result<RawSample, ParseError> {
    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() < MIN_FIELDS {
        return Err(ParseError::TooFewFields { found: parts.len() });
    }

    let fields = parts
        .iter()
        .enumerate()
        .map(|(index, part)| {
            parse_field(part).unwrap_or_else(|| {
                debug!("{} in {:?}, using 0.0", ParseError::BadNumericField { index }, raw);
                0.0
            })
        })
        .collect();

    Ok(RawSample { fields })
}

/// Accepts `[+-]digits[.digits]` (at most one decimal point, at least one
/// digit) with surrounding whitespace. Exponents, `inf` and `nan` are rejected.
pub fn parse_field(field: &str) -> Option<f64> {
    let trimmed = field.trim();
    let body = trimmed
        .strip_prefix('-')
        .or_else(|| trimmed.strip_prefix('+'))
        .unwrap_or(trimmed);

    let mut digits = 0usize;
    let mut dots = 0usize;
    for c in body.chars() {
        match c {
            '0'..='9' => digits += 1,
            '.' => dots += 1,
            _ => return None,
        }
    }
    if digits == 0 || dots > 1 {
        return None;
    }

    trimmed.parse::<f64>().ok()
}

/// Position of a field, counted from the front or from the back of the line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldIndex {
    FromStart(usize),
    /// `FromEnd(1)` is the last field
    FromEnd(usize),
}

impl FieldIndex {
    pub fn resolve(self, len: usize) -> Option<usize> {
        match self {
            FieldIndex::FromStart(i) if i < len => Some(i),
            FieldIndex::FromEnd(n) if n >= 1 && n <= len => Some(len - n),
            _ => None,
        }
    }
}

/// Named schema mapping line fields to metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLayout {
    pub laser: FieldIndex,
    pub imu_x: FieldIndex,
    pub imu_y: FieldIndex,
    pub imu_z: FieldIndex,
}

impl Default for FieldLayout {
    /// Laser first, then the trailing IMU triple ordered x, z, y
    fn default() -> Self {
        Self {
            laser: FieldIndex::FromStart(0),
            imu_x: FieldIndex::FromEnd(3),
            imu_z: FieldIndex::FromEnd(2),
            imu_y: FieldIndex::FromEnd(1),
        }
    }
}

impl FieldLayout {
    /// Every index must land inside a minimum-length line
    pub fn validate(&self) -> CoreResult<()> {
        for (name, index) in [
            ("laser", self.laser),
            ("imu_x", self.imu_x),
            ("imu_y", self.imu_y),
            ("imu_z", self.imu_z),
        ] {
            if index.resolve(MIN_FIELDS).is_none() {
                return Err(LoggerError::Config(format!(
                    "field index {:?} for {} does not fit a {}-field line",
                    index, name, MIN_FIELDS
                )));
            }
        }
        Ok(())
    }

    pub fn extract(&self, raw: &RawSample) -> Reading {
        Reading {
            laser: raw.get(self.laser).unwrap_or(0.0),
            imu_x: raw.get(self.imu_x).unwrap_or(0.0),
            imu_y: raw.get(self.imu_y).unwrap_or(0.0),
            imu_z: raw.get(self.imu_z).unwrap_or(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_short_lines() {
        assert_eq!(
            parse_line("bad,0,0"),
            Err(ParseError::TooFewFields { found: 3 })
        );
        assert_eq!(parse_line(""), Err(ParseError::TooFewFields { found: 1 }));
    }

    #[test]
    fn test_bad_fields_become_zero() {
        let raw = parse_line("abc,1.5,1.2.3,7").unwrap();
        assert_eq!(raw.fields(), &[0.0, 1.5, 0.0, 7.0]);
    }

    #[test]
    fn test_field_literals() {
        assert_eq!(parse_field("12"), Some(12.0));
        assert_eq!(parse_field(" 2.5 "), Some(2.5));
        assert_eq!(parse_field("-0.25"), Some(-0.25));
        assert_eq!(parse_field(".5"), Some(0.5));
        assert_eq!(parse_field("3."), Some(3.0));
        assert_eq!(parse_field("."), None);
        assert_eq!(parse_field(""), None);
        assert_eq!(parse_field("1e3"), None);
        assert_eq!(parse_field("nan"), None);
        assert_eq!(parse_field("--1"), None);
    }

    #[test]
    fn test_default_layout_with_four_fields() {
        let raw = parse_line("10,1,2,3").unwrap();
        let reading = FieldLayout::default().extract(&raw);
        assert_eq!(reading.laser, 10.0);
        assert_eq!(reading.imu_x, 1.0);
        assert_eq!(reading.imu_z, 2.0);
        assert_eq!(reading.imu_y, 3.0);
    }

    #[test]
    fn test_default_layout_with_leading_extras() {
        let raw = parse_line("10,99,98,1,2,3").unwrap();
        let reading = FieldLayout::default().extract(&raw);
        assert_eq!(reading.laser, 10.0);
        assert_eq!(reading.imu_x, 1.0);
        assert_eq!(reading.imu_z, 2.0);
        assert_eq!(reading.imu_y, 3.0);
    }

    #[test]
    fn test_layout_validation() {
        assert!(FieldLayout::default().validate().is_ok());

        let mut layout = FieldLayout::default();
        layout.imu_y = FieldIndex::FromEnd(0);
        assert!(layout.validate().is_err());

        layout.imu_y = FieldIndex::FromStart(4);
        assert!(layout.validate().is_err());
    }
}
