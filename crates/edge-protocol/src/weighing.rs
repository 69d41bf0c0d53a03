//! Weighing-event CSV parsing and the weight-decoding rule.

use std::fmt;

/// A scale-reported timestamp (no timezone; the scale's local clock).
///
/// Deliberately does not depend on `chrono` — this crate stays dependency-light,
/// the way `ipico-core::read::Timestamp` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScaleTimestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl fmt::Display for ScaleTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// A parsed weighing-event CSV record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeighingRecord {
    /// Canonical PLU: the barcode field, not the legacy first field.
    pub plu_code: String,
    pub product_name: String,
    pub operator: String,
    pub price_code: String,
    pub gross_weight_grams: i64,
    pub tare_weight_grams: i64,
    pub net_weight_grams: i64,
    pub scale_timestamp: ScaleTimestamp,
    pub raw_line: String,
}

/// Non-fatal parse failure for one scale-stream line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("too few fields: got {0}, need at least 10")]
    TooFewFields(usize),
    #[error("invalid time field: {0:?}")]
    InvalidTime(String),
    #[error("invalid date field: {0:?}")]
    InvalidDate(String),
    #[error("invalid PLU/barcode field: {0:?}")]
    InvalidPlu(String),
    #[error("invalid weight field {field}: {value:?}")]
    InvalidWeight { field: &'static str, value: String },
}

/// Apply the weight-decoding rule: values under 1000 are deci-kilograms and
/// are scaled by 100 to grams; values >= 1000 are already grams.
///
/// `small_unit_is_grams` is a per-device override: when set, the raw value
/// is treated as already being in grams and is never multiplied.
pub fn decode_weight_grams(raw: i64, small_unit_is_grams: bool) -> i64 {
    if small_unit_is_grams || raw >= 1000 {
        raw
    } else {
        raw * 100
    }
}

/// Parse one trimmed CSV line into a [`WeighingRecord`].
///
/// Field order: PLU-old, time, date, product name, barcode, price code,
/// operator, gross weight, tare weight, net weight, then flags and a
/// trailing company name (ignored). At least 10 fields are required; extra
/// trailing fields are tolerated.
pub fn parse_weighing_line(line: &str) -> Result<WeighingRecord, ParseError> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() < 10 {
        return Err(ParseError::TooFewFields(fields.len()));
    }

    let time_field = fields[1].trim();
    let date_field = fields[2].trim();
    let product_name = fields[3].trim().to_owned();
    let barcode = fields[4].trim().to_owned();
    let price_code = fields[5].trim().to_owned();
    let operator = fields[6].trim().to_owned();
    let gross_raw = fields[7].trim();
    let tare_raw = fields[8].trim();
    let net_raw = fields[9].trim();

    let (hour, minute, second) = parse_time(time_field)?;
    let (day, month, year) = parse_date(date_field)?;
    let plu_code = validate_plu(&barcode)?;

    let gross_weight_grams = parse_weight_field(gross_raw, "gross")?;
    let tare_weight_grams = parse_weight_field(tare_raw, "tare")?;
    let net_weight_grams = parse_weight_field(net_raw, "net")?;

    Ok(WeighingRecord {
        plu_code,
        product_name,
        operator,
        price_code,
        gross_weight_grams,
        tare_weight_grams,
        net_weight_grams,
        scale_timestamp: ScaleTimestamp {
            year,
            month,
            day,
            hour,
            minute,
            second,
        },
        raw_line: line.to_owned(),
    })
}

fn parse_weight_field(raw: &str, field: &'static str) -> Result<i64, ParseError> {
    raw.parse::<i64>()
        .map_err(|_| ParseError::InvalidWeight {
            field,
            value: raw.to_owned(),
        })
}

fn parse_time(s: &str) -> Result<(u8, u8, u8), ParseError> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return Err(ParseError::InvalidTime(s.to_owned()));
    }
    let h = parts[0]
        .parse::<u8>()
        .map_err(|_| ParseError::InvalidTime(s.to_owned()))?;
    let mi = parts[1]
        .parse::<u8>()
        .map_err(|_| ParseError::InvalidTime(s.to_owned()))?;
    let se = parts[2]
        .parse::<u8>()
        .map_err(|_| ParseError::InvalidTime(s.to_owned()))?;
    if h > 23 || mi > 59 || se > 59 {
        return Err(ParseError::InvalidTime(s.to_owned()));
    }
    Ok((h, mi, se))
}

fn parse_date(s: &str) -> Result<(u8, u8, u16), ParseError> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 3 {
        return Err(ParseError::InvalidDate(s.to_owned()));
    }
    let d = parts[0]
        .parse::<u8>()
        .map_err(|_| ParseError::InvalidDate(s.to_owned()))?;
    let m = parts[1]
        .parse::<u8>()
        .map_err(|_| ParseError::InvalidDate(s.to_owned()))?;
    let y = parts[2]
        .parse::<u16>()
        .map_err(|_| ParseError::InvalidDate(s.to_owned()))?;
    if d == 0 || d > 31 || m == 0 || m > 12 {
        return Err(ParseError::InvalidDate(s.to_owned()));
    }
    Ok((d, m, y))
}

fn validate_plu(barcode: &str) -> Result<String, ParseError> {
    if barcode.len() < 5 || barcode.len() > 12 || !barcode.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidPlu(barcode.to_owned()));
    }
    Ok(barcode.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_small_unit_as_deci_kilograms() {
        assert_eq!(decode_weight_grams(13, false), 1300);
        assert_eq!(decode_weight_grams(999, false), 99900);
    }

    #[test]
    fn leaves_large_values_as_grams() {
        assert_eq!(decode_weight_grams(1000, false), 1000);
        assert_eq!(decode_weight_grams(37500, false), 37500);
    }

    #[test]
    fn per_device_override_disables_scaling() {
        assert_eq!(decode_weight_grams(13, true), 13);
    }

    #[test]
    fn parses_large_value_record() {
        let line = "00001,10:30:00,30.01.2026,KIYMA           ,2000001025004,000,MEHMET        ,0000002500,0000000000,0000037500,0,0,0,1,N,TEST COMPANY";
        let rec = parse_weighing_line(line).unwrap();
        assert_eq!(rec.plu_code, "2000001025004");
        assert_eq!(decode_weight_grams(rec.net_weight_grams, false), 37500);
        assert_eq!(decode_weight_grams(rec.tare_weight_grams, false), 0);
        assert_eq!(rec.scale_timestamp.hour, 10);
        assert_eq!(rec.scale_timestamp.year, 2026);
    }

    #[test]
    fn parses_small_unit_record() {
        let line = "00001,06:25:17,30.01.2026,BONFILE         ,000000000004,0000,KAAN                                            ,0000000027,0000000013,0000000014,1,0,1,1,N,K";
        let rec = parse_weighing_line(line).unwrap();
        assert_eq!(decode_weight_grams(rec.net_weight_grams, false), 1400);
        assert_eq!(decode_weight_grams(rec.tare_weight_grams, false), 1300);
    }

    #[test]
    fn rejects_too_few_fields() {
        let err = parse_weighing_line("1,2,3").unwrap_err();
        assert_eq!(err, ParseError::TooFewFields(3));
    }

    #[test]
    fn rejects_bad_time() {
        let line = "1,25:00:00,30.01.2026,A,000000000004,0,OP,1,1,1,0,0,0,0,N,C";
        assert!(matches!(
            parse_weighing_line(line),
            Err(ParseError::InvalidTime(_))
        ));
    }

    #[test]
    fn rejects_bad_date() {
        let line = "1,10:00:00,32.13.2026,A,000000000004,0,OP,1,1,1,0,0,0,0,N,C";
        assert!(matches!(
            parse_weighing_line(line),
            Err(ParseError::InvalidDate(_))
        ));
    }

    #[test]
    fn rejects_non_numeric_barcode() {
        let line = "1,10:00:00,30.01.2026,A,NOTADIGIT,0,OP,1,1,1,0,0,0,0,N,C";
        assert!(matches!(
            parse_weighing_line(line),
            Err(ParseError::InvalidPlu(_))
        ));
    }
}
