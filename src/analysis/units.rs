/// Result of interpreting a human-entered size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeValue {
    Bytes(u128),
    /// Input that is neither numeric nor `<digits><unit>`; handed back untouched
    Unparsed(String),
}

impl SizeValue {
    /// Byte count saturated to the range of a `bigint` column.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SizeValue::Bytes(bytes) => Some(i64::try_from(*bytes).unwrap_or(i64::MAX)),
            SizeValue::Unparsed(_) => None,
        }
    }
}

const UNIT_LETTERS: [char; 8] = ['b', 'k', 'm', 'g', 't', 'p', 'e', 'z'];

/// Converts values such as `"1000"`, `"10MB"` or `"1gb"` to bytes.
///
/// Only the first letter of the unit matters and multipliers are powers of
/// 1024. An unknown unit letter leaves the number unscaled. Anything that does
/// not start with digits is returned as [`SizeValue::Unparsed`].
pub fn convert_to_bytes(value: &str) -> SizeValue {
    let digits_end = value
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(idx, _)| idx)
        .unwrap_or(value.len());

    if digits_end == 0 {
        return SizeValue::Unparsed(value.to_string());
    }

    let number: u128 = match value[..digits_end].parse() {
        Ok(number) => number,
        Err(_) => return SizeValue::Unparsed(value.to_string()),
    };

    let exponent = match value[digits_end..].chars().next() {
        Some(c) if c.is_ascii_alphabetic() => {
            let c = c.to_ascii_lowercase();
            UNIT_LETTERS.iter().position(|u| *u == c).unwrap_or(0) as u32
        }
        // trailing garbage after the number (e.g. a space) is ignored
        _ => 0,
    };

    SizeValue::Bytes(number.saturating_mul(1024u128.pow(exponent)))
}

/// Human readable size using the same thresholds as `pg_size_pretty`.
pub fn pretty_size(bytes: i64) -> String {
    const LIMIT: i64 = 10 * 1024;
    const LIMIT2: i64 = LIMIT * 2 - 1;

    let mut size = bytes;
    if size.abs() < LIMIT {
        return format!("{size} bytes");
    }

    // keep one extra bit for rounding
    size >>= 9;
    for unit in ["kB", "MB", "GB"] {
        if size.abs() < LIMIT2 {
            return format!("{} {unit}", (size + 1) / 2);
        }
        size >>= 10;
    }
    format!("{} TB", (size + 1) / 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1", 1)]
    #[case("1000", 1000)]
    #[case("1000000000000", 1_000_000_000_000)]
    #[case("1kb", 1024)]
    #[case("1Kb", 1024)]
    #[case("1KB", 1024)]
    #[case("1MB", 1_048_576)]
    #[case("1GB", 1_073_741_824)]
    #[case("1TB", 1_099_511_627_776)]
    #[case("1PB", 1_125_899_906_842_624)]
    #[case("1EB", 1_152_921_504_606_846_976)]
    #[case("1ZB", 1_180_591_620_717_411_303_424)]
    #[case("5b", 5)]
    #[case("7xb", 7)]
    #[case("1 KB", 1)]
    fn converts_sizes(#[case] input: &str, #[case] expected: u128) {
        assert_eq!(convert_to_bytes(input), SizeValue::Bytes(expected));
    }

    #[rstest]
    #[case("q")]
    #[case("-1")]
    #[case("")]
    #[case("MB")]
    fn leaves_garbage_untouched(#[case] input: &str) {
        assert_eq!(convert_to_bytes(input), SizeValue::Unparsed(input.to_string()));
    }

    #[test]
    fn huge_values_saturate_for_bigint_columns() {
        assert_eq!(convert_to_bytes("1ZB").as_i64(), Some(i64::MAX));
        assert_eq!(convert_to_bytes("2k").as_i64(), Some(2048));
        assert_eq!(convert_to_bytes("abc").as_i64(), None);
    }

    #[rstest]
    #[case(0, "0 bytes")]
    #[case(8192, "8192 bytes")]
    #[case(10240, "10 kB")]
    #[case(81920, "80 kB")]
    #[case(10 * 1024 * 1024, "10 MB")]
    #[case(50 * 1024 * 1024 * 1024, "50 GB")]
    #[case(30 * 1024 * 1024 * 1024 * 1024, "30 TB")]
    fn pretty_sizes_match_server_formatting(#[case] bytes: i64, #[case] expected: &str) {
        assert_eq!(pretty_size(bytes), expected);
    }
}
