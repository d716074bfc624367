//! Value grammars shared by every property table

pub const VALUE_TOO_BIG: &str = "Value too big";
pub const VALUE_CANNOT_BE_DECREASED: &str = "Value cannot be decreased";
pub const VALUE_CANNOT_BE_INCREASED: &str = "Value cannot be increased";
pub const VALUE_EMPTY: &str = "Unexpected empty string";
pub const UNKNOWN_PROPERTY: &str = "Unrecognized property";
pub const READ_ONLY_PROPERTY: &str = "Read-only property";

/// Lowest port an unprivileged process may listen on
const FIRST_UNPRIVILEGED_PORT: i64 = 1024;

/// Decimal integer greater than zero
pub fn parse_positive_int(value: &str) -> Result<i64, String> {
    match value.parse::<i32>() {
        Ok(n) if n > 0 => Ok(i64::from(n)),
        _ => Err(format!("Positive integer expected: \"{value}\"")),
    }
}

/// Decimal integer greater than or equal to zero
pub fn parse_non_negative_int(value: &str) -> Result<i64, String> {
    match value.parse::<i32>() {
        Ok(n) if n >= 0 => Ok(i64::from(n)),
        _ => Err(format!("Non-negative integer expected: \"{value}\"")),
    }
}

/// Unprivileged TCP port
pub fn parse_port(value: &str) -> Result<u16, String> {
    let port = parse_positive_int(value)?;
    if port > i64::from(u16::MAX) {
        return Err(VALUE_TOO_BIG.to_string());
    }
    if port < FIRST_UNPRIVILEGED_PORT {
        return Err("Privileged ports may not be used".to_string());
    }
    u16::try_from(port).map_err(|_| VALUE_TOO_BIG.to_string())
}

/// Bidirectional mapping between logical values and their spelling
#[derive(Debug)]
pub struct Dictionary<T: 'static> {
    entries: &'static [(T, &'static str)],
}

impl<T: Copy + PartialEq> Dictionary<T> {
    pub const fn new(entries: &'static [(T, &'static str)]) -> Self {
        Self { entries }
    }

    pub fn parse(&self, value: &str) -> Result<T, String> {
        self.entries
            .iter()
            .find(|(_, spelling)| *spelling == value)
            .map(|(logical, _)| *logical)
            .ok_or_else(|| {
                let expected: Vec<&str> = self.entries.iter().map(|(_, s)| *s).collect();
                format!(
                    "One of {} expected. Got: \"{value}\"",
                    expected.join("/")
                )
            })
    }

    pub fn show(&self, logical: T) -> &'static str {
        self.entries
            .iter()
            .find(|(l, _)| *l == logical)
            .map_or("", |(_, spelling)| spelling)
    }

    pub fn entries(&self) -> &'static [(T, &'static str)] {
        self.entries
    }
}

pub const BOOLEAN: Dictionary<bool> = Dictionary::new(&[(true, "yes"), (false, "no")]);

/// Parsed `<size>+[,<step>]` free storage reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveSpec {
    pub size_mb: i64,
    /// Growth granularity, equal to `size_mb` unless given
    pub step_mb: i64,
}

/// Parse a free storage reservation
///
/// The trailing `+` is required even though only growth is possible.
pub fn parse_reserve_size(value: &str) -> Result<ReserveSpec, String> {
    let (size, step) = match value.split_once(',') {
        Some((size, step)) => (size, Some(step)),
        None => (value, None),
    };

    let Some(size) = size.strip_suffix('+') else {
        return Err(VALUE_CANNOT_BE_DECREASED.to_string());
    };
    let size_mb = parse_positive_int(size)?;

    let step_mb = match step {
        Some(step) => {
            let step_mb = parse_positive_int(step)?;
            if step_mb < size_mb {
                return Err("<step> cannot be smaller than <size>".to_string());
            }
            step_mb
        }
        None => size_mb,
    };

    Ok(ReserveSpec { size_mb, step_mb })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_int() {
        assert_eq!(parse_positive_int("8"), Ok(8));
        assert_eq!(
            parse_positive_int("0"),
            Err("Positive integer expected: \"0\"".to_string())
        );
        assert!(parse_positive_int("-3").is_err());
        assert!(parse_positive_int("4k").is_err());
        assert!(parse_positive_int("").is_err());
    }

    #[test]
    fn test_non_negative_int() {
        assert_eq!(parse_non_negative_int("0"), Ok(0));
        assert_eq!(
            parse_non_negative_int("-1"),
            Err("Non-negative integer expected: \"-1\"".to_string())
        );
    }

    #[test]
    fn test_port() {
        assert_eq!(parse_port("2222"), Ok(2222));
        assert_eq!(parse_port("1024"), Ok(1024));
        assert_eq!(parse_port("65535"), Ok(65535));
        assert_eq!(
            parse_port("80"),
            Err("Privileged ports may not be used".to_string())
        );
        assert_eq!(parse_port("65536"), Err(VALUE_TOO_BIG.to_string()));
        assert!(parse_port("0").unwrap_err().starts_with("Positive integer expected"));
    }

    fn assert_round_trip<T: Copy + PartialEq + std::fmt::Debug>(dictionary: &Dictionary<T>) {
        for &(logical, spelling) in dictionary.entries() {
            assert_eq!(dictionary.show(logical), spelling);
            assert_eq!(dictionary.parse(dictionary.show(logical)), Ok(logical));
        }
    }

    #[test]
    fn test_dictionary_round_trip() {
        assert_round_trip(&BOOLEAN);
        assert_round_trip(&crate::emulator::ORIENTATIONS);
        assert_round_trip(&crate::engine::PROXY_TYPES);
    }

    #[test]
    fn test_dictionary_rejects_unknown() {
        assert_eq!(
            BOOLEAN.parse("true"),
            Err("One of yes/no expected. Got: \"true\"".to_string())
        );
    }

    #[test]
    fn test_reserve_size() {
        assert_eq!(
            parse_reserve_size("4000+"),
            Ok(ReserveSpec {
                size_mb: 4000,
                step_mb: 4000
            })
        );
        assert_eq!(
            parse_reserve_size("4000+,8000"),
            Ok(ReserveSpec {
                size_mb: 4000,
                step_mb: 8000
            })
        );
        assert_eq!(
            parse_reserve_size("4000+,1000"),
            Err("<step> cannot be smaller than <size>".to_string())
        );
        assert!(parse_reserve_size("0+").is_err());
    }

    #[test]
    fn test_reserve_size_requires_plus() {
        for value in ["4000", "1", "999999", "4000,8000", "+4000", "abc"] {
            assert_eq!(
                parse_reserve_size(value),
                Err(VALUE_CANNOT_BE_DECREASED.to_string()),
                "{value}"
            );
        }
    }
}
