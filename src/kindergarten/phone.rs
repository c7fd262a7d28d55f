/// Formats a Korean phone number with dashes.
///
/// Non-digits are dropped first. Seoul numbers (`02`) use a two-digit area
/// code; every other prefix uses three. Inputs that are not 9 to 11 digits
/// long come back as bare digits.
///
/// ```
/// use kinder_client::kindergarten::phone::format_phone_number;
///
/// assert_eq!(format_phone_number("01012345678"), "010-1234-5678");
/// assert_eq!(format_phone_number("02-123-4567"), "02-123-4567");
/// assert_eq!(format_phone_number("12345"), "12345");
/// ```
pub fn format_phone_number(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let area = if digits.starts_with("02") { 2 } else { 3 };

    let (head, middle) = match (digits.len(), area) {
        (9, 2) => (2, 3),
        (10, 2) => (2, 4),
        (10, 3) => (3, 3),
        (11, 3) => (3, 4),
        _ => return digits,
    };
    format!(
        "{}-{}-{}",
        &digits[..head],
        &digits[head..head + middle],
        &digits[head + middle..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mobile() {
        assert_eq!(format_phone_number("01012345678"), "010-1234-5678");
        assert_eq!(format_phone_number("010 1234 5678"), "010-1234-5678");
    }

    #[test]
    fn test_seoul() {
        assert_eq!(format_phone_number("0212345678"), "02-1234-5678");
        assert_eq!(format_phone_number("021234567"), "02-123-4567");
    }

    #[test]
    fn test_regional() {
        assert_eq!(format_phone_number("0311234567"), "031-123-4567");
        assert_eq!(format_phone_number("(031) 123-4567"), "031-123-4567");
    }

    #[test]
    fn test_unformattable_lengths_keep_digits() {
        assert_eq!(format_phone_number(""), "");
        assert_eq!(format_phone_number("1588-1234"), "15881234");
        assert_eq!(format_phone_number("010123456789"), "010123456789");
        // Nine digits only exist in Seoul.
        assert_eq!(format_phone_number("031123456"), "031123456");
    }
}
