//! Phone number normalization and validation

use once_cell::sync::Lazy;
use regex::Regex;

/// International (`+33612345678`) or national (`0612345678`) digits only
static NUMBER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9]{3,15}$").expect("Invalid phone number regex"));

/// Strip formatting characters, keeping a leading `+`
pub fn normalize_phone(phone: &str) -> String {
    let trimmed = phone.trim();
    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

    if has_plus {
        format!("+{}", digits)
    } else {
        digits
    }
}

/// Check that a number is already in normalized form
pub fn is_valid_number(number: &str) -> bool {
    NUMBER_PATTERN.is_match(number)
}
