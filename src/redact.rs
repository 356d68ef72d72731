//! Secret redaction for logs and Debug impls.

const SECRET_KEYS: &[&str] = &["apikey", "apisecret", "secretkey", "password", "token"];

pub fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SECRET_KEYS.iter().any(|k| lower == *k)
}

/// Redacts a single value if the key is sensitive, otherwise passes it through.
pub fn redact_field(key: &str, value: &str) -> String {
    if is_secret_key(key) {
        "[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}

/// Masks a credential for display: keeps first/last 2 chars, blanks the rest.
pub fn mask_credential(value: &str) -> String {
    let len = value.chars().count();
    if len <= 4 {
        return "[REDACTED]".to_string();
    }
    let chars: Vec<char> = value.chars().collect();
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[len - 2..].iter().collect();
    format!("{head}***{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_known_keys_case_insensitively() {
        assert_eq!(redact_field("ApiSecret", "xyz"), "[REDACTED]");
        assert_eq!(redact_field("symbol", "BTCUSDT"), "BTCUSDT");
    }

    #[test]
    fn masks_credential_middle() {
        assert_eq!(mask_credential("abcdefgh"), "ab***gh");
        assert_eq!(mask_credential("ab"), "[REDACTED]");
    }
}
