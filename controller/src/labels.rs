//! Label keys shared between pod materialization, the Reaper's sweep, and the
//! metrics surface's label sanitization.

pub const LABEL_CONTROLLER: &str = "healthcheck.example.com/controller";
pub const LABEL_CHECK: &str = "healthcheck.example.com/check";
pub const LABEL_NAMESPACE: &str = "healthcheck.example.com/check-namespace";
pub const LABEL_UUID: &str = "healthcheck.example.com/uuid";

pub const ANNOTATION_CHECK_NAME: &str = "kuberhealthy.github.io/check-name";

/// Sanitizes a label or metric-label value: quotes become apostrophes,
/// newlines become spaces, and the result is truncated to `max_length`.
pub fn sanitize_label_value(value: &str, max_length: usize) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| match c {
            '"' => '\'',
            '\n' | '\r' => ' ',
            other => other,
        })
        .collect();
    if cleaned.chars().count() > max_length {
        cleaned.chars().take(max_length).collect()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_quotes_and_newlines() {
        assert_eq!(
            sanitize_label_value("say \"hi\"\nthere", 100),
            "say 'hi' there"
        );
    }

    #[test]
    fn truncates_to_max_length() {
        assert_eq!(sanitize_label_value("abcdef", 3), "abc");
    }

    #[test]
    fn leaves_short_values_untouched() {
        assert_eq!(sanitize_label_value("fine", 100), "fine");
    }
}
