use html_scraper::ElementRef;
use unicode_normalization::UnicodeNormalization;

/// Collect an element's text content with whitespace collapsed.
pub(crate) fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lowercase and strip diacritics, so "Frequência" and "Frequencia"
/// compare equal.
pub(crate) fn fold_text(s: &str) -> String {
    s.nfkd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// Parse a grade cell using the portal's decimal-comma locale.
///
/// Placeholder cells (`-`, `--`, `S/N`, empty) and unparseable text yield
/// `None`; callers decide whether the surrounding record is still emitted.
pub(crate) fn parse_decimal_comma(text: &str) -> Option<f64> {
    let text = text.trim();
    if matches!(text, "" | "-" | "--" | "S/N") {
        return None;
    }
    text.replace(',', ".").parse::<f64>().ok()
}

/// Round to two decimal places, the portal's display precision.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_comma_parses_locale_values() {
        assert_eq!(parse_decimal_comma("7,5"), Some(7.5));
        assert_eq!(parse_decimal_comma(" 10,0 "), Some(10.0));
        assert_eq!(parse_decimal_comma("8.25"), Some(8.25));
    }

    #[test]
    fn decimal_comma_rejects_placeholders() {
        assert_eq!(parse_decimal_comma("-"), None);
        assert_eq!(parse_decimal_comma("--"), None);
        assert_eq!(parse_decimal_comma(""), None);
        assert_eq!(parse_decimal_comma("S/N"), None);
        assert_eq!(parse_decimal_comma("Aprovado"), None);
    }

    #[test]
    fn fold_text_strips_diacritics() {
        assert_eq!(fold_text("Frequência"), "frequencia");
        assert_eq!(fold_text("Matrícula"), "matricula");
        assert_eq!(fold_text("CÁLCULO"), "calculo");
    }

    #[test]
    fn round2_matches_display_precision() {
        assert_eq!(round2(8.004), 8.0);
        assert_eq!(round2((7.2 + 8.8) / 2.0), 8.0);
        assert_eq!(round2(7.2566), 7.26);
    }
}
