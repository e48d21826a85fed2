//! Language-code translation between providers
//!
//! Devices carry a short BCP-47 language (`en`, `he`, ...). Provider
//! vocabularies differ: cloud APIs want full region tags, the free web
//! services still use the pre-1989 ISO code for Hebrew.

/// Full region tag for cloud speech APIs.
pub fn region_tag(lang: &str) -> &'static str {
    match lang {
        "en" => "en-US",
        "he" => "he-IL",
        "ar" => "ar-XA",
        "ru" => "ru-RU",
        "fr" => "fr-FR",
        "es" => "es-ES",
        _ => "en-US",
    }
}

/// Legacy short code for the free web TTS/STT services.
/// Hebrew predates the ISO 639 rename there.
pub fn legacy_code(lang: &str) -> &str {
    match lang {
        "he" => "iw",
        other => other,
    }
}
