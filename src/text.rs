use std::sync::LazyLock;

use regex::Regex;

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"</?[^>]+>").expect("tag pattern"));

/// Removes markup tags, decodes the common entities and collapses whitespace.
pub fn strip_markup(value: &str) -> String {
    let without_tags = TAG.replace_all(value, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}
