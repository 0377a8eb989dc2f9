//! Filesystem-safe directory names for model ids.

use regex::Regex;
use std::sync::LazyLock;

/// Maximum length for a model directory name.
const MAX_NAME_LENGTH: usize = 128;

/// Reserved device names on Windows.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Anything outside `[a-z0-9._-]` after lowercasing.
static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9._\-]+").expect("static regex"));

/// Runs of three or more separators collapse to the `--` path separator.
static SEPARATOR_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-{3,}").expect("static regex"));

/// Map a model id or location to a single path component.
///
/// `/` and `\` become `--` so `org/name` and `org-name` stay distinct. Other
/// unsafe characters become `_`. Leading dots are stripped so the result is
/// never hidden and never `.` or `..`.
///
/// # Examples
///
/// ```
/// use modelfetch_core::model_library::safe_directory_name;
///
/// assert_eq!(
///     safe_directory_name("mlx-community/Qwen3-1.7B-4bit"),
///     "mlx-community--qwen3-1.7b-4bit"
/// );
/// assert_eq!(safe_directory_name("../../etc"), "etc");
/// ```
pub fn safe_directory_name(id: &str) -> String {
    let lowered = id.trim().to_lowercase().replace(['/', '\\'], "--");
    let mut result = UNSAFE_CHARS.replace_all(&lowered, "_").into_owned();
    result = SEPARATOR_RUNS.replace_all(&result, "--").into_owned();
    result = result
        .trim_start_matches(|c| c == '.' || c == '-' || c == '_')
        .trim_end_matches(|c| c == '.' || c == '-' || c == '_' || c == ' ')
        .to_string();

    if result.len() > MAX_NAME_LENGTH {
        // Only ASCII remains at this point, so byte slicing is char-safe.
        result.truncate(MAX_NAME_LENGTH);
        result = result
            .trim_end_matches(|c| c == '.' || c == '-' || c == '_')
            .to_string();
    }

    let stem = result.split('.').next().unwrap_or("").to_uppercase();
    if RESERVED_NAMES.contains(&stem.as_str()) {
        result = format!("{}_model", result);
    }

    if result.is_empty() {
        result = "unnamed_model".to_string();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_separator() {
        assert_eq!(safe_directory_name("org/name"), "org--name");
        assert_ne!(safe_directory_name("org/name"), safe_directory_name("org-name"));
    }

    #[test]
    fn test_unsafe_characters_replaced() {
        assert_eq!(safe_directory_name("My Model: v2?"), "my_model_v2");
        assert_eq!(safe_directory_name("a<b>c"), "a_b_c");
    }

    #[test]
    fn test_no_traversal_or_hidden_names() {
        assert_eq!(safe_directory_name(".."), "unnamed_model");
        assert_eq!(safe_directory_name(".hidden"), "hidden");
        assert!(!safe_directory_name("../../x").contains(".."));
    }

    #[test]
    fn test_local_paths() {
        assert_eq!(
            safe_directory_name("/Users/me/Models/llama.gguf"),
            "users--me--models--llama.gguf"
        );
    }

    #[test]
    fn test_reserved_names() {
        assert_eq!(safe_directory_name("CON"), "con_model");
        assert_eq!(safe_directory_name("nul.txt"), "nul.txt_model");
    }

    #[test]
    fn test_truncation() {
        let long = "a".repeat(300);
        assert_eq!(safe_directory_name(&long).len(), MAX_NAME_LENGTH);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(safe_directory_name(""), "unnamed_model");
        assert_eq!(safe_directory_name("///"), "unnamed_model");
    }
}
