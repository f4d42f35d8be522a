//! Versioned extraction instructions for the vision model.
//!
//! Every [`crate::model::RawExtraction`] records the version of the
//! instruction that produced it, so a change to the wording here must come
//! with a bump of [`DEFAULT_PROMPT_VERSION`]. Callers can override the
//! template via [`crate::config::PipelineConfig::prompt`]; the constants here
//! are used only when no override is provided.

use crate::error::TariffError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Version tag of [`DEFAULT_EXTRACTION_PROMPT`].
pub const DEFAULT_PROMPT_VERSION: &str = "tariff-table-v3";

/// Default instruction sent alongside every table crop.
pub const DEFAULT_EXTRACTION_PROMPT: &str = r#"You are reading a cropped table from a shipping line's demurrage & detention tariff.

Extract every tariff row you can see and return them as a JSON array. Each element must be an object with these keys:

- "country":        country the tariff applies to (string)
- "port":           port of discharge / loading (string)
- "line":           shipping line / carrier name (string)
- "equipment_type": container equipment code such as "20GP", "40HC", "20RF" (string)
- "currency":       three-letter currency code such as "USD", "INR", "EUR" (string)
- "free_days":      object mapping each free-time day range label to the number of free days (integer)
- "demurrage":      object mapping each charge day range label to the charge per container per day (number)

Rules:
1. Copy day range labels exactly as printed (for example "1-5", "6-10", "31+").
2. Use null for any value that is not printed in the table. Never guess.
3. If one table row lists charges for several equipment types, emit one object per equipment type.
4. Numbers must be plain JSON numbers without currency symbols or thousands separators.
5. Output ONLY the JSON array. No Markdown fences, no commentary."#;

/// The instruction text together with its version tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub version: String,
    pub text: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            version: DEFAULT_PROMPT_VERSION.to_string(),
            text: DEFAULT_EXTRACTION_PROMPT.to_string(),
        }
    }
}

impl PromptTemplate {
    pub fn new(version: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            text: text.into(),
        }
    }

    /// Load a template from a text file.
    ///
    /// The first line may carry a version header (`# version: name`); without
    /// one the file stem is used as the version.
    pub fn from_file(path: &Path) -> Result<Self, TariffError> {
        let raw = std::fs::read_to_string(path).map_err(|e| TariffError::ConfigFile {
            path: path.to_path_buf(),
            reason: format!("cannot read prompt template: {e}"),
        })?;

        let (version, text) = match raw.split_once('\n') {
            Some((first, rest)) if first.trim_start().starts_with("# version:") => (
                first
                    .trim_start()
                    .trim_start_matches("# version:")
                    .trim()
                    .to_string(),
                rest.trim().to_string(),
            ),
            _ => (
                path.file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "custom".to_string()),
                raw.trim().to_string(),
            ),
        };

        if text.is_empty() || version.is_empty() {
            return Err(TariffError::ConfigFile {
                path: path.to_path_buf(),
                reason: "prompt template is empty".into(),
            });
        }

        Ok(Self { version, text })
    }

    /// Instruction with the source-level hints appended.
    pub fn render(&self, country: &str, line: Option<&str>) -> String {
        let mut out = self.text.clone();
        out.push_str(&format!(
            "\n\nThis document was published for country: {country}."
        ));
        if let Some(line) = line {
            out.push_str(&format!(" Shipping line: {line}."));
        }
        out
    }
}
