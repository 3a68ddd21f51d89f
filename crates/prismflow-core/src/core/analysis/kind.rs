//! Analysis Kinds
//!
//! The fixed roster of analysis kinds, the output contract each kind must
//! satisfy, and how each kind contributes to the merged summary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Named result fields returned by an analyzer
pub type AnalyzerOutput = serde_json::Map<String, Value>;

/// Kind of analysis performed on an image
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnalysisKind {
    /// Colour histogram and grayscale detection
    Color,
    /// Object detection
    Objects,
    /// Text detection (OCR)
    Text,
    /// Dimensions, format and size
    Metadata,
}

impl AnalysisKind {
    /// Every kind, in dispatch order. Each orchestration gets one task per entry.
    pub const ALL: [AnalysisKind; 4] = [
        AnalysisKind::Color,
        AnalysisKind::Objects,
        AnalysisKind::Text,
        AnalysisKind::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::Color => "color",
            AnalysisKind::Objects => "objects",
            AnalysisKind::Text => "text",
            AnalysisKind::Metadata => "metadata",
        }
    }

    /// Key under which the full output is stored in `analyses`
    pub fn analyses_key(&self) -> &'static str {
        match self {
            AnalysisKind::Color => "colors",
            AnalysisKind::Objects => "objects",
            AnalysisKind::Text => "text",
            AnalysisKind::Metadata => "metadata",
        }
    }

    /// Summary fields this kind contributes
    pub fn summary_fields(&self) -> &'static [&'static str] {
        match self {
            AnalysisKind::Color => &["dominantColor", "isGrayscale"],
            AnalysisKind::Objects => &["objectsDetected"],
            AnalysisKind::Text => &["hasText"],
            AnalysisKind::Metadata => &["imageSize", "format"],
        }
    }

    /// Checks that an analyzer output has the shape this kind requires
    pub fn validate_output(&self, output: &AnalyzerOutput) -> Result<(), String> {
        match self {
            AnalysisKind::Color => {
                let colors = output
                    .get("dominantColors")
                    .and_then(Value::as_array)
                    .ok_or("missing array field 'dominantColors'")?;
                if colors
                    .iter()
                    .any(|c| c.get("hex").and_then(Value::as_str).is_none())
                {
                    return Err("every entry of 'dominantColors' needs a 'hex' string".into());
                }
                require(output, "isGrayscale", Value::is_boolean, "boolean")
            }
            AnalysisKind::Objects => {
                require(output, "objects", Value::is_array, "array")?;
                require(output, "objectCount", Value::is_u64, "unsigned integer")
            }
            AnalysisKind::Text => require(output, "hasText", Value::is_boolean, "boolean"),
            AnalysisKind::Metadata => {
                require(output, "width", Value::is_u64, "unsigned integer")?;
                require(output, "height", Value::is_u64, "unsigned integer")?;
                require(output, "format", Value::is_string, "string")
            }
        }
    }

    /// Summary values for this kind.
    ///
    /// `None` (failed analyzer) yields explicit nulls for every field.
    pub fn summary_values(&self, output: Option<&AnalyzerOutput>) -> Vec<(&'static str, Value)> {
        let Some(output) = output else {
            return self
                .summary_fields()
                .iter()
                .map(|field| (*field, Value::Null))
                .collect();
        };

        match self {
            AnalysisKind::Color => {
                let dominant = output
                    .get("dominantColors")
                    .and_then(Value::as_array)
                    .and_then(|colors| colors.first())
                    .and_then(|c| c.get("hex"))
                    .cloned()
                    .unwrap_or_else(|| Value::String("N/A".to_string()));
                vec![
                    ("dominantColor", dominant),
                    ("isGrayscale", field_or_null(output, "isGrayscale")),
                ]
            }
            AnalysisKind::Objects => {
                vec![("objectsDetected", field_or_null(output, "objectCount"))]
            }
            AnalysisKind::Text => vec![("hasText", field_or_null(output, "hasText"))],
            AnalysisKind::Metadata => {
                let width = output.get("width").and_then(Value::as_u64).unwrap_or(0);
                let height = output.get("height").and_then(Value::as_u64).unwrap_or(0);
                vec![
                    ("imageSize", Value::String(format!("{}x{}", width, height))),
                    ("format", field_or_null(output, "format")),
                ]
            }
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn require(
    output: &AnalyzerOutput,
    field: &str,
    check: fn(&Value) -> bool,
    expected: &str,
) -> Result<(), String> {
    match output.get(field) {
        Some(value) if check(value) => Ok(()),
        Some(_) => Err(format!("field '{}' must be a {}", field, expected)),
        None => Err(format!("missing field '{}'", field)),
    }
}

fn field_or_null(output: &AnalyzerOutput, field: &str) -> Value {
    output.get(field).cloned().unwrap_or(Value::Null)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output(value: Value) -> AnalyzerOutput {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_kind_serialization() {
        assert_eq!(serde_json::to_string(&AnalysisKind::Metadata).unwrap(), "\"metadata\"");
        let kind: AnalysisKind = serde_json::from_str("\"objects\"").unwrap();
        assert_eq!(kind, AnalysisKind::Objects);
    }

    #[test]
    fn test_every_summary_field_owned_once() {
        let mut fields: Vec<&str> = AnalysisKind::ALL
            .iter()
            .flat_map(|k| k.summary_fields().iter().copied())
            .collect();
        let total = fields.len();
        fields.sort();
        fields.dedup();
        assert_eq!(fields.len(), total);
        assert_eq!(total, 6);
    }

    #[test]
    fn test_validate_metadata() {
        let good = output(json!({"width": 770, "height": 400, "format": "JPEG"}));
        assert!(AnalysisKind::Metadata.validate_output(&good).is_ok());

        let bad = output(json!({"width": "770", "height": 400, "format": "JPEG"}));
        let err = AnalysisKind::Metadata.validate_output(&bad).unwrap_err();
        assert!(err.contains("width"));

        let missing = output(json!({"width": 770}));
        assert!(AnalysisKind::Metadata.validate_output(&missing).is_err());
    }

    #[test]
    fn test_validate_color() {
        let good = output(json!({"dominantColors": [{"hex": "#000000"}], "isGrayscale": false}));
        assert!(AnalysisKind::Color.validate_output(&good).is_ok());

        let bad = output(json!({"dominantColors": [{"rgb": 1}], "isGrayscale": false}));
        assert!(AnalysisKind::Color.validate_output(&bad).is_err());
    }

    #[test]
    fn test_summary_values_for_failed_kind_are_null() {
        let values = AnalysisKind::Color.summary_values(None);
        assert_eq!(
            values,
            vec![("dominantColor", Value::Null), ("isGrayscale", Value::Null)]
        );
    }

    #[test]
    fn test_summary_values_metadata() {
        let out = output(json!({"width": 770, "height": 400, "format": "JPEG"}));
        let values = AnalysisKind::Metadata.summary_values(Some(&out));
        assert_eq!(values[0], ("imageSize", json!("770x400")));
        assert_eq!(values[1], ("format", json!("JPEG")));
    }

    #[test]
    fn test_summary_values_color_without_colors() {
        let out = output(json!({"dominantColors": [], "isGrayscale": true}));
        let values = AnalysisKind::Color.summary_values(Some(&out));
        assert_eq!(values[0], ("dominantColor", json!("N/A")));
        assert_eq!(values[1], ("isGrayscale", json!(true)));
    }
}
