//! Feature encodings (preprocessors) of an inference model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Feature name suffix of a frequency encoding.
pub const FREQUENCY_SUFFIX: &str = "frequency";
/// Feature name suffix of a target mean encoding.
pub const TARGET_MEAN_SUFFIX: &str = "targetmean";

/// Name of the model feature derived from `field` with `suffix`.
pub fn derived_feature_name(field: &str, suffix: &str) -> String {
    format!("{field}_{suffix}")
}

/// A preprocessing step turning an input field into model features.
///
/// Serialized externally tagged by its type string; custom processors are
/// written verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Encoding {
    #[serde(rename = "one_hot_encoding")]
    OneHot(OneHotEncoding),
    #[serde(rename = "frequency_encoding")]
    Frequency(FrequencyEncoding),
    #[serde(rename = "target_mean_encoding")]
    TargetMean(TargetMeanEncoding),
    #[serde(untagged)]
    Custom(serde_json::Value),
}

impl Encoding {
    /// Type string the encoding is tagged with.
    pub fn type_name(&self) -> &str {
        match self {
            Encoding::OneHot(_) => "one_hot_encoding",
            Encoding::Frequency(_) => "frequency_encoding",
            Encoding::TargetMean(_) => "target_mean_encoding",
            Encoding::Custom(value) => value
                .as_object()
                .and_then(|object| object.keys().next())
                .map(String::as_str)
                .unwrap_or("custom"),
        }
    }

    /// Input field, `None` for custom processors.
    pub fn field(&self) -> Option<&str> {
        match self {
            Encoding::OneHot(e) => Some(&e.field),
            Encoding::Frequency(e) => Some(&e.field),
            Encoding::TargetMean(e) => Some(&e.field),
            Encoding::Custom(_) => None,
        }
    }

    /// Output feature names produced by this encoding.
    pub fn feature_names(&self) -> Vec<&str> {
        match self {
            Encoding::OneHot(e) => e.hot_map.values().map(String::as_str).collect(),
            Encoding::Frequency(e) => vec![e.feature_name.as_str()],
            Encoding::TargetMean(e) => vec![e.feature_name.as_str()],
            Encoding::Custom(_) => Vec::new(),
        }
    }
}

/// One indicator feature per hot category.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OneHotEncoding {
    pub field: String,
    /// Category to output feature name.
    pub hot_map: BTreeMap<String, String>,
}

impl OneHotEncoding {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            hot_map: BTreeMap::new(),
        }
    }

    /// Add `category`, returning the feature name it maps to.
    pub fn add_category(&mut self, category: &str) -> String {
        let feature_name = derived_feature_name(&self.field, category);
        self.add_category_as(category, feature_name)
    }

    /// Add `category` under an explicit feature name.
    pub fn add_category_as(&mut self, category: &str, feature_name: String) -> String {
        self.hot_map
            .insert(category.to_string(), feature_name.clone());
        feature_name
    }
}

/// Category frequency in the training data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyEncoding {
    pub field: String,
    pub feature_name: String,
    pub frequency_map: BTreeMap<String, f64>,
}

/// Mean target value per category with a fallback for unseen categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMeanEncoding {
    pub field: String,
    pub feature_name: String,
    pub target_map: BTreeMap<String, f64>,
    pub default_value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn one_hot_serializes_with_type_tag() {
        let mut encoding = OneHotEncoding::new("colour");
        assert_eq!(encoding.add_category("red"), "colour_red");
        encoding.add_category("blue");
        let value = serde_json::to_value(Encoding::OneHot(encoding)).unwrap();
        assert_eq!(
            value,
            json!({"one_hot_encoding": {
                "field": "colour",
                "hot_map": {"blue": "colour_blue", "red": "colour_red"}
            }})
        );
    }

    #[test]
    fn target_mean_has_default_value() {
        let encoding = Encoding::TargetMean(TargetMeanEncoding {
            field: "c".into(),
            feature_name: derived_feature_name("c", TARGET_MEAN_SUFFIX),
            target_map: BTreeMap::from([("a".to_string(), 1.5)]),
            default_value: 0.5,
        });
        let value = serde_json::to_value(&encoding).unwrap();
        assert_eq!(value["target_mean_encoding"]["feature_name"], "c_targetmean");
        assert_eq!(value["target_mean_encoding"]["default_value"], 0.5);
        assert_eq!(encoding.type_name(), "target_mean_encoding");
        assert_eq!(encoding.feature_names(), vec!["c_targetmean"]);
    }

    #[test]
    fn custom_processors_are_verbatim() {
        let custom = json!({"special_processor": {"foo": 42}});
        let encoding = Encoding::Custom(custom.clone());
        assert_eq!(serde_json::to_value(&encoding).unwrap(), custom);
        assert_eq!(encoding.type_name(), "special_processor");
        assert_eq!(encoding.field(), None);

        let parsed: Encoding = serde_json::from_value(custom).unwrap();
        assert!(matches!(parsed, Encoding::Custom(_)));
    }

    #[test]
    fn frequency_round_trip() {
        let encoding = Encoding::Frequency(FrequencyEncoding {
            field: "c".into(),
            feature_name: "c_frequency".into(),
            frequency_map: BTreeMap::from([("a".to_string(), 0.25), ("b".to_string(), 0.75)]),
        });
        let text = serde_json::to_string(&encoding).unwrap();
        let parsed: Encoding = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, encoding);
    }
}
