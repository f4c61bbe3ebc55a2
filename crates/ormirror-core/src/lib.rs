//! Core record types shared by the mirror, converter and dump tools.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "ormirror-core";

/// Conference prefix used to build invitations and venue labels.
pub const CONFERENCE_GROUP: &str = "EMNLP/2023";

/// One entry of a note's `content` map. The API wraps every value as `{"value": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentField {
    #[serde(default)]
    pub value: JsonValue,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl ContentField {
    pub fn new(value: impl Into<JsonValue>) -> Self {
        Self {
            value: value.into(),
            extra: Map::new(),
        }
    }
}

/// A submission as returned by the remote API.
///
/// Only the fields the tools read are typed; everything else is carried in
/// `extra` so a snapshot written from a fetch reproduces the record as served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub mdate: i64,
    #[serde(default)]
    pub content: BTreeMap<String, ContentField>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

fn null_as_zero<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<i64>::deserialize(deserializer)?.unwrap_or_default())
}

impl Note {
    pub fn new(id: impl Into<String>, mdate: i64) -> Self {
        Self {
            id: id.into(),
            mdate,
            content: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    pub fn with_content(mut self, field: &str, value: impl Into<JsonValue>) -> Self {
        self.content
            .insert(field.to_string(), ContentField::new(value));
        self
    }

    pub fn content_value(&self, field: &str) -> Option<&JsonValue> {
        self.content.get(field).map(|f| &f.value)
    }

    pub fn content_str(&self, field: &str) -> Option<&str> {
        self.content_value(field).and_then(JsonValue::as_str)
    }

    /// String list field; `None` when absent or when any element is not a string.
    pub fn content_str_list(&self, field: &str) -> Option<Vec<&str>> {
        self.content_value(field)?
            .as_array()?
            .iter()
            .map(JsonValue::as_str)
            .collect()
    }

    /// True when the field exists and its value has a non-zero length.
    pub fn has_non_empty(&self, field: &str) -> bool {
        match self.content_value(field) {
            Some(JsonValue::String(s)) => !s.is_empty(),
            Some(JsonValue::Array(a)) => !a.is_empty(),
            Some(JsonValue::Object(o)) => !o.is_empty(),
            Some(JsonValue::Null) | None => false,
            Some(_) => true,
        }
    }
}

/// One entry of a profile's `names` list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProfileName {
    #[serde(default)]
    pub first: Option<String>,
    #[serde(default)]
    pub middle: Option<String>,
    #[serde(default)]
    pub last: Option<String>,
    #[serde(default)]
    pub fullname: Option<String>,
    #[serde(default)]
    pub preferred: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProfileContent {
    #[serde(default)]
    pub names: Vec<ProfileName>,
}

/// Author profile; only the name list is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub content: ProfileContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid channel is specified: {0}")]
    InvalidChannel(String),
    #[error("Invalid volume is specified: {0}")]
    InvalidVolume(String),
}

/// Submission channel under the conference group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Conference,
    ArrCommitment,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Conference, Channel::ArrCommitment];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Conference => "Conference",
            Channel::ArrCommitment => "ARR_Commitment",
        }
    }

    pub fn invitation(&self) -> String {
        format!("{CONFERENCE_GROUP}/{}/-/Submission", self.as_str())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ConfigError::InvalidChannel(s.to_string()))
    }
}

/// Prefixes combined with a volume name to form accepted venue labels.
pub const VENUE_PREFIXES: [&str; 3] = [
    "EMNLP 2023 ",
    "EMNLP 2023 Conditional ",
    "ARR Commitment to EMNLP 2023 ",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Volume {
    Main,
    Findings,
}

impl Volume {
    pub fn as_str(&self) -> &'static str {
        match self {
            Volume::Main => "Main",
            Volume::Findings => "Findings",
        }
    }

    pub fn accepted_venues(&self) -> Vec<String> {
        VENUE_PREFIXES
            .iter()
            .map(|prefix| format!("{prefix}{}", self.as_str()))
            .collect()
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Volume {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Main" => Ok(Volume::Main),
            "Findings" => Ok(Volume::Findings),
            other => Err(ConfigError::InvalidVolume(other.to_string())),
        }
    }
}

/// Structured author name as written to the paper list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuthorName {
    Parts {
        first_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        middle_name: Option<String>,
        last_name: String,
    },
    Full {
        full_name: String,
    },
}

impl AuthorName {
    pub fn full(name: impl Into<String>) -> Self {
        AuthorName::Full {
            full_name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaperType {
    Long,
    Short,
}

impl PaperType {
    pub fn from_submission_type(value: &str) -> Option<Self> {
        match value {
            "Regular Long Paper" => Some(PaperType::Long),
            "Regular Short Paper" => Some(PaperType::Short),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaperAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paper_type: Option<PaperType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_area: Option<String>,
}

/// One paper entry of the generated YAML list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub id: String,
    pub file: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub venue: String,
    pub keywords: Vec<String>,
    pub authors: Vec<AuthorName>,
    pub attributes: PaperAttributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
}

/// Extension of a declared attachment filename: the text after the last dot.
pub fn attachment_extension(filename: &str) -> &str {
    filename.rsplit('.').next().unwrap_or(filename)
}
