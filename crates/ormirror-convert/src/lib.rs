//! Snapshot-to-YAML conversion: text escaping, character maps and author names.

use std::path::Path;

use anyhow::{Context, Result};
use ormirror_core::{
    attachment_extension, AuthorName, Note, OutputRecord, PaperAttributes, PaperType, ProfileName,
};
use ormirror_storage::ProfileLookup;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "ormirror-convert";

pub const DEFAULT_FILE_PREFIX: &str = "EMNLP2023";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CharMapError {
    #[error("line {line}: {message}")]
    BadEscape { line: usize, message: String },
}

/// Ordered substring substitutions applied after the built-in escapes.
///
/// Entries keep the order in which their key first appeared; a repeated key
/// replaces the earlier replacement in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharMap {
    entries: Vec<(String, String)>,
}

impl CharMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: impl Into<String>, to: impl Into<String>) {
        let from = from.into();
        let to = to.into();
        match self.entries.iter_mut().find(|(k, _)| *k == from) {
            Some(entry) => entry.1 = to,
            None => self.entries.push((from, to)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parse `<escaped key>\t<replacement>` lines. Lines with fewer than two
    /// fields are ignored, as are lines whose key decodes to nothing.
    pub fn from_tsv(text: &str) -> Result<Self, CharMapError> {
        let mut map = Self::new();
        for (index, line) in text.lines().enumerate() {
            let mut fields = line.trim_end().split('\t');
            let (Some(raw_key), Some(replacement)) = (fields.next(), fields.next()) else {
                continue;
            };
            let key = decode_escaped_key(raw_key).map_err(|message| CharMapError::BadEscape {
                line: index + 1,
                message,
            })?;
            if key.is_empty() {
                warn!(line = index + 1, "skipping mapping with empty key");
                continue;
            }
            map.insert(key, replacement);
        }
        Ok(map)
    }

    /// Load a mapping file. Bytes that are not valid UTF-8 are read as Latin-1.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => err.into_bytes().iter().map(|&b| char::from(b)).collect(),
        };
        let map = Self::from_tsv(&text).with_context(|| format!("parsing {}", path.display()))?;
        info!(path = %path.display(), entries = map.len(), "loaded character map");
        for (from, to) in map.iter() {
            debug!(from, to, "mapping");
        }
        Ok(map)
    }
}

/// Decode backslash escapes (`\n`, `\xHH`, `\uXXXX`, `\UXXXXXXXX`, octal, ...)
/// in a mapping key. Unknown escapes are kept verbatim.
pub fn decode_escaped_key(raw: &str) -> Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(esc) = chars.next() else {
            return Err("\\ at end of string".to_string());
        };
        match esc {
            '\n' => {}
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'a' => out.push('\u{07}'),
            'b' => out.push('\u{08}'),
            'f' => out.push('\u{0c}'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\u{0b}'),
            '0'..='7' => {
                let mut value = esc.to_digit(8).unwrap_or_default();
                for _ in 0..2 {
                    match chars.peek().and_then(|d| d.to_digit(8)) {
                        Some(digit) => {
                            value = value * 8 + digit;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(value).ok_or_else(|| format!("invalid octal escape {value:o}"))?);
            }
            'x' => out.push(hex_escape(&mut chars, 2, 'x')?),
            'u' => out.push(hex_escape(&mut chars, 4, 'u')?),
            'U' => out.push(hex_escape(&mut chars, 8, 'U')?),
            'N' => return Err("named \\N{...} escapes are not supported".to_string()),
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

fn hex_escape(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    digits: usize,
    marker: char,
) -> Result<char, String> {
    let mut value = 0u32;
    for _ in 0..digits {
        let digit = chars
            .next()
            .and_then(|d| d.to_digit(16))
            .ok_or_else(|| format!("truncated \\{marker} escape"))?;
        value = value * 16 + digit;
    }
    char::from_u32(value).ok_or_else(|| format!("\\{marker} escape {value:#x} is not a character"))
}

/// Make free text safe for the LaTeX consumer of the paper list.
///
/// The built-in rules run first (tabs, line breaks, `&`, `%`), then every
/// character-map entry in file order. Map entries may reintroduce characters
/// the built-ins escaped.
pub fn escape_text(input: &str, charmap: &CharMap) -> String {
    let mut text = input.replace('\t', " ");
    text = text.replace("-\n", "-").replace('\n', " ");
    text = text.replace('&', "\\&").replace("\\\\&", "\\&");
    text = text.replace('%', "\\%").replace("\\\\%", "\\%");
    for (from, to) in charmap.iter() {
        text = text.replace(from, to);
    }
    text
}

/// Split a submitted author string on whitespace: two tokens are first/last,
/// three are first/middle/last, anything else stays a full name.
pub fn parse_author_name(raw: &str, charmap: &CharMap) -> AuthorName {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    match tokens.as_slice() {
        [first, last] => AuthorName::Parts {
            first_name: escape_text(first, charmap),
            middle_name: None,
            last_name: escape_text(last, charmap),
        },
        [first, middle, last] => AuthorName::Parts {
            first_name: escape_text(first, charmap),
            middle_name: Some(escape_text(middle, charmap)),
            last_name: escape_text(last, charmap),
        },
        _ => AuthorName::full(escape_text(raw, charmap)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileNameError {
    #[error("profile lists no names")]
    NoNames,
    #[error("profile name has a first name but no last name")]
    MissingLastName,
    #[error("profile name has neither name parts nor a full name")]
    MissingFullName,
}

/// The single listed name, or the first flagged `preferred`, or the first one.
pub fn preferred_name(names: &[ProfileName]) -> Option<&ProfileName> {
    match names {
        [] => None,
        [only] => Some(only),
        [first, ..] => Some(
            names
                .iter()
                .find(|n| n.preferred == Some(true))
                .unwrap_or(first),
        ),
    }
}

pub fn structured_profile_name(
    name: &ProfileName,
    charmap: &CharMap,
) -> Result<AuthorName, ProfileNameError> {
    if let Some(first) = &name.first {
        let last = name.last.as_deref().ok_or(ProfileNameError::MissingLastName)?;
        let middle_name = name
            .middle
            .as_deref()
            .filter(|m| !m.is_empty())
            .map(|m| escape_text(m, charmap));
        return Ok(AuthorName::Parts {
            first_name: escape_text(first, charmap),
            middle_name,
            last_name: escape_text(last, charmap),
        });
    }
    let full = name.fullname.as_deref().ok_or(ProfileNameError::MissingFullName)?;
    Ok(AuthorName::full(escape_text(full, charmap)))
}

/// Outcome of a profile-based author lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorResolution {
    Resolved(AuthorName),
    Fallback { name: AuthorName, reason: String },
}

impl AuthorResolution {
    pub fn into_name(self) -> AuthorName {
        match self {
            AuthorResolution::Resolved(name) | AuthorResolution::Fallback { name, .. } => name,
        }
    }
}

/// Resolve one author through their profile. Any failure degrades to the
/// submitted display name (or the author id when none was submitted).
pub async fn resolve_author(
    lookup: &dyn ProfileLookup,
    author_id: &str,
    submitted_name: Option<&str>,
    charmap: &CharMap,
) -> AuthorResolution {
    let resolved = match lookup.profile(author_id).await {
        Ok(profile) => preferred_name(&profile.content.names)
            .ok_or(ProfileNameError::NoNames)
            .and_then(|name| structured_profile_name(name, charmap))
            .map_err(|err| err.to_string()),
        Err(err) => Err(err.to_string()),
    };
    match resolved {
        Ok(name) => AuthorResolution::Resolved(name),
        Err(reason) => AuthorResolution::Fallback {
            name: AuthorName::full(escape_text(submitted_name.unwrap_or(author_id), charmap)),
            reason,
        },
    }
}

/// How author names are produced for each record.
#[derive(Clone, Copy)]
pub enum AuthorSource<'a> {
    Profiles(&'a dyn ProfileLookup),
    Heuristic,
}

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub file_prefix: String,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    #[error("note {id} has no usable `{field}` field")]
    MissingField { id: String, field: &'static str },
}

fn required_str<'n>(note: &'n Note, field: &'static str) -> Result<&'n str, ConvertError> {
    note.content_str(field).ok_or_else(|| ConvertError::MissingField {
        id: note.id.clone(),
        field,
    })
}

fn required_list<'n>(note: &'n Note, field: &'static str) -> Result<Vec<&'n str>, ConvertError> {
    note.content_str_list(field)
        .ok_or_else(|| ConvertError::MissingField {
            id: note.id.clone(),
            field,
        })
}

pub fn filter_by_venue<'n>(notes: &'n [Note], accepted_venues: &[String]) -> Vec<&'n Note> {
    notes
        .iter()
        .filter(|note| {
            note.content_str("venue")
                .is_some_and(|venue| accepted_venues.iter().any(|v| v == venue))
        })
        .collect()
}

pub async fn convert_note(
    note: &Note,
    authors: AuthorSource<'_>,
    charmap: &CharMap,
    options: &ConvertOptions,
) -> Result<OutputRecord, ConvertError> {
    let title = escape_text(required_str(note, "title")?, charmap);
    let abstract_text = escape_text(required_str(note, "abstract")?, charmap);
    let venue = escape_text(required_str(note, "venue")?, charmap);
    let keywords = required_list(note, "keywords")?
        .into_iter()
        .map(|kw| escape_text(kw, charmap))
        .collect();

    let author_names = match authors {
        AuthorSource::Profiles(lookup) => {
            let author_ids = required_list(note, "authorids")?;
            let submitted = required_list(note, "authors")?;
            let mut names = Vec::with_capacity(author_ids.len());
            for (index, author_id) in author_ids.iter().enumerate() {
                let submitted_name = submitted.get(index).copied();
                match resolve_author(lookup, author_id, submitted_name, charmap).await {
                    AuthorResolution::Resolved(name) => {
                        debug!(note_id = %note.id, author_id, ?name, "resolved profile name");
                        names.push(name);
                    }
                    AuthorResolution::Fallback { name, reason } => {
                        info!(note_id = %note.id, author_id, %reason, "no profile; using submitted name");
                        names.push(name);
                    }
                }
            }
            names
        }
        AuthorSource::Heuristic => required_list(note, "authors")?
            .into_iter()
            .map(|raw| parse_author_name(raw, charmap))
            .collect(),
    };

    let attributes = PaperAttributes {
        paper_type: note
            .content_str("Submission_Type")
            .and_then(PaperType::from_submission_type),
        submitted_area: note.content_str("Submission_Track").map(ToString::to_string),
    };

    let attachment = note
        .has_non_empty("supplementary_materials")
        .then(|| note.content_str("supplementary_materials"))
        .flatten()
        .map(|declared| {
            format!(
                "{}/{}.attachment.{}",
                options.file_prefix,
                note.id,
                attachment_extension(declared)
            )
        });

    Ok(OutputRecord {
        id: note.id.clone(),
        file: format!("{}/{}.pdf", options.file_prefix, note.id),
        title,
        abstract_text,
        venue,
        keywords,
        authors: author_names,
        attributes,
        attachment,
    })
}

#[derive(Debug, Default)]
pub struct Conversion {
    pub records: Vec<OutputRecord>,
    pub failures: Vec<ConvertError>,
}

/// Convert every note whose venue is accepted. A note that cannot be converted
/// is reported and skipped.
pub async fn convert_notes(
    notes: &[Note],
    accepted_venues: &[String],
    authors: AuthorSource<'_>,
    charmap: &CharMap,
    options: &ConvertOptions,
) -> Conversion {
    info!(?accepted_venues, "filtering notes by venue");
    let mut conversion = Conversion::default();
    for note in filter_by_venue(notes, accepted_venues) {
        match convert_note(note, authors, charmap, options).await {
            Ok(record) => conversion.records.push(record),
            Err(err) => {
                warn!(note_id = %note.id, error = %err, "skipping note");
                conversion.failures.push(err);
            }
        }
    }
    conversion
}

pub fn to_yaml_string(records: &[OutputRecord]) -> Result<String> {
    serde_yaml::to_string(records).context("serializing paper list")
}

pub fn write_yaml(path: impl AsRef<Path>, records: &[OutputRecord]) -> Result<()> {
    let path = path.as_ref();
    info!(records = records.len(), path = %path.display(), "saving paper list");
    std::fs::write(path, to_yaml_string(records)?)
        .with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ormirror_core::{Profile, ProfileContent, Volume};
    use ormirror_storage::FetchError;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn sample_notes() -> Vec<Note> {
        let path = workspace_root().join("fixtures/notes/sample.json");
        let text = std::fs::read_to_string(path).expect("read sample notes");
        let mut value: serde_json::Value = serde_json::from_str(&text).expect("parse sample notes");
        serde_json::from_value(value["notes"].take()).expect("sample notes array")
    }

    fn name(first: &str, middle: Option<&str>, last: &str, preferred: Option<bool>) -> ProfileName {
        ProfileName {
            first: Some(first.into()),
            middle: middle.map(Into::into),
            last: Some(last.into()),
            fullname: Some(format!("{first} {last}")),
            preferred,
        }
    }

    #[derive(Default)]
    struct StubProfiles {
        profiles: HashMap<String, Profile>,
    }

    impl StubProfiles {
        fn with(mut self, id: &str, names: Vec<ProfileName>) -> Self {
            self.profiles.insert(
                id.to_string(),
                Profile {
                    id: id.to_string(),
                    content: ProfileContent { names },
                },
            );
            self
        }
    }

    #[async_trait]
    impl ProfileLookup for StubProfiles {
        async fn profile(&self, author_id: &str) -> Result<Profile, FetchError> {
            self.profiles
                .get(author_id)
                .cloned()
                .ok_or_else(|| FetchError::ProfileNotFound(author_id.to_string()))
        }
    }

    #[test]
    fn escaping_is_stable_under_reapplication() {
        let empty = CharMap::new();
        let once = escape_text("100% & 50%", &empty);
        assert_eq!(once, "100\\% \\& 50\\%");
        assert_eq!(escape_text(&once, &empty), once);
    }

    #[test]
    fn escaping_dehyphenates_and_flattens_whitespace() {
        let empty = CharMap::new();
        assert_eq!(
            escape_text("cross-\nlingual\ttransfer\nworks", &empty),
            "cross-lingual transfer works"
        );
    }

    #[test]
    fn character_map_applies_after_builtins_in_file_order() {
        let mut map = CharMap::new();
        map.insert("a", "b");
        map.insert("b", "c");
        assert_eq!(escape_text("a", &map), "c");

        let mut reintroducing = CharMap::new();
        reintroducing.insert("AND", "&");
        assert_eq!(escape_text("R AND D & Co", &reintroducing), "R & D \\& Co");
    }

    #[test]
    fn repeated_keys_keep_first_position() {
        let map = CharMap::from_tsv("x\t1\ny\t2\nx\t3\n").unwrap();
        let entries: Vec<_> = map.iter().collect();
        assert_eq!(entries, vec![("x", "3"), ("y", "2")]);
    }

    #[test]
    fn escaped_keys_decode_like_python_literals() {
        assert_eq!(decode_escaped_key("\\u00e9").unwrap(), "é");
        assert_eq!(decode_escaped_key("\\xfc").unwrap(), "ü");
        assert_eq!(decode_escaped_key("\\U0001F600").unwrap(), "😀");
        assert_eq!(decode_escaped_key("\\101\\t").unwrap(), "A\t");
        assert_eq!(decode_escaped_key("\\\\q\\q").unwrap(), "\\q\\q");
        assert_eq!(decode_escaped_key("ß").unwrap(), "ß");
        assert!(decode_escaped_key("\\x4").is_err());
        assert!(decode_escaped_key("tail\\").is_err());
    }

    #[test]
    fn bad_escape_reports_line_number() {
        let err = CharMap::from_tsv("ok\tfine\n\\xZZ\tbroken\n").unwrap_err();
        assert_eq!(
            err,
            CharMapError::BadEscape {
                line: 2,
                message: "truncated \\x escape".into()
            }
        );
    }

    #[test]
    fn mapping_fixture_loads_and_skips_short_lines() {
        let map = CharMap::load(workspace_root().join("fixtures/charmap.tsv")).unwrap();
        assert_eq!(map.len(), 5);
        assert_eq!(
            escape_text("Café Müller – Straße ~", &map),
            "Caf\\'{e} M\\\"{u}ller -- Stra{\\ss}e \\textasciitilde{}"
        );
    }

    #[test]
    fn latin1_mapping_files_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latin1.tsv");
        std::fs::write(&path, b"\xe9\t\\'{e}\n").unwrap();
        let map = CharMap::load(&path).unwrap();
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![("é", "\\'{e}")]);
    }

    #[test]
    fn heuristic_name_parsing() {
        let empty = CharMap::new();
        assert_eq!(
            parse_author_name("Jane Q Doe", &empty),
            AuthorName::Parts {
                first_name: "Jane".into(),
                middle_name: Some("Q".into()),
                last_name: "Doe".into(),
            }
        );
        assert_eq!(
            parse_author_name("Jane Doe", &empty),
            AuthorName::Parts {
                first_name: "Jane".into(),
                middle_name: None,
                last_name: "Doe".into(),
            }
        );
        assert_eq!(
            parse_author_name("Jane Q Public Doe", &empty),
            AuthorName::full("Jane Q Public Doe")
        );
        assert_eq!(parse_author_name("Plato", &empty), AuthorName::full("Plato"));
    }

    #[test]
    fn preferred_name_selection() {
        let a = name("Ann", None, "Lee", None);
        let b = name("Annie", None, "Lee", Some(true));
        let c = name("A", None, "Lee", Some(false));
        assert_eq!(preferred_name(&[]), None);
        assert_eq!(preferred_name(std::slice::from_ref(&c)), Some(&c));
        assert_eq!(preferred_name(&[a.clone(), b.clone()]), Some(&b));
        assert_eq!(preferred_name(&[a.clone(), c.clone()]), Some(&a));
    }

    #[test]
    fn profile_names_map_to_parts_or_full_name() {
        let empty = CharMap::new();
        assert_eq!(
            structured_profile_name(&name("Jane", Some(""), "Doe", None), &empty).unwrap(),
            AuthorName::Parts {
                first_name: "Jane".into(),
                middle_name: None,
                last_name: "Doe".into(),
            }
        );
        let only_full = ProfileName {
            fullname: Some("Madonna".into()),
            ..Default::default()
        };
        assert_eq!(
            structured_profile_name(&only_full, &empty).unwrap(),
            AuthorName::full("Madonna")
        );
        assert_eq!(
            structured_profile_name(&ProfileName::default(), &empty),
            Err(ProfileNameError::MissingFullName)
        );
    }

    #[tokio::test]
    async fn failed_lookups_fall_back_to_submitted_name() {
        let stub = StubProfiles::default().with("~Empty1", vec![]);
        let empty = CharMap::new();

        let missing = resolve_author(&stub, "~Nobody1", Some("No & Body"), &empty).await;
        assert!(matches!(
            &missing,
            AuthorResolution::Fallback { reason, .. } if reason.contains("~Nobody1")
        ));
        assert_eq!(missing.into_name(), AuthorName::full("No \\& Body"));

        let no_names = resolve_author(&stub, "~Empty1", None, &empty).await;
        assert_eq!(
            no_names,
            AuthorResolution::Fallback {
                name: AuthorName::full("~Empty1"),
                reason: "profile lists no names".into(),
            }
        );
    }

    #[test]
    fn venue_filter_uses_exact_labels() {
        let notes = sample_notes();
        let findings: Vec<_> = filter_by_venue(&notes, &Volume::Findings.accepted_venues())
            .into_iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(findings, vec!["paper2"]);

        let main: Vec<_> = filter_by_venue(&notes, &Volume::Main.accepted_venues())
            .into_iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(main, vec!["paper1", "paper3", "paper4"]);
    }

    #[tokio::test]
    async fn profile_conversion_of_main_volume() {
        let notes = sample_notes();
        let stub = StubProfiles::default()
            .with(
                "~Jane_Doe1",
                vec![
                    name("J", None, "Doe", None),
                    name("Jane", Some("Q"), "Doe", Some(true)),
                ],
            )
            .with("~Jane_Public1", vec![name("Jane", None, "Public", None)]);
        let map = CharMap::load(workspace_root().join("fixtures/charmap.tsv")).unwrap();

        let conversion = convert_notes(
            &notes,
            &Volume::Main.accepted_venues(),
            AuthorSource::Profiles(&stub),
            &map,
            &ConvertOptions::default(),
        )
        .await;

        assert_eq!(
            conversion.failures,
            vec![ConvertError::MissingField {
                id: "paper4".into(),
                field: "title"
            }]
        );
        assert_eq!(conversion.records.len(), 2);

        let first = &conversion.records[0];
        assert_eq!(first.file, "EMNLP2023/paper1.pdf");
        assert_eq!(first.title, "Caf\\'{e} \\& Co: 100\\% Results");
        assert_eq!(first.abstract_text, "We study cross-lingual transfer. It works.");
        assert_eq!(first.keywords, vec!["transfer", "R\\&D"]);
        assert_eq!(
            first.authors,
            vec![
                AuthorName::Parts {
                    first_name: "Jane".into(),
                    middle_name: Some("Q".into()),
                    last_name: "Doe".into(),
                },
                AuthorName::full("Bob Smith"),
            ]
        );
        assert_eq!(first.attributes.paper_type, Some(PaperType::Long));
        assert_eq!(
            first.attributes.submitted_area.as_deref(),
            Some("Machine Translation")
        );
        assert_eq!(
            first.attachment.as_deref(),
            Some("EMNLP2023/paper1.attachment.gz")
        );

        let third = &conversion.records[1];
        assert_eq!(third.attributes.paper_type, None);
        assert_eq!(third.attachment, None);
        assert_eq!(third.authors[1], AuthorName::full("Gus Ghost"));
    }

    #[tokio::test]
    async fn profile_mode_requires_submitted_author_names() {
        let note = Note::new("p9", 1)
            .with_content("title", "T")
            .with_content("abstract", "A")
            .with_content("venue", "EMNLP 2023 Main")
            .with_content("keywords", serde_json::json!(["k"]))
            .with_content("authorids", serde_json::json!(["~Ann_Lee1"]));
        let stub = StubProfiles::default().with("~Ann_Lee1", vec![name("Ann", None, "Lee", None)]);
        let empty = CharMap::new();
        let options = ConvertOptions::default();

        let err = convert_note(&note, AuthorSource::Profiles(&stub), &empty, &options)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ConvertError::MissingField {
                id: "p9".into(),
                field: "authors"
            }
        );

        let note = note.with_content("authors", serde_json::json!(["Ann Lee"]));
        let record = convert_note(&note, AuthorSource::Profiles(&stub), &empty, &options)
            .await
            .unwrap();
        assert_eq!(
            record.authors,
            vec![AuthorName::Parts {
                first_name: "Ann".into(),
                middle_name: None,
                last_name: "Lee".into(),
            }]
        );
    }

    #[tokio::test]
    async fn heuristic_conversion_and_yaml_shape() {
        let notes = sample_notes();
        let conversion = convert_notes(
            &notes,
            &Volume::Main.accepted_venues(),
            AuthorSource::Heuristic,
            &CharMap::new(),
            &ConvertOptions {
                file_prefix: "papers".into(),
            },
        )
        .await;
        assert_eq!(conversion.records.len(), 2);
        assert_eq!(
            conversion.records[1].authors,
            vec![
                AuthorName::full("Jane Q Public Doe"),
                AuthorName::Parts {
                    first_name: "Gus".into(),
                    middle_name: None,
                    last_name: "Ghost".into(),
                },
            ]
        );

        let yaml = to_yaml_string(&conversion.records).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let seq = parsed.as_sequence().expect("top-level sequence");
        assert_eq!(seq.len(), 2);
        assert_eq!(seq[0]["file"], "papers/paper1.pdf");
        assert_eq!(seq[0]["attributes"]["paper_type"], "long");
        assert_eq!(seq[0]["authors"][0]["first_name"], "Jane");
        assert!(seq[1]["attributes"].get("paper_type").is_none());
        assert!(seq[1].get("attachment").is_none());
        assert!(!yaml.contains('{'), "expected block style output:\n{yaml}");
    }

    #[tokio::test]
    async fn write_yaml_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("papers.yml");
        let notes = sample_notes();
        let conversion = convert_notes(
            &notes,
            &Volume::Findings.accepted_venues(),
            AuthorSource::Heuristic,
            &CharMap::new(),
            &ConvertOptions::default(),
        )
        .await;
        write_yaml(&path, &conversion.records).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("- id: paper2\n"));
        assert!(text.contains("paper_type: short"));
    }
}
