use ahash::AHashMap;
use anyhow::{Context, Result, anyhow};
use serde_json::Value;

use crate::config::SurveyConfig;
use crate::inference::YearMask;

pub const AUTHOR_URL_PREFIX: &str = "https://openalex.org/A";
pub const DOMAIN_URL_PREFIX: &str = "https://openalex.org/domains/";
pub const FIELD_URL_PREFIX: &str = "https://openalex.org/fields/";

/// Sentinel for an identifier that could not be extracted. Also the id of
/// the synthetic "All" category every record belongs to.
pub const INVALID_ID: i64 = -1;
pub const ALL_DOMAIN_NAME: &str = "All";

/// The source taxonomy has no top-level "Engineering and Computer Science"
/// category, but the study reports one; records touching either field are
/// promoted into this synthetic id.
pub const ENCS_DOMAIN_ID: i64 = -2;
pub const ENCS_DOMAIN_NAME: &str = "Engineering and Computer Science";
const FIELD_CS: i64 = 17;
const FIELD_ENGINEERING: i64 = 22;

/// Strip a known URL prefix and parse the trailing numeric id. None marks an
/// unextractable id; callers decide whether that is diagnostic or fatal.
pub fn extract_id(url: &str, prefix: &str) -> Option<i64> {
    let idstr = url.strip_prefix(prefix)?;
    let id: i64 = idstr.parse().ok()?;
    if id < 0 { None } else { Some(id) }
}

fn field<'a>(j: &'a Value, name: &str) -> Result<&'a Value> {
    j.get(name).ok_or_else(|| anyhow!("missing field {name:?}"))
}

fn str_field<'a>(j: &'a Value, name: &str) -> Result<&'a str> {
    field(j, name)?
        .as_str()
        .ok_or_else(|| anyhow!("field {name:?} is not a string"))
}

/// One observed entity: identifier, display name, category map, magnitude
/// counter, and the year-indexed location mask. Immutable once decoded; the
/// aggregator keeps no reference back to it.
#[derive(Debug, Clone)]
pub struct Author {
    /// INVALID_ID when extraction failed; the record still aggregates and
    /// the failure is tallied as a diagnostic.
    pub id: i64,
    pub display_name: String,
    pub alternative_names: Vec<String>,
    pub domains: AHashMap<i64, String>,
    pub years: YearMask,
    pub works_count: i64,
}

impl Author {
    /// Decode one JSONL record. Any error here is a skippable record error:
    /// the caller counts it and moves on. Unknown location codes are mapped
    /// to the "other" slot and tallied in `unknown_codes`.
    pub fn from_json(
        j: &Value,
        cfg: &SurveyConfig,
        unknown_codes: &mut AHashMap<String, u64>,
    ) -> Result<Self> {
        let id = extract_id(str_field(j, "id")?, AUTHOR_URL_PREFIX).unwrap_or(INVALID_ID);
        let display_name = str_field(j, "display_name")?.to_string();
        let works_count = field(j, "works_count")?
            .as_i64()
            .context("works_count is not an integer")?;

        let mut alternative_names = Vec::new();
        if let Some(alts) = j.get("display_name_alternatives").and_then(Value::as_array) {
            for alt in alts {
                let name = alt.as_str().unwrap_or("");
                let regular: String = name.trim().chars().filter(|&c| c != '"').collect();
                alternative_names.push(regular);
            }
        }

        let mut domains = AHashMap::new();
        domains.insert(INVALID_ID, ALL_DOMAIN_NAME.to_string());
        if let Some(topics) = j.get("topics").and_then(Value::as_array) {
            let mut has_encs = false;
            for topic in topics {
                let domain = field(topic, "domain")?;
                let domain_url = str_field(domain, "id")?;
                let domain_id = extract_id(domain_url, DOMAIN_URL_PREFIX)
                    .with_context(|| format!("bad domain id {domain_url:?}"))?;
                domains.insert(domain_id, str_field(domain, "display_name")?.to_string());

                let field_url = str_field(field(topic, "field")?, "id")?;
                let field_id = extract_id(field_url, FIELD_URL_PREFIX)
                    .with_context(|| format!("bad field id {field_url:?}"))?;
                if field_id == FIELD_CS || field_id == FIELD_ENGINEERING {
                    has_encs = true;
                }
            }
            if has_encs {
                domains.insert(ENCS_DOMAIN_ID, ENCS_DOMAIN_NAME.to_string());
            }
        }

        let mut years = YearMask::new(cfg.years);
        if let Some(affiliations) = j.get("affiliations").and_then(Value::as_array) {
            for affiliation in affiliations {
                let institution = field(affiliation, "institution")?;
                let code = str_field(institution, "country_code")?;
                let location = match cfg.locations.index_of(code) {
                    Some(idx) => idx,
                    None => {
                        *unknown_codes.entry(code.to_string()).or_insert(0) += 1;
                        cfg.locations.other_index()
                    }
                };
                for year in field(affiliation, "years")?
                    .as_array()
                    .context("years is not an array")?
                {
                    let year = year.as_i64().context("year is not an integer")? as i32;
                    years.add(year, location);
                }
            }
        }

        Ok(Author {
            id,
            display_name,
            alternative_names,
            domains,
            years,
            works_count,
        })
    }

    /// Compact re-encoding for the inspect command.
    pub fn summary(&self, cfg: &SurveyConfig) -> Value {
        let mut domains: Vec<(i64, &String)> = self.domains.iter().map(|(&id, n)| (id, n)).collect();
        domains.sort_by_key(|&(id, _)| id);
        let observed: Vec<Value> = self
            .years
            .observed()
            .into_iter()
            .map(|(year, mask)| {
                let codes: Vec<&str> = (0..cfg.locations.len())
                    .filter(|&i| mask & (1 << i) != 0)
                    .map(|i| cfg.locations.codes()[i].as_str())
                    .collect();
                serde_json::json!({ "year": year, "locations": codes })
            })
            .collect();
        serde_json::json!({
            "id": self.id,
            "display_name": self.display_name,
            "display_name_alternatives": self.alternative_names,
            "works_count": self.works_count,
            "domains": domains
                .into_iter()
                .map(|(id, name)| serde_json::json!({ "id": id, "display_name": name }))
                .collect::<Vec<_>>(),
            "observed": observed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NameFlags;
    use serde_json::json;

    fn cfg() -> SurveyConfig {
        SurveyConfig::study_defaults(NameFlags::default()).unwrap()
    }

    fn record() -> Value {
        json!({
            "id": "https://openalex.org/A5027888330",
            "display_name": "Wei Wang",
            "display_name_alternatives": ["  W. \"Wei\" Wang "],
            "works_count": 42,
            "topics": [
                {
                    "domain": {
                        "id": "https://openalex.org/domains/3",
                        "display_name": "Physical Sciences"
                    },
                    "field": { "id": "https://openalex.org/fields/17" }
                }
            ],
            "affiliations": [
                {
                    "institution": { "country_code": "US" },
                    "years": [2000, 2001, 2002]
                },
                {
                    "institution": { "country_code": "XX" },
                    "years": [2005]
                }
            ]
        })
    }

    #[test]
    fn decodes_a_full_record() {
        let cfg = cfg();
        let mut unknown = AHashMap::new();
        let author = Author::from_json(&record(), &cfg, &mut unknown).unwrap();
        assert_eq!(author.id, 5027888330);
        assert_eq!(author.display_name, "Wei Wang");
        assert_eq!(author.alternative_names, vec!["W. Wei Wang"]);
        assert_eq!(author.works_count, 42);
        // All + Physical Sciences + promoted EnCS.
        assert_eq!(author.domains.len(), 3);
        assert_eq!(author.domains[&INVALID_ID], ALL_DOMAIN_NAME);
        assert_eq!(author.domains[&3], "Physical Sciences");
        assert_eq!(author.domains[&ENCS_DOMAIN_ID], ENCS_DOMAIN_NAME);
        // US years plus the unknown code folded into "other".
        let other = cfg.locations.other_index();
        assert_eq!(
            author.years.observed(),
            vec![(2000, 1), (2001, 1), (2002, 1), (2005, 1 << other)]
        );
        assert_eq!(unknown.get("XX"), Some(&1));
    }

    #[test]
    fn bad_author_id_is_diagnostic_not_fatal() {
        let mut j = record();
        j["id"] = json!("https://example.org/A1");
        let mut unknown = AHashMap::new();
        let author = Author::from_json(&j, &cfg(), &mut unknown).unwrap();
        assert_eq!(author.id, INVALID_ID);
    }

    #[test]
    fn missing_works_count_is_a_record_error() {
        let mut j = record();
        j.as_object_mut().unwrap().remove("works_count");
        let mut unknown = AHashMap::new();
        assert!(Author::from_json(&j, &cfg(), &mut unknown).is_err());
    }

    #[test]
    fn bad_field_id_is_a_record_error() {
        let mut j = record();
        j["topics"][0]["field"]["id"] = json!("https://openalex.org/fields/oops");
        let mut unknown = AHashMap::new();
        assert!(Author::from_json(&j, &cfg(), &mut unknown).is_err());
    }

    #[test]
    fn extract_id_cases() {
        assert_eq!(
            extract_id("https://openalex.org/A123", AUTHOR_URL_PREFIX),
            Some(123)
        );
        assert_eq!(extract_id("A123", AUTHOR_URL_PREFIX), None);
        assert_eq!(
            extract_id("https://openalex.org/Axyz", AUTHOR_URL_PREFIX),
            None
        );
    }
}
