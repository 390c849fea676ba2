use ahash::{AHashMap, AHashSet};
use anyhow::{Context, Result, bail};
use std::fs::File;
use std::path::PathBuf;

use crate::inference::RulePolicy;

/// Index of the reference location (the jurisdiction migration is measured
/// against) in every location table. Bit 0 of every year mask.
pub const REFERENCE_INDEX: usize = 0;

/// Code of the catch-all slot that must close every location table.
pub const OTHER_CODE: &str = "other";

/// Year masks are u32 bitmasks, so a table can hold at most 32 slots.
const MAX_LOCATIONS: usize = 32;

/// Location codes of the study, reference first, catch-all last.
pub const DEFAULT_LOCATION_CODES: [&str; 12] = [
    "US", "CN", "IN", "CA", "DE", "FR", "AU", "KR", "JP", "CH", "UK", OTHER_CODE,
];

pub const DEFAULT_MAX_GAP_YEARS: usize = 5;
pub const DEFAULT_EXPERIENCED_THRESHOLD: i64 = 25;

/// Surname list path; override via `FLOWCOUNT_SURNAMES`.
pub fn surnames_path() -> PathBuf {
    std::env::var("FLOWCOUNT_SURNAMES")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/surnames.json"))
}

/// The inflow rule's gap veto is a policy choice the source data does not
/// settle; `FLOWCOUNT_INFLOW_GAP_VETO=1` turns it on.
pub fn inflow_gap_veto() -> bool {
    std::env::var("FLOWCOUNT_INFLOW_GAP_VETO").ok().as_deref() == Some("1")
}

/// The half-open calendar span every mask is indexed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearRange {
    pub begin: i32,
    pub end: i32,
}

impl YearRange {
    pub const STUDY: YearRange = YearRange {
        begin: 1990,
        end: 2030,
    };

    #[inline]
    pub fn total(&self) -> usize {
        (self.end - self.begin) as usize
    }

    /// Zero-based slot for a calendar year; None for stray years.
    #[inline]
    pub fn offset_of(&self, year: i32) -> Option<usize> {
        if year >= self.begin && year < self.end {
            Some((year - self.begin) as usize)
        } else {
            None
        }
    }

    #[inline]
    pub fn year_at(&self, offset: usize) -> i32 {
        self.begin + offset as i32
    }
}

/// Ordered location-code table with the stable code -> bit-index mapping
/// shared by every worker. Built once at startup, read-only afterwards.
#[derive(Debug, Clone)]
pub struct LocationTable {
    codes: Vec<String>,
    lookup: AHashMap<String, usize>,
}

impl LocationTable {
    pub fn from_codes(codes: &[&str]) -> Result<Self> {
        if codes.len() < 2 {
            bail!(
                "location table needs a reference code and {:?}, got {} entries",
                OTHER_CODE,
                codes.len()
            );
        }
        if codes.len() > MAX_LOCATIONS {
            bail!(
                "too many locations: {} (masks hold at most {})",
                codes.len(),
                MAX_LOCATIONS
            );
        }
        if codes[codes.len() - 1] != OTHER_CODE {
            bail!("location table must end with {:?}", OTHER_CODE);
        }
        if codes[REFERENCE_INDEX] == OTHER_CODE {
            bail!("reference location (index 0) cannot be {:?}", OTHER_CODE);
        }
        let mut lookup = AHashMap::with_capacity(codes.len());
        for (i, code) in codes.iter().enumerate() {
            if lookup.insert(code.to_string(), i).is_some() {
                bail!("duplicate location code {:?}", code);
            }
        }
        Ok(LocationTable {
            codes: codes.iter().map(|c| c.to_string()).collect(),
            lookup,
        })
    }

    /// Slot for a code; None when the code is outside the table (callers map
    /// that to `other_index` and tally the code).
    #[inline]
    pub fn index_of(&self, code: &str) -> Option<usize> {
        self.lookup.get(code).copied()
    }

    #[inline]
    pub fn other_index(&self) -> usize {
        self.codes.len() - 1
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    pub fn reference_code(&self) -> &str {
        &self.codes[REFERENCE_INDEX]
    }
}

/// Lowercase surname set used to derive the sub-population flag from a
/// display name. Loaded once, shared read-only.
#[derive(Debug, Clone, Default)]
pub struct NameFlags {
    surnames: AHashSet<String>,
}

impl NameFlags {
    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("open surname list {}", path.display()))?;
        let names: Vec<String> = serde_json::from_reader(file)
            .with_context(|| format!("parse surname list {}", path.display()))?;
        let flags = Self::from_names(names);
        eprintln!("[config] loaded {} flagged surnames", flags.surnames.len());
        Ok(flags)
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        NameFlags {
            surnames: names
                .into_iter()
                .map(|n| n.as_ref().to_lowercase())
                .collect(),
        }
    }

    /// True when the last whitespace-separated token of the name, lowercased,
    /// is in the set. Single-token names are never flagged.
    pub fn is_flagged(&self, display_name: &str) -> bool {
        let Some(space) = display_name.rfind(' ') else {
            return false;
        };
        let last = display_name[space + 1..].to_lowercase();
        self.surnames.contains(&last)
    }
}

/// Everything a worker needs to evaluate and aggregate one record. Built at
/// startup, fatal on invalid tables, then passed by shared reference.
#[derive(Debug, Clone)]
pub struct SurveyConfig {
    pub locations: LocationTable,
    pub years: YearRange,
    pub policy: RulePolicy,
    pub experienced_threshold: i64,
    pub name_flags: NameFlags,
}

impl SurveyConfig {
    pub fn study_defaults(name_flags: NameFlags) -> Result<Self> {
        Ok(SurveyConfig {
            locations: LocationTable::from_codes(&DEFAULT_LOCATION_CODES)?,
            years: YearRange::STUDY,
            policy: RulePolicy {
                max_gap_years: DEFAULT_MAX_GAP_YEARS,
                inflow_gap_veto: inflow_gap_veto(),
            },
            experienced_threshold: DEFAULT_EXPERIENCED_THRESHOLD,
            name_flags,
        })
    }
}
