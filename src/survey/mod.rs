use ahash::AHashMap;
use anyhow::{Context, Result};
use ndarray::{Array3, Array4, s};
use ndarray_npy::write_npy;
use std::path::Path;

use crate::config::SurveyConfig;
use crate::inference::{ConsistencyError, Migration, inflow_migration, outflow_migration};
use crate::records::Author;

/// Group axis of every count tensor: plain, flagged, and the redundant "all"
/// slice kept equal to the sum of the other two on every write.
pub const GROUP_PLAIN: usize = 0;
pub const GROUP_FLAGGED: usize = 1;
pub const GROUP_ALL: usize = 2;
pub const NUM_GROUPS: usize = 3;

/// Which direction a survey counts, and which magnitude stratum it admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurveyKind {
    Inflow,
    Outflow,
    OutflowExperienced,
    OutflowNotExperienced,
}

impl SurveyKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            SurveyKind::Inflow => "inflow",
            SurveyKind::Outflow => "outflow",
            SurveyKind::OutflowExperienced => "outflow_experienced",
            SurveyKind::OutflowNotExperienced => "outflow_not_experienced",
        }
    }

    /// Magnitude pre-filter: applied before the rule is even evaluated.
    fn admits(&self, works_count: i64, threshold: i64) -> bool {
        match self {
            SurveyKind::Inflow | SurveyKind::Outflow => true,
            SurveyKind::OutflowExperienced => works_count >= threshold,
            SurveyKind::OutflowNotExperienced => works_count < threshold,
        }
    }

    fn evaluate(
        &self,
        author: &Author,
        cfg: &SurveyConfig,
    ) -> Result<Option<Migration>, ConsistencyError> {
        match self {
            SurveyKind::Inflow => inflow_migration(&author.years, &cfg.policy),
            _ => outflow_migration(&author.years, &cfg.policy),
        }
    }
}

/// Descriptive identity of one category: a plain id/name pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Domain {
    pub id: i64,
    pub display_name: String,
}

/// Migration counts of one category. The tensor axes are
/// [group, year offset, location]; the metadata travels alongside it rather
/// than above it.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainCount {
    pub meta: Domain,
    pub counts: Array3<i64>,
}

impl DomainCount {
    fn empty(total_years: usize, n_locations: usize) -> Self {
        DomainCount {
            meta: Domain::default(),
            counts: Array3::zeros((NUM_GROUPS, total_years, n_locations)),
        }
    }

    /// First use adopts the id/name pair; afterwards a different id for the
    /// same accumulated name is a logic defect, not bad input.
    pub fn add(
        &mut self,
        id: i64,
        name: &str,
        group: usize,
        year_offset: usize,
        location: usize,
        delta: i64,
    ) -> Result<(), ConsistencyError> {
        if self.meta.display_name.is_empty() {
            self.meta.id = id;
            self.meta.display_name = name.to_string();
        } else if self.meta.id != id {
            return Err(ConsistencyError::CategoryIdentity {
                id,
                have: self.meta.display_name.clone(),
                got: name.to_string(),
            });
        }
        self.counts[[group, year_offset, location]] += delta;
        self.counts[[GROUP_ALL, year_offset, location]] += delta;
        Ok(())
    }

    pub fn merge(&mut self, other: &DomainCount) -> Result<(), ConsistencyError> {
        // Zero-delta add carries the identity check.
        self.add(other.meta.id, &other.meta.display_name, GROUP_PLAIN, 0, 0, 0)?;
        self.counts += &other.counts;
        Ok(())
    }
}

/// Write-only aggregate of migration events, one count tensor per category.
/// Shard-local instances fold into a parent exactly once; merge order cannot
/// change the totals.
#[derive(Debug, Clone, PartialEq)]
pub struct Survey {
    pub kind: SurveyKind,
    domains: AHashMap<i64, DomainCount>,
    total_years: usize,
    n_locations: usize,
}

impl Survey {
    pub fn new(kind: SurveyKind, cfg: &SurveyConfig) -> Self {
        Survey {
            kind,
            domains: AHashMap::new(),
            total_years: cfg.years.total(),
            n_locations: cfg.locations.len(),
        }
    }

    /// Evaluate one record and, if it migrated, count it once per category.
    pub fn add(&mut self, author: &Author, cfg: &SurveyConfig) -> Result<(), ConsistencyError> {
        if !self.kind.admits(author.works_count, cfg.experienced_threshold) {
            return Ok(());
        }
        let Some(mig) = self.kind.evaluate(author, cfg)? else {
            return Ok(());
        };
        let group = if cfg.name_flags.is_flagged(&author.display_name) {
            GROUP_FLAGGED
        } else {
            GROUP_PLAIN
        };
        let (total_years, n_locations) = (self.total_years, self.n_locations);
        for (&id, name) in &author.domains {
            self.domains
                .entry(id)
                .or_insert_with(|| DomainCount::empty(total_years, n_locations))
                .add(id, name, group, mig.year_offset, mig.location, 1)?;
        }
        Ok(())
    }

    pub fn merge(&mut self, other: &Survey) -> Result<(), ConsistencyError> {
        for (&id, count) in &other.domains {
            self.domains
                .entry(id)
                .or_insert_with(|| DomainCount::empty(count.counts.dim().1, count.counts.dim().2))
                .merge(count)?;
        }
        Ok(())
    }

    /// Categories sorted by id, for run-stable output.
    fn sorted_domains(&self) -> Vec<&DomainCount> {
        let mut out: Vec<&DomainCount> = self.domains.values().collect();
        out.sort_by_key(|dc| dc.meta.id);
        out
    }

    /// Dump `meta.json` (axis metadata) and `counts.npy`
    /// ([category, group, year, location], category order as in the
    /// metadata) under `dir`.
    pub fn save(&self, dir: &Path, cfg: &SurveyConfig) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
        let sorted = self.sorted_domains();

        let meta = serde_json::json!({
            "year_begin": cfg.years.begin,
            "year_end": cfg.years.end,
            "locations": cfg.locations.codes(),
            "domains": sorted
                .iter()
                .map(|dc| serde_json::json!({
                    "id": dc.meta.id,
                    "display_name": dc.meta.display_name,
                }))
                .collect::<Vec<_>>(),
        });
        let meta_path = dir.join("meta.json");
        std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)
            .with_context(|| format!("write {}", meta_path.display()))?;

        let mut counts = Array4::<i64>::zeros((
            sorted.len(),
            NUM_GROUPS,
            self.total_years,
            self.n_locations,
        ));
        for (i, dc) in sorted.iter().enumerate() {
            counts.slice_mut(s![i, .., .., ..]).assign(&dc.counts);
        }
        let counts_path = dir.join("counts.npy");
        write_npy(&counts_path, &counts)
            .with_context(|| format!("write {}", counts_path.display()))?;
        Ok(())
    }
}
