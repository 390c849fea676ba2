use ahash::{AHashMap, AHashSet};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::SurveyConfig;
use crate::records::{Author, INVALID_ID};
use crate::runtime;
use crate::survey::{Survey, SurveyKind};

/// Skippable-record tallies; diagnostics only, never control flow.
#[derive(Default)]
pub struct Diagnostics {
    pub bad_record: AtomicU64,
    pub bad_id: AtomicU64,
}

impl Diagnostics {
    fn report(&self) {
        eprintln!(
            "[errors] {} bad records, {} unextractable ids",
            self.bad_record.load(Ordering::Relaxed),
            self.bad_id.load(Ordering::Relaxed)
        );
    }
}

/// One flagged outflow event, flat form for the tabular writer.
#[derive(Debug, Serialize, PartialEq, Eq)]
struct EventRow {
    author_id: i64,
    year: i32,
    is_flagged: u8,
    is_experienced: u8,
}

/// Recursive scan for `.jsonl` shards, sorted so shard numbering is stable
/// across runs.
pub fn scan_shards(datadir: &Path) -> Result<Vec<PathBuf>> {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        for entry in
            std::fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                walk(&path, out)?;
            } else if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                out.push(path);
            }
        }
        Ok(())
    }
    let mut shards = Vec::new();
    walk(datadir, &mut shards)?;
    shards.sort();
    eprintln!("[scan] {} shards under {}", shards.len(), datadir.display());
    Ok(shards)
}

fn shard_progress(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} shards {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    pb
}

/// Stream one shard: decode each line, count undecodable ones, hand every
/// record (plus its raw line) to `f`.
fn for_each_record(
    path: &Path,
    cfg: &SurveyConfig,
    diags: &Diagnostics,
    unknown_codes: &mut AHashMap<String, u64>,
    mut f: impl FnMut(&str, Author) -> Result<()>,
) -> Result<()> {
    let file = File::open(path).with_context(|| format!("open shard {}", path.display()))?;
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read shard {}", path.display()))?;
        let value: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => {
                diags.bad_record.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        let author = match Author::from_json(&value, cfg, unknown_codes) {
            Ok(a) => a,
            Err(_) => {
                diags.bad_record.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        if author.id == INVALID_ID {
            diags.bad_id.fetch_add(1, Ordering::Relaxed);
        }
        f(&line, author)?;
    }
    Ok(())
}

fn lock<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    // A poisoned lock means a worker panicked; the run is already lost.
    m.lock().expect("worker panicked holding a shared lock")
}

fn merge_unknown(global: &Mutex<AHashMap<String, u64>>, local: AHashMap<String, u64>) {
    if local.is_empty() {
        return;
    }
    let mut g = lock(global);
    for (code, n) in local {
        *g.entry(code).or_insert(0) += n;
    }
}

fn dump_unknown_codes(path: &Path, unknown: &AHashMap<String, u64>) -> Result<()> {
    let mut sorted: Vec<(&String, &u64)> = unknown.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    let mut out = File::create(path).with_context(|| format!("create {}", path.display()))?;
    for (code, n) in sorted {
        writeln!(out, "{code}\t{n}")?;
    }
    Ok(())
}

/// Count inflow migrations: one survey, shard-local partials merged under a
/// single lock.
pub fn count_inflow(datadir: &Path, outdir: &Path, cfg: &SurveyConfig) -> Result<()> {
    let shards = scan_shards(datadir)?;
    let diags = Diagnostics::default();
    let global = Mutex::new(Survey::new(SurveyKind::Inflow, cfg));
    let unknown = Mutex::new(AHashMap::new());
    let pb = shard_progress(shards.len());

    shards.par_iter().try_for_each(|path| -> Result<()> {
        let mut local = Survey::new(SurveyKind::Inflow, cfg);
        let mut local_unknown = AHashMap::new();
        for_each_record(path, cfg, &diags, &mut local_unknown, |_, author| {
            local.add(&author, cfg)?;
            Ok(())
        })?;
        lock(&global).merge(&local)?;
        merge_unknown(&unknown, local_unknown);
        pb.inc(1);
        Ok(())
    })?;
    pb.finish_and_clear();

    diags.report();
    runtime::report_rss("inflow");
    let survey_dir = outdir.join(SurveyKind::Inflow.dir_name());
    lock(&global).save(&survey_dir, cfg)?;
    let unknown = unknown.into_inner().expect("unknown-code lock poisoned");
    dump_unknown_codes(&survey_dir.join("unknown_codes.txt"), &unknown)?;
    Ok(())
}

/// Count outflow migrations: the all/experienced/not-experienced surveys in
/// one pass, plus the flat per-entity event table and the unknown-code
/// tally. `allow` restricts the run to a fixed id set.
pub fn count_outflow(
    datadir: &Path,
    outdir: &Path,
    cfg: &SurveyConfig,
    allow: Option<&AHashSet<i64>>,
) -> Result<()> {
    const KINDS: [SurveyKind; 3] = [
        SurveyKind::Outflow,
        SurveyKind::OutflowExperienced,
        SurveyKind::OutflowNotExperienced,
    ];
    let shards = scan_shards(datadir)?;
    let diags = Diagnostics::default();
    let globals: Vec<Mutex<Survey>> = KINDS
        .iter()
        .map(|&k| Mutex::new(Survey::new(k, cfg)))
        .collect();
    let events: Mutex<Vec<EventRow>> = Mutex::new(Vec::new());
    let unknown = Mutex::new(AHashMap::new());
    let pb = shard_progress(shards.len());

    shards.par_iter().try_for_each(|path| -> Result<()> {
        let mut locals: Vec<Survey> = KINDS.iter().map(|&k| Survey::new(k, cfg)).collect();
        let mut local_events = Vec::new();
        let mut local_unknown = AHashMap::new();
        for_each_record(path, cfg, &diags, &mut local_unknown, |_, author| {
            if let Some(allow) = allow {
                if !allow.contains(&author.id) {
                    return Ok(());
                }
            }
            if let Some(mig) =
                crate::inference::outflow_migration(&author.years, &cfg.policy)?
            {
                local_events.push(EventRow {
                    author_id: author.id,
                    year: cfg.years.year_at(mig.year_offset),
                    is_flagged: cfg.name_flags.is_flagged(&author.display_name) as u8,
                    is_experienced: (author.works_count >= cfg.experienced_threshold) as u8,
                });
            }
            for local in locals.iter_mut() {
                local.add(&author, cfg)?;
            }
            Ok(())
        })?;
        for (global, local) in globals.iter().zip(&locals) {
            lock(global).merge(local)?;
        }
        lock(&events).extend(local_events);
        merge_unknown(&unknown, local_unknown);
        pb.inc(1);
        Ok(())
    })?;
    pb.finish_and_clear();

    diags.report();
    runtime::report_rss("outflow");

    std::fs::create_dir_all(outdir).with_context(|| format!("create dir {}", outdir.display()))?;
    for (kind, global) in KINDS.iter().zip(&globals) {
        lock(global).save(&outdir.join(kind.dir_name()), cfg)?;
    }

    let mut rows = events.into_inner().expect("event list lock poisoned");
    rows.sort_unstable_by_key(|r| (r.author_id, r.year));
    let events_path = outdir.join("events.csv");
    let mut writer = csv::Writer::from_path(&events_path)
        .with_context(|| format!("create {}", events_path.display()))?;
    for row in &rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    eprintln!("[events] {} outflow events -> {}", rows.len(), events_path.display());

    let unknown = unknown.into_inner().expect("unknown-code lock poisoned");
    dump_unknown_codes(&outdir.join("unknown_codes.txt"), &unknown)?;
    Ok(())
}

/// Pre-filter pass: copy the raw lines of qualifying records into per-shard
/// files under `<outdir>/inflow` and `<outdir>/outflow`, reporting qualify
/// ratios as shards finish.
pub fn filter_qualifying(datadir: &Path, outdir: &Path, cfg: &SurveyConfig) -> Result<()> {
    let shards = scan_shards(datadir)?;
    let inflow_dir = outdir.join("inflow");
    let outflow_dir = outdir.join("outflow");
    std::fs::create_dir_all(&inflow_dir)?;
    std::fs::create_dir_all(&outflow_dir)?;

    let diags = Diagnostics::default();
    let unknown = Mutex::new(AHashMap::new());
    let total_in = AtomicU64::new(0);
    let total_inflow = AtomicU64::new(0);
    let total_outflow = AtomicU64::new(0);
    let pb = shard_progress(shards.len());

    (0..shards.len()).into_par_iter().try_for_each(|i| -> Result<()> {
        let mut inflow_out = File::create(inflow_dir.join(format!("{i}.jsonl")))?;
        let mut outflow_out = File::create(outflow_dir.join(format!("{i}.jsonl")))?;
        let (mut seen, mut n_inflow, mut n_outflow) = (0u64, 0u64, 0u64);
        let mut local_unknown = AHashMap::new();
        for_each_record(&shards[i], cfg, &diags, &mut local_unknown, |line, author| {
            seen += 1;
            if crate::inference::inflow_migration(&author.years, &cfg.policy)?.is_some() {
                n_inflow += 1;
                writeln!(inflow_out, "{line}")?;
            }
            if crate::inference::outflow_migration(&author.years, &cfg.policy)?.is_some() {
                n_outflow += 1;
                writeln!(outflow_out, "{line}")?;
            }
            Ok(())
        })?;
        total_in.fetch_add(seen, Ordering::Relaxed);
        total_inflow.fetch_add(n_inflow, Ordering::Relaxed);
        total_outflow.fetch_add(n_outflow, Ordering::Relaxed);
        merge_unknown(&unknown, local_unknown);
        pb.println(format!(
            "[filter] shard {}: {} records -> inflow {} / outflow {}",
            i, seen, n_inflow, n_outflow
        ));
        pb.inc(1);
        Ok(())
    })?;
    pb.finish_and_clear();

    let (seen, n_in, n_out) = (
        total_in.load(Ordering::Relaxed),
        total_inflow.load(Ordering::Relaxed),
        total_outflow.load(Ordering::Relaxed),
    );
    eprintln!(
        "[filter] total {} records -> inflow {} / outflow {}, ratio {:.4} / {:.4}",
        seen,
        n_in,
        n_out,
        n_in as f64 / seen.max(1) as f64,
        n_out as f64 / seen.max(1) as f64
    );
    diags.report();
    Ok(())
}

/// Decode one shard and pretty-print every record. Debug aid.
pub fn inspect(path: &Path, cfg: &SurveyConfig) -> Result<()> {
    let diags = Diagnostics::default();
    let mut unknown = AHashMap::new();
    for_each_record(path, cfg, &diags, &mut unknown, |_, author| {
        println!("================ {}", author.id);
        println!("{}", author.summary(cfg));
        Ok(())
    })?;
    diags.report();
    Ok(())
}

/// CSV allow-list: header skipped, first column parsed as an id.
pub fn load_allow_list(path: &Path) -> Result<AHashSet<i64>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("open allow-list {}", path.display()))?;
    let mut ids = AHashSet::new();
    for record in reader.records() {
        let record = record?;
        if let Some(first) = record.get(0) {
            if let Ok(id) = first.trim().parse::<i64>() {
                ids.insert(id);
            }
        }
    }
    eprintln!("[filter] allow-list with {} ids", ids.len());
    Ok(ids)
}
