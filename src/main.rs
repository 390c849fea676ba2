use anyhow::Result;
use std::env;
use std::path::PathBuf;

mod config;
mod inference;
mod pipeline;
mod records;
mod runtime;
mod survey;

use config::{NameFlags, SurveyConfig};

enum RunMode {
    Inspect {
        input: PathBuf,
    },
    Filter {
        datadir: PathBuf,
        outdir: PathBuf,
    },
    CountInflow {
        datadir: PathBuf,
        outdir: PathBuf,
    },
    CountOutflow {
        datadir: PathBuf,
        outdir: PathBuf,
        allow_list: Option<PathBuf>,
    },
}

fn usage() -> ! {
    eprintln!(
        "usage: flowcount inspect <shard.jsonl>\n       \
         flowcount filter <datadir> <outdir>\n       \
         flowcount count-inflow <datadir> <outdir>\n       \
         flowcount count-outflow <datadir> <outdir> [allow_list.csv]"
    );
    std::process::exit(1);
}

fn parse_args() -> RunMode {
    let mut args = env::args().skip(1);
    let command = args.next().unwrap_or_else(|| usage());
    match command.as_str() {
        "inspect" => RunMode::Inspect {
            input: PathBuf::from(args.next().unwrap_or_else(|| usage())),
        },
        "filter" => RunMode::Filter {
            datadir: PathBuf::from(args.next().unwrap_or_else(|| usage())),
            outdir: PathBuf::from(args.next().unwrap_or_else(|| usage())),
        },
        "count-inflow" => RunMode::CountInflow {
            datadir: PathBuf::from(args.next().unwrap_or_else(|| usage())),
            outdir: PathBuf::from(args.next().unwrap_or_else(|| usage())),
        },
        "count-outflow" => RunMode::CountOutflow {
            datadir: PathBuf::from(args.next().unwrap_or_else(|| usage())),
            outdir: PathBuf::from(args.next().unwrap_or_else(|| usage())),
            allow_list: args.next().map(PathBuf::from),
        },
        _ => usage(),
    }
}

fn main() -> Result<()> {
    runtime::configure_thread_pool();
    let mode = parse_args();

    let name_flags = NameFlags::from_path(&config::surnames_path())?;
    let cfg = SurveyConfig::study_defaults(name_flags)?;
    eprintln!(
        "[config] reference {} / {} locations, years {}..{}",
        cfg.locations.reference_code(),
        cfg.locations.len(),
        cfg.years.begin,
        cfg.years.end
    );

    match mode {
        RunMode::Inspect { input } => pipeline::inspect(&input, &cfg)?,
        RunMode::Filter { datadir, outdir } => pipeline::filter_qualifying(&datadir, &outdir, &cfg)?,
        RunMode::CountInflow { datadir, outdir } => {
            pipeline::count_inflow(&datadir, &outdir, &cfg)?
        }
        RunMode::CountOutflow {
            datadir,
            outdir,
            allow_list,
        } => {
            let allow = match allow_list {
                Some(path) => Some(pipeline::load_allow_list(&path)?),
                None => None,
            };
            pipeline::count_outflow(&datadir, &outdir, &cfg, allow.as_ref())?
        }
    }
    Ok(())
}
