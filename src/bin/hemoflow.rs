//! Minimal CLI runner
//!
//! Loads a JSON configuration, builds one of the demo geometries, runs the
//! time loop across an in-process rank fabric (one thread per rank), and
//! writes the rank-0 run report plus a merged field snapshot.
//!
//!   hemoflow --config sim.json --demo duct --length 24 --width 8 \
//!            --ranks 2 --report report.json --snapshot field.json

use std::{env, fs, sync::Arc, thread};

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use hemoflow::api::{self, demo, FieldSample, FieldSnapshot};
use hemoflow::comm::RankFabric;
use hemoflow::config::{LatticeKind, SimulationConfig};
use hemoflow::domain::DomainBuilder;
use hemoflow::lattice::{D3Q15, D3Q19, D3Q27, Lattice};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn parse_usize(args: &[String], key: &str, default: usize) -> anyhow::Result<usize> {
    match parse_flag(args, key) {
        Some(s) => s.parse::<usize>().with_context(|| format!("bad value for {key}: {s}")),
        None => Ok(default),
    }
}

fn build_geometry(
    args: &[String],
    config: &SimulationConfig,
    ranks: usize,
) -> anyhow::Result<DomainBuilder> {
    let demo_kind = parse_flag(args, "--demo").unwrap_or_else(|| "duct".to_string());
    let builder = match demo_kind.as_str() {
        "cube" => {
            let size = parse_usize(args, "--size", 8)?;
            demo::uniform_cube(size, ranks)
        }
        "slab" => {
            let size = parse_usize(args, "--size", 8)?;
            match config.lattice {
                LatticeKind::D3Q15 => demo::poiseuille_slab::<D3Q15>(size, size, size, ranks),
                LatticeKind::D3Q19 => demo::poiseuille_slab::<D3Q19>(size, size, size, ranks),
                LatticeKind::D3Q27 => demo::poiseuille_slab::<D3Q27>(size, size, size, ranks),
            }
        }
        "duct" => {
            let length = parse_usize(args, "--length", 16)?;
            let width = parse_usize(args, "--width", 6)?;
            match config.lattice {
                LatticeKind::D3Q15 => demo::duct::<D3Q15>(length, width, ranks),
                LatticeKind::D3Q19 => demo::duct::<D3Q19>(length, width, ranks),
                LatticeKind::D3Q27 => demo::duct::<D3Q27>(length, width, ranks),
            }
        }
        other => anyhow::bail!("unknown demo geometry `{other}` (cube|slab|duct)"),
    };
    Ok(builder)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let config_path = parse_flag(&args, "--config")
        .context("--config <path> is required (JSON simulation document)")?;
    let text = fs::read_to_string(&config_path)
        .with_context(|| format!("read configuration {config_path}"))?;
    let config = SimulationConfig::from_json(&text)?;

    let ranks = parse_usize(&args, "--ranks", 1)?.max(1);
    let builder = Arc::new(build_geometry(&args, &config, ranks)?);
    let completed_at = chrono::Utc::now().to_rfc3339();

    tracing::info!(
        lattice = match config.lattice {
            LatticeKind::D3Q15 => D3Q15::NAME,
            LatticeKind::D3Q19 => D3Q19::NAME,
            LatticeKind::D3Q27 => D3Q27::NAME,
        },
        ranks,
        max_steps = config.max_steps,
        "starting run"
    );

    // One OS thread per rank over the in-process fabric; an MPI deployment
    // would hand each process its own communicator instead.
    let endpoints = RankFabric::endpoints(ranks);
    let mut handles = Vec::new();
    for endpoint in endpoints {
        let config = config.clone();
        let builder = Arc::clone(&builder);
        let completed_at = completed_at.clone();
        handles.push(thread::spawn(move || {
            api::run_configured(&config, &builder, Arc::new(endpoint), completed_at)
        }));
    }

    let mut rank0_report = None;
    let mut merged: Vec<FieldSample> = Vec::new();
    for (rank, handle) in handles.into_iter().enumerate() {
        let (summary, report, field) = handle
            .join()
            .map_err(|_| anyhow::anyhow!("rank {rank} panicked"))??;
        tracing::info!(
            rank,
            steps = summary.steps,
            termination = report.termination,
            stability = report.final_stability,
            "rank finished"
        );
        if rank == 0 {
            rank0_report = Some(report);
        }
        merged.extend(field.sites);
    }
    merged.sort_by_key(|s| s.coords);
    let snapshot = FieldSnapshot { sites: merged };

    if let Some(path) = parse_flag(&args, "--report") {
        let report = rank0_report.as_ref().expect("rank 0 always reports");
        fs::write(&path, serde_json::to_string_pretty(report)?)
            .with_context(|| format!("write report {path}"))?;
        tracing::info!(path = %path, "report written");
    }
    if let Some(path) = parse_flag(&args, "--snapshot") {
        fs::write(&path, serde_json::to_string_pretty(&snapshot)?)
            .with_context(|| format!("write snapshot {path}"))?;
        tracing::info!(path = %path, "snapshot written");
    }
    Ok(())
}
