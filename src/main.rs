//! `aic-sim`: drive AIC contexts from a pipeline graph without hardware.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use isp_aic::collaborators::ReferenceEncoder;
use isp_aic::kernel::{PipelineGraph, TerminalMemory};
use isp_aic::results::{ExposureResult, ResultBundle, ResultModules, StabilizationResult};
use isp_aic::stats::{
    AfGrid, DecodedStatistics, DvsStatistics, Histogram, MotionVector, RgbsBlock, RgbsGrid,
    StatsBlobWriter, StatsKind,
};
use isp_aic::{
    logging, AicConfig, AicContext, AicDirectory, Collaborators, InitParams, StatsPayload,
    StatsQuery, TerminalSizeTable, DEFAULT_CONTEXT_ID,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Mean green level the simulated auto exposure aims for.
const TARGET_LEVEL: f32 = 118.0;
const MIN_EXPOSURE_US: f32 = 100.0;
const MAX_EXPOSURE_US: f32 = 66_000.0;

#[derive(Parser, Debug)]
#[command(name = "aic-sim")]
#[command(about = "ISP parameter generation simulator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); ISPAIC_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Configure the groups of a graph and print their terminal sizes
    Sizes {
        /// Pipeline graph (TOML, `[[groups]]` records)
        #[arg(long)]
        graph: PathBuf,

        /// Print JSON instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Run fill, decode, save and kernel encoding for a number of frames
    Simulate {
        #[arg(long)]
        graph: PathBuf,

        /// Number of frames to simulate
        #[arg(long, default_value_t = 10)]
        frames: u64,

        /// Print one JSON object per frame
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AicConfig::load_from(path),
        None => AicConfig::load(),
    }
    .context("Failed to load configuration")?;
    logging::init_tracing(&config.logging)?;

    match cli.command {
        Command::Sizes { graph, json } => sizes(&config, &graph, json),
        Command::Simulate {
            graph,
            frames,
            json,
        } => simulate(&config, &graph, frames, json),
    }
}

fn load_graph(path: &Path) -> Result<PipelineGraph> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read graph {}", path.display()))?;
    let graph = PipelineGraph::from_toml_str(&text)?;
    if graph.groups.is_empty() {
        bail!("graph {} declares no groups", path.display());
    }
    info!(path = %path.display(), groups = graph.groups.len(), "Pipeline graph loaded");
    Ok(graph)
}

fn sizes(config: &AicConfig, graph_path: &Path, json: bool) -> Result<()> {
    let graph = load_graph(graph_path)?;
    let defaults = isp_aic::TuningDefaults::default();
    let mut context = AicContext::new(
        0,
        config.sizing.context_sizing(),
        &defaults,
        Collaborators::default(),
    )?;

    let mut tables: Vec<TerminalSizeTable> = Vec::with_capacity(graph.groups.len());
    for group in &graph.groups {
        let table = context
            .configure(group)
            .with_context(|| format!("Group {} rejected", group.group_id))?;
        tables.push(table);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&tables)?);
        return Ok(());
    }

    for table in &tables {
        println!("group {} ({} bytes)", table.group_id, table.total_bytes());
        println!("  {:>8} {:>8} {:<12} {:>8}", "terminal", "fragment", "type", "size");
        for entry in &table.entries {
            println!(
                "  {:>8} {:>8} {:<12} {:>8}",
                entry.terminal_index,
                entry.fragment_index,
                format!("{:?}", entry.terminal_type),
                entry.size
            );
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct FrameSummary {
    frame_id: u64,
    scene_level: u8,
    mean_green: f32,
    brightest_bin: Option<usize>,
    exposure_time_us: u32,
    converged: bool,
    groups_run: usize,
    bytes_written: usize,
}

fn simulate(config: &AicConfig, graph_path: &Path, frames: u64, json: bool) -> Result<()> {
    let graph = load_graph(graph_path)?;

    // Only the exposure kernels of the graph react to AE changes.
    let collaborators = Collaborators {
        encoder: Arc::new(exposure_encoder(&graph)),
        ..Collaborators::default()
    };

    let directory = AicDirectory::new(config.sizing.max_contexts);
    directory.init(&InitParams::from_config(config), collaborators)?;

    let result = directory.with_context(DEFAULT_CONTEXT_ID, |context| {
        for group in &graph.groups {
            let table = context.configure(group)?;
            for entry in &table.entries {
                context.register_buffer(
                    table.group_id,
                    entry.terminal_index,
                    entry.fragment_index,
                    TerminalMemory::zeroed(entry.size),
                    entry.size,
                )?;
            }
        }
        Ok(())
    });
    result.context("Failed to set up kernel groups")?;

    let stats_group = graph
        .groups
        .iter()
        .find(|g| g.stats_terminals.as_ref().is_some_and(|m| !m.is_empty()))
        .map(|g| g.group_id);
    let all_groups = u32::MAX;

    for frame_id in 0..frames {
        let summary = directory.with_context(DEFAULT_CONTEXT_ID, |context| {
            let scene_level = scene_level(frame_id);
            let previous = context.query_results(frame_id.wrapping_sub(1));

            let stats = match stats_group {
                Some(group_id) => {
                    let blob = synthetic_stats(&graph, frame_id, scene_level);
                    context.fill_statistics(frame_id, StatsPayload::new(blob).with_gains(1.0, 1.0))?;
                    let decoded = consume_statistics(context, group_id, frame_id)?;
                    Some(decoded)
                }
                None => None,
            };

            let mean_green = stats
                .as_ref()
                .and_then(|s| s.rgbs.as_ref())
                .map_or(TARGET_LEVEL, RgbsGrid::mean_green);
            let exposure = next_exposure(previous.exposure.as_deref(), mean_green);
            let mut bundle = ResultBundle::new().with_exposure(exposure.clone());
            if let Some(dvs) = stats.as_ref().and_then(|s| s.dvs.as_ref()) {
                bundle = bundle.with_stabilization(counter_motion(dvs));
            }
            context.save_results(frame_id, &bundle);

            let outputs = context.run_groups(frame_id, all_groups)?;
            Ok(FrameSummary {
                frame_id,
                scene_level,
                mean_green,
                brightest_bin: stats.as_ref().and_then(DecodedStatistics::brightest_bin),
                exposure_time_us: exposure.exposure_time_us,
                converged: exposure.converged,
                groups_run: outputs.len(),
                bytes_written: outputs.iter().map(|o| o.total_bytes()).sum(),
            })
        })?;

        if json {
            println!("{}", serde_json::to_string(&summary)?);
        } else {
            println!(
                "frame {:>4}  level {:>3}  green {:>6.1}  exposure {:>6} us{}  groups {}  bytes {}",
                summary.frame_id,
                summary.scene_level,
                summary.mean_green,
                summary.exposure_time_us,
                if summary.converged { " (converged)" } else { "" },
                summary.groups_run,
                summary.bytes_written
            );
        }
    }

    directory.deinit();
    Ok(())
}

fn exposure_encoder(graph: &PipelineGraph) -> ReferenceEncoder {
    graph
        .groups
        .iter()
        .flat_map(|g| g.kernels.iter())
        .fold(ReferenceEncoder::new(), |encoder, kernel| {
            encoder.with_dependency(kernel.uuid, ResultModules::EXPOSURE)
        })
}

/// Claim the statistics of `frame_id`, decode them and give the slot back.
fn consume_statistics(
    context: &AicContext,
    group_id: i32,
    frame_id: u64,
) -> isp_aic::AicResult<DecodedStatistics> {
    let slot = context
        .query_stats_buffer(StatsQuery::Filled, Some(frame_id))
        .ok_or_else(|| isp_aic::AicError::NotFound(format!("no statistics for frame {frame_id}")))?;
    context.claim_statistics(slot.handle)?;
    let decoded = context.decode_statistics(group_id, frame_id);
    context.release_statistics(slot.handle)?;
    debug!(frame_id, slot = slot.handle.index(), "Statistics consumed");
    decoded
}

/// Scene brightness that drifts slowly between dark and bright.
fn scene_level(frame_id: u64) -> u8 {
    let phase = (frame_id % 40) as i64;
    let tri = if phase < 20 { phase } else { 40 - phase };
    (40 + tri * 8) as u8
}

/// Statistics blob covering every statistics terminal in the graph.
fn synthetic_stats(graph: &PipelineGraph, frame_id: u64, level: u8) -> bytes::Bytes {
    let mut writer = StatsBlobWriter::new();
    let mut seen = Vec::new();

    for map in graph.groups.iter().filter_map(|g| g.stats_terminals.as_ref()) {
        for terminal in map.iter() {
            if seen.contains(&terminal.terminal_index) {
                continue;
            }
            seen.push(terminal.terminal_index);
            let Ok(index) = u8::try_from(terminal.terminal_index) else {
                continue;
            };
            writer = match terminal.kind {
                StatsKind::RgbsGrid => writer.rgbs(index, &flat_grid(level)),
                StatsKind::Histogram => writer.histogram(index, &peak_histogram(level)),
                StatsKind::AfGrid => writer.af(index, &flat_af()),
                StatsKind::Dvs => writer.dvs(index, &hand_shake(frame_id)),
            };
        }
    }
    writer.finish()
}

fn flat_grid(level: u8) -> RgbsGrid {
    let (width, height) = (16u16, 12u16);
    let block = RgbsBlock {
        r: level.saturating_sub(10),
        gr: level,
        gb: level,
        b: level.saturating_sub(20),
        saturation: 0,
    };
    RgbsGrid {
        width,
        height,
        blocks: vec![block; usize::from(width) * usize::from(height)],
    }
}

fn peak_histogram(level: u8) -> Histogram {
    let mut histogram = Histogram::default();
    let center = usize::from(level);
    for bin in center.saturating_sub(8)..=(center + 8).min(histogram.bins.len() - 1) {
        histogram.bins[bin] = 1000;
    }
    histogram
}

fn flat_af() -> AfGrid {
    let cells = 8 * 6;
    AfGrid {
        width: 8,
        height: 6,
        filter_response_1: vec![512; cells],
        filter_response_2: vec![256; cells],
    }
}

/// Uniform motion alternating left and right, as from a shaking hand.
fn hand_shake(frame_id: u64) -> DvsStatistics {
    let dx = if frame_id % 2 == 0 { 3 } else { -3 };
    let vectors = (0..8i16)
        .flat_map(|y| (0..8i16).map(move |x| MotionVector { x, y, dx, dy: 1 }))
        .collect();
    DvsStatistics { vectors }
}

/// Crop offset cancelling the mean motion of the frame.
fn counter_motion(dvs: &DvsStatistics) -> StabilizationResult {
    let (dx, dy) = dvs.mean_motion();
    StabilizationResult {
        offset_x: -dx.round() as i32,
        offset_y: -dy.round() as i32,
        ..StabilizationResult::default()
    }
}

/// Proportional exposure update towards [`TARGET_LEVEL`].
fn next_exposure(previous: Option<&ExposureResult>, mean_green: f32) -> ExposureResult {
    let previous = previous.cloned().unwrap_or_default();
    let ratio = TARGET_LEVEL / mean_green.max(1.0);
    let time = (previous.exposure_time_us as f32 * ratio).clamp(MIN_EXPOSURE_US, MAX_EXPOSURE_US);
    let exposure_time_us = time.round() as u32;
    let total = exposure_time_us as f32 * previous.analog_gain * previous.digital_gain;

    ExposureResult {
        exposure_time_us,
        total_target_exposure: total.round() as u32,
        converged: (ratio - 1.0).abs() < 0.05,
        ..previous
    }
}
