//! Read-only inspector for the durable vacuum stores.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use reclaim::admin::{inspect, InspectReport};
use reclaim::logging::init_logging;
use reclaim::types::page::DEFAULT_PAGE_SIZE;

#[derive(Parser, Debug)]
#[command(
    name = "reclaim-inspect",
    version,
    about = "Dump vacuum data and dropped files stores"
)]
struct Cli {
    #[arg(value_name = "DATA", help = "Vacuum data store file")]
    data: PathBuf,

    #[arg(long, value_name = "FILE", help = "Dropped files store file")]
    dropped: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE, help = "Page size of both stores")]
    page_size: u32,

    #[arg(
        long,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format"
    )]
    format: OutputFormat,

    #[arg(
        long,
        env = "RECLAIM_LOG",
        default_value = "warn",
        help = "Log filter directive"
    )]
    log_level: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let report = inspect(&cli.data, cli.dropped.as_deref(), cli.page_size)?;
    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_text(&report),
    }
    Ok(())
}

fn print_text(report: &InspectReport) {
    println!(
        "Vacuum data: page_size={} used_pages={} live_entries={} first_blockid={} last_blockid={}",
        report.page_size,
        report.data_used_pages,
        report.live_entries,
        fmt_block(report.first_blockid.map(|b| b.0)),
        fmt_block(report.last_blockid.map(|b| b.0)),
    );
    for page in &report.data_pages {
        println!(
            "  page {} window=[{}, {}) entries={}",
            page.page.0,
            page.first_unvacuumed,
            page.first_free,
            page.entries.len()
        );
        for entry in &page.entries {
            println!(
                "    block {} {:?}{} start={} ids=[{}, {}]",
                entry.blockid.0,
                entry.status,
                if entry.was_interrupted { " interrupted" } else { "" },
                entry.start_lsa,
                entry.oldest_mvccid.0,
                entry.newest_mvccid.0
            );
        }
    }
    if let Some(dropped) = &report.dropped {
        println!("Dropped files: {}", dropped.len());
        for row in dropped {
            println!("  file {} dropped at {} (page {})", row.file.0, row.mvccid.0, row.page.0);
        }
    }
}

fn fmt_block(block: Option<u64>) -> String {
    block.map_or_else(|| "-".to_string(), |b| b.to_string())
}
