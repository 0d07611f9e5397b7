use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::sync::Arc;

use taskscope::cli::Args;
use taskscope::config::SourceConfig;
use taskscope::filter::Filter;
use taskscope::runtime::{self, Manager};
use taskscope::storage::SqlWriter;
use taskscope::trace::{loader, TraceReader};

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let source = SourceConfig::load(&args.source)
        .with_context(|| format!("loading {}", args.source.display()))?;
    let filter = Filter::load(&args.filter)
        .with_context(|| format!("loading {}", args.filter.display()))?;

    let writer = Arc::new(
        SqlWriter::open(&args.db)
            .with_context(|| format!("opening database {}", args.db.display()))?,
    );
    // One exclusive transaction spans the whole run.
    writer.begin();

    let mut reader = TraceReader::open(&args.trace)
        .with_context(|| format!("opening trace {}", args.trace.display()))?;
    let raw_tables = reader.read_tables().context("reading cross-reference tables")?;
    let tables = loader::load_tables(&raw_tables, &writer, &filter)
        .context("resolving cross-reference tables")?;

    let manager = Arc::new(Manager::new(Arc::clone(&writer), &source, tables));

    info!("consuming {}", args.trace.display());
    runtime::consume_trace(&mut reader, &manager).context("consuming record stream")?;

    writer.commit();
    info!("model written to {}", args.db.display());

    Ok(())
}
