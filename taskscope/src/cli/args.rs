//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "taskscope",
    about = "Build a queryable execution model from a recorded instrumentation stream",
    after_help = "\
EXAMPLES:
    taskscope trace.tsc                          Consume into ./data.db
    taskscope trace.tsc --db run1.db --source tags.yaml
    RUST_LOG=debug taskscope trace.tsc           Show per-thread progress"
)]
pub struct Args {
    /// Recorded instrumentation stream to consume
    pub trace: PathBuf,

    /// Output database
    #[arg(long, default_value = "data.db")]
    pub db: PathBuf,

    /// Tag definitions, gating defaults and conflict-ignore list
    #[arg(long, default_value = "source.yaml")]
    pub source: PathBuf,

    /// Image/file/function include and exclude patterns
    #[arg(long, default_value = "filter.yaml")]
    pub filter: PathBuf,
}
