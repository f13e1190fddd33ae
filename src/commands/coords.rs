use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::CoordsArgs;
use crate::commands::ingest::locate_coordinates;

#[derive(Debug, Serialize)]
struct CoordsLine {
    path: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    error: Option<String>,
}

impl CoordsLine {
    fn extract(path: &Path) -> Self {
        match locate_coordinates(path) {
            Ok(pair) => Self {
                path: path.display().to_string(),
                latitude: Some(pair.latitude),
                longitude: Some(pair.longitude),
                error: None,
            },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "coordinates unavailable");
                Self {
                    path: path.display().to_string(),
                    latitude: None,
                    longitude: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}

pub fn run(args: CoordsArgs) -> Result<()> {
    let lines: Vec<CoordsLine> = args.paths.iter().map(|path| CoordsLine::extract(path)).collect();

    let mut output = io::BufWriter::new(io::stdout().lock());
    for line in &lines {
        if args.json {
            serde_json::to_writer(&mut output, line)
                .context("failed to serialize coordinates json output")?;
            writeln!(output)?;
            continue;
        }

        match (line.latitude, line.longitude) {
            (Some(latitude), Some(longitude)) => {
                writeln!(output, "{}\t{latitude}\t{longitude}", line.path)?
            }
            _ => writeln!(output, "{}\t-\t-", line.path)?,
        }
    }
    output.flush()?;

    let found = lines.iter().filter(|line| line.error.is_none()).count();
    info!(requested = lines.len(), found, "coordinate extraction finished");
    Ok(())
}
