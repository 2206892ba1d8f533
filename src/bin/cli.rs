// Chunkload - Resumable Encrypted Chunked Transfers
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::{bail, Context, Result};
use chunkload_core::download::preload::{BoxScanner, ScanOutcome};
use chunkload_core::download::RangeSet;
use chunkload_core::storage::PreloadFile;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chunkload-inspect")]
#[command(about = "Chunkload CLI - Inspect transfer artifacts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump the not-loaded ranges stored in a range file
    Ranges {
        /// Path to the `_64.pt` file
        path: PathBuf,
        /// Total size of the transfer
        #[arg(short, long)]
        total: u64,
    },
    /// Dump the records of a preload file
    Preload {
        /// Path to the `_64.preload` file
        path: PathBuf,
        /// Total size of the transfer
        #[arg(short, long)]
        total: u64,
        /// Largest chunk size a record may carry
        #[arg(short, long, default_value_t = 128 * 1024)]
        chunk: u64,
    },
    /// Walk the top-level boxes of a local MP4 file looking for `moov`
    Scan {
        /// Path to the media file
        path: PathBuf,
        /// Chunk size to read the file in
        #[arg(short, long, default_value_t = 128 * 1024)]
        chunk: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ranges { path, total } => {
            let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let ranges = RangeSet::from_bytes(&bytes, total)?;
            let output = json!({
                "total": total,
                "missing": ranges.total_len(),
                "ranges": ranges,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Preload { path, total, chunk } => {
            let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let file = PreloadFile::parse(&bytes, total, chunk);
            if (file.end as usize) < bytes.len() {
                tracing::warn!(
                    "{} trailing bytes after the last valid record",
                    bytes.len() - file.end as usize
                );
            }
            println!("{}", serde_json::to_string_pretty(&file)?);
        }
        Commands::Scan { path, chunk } => {
            if chunk == 0 {
                bail!("chunk size must be positive");
            }
            let output = scan(&path, chunk)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn scan(path: &PathBuf, chunk: u64) -> Result<serde_json::Value> {
    let mut file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let size = file.metadata()?.len();
    let mut scanner = BoxScanner::new();
    let mut offset = 0u64;
    let mut chunks_read = 0u64;
    let mut buf = vec![0u8; chunk as usize];

    loop {
        file.seek(SeekFrom::Start(offset))?;
        let read = read_full(&mut file, &mut buf)?;
        if read == 0 {
            return Ok(json!({ "size": size, "chunks_read": chunks_read, "moov": null }));
        }
        chunks_read += 1;
        tracing::debug!("scanning {} bytes at {}", read, offset);

        match scanner.scan(offset, &buf[..read]) {
            ScanOutcome::Found { offset: found, size: box_size } => {
                return Ok(json!({
                    "size": size,
                    "chunks_read": chunks_read,
                    "moov": { "offset": found, "size": box_size },
                    "first_half": found < size / 2,
                }));
            }
            ScanOutcome::Continue { carried: true, .. } => offset += read as u64,
            ScanOutcome::Continue { next_atom, carried: false } => offset = next_atom / chunk * chunk,
            ScanOutcome::Lost => {
                return Ok(json!({ "size": size, "chunks_read": chunks_read, "moov": null }));
            }
        }
    }
}

fn read_full(file: &mut std::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
