#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use dfs_core::{
    ByteOffset, DfsConfig, DumbFs, FileKind, PathStyle, SB_SIZE, SCRATCH_NONE, SbInfo,
    ScratchMode,
};
use dfs_flash::{FileFlash, FlashDevice};
use serde::Serialize;
use std::io::Write as _;
use std::path::PathBuf;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "dfs", about = "DumbFS — flat filesystem tooling for NAND flash images")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Flash page size in bytes.
    #[arg(long, global = true, default_value_t = 256)]
    page_size: u32,

    /// Erase-block size in bytes.
    #[arg(long, global = true, default_value_t = 4096)]
    block_size: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Create and format a fresh flash image.
    Format {
        /// Path of the image to create.
        image: PathBuf,
        /// Device size in erase blocks.
        #[arg(long, default_value_t = 64)]
        blocks: u32,
        /// Per-file capacity in bytes.
        #[arg(long, default_value_t = 8192)]
        file_size: u32,
        /// Maximum number of files.
        #[arg(long, default_value_t = 16)]
        inodes: u32,
        /// Stage rewrites through RAM instead of a reserved flash block.
        #[arg(long)]
        ram_scratch: bool,
    },
    /// Show superblock and file-table state of an image.
    Inspect {
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List files in the root directory.
    Ls { image: PathBuf },
    /// Copy a local file into the filesystem (creating the name if needed).
    Write {
        image: PathBuf,
        /// Name inside the filesystem.
        name: String,
        /// Local file to copy in.
        source: PathBuf,
        /// Byte offset inside the file's extent.
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Print a file's content to stdout.
    Cat { image: PathBuf, name: String },
    /// Grow a file to the given length.
    Truncate {
        image: PathBuf,
        name: String,
        len: u32,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    inode_count: u32,
    max_inode_count: u32,
    max_len: u32,
    free_space: u32,
    scratch_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    scratch_block: Option<u32>,
    files: Vec<FileOutput>,
}

#[derive(Debug, Serialize)]
struct FileOutput {
    ino: u32,
    path: String,
    len: u32,
    pos_start: u64,
}

// ── Image access ────────────────────────────────────────────────────────────

/// Mount an existing image, deriving the scratch mode and limits from its
/// superblock.
fn open_fs(path: &PathBuf, page_size: u32, block_size: u32) -> Result<DumbFs<FileFlash>> {
    let dev = FileFlash::open(path, page_size, block_size)
        .with_context(|| format!("open image {}", path.display()))?;

    let mut raw = [0_u8; SB_SIZE];
    dev.read_aligned(ByteOffset::ZERO, &mut raw)?;
    let sbi = SbInfo::parse(&raw).context("image does not hold a DumbFS filesystem")?;

    let scratch = if sbi.scratch_block == SCRATCH_NONE {
        ScratchMode::Ram
    } else {
        ScratchMode::ReservedBlock
    };
    let config = DfsConfig::new(
        page_size,
        block_size,
        sbi.max_len,
        sbi.max_inode_count - 1,
        scratch,
    )?;
    Ok(DumbFs::mount(dev, &config)?)
}

// ── Entry point ─────────────────────────────────────────────────────────────

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let (page_size, block_size) = (cli.page_size, cli.block_size);

    match cli.command {
        Command::Format {
            image,
            blocks,
            file_size,
            inodes,
            ram_scratch,
        } => {
            let scratch = if ram_scratch {
                ScratchMode::Ram
            } else {
                ScratchMode::ReservedBlock
            };
            let config = DfsConfig::new(page_size, block_size, file_size, inodes, scratch)?;
            let dev = FileFlash::create(&image, page_size, block_size, blocks)
                .with_context(|| format!("create image {}", image.display()))?;
            let fs = DumbFs::format(dev, &config)?;
            println!(
                "formatted {}: {} blocks of {} bytes, {} files of {} bytes max",
                image.display(),
                blocks,
                block_size,
                fs.superblock().max_inode_count - 1,
                fs.superblock().max_len
            );
            Ok(())
        }

        Command::Inspect { image, json } => {
            let fs = open_fs(&image, page_size, block_size)?;
            let sb = fs.superblock();
            let files = fs
                .read_dir()
                .map(|entry| {
                    let (name, inode) = entry?;
                    Ok(FileOutput {
                        ino: inode.ino.0,
                        path: format!("/{name}"),
                        len: inode.len,
                        pos_start: inode.pos_start.0,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let output = InspectOutput {
                inode_count: sb.inode_count,
                max_inode_count: sb.max_inode_count,
                max_len: sb.max_len,
                free_space: sb.free_space,
                scratch_mode: if sb.scratch_block == SCRATCH_NONE {
                    "ram"
                } else {
                    "reserved-block"
                },
                scratch_block: (sb.scratch_block != SCRATCH_NONE).then_some(sb.scratch_block),
                files,
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!(
                    "inodes: {}/{}  max_len: {}  free_space: {}  scratch: {}",
                    output.inode_count - 1,
                    output.max_inode_count - 1,
                    output.max_len,
                    output.free_space,
                    output.scratch_mode
                );
                for file in &output.files {
                    println!(
                        "  ino {:>3}  len {:>8}  extent @{:<10}  {}",
                        file.ino, file.len, file.pos_start, file.path
                    );
                }
            }
            Ok(())
        }

        Command::Ls { image } => {
            let fs = open_fs(&image, page_size, block_size)?;
            for entry in fs.read_dir() {
                let (_, inode) = entry?;
                println!("{}", fs.pathname(&inode, PathStyle::Full)?);
            }
            Ok(())
        }

        Command::Write {
            image,
            name,
            source,
            offset,
        } => {
            let data = std::fs::read(&source)
                .with_context(|| format!("read source {}", source.display()))?;
            let mut fs = open_fs(&image, page_size, block_size)?;

            let mut inode = match fs.lookup(&name) {
                Ok(inode) => inode,
                Err(dfs_core::DfsError::NotFound(_)) => fs.create(&name, FileKind::Regular)?,
                Err(err) => return Err(err.into()),
            };

            let written = fs.write(&inode, offset, &data)?;
            if written < data.len() {
                bail!(
                    "extent capacity clipped the write to {written} of {} bytes",
                    data.len()
                );
            }
            // Writes never grow the on-flash length; cover what we wrote.
            let end = offset + u32::try_from(written).context("write too large")?;
            if end > inode.len {
                fs.truncate(&mut inode, end)?;
            }
            println!("wrote {written} bytes to {name}");
            Ok(())
        }

        Command::Cat { image, name } => {
            let fs = open_fs(&image, page_size, block_size)?;
            let inode = fs.lookup(&name)?;
            let mut data = vec![0_u8; inode.len as usize];
            fs.read(&inode, 0, &mut data)?;
            std::io::stdout().write_all(&data)?;
            Ok(())
        }

        Command::Truncate { image, name, len } => {
            let mut fs = open_fs(&image, page_size, block_size)?;
            let mut inode = fs.lookup(&name)?;
            fs.truncate(&mut inode, len)?;
            println!("{name} is now {len} bytes");
            Ok(())
        }
    }
}
