//! A soak-test program for the wear-leveling behavior.
//!
//! This is not a unit test because a full run performs a million writes;
//! it is meant to be run by hand (optionally against a saved flash image)
//! whenever the garbage collector or the wear-leveling policy changes.
//!
//! The workload is deliberately hostile to naive wear leveling: the first
//! quarter of the device is written once and never touched again, then the
//! remaining three quarters are hammered with random writes and occasional
//! trims. A correct implementation still keeps every block's erase count
//! within the configured divergence bound.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{ensure, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use spiftl::flash::SimFlash;
use spiftl::ftl::{Ftl, LBA_BYTES, MAX_PE_DIFF};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Size of the simulated flash device, in KiB
    #[clap(long, default_value_t = 256)]
    size_kib: usize,

    /// Program granule of the simulated flash, in bytes
    #[clap(long, default_value_t = 128)]
    write_buffer: usize,

    /// Seed for the random workload
    #[clap(long, default_value_t = 12345)]
    seed: u64,

    /// Number of operations against the hot region
    #[clap(long, default_value_t = 1_000_000)]
    ops: u64,

    /// Issue a trim instead of a write every this many operations (0 = never)
    #[clap(long, default_value_t = 100)]
    trim_interval: u64,

    /// Run a consistency check every this many operations
    #[clap(long, default_value_t = 1000)]
    check_interval: u64,

    /// Path to a flash image to load before the run
    #[clap(long)]
    image: Option<PathBuf>,

    /// Write the flash image back out when done
    #[clap(long, requires = "image")]
    save: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let mut sim = SimFlash::with_write_buffer(args.size_kib * 1024, args.write_buffer);
    if let Some(path) = &args.image {
        sim.load(&mut File::open(path)?)?;
    }

    let mut ftl = Ftl::new(sim)?;
    let started = ftl.start()?;
    let lbas = ftl.lba_count();
    println!(
        "started ({started:?}): {lbas} LBAs over {} erase blocks, seed {}",
        ftl.eb_count(),
        args.seed
    );

    let mut buf = [0u8; LBA_BYTES];

    // The static region: written once, then left for the wear leveler to
    // drag along.
    for lba in 0..lbas / 4 {
        fill_tag(&mut buf, lba, 0);
        ftl.write(lba, &buf)?;
    }

    let hot = lbas - lbas / 4;
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut failed_checks = 0u64;

    let rpt = howudoin::new().label("Hot-region writes").set_len(args.ops);
    for op in 0..args.ops {
        let lba = lbas / 4 + rng.gen_range(0..hot);
        if args.trim_interval != 0 && op % args.trim_interval == 0 {
            ftl.trim(lba)?;
        } else {
            fill_tag(&mut buf, lba, op);
            ftl.write(lba, &buf)?;
        }
        if op % args.check_interval == 0 && !ftl.check() {
            failed_checks += 1;
            rpt.add_info(format!("consistency check failed at op {op}"));
        }
        rpt.inc();
    }
    rpt.close();

    ftl.persist()?;

    let mut min = u32::MAX;
    let mut max = 0u32;
    for eb in 0..ftl.eb_count() {
        let absolute = ftl.pe_count_offset() + u32::from(ftl.pe_count(eb));
        min = min.min(absolute);
        max = max.max(absolute);
        println!("{eb:5}: {absolute}");
    }
    println!(
        "pe spread {}..{} (offset {}), metadata in {:?}",
        min,
        max,
        ftl.pe_count_offset(),
        ftl.metadata_blocks(),
    );

    if args.save {
        if let Some(path) = &args.image {
            ftl.flash().save(&mut File::create(path)?)?;
        }
    }

    ensure!(failed_checks == 0, "{failed_checks} consistency checks failed");
    ensure!(
        max - min <= MAX_PE_DIFF + 1,
        "wear divergence {} exceeds the permitted {}",
        max - min,
        MAX_PE_DIFF + 1
    );
    Ok(())
}

fn fill_tag(buf: &mut [u8; LBA_BYTES], lba: u32, op: u64) {
    buf.fill(0);
    let tag = format!("lba {lba} op {op}");
    buf[..tag.len()].copy_from_slice(tag.as_bytes());
}
