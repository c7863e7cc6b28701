/// Extent map and free-space dump for one file
/// Shows what the defragmenter would see before it moves anything
use anyhow::Context;
use ntfs_compactor::defrag::bitmap::{first_fit, read_free_runs};
use ntfs_compactor::defrag::extents::read_extents;
use ntfs_compactor::format::file_length;
use ntfs_compactor::platform::{CompressionBackend, DefragBackend, NativeBackend};
use std::path::PathBuf;

const LARGEST_RUNS: usize = 10;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ntfs_compactor=info".parse()?),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: debug-extents <file>")?;

    let backend = NativeBackend::default();
    let cluster = backend.cluster_size(&path)?;

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║        NTFS-COMPACTOR EXTENT DUMP                           ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Target:  {}", path.display());
    println!("Cluster: {}", file_length(cluster.bytes(), 0));
    println!();

    // === EXTENTS ===
    println!("┌─ FILE EXTENTS ─────────────────────────────────────────────┐");
    let file = backend
        .open_file_for_query(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    let extents = read_extents(&backend, &file)?;
    for run in extents.runs() {
        match run.lcn {
            Some(lcn) => println!(
                "  vcn {:>12}  lcn {:>12}  {:>10} clusters",
                run.vcn, lcn, run.clusters
            ),
            None => println!("  vcn {:>12}  {:>16}  {:>10} clusters", run.vcn, "(sparse)", run.clusters),
        }
    }
    println!(
        "  {} fragments, {} allocated ({})",
        extents.fragments(),
        extents.allocated_clusters(),
        file_length(extents.allocated_clusters() * cluster.bytes(), 2)
    );
    println!(
        "  {} movable",
        if backend.open_file_for_move(&path).is_ok() { "✓" } else { "✗ not" }
    );
    println!("└────────────────────────────────────────────────────────────┘");
    println!();

    // === FREE SPACE ===
    println!("┌─ VOLUME FREE SPACE ────────────────────────────────────────┐");
    let start = std::time::Instant::now();
    let volume = backend
        .open_volume(&path)
        .context("opening volume (needs administrator rights)")?;
    let runs = read_free_runs(&backend, &volume)?;
    let free: u64 = runs.iter().map(|r| r.length).sum();
    println!("  ✓ Bitmap read in {:.2}s", start.elapsed().as_secs_f64());
    println!("  ✓ {} free runs, {}", runs.len(), file_length(free * cluster.bytes(), 2));

    let mut largest = runs.clone();
    largest.sort_by(|a, b| b.length.cmp(&a.length));
    for run in largest.iter().take(LARGEST_RUNS) {
        println!("  lcn {:>12}  {:>10} clusters", run.start, run.length);
    }

    let needed = extents.allocated_clusters();
    match first_fit(&runs, needed) {
        Some(run) if !extents.is_contiguous() => {
            println!("  → would relocate {} clusters to lcn {}", needed, run.start)
        }
        Some(_) => println!("  → already contiguous, nothing to do"),
        None => println!("  ✗ no free run of {} clusters", needed),
    }
    println!("└────────────────────────────────────────────────────────────┘");

    Ok(())
}
