//! Index statistics.
//!
//! A quick summary of what's indexed: document and chunk counts, the
//! active search backend, the embedder chain and the snapshot size. Used by
//! `vctx stats` to confirm that indexing is working as expected.

use anyhow::Result;

use crate::app::App;

/// Print a summary of the index.
pub async fn run_stats(app: &App) -> Result<()> {
    let stats = app.index.stats().await;
    let snapshot = app.vault.root().join(app.index.snapshot_path());
    let snapshot_size = std::fs::metadata(&snapshot).map(|m| m.len()).ok();

    println!("Vault Context — Index Stats");
    println!("===========================");
    println!();
    println!("  Vault:       {}", app.vault.root().display());
    println!("  Backend:     {}", stats.backend);
    println!("  Embedders:   {}", stats.embedders.join(" -> "));
    println!(
        "  Snapshot:    {} ({})",
        snapshot.display(),
        snapshot_size.map_or_else(|| "missing".to_string(), format_bytes)
    );
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  Chunks:      {}", stats.chunks);
    if stats.documents > 0 {
        println!(
            "  Per doc:     {:.1}",
            stats.chunks as f64 / stats.documents as f64
        );
    }
    println!();

    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
