//! `blockflow tools`: maintenance commands over on-disk module state.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use blockflow_core::block::parse_state_filename;
use blockflow_core::orchestrator::list_snapshots;
use blockflow_dstore::{FsStore, ObjectStore};

/// Walk a module's partial segments and report the first hole.
pub async fn check(store_path: &Path) -> Result<()> {
    let objects: Arc<dyn ObjectStore> = Arc::new(
        FsStore::new(store_path)
            .with_context(|| format!("opening store {}", store_path.display()))?,
    );
    let snapshots = list_snapshots(&objects).await?;

    let mut previous: Option<blockflow_core::Range> = None;
    for current in snapshots.partials.iter() {
        if let Some(previous) = previous {
            if current.start_block != previous.exclusive_end_block {
                return Err(anyhow!(
                    "**hole found** between {} and {}",
                    previous.exclusive_end_block,
                    current.start_block
                ));
            }
        }
        previous = Some(*current);
    }

    println!(
        "ok: {} complete segment(s), {} contiguous partial segment(s)",
        snapshots.completes.len(),
        snapshots.partials.len()
    );
    Ok(())
}

/// Print the contents of one state segment file.
pub async fn read_store(store_path: &Path, segment: &str, keys: &[String]) -> Result<()> {
    let info = parse_state_filename(segment)?;
    let objects = FsStore::new(store_path)
        .with_context(|| format!("opening store {}", store_path.display()))?;
    let content = objects.open(segment).await?;
    let kv: std::collections::BTreeMap<String, String> =
        serde_json::from_slice(&content).with_context(|| format!("parsing {}", segment))?;

    println!(
        "{} segment {} ({} keys)",
        if info.partial { "partial" } else { "full" },
        info.range,
        kv.len()
    );
    for (key, encoded) in kv {
        if !keys.is_empty() && !keys.contains(&key) {
            continue;
        }
        println!("{} = {}", key, decode_printable(&encoded));
    }
    Ok(())
}

/// Stored values are base64; show text values directly, others as hex.
fn decode_printable(encoded: &str) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    match STANDARD.decode(encoded.as_bytes()) {
        Ok(bytes) => match std::str::from_utf8(&bytes) {
            Ok(text) if text.chars().all(|c| !c.is_control()) => text.to_string(),
            _ => format!("0x{}", hex::encode(&bytes)),
        },
        Err(_) => encoded.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_detects_holes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0000000200-0000000100.partial"), b"{}").unwrap();
        std::fs::write(dir.path().join("0000000300-0000000200.partial"), b"{}").unwrap();
        check(dir.path()).await.unwrap();

        std::fs::write(dir.path().join("0000000500-0000000400.partial"), b"{}").unwrap();
        let err = check(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("hole found"));
    }

    #[tokio::test]
    async fn read_store_prints_segment() {
        let dir = tempfile::tempdir().unwrap();
        let body = serde_json::json!({"alice": "MTA=", "bob": "MjA="});
        std::fs::write(
            dir.path().join("0000000100-0000000000.kv"),
            serde_json::to_vec(&body).unwrap(),
        )
        .unwrap();

        read_store(dir.path(), "0000000100-0000000000.kv", &[]).await.unwrap();
        read_store(dir.path(), "0000000100-0000000000.kv", &["alice".to_string()])
            .await
            .unwrap();
        assert!(read_store(dir.path(), "nonsense.kv", &[]).await.is_err());
    }
}
