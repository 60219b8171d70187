use super::super::ServerError;
use super::ServerGlobal;
use log::*;

pub(crate) async fn gc_main(global: std::sync::Arc<ServerGlobal>) -> Result<(), ServerError> {
    let period = global.config.gc_period;
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(period as u64)).await;
        let gc_result = gc(global.clone()).await;
        if let Err(err) = gc_result {
            error!("Garbage collector failure: {:?}", err);
        }
    }
}

/// Remove stream directories no registered session owns
pub(crate) async fn gc(global: std::sync::Arc<ServerGlobal>) -> Result<usize, ServerError> {
    info!("Running garbage collector");
    let min_age = std::time::Duration::from_secs(global.config.orphan_min_age);
    let removed = global.streams.sweep_orphans(min_age).await?;

    if removed > 0 {
        info!("Removed {} orphaned stream directories", removed);
    } else {
        info!("No orphaned stream directories to remove");
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_gc_keeps_young_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let global = global(tmp.path());
        let orphan = tmp.path().join("streams/fedcba9876543210");
        std::fs::create_dir_all(&orphan).unwrap();

        // Younger than orphan_min_age
        assert_eq!(gc(global.clone()).await.unwrap(), 0);
        assert!(orphan.is_dir());
    }
}
