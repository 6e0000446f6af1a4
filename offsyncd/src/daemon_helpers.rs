fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

/// Any HTTP answer, even an error status, means the backend is reachable.
fn is_reachable(result: &Result<(), BackendError>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => !err.is_connectivity(),
    }
}

async fn probe_backend(client: &CollectionClient) -> bool {
    let result = client.ping().await;
    if let Err(err) = &result
        && !err.is_connectivity()
    {
        warn!("backend reachable but ping failed: {err}");
    }
    is_reachable(&result)
}

async fn run_worker_pass(engine: &OfflineEngine) {
    if !engine.network().is_online() {
        return;
    }
    match engine.process_sync_queue().await {
        Ok(report) if report.attempted > 0 => debug!(
            succeeded = report.succeeded,
            retried = report.retried,
            dropped = report.dropped,
            "worker: sync pass"
        ),
        Ok(_) => {}
        Err(err) => error!("worker: sync pass failed: {err}"),
    }
    match engine.process_actions().await {
        Ok(report) if report.attempted > 0 => debug!(
            succeeded = report.succeeded,
            requeued = report.requeued,
            dropped = report.dropped,
            "worker: action pass"
        ),
        Ok(_) => {}
        Err(err) => error!("worker: action pass failed: {err}"),
    }
}

fn describe_reconnect(report: &ReconnectReport) -> String {
    format!(
        "back online: replayed={} retried={} dropped={} actions={} validated={} invalidated={}",
        report.sync.succeeded,
        report.sync.retried,
        report.sync.dropped + report.actions.dropped,
        report.actions.succeeded,
        report.validation.checked,
        report.validation.invalidated,
    )
}
