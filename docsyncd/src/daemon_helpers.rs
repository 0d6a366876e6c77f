fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_state_db() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("docsync")
        .join("state.db")
}

fn read_u64<F>(var: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

/// Like [`read_u64`], but values that do not fit `T` are rejected.
fn read_count<T, F>(var: &F, name: &'static str, default: u64) -> Result<T, ConfigError>
where
    T: TryFrom<u64>,
    F: Fn(&str) -> Option<String>,
{
    let value = read_u64(var, name, default);
    T::try_from(value).map_err(|_| ConfigError::Invalid {
        name,
        reason: format!("{value} is out of range"),
    })
}

fn read_bool<F>(var: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|value| {
            matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|part| part.trim().to_ascii_lowercase())
        .filter(|part| !part.is_empty())
        .collect()
}

fn summary_line(counts: &StoreCounts, last_error: Option<&str>) -> String {
    let headline = if counts.errors > 0 {
        format!("{} items failed", counts.errors)
    } else if counts.unsynchronized() > 0 || counts.claimed > 0 {
        "syncing".to_string()
    } else {
        "up to date".to_string()
    };
    let mut line = format!(
        "{headline}: total={}, pending={}, conflicted={}, errors={}",
        counts.total, counts.pending, counts.conflicted, counts.errors
    );
    if let Some(err) = last_error.filter(|_| counts.errors > 0 || counts.conflicted > 0) {
        line.push_str(&format!(", last error: {err}"));
    }
    line
}

fn log_status(status: &EngineStatus) {
    let line = summary_line(&status.counts, status.last_error.as_deref());
    if status.counts.errors > 0 {
        tracing::warn!(state = %status.state, backlog = status.backlog, "{line}");
    } else {
        tracing::info!(state = %status.state, backlog = status.backlog, "{line}");
    }
}
