use std::path::Path;

use notify::{
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};

use super::local_fs::{EventSink, RawLocalEvent};
use super::paths;

pub fn start_notify_watcher(root: &Path, sink: EventSink) -> notify::Result<RecommendedWatcher> {
    let watch_root = root.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for local in map_event(&watch_root, event) {
                sink.send(local);
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "watcher error, requesting rescan");
            sink.send(RawLocalEvent::Rescan(paths::ROOT.to_string()));
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

fn map_event(root: &Path, event: Event) -> Vec<RawLocalEvent> {
    if event.need_rescan() {
        return vec![RawLocalEvent::Rescan(paths::ROOT.to_string())];
    }
    match event.kind {
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => rel_paths(root, &event)
                .map(RawLocalEvent::Deleted)
                .collect(),
            RenameMode::To => rel_paths(root, &event)
                .map(RawLocalEvent::Created)
                .collect(),
            _ => {
                if event.paths.len() >= 2 {
                    let from = paths::to_rel(root, &event.paths[0]);
                    let to = paths::to_rel(root, &event.paths[1]);
                    return match (from, to) {
                        (Some(from), Some(to)) => vec![RawLocalEvent::Moved { from, to }],
                        (None, Some(to)) => vec![RawLocalEvent::Created(to)],
                        (Some(from), None) => vec![RawLocalEvent::Deleted(from)],
                        (None, None) => Vec::new(),
                    };
                }
                // Single-path rename notifications do not say which side they are.
                rel_paths(root, &event)
                    .map(RawLocalEvent::Rescan)
                    .collect()
            }
        },
        // Extended attribute writes (our own tags) are not content changes.
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Create(_) => rel_paths(root, &event)
            .map(RawLocalEvent::Created)
            .collect(),
        EventKind::Modify(_) => rel_paths(root, &event)
            .map(RawLocalEvent::Modified)
            .collect(),
        EventKind::Remove(_) => rel_paths(root, &event)
            .map(RawLocalEvent::Deleted)
            .collect(),
        _ => Vec::new(),
    }
}

fn rel_paths<'a>(root: &'a Path, event: &'a Event) -> impl Iterator<Item = String> + 'a {
    event
        .paths
        .iter()
        .filter_map(move |path| paths::to_rel(root, path))
        .filter(|path| path != paths::ROOT)
}
