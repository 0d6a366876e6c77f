use super::store::{ChangeKind, ItemKind, PairRecord};

/// The single side effect the processor performs for a claimed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// `create` is false when the remote document already exists.
    Upload { create: bool },
    Download,
    CreateRemoteFolder,
    CreateLocalFolder,
    DeleteRemote,
    DeleteLocal,
    MoveRemote,
    RenameLocal,
    /// Both sides are gone; the record is dropped.
    Forget,
    /// Nothing to transfer, only pending hints to clear.
    Settle,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Upload { create: true } => "upload-new",
            Operation::Upload { create: false } => "upload",
            Operation::Download => "download",
            Operation::CreateRemoteFolder => "create-remote-folder",
            Operation::CreateLocalFolder => "create-local-folder",
            Operation::DeleteRemote => "delete-remote",
            Operation::DeleteLocal => "delete-local",
            Operation::MoveRemote => "move-remote",
            Operation::RenameLocal => "rename-local",
            Operation::Forget => "forget",
            Operation::Settle => "settle",
        }
    }
}

/// Picks the next operation for a record. Placement changes go before
/// content; a local edit wins over a remote delete and a remote edit wins
/// over a local delete.
pub fn plan(record: &PairRecord) -> Operation {
    let folder = record.kind == ItemKind::Folder;
    let remote_content = record.remote_change.is_some_and(|c| c.is_content());
    let local_content = record.local_change.is_some_and(|c| c.is_content());

    match (&record.local_path, &record.remote_id) {
        (None, None) => return Operation::Forget,
        (None, Some(_)) => {
            return match record.remote_change {
                Some(ChangeKind::Deleted) => Operation::Forget,
                _ if record.local_change == Some(ChangeKind::Deleted) && !remote_content => {
                    Operation::DeleteRemote
                }
                _ if folder => Operation::CreateLocalFolder,
                _ => Operation::Download,
            };
        }
        (Some(_), None) => {
            return if folder {
                Operation::CreateRemoteFolder
            } else {
                Operation::Upload { create: true }
            };
        }
        (Some(_), Some(_)) => {}
    }

    if record.remote_change == Some(ChangeKind::Deleted) {
        return if record.has_local_edits() {
            Operation::Upload { create: true }
        } else {
            Operation::DeleteLocal
        };
    }
    if record.local_change == Some(ChangeKind::Moved) {
        return Operation::MoveRemote;
    }
    if record.remote_change == Some(ChangeKind::Moved) {
        return Operation::RenameLocal;
    }
    if !folder && local_content {
        return Operation::Upload { create: false };
    }
    if !folder && remote_content {
        return Operation::Download;
    }
    Operation::Settle
}
