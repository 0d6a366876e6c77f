mod client;
mod transfer;

pub use client::{
    ApiErrorClass, ChangeBatch, ChangeEntry, ChangeEventKind, DocsyncClient, DocsyncError,
    Document, DocumentKind, DocumentPage,
};
pub use transfer::{TransferConfig, TransferLimits};
