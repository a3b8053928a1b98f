mod client;

pub use client::{
    ApiErrorClass, ChangePage, ExportFormat, RemoteFile, SourceClient, SourceError, TransferLink,
    classify_api_status,
};
