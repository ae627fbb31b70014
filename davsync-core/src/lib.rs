mod client;
mod multistatus;

pub use client::{ApiErrorClass, DavClient, DavError, Downloaded};
pub use multistatus::{FOLDER_CONTENT_TYPE, RemoteFile, RemoteFolder, parse_multistatus};
