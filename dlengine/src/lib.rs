pub mod engine;
pub mod eta;
pub mod gid;
pub mod http_download;
