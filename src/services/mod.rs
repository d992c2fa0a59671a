mod curtain;
mod downloader;

pub use curtain::{CurtainApi, DatasetDto, FilterListDto};
pub use downloader::{Downloader, ProgressFn, CHUNK_SIZE};
