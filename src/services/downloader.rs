use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::Client;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};

/// Size of each write to the destination file.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Receives download progress as a percentage.
pub type ProgressFn = dyn Fn(u8) + Send + Sync;

/// Percentages reported while a download runs: 0 on start, 10 once the
/// headers arrive, then 10..=100 by bytes written. Without a content length
/// nothing is reported between 10 and 100.
struct Progress<'a> {
    sink: Option<&'a ProgressFn>,
    total: Option<u64>,
    written: u64,
    last: Option<u8>,
}

impl<'a> Progress<'a> {
    fn new(sink: Option<&'a ProgressFn>) -> Self {
        Self {
            sink,
            total: None,
            written: 0,
            last: None,
        }
    }

    fn emit(&mut self, percent: u8) {
        if self.last == Some(percent) {
            return;
        }
        self.last = Some(percent);
        if let Some(sink) = self.sink {
            sink(percent);
        }
    }

    fn started(&mut self) {
        self.emit(0);
    }

    fn headers(&mut self, total: Option<u64>) {
        self.total = total;
        self.emit(10);
    }

    fn advance(&mut self, bytes: usize) {
        self.written += bytes as u64;
        if let Some(total) = self.total {
            let scaled = (self.written.min(total) * 90 / total) as u8;
            self.emit(10 + scaled);
        }
    }

    fn finished(&mut self) {
        self.emit(100);
    }
}

/// Streams large payloads from fully-qualified addresses straight to disk.
/// Requests go out directly, not through the API pipeline.
pub struct Downloader {
    client: Client,
}

impl Downloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn download_to_path(
        &self,
        url: &str,
        destination: &Path,
        on_progress: Option<&ProgressFn>,
    ) -> Result<PathBuf> {
        let mut progress = Progress::new(on_progress);
        progress.started();

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::transfer(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::transfer(format!("{} returned {}", url, status)));
        }

        let total = response.content_length();
        if total == Some(0) {
            return Err(AppError::transfer(format!("{} returned an empty body", url)));
        }
        progress.headers(total);

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(destination).await?;

        let copied = copy_body(response, &mut file, &mut progress).await;
        let written = match copied {
            Ok(written) => written,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(destination).await;
                return Err(e);
            }
        };

        if written == 0 {
            drop(file);
            let _ = tokio::fs::remove_file(destination).await;
            return Err(AppError::transfer(format!("{} returned an empty body", url)));
        }

        progress.finished();
        tracing::debug!("Downloaded {} bytes to {}", written, destination.display());
        Ok(destination.to_path_buf())
    }
}

async fn copy_body(
    response: reqwest::Response,
    file: &mut File,
    progress: &mut Progress<'_>,
) -> Result<u64> {
    let mut stream = response.bytes_stream();
    let mut pending: Vec<u8> = Vec::with_capacity(CHUNK_SIZE * 2);
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AppError::transfer(e.to_string()))?;
        pending.extend_from_slice(&chunk);

        while pending.len() >= CHUNK_SIZE {
            file.write_all(&pending[..CHUNK_SIZE]).await?;
            pending.drain(..CHUNK_SIZE);
            written += CHUNK_SIZE as u64;
            progress.advance(CHUNK_SIZE);
        }
    }

    if !pending.is_empty() {
        file.write_all(&pending).await?;
        written += pending.len() as u64;
        progress.advance(pending.len());
    }
    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<u8>>>, impl Fn(u8) + Send + Sync) {
        let events = Arc::new(Mutex::new(Vec::<u8>::new()));
        let sink = {
            let events = events.clone();
            move |p: u8| events.lock().unwrap().push(p)
        };
        (events, sink)
    }

    #[test]
    fn unknown_length_reports_milestones_only() {
        let (events, sink) = recorder();
        let mut progress = Progress::new(Some(&sink));
        progress.started();
        progress.headers(None);
        for _ in 0..5 {
            progress.advance(2_000);
        }
        progress.finished();
        assert_eq!(*events.lock().unwrap(), vec![0, 10, 100]);
    }

    #[test]
    fn known_length_interpolates() {
        let (events, sink) = recorder();
        let mut progress = Progress::new(Some(&sink));
        progress.started();
        progress.headers(Some(1_000));
        progress.advance(500);
        progress.advance(500);
        progress.finished();
        assert_eq!(*events.lock().unwrap(), vec![0, 10, 55, 100]);
    }
}
