use std::path::PathBuf;

use bytes::Bytes;
use futures::{StreamExt, stream};
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::server::{
    error::{AppResult, Error},
    services::prefetch_services::SegmentStream,
    utils::UpstreamHeaders,
};

/// most the reader hands out per pull
pub const READ_CHUNK_CEILING: usize = 512 * 1024;

const TEMP_PREFIX: &str = "segment-relay-";

#[derive(Debug, Clone)]
enum WriterState {
    Writing,
    Done,
    Failed(Error),
}

#[derive(Debug, Clone)]
struct RelayProgress {
    written: u64,
    state: WriterState,
}

impl RelayProgress {
    fn is_terminal(&self) -> bool {
        !matches!(self.state, WriterState::Writing)
    }
}

/// resolves once the download produced its first byte or ended, so headers aren't sent for an
/// upstream that's dead on arrival
pub struct ReadySignal {
    progress: watch::Receiver<RelayProgress>,
}

impl ReadySignal {
    pub async fn ready(mut self) -> AppResult<()> {
        let progress = self
            .progress
            .wait_for(|p| p.written > 0 || p.is_terminal())
            .await
            .map_err(|_| {
                Error::InternalServerErrorWithContext("relay writer stopped unexpectedly".into())
            })?;

        match &progress.state {
            WriterState::Failed(e) if progress.written == 0 => Err(e.clone()),
            _ => Ok(()),
        }
    }
}

pub struct RelayCacheService {
    http: reqwest::Client,
    cache_dir: PathBuf,
}

impl RelayCacheService {
    pub fn new(http: reqwest::Client, cache_dir: PathBuf) -> Self {
        Self { http, cache_dir }
    }

    pub fn cache_dir(&self) -> &std::path::Path {
        &self.cache_dir
    }

    /// kicks off the background download into a private temp file and returns the reader side
    pub fn start(
        &self,
        segments: Vec<Url>,
        headers: UpstreamHeaders,
        cancel: CancellationToken,
    ) -> AppResult<(SegmentStream, ReadySignal)> {
        let named = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(".ts")
            .tempfile_in(&self.cache_dir)?;
        let writer = File::from_std(named.reopen()?);
        let reader = File::from_std(named.reopen()?);
        let temp_path = named.into_temp_path();

        info!(
            "disk relay for {} segments buffering into {}",
            segments.len(),
            temp_path.display()
        );

        let (progress_tx, progress_rx) = watch::channel(RelayProgress {
            written: 0,
            state: WriterState::Writing,
        });

        let writer_task = tokio::spawn(write_segments(
            self.http.clone(),
            segments,
            headers,
            writer,
            progress_tx,
            cancel.clone(),
        ));

        let relay = RelayReader {
            reader: Some(reader),
            temp_path: Some(temp_path),
            progress: progress_rx.clone(),
            writer_task: Some(writer_task),
            cancel,
            read_offset: 0,
        };

        let stream: SegmentStream = Box::pin(
            stream::unfold(relay, |mut relay| async move {
                relay.next_chunk().await.map(|item| (item, relay))
            })
            .fuse(),
        );

        Ok((
            stream,
            ReadySignal {
                progress: progress_rx,
            },
        ))
    }
}

async fn write_segments(
    http: reqwest::Client,
    segments: Vec<Url>,
    headers: UpstreamHeaders,
    mut file: File,
    progress: watch::Sender<RelayProgress>,
    cancel: CancellationToken,
) {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = download_into(&http, &segments, &headers, &mut file, &progress) => result,
    };

    match &result {
        Ok(()) => debug!("disk relay writer finished"),
        Err(Error::Cancelled) => debug!("disk relay writer cancelled"),
        Err(e) => error!("disk relay writer failed: {}", e),
    }

    progress.send_modify(|p| {
        p.state = match result {
            Ok(()) => WriterState::Done,
            Err(e) => WriterState::Failed(e),
        }
    });
}

async fn download_into(
    http: &reqwest::Client,
    segments: &[Url],
    headers: &UpstreamHeaders,
    file: &mut File,
    progress: &watch::Sender<RelayProgress>,
) -> AppResult<()> {
    for (index, url) in segments.iter().enumerate() {
        let response = http
            .get(url.clone())
            .headers(headers.for_target(url))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamFetchFailed {
                status: status.as_u16(),
            });
        }

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            // the reader uses its own handle, bytes have to reach the os before we announce them
            file.flush().await?;
            progress.send_modify(|p| p.written += chunk.len() as u64);
        }
        debug!("segment {} written to disk relay", index);
    }
    Ok(())
}

struct RelayReader {
    reader: Option<File>,
    temp_path: Option<TempPath>,
    progress: watch::Receiver<RelayProgress>,
    writer_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    read_offset: u64,
}

impl RelayReader {
    /// stops the writer and removes the temp file, safe to call any number of times
    fn finish(&mut self) {
        let Some(temp_path) = self.temp_path.take() else {
            return;
        };
        self.cancel.cancel();
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
        self.reader = None;

        let shown = temp_path.display().to_string();
        match temp_path.close() {
            Ok(()) => debug!("removed disk relay file {}", shown),
            Err(e) => error!("failed to remove disk relay file {}: {}", shown, e),
        }
    }

    async fn next_chunk(&mut self) -> Option<AppResult<Bytes>> {
        loop {
            if self.temp_path.is_none() {
                return None;
            }
            if self.cancel.is_cancelled() {
                warn!("client went away, dropping disk relay");
                self.finish();
                return None;
            }

            let progress = self.progress.borrow_and_update().clone();

            if let WriterState::Failed(e) = progress.state {
                self.finish();
                return match e {
                    Error::Cancelled => None,
                    e => Some(Err(e)),
                };
            }

            if self.read_offset < progress.written {
                let available = progress.written - self.read_offset;
                let len = available.min(READ_CHUNK_CEILING as u64) as usize;
                let mut buf = vec![0u8; len];

                let Some(reader) = self.reader.as_mut() else {
                    return None;
                };
                if let Err(e) = reader.read_exact(&mut buf).await {
                    error!("disk relay read failed at {}: {}", self.read_offset, e);
                    self.finish();
                    return Some(Err(e.into()));
                }
                self.read_offset += len as u64;
                return Some(Ok(Bytes::from(buf)));
            }

            if let WriterState::Done = progress.state {
                info!("disk relay delivered {} bytes", self.read_offset);
                self.finish();
                return None;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!("client went away, dropping disk relay");
                    self.finish();
                    return None;
                }
                changed = self.progress.changed() => {
                    if changed.is_err() {
                        self.finish();
                        return Some(Err(Error::InternalServerErrorWithContext(
                            "relay writer stopped unexpectedly".into(),
                        )));
                    }
                }
            }
        }
    }
}

impl Drop for RelayReader {
    fn drop(&mut self) {
        self.finish();
    }
}
