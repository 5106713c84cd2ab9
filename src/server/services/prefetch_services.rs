use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::server::{
    error::{AppResult, Error},
    utils::UpstreamHeaders,
};

/// what every relay strategy hands back to the controller as the response body
pub type SegmentStream = Pin<Box<dyn Stream<Item = AppResult<Bytes>> + Send>>;

type BodyStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

async fn open_segment(
    http: &reqwest::Client,
    url: &Url,
    headers: &UpstreamHeaders,
) -> AppResult<reqwest::Response> {
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
    Ok(response)
}

/// whole segment body, kept as the chunks it arrived in
async fn fetch_segment(
    http: reqwest::Client,
    url: Url,
    headers: UpstreamHeaders,
) -> AppResult<Vec<Bytes>> {
    let response = open_segment(&http, &url, &headers).await?;
    let mut body = response.bytes_stream();
    let mut chunks = Vec::new();
    while let Some(chunk) = body.next().await {
        chunks.push(chunk?);
    }
    debug!("segment {} buffered ({} chunks)", url, chunks.len());
    Ok(chunks)
}

pub struct PrefetchService {
    http: reqwest::Client,
    concurrency: usize,
}

impl PrefetchService {
    pub fn new(http: reqwest::Client, concurrency: usize) -> Self {
        Self {
            http,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// up to `concurrency` segments download at once, bytes still come out in playlist order
    pub fn stream(
        &self,
        segments: Vec<Url>,
        headers: UpstreamHeaders,
        cancel: CancellationToken,
    ) -> SegmentStream {
        info!(
            "prefetching {} segments with concurrency {}",
            segments.len(),
            self.concurrency
        );
        let scheduler = PrefetchScheduler {
            http: self.http.clone(),
            segments,
            headers,
            cancel,
            concurrency: self.concurrency,
            next_to_fetch: 0,
            next_to_emit: 0,
            in_flight: JoinSet::new(),
            buffered: BTreeMap::new(),
            ready: VecDeque::new(),
            finished: false,
        };

        Box::pin(
            stream::unfold(scheduler, |mut scheduler| async move {
                scheduler.next_chunk().await.map(|item| (item, scheduler))
            })
            .fuse(),
        )
    }

    /// one segment at a time, chunks go out the moment they arrive
    pub fn passthrough(
        &self,
        segments: Vec<Url>,
        headers: UpstreamHeaders,
        cancel: CancellationToken,
    ) -> SegmentStream {
        info!("relaying {} segments sequentially", segments.len());
        let relay = SequentialRelay {
            http: self.http.clone(),
            segments,
            headers,
            cancel,
            next: 0,
            current: None,
            finished: false,
        };

        Box::pin(
            stream::unfold(relay, |mut relay| async move {
                relay.next_chunk().await.map(|item| (item, relay))
            })
            .fuse(),
        )
    }
}

struct PrefetchScheduler {
    http: reqwest::Client,
    segments: Vec<Url>,
    headers: UpstreamHeaders,
    cancel: CancellationToken,
    concurrency: usize,
    next_to_fetch: usize,
    next_to_emit: usize,
    in_flight: JoinSet<(usize, AppResult<Vec<Bytes>>)>,
    // completed out of order, waiting for their turn
    buffered: BTreeMap<usize, Vec<Bytes>>,
    // contiguous prefix already released for emission
    ready: VecDeque<Bytes>,
    finished: bool,
}

impl PrefetchScheduler {
    fn schedule(&mut self) {
        while self.in_flight.len() < self.concurrency && self.next_to_fetch < self.segments.len() {
            let index = self.next_to_fetch;
            self.next_to_fetch += 1;

            let http = self.http.clone();
            let url = self.segments[index].clone();
            let headers = self.headers.clone();
            self.in_flight
                .spawn(async move { (index, fetch_segment(http, url, headers).await) });
        }
    }

    fn flush(&mut self) {
        while let Some(chunks) = self.buffered.remove(&self.next_to_emit) {
            self.ready.extend(chunks);
            self.next_to_emit += 1;
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.in_flight.abort_all();
        self.buffered.clear();
        self.ready.clear();
        self.cancel.cancel();
        debug!(
            "prefetch closed after {}/{} segments",
            self.next_to_emit,
            self.segments.len()
        );
    }

    /// files a finished fetch away, a failed one ends the whole pipeline
    fn settle(
        &mut self,
        joined: Result<(usize, AppResult<Vec<Bytes>>), JoinError>,
    ) -> AppResult<()> {
        match joined {
            Ok((index, Ok(chunks))) => {
                self.buffered.insert(index, chunks);
                self.flush();
                Ok(())
            }
            Ok((index, Err(e))) => {
                error!("segment {} ({}) failed: {}", index, self.segments[index], e);
                Err(e)
            }
            Err(e) => {
                error!("segment task died: {}", e);
                Err(Error::InternalServerErrorWithContext(format!(
                    "segment task died: {}",
                    e
                )))
            }
        }
    }

    async fn next_chunk(&mut self) -> Option<AppResult<Bytes>> {
        loop {
            if self.finished {
                return None;
            }
            if self.cancel.is_cancelled() {
                warn!("client went away, dropping prefetch");
                self.finish();
                return None;
            }

            // a failure that landed while the client was reading buffered bytes has to win over them
            while let Some(joined) = self.in_flight.try_join_next() {
                if let Err(e) = self.settle(joined) {
                    self.finish();
                    return Some(Err(e));
                }
            }
            self.schedule();

            if let Some(chunk) = self.ready.pop_front() {
                return Some(Ok(chunk));
            }
            if self.next_to_emit >= self.segments.len() {
                self.finish();
                return None;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!("client went away, dropping prefetch");
                    self.finish();
                    return None;
                }
                joined = self.in_flight.join_next() => match joined {
                    Some(joined) => {
                        if let Err(e) = self.settle(joined) {
                            self.finish();
                            return Some(Err(e));
                        }
                    }
                    None => {
                        // schedule() always leaves something in flight while segments remain
                        self.finish();
                        return None;
                    }
                },
            }
        }
    }
}

impl Drop for PrefetchScheduler {
    fn drop(&mut self) {
        self.finish();
    }
}

struct SequentialRelay {
    http: reqwest::Client,
    segments: Vec<Url>,
    headers: UpstreamHeaders,
    cancel: CancellationToken,
    next: usize,
    current: Option<BodyStream>,
    finished: bool,
}

impl SequentialRelay {
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.current = None;
        self.cancel.cancel();
        debug!(
            "sequential relay closed after {}/{} segments",
            self.next,
            self.segments.len()
        );
    }

    async fn next_chunk(&mut self) -> Option<AppResult<Bytes>> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(body) = self.current.as_mut() {
                let chunk = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        warn!("client went away, dropping relay");
                        self.finish();
                        return None;
                    }
                    chunk = body.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => return Some(Ok(bytes)),
                    Some(Err(e)) => {
                        error!("segment body failed: {}", e);
                        self.finish();
                        return Some(Err(e.into()));
                    }
                    None => {
                        self.current = None;
                        continue;
                    }
                }
            }

            if self.next >= self.segments.len() {
                self.finish();
                return None;
            }

            let url = self.segments[self.next].clone();
            self.next += 1;

            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!("client went away, dropping relay");
                    self.finish();
                    return None;
                }
                opened = open_segment(&self.http, &url, &self.headers) => opened,
            };
            match opened {
                Ok(response) => {
                    debug!("streaming segment {}", url);
                    self.current = Some(Box::pin(response.bytes_stream()));
                }
                Err(e) => {
                    error!("segment {} failed: {}", url, e);
                    self.finish();
                    return Some(Err(e));
                }
            }
        }
    }
}

impl Drop for SequentialRelay {
    fn drop(&mut self) {
        self.finish();
    }
}
