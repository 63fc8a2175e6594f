//! Streaming transport
//!
//! A [`StreamSession`] wraps one token stream from the peer that accepted a
//! job. A pump task per session reads frames off the network, reorders them
//! by index, drops duplicates and anything below the session's starting
//! index, and hands tokens to the consumer strictly in order.
//!
//! ```text
//! active --pause--> paused --resume--> active
//!    |                 |
//!    +--close/end------+--> closed
//!    +--fault----------+--> error
//! ```
//!
//! A session that ended in `error` can be resumed: the new session asks the
//! peer for `last delivered index + 1` onwards. Finished sessions archive
//! their transcript in the background.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use infermesh_core::{
    now_millis, FrameKind, PeerRecord, StreamMessage, StreamOpen, StreamStatus, StreamSummary,
    StreamingSettings, TokenFrame,
};
use infermesh_network::PeerNetwork;

use crate::{ClientError, ConversationArchive, Result, Transcript};

/// Throughput snapshot of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetrics {
    pub tokens_received: u64,
    pub bytes_received: u64,
    pub tokens_per_second: f64,
    pub avg_inter_token_ms: f64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Token(TokenFrame),
    Status(StreamStatus),
    Metrics(StreamMetrics),
    Error(String),
}

#[derive(Debug)]
enum Control {
    /// Re-check the delivery state
    Wake,
    Close,
}

/// How the pump loop ended
enum Ending {
    Closed(Option<StreamSummary>),
    Error(String),
}

#[derive(Default)]
struct SessionState {
    last_index: Option<u64>,
    tokens_received: u64,
    bytes_received: u64,
    last_token_at: Option<Instant>,
    inter_token_total: Duration,
    transcript: Vec<String>,
    error: Option<String>,
    summary: Option<StreamSummary>,
    finished: Option<Instant>,
    finished_at: Option<u64>,
}

pub struct StreamSession {
    id: String,
    job_id: String,
    peer: PeerRecord,
    resume_from: u64,
    prompt: Option<String>,
    started_at: u64,
    started: Instant,
    status: watch::Sender<StreamStatus>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    control: mpsc::UnboundedSender<Control>,
    tokens: tokio::sync::Mutex<mpsc::Receiver<TokenFrame>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn peer(&self) -> &PeerRecord {
        &self.peer
    }

    /// First index this session accepts
    pub fn resume_from(&self) -> u64 {
        self.resume_from
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn status(&self) -> StreamStatus {
        *self.status.borrow()
    }

    /// Index of the last token handed to the consumer
    pub fn last_index(&self) -> Option<u64> {
        self.state.lock().last_index
    }

    /// Index a resumed session should start from
    pub fn next_index(&self) -> u64 {
        self.last_index().map_or(self.resume_from, |i| i + 1)
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// End-of-stream summary sent by the peer, if it got that far
    pub fn summary(&self) -> Option<StreamSummary> {
        self.state.lock().summary.clone()
    }

    /// Session events from now on. Events already emitted are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> StreamMetrics {
        let state = self.state.lock();
        let elapsed = state
            .finished
            .map_or_else(|| self.started.elapsed(), |at| at.duration_since(self.started));
        let secs = elapsed.as_secs_f64();
        let tokens = state.tokens_received;
        StreamMetrics {
            tokens_received: tokens,
            bytes_received: state.bytes_received,
            tokens_per_second: if secs > 0.0 { tokens as f64 / secs } else { 0.0 },
            avg_inter_token_ms: if tokens > 1 {
                state.inter_token_total.as_secs_f64() * 1000.0 / (tokens - 1) as f64
            } else {
                0.0
            },
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Next token in index order; `None` once the session has finished and
    /// every delivered token was read
    pub async fn next_token(&self) -> Option<TokenFrame> {
        self.tokens.lock().await.recv().await
    }

    /// Wait until the session is closed or failed
    pub async fn wait_for_end(&self) -> StreamStatus {
        let mut rx = self.status.subscribe();
        let status = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }

    /// Stop delivering tokens. Frames keep arriving and are held.
    pub fn pause(&self) -> Result<()> {
        self.transition(StreamStatus::Active, StreamStatus::Paused)
    }

    /// Deliver again after a pause, starting with any held tokens
    pub fn resume(&self) -> Result<()> {
        self.transition(StreamStatus::Paused, StreamStatus::Active)
    }

    fn transition(&self, from: StreamStatus, to: StreamStatus) -> Result<()> {
        let changed = self.status.send_if_modified(|status| {
            if *status == from {
                *status = to;
                true
            } else {
                false
            }
        });
        if !changed {
            return Err(ClientError::InvalidState(format!(
                "session {} is {:?}, not {:?}",
                self.id,
                self.status(),
                from
            )));
        }
        debug!("Session {} {:?} -> {:?}", self.id, from, to);
        let _ = self.events.send(SessionEvent::Status(to));
        let _ = self.control.send(Control::Wake);
        Ok(())
    }

    /// Close the session and wait for its pump to stop
    pub async fn close(&self) -> StreamStatus {
        let _ = self.control.send(Control::Close);
        let pump = self.pump.lock().take();
        match pump {
            Some(handle) => {
                let _ = handle.await;
                self.status()
            }
            None => self.wait_for_end().await,
        }
    }

    fn record_delivery(&self, frame: &TokenFrame) {
        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some(previous) = state.last_token_at {
            state.inter_token_total += now.duration_since(previous);
        }
        state.last_token_at = Some(now);
        state.last_index = Some(frame.index);
        state.tokens_received += 1;
        state.bytes_received += frame.content.len() as u64;
        if frame.kind == FrameKind::Token {
            state.transcript.push(frame.content.clone());
        }
    }

    fn transcript(&self) -> Transcript {
        let state = self.state.lock();
        Transcript {
            session_id: self.id.clone(),
            job_id: self.job_id.clone(),
            peer_id: self.peer.peer_id.clone(),
            prompt: self.prompt.clone(),
            tokens: state.transcript.clone(),
            first_index: self.resume_from,
            final_status: self.status(),
            started_at: self.started_at,
            finished_at: state.finished_at.unwrap_or_else(now_millis),
        }
    }
}

/// What the pump needs besides the session itself
struct PumpContext {
    reorder_window: usize,
    metrics_interval: Duration,
    cancel: CancellationToken,
    archive: Option<Arc<dyn ConversationArchive>>,
    tasks: TaskTracker,
    sessions: Arc<DashMap<String, Arc<StreamSession>>>,
}

async fn run_pump(
    session: Arc<StreamSession>,
    mut frames: mpsc::Receiver<StreamMessage>,
    mut control: mpsc::UnboundedReceiver<Control>,
    tokens: mpsc::Sender<TokenFrame>,
    ctx: PumpContext,
) {
    let mut next_index = session.resume_from;
    let mut reorder: BTreeMap<u64, TokenFrame> = BTreeMap::new();
    let mut ready: VecDeque<TokenFrame> = VecDeque::new();
    let mut ending: Option<Ending> = None;
    // interval_at panics on a zero period
    let period = ctx.metrics_interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    let gap = |expected: u64| {
        ClientError::StreamGap {
            job_id: session.job_id.clone(),
            expected,
        }
        .to_string()
    };

    let ending = loop {
        if ending.is_some() && ready.is_empty() {
            if let Some(ending) = ending.take() {
                break ending;
            }
        }
        let deliverable = !ready.is_empty() && session.status() == StreamStatus::Active;

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break Ending::Closed(None),
            ctrl = control.recv() => match ctrl {
                Some(Control::Wake) => {}
                Some(Control::Close) | None => break ending.take().unwrap_or(Ending::Closed(None)),
            },
            permit = tokens.reserve(), if deliverable => {
                let Ok(permit) = permit else {
                    break Ending::Closed(None);
                };
                if session.status() == StreamStatus::Active {
                    if let Some(frame) = ready.pop_front() {
                        session.record_delivery(&frame);
                        let _ = session.events.send(SessionEvent::Token(frame.clone()));
                        permit.send(frame);
                    }
                }
            }
            message = frames.recv(), if ending.is_none() => match message {
                Some(StreamMessage::Token(frame)) => {
                    if frame.index < next_index || reorder.contains_key(&frame.index) {
                        warn!(
                            "Dropping duplicate token {} for job {} (next {})",
                            frame.index, session.job_id, next_index
                        );
                        continue;
                    }
                    reorder.insert(frame.index, frame);
                    while let Some(frame) = reorder.remove(&next_index) {
                        ready.push_back(frame);
                        next_index += 1;
                    }
                    if reorder.len() > ctx.reorder_window {
                        ending = Some(Ending::Error(gap(next_index)));
                    }
                }
                Some(StreamMessage::End(summary)) => {
                    ending = Some(if reorder.is_empty() {
                        Ending::Closed(Some(summary))
                    } else {
                        Ending::Error(gap(next_index))
                    });
                }
                None => {
                    ending = Some(Ending::Error(if reorder.is_empty() {
                        "connection dropped before end of stream".to_string()
                    } else {
                        gap(next_index)
                    }));
                }
            },
            _ = ticker.tick() => {
                let _ = session.events.send(SessionEvent::Metrics(session.metrics()));
            }
        }
    };

    finish(&session, ending, &ctx);
}

fn finish(session: &Arc<StreamSession>, ending: Ending, ctx: &PumpContext) {
    let status = match ending {
        Ending::Closed(summary) => {
            let mut state = session.state.lock();
            state.summary = summary;
            StreamStatus::Closed
        }
        Ending::Error(message) => {
            warn!("Stream session {} for job {} failed: {}", session.id, session.job_id, message);
            session.state.lock().error = Some(message.clone());
            let _ = session.events.send(SessionEvent::Error(message));
            StreamStatus::Error
        }
    };
    {
        let mut state = session.state.lock();
        state.finished = Some(Instant::now());
        state.finished_at = Some(now_millis());
    }
    session.status.send_replace(status);
    let _ = session.events.send(SessionEvent::Status(status));
    let _ = session.events.send(SessionEvent::Metrics(session.metrics()));
    ctx.sessions.remove(&session.id);

    info!(
        "Stream session {} for job {} {:?} after {} token(s)",
        session.id,
        session.job_id,
        status,
        session.state.lock().tokens_received
    );

    if let Some(archive) = ctx.archive.clone() {
        let transcript = session.transcript();
        ctx.tasks.spawn(async move {
            let session_id = transcript.session_id.clone();
            if let Err(e) = archive.put(&session_id, transcript).await {
                warn!("Failed to archive session {}: {}", session_id, e);
            }
        });
    }
}

/// Owns every open stream session
pub struct StreamManager {
    network: Arc<dyn PeerNetwork>,
    settings: StreamingSettings,
    archive: Option<Arc<dyn ConversationArchive>>,
    sessions: Arc<DashMap<String, Arc<StreamSession>>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl StreamManager {
    pub fn new(
        network: Arc<dyn PeerNetwork>,
        settings: StreamingSettings,
        archive: Option<Arc<dyn ConversationArchive>>,
    ) -> Self {
        Self {
            network,
            settings,
            archive,
            sessions: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Open a token stream for an accepted job, from the first token
    pub async fn open(
        &self,
        peer: &PeerRecord,
        job_id: &str,
        prompt: Option<String>,
    ) -> Result<Arc<StreamSession>> {
        self.open_at(peer, job_id, prompt, 0).await
    }

    /// Reopen the stream of a failed session after its last delivered token
    pub async fn resume(&self, previous: &StreamSession) -> Result<Arc<StreamSession>> {
        if previous.status() != StreamStatus::Error {
            return Err(ClientError::InvalidState(format!(
                "session {} is {:?}; only failed sessions are resumed",
                previous.id,
                previous.status()
            )));
        }
        let resume_from = previous.next_index();
        info!(
            "Resuming job {} from index {} (session {})",
            previous.job_id, resume_from, previous.id
        );
        self.open_at(&previous.peer, &previous.job_id, previous.prompt.clone(), resume_from)
            .await
    }

    async fn open_at(
        &self,
        peer: &PeerRecord,
        job_id: &str,
        prompt: Option<String>,
        resume_from: u64,
    ) -> Result<Arc<StreamSession>> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::InvalidState("stream manager is shut down".to_string()));
        }

        let frames = self
            .network
            .open_token_stream(
                peer,
                StreamOpen {
                    job_id: job_id.to_string(),
                    resume_from,
                },
            )
            .await?;

        let capacity = self.settings.channel_capacity.max(1);
        let (status, _) = watch::channel(StreamStatus::Active);
        let (events, _) = broadcast::channel(capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (tokens_tx, tokens_rx) = mpsc::channel(capacity);

        let session = Arc::new(StreamSession {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            peer: peer.clone(),
            resume_from,
            prompt,
            started_at: now_millis(),
            started: Instant::now(),
            status,
            state: Mutex::new(SessionState::default()),
            events,
            control: control_tx,
            tokens: tokio::sync::Mutex::new(tokens_rx),
            pump: Mutex::new(None),
        });
        self.sessions.insert(session.id.clone(), session.clone());

        let ctx = PumpContext {
            reorder_window: self.settings.reorder_window,
            metrics_interval: self.settings.metrics_interval(),
            cancel: self.cancel.child_token(),
            archive: self.archive.clone(),
            tasks: self.tasks.clone(),
            sessions: self.sessions.clone(),
        };
        let handle = self
            .tasks
            .spawn(run_pump(session.clone(), frames, control_rx, tokens_tx, ctx));
        *session.pump.lock() = Some(handle);

        debug!(
            "Opened stream session {} for job {} with {} from {}",
            session.id, job_id, peer.peer_id, resume_from
        );
        Ok(session)
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<StreamSession>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Sessions that have not finished yet
    pub fn active_sessions(&self) -> Vec<Arc<StreamSession>> {
        self.sessions.iter().map(|s| s.clone()).collect()
    }

    /// Close every open session, returning how many were closed
    pub async fn close_all(&self) -> usize {
        let sessions = self.active_sessions();
        for session in &sessions {
            session.close().await;
        }
        sessions.len()
    }

    /// Close all sessions and wait for pending archive writes
    pub async fn shutdown(&self) {
        let closed = self.close_all().await;
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        debug!("Stream manager shut down ({} session(s) closed)", closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryArchive;
    use infermesh_core::Capabilities;
    use infermesh_network::{CapabilityRecord, MemoryNetwork, MemoryPeer};

    fn caps() -> Capabilities {
        Capabilities {
            workloads: ["llama-3-8b".to_string()].into_iter().collect(),
            max_units: 4096,
            price_per_unit: 1,
            compute_class: Default::default(),
            max_concurrent: 2,
        }
    }

    fn tokens(indices: &[u64]) -> Vec<StreamMessage> {
        indices
            .iter()
            .map(|i| StreamMessage::Token(TokenFrame::token(*i, format!("t{i} "))))
            .collect()
    }

    fn end(total: u64) -> StreamMessage {
        StreamMessage::End(StreamSummary {
            total_tokens: total,
            duration_ms: 10,
            final_status: StreamStatus::Closed,
        })
    }

    fn setup(peer: MemoryPeer) -> (Arc<MemoryNetwork>, PeerRecord, Arc<MemoryArchive>, StreamManager) {
        let network = Arc::new(MemoryNetwork::new(Duration::from_secs(5)));
        let record = CapabilityRecord::from_bytes(&peer.record)
            .unwrap()
            .into_peer_record(50, now_millis());
        network.add_peer(peer);
        let archive = Arc::new(MemoryArchive::new());
        let manager = StreamManager::new(
            network.clone(),
            StreamingSettings::default(),
            Some(archive.clone()),
        );
        (network, record, archive, manager)
    }

    async fn drain(session: &StreamSession) -> Vec<u64> {
        let mut seen = Vec::new();
        while let Some(frame) = session.next_token().await {
            seen.push(frame.index);
        }
        seen
    }

    #[tokio::test]
    async fn test_in_order_stream_closes() {
        let mut script = tokens(&[0, 1, 2]);
        script.push(end(3));
        let (_, peer, archive, manager) = setup(MemoryPeer::provider(caps()).stream_script(script));

        let session = manager.open(&peer, "job-1", Some("hi".to_string())).await.unwrap();
        assert_eq!(drain(&session).await, vec![0, 1, 2]);
        assert_eq!(session.wait_for_end().await, StreamStatus::Closed);
        assert_eq!(session.summary().unwrap().total_tokens, 3);
        assert_eq!(session.last_index(), Some(2));
        assert_eq!(session.metrics().tokens_received, 3);

        manager.shutdown().await;
        let transcript = archive.get(session.id()).await.unwrap().unwrap();
        assert_eq!(transcript.text(), "t0 t1 t2 ");
        assert_eq!(transcript.final_status, StreamStatus::Closed);
    }

    #[tokio::test]
    async fn test_reorders_and_drops_duplicates() {
        let mut script = tokens(&[1, 0, 0, 3, 2, 1, 4]);
        script.push(end(5));
        let (_, peer, _, manager) = setup(MemoryPeer::provider(caps()).stream_script(script));

        let session = manager.open(&peer, "job-1", None).await.unwrap();
        assert_eq!(drain(&session).await, vec![0, 1, 2, 3, 4]);
        assert_eq!(session.status(), StreamStatus::Closed);
    }

    #[tokio::test]
    async fn test_gap_at_end_is_an_error() {
        let mut script = tokens(&[0, 1, 3]);
        script.push(end(3));
        let (_, peer, _, manager) = setup(MemoryPeer::provider(caps()).stream_script(script));

        let session = manager.open(&peer, "job-1", None).await.unwrap();
        assert_eq!(drain(&session).await, vec![0, 1]);
        assert_eq!(session.wait_for_end().await, StreamStatus::Error);
        assert!(session.error().unwrap().contains("expected index 2"));
        assert_eq!(session.next_index(), 2);
    }

    #[tokio::test]
    async fn test_gap_beyond_reorder_window() {
        let script = tokens(&[0, 2, 3, 4]);
        let network = Arc::new(MemoryNetwork::new(Duration::from_secs(5)));
        let peer = MemoryPeer::provider(caps()).stream_script(script);
        let record = CapabilityRecord::from_bytes(&peer.record)
            .unwrap()
            .into_peer_record(50, now_millis());
        network.add_peer(peer);
        let settings = StreamingSettings {
            reorder_window: 2,
            ..Default::default()
        };
        let manager = StreamManager::new(network, settings, None);

        let session = manager.open(&record, "job-1", None).await.unwrap();
        assert_eq!(drain(&session).await, vec![0]);
        assert_eq!(session.status(), StreamStatus::Error);
    }

    #[tokio::test]
    async fn test_dropped_connection_then_resume_without_duplicates() {
        let mut script = tokens(&[0, 1, 2, 3, 4]);
        script.push(end(5));
        let (network, peer, _, manager) = setup(
            MemoryPeer::provider(caps())
                .stream_script(script)
                .cut_first_stream_after(3),
        );

        let first = manager.open(&peer, "job-1", None).await.unwrap();
        let mut seen = drain(&first).await;
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(first.status(), StreamStatus::Error);

        let second = manager.resume(&first).await.unwrap();
        assert_eq!(second.resume_from(), 3);
        seen.extend(drain(&second).await);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(second.status(), StreamStatus::Closed);
        assert_eq!(network.stream_opens(&peer.peer_id), 2);
    }

    #[tokio::test]
    async fn test_only_failed_sessions_resume() {
        let mut script = tokens(&[0]);
        script.push(end(1));
        let (_, peer, _, manager) = setup(MemoryPeer::provider(caps()).stream_script(script));
        let session = manager.open(&peer, "job-1", None).await.unwrap();
        session.wait_for_end().await;
        assert!(matches!(
            manager.resume(&session).await,
            Err(ClientError::InvalidState(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_tokens() {
        let mut script = tokens(&[0, 1, 2, 3]);
        script.push(end(4));
        let (_, peer, _, manager) = setup(
            MemoryPeer::provider(caps())
                .stream_script(script)
                .token_delay(Duration::from_millis(100)),
        );

        let session = manager.open(&peer, "job-1", None).await.unwrap();
        assert_eq!(session.next_token().await.unwrap().index, 0);
        session.pause().unwrap();
        assert_eq!(session.status(), StreamStatus::Paused);
        assert!(session.pause().is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(session.last_index(), Some(0));
        assert_eq!(session.status(), StreamStatus::Paused);

        session.resume().unwrap();
        let rest: Vec<u64> = drain(&session).await;
        assert_eq!(rest, vec![1, 2, 3]);
        assert_eq!(session.status(), StreamStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_mid_stream() {
        let script = tokens(&(0..100).collect::<Vec<_>>());
        let (_, peer, _, manager) = setup(
            MemoryPeer::provider(caps())
                .stream_script(script)
                .token_delay(Duration::from_millis(50)),
        );

        let session = manager.open(&peer, "job-1", None).await.unwrap();
        let mut events = session.subscribe();
        session.next_token().await.unwrap();
        assert_eq!(session.close().await, StreamStatus::Closed);
        assert!(manager.active_sessions().is_empty());

        let mut saw_closed = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Status(StreamStatus::Closed) = event {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_emitted_periodically() {
        let script = tokens(&(0..50).collect::<Vec<_>>());
        let (_, peer, _, manager) = setup(
            MemoryPeer::provider(caps())
                .stream_script(script)
                .token_delay(Duration::from_millis(100)),
        );

        let session = manager.open(&peer, "job-1", None).await.unwrap();
        let mut events = session.subscribe();
        let metrics = loop {
            match events.recv().await.unwrap() {
                SessionEvent::Metrics(m) => break m,
                _ => continue,
            }
        };
        assert!(metrics.elapsed_ms >= 1_000);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_sessions_not_errors() {
        let script = tokens(&(0..100).collect::<Vec<_>>());
        let (_, peer, _, manager) = setup(
            MemoryPeer::provider(caps())
                .stream_script(script)
                .token_delay(Duration::from_millis(50)),
        );
        let a = manager.open(&peer, "job-a", None).await.unwrap();
        let b = manager.open(&peer, "job-b", None).await.unwrap();

        manager.shutdown().await;
        assert_eq!(a.status(), StreamStatus::Closed);
        assert_eq!(b.status(), StreamStatus::Closed);
        assert!(manager.open(&peer, "job-c", None).await.is_err());
    }

    #[tokio::test]
    async fn test_archive_failure_does_not_fail_stream() {
        let mut script = tokens(&[0]);
        script.push(end(1));
        let (_, peer, archive, manager) = setup(MemoryPeer::provider(caps()).stream_script(script));
        archive.set_failing(true);

        let session = manager.open(&peer, "job-1", None).await.unwrap();
        assert_eq!(drain(&session).await, vec![0]);
        assert_eq!(session.wait_for_end().await, StreamStatus::Closed);
        manager.shutdown().await;
        assert!(archive.is_empty());
    }
}
