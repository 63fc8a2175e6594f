//! Token source for `infermesh serve`: replays an accepted job's prompt
//! back to the requester, one word per frame, paced by `ms_per_unit`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use infermesh_core::TokenFrame;
use infermesh_network::{NetworkError, OfferEvaluator, TokenSource};

pub struct EchoSource {
    evaluator: Arc<OfferEvaluator>,
    pace: Duration,
}

impl EchoSource {
    pub fn new(evaluator: Arc<OfferEvaluator>) -> Self {
        let pace = Duration::from_millis(evaluator.settings().ms_per_unit);
        Self { evaluator, pace }
    }
}

/// Split text into word tokens, keeping trailing whitespace on each word
fn tokenize(text: &str, limit: u64) -> Vec<String> {
    text.split_inclusive(char::is_whitespace)
        .filter(|t| !t.trim().is_empty())
        .take(usize::try_from(limit).unwrap_or(usize::MAX))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl TokenSource for EchoSource {
    async fn open(
        &self,
        job_id: &str,
        resume_from: u64,
    ) -> infermesh_network::Result<mpsc::Receiver<TokenFrame>> {
        let offer = self
            .evaluator
            .accepted_offer(job_id)
            .ok_or_else(|| NetworkError::RequestFailed(format!("no accepted job {}", job_id)))?;
        let tokens = tokenize(&offer.payload, offer.resource_limit);

        let (tx, rx) = mpsc::channel(32);
        let evaluator = self.evaluator.clone();
        let pace = self.pace;
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            for (index, content) in tokens.into_iter().enumerate().skip(resume_from as usize) {
                if !pace.is_zero() {
                    tokio::time::sleep(pace).await;
                }
                if tx.send(TokenFrame::token(index as u64, content)).await.is_err() {
                    debug!("Requester left job {} at index {}", job_id, index);
                    return;
                }
            }
            evaluator.release(&job_id);
        });
        Ok(rx)
    }
}
