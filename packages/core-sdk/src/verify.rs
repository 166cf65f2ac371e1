use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::error::GatewayError;
use crate::models::{Track, VerificationOutcome};
use crate::music::ResolvedUrl;

/**
 * \brief 单曲可播放性探测。
 */
#[async_trait]
pub trait TrackProber: Send + Sync {
    async fn probe(&self, track: &Track) -> Result<ResolvedUrl, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub target_count: usize,
    pub batch_size: usize,
    pub per_probe_timeout: Duration,
    /// Upper bound on tracks examined in one call.
    pub max_scan: usize,
}

/**
 * \brief 分批并发探测候选曲目，返回至多 `target_count` 首可播放曲目。
 * \details 批内并发、批间串行；累计达到目标后不再发起新批次。
 *          结果保持输入顺序，探测超时或失败的曲目直接丢弃。
 */
pub async fn verify(
    candidates: Vec<Track>,
    options: &VerifyOptions,
    prober: &dyn TrackProber,
) -> Vec<Track> {
    let target = options.target_count;
    let batch_size = options.batch_size.max(1);
    let mut playable = Vec::with_capacity(target);
    if target == 0 {
        return playable;
    }

    let scan: Vec<Track> = candidates.into_iter().take(options.max_scan).collect();
    let mut probed = 0usize;
    for batch in scan.chunks(batch_size) {
        if playable.len() >= target {
            break;
        }
        probed += batch.len();
        let outcomes = join_all(batch.iter().map(|track| async move {
            match tokio::time::timeout(options.per_probe_timeout, prober.probe(track)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout(
                    options.per_probe_timeout.as_millis() as u64
                )),
            }
        }))
        .await;

        playable.extend(
            batch
                .iter()
                .zip(outcomes)
                .map(|(track, outcome)| judge(track, outcome))
                .filter(|o| o.playable)
                .map(|o| o.track),
        );
    }
    playable.truncate(target);

    tracing::info!(
        target: "murmur.verify",
        scanned = scan.len(),
        probed,
        playable = playable.len(),
        "verification finished"
    );
    playable
}

fn judge(track: &Track, outcome: Result<ResolvedUrl, GatewayError>) -> VerificationOutcome {
    let mut track = track.clone();
    match outcome {
        Ok(resolved) => {
            track.candidate_url = Some(resolved.url);
            track.url_expires_at = Some(resolved.expires_at);
            VerificationOutcome {
                track,
                playable: true,
            }
        }
        Err(e) => {
            tracing::debug!(target: "murmur.verify", track_id = %track.id, "probe rejected: {e}");
            VerificationOutcome {
                track,
                playable: false,
            }
        }
    }
}
